//! # pg-ingest
//!
//! A PostgreSQL change-data-capture ingester that attaches to a logical
//! replication slot, decodes the pgoutput stream, and delivers each row
//! change to in-process subscribers as a self-describing JSON event.
//!
//! ## Overview
//!
//! `pg-ingest` connects to PostgreSQL as a logical replication client bound
//! to a pre-existing slot and publication. It provides:
//!
//! - **Continuous operation** resuming from the slot's confirmed position
//!   after every reconnect
//! - **Progress feedback** (applied/flushed LSN) so the server can recycle
//!   WAL segments
//! - **Automatic stream rebuild** after sustained decode or I/O failures
//! - **In-order delivery** to any number of in-process subscribers, with
//!   backpressure flowing from slow subscribers to the server
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pg_ingest::{Config, EventBus, Ingester, ReplicationConnection, Result};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::from_env()?;
//!
//!     let mut bus = EventBus::new(config.replication.bus_capacity);
//!     let mut events = bus.subscribe();
//!     tokio::spawn(async move {
//!         while let Some(event) = events.recv().await {
//!             println!("{event}");
//!         }
//!     });
//!
//!     let source = ReplicationConnection::new(config.clone());
//!     let ingester = Ingester::new(source, bus, &config.replication);
//!     ingester.run(CancellationToken::new()).await
//! }
//! ```
//!
//! ## Configuration
//!
//! Configuration is loaded from environment variables. Required:
//!
//! - `REPLICATION_DB_URL` - PostgreSQL connection URL
//! - `REPLICATION_DB_USERNAME` - replication user
//! - `REPLICATION_DB_PASSWORD` - replication password
//! - `REPLICATION_DB_SLOT` - name of an existing logical replication slot
//! - `REPLICATION_DB_PUBLICATION` - name of an existing publication
//!
//! See [`Config`] for the optional tuning knobs.
//!
//! ## Event Format
//!
//! Each event is one JSON object. Column values are the server's text
//! representations; nulls are JSON null.
//!
//! ```json
//! {"type":"insert","table":"users","data":{"id":"7","name":"Alice"}}
//! {"type":"update","table":"users","old":null,"new":{"id":"7","name":"Bob"}}
//! {"type":"delete","table":"users","old":{"id":"7","name":"Bob"}}
//! {"type":"commit","lsn":23871064,"timestamp":767562822000000}
//! ```
//!
//! ## PostgreSQL Setup
//!
//! 1. Enable logical replication in `postgresql.conf`:
//!    ```ini
//!    wal_level = logical
//!    ```
//!
//! 2. Create a publication and a slot:
//!    ```sql
//!    CREATE PUBLICATION my_publication FOR ALL TABLES;
//!    SELECT pg_create_logical_replication_slot('my_slot', 'pgoutput');
//!    ```
//!
//! ## Architecture
//!
//! - [`ingester`] - session manager: stream lifecycle, read loop, failure
//!   counting, rebuild-on-threshold
//! - [`postgres`] - replication connection, frame handling, and the pgoutput
//!   decoder with its relation cache
//! - [`bus`] - in-process publish/subscribe delivery
//! - [`config`] - configuration structures and parsing
//! - [`error`] - error types and handling

/// In-process event delivery
pub mod bus;

/// Configuration structures and environment variable parsing
pub mod config;

/// Error types and result handling
pub mod error;

/// Session manager driving the replication read loop
pub mod ingester;

/// PostgreSQL logical replication connection and protocol decoding
pub mod postgres;

pub use bus::EventBus;
pub use config::Config;
pub use error::{Error, Result};
pub use ingester::{Ingester, WalSource, WalStream};
pub use postgres::{DecodedEvent, ReplicationConnection};
