//! Configuration module for pg-ingest.
//!
//! Settings are loaded from environment variables following the 12-factor
//! methodology. The database settings mirror the `replication.db.*` keys of
//! the deployment environment; tuning knobs have defaults suitable for a
//! single long-running ingester.
//!
//! # Example
//!
//! ```rust,no_run
//! use pg_ingest::Config;
//!
//! let config = Config::from_env().expect("Failed to load config");
//! println!("Replicating slot {} via publication {}",
//!          config.db.slot, config.db.publication);
//! ```

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main configuration structure.
///
/// - `db` - PostgreSQL connection, slot, and publication settings
/// - `replication` - read-loop and bus tuning parameters
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub db: DbConfig,
    pub replication: ReplicationConfig,
}

/// PostgreSQL connection and replication-slot settings.
///
/// The slot and publication must already exist on the server; the ingester
/// attaches to them rather than creating them.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DbConfig {
    /// Connection URL, e.g. `postgres://host:5432/mydb`. Credentials given
    /// separately override any embedded in the URL.
    pub url: String,
    pub username: String,
    pub password: String,
    pub slot: String,
    pub publication: String,
    pub connect_timeout_secs: u64,
}

/// Read-loop and delivery tuning.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReplicationConfig {
    /// Deadline on each stream read; expiry yields control to check for
    /// shutdown before trying again.
    pub poll_interval_ms: u64,
    /// Keepalive hint advertised to the server.
    pub status_interval_secs: u64,
    /// Bound of each subscriber's channel. A full channel backpressures the
    /// decode loop.
    pub bus_capacity: usize,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// Required:
    /// - `REPLICATION_DB_URL` - PostgreSQL connection URL
    /// - `REPLICATION_DB_USERNAME` - replication user
    /// - `REPLICATION_DB_PASSWORD` - replication password
    /// - `REPLICATION_DB_SLOT` - existing logical replication slot
    /// - `REPLICATION_DB_PUBLICATION` - existing publication
    ///
    /// Optional variables have defaults; see the struct fields.
    ///
    /// # Errors
    ///
    /// Returns `Err` if a required variable is missing or a value cannot be
    /// parsed.
    pub fn from_env() -> Result<Self> {
        let db = DbConfig {
            url: require("REPLICATION_DB_URL")?,
            username: require("REPLICATION_DB_USERNAME")?,
            password: require("REPLICATION_DB_PASSWORD")?,
            slot: require("REPLICATION_DB_SLOT")?,
            publication: require("REPLICATION_DB_PUBLICATION")?,
            connect_timeout_secs: env::var("REPLICATION_CONNECT_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse::<u64>()
                .unwrap_or(30),
        };

        let replication = ReplicationConfig {
            poll_interval_ms: env::var("REPLICATION_POLL_INTERVAL_MS")
                .unwrap_or_else(|_| "10".to_string())
                .parse::<u64>()
                .unwrap_or(10),
            status_interval_secs: env::var("REPLICATION_STATUS_INTERVAL_SECS")
                .unwrap_or_else(|_| "120".to_string())
                .parse::<u64>()
                .unwrap_or(120),
            bus_capacity: env::var("REPLICATION_BUS_CAPACITY")
                .unwrap_or_else(|_| "1024".to_string())
                .parse::<usize>()
                .unwrap_or(1024),
        };

        Ok(Config { db, replication })
    }
}

impl DbConfig {
    /// Builds the driver configuration for a replication-mode connection.
    pub fn pg_config(&self) -> Result<tokio_postgres::Config> {
        let mut config = self
            .url
            .parse::<tokio_postgres::Config>()
            .map_err(|e| Error::Config(format!("invalid REPLICATION_DB_URL: {e}")))?;
        config.user(&self.username);
        config.password(&self.password);
        config.connect_timeout(Duration::from_secs(self.connect_timeout_secs));
        Ok(config)
    }
}

impl ReplicationConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn require(name: &str) -> Result<String> {
    env::var(name).map_err(|_| Error::Config(format!("{name} is required")))
}
