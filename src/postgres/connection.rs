use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use std::pin::Pin;
use std::time::Duration;
use tokio_postgres::config::ReplicationMode;
use tokio_postgres::{Client, CopyBothDuplex, NoTls};
use tracing::{error, info, trace, warn};

use crate::config::Config;
use crate::ingester::{WalSource, WalStream};
use crate::{Error, Result};

/// Microseconds between the Unix epoch and 2000-01-01 00:00:00 UTC, the
/// epoch PostgreSQL timestamps count from.
const PG_EPOCH_MICROS: i64 = 946_684_800_000_000;

/// Factory for logical replication streams against one configured database.
///
/// Each [`open_stream`](Self::open_stream) call dials a fresh replication-mode
/// connection and issues `START_REPLICATION` on the configured slot, resuming
/// from the slot's confirmed position.
pub struct ReplicationConnection {
    config: Config,
}

impl ReplicationConnection {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    async fn open_stream(&self) -> Result<ReplicationStream> {
        let db = &self.config.db;
        info!(slot = %db.slot, publication = %db.publication, "opening replication stream");

        let mut pg_config = db.pg_config()?;
        pg_config.replication_mode(ReplicationMode::Logical);

        let (client, connection) = pg_config.connect(NoTls).await?;
        let connection_task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("replication connection error: {e}");
            }
        });

        // LSN 0/0 tells the server to resume from the slot's
        // confirmed_flush_lsn.
        let query = format!(
            "START_REPLICATION SLOT {} LOGICAL 0/0 (proto_version '1', publication_names '{}')",
            db.slot, db.publication
        );
        let duplex = client.copy_both_simple::<Bytes>(&query).await?;

        info!("replication stream started");
        Ok(ReplicationStream {
            duplex: Box::pin(duplex),
            _client: client,
            connection_task,
            last_receive_lsn: 0,
        })
    }
}

impl WalSource for ReplicationConnection {
    type Stream = ReplicationStream;

    async fn open(&mut self) -> Result<ReplicationStream> {
        self.open_stream().await
    }
}

/// One live replication session: the CopyBoth duplex plus the highest LSN
/// observed on it.
///
/// The receive half carries two message kinds. XLogData (`w`) wraps a batch
/// of pgoutput bytes behind a 24-byte header; primary keepalives (`k`)
/// carry the server's WAL position and may demand an immediate reply, which
/// is answered inline before control returns to the caller.
pub struct ReplicationStream {
    duplex: Pin<Box<CopyBothDuplex<Bytes>>>,
    _client: Client,
    connection_task: tokio::task::JoinHandle<()>,
    last_receive_lsn: u64,
}

impl ReplicationStream {
    fn handle_frame(&mut self, mut frame: Bytes) -> Result<FrameAction> {
        if frame.is_empty() {
            return Err(Error::InvalidMessage {
                message: "empty replication frame".to_string(),
            });
        }

        let tag = frame.get_u8();
        match tag {
            b'w' => {
                if frame.remaining() < 24 {
                    return Err(Error::InvalidMessage {
                        message: "truncated XLogData header".to_string(),
                    });
                }
                let start_lsn = frame.get_u64();
                let end_lsn = frame.get_u64();
                let _send_time = frame.get_i64();

                self.observe_lsn(start_lsn);
                self.observe_lsn(end_lsn);
                trace!(start_lsn, end_lsn, len = frame.remaining(), "xlogdata frame");
                Ok(FrameAction::Deliver(frame))
            }
            b'k' => {
                if frame.remaining() < 17 {
                    return Err(Error::InvalidMessage {
                        message: "truncated keepalive message".to_string(),
                    });
                }
                let wal_end = frame.get_u64();
                let _send_time = frame.get_i64();
                let reply_requested = frame.get_u8() != 0;

                self.observe_lsn(wal_end);
                trace!(wal_end, reply_requested, "keepalive");
                Ok(FrameAction::Keepalive { reply_requested })
            }
            other => Err(Error::InvalidMessage {
                message: format!("unknown replication frame tag: 0x{other:02x}"),
            }),
        }
    }

    fn observe_lsn(&mut self, lsn: u64) {
        if lsn > self.last_receive_lsn {
            self.last_receive_lsn = lsn;
        }
    }

    async fn send_status(&mut self, lsn: u64) -> Result<()> {
        // Standby status update: write/flush/apply LSNs, then the client
        // clock in PostgreSQL epoch microseconds, then a no-reply byte.
        let mut payload = BytesMut::with_capacity(34);
        payload.put_u8(b'r');
        payload.put_u64(lsn);
        payload.put_u64(lsn);
        payload.put_u64(lsn);
        payload.put_i64(Utc::now().timestamp_micros() - PG_EPOCH_MICROS);
        payload.put_u8(0);

        self.duplex.send(payload.freeze()).await?;
        trace!(lsn, "status update sent");
        Ok(())
    }
}

enum FrameAction {
    Deliver(Bytes),
    Keepalive { reply_requested: bool },
}

impl WalStream for ReplicationStream {
    async fn next_frame(&mut self, deadline: Duration) -> Result<Option<Bytes>> {
        let frame = match tokio::time::timeout(deadline, self.duplex.next()).await {
            Err(_) => return Ok(None),
            Ok(None) => {
                return Err(Error::Connection(
                    "replication stream closed by server".to_string(),
                ))
            }
            Ok(Some(frame)) => frame?,
        };

        match self.handle_frame(frame)? {
            FrameAction::Deliver(payload) => Ok(Some(payload)),
            FrameAction::Keepalive { reply_requested } => {
                if reply_requested {
                    let lsn = self.last_receive_lsn;
                    self.send_status(lsn).await?;
                }
                Ok(None)
            }
        }
    }

    fn last_receive_lsn(&self) -> u64 {
        self.last_receive_lsn
    }

    async fn status_update(&mut self, lsn: u64) -> Result<()> {
        self.send_status(lsn).await
    }

    async fn close(mut self) -> Result<()> {
        if let Err(e) = self.duplex.close().await {
            warn!("error closing replication stream: {e}");
        }
        self.connection_task.abort();
        Ok(())
    }
}
