//! Session manager for the logical replication loop.
//!
//! One [`Ingester`] owns one replication session at a time. It drives the
//! read-dispatch-publish-feedback cycle on a single task, counts consecutive
//! failures, and rebuilds the stream (with a fresh relation cache) once the
//! failure threshold is crossed. Isolated decode errors from a partially
//! buffered frame are self-correcting on the next read; sustained errors mean
//! protocol desynchronization or a dead socket, and reconnecting is the only
//! safe recovery for those.

use bytes::{Buf, Bytes};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bus::EventBus;
use crate::config::ReplicationConfig;
use crate::postgres::PgOutputDecoder;
use crate::{Error, Result};

/// Consecutive iteration failures tolerated before the stream is rebuilt.
const MAX_CONSECUTIVE_ERRORS: u32 = 3;

/// A factory for replication streams. Opened anew on startup and after the
/// failure threshold tears the previous stream down.
#[allow(async_fn_in_trait)]
pub trait WalSource {
    type Stream: WalStream;

    async fn open(&mut self) -> Result<Self::Stream>;
}

/// One live replication stream.
#[allow(async_fn_in_trait)]
pub trait WalStream {
    /// Returns the next frame of pgoutput bytes, or `None` if the deadline
    /// expired with nothing to deliver.
    async fn next_frame(&mut self, deadline: Duration) -> Result<Option<Bytes>>;

    /// Highest LSN observed on this stream.
    fn last_receive_lsn(&self) -> u64;

    /// Acknowledges `lsn` as both applied and flushed, letting the server
    /// recycle WAL segments up to it.
    async fn status_update(&mut self, lsn: u64) -> Result<()>;

    async fn close(self) -> Result<()>;
}

pub struct Ingester<S: WalSource> {
    source: S,
    bus: EventBus,
    poll_interval: Duration,
    status_interval: Duration,
}

impl<S: WalSource> Ingester<S> {
    pub fn new(source: S, bus: EventBus, config: &ReplicationConfig) -> Self {
        Self {
            source,
            bus,
            poll_interval: config.poll_interval(),
            status_interval: Duration::from_secs(config.status_interval_secs),
        }
    }

    /// Runs the session loop until the token is cancelled.
    ///
    /// Returns `Error::Shutdown` on cancellation. Failure to open a stream,
    /// initially or while rebuilding, is fatal and propagates; everything
    /// else is counted and eventually resolved by rebuilding the stream.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        let mut stream = self.source.open().await?;
        let mut decoder = PgOutputDecoder::new();
        let mut consecutive_errors = 0u32;
        let mut last_feedback = Instant::now();

        loop {
            if shutdown.is_cancelled() {
                info!("shutdown requested, closing replication stream");
                if let Err(e) = stream.close().await {
                    warn!("error closing stream on shutdown: {e}");
                }
                return Err(Error::Shutdown);
            }

            match self
                .iteration(&mut stream, &mut decoder, &mut last_feedback)
                .await
            {
                Ok(()) => consecutive_errors = 0,
                Err(e) => {
                    consecutive_errors += 1;
                    error!(
                        "replication iteration failed ({consecutive_errors}/{MAX_CONSECUTIVE_ERRORS}): {e}"
                    );
                    if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                        warn!("error threshold reached, rebuilding replication stream");
                        if let Err(close_err) = stream.close().await {
                            warn!("error closing broken stream: {close_err}");
                        }
                        stream = self.source.open().await?;
                        // The new session re-announces every relation, so the
                        // old cache must not survive into it.
                        decoder = PgOutputDecoder::new();
                        consecutive_errors = 0;
                    }
                }
            }
        }
    }

    async fn iteration(
        &mut self,
        stream: &mut S::Stream,
        decoder: &mut PgOutputDecoder,
        last_feedback: &mut Instant,
    ) -> Result<()> {
        let Some(mut buffer) = stream.next_frame(self.poll_interval).await? else {
            // Idle. Keep the slot's retention advancing anyway.
            if last_feedback.elapsed() >= self.status_interval {
                let lsn = stream.last_receive_lsn();
                stream.status_update(lsn).await?;
                *last_feedback = Instant::now();
            }
            return Ok(());
        };

        while buffer.has_remaining() {
            if let Some(event) = decoder.decode_message(&mut buffer)? {
                let payload = serde_json::to_string(&event)?;
                self.bus.publish(payload).await?;
            }
        }

        let lsn = stream.last_receive_lsn();
        stream.status_update(lsn).await?;
        *last_feedback = Instant::now();
        Ok(())
    }
}
