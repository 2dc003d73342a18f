//! Session-manager behavior against a scripted replication source.
//!
//! The mock source plays back a fixed sequence of frames and injected
//! failures per stream, recording every open, close, and status update, so
//! reconnect mechanics are observable without a live server.

use bytes::{BufMut, Bytes, BytesMut};
use pg_ingest::config::ReplicationConfig;
use pg_ingest::{Error, EventBus, Ingester, Result, WalSource, WalStream};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

enum ScriptItem {
    Frame { lsn: u64, bytes: Bytes },
    ReadError,
}

fn frame(lsn: u64, bytes: Bytes) -> ScriptItem {
    ScriptItem::Frame { lsn, bytes }
}

#[derive(Clone, Default)]
struct SourceLog {
    opened: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
    feedback: Arc<Mutex<Vec<(usize, u64)>>>,
}

impl SourceLog {
    fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    fn feedback(&self) -> Vec<(usize, u64)> {
        self.feedback.lock().unwrap().clone()
    }
}

struct MockSource {
    scripts: VecDeque<Vec<ScriptItem>>,
    log: SourceLog,
}

impl MockSource {
    fn new(scripts: Vec<Vec<ScriptItem>>) -> (Self, SourceLog) {
        let log = SourceLog::default();
        (
            Self {
                scripts: scripts.into(),
                log: log.clone(),
            },
            log,
        )
    }
}

impl WalSource for MockSource {
    type Stream = MockStream;

    async fn open(&mut self) -> Result<MockStream> {
        let id = self.log.opened.fetch_add(1, Ordering::SeqCst);
        let script = self.scripts.pop_front().unwrap_or_default();
        Ok(MockStream {
            id,
            script: script.into(),
            lsn: 0,
            log: self.log.clone(),
        })
    }
}

struct MockStream {
    id: usize,
    script: VecDeque<ScriptItem>,
    lsn: u64,
    log: SourceLog,
}

impl WalStream for MockStream {
    async fn next_frame(&mut self, deadline: Duration) -> Result<Option<Bytes>> {
        match self.script.pop_front() {
            Some(ScriptItem::Frame { lsn, bytes }) => {
                self.lsn = lsn;
                Ok(Some(bytes))
            }
            Some(ScriptItem::ReadError) => Err(Error::Replication {
                message: "injected read failure".to_string(),
            }),
            None => {
                tokio::time::sleep(deadline).await;
                Ok(None)
            }
        }
    }

    fn last_receive_lsn(&self) -> u64 {
        self.lsn
    }

    async fn status_update(&mut self, lsn: u64) -> Result<()> {
        self.log.feedback.lock().unwrap().push((self.id, lsn));
        Ok(())
    }

    async fn close(self) -> Result<()> {
        self.log.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn test_config() -> ReplicationConfig {
    ReplicationConfig {
        poll_interval_ms: 5,
        status_interval_secs: 120,
        bus_capacity: 16,
    }
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put(s.as_bytes());
    buf.put_u8(0);
}

fn relation_bytes(rel_id: u32, table: &str, columns: &[&str]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(b'R');
    buf.put_u32(rel_id);
    put_cstr(&mut buf, "public");
    put_cstr(&mut buf, table);
    buf.put_u8(b'd');
    buf.put_i16(columns.len() as i16);
    for name in columns {
        buf.put_u8(0);
        put_cstr(&mut buf, name);
        buf.put_u32(25);
        buf.put_i32(-1);
    }
    buf.freeze()
}

fn insert_bytes(rel_id: u32, values: &[&str]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(b'I');
    buf.put_u32(rel_id);
    buf.put_u8(b'N');
    buf.put_i16(values.len() as i16);
    for value in values {
        buf.put_u8(b't');
        buf.put_i32(value.len() as i32);
        buf.put(value.as_bytes());
    }
    buf.freeze()
}

fn begin_bytes(final_lsn: u64) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(b'B');
    buf.put_u64(final_lsn);
    buf.put_i64(0);
    buf.put_u32(1);
    buf.freeze()
}

fn commit_bytes(lsn: u64) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(b'C');
    buf.put_u8(0);
    buf.put_u64(lsn);
    buf.put_u64(lsn);
    buf.put_i64(0);
    buf.freeze()
}

fn concat(frames: &[Bytes]) -> Bytes {
    let mut buf = BytesMut::new();
    for frame in frames {
        buf.put(frame.clone());
    }
    buf.freeze()
}

async fn wait_until(mut probe: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !probe() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn publishes_decoded_events_in_order() {
    let (source, log) = MockSource::new(vec![vec![frame(
        100,
        concat(&[
            begin_bytes(100),
            relation_bytes(1, "users", &["id", "name"]),
            insert_bytes(1, &["1", "Ada"]),
            insert_bytes(1, &["2", "Grace"]),
            commit_bytes(100),
        ]),
    )]]);

    let mut bus = EventBus::new(16);
    let mut events = bus.subscribe();
    let ingester = Ingester::new(source, bus, &test_config());

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(ingester.run(shutdown.clone()));

    let first = events.recv().await.unwrap();
    let second = events.recv().await.unwrap();
    let third = events.recv().await.unwrap();

    assert_eq!(
        first,
        r#"{"type":"insert","table":"users","data":{"id":"1","name":"Ada"}}"#
    );
    assert_eq!(
        second,
        r#"{"type":"insert","table":"users","data":{"id":"2","name":"Grace"}}"#
    );
    assert!(third.starts_with(r#"{"type":"commit""#));

    // One feedback write per drained frame, acknowledging the frame's LSN.
    wait_until(|| !log.feedback().is_empty()).await;
    assert_eq!(log.feedback()[0], (0, 100));

    shutdown.cancel();
    assert!(matches!(handle.await.unwrap(), Err(Error::Shutdown)));
}

#[tokio::test]
async fn rebuilds_stream_after_three_consecutive_errors() {
    // Stream 0 announces a relation, delivers a row, then fails three reads
    // in a row. Stream 1 replays a row change for the same relation id
    // before re-announcing it: the fresh session must not remember the old
    // schema, so that first change is a decode error, and only the
    // re-announced insert comes through.
    let (source, log) = MockSource::new(vec![
        vec![
            frame(10, relation_bytes(1, "users", &["id"])),
            frame(11, insert_bytes(1, &["1"])),
            ScriptItem::ReadError,
            ScriptItem::ReadError,
            ScriptItem::ReadError,
        ],
        vec![
            frame(12, insert_bytes(1, &["2"])),
            frame(13, relation_bytes(1, "users", &["id"])),
            frame(14, insert_bytes(1, &["3"])),
        ],
    ]);

    let mut bus = EventBus::new(16);
    let mut events = bus.subscribe();
    let ingester = Ingester::new(source, bus, &test_config());

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(ingester.run(shutdown.clone()));

    let before = events.recv().await.unwrap();
    let after = events.recv().await.unwrap();

    assert!(before.contains(r#""id":"1""#));
    assert!(after.contains(r#""id":"3""#), "stale-cache insert leaked: {after}");

    assert_eq!(log.opened(), 2, "exactly one rebuild expected");
    assert_eq!(log.closed(), 1);

    shutdown.cancel();
    assert!(matches!(handle.await.unwrap(), Err(Error::Shutdown)));
    assert_eq!(log.closed(), 2);
}

#[tokio::test]
async fn error_counter_resets_on_success() {
    // Two failures, a good frame, two more failures: the threshold is never
    // reached and the original stream stays up.
    let (source, log) = MockSource::new(vec![vec![
        ScriptItem::ReadError,
        ScriptItem::ReadError,
        frame(20, relation_bytes(1, "users", &["id"])),
        ScriptItem::ReadError,
        ScriptItem::ReadError,
        frame(21, insert_bytes(1, &["1"])),
    ]]);

    let mut bus = EventBus::new(16);
    let mut events = bus.subscribe();
    let ingester = Ingester::new(source, bus, &test_config());

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(ingester.run(shutdown.clone()));

    events.recv().await.unwrap();
    assert_eq!(log.opened(), 1);

    shutdown.cancel();
    assert!(matches!(handle.await.unwrap(), Err(Error::Shutdown)));
}

#[tokio::test]
async fn publish_failures_count_toward_reconnect() {
    let (source, log) = MockSource::new(vec![
        vec![
            frame(30, relation_bytes(1, "users", &["id"])),
            frame(31, insert_bytes(1, &["1"])),
            frame(32, insert_bytes(1, &["2"])),
            frame(33, insert_bytes(1, &["3"])),
        ],
        vec![],
    ]);

    let mut bus = EventBus::new(16);
    let events = bus.subscribe();
    drop(events); // every publish now fails
    let ingester = Ingester::new(source, bus, &test_config());

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(ingester.run(shutdown.clone()));

    wait_until(|| log.opened() == 2).await;

    shutdown.cancel();
    assert!(matches!(handle.await.unwrap(), Err(Error::Shutdown)));
}

#[tokio::test]
async fn repeated_feedback_without_new_data_is_accepted() {
    // Two frames carrying the same LSN produce two identical status writes;
    // both succeed and acknowledge the same position.
    let (source, log) = MockSource::new(vec![vec![
        frame(40, relation_bytes(1, "users", &["id"])),
        frame(40, relation_bytes(2, "orders", &["id"])),
    ]]);

    let bus = EventBus::new(16);
    let ingester = Ingester::new(source, bus, &test_config());

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(ingester.run(shutdown.clone()));

    wait_until(|| log.feedback().len() >= 2).await;
    let feedback = log.feedback();
    assert_eq!(feedback[0], (0, 40));
    assert_eq!(feedback[1], (0, 40));

    shutdown.cancel();
    assert!(matches!(handle.await.unwrap(), Err(Error::Shutdown)));
}

#[tokio::test]
async fn idle_stream_still_reports_progress() {
    // With a zero status interval every idle pass re-acknowledges the last
    // received position, keeping retention moving while no data flows.
    let (source, log) = MockSource::new(vec![vec![]]);

    let bus = EventBus::new(16);
    let config = ReplicationConfig {
        status_interval_secs: 0,
        ..test_config()
    };
    let ingester = Ingester::new(source, bus, &config);

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(ingester.run(shutdown.clone()));

    wait_until(|| !log.feedback().is_empty()).await;

    shutdown.cancel();
    assert!(matches!(handle.await.unwrap(), Err(Error::Shutdown)));
}

#[tokio::test]
async fn cancellation_closes_the_stream() {
    let (source, log) = MockSource::new(vec![vec![]]);

    let bus = EventBus::new(16);
    let ingester = Ingester::new(source, bus, &test_config());

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(ingester.run(shutdown.clone()));

    wait_until(|| log.opened() == 1).await;
    shutdown.cancel();

    assert!(matches!(handle.await.unwrap(), Err(Error::Shutdown)));
    assert_eq!(log.closed(), 1);
}
