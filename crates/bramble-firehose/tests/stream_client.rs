//! Connection scenarios against a scripted relay.
//!
//! Time is paused, so backoff sleeps complete as soon as every task is idle.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures_util::StreamExt;
use pretty_assertions::assert_eq;
use serde::Serialize;

use bramble_firehose::frame::encode_frame_parts;
use bramble_firehose::transport::{CloseReason, Inbound};
use bramble_firehose::{
    Commit, Connection, ConnectionStatus, DecodeError, ErrorFrame, EventStream, FirehoseClient,
    FirehoseConfig, FirehoseError, FrameHeader, Info, InfoName, RepoEvent, SequenceVerdict,
    StreamEvent, Transport, encode_frame,
};

const RELAY: &str = "wss://relay.test";

/// What the relay does on one connection.
enum Step {
    Frame(Vec<u8>),
    /// Transport error.
    Drop,
    /// Server-initiated close.
    Close(u16),
}

enum Attempt {
    Accept(Vec<Step>),
    Refuse(&'static str),
}

#[derive(Default)]
struct RelayLog {
    attempts: VecDeque<Attempt>,
    urls: Vec<String>,
    closes: Vec<(u16, String)>,
}

/// Scripted transport. Each connect consumes the next attempt; once the
/// script runs out, connections are refused. A connection whose steps are
/// exhausted stays open and silent.
#[derive(Clone, Default)]
struct ScriptedRelay {
    log: Arc<Mutex<RelayLog>>,
}

impl ScriptedRelay {
    fn accept(self, steps: Vec<Step>) -> Self {
        self.log.lock().unwrap().attempts.push_back(Attempt::Accept(steps));
        self
    }

    fn refuse(self, reason: &'static str) -> Self {
        self.log.lock().unwrap().attempts.push_back(Attempt::Refuse(reason));
        self
    }

    fn urls(&self) -> Vec<String> {
        self.log.lock().unwrap().urls.clone()
    }

    fn closes(&self) -> Vec<(u16, String)> {
        self.log.lock().unwrap().closes.clone()
    }
}

struct ScriptedConnection {
    steps: VecDeque<Step>,
    log: Arc<Mutex<RelayLog>>,
}

#[async_trait]
impl Transport for ScriptedRelay {
    type Connection = ScriptedConnection;

    async fn connect(&self, url: &str) -> Result<ScriptedConnection, FirehoseError> {
        let mut log = self.log.lock().unwrap();
        log.urls.push(url.to_string());
        match log.attempts.pop_front() {
            Some(Attempt::Accept(steps)) => Ok(ScriptedConnection {
                steps: steps.into(),
                log: Arc::clone(&self.log),
            }),
            Some(Attempt::Refuse(reason)) => Err(FirehoseError::WebSocket(reason.to_string())),
            None => Err(FirehoseError::WebSocket("connection refused".to_string())),
        }
    }
}

#[async_trait]
impl Connection for ScriptedConnection {
    async fn recv(&mut self) -> Result<Inbound, FirehoseError> {
        match self.steps.pop_front() {
            Some(Step::Frame(data)) => Ok(Inbound::Binary(data)),
            Some(Step::Drop) => Err(FirehoseError::WebSocket("connection reset".to_string())),
            Some(Step::Close(code)) => Ok(Inbound::Close(Some(CloseReason {
                code,
                reason: String::new(),
            }))),
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), FirehoseError> {
        self.log.lock().unwrap().closes.push((code, reason.to_string()));
        Ok(())
    }
}

fn client(relay: &ScriptedRelay) -> FirehoseClient<ScriptedRelay> {
    client_with(relay, FirehoseConfig::new(RELAY))
}

fn client_with(relay: &ScriptedRelay, config: FirehoseConfig) -> FirehoseClient<ScriptedRelay> {
    FirehoseClient::with_transport(config.with_randomization_factor(0.0), relay.clone())
}

fn url(cursor: Option<i64>) -> String {
    match cursor {
        Some(cursor) => format!("{}/xrpc/com.atproto.sync.subscribeRepos?cursor={}", RELAY, cursor),
        None => format!("{}/xrpc/com.atproto.sync.subscribeRepos", RELAY),
    }
}

fn sample_commit(seq: i64) -> Commit {
    Commit {
        seq,
        rebase: false,
        too_big: false,
        repo: "did:plc:ewvi7nxzyoun6zhxrhs64oiz".to_string(),
        commit: "bafyreifp7vz2s3w52ricpem6zypgfx7htpvhjcswa6zwkoemhfxbwmvghe"
            .parse()
            .unwrap(),
        rev: "3l3qo2vutsw2b".to_string(),
        since: None,
        blocks: Vec::new(),
        ops: Vec::new(),
        blobs: Vec::new(),
        time: Utc.with_ymd_and_hms(2024, 11, 5, 18, 30, 0).unwrap(),
        prev_data: None,
    }
}

fn commit(seq: i64) -> Step {
    Step::Frame(encode_frame(&RepoEvent::Commit(sample_commit(seq))).unwrap())
}

fn info(name: InfoName) -> Step {
    Step::Frame(
        encode_frame(&RepoEvent::Info(Info {
            name,
            message: Some("requested cursor exceeded limit".to_string()),
        }))
        .unwrap(),
    )
}

fn error_frame(error: &str) -> Step {
    Step::Frame(
        encode_frame(&RepoEvent::Error(ErrorFrame {
            error: error.to_string(),
            message: None,
        }))
        .unwrap(),
    )
}

async fn next_event(stream: &mut EventStream) -> (RepoEvent, Option<SequenceVerdict>) {
    match stream.recv().await {
        Some(StreamEvent::Event { event, verdict }) => (event, verdict),
        other => panic!("expected an event, got {:?}", other),
    }
}

async fn next_commit(stream: &mut EventStream) -> (i64, SequenceVerdict) {
    match next_event(stream).await {
        (RepoEvent::Commit(commit), Some(verdict)) => (commit.seq, verdict),
        other => panic!("expected a commit, got {:?}", other),
    }
}

fn rejected(sequence: i64, last_good: i64) -> SequenceVerdict {
    SequenceVerdict::Rejected(bramble_firehose::NonMonotonicSequence {
        sequence,
        last_good,
    })
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_sequence_is_rejected_but_delivered() {
    let relay = ScriptedRelay::default().accept(vec![commit(5), commit(6), commit(6)]);
    let client = client(&relay);

    let mut stream = client.connect(None).await.unwrap();
    assert_eq!(client.status(), ConnectionStatus::Connected);

    assert_eq!(next_commit(&mut stream).await, (5, SequenceVerdict::Accepted));
    assert_eq!(next_commit(&mut stream).await, (6, SequenceVerdict::Accepted));
    assert_eq!(next_commit(&mut stream).await, (6, rejected(6, 6)));
    assert_eq!(client.last_good_sequence(), Some(6));

    client.disconnect(1000, "done").await;
    assert!(stream.recv().await.is_none());
    assert_eq!(client.status(), ConnectionStatus::Disconnected);
    assert_eq!(relay.closes(), vec![(1000, "done".to_string())]);
}

#[tokio::test(start_paused = true)]
async fn test_outdated_cursor_info_then_commit() {
    let relay = ScriptedRelay::default()
        .accept(vec![info(InfoName::OutdatedCursor), commit(100)]);
    let client = client(&relay);

    let mut stream = client.connect(Some(0)).await.unwrap();
    assert_eq!(relay.urls(), vec![url(Some(0))]);

    match next_event(&mut stream).await {
        (RepoEvent::Info(info), None) => assert_eq!(info.name, InfoName::OutdatedCursor),
        other => panic!("expected info, got {:?}", other),
    }
    assert_eq!(next_commit(&mut stream).await, (100, SequenceVerdict::Accepted));
    assert_eq!(client.last_good_sequence(), Some(100));

    client.disconnect(1000, "done").await;
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_resumes_from_last_good_sequence() {
    let relay = ScriptedRelay::default()
        .accept(vec![commit(40), commit(41), commit(42), Step::Drop])
        .accept(vec![commit(43)]);
    let client = client(&relay);

    // Backfill from 7 reaches 42 before the drop.
    let mut stream = client.connect(Some(7)).await.unwrap();
    for seq in 40..=43 {
        assert_eq!(next_commit(&mut stream).await, (seq, SequenceVerdict::Accepted));
    }

    assert_eq!(relay.urls(), vec![url(Some(7)), url(Some(42))]);
    assert_eq!(client.cursor(), Some(42));
    assert_eq!(client.status(), ConnectionStatus::Connected);

    client.disconnect(1000, "done").await;
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_before_any_event_keeps_original_cursor() {
    let relay = ScriptedRelay::default()
        .accept(vec![Step::Close(1011)])
        .refuse("relay restarting")
        .accept(vec![commit(8)]);
    let client = client(&relay);

    let mut stream = client.connect(Some(7)).await.unwrap();
    assert_eq!(next_commit(&mut stream).await, (8, SequenceVerdict::Accepted));
    assert_eq!(
        relay.urls(),
        vec![url(Some(7)), url(Some(7)), url(Some(7))]
    );

    client.disconnect(1000, "done").await;
}

#[tokio::test(start_paused = true)]
async fn test_future_cursor_is_fatal_without_reconnect() {
    let relay = ScriptedRelay::default().accept(vec![error_frame("FutureCursor")]);
    let client = client(&relay);

    let mut stream = client.connect(Some(10_000_000)).await.unwrap();

    match next_event(&mut stream).await {
        (RepoEvent::Error(err), None) => assert!(err.is_future_cursor()),
        other => panic!("expected error frame, got {:?}", other),
    }
    match stream.recv().await {
        Some(StreamEvent::Fatal(FirehoseError::FutureCursor { cursor, .. })) => {
            assert_eq!(cursor, Some(10_000_000))
        }
        other => panic!("expected fatal future cursor, got {:?}", other),
    }
    assert!(stream.recv().await.is_none());

    assert_eq!(client.status(), ConnectionStatus::Disconnected);
    assert_eq!(relay.urls().len(), 1);
    assert_eq!(client.last_good_sequence(), None);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_commit_does_not_end_stream() {
    #[derive(Serialize)]
    struct NotACommit {
        seq: i64,
    }

    let malformed = encode_frame_parts(&FrameHeader::message("#commit"), &NotACommit { seq: 1 })
        .unwrap();
    let relay = ScriptedRelay::default().accept(vec![Step::Frame(malformed), commit(2)]);
    let client = client(&relay);

    let mut stream = client.connect(None).await.unwrap();

    match stream.recv().await {
        Some(StreamEvent::DecodeFailed(DecodeError::Payload { message_type, .. })) => {
            assert_eq!(message_type, "#commit")
        }
        other => panic!("expected decode failure, got {:?}", other),
    }
    assert_eq!(next_commit(&mut stream).await, (2, SequenceVerdict::Accepted));
    assert_eq!(relay.urls().len(), 1);

    client.disconnect(1000, "done").await;
}

#[tokio::test(start_paused = true)]
async fn test_unknown_frames_are_skipped() {
    let unknown_op = encode_frame_parts(
        &FrameHeader {
            op: 2,
            t: Some("#future".to_string()),
        },
        &(),
    )
    .unwrap();
    let unknown_type =
        encode_frame_parts(&FrameHeader::message("#sync"), &sample_commit(1)).unwrap();
    let relay = ScriptedRelay::default().accept(vec![
        Step::Frame(unknown_op),
        Step::Frame(unknown_type),
        commit(3),
    ]);
    let client = client(&relay);

    let mut stream = client.connect(None).await.unwrap();
    match stream.recv().await {
        Some(StreamEvent::DecodeFailed(DecodeError::UnrecognizedMessageType(t))) => {
            assert_eq!(t, "#sync")
        }
        other => panic!("expected unrecognized type, got {:?}", other),
    }
    assert_eq!(next_commit(&mut stream).await, (3, SequenceVerdict::Accepted));

    client.disconnect(1000, "done").await;
}

#[tokio::test(start_paused = true)]
async fn test_info_and_error_frames_bypass_tracker() {
    let relay = ScriptedRelay::default().accept(vec![
        commit(3),
        info(InfoName::Other("Maintenance".to_string())),
        error_frame("InternalError"),
        commit(4),
    ]);
    let client = client(&relay);

    let mut stream = client.connect(None).await.unwrap();
    assert_eq!(next_commit(&mut stream).await, (3, SequenceVerdict::Accepted));

    let (event, verdict) = next_event(&mut stream).await;
    assert!(matches!(event, RepoEvent::Info(_)));
    assert_eq!(verdict, None);
    assert_eq!(client.last_good_sequence(), Some(3));

    let (event, verdict) = next_event(&mut stream).await;
    assert!(matches!(event, RepoEvent::Error(_)));
    assert_eq!(verdict, None);
    assert_eq!(client.last_good_sequence(), Some(3));

    assert_eq!(next_commit(&mut stream).await, (4, SequenceVerdict::Accepted));
    assert_eq!(client.status(), ConnectionStatus::Connected);

    client.disconnect(1000, "done").await;
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_is_idempotent() {
    let relay = ScriptedRelay::default().accept(vec![commit(1)]);
    let client = client(&relay);
    let before = client.session();

    client.disconnect(1000, "not connected").await;
    assert_eq!(client.session(), before);
    assert_eq!(before.status, ConnectionStatus::Disconnected);

    let mut stream = client.connect(None).await.unwrap();
    next_commit(&mut stream).await;
    client.disconnect(1000, "first").await;
    let after = client.session();
    client.disconnect(1000, "second").await;

    assert_eq!(client.session(), after);
    assert_eq!(relay.closes(), vec![(1000, "first".to_string())]);
}

#[tokio::test(start_paused = true)]
async fn test_handshake_failure_is_returned_without_retry() {
    let relay = ScriptedRelay::default().refuse("handshake rejected");
    let client = client(&relay);

    let result = client.connect(Some(5)).await;
    assert!(matches!(result, Err(FirehoseError::WebSocket(_))));
    assert_eq!(client.status(), ConnectionStatus::Disconnected);
    assert_eq!(relay.urls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_relay_url_never_connects() {
    let relay = ScriptedRelay::default();
    let client = client_with(&relay, FirehoseConfig::new("ftp://relay.test"));

    assert!(matches!(
        client.connect(None).await,
        Err(FirehoseError::InvalidRelayUrl(_))
    ));
    assert!(relay.urls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_connect_twice_is_rejected() {
    let relay = ScriptedRelay::default().accept(Vec::new());
    let client = client(&relay);

    let _stream = client.connect(None).await.unwrap();
    assert!(matches!(
        client.connect(None).await,
        Err(FirehoseError::AlreadyConnected)
    ));

    client.disconnect(1000, "done").await;
}

#[tokio::test(start_paused = true)]
async fn test_retries_exhausted_is_fatal() {
    let relay = ScriptedRelay::default().accept(vec![commit(1), Step::Drop]);
    let client = client_with(&relay, FirehoseConfig::new(RELAY).with_max_retries(2));

    let mut stream = client.connect(None).await.unwrap();
    assert_eq!(next_commit(&mut stream).await, (1, SequenceVerdict::Accepted));

    match stream.recv().await {
        Some(StreamEvent::Fatal(FirehoseError::RetriesExhausted { attempts, .. })) => {
            assert_eq!(attempts, 2)
        }
        other => panic!("expected retries exhausted, got {:?}", other),
    }
    assert!(stream.recv().await.is_none());

    assert_eq!(client.status(), ConnectionStatus::Disconnected);
    assert_eq!(
        relay.urls(),
        vec![url(None), url(Some(1)), url(Some(1))]
    );

    // A fresh connect is allowed once the stream has ended.
    assert!(matches!(
        client.connect(None).await,
        Err(FirehoseError::WebSocket(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_retry_budget_resets_after_recovery() {
    let relay = ScriptedRelay::default()
        .accept(vec![commit(1), Step::Drop])
        .accept(vec![commit(2), Step::Drop])
        .accept(vec![commit(3)]);
    let client = client_with(&relay, FirehoseConfig::new(RELAY).with_max_retries(1));

    let mut stream = client.connect(None).await.unwrap();
    for seq in 1..=3 {
        assert_eq!(next_commit(&mut stream).await, (seq, SequenceVerdict::Accepted));
    }
    assert_eq!(relay.urls(), vec![url(None), url(Some(1)), url(Some(2))]);

    client.disconnect(1000, "done").await;
}

#[tokio::test(start_paused = true)]
async fn test_backoff_delays_reconnect() {
    let relay = ScriptedRelay::default()
        .accept(vec![commit(1), Step::Drop])
        .refuse("still down")
        .accept(vec![commit(2)]);
    let config = FirehoseConfig::new(RELAY)
        .with_backoff(Duration::from_secs(2), Duration::from_secs(60));
    let client = client_with(&relay, config);

    let mut stream = client.connect(None).await.unwrap();
    next_commit(&mut stream).await;

    let start = tokio::time::Instant::now();
    assert_eq!(next_commit(&mut stream).await, (2, SequenceVerdict::Accepted));
    // 2s before the refused attempt, 4s before the successful one
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(6), "reconnected after {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(7), "reconnected after {:?}", elapsed);

    client.disconnect(1000, "done").await;
}

#[tokio::test(start_paused = true)]
async fn test_consumer_too_slow_triggers_reconnect() {
    let relay = ScriptedRelay::default()
        .accept(vec![commit(5), error_frame("ConsumerTooSlow")])
        .accept(vec![commit(6)]);
    let client = client(&relay);

    let mut stream = client.connect(None).await.unwrap();
    assert_eq!(next_commit(&mut stream).await, (5, SequenceVerdict::Accepted));
    match next_event(&mut stream).await {
        (RepoEvent::Error(err), None) => assert!(err.is_consumer_too_slow()),
        other => panic!("expected error frame, got {:?}", other),
    }
    assert_eq!(next_commit(&mut stream).await, (6, SequenceVerdict::Accepted));
    assert_eq!(relay.urls(), vec![url(None), url(Some(5))]);

    client.disconnect(1000, "done").await;
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_command() {
    let relay = ScriptedRelay::default()
        .accept(vec![commit(1)])
        .accept(vec![commit(2)]);
    let client = client(&relay);

    let mut stream = client.connect(Some(0)).await.unwrap();
    next_commit(&mut stream).await;

    client.reconnect().await;
    assert_eq!(next_commit(&mut stream).await, (2, SequenceVerdict::Accepted));
    assert_eq!(relay.urls(), vec![url(Some(0)), url(Some(1))]);
    assert_eq!(relay.closes(), vec![(1000, "reconnecting".to_string())]);

    client.disconnect(1000, "done").await;
}

#[tokio::test(start_paused = true)]
async fn test_read_timeout_counts_as_drop() {
    let relay = ScriptedRelay::default()
        .accept(vec![commit(1)])
        .accept(vec![commit(2)]);
    let config = FirehoseConfig::new(RELAY).with_read_timeout(Duration::from_secs(30));
    let client = client_with(&relay, config);

    let mut stream = client.connect(None).await.unwrap();
    next_commit(&mut stream).await;
    assert_eq!(next_commit(&mut stream).await, (2, SequenceVerdict::Accepted));
    assert_eq!(relay.urls(), vec![url(None), url(Some(1))]);

    client.disconnect(1000, "done").await;
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_during_backoff() {
    let relay = ScriptedRelay::default().accept(vec![commit(1), Step::Drop]);
    let client = client(&relay);

    let mut stream = client.connect(None).await.unwrap();
    next_commit(&mut stream).await;

    client.disconnect(1000, "shutdown").await;
    assert_eq!(client.status(), ConnectionStatus::Disconnected);
    assert!(stream.recv().await.is_none());
    assert_eq!(client.last_good_sequence(), Some(1));
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_with_full_buffer() {
    let relay = ScriptedRelay::default().accept((1..=10).map(commit).collect());
    let client = client_with(&relay, FirehoseConfig::new(RELAY).with_event_buffer(2));

    let stream = client.connect(None).await.unwrap();
    // Let the loop fill the buffer and block on the next hand-over.
    tokio::time::sleep(Duration::from_millis(10)).await;

    client.disconnect(1000, "shutdown").await;

    let seqs: Vec<i64> = stream
        .into_stream()
        .filter_map(|item| async move {
            match item {
                StreamEvent::Event {
                    event: RepoEvent::Commit(commit),
                    ..
                } => Some(commit.seq),
                _ => None,
            }
        })
        .collect()
        .await;
    assert_eq!(seqs, vec![1, 2]);
    assert_eq!(client.last_good_sequence(), Some(2));
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_with_stalled_consumer_does_not_block_disconnect() {
    let relay = ScriptedRelay::default()
        .accept((1..=10).map(commit).collect())
        .accept(vec![commit(11)]);
    let client = client_with(&relay, FirehoseConfig::new(RELAY).with_event_buffer(2));

    let stream = client.connect(None).await.unwrap();
    // The loop fills the buffer and blocks handing over seq 3.
    tokio::time::sleep(Duration::from_millis(10)).await;

    tokio::time::timeout(Duration::from_secs(3600), client.reconnect())
        .await
        .expect("reconnect waited for the stalled consumer");
    tokio::time::timeout(Duration::from_secs(3600), client.disconnect(1000, "shutdown"))
        .await
        .expect("disconnect never reached the receive loop");

    assert_eq!(client.status(), ConnectionStatus::Disconnected);
    assert_eq!(relay.urls(), vec![url(None)]);
    assert_eq!(relay.closes(), vec![(1000, "shutdown".to_string())]);

    let seqs: Vec<i64> = stream
        .into_stream()
        .filter_map(|item| async move {
            match item {
                StreamEvent::Event {
                    event: RepoEvent::Commit(commit),
                    ..
                } => Some(commit.seq),
                _ => None,
            }
        })
        .collect()
        .await;
    assert_eq!(seqs, vec![1, 2]);
    assert_eq!(client.last_good_sequence(), Some(2));
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_during_hand_over_resumes_after_delivery() {
    let relay = ScriptedRelay::default()
        .accept((1..=10).map(commit).collect())
        .accept(vec![commit(4)]);
    let client = client_with(&relay, FirehoseConfig::new(RELAY).with_event_buffer(2));

    let mut stream = client.connect(None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    client.reconnect().await;

    // Seq 3 was mid hand-over, so it is delivered before the old connection closes.
    for seq in 1..=4 {
        assert_eq!(next_commit(&mut stream).await, (seq, SequenceVerdict::Accepted));
    }
    assert_eq!(relay.urls(), vec![url(None), url(Some(3))]);
    assert_eq!(relay.closes(), vec![(1000, "reconnecting".to_string())]);

    client.disconnect(1000, "done").await;
}
