//! Firehose client for real-time ATProto repository events.
//!
//! Connects to `com.atproto.sync.subscribeRepos` (or another stream
//! endpoint), decodes frames in arrival order, tracks the sequence cursor and
//! resumes from the last good sequence when the connection drops.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, trace, warn};

use crate::config::FirehoseConfig;
use crate::error::{DecodeError, FirehoseError};
use crate::event::{InfoName, RepoEvent};
use crate::frame::decode_frame;
use crate::recovery::{GapRecovery, RecoveryPlan};
use crate::sequence::{SequenceTracker, SequenceVerdict};
use crate::session::{ConnectionStatus, SessionSnapshot, SessionState};
use crate::transport::{
    CloseReason, Connection, Inbound, NORMAL_CLOSURE, Transport, WebSocketTransport,
};

/// An item delivered to the consumer.
#[derive(Debug)]
pub enum StreamEvent {
    /// A decoded event. `verdict` is set for sequence-bearing variants; a
    /// `Rejected` verdict is a warning, the event is still delivered.
    Event {
        event: RepoEvent,
        verdict: Option<SequenceVerdict>,
    },
    /// A frame could not be decoded. The stream continues.
    DecodeFailed(DecodeError),
    /// The stream ended with an unrecoverable error. Always the last item.
    Fatal(FirehoseError),
}

/// Receiving half of a firehose session.
///
/// Yields `None` once the session is over (disconnect, fatal error, or the
/// client was dropped).
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::Receiver<StreamEvent>,
}

impl EventStream {
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    /// Adapt into a [`futures_util::Stream`].
    pub fn into_stream(self) -> ReceiverStream<StreamEvent> {
        ReceiverStream::new(self.rx)
    }
}

/// Commands handed from the client to the receive loop.
enum Command {
    Disconnect {
        code: u16,
        reason: String,
        ack: oneshot::Sender<()>,
    },
    Reconnect {
        ack: oneshot::Sender<()>,
    },
}

struct Running {
    commands: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

/// Firehose client.
///
/// Owns the session state; the spawned receive loop is its only writer.
/// `connect`, `reconnect` and `disconnect` are serialized: a command does not
/// start until the previous one has been acknowledged.
pub struct FirehoseClient<T: Transport = WebSocketTransport> {
    transport: Arc<T>,
    config: FirehoseConfig,
    session: Arc<SessionState>,
    running: Mutex<Option<Running>>,
}

impl FirehoseClient<WebSocketTransport> {
    /// Create a client that connects over WebSocket.
    pub fn new(config: FirehoseConfig) -> Self {
        Self::with_transport(config, WebSocketTransport)
    }
}

impl<T: Transport> FirehoseClient<T> {
    /// Create a client over a custom transport.
    pub fn with_transport(config: FirehoseConfig, transport: T) -> Self {
        let session = Arc::new(SessionState::new(
            config.relay_url.clone(),
            config.endpoint.clone(),
        ));
        Self {
            transport: Arc::new(transport),
            config,
            session,
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &FirehoseConfig {
        &self.config
    }

    pub fn status(&self) -> ConnectionStatus {
        self.session.status()
    }

    /// Last sequence that was accepted and handed to the consumer.
    /// Persist this to resume across restarts.
    pub fn last_good_sequence(&self) -> Option<i64> {
        self.session.last_good_sequence()
    }

    /// Cursor sent on the most recent (re)connect.
    pub fn cursor(&self) -> Option<i64> {
        self.session.cursor()
    }

    pub fn session(&self) -> SessionSnapshot {
        self.session.snapshot()
    }

    /// Shared handle on the session state for readers on other tasks.
    pub fn session_state(&self) -> Arc<SessionState> {
        Arc::clone(&self.session)
    }

    /// Connect and start receiving events.
    ///
    /// Returns once the handshake has completed. A failed handshake is
    /// returned as an error and leaves the client `Disconnected`; no retry
    /// is attempted for the initial connection.
    pub async fn connect(&self, cursor: Option<i64>) -> Result<EventStream, FirehoseError> {
        let mut running = self.running.lock().await;
        if let Some(current) = running.as_ref()
            && !current.task.is_finished()
        {
            return Err(FirehoseError::AlreadyConnected);
        }
        if let Some(previous) = running.take() {
            // Loop already ended on its own (fatal error or consumer gone).
            let _ = previous.task.await;
        }

        let url = self.config.subscribe_url(cursor)?;

        let (events_tx, events_rx) = mpsc::channel(self.config.event_buffer.max(1));
        let (commands_tx, commands_rx) = mpsc::channel(1);
        let (ready_tx, ready_rx) = oneshot::channel();

        let receive_loop = ReceiveLoop {
            transport: Arc::clone(&self.transport),
            config: self.config.clone(),
            session: Arc::clone(&self.session),
            tracker: SequenceTracker::new(),
            recovery: GapRecovery::new(&self.config),
            commands: commands_rx,
            events: events_tx,
            reconnect_pending: false,
        };
        let task = tokio::spawn(receive_loop.run(url, cursor, ready_tx));

        match ready_rx.await {
            Ok(Ok(())) => {
                *running = Some(Running {
                    commands: commands_tx,
                    task,
                });
                Ok(EventStream { rx: events_rx })
            }
            Ok(Err(e)) => {
                let _ = task.await;
                Err(e)
            }
            Err(_) => {
                let reason = match task.await {
                    Err(e) => format!("receive loop panicked: {}", e),
                    Ok(()) => "receive loop exited during handshake".to_string(),
                };
                self.session.set_status(ConnectionStatus::Disconnected);
                Err(FirehoseError::WebSocket(reason))
            }
        }
    }

    /// Close the connection and stop the receive loop.
    ///
    /// Idempotent: calling it while disconnected does nothing. Once this
    /// returns, no further events are delivered.
    pub async fn disconnect(&self, code: u16, reason: &str) {
        let mut running = self.running.lock().await;
        let Some(current) = running.take() else {
            trace!("disconnect while already disconnected");
            return;
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        let command = Command::Disconnect {
            code,
            reason: reason.to_string(),
            ack: ack_tx,
        };
        if current.commands.send(command).await.is_ok() {
            // An error here means the loop ended before it saw the command.
            let _ = ack_rx.await;
        }

        if let Err(e) = current.task.await {
            error!(error = %e, "firehose receive loop panicked");
            self.session.set_status(ConnectionStatus::Disconnected);
        }
    }

    /// Drop the current connection and resume from the last good sequence.
    ///
    /// For callers with their own liveness checks. Does nothing while
    /// disconnected. Returns once the loop has taken the request; if an event
    /// is mid hand-over, the old connection closes after it is delivered.
    pub async fn reconnect(&self) {
        let running = self.running.lock().await;
        let Some(current) = running.as_ref() else {
            return;
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        if current
            .commands
            .send(Command::Reconnect { ack: ack_tx })
            .await
            .is_ok()
        {
            let _ = ack_rx.await;
        }
    }
}

/// Why the loop stopped reading from a connection.
enum Interrupt {
    /// Caller asked to disconnect.
    Disconnect {
        code: u16,
        reason: String,
        ack: oneshot::Sender<()>,
    },
    /// Caller asked to reconnect. No ack when the request was deferred, it
    /// has been acknowledged already.
    Reconnect(Option<oneshot::Sender<()>>),
    /// Client or consumer went away.
    Shutdown,
    /// The connection dropped; resume from the last good sequence.
    Dropped(String),
    /// The stream cannot continue.
    Fatal(FirehoseError),
}

impl Interrupt {
    fn from_command(command: Option<Command>) -> Self {
        match command {
            Some(Command::Disconnect { code, reason, ack }) => {
                Interrupt::Disconnect { code, reason, ack }
            }
            Some(Command::Reconnect { ack }) => Interrupt::Reconnect(Some(ack)),
            None => Interrupt::Shutdown,
        }
    }
}

/// The receive loop. Runs on its own task and owns all session writes.
struct ReceiveLoop<T: Transport> {
    transport: Arc<T>,
    config: FirehoseConfig,
    session: Arc<SessionState>,
    tracker: SequenceTracker,
    recovery: GapRecovery,
    commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<StreamEvent>,
    /// Reconnect requested while an event was being handed over.
    reconnect_pending: bool,
}

impl<T: Transport> ReceiveLoop<T> {
    async fn run(
        mut self,
        url: String,
        cursor: Option<i64>,
        ready: oneshot::Sender<Result<(), FirehoseError>>,
    ) {
        self.session.begin(cursor);
        self.session.set_status(ConnectionStatus::Connecting);

        info!(url = %url, cursor = ?cursor, "connecting to firehose");

        let mut conn = match self.transport.connect(&url).await {
            Ok(conn) => conn,
            Err(e) => {
                error!(error = %e, "firehose connection failed");
                self.session.set_status(ConnectionStatus::Disconnected);
                let _ = ready.send(Err(e));
                return;
            }
        };

        info!("firehose connected");
        self.session.set_status(ConnectionStatus::Connected);

        if ready.send(Ok(())).is_err() {
            close_quietly(&mut conn, NORMAL_CLOSURE, "client gone").await;
            self.session.set_status(ConnectionStatus::Disconnected);
            return;
        }

        let terminal = loop {
            let (reason, immediate) = match self.pump(&mut conn).await {
                Interrupt::Dropped(reason) => (reason, false),
                Interrupt::Reconnect(ack) => {
                    close_quietly(&mut conn, NORMAL_CLOSURE, "reconnecting").await;
                    if let Some(ack) = ack {
                        let _ = ack.send(());
                    }
                    ("reconnect requested".to_string(), true)
                }
                terminal => {
                    let (code, reason) = match &terminal {
                        Interrupt::Disconnect { code, reason, .. } => (*code, reason.clone()),
                        Interrupt::Fatal(e) => (NORMAL_CLOSURE, e.to_string()),
                        _ => (NORMAL_CLOSURE, "client shutting down".to_string()),
                    };
                    close_quietly(&mut conn, code, &reason).await;
                    break terminal;
                }
            };

            match self.resume(reason, immediate).await {
                Ok(new_conn) => conn = new_conn,
                Err(terminal) => break terminal,
            }
        };

        self.finish(terminal).await;
    }

    /// Read and process frames until something interrupts the connection.
    async fn pump(&mut self, conn: &mut T::Connection) -> Interrupt {
        let mut healthy = false;

        loop {
            if std::mem::take(&mut self.reconnect_pending) {
                return Interrupt::Reconnect(None);
            }

            let inbound = tokio::select! {
                biased;

                // Commands first, so a disconnect is seen between frames
                command = self.commands.recv() => return Interrupt::from_command(command),

                inbound = receive(conn, self.config.read_timeout) => inbound,
            };

            let data = match inbound {
                Ok(Inbound::Binary(data)) => data,
                Ok(Inbound::Close(frame)) => {
                    info!(close = ?frame, "firehose connection closed by server");
                    return Interrupt::Dropped(describe_close(frame.as_ref()));
                }
                Err(e) => return Interrupt::Dropped(e.to_string()),
            };

            if !healthy {
                // The connection delivers data again; the outage is over.
                healthy = true;
                self.recovery.reset();
            }

            if let Err(interrupt) = self.handle_frame(&data).await {
                return interrupt;
            }
        }
    }

    /// Decode one frame, run it past the tracker and hand it to the consumer.
    async fn handle_frame(&mut self, data: &[u8]) -> Result<(), Interrupt> {
        let event = match decode_frame(data) {
            Ok(Some(event)) => event,
            Ok(None) => {
                trace!("discarding frame with unrecognized op");
                return Ok(());
            }
            Err(e) => {
                warn!(error = %e, "failed to decode firehose frame");
                return self.deliver(StreamEvent::DecodeFailed(e)).await;
            }
        };

        let verdict = event.sequence().map(|seq| self.tracker.observe(seq));
        let accepted = match verdict {
            Some(SequenceVerdict::Accepted) => event.sequence(),
            Some(SequenceVerdict::Rejected(violation)) => {
                warn!(
                    sequence = violation.sequence,
                    last_good = violation.last_good,
                    kind = event.kind(),
                    "non-monotonic firehose sequence"
                );
                None
            }
            None => None,
        };

        let follow_up = match &event {
            RepoEvent::Error(err) if err.is_future_cursor() => {
                error!(
                    message = ?err.message,
                    cursor = ?self.session.cursor(),
                    "relay rejected cursor as in the future"
                );
                Some(Interrupt::Fatal(FirehoseError::FutureCursor {
                    cursor: self.session.cursor(),
                    message: err.message.clone(),
                }))
            }
            RepoEvent::Error(err) if err.is_consumer_too_slow() => {
                warn!(message = ?err.message, "relay dropped us for consuming too slowly");
                Some(Interrupt::Dropped(format!("relay error: {}", err.error)))
            }
            RepoEvent::Error(err) => {
                error!(
                    error_type = %err.error,
                    message = ?err.message,
                    "firehose error frame received"
                );
                None
            }
            RepoEvent::Info(info) if info.name == InfoName::OutdatedCursor => {
                warn!(
                    cursor = ?self.session.cursor(),
                    message = ?info.message,
                    "cursor is older than the relay's rollback window, events were missed"
                );
                None
            }
            RepoEvent::Info(info) => {
                debug!(name = ?info.name, message = ?info.message, "firehose info");
                None
            }
            _ => None,
        };

        self.deliver(StreamEvent::Event { event, verdict }).await?;

        if let Some(seq) = accepted {
            self.session.record_sequence(seq);
        }

        match follow_up {
            Some(interrupt) => Err(interrupt),
            None => Ok(()),
        }
    }

    /// Hand an item to the consumer, waiting for channel capacity.
    ///
    /// A disconnect arriving meanwhile abandons the item. A reconnect is
    /// acknowledged right away but waits for the hand-over, so that the
    /// resume cursor only covers delivered events.
    async fn deliver(&mut self, item: StreamEvent) -> Result<(), Interrupt> {
        let send = self.events.send(item);
        tokio::pin!(send);

        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(Command::Reconnect { ack }) => {
                        self.reconnect_pending = true;
                        let _ = ack.send(());
                    }
                    other => return Err(Interrupt::from_command(other)),
                },

                result = &mut send => {
                    return result.map_err(|_| {
                        debug!("event receiver dropped, stopping firehose");
                        Interrupt::Shutdown
                    });
                }
            }
        }
    }

    /// Reconnect from the last good sequence with bounded retries.
    async fn resume(
        &mut self,
        reason: String,
        immediate: bool,
    ) -> Result<T::Connection, Interrupt> {
        self.session.set_status(ConnectionStatus::Reconnecting);
        // This resume covers any reconnect taken during a hand-over.
        self.reconnect_pending = false;
        warn!(
            reason = %reason,
            last_good = ?self.session.last_good_sequence(),
            "firehose connection lost, reconnecting"
        );

        let mut last_error = reason;
        let mut skip_delay = immediate;

        loop {
            // Nothing accepted yet: keep the cursor the stream was opened with.
            let resume_from = self
                .session
                .last_good_sequence()
                .or_else(|| self.session.cursor());

            let (cursor, attempt, delay) = match self.recovery.recover(resume_from) {
                RecoveryPlan::Retry {
                    cursor,
                    attempt,
                    delay,
                } => (cursor, attempt, delay),
                RecoveryPlan::Exhausted { attempts } => {
                    return Err(Interrupt::Fatal(FirehoseError::RetriesExhausted {
                        attempts,
                        last_error,
                    }));
                }
            };

            if !skip_delay {
                debug!(attempt, delay_ms = delay.as_millis() as u64, "waiting before reconnect");
                tokio::select! {
                    biased;

                    command = self.commands.recv() => match command {
                        // Already reconnecting; just stop waiting.
                        Some(Command::Reconnect { ack }) => { let _ = ack.send(()); }
                        other => return Err(Interrupt::from_command(other)),
                    },

                    _ = tokio::time::sleep(delay) => {}
                }
            }
            skip_delay = false;

            self.session.set_cursor(cursor);
            let url = self.config.subscribe_url(cursor).map_err(Interrupt::Fatal)?;
            info!(url = %url, attempt, cursor = ?cursor, "reconnecting to firehose");

            let result = tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(Command::Reconnect { ack }) => {
                        let _ = ack.send(());
                        skip_delay = true;
                        continue;
                    }
                    other => return Err(Interrupt::from_command(other)),
                },

                result = self.transport.connect(&url) => result,
            };

            match result {
                Ok(conn) => {
                    info!(attempt, cursor = ?cursor, "firehose reconnected");
                    self.session.set_status(ConnectionStatus::Connected);
                    return Ok(conn);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "firehose reconnect attempt failed");
                    last_error = e.to_string();
                }
            }
        }
    }

    /// Settle in `Disconnected` and report how the session ended.
    async fn finish(mut self, terminal: Interrupt) {
        self.session.set_status(ConnectionStatus::Disconnected);

        match terminal {
            Interrupt::Disconnect { ack, .. } => {
                info!("firehose disconnected");
                let _ = ack.send(());
            }
            Interrupt::Fatal(e) => {
                error!(error = %e, "firehose stream failed");
                // Don't block a caller that is disconnecting instead of reading.
                tokio::select! {
                    biased;

                    _ = self.events.send(StreamEvent::Fatal(e)) => {}

                    command = self.commands.recv() => {
                        if let Some(
                            Command::Disconnect { ack, .. } | Command::Reconnect { ack },
                        ) = command
                        {
                            let _ = ack.send(());
                        }
                    }
                }
            }
            Interrupt::Shutdown | Interrupt::Dropped(_) | Interrupt::Reconnect(_) => {
                info!("firehose client shutting down");
            }
        }
    }
}

async fn receive<C: Connection>(
    conn: &mut C,
    read_timeout: Option<Duration>,
) -> Result<Inbound, FirehoseError> {
    match read_timeout {
        Some(limit) => tokio::time::timeout(limit, conn.recv())
            .await
            .map_err(|_| {
                warn!(
                    "firehose read timeout after {}s - connection may be stale",
                    limit.as_secs()
                );
                FirehoseError::WebSocket("read timeout".to_string())
            })?,
        None => conn.recv().await,
    }
}

async fn close_quietly<C: Connection>(conn: &mut C, code: u16, reason: &str) {
    if let Err(e) = conn.close(code, reason).await {
        debug!(error = %e, "error closing firehose connection");
    }
}

fn describe_close(frame: Option<&CloseReason>) -> String {
    match frame {
        Some(close) if close.reason.is_empty() => format!("connection closed ({})", close.code),
        Some(close) => format!("connection closed ({}): {}", close.code, close.reason),
        None => "connection closed".to_string(),
    }
}
