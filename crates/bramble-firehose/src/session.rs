//! Stream session state shared between the receive loop and callers.
//!
//! The receive loop is the only writer. Callers get lock-free reads.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};

use tracing::debug;

/// Connection status of a firehose session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionStatus {
    /// Not connected. Initial state, and terminal after disconnect or a fatal error.
    Disconnected = 0,
    /// Initial handshake in progress.
    Connecting = 1,
    /// Receiving frames.
    Connected = 2,
    /// Transport dropped; waiting to resume from the last good sequence.
    Reconnecting = 3,
}

impl From<u8> for ConnectionStatus {
    fn from(v: u8) -> Self {
        match v {
            1 => ConnectionStatus::Connecting,
            2 => ConnectionStatus::Connected,
            3 => ConnectionStatus::Reconnecting,
            _ => ConnectionStatus::Disconnected,
        }
    }
}

/// Point-in-time copy of [`SessionState`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub relay_url: String,
    pub endpoint: String,
    pub cursor: Option<i64>,
    pub last_good_sequence: Option<i64>,
    pub status: ConnectionStatus,
}

/// State of one logical stream.
#[derive(Debug)]
pub struct SessionState {
    relay_url: String,
    endpoint: String,
    status: AtomicU8,
    /// Cursor sent on the most recent (re)connect.
    cursor: OptionalSequence,
    /// Last sequence accepted by the tracker.
    last_good_sequence: OptionalSequence,
}

impl SessionState {
    pub(crate) fn new(relay_url: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            endpoint: endpoint.into(),
            status: AtomicU8::new(ConnectionStatus::Disconnected as u8),
            cursor: OptionalSequence::default(),
            last_good_sequence: OptionalSequence::default(),
        }
    }

    pub fn relay_url(&self) -> &str {
        &self.relay_url
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus::from(self.status.load(Ordering::SeqCst))
    }

    pub fn cursor(&self) -> Option<i64> {
        self.cursor.load()
    }

    pub fn last_good_sequence(&self) -> Option<i64> {
        self.last_good_sequence.load()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            relay_url: self.relay_url.clone(),
            endpoint: self.endpoint.clone(),
            cursor: self.cursor(),
            last_good_sequence: self.last_good_sequence(),
            status: self.status(),
        }
    }

    pub(crate) fn set_status(&self, status: ConnectionStatus) {
        let previous = ConnectionStatus::from(self.status.swap(status as u8, Ordering::SeqCst));
        if previous != status {
            debug!(from = ?previous, to = ?status, "firehose status changed");
        }
    }

    pub(crate) fn set_cursor(&self, cursor: Option<i64>) {
        self.cursor.store(cursor);
    }

    pub(crate) fn record_sequence(&self, sequence: i64) {
        self.last_good_sequence.store(Some(sequence));
    }

    /// Start a new session: caller-supplied cursor, no progress yet.
    pub(crate) fn begin(&self, cursor: Option<i64>) {
        self.set_cursor(cursor);
        self.last_good_sequence.store(None);
    }
}

/// An `Option<i64>` in atomics. Every i64 is a valid sequence, so presence
/// gets its own flag.
#[derive(Debug, Default)]
struct OptionalSequence {
    set: AtomicBool,
    value: AtomicI64,
}

impl OptionalSequence {
    fn load(&self) -> Option<i64> {
        self.set
            .load(Ordering::SeqCst)
            .then(|| self.value.load(Ordering::SeqCst))
    }

    /// Single writer: the value lands before the flag that publishes it.
    fn store(&self, value: Option<i64>) {
        match value {
            Some(v) => {
                self.value.store(v, Ordering::SeqCst);
                self.set.store(true, Ordering::SeqCst);
            }
            None => self.set.store(false, Ordering::SeqCst),
        }
    }
}
