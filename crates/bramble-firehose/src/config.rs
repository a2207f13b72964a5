//! Firehose client configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::FirehoseError;
use crate::relay::firehose_url_for_pds;

/// Default firehose URL (Bluesky relay).
pub const DEFAULT_RELAY_URL: &str = "wss://bsky.network";

/// NSID of the repository event stream.
pub const SUBSCRIBE_REPOS: &str = "com.atproto.sync.subscribeRepos";

/// Channel buffer size between the receive loop and the consumer.
/// Large enough to absorb processing bursts without stalling the reader.
pub const DEFAULT_EVENT_BUFFER: usize = 1000;

/// Reconnection attempts per outage before giving up.
pub const DEFAULT_MAX_RETRIES: u32 = 10;

/// Configuration for a [`FirehoseClient`](crate::FirehoseClient).
///
/// ```
/// use std::time::Duration;
/// use bramble_firehose::FirehoseConfig;
///
/// let config = FirehoseConfig::new("wss://relay.example.com")
///     .with_max_retries(3)
///     .with_backoff(Duration::from_millis(500), Duration::from_secs(10));
///
/// assert_eq!(
///     config.subscribe_url(Some(42)).unwrap(),
///     "wss://relay.example.com/xrpc/com.atproto.sync.subscribeRepos?cursor=42"
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FirehoseConfig {
    /// Relay or PDS base URL. `http(s)://` is accepted and converted to `ws(s)://`.
    pub relay_url: String,
    /// Stream endpoint NSID.
    pub endpoint: String,
    /// Consecutive failed reconnection attempts tolerated per outage.
    pub max_retries: u32,
    /// First backoff delay.
    pub initial_backoff: Duration,
    /// Upper bound on a single backoff delay.
    pub max_backoff: Duration,
    /// Growth factor between consecutive delays.
    pub backoff_multiplier: f64,
    /// Jitter as a fraction of the delay (0.0 disables jitter).
    pub randomization_factor: f64,
    /// Capacity of the event channel handed to the consumer.
    pub event_buffer: usize,
    /// Treat a connection that delivers nothing for this long as dropped.
    /// `None` leaves liveness detection to the transport.
    pub read_timeout: Option<Duration>,
}

impl Default for FirehoseConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            endpoint: SUBSCRIBE_REPOS.to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            randomization_factor: 0.5,
            event_buffer: DEFAULT_EVENT_BUFFER,
            read_timeout: None,
        }
    }
}

impl FirehoseConfig {
    /// Configuration for the given relay with default settings.
    pub fn new(relay_url: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            ..Default::default()
        }
    }

    /// Subscribe to a different stream endpoint (e.g. `com.atproto.label.subscribeLabels`).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_randomization_factor(mut self, factor: f64) -> Self {
        self.randomization_factor = factor;
        self
    }

    pub fn with_event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Build the subscription URL, with `cursor` as a query parameter when set.
    ///
    /// A cursor of `0` is sent as-is: the relay interprets it as "oldest
    /// retained event", same as no cursor.
    pub fn subscribe_url(&self, cursor: Option<i64>) -> Result<String, FirehoseError> {
        let base = firehose_url_for_pds(self.relay_url.trim_end_matches('/'));
        if !(base.starts_with("wss://") || base.starts_with("ws://")) {
            return Err(FirehoseError::InvalidRelayUrl(self.relay_url.clone()));
        }
        if base.contains('?') {
            return Err(FirehoseError::InvalidRelayUrl(format!(
                "{} (query parameters are not allowed)",
                self.relay_url
            )));
        }

        let mut url = format!("{}/xrpc/{}", base, self.endpoint);
        if let Some(cursor) = cursor {
            url.push_str("?cursor=");
            url.push_str(&cursor.to_string());
        }
        Ok(url)
    }
}
