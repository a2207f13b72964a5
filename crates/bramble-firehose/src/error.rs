//! Error types for the firehose client.

use thiserror::Error;

/// Errors that can occur when consuming the firehose.
#[derive(Debug, Error)]
pub enum FirehoseError {
    /// WebSocket transport failed.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// HTTP request failed (DID document resolution).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CBOR encoding error.
    #[error("CBOR encode error: {0}")]
    CborEncode(String),

    /// CBOR decoding error (record blocks).
    #[error("CBOR decode error: {0}")]
    CborDecode(String),

    /// CAR parsing error.
    #[error("CAR parse error: {0}")]
    CarParse(String),

    /// Relay URL could not be used to build a subscription URL.
    #[error("invalid relay URL: {0}")]
    InvalidRelayUrl(String),

    /// The relay rejected the cursor because it is ahead of its latest sequence.
    #[error("cursor {cursor:?} is in the future: {}", message.as_deref().unwrap_or("rejected by relay"))]
    FutureCursor {
        /// Cursor that was sent on connect.
        cursor: Option<i64>,
        /// Message from the relay, if any.
        message: Option<String>,
    },

    /// Reconnection gave up after the configured number of attempts.
    #[error("gave up reconnecting after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        /// Number of failed reconnection attempts.
        attempts: u32,
        /// The error that ended the last attempt.
        last_error: String,
    },

    /// A session is already running on this client.
    #[error("firehose client is already connected")]
    AlreadyConnected,
}

/// Errors decoding a single wire frame.
///
/// These never end the stream; they are delivered to the consumer as
/// [`StreamEvent::DecodeFailed`](crate::StreamEvent::DecodeFailed).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The `{op, t}` header could not be decoded.
    #[error("malformed frame header: {0}")]
    MalformedHeader(String),

    /// A message frame carried a type tag this client does not know.
    #[error("unrecognized message type: {0}")]
    UnrecognizedMessageType(String),

    /// The payload following the header could not be decoded.
    #[error("failed to decode {message_type} payload: {reason}")]
    Payload {
        /// Type tag of the frame (`#commit`, `#error` for op=-1 frames, ...).
        message_type: String,
        /// Decoder error text.
        reason: String,
    },
}

/// A sequence number at or below the last accepted one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("non-monotonic sequence {sequence} (last good sequence is {last_good})")]
pub struct NonMonotonicSequence {
    /// The sequence that was observed.
    pub sequence: i64,
    /// The cursor at the time of the observation.
    pub last_good: i64,
}
