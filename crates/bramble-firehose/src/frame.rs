//! Wire framing for the repository event stream.
//!
//! Each binary WebSocket message is two concatenated DAG-CBOR values: a
//! `{op, t}` header followed by the payload selected by `t`.

use std::io::Cursor;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{DecodeError, FirehoseError};
use crate::event::{
    Account, Commit, ErrorFrame, Handle, Identity, Info, Migrate, RepoEvent, Tombstone,
};

pub const COMMIT: &str = "#commit";
pub const IDENTITY: &str = "#identity";
pub const HANDLE: &str = "#handle";
pub const MIGRATE: &str = "#migrate";
pub const TOMBSTONE: &str = "#tombstone";
pub const ACCOUNT: &str = "#account";
pub const INFO: &str = "#info";

/// Label used in decode errors for `op = -1` payloads, which carry no `t`.
const ERROR_LABEL: &str = "#error";

/// Firehose frame header (first CBOR value in each message).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameHeader {
    /// Operation: 1 = message, -1 = error
    #[serde(deserialize_with = "deserialize_op")]
    pub op: i64,
    /// Message type (e.g., "#commit", "#identity")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

/// CBOR integers reach beyond i64. Clamp those to the i64 bounds, which are
/// never valid ops, so the frame is discarded instead of rejected.
fn deserialize_op<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    let op = i128::deserialize(deserializer)?;
    Ok(op.clamp(i64::MIN.into(), i64::MAX.into()) as i64)
}

/// What a header tells the caller to do with the rest of the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// `op = 1`: decode the payload selected by `t`.
    Message,
    /// `op = -1`: the payload is an [`ErrorFrame`].
    Error,
    /// Any other `op`: discard the frame without reporting anything.
    Unrecognized,
}

impl FrameHeader {
    pub const OP_MESSAGE: i64 = 1;
    pub const OP_ERROR: i64 = -1;

    /// Header for a regular message of type `t`.
    pub fn message(t: impl Into<String>) -> Self {
        Self {
            op: Self::OP_MESSAGE,
            t: Some(t.into()),
        }
    }

    /// Header for an error frame.
    pub fn error() -> Self {
        Self {
            op: Self::OP_ERROR,
            t: None,
        }
    }

    pub fn kind(&self) -> FrameKind {
        match self.op {
            Self::OP_MESSAGE => FrameKind::Message,
            Self::OP_ERROR => FrameKind::Error,
            _ => FrameKind::Unrecognized,
        }
    }
}

/// Decode the frame header and return it along with the offset to the payload.
pub fn decode_header(data: &[u8]) -> Result<(FrameHeader, usize), DecodeError> {
    // We need to find where the header CBOR ends and payload begins.
    // Use ciborium which properly handles partial reads from a cursor.
    let mut cursor = Cursor::new(data);
    let header: FrameHeader = ciborium::from_reader(&mut cursor)
        .map_err(|e| DecodeError::MalformedHeader(e.to_string()))?;
    let offset = cursor.position() as usize;
    Ok((header, offset))
}

/// Decode one wire frame.
///
/// Returns `Ok(None)` for frames whose `op` is neither 1 nor -1; those are
/// dropped without error so that newer relays can add frame kinds.
pub fn decode_frame(data: &[u8]) -> Result<Option<RepoEvent>, DecodeError> {
    let (header, offset) = decode_header(data)?;
    let payload = &data[offset..];

    let t = match header.kind() {
        FrameKind::Unrecognized => return Ok(None),
        FrameKind::Error => {
            let error: ErrorFrame = decode_payload(ERROR_LABEL, payload)?;
            return Ok(Some(RepoEvent::Error(error)));
        }
        FrameKind::Message => header.t.as_deref().ok_or_else(|| {
            DecodeError::MalformedHeader("message frame without type".to_string())
        })?,
    };

    let event = match t {
        COMMIT => {
            let commit: Commit = decode_payload(t, payload)?;
            if let Some(op) = commit.ops.iter().find(|op| !op.is_well_formed()) {
                return Err(DecodeError::Payload {
                    message_type: t.to_string(),
                    reason: format!("{:?} op on {} has mismatched cid", op.action, op.path),
                });
            }
            RepoEvent::Commit(commit)
        }
        IDENTITY => RepoEvent::Identity(decode_payload::<Identity>(t, payload)?),
        HANDLE => RepoEvent::Handle(decode_payload::<Handle>(t, payload)?),
        MIGRATE => RepoEvent::Migrate(decode_payload::<Migrate>(t, payload)?),
        TOMBSTONE => RepoEvent::Tombstone(decode_payload::<Tombstone>(t, payload)?),
        ACCOUNT => RepoEvent::Account(decode_payload::<Account>(t, payload)?),
        INFO => RepoEvent::Info(decode_payload::<Info>(t, payload)?),
        other => return Err(DecodeError::UnrecognizedMessageType(other.to_string())),
    };

    Ok(Some(event))
}

fn decode_payload<T: DeserializeOwned>(
    message_type: &str,
    payload: &[u8],
) -> Result<T, DecodeError> {
    serde_ipld_dagcbor::from_slice(payload).map_err(|e| DecodeError::Payload {
        message_type: message_type.to_string(),
        reason: e.to_string(),
    })
}

/// Encode an event as a wire frame. Inverse of [`decode_frame`].
pub fn encode_frame(event: &RepoEvent) -> Result<Vec<u8>, FirehoseError> {
    match event {
        RepoEvent::Commit(e) => encode_frame_parts(&FrameHeader::message(COMMIT), e),
        RepoEvent::Identity(e) => encode_frame_parts(&FrameHeader::message(IDENTITY), e),
        RepoEvent::Handle(e) => encode_frame_parts(&FrameHeader::message(HANDLE), e),
        RepoEvent::Migrate(e) => encode_frame_parts(&FrameHeader::message(MIGRATE), e),
        RepoEvent::Tombstone(e) => encode_frame_parts(&FrameHeader::message(TOMBSTONE), e),
        RepoEvent::Account(e) => encode_frame_parts(&FrameHeader::message(ACCOUNT), e),
        RepoEvent::Info(e) => encode_frame_parts(&FrameHeader::message(INFO), e),
        RepoEvent::Error(e) => encode_frame_parts(&FrameHeader::error(), e),
    }
}

/// Encode an arbitrary header and payload as a frame.
pub fn encode_frame_parts<T: Serialize>(
    header: &FrameHeader,
    payload: &T,
) -> Result<Vec<u8>, FirehoseError> {
    let mut data = serde_ipld_dagcbor::to_vec(header)
        .map_err(|e| FirehoseError::CborEncode(format!("failed to encode frame header: {}", e)))?;
    let body = serde_ipld_dagcbor::to_vec(payload)
        .map_err(|e| FirehoseError::CborEncode(format!("failed to encode frame payload: {}", e)))?;
    data.extend(body);
    Ok(data)
}
