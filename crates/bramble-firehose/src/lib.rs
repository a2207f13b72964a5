//! ATProto firehose consumer.
//!
//! This crate subscribes to a relay's repository event stream
//! (`com.atproto.sync.subscribeRepos`), decodes its DAG-CBOR frames and keeps
//! a resumable cursor across dropped connections.
//!
//! ## Features
//!
//! - **Frames**: header and payload decoding for every repo event variant
//! - **Sequence tracking**: monotonic cursor with non-fatal violation reports
//! - **Client**: connection state machine with bounded, backed-off gap recovery
//! - **CAR**: record lookup in commit diffs
//! - **Relay discovery**: PDS firehose URLs from DID documents

pub mod car;
mod config;
mod error;
pub mod event;
mod firehose;
pub mod frame;
mod recovery;
pub mod relay;
mod sequence;
mod session;
pub mod transport;

pub use car::{CarBlocks, RecordBlock, read_blocks, record_to_json};
pub use config::{
    DEFAULT_EVENT_BUFFER, DEFAULT_MAX_RETRIES, DEFAULT_RELAY_URL, FirehoseConfig, SUBSCRIBE_REPOS,
};
pub use error::{DecodeError, FirehoseError, NonMonotonicSequence};
pub use event::{
    Account, Commit, ErrorFrame, Handle, Identity, Info, InfoName, Migrate, RepoAction, RepoEvent,
    RepoOp, Tombstone,
};
pub use firehose::{EventStream, FirehoseClient, StreamEvent};
pub use frame::{FrameHeader, FrameKind, decode_frame, decode_header, encode_frame};
pub use recovery::{GapRecovery, RecoveryPlan};
pub use relay::{DidResolver, firehose_url_for_pds, resolve_firehose_url};
pub use sequence::{SequenceTracker, SequenceVerdict};
pub use session::{ConnectionStatus, SessionSnapshot, SessionState};
pub use transport::{Connection, Transport, WebSocketTransport};
