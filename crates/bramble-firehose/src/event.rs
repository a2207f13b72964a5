//! Typed payloads carried by `com.atproto.sync.subscribeRepos` frames.
//!
//! Field names follow the lexicon (camelCase on the wire). CIDs are kept as
//! [`Cid`] so that DAG-CBOR links survive an encode/decode round trip.

use chrono::{DateTime, Utc};
use ipld_core::cid::Cid;
use serde::{Deserialize, Serialize};

/// Error name sent by a relay when the requested cursor is ahead of it.
pub const FUTURE_CURSOR: &str = "FutureCursor";

/// Error name sent by a relay before dropping a consumer that fell behind.
pub const CONSUMER_TOO_SLOW: &str = "ConsumerTooSlow";

/// A decoded firehose message.
#[derive(Debug, Clone, PartialEq)]
pub enum RepoEvent {
    /// Update of repository state.
    Commit(Commit),
    /// Change to an account's identity (handle, key or PDS).
    Identity(Identity),
    /// Change to an account's handle.
    Handle(Handle),
    /// Account migrated to another PDS.
    Migrate(Migrate),
    /// Account deleted.
    Tombstone(Tombstone),
    /// Change to an account's hosting status.
    Account(Account),
    /// Informational message from the relay (no sequence).
    Info(Info),
    /// Error frame (`op = -1`, no sequence).
    Error(ErrorFrame),
}

impl RepoEvent {
    /// Sequence number, for every variant except `Info` and `Error`.
    pub fn sequence(&self) -> Option<i64> {
        match self {
            RepoEvent::Commit(e) => Some(e.seq),
            RepoEvent::Identity(e) => Some(e.seq),
            RepoEvent::Handle(e) => Some(e.seq),
            RepoEvent::Migrate(e) => Some(e.seq),
            RepoEvent::Tombstone(e) => Some(e.seq),
            RepoEvent::Account(e) => Some(e.seq),
            RepoEvent::Info(_) | RepoEvent::Error(_) => None,
        }
    }

    /// Account DID the event is about, if any.
    pub fn did(&self) -> Option<&str> {
        match self {
            RepoEvent::Commit(e) => Some(&e.repo),
            RepoEvent::Identity(e) => Some(&e.did),
            RepoEvent::Handle(e) => Some(&e.did),
            RepoEvent::Migrate(e) => Some(&e.did),
            RepoEvent::Tombstone(e) => Some(&e.did),
            RepoEvent::Account(e) => Some(&e.did),
            RepoEvent::Info(_) | RepoEvent::Error(_) => None,
        }
    }

    /// Short name for logs and CLI output.
    pub fn kind(&self) -> &'static str {
        match self {
            RepoEvent::Commit(_) => "commit",
            RepoEvent::Identity(_) => "identity",
            RepoEvent::Handle(_) => "handle",
            RepoEvent::Migrate(_) => "migrate",
            RepoEvent::Tombstone(_) => "tombstone",
            RepoEvent::Account(_) => "account",
            RepoEvent::Info(_) => "info",
            RepoEvent::Error(_) => "error",
        }
    }
}

/// Represents an update of repository state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Commit {
    /// Sequence number.
    pub seq: i64,
    /// DEPRECATED: was used to indicate rebased commits.
    #[serde(default)]
    pub rebase: bool,
    /// The commit diff was too large to include `blocks`.
    #[serde(default)]
    pub too_big: bool,
    /// Repository DID.
    pub repo: String,
    /// Repo commit object CID.
    pub commit: Cid,
    /// Repository revision (TID format).
    pub rev: String,
    /// Revision of the previous commit (null for the first commit).
    #[serde(default)]
    pub since: Option<String>,
    /// CAR-encoded diff. Opaque at this layer; see [`crate::car`].
    #[serde(with = "serde_bytes", default)]
    pub blocks: Vec<u8>,
    /// Record mutations, in commit order.
    #[serde(default)]
    pub ops: Vec<RepoOp>,
    /// DEPRECATED: list of new blobs.
    #[serde(default)]
    pub blobs: Vec<Cid>,
    /// Timestamp of when the message was broadcast.
    pub time: DateTime<Utc>,
    /// Previous MST root CID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_data: Option<Cid>,
}

/// A mutation of a single record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoOp {
    pub action: RepoAction,
    /// `collection/rkey`.
    pub path: String,
    /// Record CID; present iff the action is create or update.
    pub cid: Option<Cid>,
    /// Previous record CID, for updates and deletes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev: Option<Cid>,
}

impl RepoOp {
    /// Split the path into collection and rkey.
    /// Returns None if the path is malformed (empty components).
    pub fn collection_and_rkey(&self) -> Option<(&str, &str)> {
        let mut parts = self.path.split('/');
        let collection = parts.next().filter(|s| !s.is_empty())?;
        let rkey = parts.next().filter(|s| !s.is_empty())?;
        Some((collection, rkey))
    }

    /// Whether `cid` is present exactly when the action needs one.
    pub fn is_well_formed(&self) -> bool {
        match self.action {
            RepoAction::Create | RepoAction::Update => self.cid.is_some(),
            RepoAction::Delete => self.cid.is_none(),
        }
    }
}

/// Kind of record mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoAction {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub seq: i64,
    pub did: String,
    pub time: DateTime<Utc>,
    /// Current handle, if the relay included it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handle {
    pub seq: i64,
    pub did: String,
    pub handle: String,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Migrate {
    pub seq: i64,
    pub did: String,
    #[serde(default)]
    pub migrate_to: Option<String>,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tombstone {
    pub seq: i64,
    pub did: String,
    pub time: DateTime<Utc>,
}

/// Hosting status change. `status` is set when `active` is false
/// (`takendown`, `suspended`, `deleted`, `deactivated`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub seq: i64,
    pub did: String,
    pub time: DateTime<Utc>,
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Informational message. `OutdatedCursor` means the requested cursor fell
/// outside the relay's rollback window and replay starts at its oldest
/// retained event; the consumer has a gap to deal with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Info {
    pub name: InfoName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum InfoName {
    OutdatedCursor,
    Other(String),
}

impl From<String> for InfoName {
    fn from(name: String) -> Self {
        match name.as_str() {
            "OutdatedCursor" => InfoName::OutdatedCursor,
            _ => InfoName::Other(name),
        }
    }
}

impl From<InfoName> for String {
    fn from(name: InfoName) -> Self {
        match name {
            InfoName::OutdatedCursor => "OutdatedCursor".to_string(),
            InfoName::Other(name) => name,
        }
    }
}

/// Error payload from the firehose (op=-1 frames).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFrame {
    /// Error type (e.g., "FutureCursor", "ConsumerTooSlow").
    pub error: String,
    /// Human-readable error message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ErrorFrame {
    pub fn is_future_cursor(&self) -> bool {
        self.error == FUTURE_CURSOR
    }

    pub fn is_consumer_too_slow(&self) -> bool {
        self.error == CONSUMER_TOO_SLOW
    }
}
