//! CAR block access for commit diffs.
//!
//! A `#commit` frame carries its changed blocks as a CAR v1 slice. The
//! client hands those bytes through untouched; these helpers read them when
//! a consumer wants the actual records.

use std::collections::HashMap;
use std::io::Cursor;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ipld_core::cid::Cid;
use ipld_core::ipld::Ipld;
use iroh_car::CarReader;
use serde_json::{Map, Value, json};
use tracing::trace;

use crate::error::FirehoseError;
use crate::event::{Commit, RepoAction};

/// Blocks read from a CAR slice.
#[derive(Debug, Default)]
pub struct CarBlocks {
    pub roots: Vec<Cid>,
    pub blocks: HashMap<Cid, Vec<u8>>,
}

impl CarBlocks {
    pub fn get(&self, cid: &Cid) -> Option<&[u8]> {
        self.blocks.get(cid).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// Read every block in a CAR v1 slice.
pub async fn read_blocks(data: &[u8]) -> Result<CarBlocks, FirehoseError> {
    let mut reader = CarReader::new(Cursor::new(data))
        .await
        .map_err(|e| FirehoseError::CarParse(format!("failed to read CAR header: {}", e)))?;

    let roots = reader.header().roots().to_vec();
    let mut blocks = HashMap::new();

    loop {
        match reader.next_block().await {
            Ok(Some((cid, data))) => {
                blocks.insert(cid, data);
            }
            Ok(None) => break,
            Err(e) => {
                return Err(FirehoseError::CarParse(format!(
                    "failed to read block: {}",
                    e
                )));
            }
        }
    }

    trace!(roots = roots.len(), blocks = blocks.len(), "read CAR blocks");
    Ok(CarBlocks { roots, blocks })
}

/// Decode a DAG-CBOR block into its IPLD data model.
pub fn decode_block(data: &[u8]) -> Result<Ipld, FirehoseError> {
    serde_ipld_dagcbor::from_slice(data).map_err(|e| FirehoseError::CborDecode(e.to_string()))
}

/// A record mutation with its block resolved from the commit diff.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordBlock {
    pub action: RepoAction,
    pub collection: String,
    pub rkey: String,
    pub cid: Option<Cid>,
    /// Decoded record; `None` for deletes and when the diff does not carry
    /// the block (e.g. `tooBig` commits).
    pub record: Option<Ipld>,
}

impl Commit {
    /// Resolve each op's record from `blocks`, in op order.
    ///
    /// Ops with a malformed path are skipped.
    pub async fn record_blocks(&self) -> Result<Vec<RecordBlock>, FirehoseError> {
        let blocks = if self.blocks.is_empty() {
            CarBlocks::default()
        } else {
            read_blocks(&self.blocks).await?
        };

        let mut records = Vec::with_capacity(self.ops.len());
        for op in &self.ops {
            let Some((collection, rkey)) = op.collection_and_rkey() else {
                trace!(path = %op.path, "malformed record path, skipping");
                continue;
            };

            let record = match (op.action, op.cid.as_ref()) {
                (RepoAction::Delete, _) | (_, None) => None,
                (_, Some(cid)) => blocks.get(cid).map(decode_block).transpose()?,
            };

            records.push(RecordBlock {
                action: op.action,
                collection: collection.to_string(),
                rkey: rkey.to_string(),
                cid: op.cid,
                record,
            });
        }

        Ok(records)
    }
}

/// Render an IPLD record as ATProto JSON.
///
/// Links become `{"$link": cid}` and bytes become `{"$bytes": base64}`.
pub fn record_to_json(ipld: &Ipld) -> Value {
    match ipld {
        Ipld::Null => Value::Null,
        Ipld::Bool(b) => Value::Bool(*b),
        Ipld::Integer(i) => match i64::try_from(*i) {
            Ok(n) => json!(n),
            // Outside JSON's safe range either way; keep the digits.
            Err(_) => Value::String(i.to_string()),
        },
        Ipld::Float(f) => json!(f),
        Ipld::String(s) => Value::String(s.clone()),
        Ipld::Bytes(bytes) => json!({ "$bytes": STANDARD.encode(bytes) }),
        Ipld::List(items) => Value::Array(items.iter().map(record_to_json).collect()),
        Ipld::Map(entries) => Value::Object(
            entries
                .iter()
                .map(|(k, v)| (k.clone(), record_to_json(v)))
                .collect::<Map<String, Value>>(),
        ),
        Ipld::Link(cid) => json!({ "$link": cid.to_string() }),
    }
}
