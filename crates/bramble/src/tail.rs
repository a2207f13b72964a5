//! `bramble tail`: print repository events as they arrive.

use std::path::PathBuf;
use std::time::Duration;

use bramble_firehose::transport::NORMAL_CLOSURE;
use bramble_firehose::{
    FirehoseClient, FirehoseConfig, RecordBlock, RepoAction, RepoEvent, SequenceVerdict,
    StreamEvent, record_to_json,
};
use miette::Result;
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use crate::OutputFormat;
use crate::cursor::CursorFile;

/// Persist the cursor after this many processed events.
const SAVE_EVERY: u64 = 500;

pub struct TailOptions {
    pub relay: String,
    pub cursor: Option<i64>,
    pub cursor_file: Option<PathBuf>,
    pub did: Option<String>,
    pub format: OutputFormat,
    pub records: bool,
    pub max_retries: u32,
    pub read_timeout: Option<Duration>,
}

pub async fn run(opts: TailOptions) -> Result<()> {
    let cursor_file = opts.cursor_file.map(CursorFile::new);
    let cursor = match (opts.cursor, &cursor_file) {
        (Some(cursor), _) => Some(cursor),
        (None, Some(file)) => {
            let cursor = file.load().await?;
            info!(path = %file.path().display(), cursor = ?cursor, "resuming from cursor file");
            cursor
        }
        (None, None) => None,
    };

    let mut config = FirehoseConfig::new(opts.relay).with_max_retries(opts.max_retries);
    if let Some(timeout) = opts.read_timeout {
        config = config.with_read_timeout(timeout);
    }

    let client = FirehoseClient::new(config);
    let mut stream = client
        .connect(cursor)
        .await
        .map_err(|e| miette::miette!("failed to connect to firehose: {}", e))?;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut processed: Option<i64> = None;
    let mut unsaved = 0u64;
    let mut outcome = Ok(());

    loop {
        let item = tokio::select! {
            _ = &mut shutdown => {
                info!("received shutdown signal");
                client.disconnect(NORMAL_CLOSURE, "shutdown").await;
                break;
            }
            item = stream.recv() => item,
        };

        match item {
            Some(StreamEvent::Event { event, verdict }) => {
                if matches!(verdict, Some(SequenceVerdict::Accepted)) {
                    processed = event.sequence();
                    unsaved += 1;
                }
                if matches_did(&event, opts.did.as_deref()) {
                    let records = if opts.records {
                        decode_records(&event).await
                    } else {
                        Vec::new()
                    };
                    print_event(&event, verdict.as_ref(), &records, opts.format);
                }
            }
            Some(StreamEvent::DecodeFailed(e)) => {
                warn!(error = %e, "skipping undecodable frame");
            }
            Some(StreamEvent::Fatal(e)) => {
                error!(error = %e, "firehose stream ended");
                outcome = Err(miette::miette!("firehose stream ended: {}", e));
            }
            None => break,
        }

        if unsaved >= SAVE_EVERY {
            save_cursor(cursor_file.as_ref(), processed).await;
            unsaved = 0;
        }
    }

    save_cursor(cursor_file.as_ref(), processed).await;
    info!(last_processed = ?processed, "tail finished");
    outcome
}

async fn save_cursor(file: Option<&CursorFile>, processed: Option<i64>) {
    let (Some(file), Some(seq)) = (file, processed) else {
        return;
    };
    match file.store(seq).await {
        Ok(()) => debug!(seq, "saved cursor"),
        Err(e) => warn!(error = %e, "failed to save cursor"),
    }
}

async fn decode_records(event: &RepoEvent) -> Vec<RecordBlock> {
    let RepoEvent::Commit(commit) = event else {
        return Vec::new();
    };
    match commit.record_blocks().await {
        Ok(records) => records,
        Err(e) => {
            warn!(seq = commit.seq, error = %e, "failed to decode commit blocks");
            Vec::new()
        }
    }
}

/// Events without a DID (info, error) always pass.
fn matches_did(event: &RepoEvent, did: Option<&str>) -> bool {
    match (did, event.did()) {
        (Some(wanted), Some(actual)) => wanted == actual,
        _ => true,
    }
}

fn print_event(
    event: &RepoEvent,
    verdict: Option<&SequenceVerdict>,
    records: &[RecordBlock],
    format: OutputFormat,
) {
    match format {
        OutputFormat::Summary => {
            println!("{}", summary_line(event, verdict));
            if let RepoEvent::Commit(commit) = event {
                for op in &commit.ops {
                    println!("  {} {}", action_name(op.action), op.path);
                }
            }
            for record in records {
                if let Some(value) = &record.record {
                    println!(
                        "  {}/{} {}",
                        record.collection,
                        record.rkey,
                        record_to_json(value)
                    );
                }
            }
        }
        OutputFormat::Json => println!("{}", event_json(event, verdict, records)),
    }
}

fn action_name(action: RepoAction) -> &'static str {
    match action {
        RepoAction::Create => "create",
        RepoAction::Update => "update",
        RepoAction::Delete => "delete",
    }
}

fn summary_line(event: &RepoEvent, verdict: Option<&SequenceVerdict>) -> String {
    let mut line = match event {
        RepoEvent::Commit(e) => format!(
            "#{} commit {} rev={} ops={}{}",
            e.seq,
            e.repo,
            e.rev,
            e.ops.len(),
            if e.too_big { " (too big)" } else { "" }
        ),
        RepoEvent::Identity(e) => format!(
            "#{} identity {} handle={}",
            e.seq,
            e.did,
            e.handle.as_deref().unwrap_or("-")
        ),
        RepoEvent::Handle(e) => format!("#{} handle {} {}", e.seq, e.did, e.handle),
        RepoEvent::Migrate(e) => format!(
            "#{} migrate {} to={}",
            e.seq,
            e.did,
            e.migrate_to.as_deref().unwrap_or("-")
        ),
        RepoEvent::Tombstone(e) => format!("#{} tombstone {}", e.seq, e.did),
        RepoEvent::Account(e) => format!(
            "#{} account {} active={}{}",
            e.seq,
            e.did,
            e.active,
            e.status
                .as_deref()
                .map(|s| format!(" status={}", s))
                .unwrap_or_default()
        ),
        RepoEvent::Info(e) => format!(
            "info {}: {}",
            String::from(e.name.clone()),
            e.message.as_deref().unwrap_or("")
        ),
        RepoEvent::Error(e) => format!(
            "error {}: {}",
            e.error,
            e.message.as_deref().unwrap_or("")
        ),
    };

    if let Some(SequenceVerdict::Rejected(violation)) = verdict {
        line.push_str(&format!(" [out of order, last good #{}]", violation.last_good));
    }
    line
}

fn event_json(
    event: &RepoEvent,
    verdict: Option<&SequenceVerdict>,
    records: &[RecordBlock],
) -> Value {
    let mut value = match event {
        RepoEvent::Commit(e) => json!({
            "repo": e.repo,
            "commit": e.commit.to_string(),
            "rev": e.rev,
            "since": e.since,
            "tooBig": e.too_big,
            "time": e.time.to_rfc3339(),
            "ops": e.ops.iter().map(|op| json!({
                "action": action_name(op.action),
                "path": op.path,
                "cid": op.cid.map(|c| c.to_string()),
            })).collect::<Vec<_>>(),
        }),
        RepoEvent::Identity(e) => json!({
            "did": e.did,
            "handle": e.handle,
            "time": e.time.to_rfc3339(),
        }),
        RepoEvent::Handle(e) => json!({
            "did": e.did,
            "handle": e.handle,
            "time": e.time.to_rfc3339(),
        }),
        RepoEvent::Migrate(e) => json!({
            "did": e.did,
            "migrateTo": e.migrate_to,
            "time": e.time.to_rfc3339(),
        }),
        RepoEvent::Tombstone(e) => json!({
            "did": e.did,
            "time": e.time.to_rfc3339(),
        }),
        RepoEvent::Account(e) => json!({
            "did": e.did,
            "active": e.active,
            "status": e.status,
            "time": e.time.to_rfc3339(),
        }),
        RepoEvent::Info(e) => json!({
            "name": String::from(e.name.clone()),
            "message": e.message,
        }),
        RepoEvent::Error(e) => json!({
            "error": e.error,
            "message": e.message,
        }),
    };

    value["kind"] = json!(event.kind());
    if let Some(seq) = event.sequence() {
        value["seq"] = json!(seq);
    }
    if let Some(SequenceVerdict::Rejected(violation)) = verdict {
        value["outOfOrder"] = json!({ "lastGood": violation.last_good });
    }
    if !records.is_empty() {
        value["records"] = Value::Array(
            records
                .iter()
                .map(|r| {
                    json!({
                        "path": format!("{}/{}", r.collection, r.rkey),
                        "record": r.record.as_ref().map(record_to_json),
                    })
                })
                .collect(),
        );
    }
    value
}
