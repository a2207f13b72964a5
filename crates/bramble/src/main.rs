//! Bramble: ATProto firehose tail
//!
//! Main binary with subcommands:
//! - `tail`: Stream repository events from a relay or PDS
//! - `resolve`: Print the firehose URL of the PDS hosting a DID

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cursor;
mod tail;

#[derive(Parser)]
#[command(name = "bramble")]
#[command(about = "ATProto firehose consumer", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream repository events and print one line per event
    Tail {
        /// Relay or PDS URL (http(s) URLs are converted to ws(s))
        #[arg(long, env = "BRAMBLE_RELAY_URL", default_value = bramble_firehose::DEFAULT_RELAY_URL)]
        relay: String,

        /// Sequence to resume after. Overrides the cursor file.
        #[arg(long)]
        cursor: Option<i64>,

        /// File holding the last processed sequence, read on start and
        /// updated while streaming
        #[arg(long, env = "BRAMBLE_CURSOR_FILE")]
        cursor_file: Option<PathBuf>,

        /// Only print events about this DID
        #[arg(long)]
        did: Option<String>,

        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Summary)]
        format: OutputFormat,

        /// Decode record blocks of commits
        #[arg(long)]
        records: bool,

        /// Reconnection attempts per outage before giving up
        #[arg(long, default_value_t = bramble_firehose::DEFAULT_MAX_RETRIES)]
        max_retries: u32,

        /// Treat the connection as dropped after this many seconds without data
        #[arg(long)]
        read_timeout: Option<u64>,
    },

    /// Resolve the firehose URL for a DID from its DID document
    Resolve {
        /// Account DID (did:plc or did:web)
        did: String,

        /// PDS URL to fall back to when resolution fails
        #[arg(long, default_value = "https://bsky.social")]
        fallback: String,

        /// PLC directory for did:plc lookups
        #[arg(
            long,
            env = "BRAMBLE_PLC_DIRECTORY",
            default_value = bramble_firehose::relay::DEFAULT_PLC_DIRECTORY
        )]
        plc_directory: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// One human-readable line per event
    Summary,
    /// One JSON object per event
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "bramble=info,bramble_firehose=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Tail {
            relay,
            cursor,
            cursor_file,
            did,
            format,
            records,
            max_retries,
            read_timeout,
        } => {
            tail::run(tail::TailOptions {
                relay,
                cursor,
                cursor_file,
                did,
                format,
                records,
                max_retries,
                read_timeout: read_timeout.map(std::time::Duration::from_secs),
            })
            .await
        }

        Commands::Resolve {
            did,
            fallback,
            plc_directory,
        } => {
            let resolver = bramble_firehose::DidResolver::new()
                .map_err(|e| miette::miette!("failed to create HTTP client: {}", e))?
                .with_plc_directory(plc_directory);
            println!("{}", resolver.resolve_firehose_url(&did, &fallback).await);
            Ok(())
        }
    }
}
