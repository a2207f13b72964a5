//! Relay discovery helpers.
//!
//! A PDS firehose only emits commits for accounts hosted on that PDS, so
//! consumers interested in one account can avoid the full-network relay.

use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::FirehoseError;

/// Public PLC directory used to resolve `did:plc:` documents.
pub const DEFAULT_PLC_DIRECTORY: &str = "https://plc.directory";

const PDS_SERVICE_TYPE: &str = "AtprotoPersonalDataServer";

/// Derive a firehose WebSocket URL from a PDS HTTP URL.
///
/// Converts `https://pds.example.com` to `wss://pds.example.com`.
/// URLs that are already `ws(s)://` are returned unchanged.
pub fn firehose_url_for_pds(pds_url: &str) -> String {
    if let Some(rest) = pds_url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = pds_url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        pds_url.to_string()
    }
}

/// Location of the DID document for `did`.
///
/// Supports `did:plc:` (via the PLC directory) and `did:web:` (via .well-known).
pub fn did_document_url(did: &str, plc_directory: &str) -> Option<String> {
    if did.starts_with("did:plc:") {
        Some(format!("{}/{}", plc_directory.trim_end_matches('/'), did))
    } else {
        let domain = did.strip_prefix("did:web:")?;
        if domain.is_empty() {
            return None;
        }
        Some(format!("https://{}/.well-known/did.json", domain))
    }
}

#[derive(Debug, Deserialize)]
struct DidDocument {
    #[serde(default)]
    service: Vec<DidService>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DidService {
    #[serde(rename = "type")]
    kind: String,
    service_endpoint: serde_json::Value,
}

/// Looks up the PDS hosting an account from its DID document.
#[derive(Debug, Clone)]
pub struct DidResolver {
    http: reqwest::Client,
    plc_directory: String,
}

impl DidResolver {
    pub fn new() -> Result<Self, FirehoseError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            plc_directory: DEFAULT_PLC_DIRECTORY.to_string(),
        })
    }

    /// Use a different PLC directory.
    pub fn with_plc_directory(mut self, url: impl Into<String>) -> Self {
        self.plc_directory = url.into();
        self
    }

    /// Resolve the PDS service endpoint from a DID document.
    ///
    /// Returns `Ok(None)` for unsupported DID methods and for documents
    /// without an `AtprotoPersonalDataServer` service.
    pub async fn resolve_pds(&self, did: &str) -> Result<Option<String>, FirehoseError> {
        let Some(doc_url) = did_document_url(did, &self.plc_directory) else {
            return Ok(None);
        };

        debug!(did = %did, url = %doc_url, "fetching DID document");
        let doc: DidDocument = self
            .http
            .get(&doc_url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(doc
            .service
            .into_iter()
            .find(|s| s.kind == PDS_SERVICE_TYPE)
            .and_then(|s| s.service_endpoint.as_str().map(|e| e.trim_end_matches('/').to_string())))
    }

    /// Resolve the firehose URL for a DID, falling back to converting
    /// `fallback_pds_url` if DID resolution fails.
    pub async fn resolve_firehose_url(&self, did: &str, fallback_pds_url: &str) -> String {
        match self.resolve_pds(did).await {
            Ok(Some(pds_url)) => {
                let url = firehose_url_for_pds(&pds_url);
                info!(
                    did = %did,
                    pds = %pds_url,
                    firehose = %url,
                    "resolved PDS firehose from DID document"
                );
                url
            }
            Ok(None) => {
                let url = firehose_url_for_pds(fallback_pds_url);
                warn!(did = %did, fallback = %url, "DID document has no PDS service, falling back");
                url
            }
            Err(e) => {
                let url = firehose_url_for_pds(fallback_pds_url);
                warn!(
                    did = %did,
                    fallback = %url,
                    error = %e,
                    "failed to resolve PDS from DID document, falling back"
                );
                url
            }
        }
    }
}

/// Resolve the firehose URL for a DID using the public PLC directory.
pub async fn resolve_firehose_url(did: &str, fallback_pds_url: &str) -> String {
    match DidResolver::new() {
        Ok(resolver) => resolver.resolve_firehose_url(did, fallback_pds_url).await,
        Err(e) => {
            warn!(error = %e, "failed to build HTTP client for DID resolution");
            firehose_url_for_pds(fallback_pds_url)
        }
    }
}
