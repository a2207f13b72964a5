//! Cursor persistence for `tail`.
//!
//! The file holds the last processed sequence as decimal text.

use std::path::{Path, PathBuf};

use miette::Result;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct CursorFile {
    path: PathBuf,
}

impl CursorFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored sequence. A missing file means no cursor; an
    /// unreadable one is logged and ignored.
    pub async fn load(&self) -> Result<Option<i64>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(miette::miette!(
                    "failed to read cursor file {}: {}",
                    self.path.display(),
                    e
                ));
            }
        };

        match contents.trim().parse::<i64>() {
            Ok(seq) => {
                debug!(path = %self.path.display(), seq, "loaded cursor");
                Ok(Some(seq))
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "ignoring malformed cursor file");
                Ok(None)
            }
        }
    }

    /// Replace the stored sequence. Writes a sibling file and renames it
    /// over the old one.
    pub async fn store(&self, seq: i64) -> Result<()> {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, format!("{}\n", seq))
            .await
            .map_err(|e| miette::miette!("failed to write {}: {}", tmp.display(), e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| miette::miette!("failed to replace {}: {}", self.path.display(), e))?;
        Ok(())
    }
}
