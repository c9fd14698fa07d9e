//! Artifact persistence, paced HTTP fetching and the SQLite knowledge store.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

mod http;
mod knowledge;

pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchedPage,
    HttpClientConfig, HttpFetcher, PacingConfig, RequestPacer, RetryDisposition,
};
pub use knowledge::{KnowledgeStore, StorageError, StoreOutcome, StoreStats};

pub const CRATE_NAME: &str = "jobscope-storage";

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Filesystem home for run reports and captured listing pages.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn page_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        content_hash: &str,
    ) -> PathBuf {
        PathBuf::from("pages")
            .join(fetched_at.format("%Y%m%d").to_string())
            .join(source_id)
            .join(format!("{content_hash}.html"))
    }

    /// Hash-addressed capture of a rendered page; identical markup is stored once.
    pub async fn store_page(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        html: &str,
    ) -> anyhow::Result<StoredArtifact> {
        let bytes = html.as_bytes();
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.page_relative_path(fetched_at, source_id, &content_hash);
        let absolute_path = self.root.join(&relative_path);

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking page capture {}", absolute_path.display()))?
        {
            return Ok(StoredArtifact {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        let deduplicated = write_atomic(&absolute_path, bytes, false).await?;
        Ok(StoredArtifact {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated,
        })
    }

    /// Writes `<root>/<run_id>/<file_name>` via temp file + rename so readers never see a
    /// half-written report.
    pub async fn write_run_file(
        &self,
        run_id: Uuid,
        file_name: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredArtifact> {
        let relative_path = PathBuf::from(run_id.to_string()).join(file_name);
        let absolute_path = self.root.join(&relative_path);
        write_atomic(&absolute_path, bytes, true).await?;
        Ok(StoredArtifact {
            content_hash: Self::sha256_hex(bytes),
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated: false,
        })
    }
}

/// Returns `true` when the target already existed and `replace` was off.
async fn write_atomic(target: &Path, bytes: &[u8], replace: bool) -> anyhow::Result<bool> {
    let parent = target
        .parent()
        .with_context(|| format!("artifact path {} has no parent", target.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating artifact directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp artifact file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp artifact file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp artifact file {}", temp_path.display()))?;
    drop(file);

    if !replace && fs::try_exists(target).await.unwrap_or(false) {
        let _ = fs::remove_file(&temp_path).await;
        return Ok(true);
    }

    match fs::rename(&temp_path, target).await {
        Ok(()) => Ok(false),
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(err).with_context(|| {
                format!(
                    "atomically renaming temp artifact {} -> {}",
                    temp_path.display(),
                    target.display()
                )
            })
        }
    }
}
