//! JSON drop-directory feed.
//!
//! Scrapers write one file per scrape pass: a JSON array of
//! [`RawObservation`]s. Each poll reads every `*.json` file in the directory
//! and renames it to `*.json.done` once parsed, so a file is ingested once.
//! Files that fail to parse are renamed to `*.json.failed` and skipped.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{error, info};

use crate::models::RawObservation;
use crate::traits::ObservationFeed;

pub struct JsonDirFeed {
    name: String,
    dir: PathBuf,
}

impl JsonDirFeed {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            name: format!("json-dir:{}", dir.display()),
            dir,
        }
    }

    async fn pending_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("Failed to read feed directory {}", self.dir.display()))?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") && entry.file_type().await?.is_file() {
                files.push(path);
            }
        }

        // Oldest name first; scrapers name files by timestamp
        files.sort();
        Ok(files)
    }
}

async fn mark(path: &Path, suffix: &str) {
    let mut target = path.as_os_str().to_owned();
    target.push(suffix);
    if let Err(e) = tokio::fs::rename(path, &target).await {
        // Left in place; the next poll reads it again and the ledger skips the replay
        error!("Failed to rename {}: {}", path.display(), e);
    }
}

async fn read_batch(path: &Path) -> Result<Vec<RawObservation>> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("Failed to parse {}", path.display()))
}

#[async_trait]
impl ObservationFeed for JsonDirFeed {
    fn name(&self) -> &str {
        &self.name
    }

    /// Files are marked only after every pending file has been read, so a
    /// bad file never costs the observations of the good ones.
    async fn poll(&self) -> Result<Vec<RawObservation>> {
        if !tokio::fs::try_exists(&self.dir).await? {
            info!("Creating feed directory {}", self.dir.display());
            tokio::fs::create_dir_all(&self.dir).await?;
            return Ok(Vec::new());
        }

        let mut observations = Vec::new();
        let mut done = Vec::new();
        let mut failed = Vec::new();

        for path in self.pending_files().await? {
            match read_batch(&path).await {
                Ok(batch) => {
                    info!("Read {} observations from {}", batch.len(), path.display());
                    observations.extend(batch);
                    done.push(path);
                }
                Err(e) => {
                    error!("Setting aside feed file {}: {:#}", path.display(), e);
                    failed.push(path);
                }
            }
        }

        for path in &done {
            mark(path, ".done").await;
        }
        for path in &failed {
            mark(path, ".failed").await;
        }

        Ok(observations)
    }
}
