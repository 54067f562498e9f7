//! Append-only JSON file of finished sync runs.

use std::path::{Path, PathBuf};

use artisync_core::SyncRun;
use serde_json::Value;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::StoreError;

pub const DEFAULT_HISTORY_RETENTION: usize = 1000;

/// Holds the newest `retention` runs, oldest first. Writers in one process are
/// serialized; each write replaces the file through a temp-file rename.
#[derive(Debug)]
pub struct RunHistoryStore {
    path: PathBuf,
    retention: usize,
    write_lock: Mutex<()>,
}

impl RunHistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            retention: DEFAULT_HISTORY_RETENTION,
            write_lock: Mutex::new(()),
        }
    }

    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All readable runs. A missing or unparseable file reads as empty, and
    /// individual malformed entries are skipped.
    pub async fn load(&self) -> Vec<SyncRun> {
        let raw = match fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "run history unreadable");
                return Vec::new();
            }
        };

        let value: Value = match serde_json::from_slice(&raw) {
            Ok(value) => value,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "run history is not valid json, treating as empty");
                return Vec::new();
            }
        };

        let entries = match value {
            Value::Array(items) => items,
            Value::Object(_) => vec![value],
            _ => Vec::new(),
        };

        let total = entries.len();
        let runs: Vec<SyncRun> = entries
            .into_iter()
            .filter_map(|entry| serde_json::from_value(entry).ok())
            .collect();
        if runs.len() < total {
            warn!(skipped = total - runs.len(), "ignored malformed run history entries");
        }
        runs
    }

    /// Append one run, dropping the oldest entries past retention. Returns the
    /// number of entries now stored.
    pub async fn append(&self, run: &SyncRun) -> Result<usize, StoreError> {
        let _guard = self.write_lock.lock().await;

        let mut runs = self.load().await;
        runs.push(run.clone());
        if runs.len() > self.retention {
            let excess = runs.len() - self.retention;
            runs.drain(..excess);
        }

        let bytes = serde_json::to_vec_pretty(&runs)?;
        self.replace_file(&bytes).await?;
        debug!(session_id = %run.session_id, entries = runs.len(), "run history appended");
        Ok(runs.len())
    }

    async fn replace_file(&self, bytes: &[u8]) -> Result<(), StoreError> {
        let io_err = |source: std::io::Error| StoreError::History {
            path: self.path.clone(),
            source,
        };

        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).await.map_err(io_err)?;

        let temp_path = parent.join(format!(".{}.history.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(io_err)?;
        file.write_all(bytes).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(io_err(err));
        }
        Ok(())
    }
}
