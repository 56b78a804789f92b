//! Completion ledger: one `"{year}-{id}"` token per line for every
//! publication that was fully downloaded and indexed.
//!
//! The in-memory set and the append handle sit behind one async mutex, so
//! concurrent publications never interleave writes or miss each other's
//! records.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use tedsync_shared::{Result, TedSyncError};

#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    inner: Mutex<LedgerState>,
}

#[derive(Debug)]
struct LedgerState {
    tokens: HashSet<String>,
    file: File,
}

impl Ledger {
    /// Load the ledger at `path`, creating the file (and its directory) if needed.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| TedSyncError::io(parent, e))?;
        }

        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(TedSyncError::io(path, e)),
        };
        let tokens: HashSet<String> = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect();

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| TedSyncError::io(path, e))?;

        // A crash mid-append can leave the last record without its newline
        if !content.is_empty() && !content.ends_with('\n') {
            file.write_all(b"\n")
                .await
                .map_err(|e| TedSyncError::io(path, e))?;
            file.flush().await.map_err(|e| TedSyncError::io(path, e))?;
        }

        info!(path = %path.display(), entries = tokens.len(), "ledger loaded");
        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(LedgerState { tokens, file }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn contains(&self, token: &str) -> bool {
        self.inner.lock().await.tokens.contains(token)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.tokens.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Durably append `token`. Returns `false` if it was already recorded.
    pub async fn record(&self, token: &str) -> Result<bool> {
        let mut state = self.inner.lock().await;
        if state.tokens.contains(token) {
            return Ok(false);
        }

        let line = format!("{token}\n");
        state
            .file
            .write_all(line.as_bytes())
            .await
            .map_err(|e| TedSyncError::io(&self.path, e))?;
        state
            .file
            .flush()
            .await
            .map_err(|e| TedSyncError::io(&self.path, e))?;
        state
            .file
            .sync_data()
            .await
            .map_err(|e| TedSyncError::io(&self.path, e))?;

        state.tokens.insert(token.to_string());
        debug!(token, "recorded in ledger");
        Ok(true)
    }
}

#[cfg(test)]
impl Ledger {
    /// A ledger over a read-only handle, so every append fails.
    pub(crate) async fn open_read_only(path: &Path) -> Result<Self> {
        tokio::fs::write(path, b"")
            .await
            .map_err(|e| TedSyncError::io(path, e))?;
        let file = File::open(path)
            .await
            .map_err(|e| TedSyncError::io(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(LedgerState {
                tokens: HashSet::new(),
                file,
            }),
        })
    }
}
