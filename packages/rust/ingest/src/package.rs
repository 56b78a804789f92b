//! Per-package ingestion entry point.

use std::time::Instant;

use tracing::{info, instrument, warn};

use tedsync_search::SearchClient;
use tedsync_shared::{IngestConfig, IngestionResult, Package, Result, Shutdown, TedSyncError};

use crate::pool::IngestionPool;

/// Progress callback for package ingestion.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called after each content file has been normalized (or failed to).
    fn file_processed(&self, current: usize, total: usize);
    /// Called once the package is done.
    fn done(&self, result: &IngestionResult);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn file_processed(&self, _current: usize, _total: usize) {}
    fn done(&self, _result: &IngestionResult) {}
}

/// Ingest one package archive into the configured index.
///
/// 1. Extract into a temporary directory (removed on return)
/// 2. Collect the XML content files
/// 3. Ensure the index exists with a wide enough field limit
/// 4. Normalize and bulk load through an [`IngestionPool`]
///
/// Index provisioning failures are logged and loading proceeds anyway.
#[instrument(skip_all, fields(package = %package.local_path.display()))]
pub async fn index_package(
    package: &Package,
    config: &IngestConfig,
    shutdown: &Shutdown,
    progress: &dyn ProgressReporter,
) -> Result<IngestionResult> {
    let start = Instant::now();

    if !package.local_path.is_file() {
        return Err(TedSyncError::validation(format!(
            "package not found: {}",
            package.local_path.display()
        )));
    }

    // --- Extract ---
    progress.phase("Extracting package");
    let workspace = tempfile::Builder::new()
        .prefix("tedsync-")
        .tempdir()
        .map_err(|e| TedSyncError::io(std::env::temp_dir(), e))?;

    let archive = package.local_path.clone();
    let dest = workspace.path().to_path_buf();
    let hint = package.container_format;
    let files = tokio::task::spawn_blocking(move || {
        tedsync_archive::extract_with(&archive, &dest, hint)?;
        tedsync_archive::find_xml_files(&dest)
    })
    .await
    .map_err(|e| TedSyncError::validation(format!("extraction task failed: {e}")))??;

    if files.is_empty() {
        return Err(TedSyncError::validation(format!(
            "no XML files found in {}",
            package.local_path.display()
        )));
    }

    // --- Provision index ---
    progress.phase("Preparing index");
    let client = SearchClient::new(&config.search)?;
    match client
        .ensure_index(&config.search.index, config.search.field_limit)
        .await
    {
        Ok(status) => info!(index = %config.search.index, ?status, "index ready"),
        Err(e) => warn!(index = %config.search.index, error = %e, "could not provision index, loading anyway"),
    }

    // --- Load ---
    progress.phase("Indexing documents");
    let pool = IngestionPool::new(client, config, shutdown.clone());
    let result = pool.run(files, progress).await;

    info!(
        year = ?package.year,
        publication = ?package.publication_id,
        attempted = result.attempted,
        indexed = result.indexed,
        failed = result.failed,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "package ingested"
    );
    progress.done(&result);

    // `workspace` drops here and removes the extracted files
    Ok(result)
}
