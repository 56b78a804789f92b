//! Bounded normalize → batch → load pipeline over the files of one package.
//!
//! At most `workers` files are normalized at once on the blocking pool.
//! Outcomes are batched by a single accumulator, and full batches go to one
//! loader task, so bulk requests overlap normalization but never each other.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, instrument, warn};

use tedsync_search::SearchClient;
use tedsync_shared::{Document, IngestConfig, IngestionResult, Result, Shutdown, TedSyncError};

use crate::batch::BatchAccumulator;
use crate::package::ProgressReporter;

/// Full batches allowed to queue up in front of the loader.
const BATCH_QUEUE_DEPTH: usize = 2;

/// Concurrent ingestion of a list of content files into one index.
#[derive(Debug, Clone)]
pub struct IngestionPool {
    client: SearchClient,
    index: String,
    bulk_size: usize,
    workers: usize,
    shutdown: Shutdown,
}

impl IngestionPool {
    pub fn new(client: SearchClient, config: &IngestConfig, shutdown: Shutdown) -> Self {
        Self {
            client,
            index: config.search.index.clone(),
            bulk_size: config.bulk_size.max(1),
            workers: config.workers.max(1),
            shutdown,
        }
    }

    /// Normalize and load every file in `files`.
    ///
    /// Never fails as a whole: per-file and per-batch problems show up in the
    /// `failed` counter. Files left unscheduled after shutdown count as failed.
    #[instrument(skip_all, fields(index = %self.index, files = files.len(), workers = self.workers))]
    pub async fn run(&self, files: Vec<PathBuf>, progress: &dyn ProgressReporter) -> IngestionResult {
        let attempted = files.len();
        if attempted == 0 {
            return IngestionResult::default();
        }

        let (doc_tx, mut doc_rx) = mpsc::channel::<Result<Document>>(self.workers * 2);
        let (batch_tx, batch_rx) = mpsc::channel::<Vec<Document>>(BATCH_QUEUE_DEPTH);

        let dispatcher = self.spawn_dispatcher(files, doc_tx);
        let loader = self.spawn_loader(batch_rx);

        let mut accumulator = BatchAccumulator::new(self.bulk_size);
        let mut processed = 0usize;
        let mut normalize_failed = 0usize;

        while let Some(outcome) = doc_rx.recv().await {
            processed += 1;
            progress.file_processed(processed, attempted);
            match outcome {
                Ok(doc) => accumulator.add(doc),
                Err(e) => {
                    normalize_failed += 1;
                    warn!(error = %e, "failed to normalize file");
                }
            }
            if let Some(batch) = accumulator.flush_if_full() {
                if batch_tx.send(batch).await.is_err() {
                    warn!("loader stopped early");
                }
            }
        }
        if let Some(rest) = accumulator.drain() {
            if batch_tx.send(rest).await.is_err() {
                warn!("loader stopped early");
            }
        }
        drop(batch_tx);

        let scheduled = match dispatcher.await {
            Ok(scheduled) => scheduled,
            Err(e) => {
                warn!(error = %e, "dispatcher task failed");
                processed
            }
        };
        let indexed = match loader.await {
            Ok(indexed) => indexed,
            Err(e) => {
                warn!(error = %e, "loader task failed");
                0
            }
        };

        // Everything not confirmed by the engine is a failure, including
        // files skipped after shutdown and tasks that died mid-way.
        let indexed = indexed.min(attempted);
        let result = IngestionResult {
            attempted,
            indexed,
            failed: attempted - indexed,
        };

        if scheduled < attempted {
            warn!(skipped = attempted - scheduled, "shutdown requested, files left unprocessed");
        }
        info!(
            attempted,
            indexed,
            failed = result.failed,
            normalize_failed,
            "ingestion finished"
        );
        result
    }

    /// Schedule one normalization task per file, `workers` at a time.
    /// Resolves to the number of files scheduled.
    fn spawn_dispatcher(
        &self,
        files: Vec<PathBuf>,
        doc_tx: mpsc::Sender<Result<Document>>,
    ) -> JoinHandle<usize> {
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let shutdown = self.shutdown.clone();

        tokio::spawn(
            async move {
                let mut scheduled = 0usize;
                for path in files {
                    if shutdown.is_triggered() {
                        break;
                    }
                    let Ok(permit) = semaphore.clone().acquire_owned().await else {
                        break;
                    };
                    scheduled += 1;

                    let tx = doc_tx.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        let outcome = normalize_blocking(path).await;
                        // The receiver only goes away if the run was abandoned
                        let _ = tx.send(outcome).await;
                    });
                }
                scheduled
            }
            .in_current_span(),
        )
    }

    /// Load batches one after another. Resolves to the confirmed document count.
    fn spawn_loader(&self, mut batch_rx: mpsc::Receiver<Vec<Document>>) -> JoinHandle<usize> {
        let client = self.client.clone();
        let index = self.index.clone();

        tokio::spawn(
            async move {
                let mut indexed = 0usize;
                while let Some(batch) = batch_rx.recv().await {
                    let result = client.bulk(&index, &batch).await;
                    let ok = result.indexed_count(batch.len());
                    match result.into_result(batch.len()) {
                        Ok(_) => debug!(batch = batch.len(), "batch loaded"),
                        Err(e) => warn!(error = %e, "batch not fully indexed"),
                    }
                    indexed += ok;
                }
                indexed
            }
            .in_current_span(),
        )
    }
}

async fn normalize_blocking(path: PathBuf) -> Result<Document> {
    let display = path.display().to_string();
    match tokio::task::spawn_blocking(move || tedsync_normalize::normalize(&path)).await {
        Ok(outcome) => outcome,
        Err(e) => Err(TedSyncError::format(format!(
            "{display}: normalization task failed: {e}"
        ))),
    }
}
