//! Fetch the newest released publication of a year and index it.

use chrono::NaiveDate;
use tracing::{info, instrument, warn};

use tedsync_calendar::{CalendarClient, available_on, latest, parse_calendar};
use tedsync_ingest::{ProgressReporter, index_package};
use tedsync_shared::{
    DownloadConfig, IngestConfig, IngestionResult, Package, Publication, Result, Shutdown,
    TedSyncError,
};

use crate::download::Downloader;
use crate::ledger::Ledger;

#[derive(Debug, Clone)]
pub struct LatestConfig {
    pub year: i32,
    /// Stop after the download.
    pub download_only: bool,
    pub today: NaiveDate,
}

#[derive(Debug, Clone)]
pub struct LatestOutcome {
    pub publication: Publication,
    pub package: Package,
    /// `None` when the run was download-only.
    pub ingestion: Option<IngestionResult>,
}

impl LatestOutcome {
    /// Download-only runs succeed once the package is on disk.
    pub fn succeeded(&self) -> bool {
        self.ingestion.is_none_or(|result| result.is_complete())
    }
}

/// Download (and unless download-only, index) the most recent publication of
/// `config.year` released on or before `config.today`.
///
/// A fully indexed package is recorded in the ledger, so later batch runs
/// with `--skip-existing` do not fetch it again.
#[instrument(skip_all, fields(year = config.year))]
pub async fn run_latest(
    config: &LatestConfig,
    download: &DownloadConfig,
    ingest: &IngestConfig,
    shutdown: &Shutdown,
    progress: &dyn ProgressReporter,
) -> Result<LatestOutcome> {
    progress.phase("Resolving publication calendar");
    let calendar = CalendarClient::new(download)?;
    let content = calendar.fetch(config.year).await?;
    let available = available_on(&parse_calendar(&content, config.year), config.today);

    let Some(publication) = latest(&available).cloned() else {
        return Err(TedSyncError::validation(format!(
            "no publications available for {} as of {}",
            config.year, config.today
        )));
    };
    info!(
        id = %publication.id,
        date = %publication.release_date,
        available = available.len(),
        "latest available publication"
    );

    progress.phase("Downloading package");
    let package = Downloader::new(download)?.download(&publication).await?;

    if config.download_only {
        return Ok(LatestOutcome {
            publication,
            package,
            ingestion: None,
        });
    }

    let result = index_package(&package, ingest, shutdown, progress).await?;
    if result.is_complete() {
        let ledger = Ledger::open(&download.ledger_path).await?;
        ledger.record(&publication.package_token()).await?;
    } else {
        warn!(
            attempted = result.attempted,
            failed = result.failed,
            "package only partially indexed"
        );
    }

    Ok(LatestOutcome {
        publication,
        package,
        ingestion: Some(result),
    })
}
