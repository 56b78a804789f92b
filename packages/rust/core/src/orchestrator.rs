//! Batch download-and-index over a range of years.
//!
//! Years run under one semaphore (`max_concurrent_years`); inside a year,
//! publications run under a per-year semaphore (`max_concurrent_downloads`)
//! with a fixed pause between dispatches. Each publication walks the
//! [`PublicationState`] machine and only `Completed` ones reach the ledger.

use std::sync::Arc;

use chrono::{Datelike, NaiveDate};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};
use uuid::Uuid;

use tedsync_calendar::CalendarClient;
use tedsync_ingest::{SilentProgress, index_package};
use tedsync_shared::{
    DownloadConfig, IngestConfig, Publication, Result, RunStats, Shutdown, TedSyncError,
};

use crate::download::Downloader;
use crate::ledger::Ledger;

// ---------------------------------------------------------------------------
// Publication state machine
// ---------------------------------------------------------------------------

/// Lifecycle of one publication within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublicationState {
    Pending,
    /// Already in the ledger; nothing to do.
    Skipped,
    Downloading,
    Downloaded,
    DownloadFailed,
    Indexing,
    Completed,
    IndexFailed,
}

impl PublicationState {
    pub fn can_transition_to(self, next: Self) -> bool {
        use PublicationState::*;
        matches!(
            (self, next),
            (Pending, Skipped)
                | (Pending, Downloading)
                | (Pending, DownloadFailed)
                | (Downloading, Downloaded)
                | (Downloading, DownloadFailed)
                | (Downloaded, Indexing)
                | (Indexing, Completed)
                | (Indexing, IndexFailed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Skipped | Self::DownloadFailed | Self::Completed | Self::IndexFailed
        )
    }

    /// Contribution of a finished publication to the run counters.
    fn stats(self) -> RunStats {
        let mut stats = RunStats::default();
        match self {
            Self::Skipped => stats.skipped = 1,
            Self::Completed => {
                stats.downloaded = 1;
                stats.indexed = 1;
            }
            Self::IndexFailed => {
                stats.downloaded = 1;
                stats.failed = 1;
            }
            _ => stats.failed = 1,
        }
        stats
    }
}

impl std::fmt::Display for PublicationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Skipped => "skipped",
            Self::Downloading => "downloading",
            Self::Downloaded => "downloaded",
            Self::DownloadFailed => "download failed",
            Self::Indexing => "indexing",
            Self::Completed => "completed",
            Self::IndexFailed => "index failed",
        };
        f.write_str(name)
    }
}

/// Tracks one publication through its states.
struct Tracker {
    state: PublicationState,
}

impl Tracker {
    fn new() -> Self {
        Self {
            state: PublicationState::Pending,
        }
    }

    fn advance(&mut self, next: PublicationState) -> PublicationState {
        if !self.state.can_transition_to(next) {
            warn!(from = %self.state, to = %next, "unexpected state transition");
        }
        debug!(from = %self.state, to = %next, "state change");
        self.state = next;
        next
    }
}

// ---------------------------------------------------------------------------
// Configuration & progress
// ---------------------------------------------------------------------------

/// What to process in a batch run.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub start_year: i32,
    pub end_year: i32,
    /// Skip publications already recorded in the ledger.
    pub skip_existing: bool,
    /// Reference date for "already released" and for clamping `end_year`.
    pub today: NaiveDate,
}

/// Progress callback for batch runs. Called from worker tasks.
pub trait BatchProgress: Send + Sync {
    /// Called once a year's calendar has been resolved.
    fn year_started(&self, year: i32, publications: usize);
    /// Called when a publication reaches a terminal state.
    fn publication_finished(&self, token: &str, state: PublicationState);
    /// Called when the run completes.
    fn done(&self, stats: &RunStats);
}

/// No-op batch progress for headless/test usage.
pub struct SilentBatchProgress;

impl BatchProgress for SilentBatchProgress {
    fn year_started(&self, _year: i32, _publications: usize) {}
    fn publication_finished(&self, _token: &str, _state: PublicationState) {}
    fn done(&self, _stats: &RunStats) {}
}

/// Shared by every year and publication task of one run.
struct RunContext {
    calendar: CalendarClient,
    downloader: Downloader,
    download: DownloadConfig,
    ingest: IngestConfig,
    ledger: Arc<Ledger>,
    shutdown: Shutdown,
    progress: Arc<dyn BatchProgress>,
    skip_existing: bool,
    today: NaiveDate,
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// Download and index every released publication from `start_year` through
/// `end_year`.
///
/// An `end_year` after the current year is clamped; a `start_year` after the
/// (clamped) end year is rejected. Per-publication failures are counted, not
/// returned.
#[instrument(skip_all, fields(run_id = %Uuid::now_v7(), start_year = batch.start_year, end_year = batch.end_year))]
pub async fn run_batch(
    batch: &BatchConfig,
    download: &DownloadConfig,
    ingest: &IngestConfig,
    shutdown: &Shutdown,
    progress: Arc<dyn BatchProgress>,
) -> Result<RunStats> {
    let current_year = batch.today.year();
    let mut end_year = batch.end_year;
    if end_year > current_year {
        warn!(end_year, current_year, "end year is in the future, using current year");
        end_year = current_year;
    }
    if batch.start_year > end_year {
        return Err(TedSyncError::validation(format!(
            "start year {} is after end year {end_year}",
            batch.start_year
        )));
    }

    let ledger = Arc::new(Ledger::open(&download.ledger_path).await?);
    let ctx = Arc::new(RunContext {
        calendar: CalendarClient::new(download)?,
        downloader: Downloader::new(download)?,
        download: download.clone(),
        ingest: ingest.clone(),
        ledger,
        shutdown: shutdown.clone(),
        progress,
        skip_existing: batch.skip_existing,
        today: batch.today,
    });

    info!(
        end_year,
        max_concurrent_years = download.max_concurrent_years,
        max_concurrent_downloads = download.max_concurrent_downloads,
        skip_existing = batch.skip_existing,
        "starting batch run"
    );

    let years = Arc::new(Semaphore::new(download.max_concurrent_years.max(1)));
    let mut handles: Vec<(i32, JoinHandle<RunStats>)> = Vec::new();
    let mut interrupted = false;

    for year in batch.start_year..=end_year {
        if ctx.shutdown.is_triggered() {
            warn!(year, "shutdown requested, not starting further years");
            interrupted = true;
            break;
        }
        let Ok(permit) = years.clone().acquire_owned().await else {
            break;
        };
        let ctx = ctx.clone();
        handles.push((
            year,
            tokio::spawn(
                async move {
                    let _permit = permit;
                    process_year(ctx, year).await
                }
                .instrument(info_span!("year", year)),
            ),
        ));
    }

    let mut stats = RunStats {
        interrupted,
        ..Default::default()
    };
    for (year, handle) in handles {
        match handle.await {
            Ok(year_stats) => stats += year_stats,
            Err(e) => error!(year, error = %e, "year task failed"),
        }
    }

    info!(
        total = stats.total,
        downloaded = stats.downloaded,
        indexed = stats.indexed,
        failed = stats.failed,
        skipped = stats.skipped,
        interrupted = stats.interrupted,
        "batch run finished"
    );
    ctx.progress.done(&stats);
    Ok(stats)
}

async fn process_year(ctx: Arc<RunContext>, year: i32) -> RunStats {
    let publications = ctx.calendar.resolve(year, ctx.today).await;
    ctx.progress.year_started(year, publications.len());
    info!(count = publications.len(), "processing year");

    let mut stats = RunStats {
        total: publications.len(),
        ..Default::default()
    };

    let downloads = Arc::new(Semaphore::new(ctx.download.max_concurrent_downloads.max(1)));
    let mut handles: Vec<(String, JoinHandle<PublicationState>)> = Vec::new();
    let mut dispatched = 0usize;

    for publication in publications {
        let token = publication.package_token();

        if ctx.skip_existing && ctx.ledger.contains(&token).await {
            info!(%token, "skipping already processed publication");
            stats.skipped += 1;
            ctx.progress.publication_finished(&token, PublicationState::Skipped);
            continue;
        }

        if dispatched > 0 && !ctx.download.dispatch_delay.is_zero() {
            tokio::time::sleep(ctx.download.dispatch_delay).await;
        }
        if ctx.shutdown.is_triggered() {
            let remaining = stats.total - stats.skipped - dispatched;
            warn!(remaining, "shutdown requested, not dispatching further publications");
            stats.failed += remaining;
            stats.interrupted = true;
            break;
        }
        let Ok(permit) = downloads.clone().acquire_owned().await else {
            break;
        };
        dispatched += 1;

        let ctx = ctx.clone();
        let span = info_span!("publication", %token, date = %publication.release_date);
        handles.push((
            token,
            tokio::spawn(
                async move {
                    let _permit = permit;
                    process_publication(&ctx, &publication).await
                }
                .instrument(span),
            ),
        ));
    }

    for (token, handle) in handles {
        let state = match handle.await {
            Ok(state) => state,
            Err(e) => {
                error!(%token, error = %e, "publication task failed");
                PublicationState::DownloadFailed
            }
        };
        stats += state.stats();
    }

    info!(
        indexed = stats.indexed,
        failed = stats.failed,
        skipped = stats.skipped,
        "year finished"
    );
    stats
}

async fn process_publication(ctx: &RunContext, publication: &Publication) -> PublicationState {
    let token = publication.package_token();
    let state = run_publication(ctx, publication, &token).await;
    ctx.progress.publication_finished(&token, state);
    state
}

async fn run_publication(
    ctx: &RunContext,
    publication: &Publication,
    token: &str,
) -> PublicationState {
    let mut tracker = Tracker::new();

    // A sibling task may have completed it since dispatch
    if ctx.skip_existing && ctx.ledger.contains(token).await {
        info!("skipping already processed publication");
        return tracker.advance(PublicationState::Skipped);
    }
    if ctx.shutdown.is_triggered() {
        return tracker.advance(PublicationState::DownloadFailed);
    }

    tracker.advance(PublicationState::Downloading);
    let package = match ctx.downloader.download(publication).await {
        Ok(package) => package,
        Err(e) => {
            error!(error = %e, "failed to download package");
            return tracker.advance(PublicationState::DownloadFailed);
        }
    };
    tracker.advance(PublicationState::Downloaded);

    tracker.advance(PublicationState::Indexing);
    let result = match index_package(&package, &ctx.ingest, &ctx.shutdown, &SilentProgress).await {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "failed to index package");
            return tracker.advance(PublicationState::IndexFailed);
        }
    };

    if !result.is_complete() {
        warn!(
            attempted = result.attempted,
            failed = result.failed,
            "package only partially indexed"
        );
        return tracker.advance(PublicationState::IndexFailed);
    }

    // Not in the ledger means not completed: a later run retries it
    if let Err(e) = ctx.ledger.record(token).await {
        error!(error = %e, "failed to record publication in ledger");
        return tracker.advance(PublicationState::IndexFailed);
    }
    info!(indexed = result.indexed, "publication completed");
    tracker.advance(PublicationState::Completed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use std::path::Path;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};
    use tedsync_shared::{Credentials, SearchConfig};
    use wiremock::matchers::{method, path, path_regex};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    const NOTICE: &str = include_str!("../../../../fixtures/xml/notice.xml");

    struct AcceptAll;

    impl Respond for AcceptAll {
        fn respond(&self, request: &Request) -> ResponseTemplate {
            let docs = String::from_utf8_lossy(&request.body).lines().count() / 2;
            let items: Vec<Value> = (0..docs).map(|_| json!({"index": {"status": 201}})).collect();
            ResponseTemplate::new(200).set_body_json(json!({"errors": false, "items": items}))
        }
    }

    /// Serves `body` after `delay`, noting when each request arrived.
    struct SlowPackage {
        body: Vec<u8>,
        delay: Duration,
        arrivals: Arc<Mutex<Vec<Instant>>>,
    }

    impl Respond for SlowPackage {
        fn respond(&self, _request: &Request) -> ResponseTemplate {
            self.arrivals.lock().unwrap().push(Instant::now());
            ResponseTemplate::new(200)
                .set_body_bytes(self.body.clone())
                .set_delay(self.delay)
        }
    }

    fn tar_gz(entries: &[(&str, &str)]) -> Vec<u8> {
        let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, data.as_bytes()).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    fn configs(server: &MockServer, dir: &Path) -> (DownloadConfig, IngestConfig) {
        let download = DownloadConfig {
            download_dir: dir.to_path_buf(),
            file_extension: ".tar.gz".into(),
            base_url: server.uri(),
            calendar_url: format!("{}/calendar", server.uri()),
            max_concurrent_years: 2,
            max_concurrent_downloads: 2,
            dispatch_delay: Duration::ZERO,
            timeout: Duration::from_secs(5),
            ledger_path: dir.join("processed_publications.txt"),
        };
        let ingest = IngestConfig {
            search: SearchConfig {
                url: server.uri(),
                index: "ted".into(),
                credentials: Credentials::default(),
                field_limit: 30_000,
                timeout: Duration::from_secs(5),
            },
            bulk_size: 50,
            workers: 2,
        };
        (download, ingest)
    }

    async fn mount_search(server: &MockServer) {
        Mock::given(method("HEAD"))
            .and(path("/ted"))
            .respond_with(ResponseTemplate::new(200))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/ted/_settings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ted": {"settings": {"index": {"mapping": {"total_fields": {"limit": "30000"}}}}}
            })))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/_bulk"))
            .respond_with(AcceptAll)
            .mount(server)
            .await;
    }

    fn batch(skip_existing: bool) -> BatchConfig {
        BatchConfig {
            start_year: 2024,
            end_year: 2024,
            skip_existing,
            today: NaiveDate::from_ymd_opt(2024, 3, 2).unwrap(),
        }
    }

    async fn package_requests(server: &MockServer) -> Vec<String> {
        server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .map(|r| r.url.path().to_string())
            .filter(|p| p.starts_with("/packages/daily/"))
            .collect()
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(String, PublicationState)>>);

    impl BatchProgress for Recorder {
        fn year_started(&self, _year: i32, _publications: usize) {}
        fn publication_finished(&self, token: &str, state: PublicationState) {
            self.0.lock().unwrap().push((token.to_string(), state));
        }
        fn done(&self, _stats: &RunStats) {}
    }

    #[test]
    fn state_machine_transitions() {
        use PublicationState::*;
        assert!(Pending.can_transition_to(Downloading));
        assert!(Downloading.can_transition_to(Downloaded));
        assert!(Downloaded.can_transition_to(Indexing));
        assert!(Indexing.can_transition_to(Completed));
        assert!(Indexing.can_transition_to(IndexFailed));
        assert!(Downloading.can_transition_to(DownloadFailed));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Downloaded.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Pending));
        assert!(!DownloadFailed.can_transition_to(Indexing));

        assert!(Completed.is_terminal());
        assert!(Skipped.is_terminal());
        assert!(!Indexing.is_terminal());
    }

    #[tokio::test]
    async fn second_run_skips_completed_publications() {
        let server = MockServer::start().await;
        mount_search(&server).await;
        Mock::given(method("GET"))
            .and(path("/calendar/2024"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "OJS,Publication date\n103,01/03/2024\n102,29/02/2024\n104,04/03/2024\n",
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/packages/daily/2024001\d\d$"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(tar_gz(&[("000001-2024.xml", NOTICE)])),
            )
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let (download, ingest) = configs(&server, tmp.path());

        let first = run_batch(
            &batch(true),
            &download,
            &ingest,
            &Shutdown::new(),
            Arc::new(SilentBatchProgress),
        )
        .await
        .unwrap();
        assert_eq!(
            first,
            RunStats {
                total: 2,
                downloaded: 2,
                indexed: 2,
                failed: 0,
                skipped: 0,
                interrupted: false
            }
        );

        let mut fetched = package_requests(&server).await;
        fetched.sort();
        assert_eq!(
            fetched,
            ["/packages/daily/202400102", "/packages/daily/202400103"]
        );
        assert!(tmp.path().join("202400103.tar.gz").exists());

        let recorder = Arc::new(Recorder::default());
        let second = run_batch(
            &batch(true),
            &download,
            &ingest,
            &Shutdown::new(),
            recorder.clone(),
        )
        .await
        .unwrap();
        assert_eq!(second.total, 2);
        assert_eq!(second.skipped, 2);
        assert_eq!(second.downloaded, 0);
        assert_eq!(package_requests(&server).await.len(), 2);
        assert!(
            recorder
                .0
                .lock()
                .unwrap()
                .iter()
                .all(|(_, state)| *state == PublicationState::Skipped)
        );

        let mut ledger: Vec<String> = std::fs::read_to_string(&download.ledger_path)
            .unwrap()
            .lines()
            .map(String::from)
            .collect();
        ledger.sort();
        assert_eq!(ledger, ["2024-102", "2024-103"]);
    }

    #[tokio::test]
    async fn failed_download_is_not_recorded() {
        let server = MockServer::start().await;
        mount_search(&server).await;
        Mock::given(method("GET"))
            .and(path("/calendar/2024"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string("id,date\n103,01/03/2024\n9999,01/03/2024\n"),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/packages/daily/202400103"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let (download, ingest) = configs(&server, tmp.path());

        let stats = run_batch(
            &batch(false),
            &download,
            &ingest,
            &Shutdown::new(),
            Arc::new(SilentBatchProgress),
        )
        .await
        .unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.indexed, 0);
        assert_eq!(
            std::fs::read_to_string(&download.ledger_path).unwrap(),
            ""
        );
    }

    #[tokio::test]
    async fn partially_indexed_package_is_not_recorded() {
        let server = MockServer::start().await;
        mount_search(&server).await;
        Mock::given(method("GET"))
            .and(path("/calendar/2024"))
            .respond_with(ResponseTemplate::new(200).set_body_string("id,date\n103,01/03/2024\n"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/packages/daily/202400103"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(tar_gz(&[
                ("good.xml", NOTICE),
                ("bad.xml", "<TED_EXPORT><A></B></TED_EXPORT>"),
            ])))
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let (download, ingest) = configs(&server, tmp.path());

        let stats = run_batch(
            &batch(true),
            &download,
            &ingest,
            &Shutdown::new(),
            Arc::new(SilentBatchProgress),
        )
        .await
        .unwrap();
        assert_eq!(stats.downloaded, 1);
        assert_eq!(stats.indexed, 0);
        assert_eq!(stats.failed, 1);

        let ledger = Ledger::open(&download.ledger_path).await.unwrap();
        assert!(!ledger.contains("2024-103").await);
    }

    #[tokio::test]
    async fn calendar_failure_yields_empty_year() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/calendar/2023"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/calendar/2024"))
            .respond_with(ResponseTemplate::new(200).set_body_string("id,date\n"))
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let (download, ingest) = configs(&server, tmp.path());

        let mut config = batch(false);
        config.start_year = 2023;
        let stats = run_batch(
            &config,
            &download,
            &ingest,
            &Shutdown::new(),
            Arc::new(SilentBatchProgress),
        )
        .await
        .unwrap();
        assert_eq!(stats, RunStats::default());
    }

    #[tokio::test]
    async fn year_range_is_validated_and_clamped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/calendar/2024"))
            .respond_with(ResponseTemplate::new(200).set_body_string("id,date\n"))
            .expect(1)
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let (download, ingest) = configs(&server, tmp.path());

        let mut inverted = batch(false);
        inverted.start_year = 2025;
        inverted.end_year = 2030;
        let err = run_batch(
            &inverted,
            &download,
            &ingest,
            &Shutdown::new(),
            Arc::new(SilentBatchProgress),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TedSyncError::Validation { .. }));

        // 2030 is clamped to 2024, so only one calendar is requested
        let mut future = batch(false);
        future.end_year = 2030;
        run_batch(
            &future,
            &download,
            &ingest,
            &Shutdown::new(),
            Arc::new(SilentBatchProgress),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn shutdown_dispatches_nothing() {
        let server = MockServer::start().await;
        let tmp = tempfile::tempdir().unwrap();
        let (download, ingest) = configs(&server, tmp.path());

        let shutdown = Shutdown::new();
        shutdown.trigger();
        let stats = run_batch(
            &batch(false),
            &download,
            &ingest,
            &shutdown,
            Arc::new(SilentBatchProgress),
        )
        .await
        .unwrap();
        assert_eq!(
            stats,
            RunStats {
                interrupted: true,
                ..Default::default()
            }
        );
        assert!(!stats.succeeded());
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    async fn mount_slow_packages(
        server: &MockServer,
        pattern: &str,
        delay: Duration,
    ) -> Arc<Mutex<Vec<Instant>>> {
        let arrivals = Arc::new(Mutex::new(Vec::new()));
        Mock::given(method("GET"))
            .and(path_regex(pattern))
            .respond_with(SlowPackage {
                body: tar_gz(&[("000001-2024.xml", NOTICE)]),
                delay,
                arrivals: arrivals.clone(),
            })
            .mount(server)
            .await;
        arrivals
    }

    fn sorted_arrivals(arrivals: &Mutex<Vec<Instant>>) -> Vec<Instant> {
        let mut arrivals = arrivals.lock().unwrap().clone();
        arrivals.sort();
        arrivals
    }

    #[tokio::test]
    async fn downloads_within_a_year_are_bounded() {
        let delay = Duration::from_millis(400);
        let server = MockServer::start().await;
        mount_search(&server).await;
        Mock::given(method("GET"))
            .and(path("/calendar/2024"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "id,date\n101,26/02/2024\n102,27/02/2024\n103,28/02/2024\n104,29/02/2024\n",
            ))
            .mount(&server)
            .await;
        let arrivals =
            mount_slow_packages(&server, r"^/packages/daily/2024001\d\d$", delay).await;

        let tmp = tempfile::tempdir().unwrap();
        let (mut download, ingest) = configs(&server, tmp.path());
        download.max_concurrent_downloads = 2;

        let started = Instant::now();
        let stats = run_batch(
            &batch(false),
            &download,
            &ingest,
            &Shutdown::new(),
            Arc::new(SilentBatchProgress),
        )
        .await
        .unwrap();
        let elapsed = started.elapsed();

        assert_eq!(stats.indexed, 4);
        assert!(stats.succeeded());
        // Two waves of two downloads each
        assert!(elapsed >= delay * 2, "finished too early: {elapsed:?}");
        let arrivals = sorted_arrivals(&arrivals);
        assert_eq!(arrivals.len(), 4);
        assert!(arrivals[2].duration_since(arrivals[0]) >= delay);
        assert!(arrivals[3].duration_since(arrivals[1]) >= delay);
    }

    #[tokio::test]
    async fn years_are_bounded() {
        let delay = Duration::from_millis(300);
        let server = MockServer::start().await;
        mount_search(&server).await;
        for year in [2023, 2024] {
            Mock::given(method("GET"))
                .and(path(format!("/calendar/{year}")))
                .respond_with(
                    ResponseTemplate::new(200)
                        .set_body_string(format!("id,date\n1,02/01/{year}\n")),
                )
                .mount(&server)
                .await;
        }
        let arrivals =
            mount_slow_packages(&server, r"^/packages/daily/20(23|24)00001$", delay).await;

        let tmp = tempfile::tempdir().unwrap();
        let (mut download, ingest) = configs(&server, tmp.path());
        download.max_concurrent_years = 1;

        let mut config = batch(false);
        config.start_year = 2023;
        let stats = run_batch(
            &config,
            &download,
            &ingest,
            &Shutdown::new(),
            Arc::new(SilentBatchProgress),
        )
        .await
        .unwrap();

        assert_eq!(stats.total, 2);
        assert_eq!(stats.indexed, 2);
        let arrivals = sorted_arrivals(&arrivals);
        assert_eq!(arrivals.len(), 2);
        assert!(arrivals[1].duration_since(arrivals[0]) >= delay);
    }

    #[tokio::test]
    async fn dispatch_delay_spaces_out_publications() {
        let server = MockServer::start().await;
        mount_search(&server).await;
        Mock::given(method("GET"))
            .and(path("/calendar/2024"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "id,date\n101,27/02/2024\n102,28/02/2024\n103,29/02/2024\n",
            ))
            .mount(&server)
            .await;
        let arrivals =
            mount_slow_packages(&server, r"^/packages/daily/2024001\d\d$", Duration::ZERO)
                .await;

        let tmp = tempfile::tempdir().unwrap();
        let (mut download, ingest) = configs(&server, tmp.path());
        download.max_concurrent_downloads = 3;
        download.dispatch_delay = Duration::from_millis(150);

        let started = Instant::now();
        let stats = run_batch(
            &batch(false),
            &download,
            &ingest,
            &Shutdown::new(),
            Arc::new(SilentBatchProgress),
        )
        .await
        .unwrap();

        assert_eq!(stats.indexed, 3);
        let arrivals = sorted_arrivals(&arrivals);
        assert_eq!(arrivals.len(), 3);
        // No pause before the first dispatch, one before each later one
        let last = arrivals[2].duration_since(started);
        assert!(last >= download.dispatch_delay * 2, "last dispatch at {last:?}");
    }

    #[tokio::test]
    async fn ledger_write_failure_is_not_completed() {
        let server = MockServer::start().await;
        mount_search(&server).await;
        mount_slow_packages(&server, r"^/packages/daily/202400103$", Duration::ZERO).await;

        let tmp = tempfile::tempdir().unwrap();
        let (download, ingest) = configs(&server, tmp.path());
        let ledger = Ledger::open_read_only(&download.ledger_path).await.unwrap();
        let ctx = RunContext {
            calendar: CalendarClient::new(&download).unwrap(),
            downloader: Downloader::new(&download).unwrap(),
            download: download.clone(),
            ingest,
            ledger: Arc::new(ledger),
            shutdown: Shutdown::new(),
            progress: Arc::new(SilentBatchProgress),
            skip_existing: true,
            today: NaiveDate::from_ymd_opt(2024, 3, 2).unwrap(),
        };
        let publication = Publication {
            id: "103".into(),
            year: 2024,
            release_date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
        };

        let state = process_publication(&ctx, &publication).await;
        assert_eq!(state, PublicationState::IndexFailed);
        assert_eq!(state.stats().failed, 1);
        assert_eq!(state.stats().indexed, 0);
        assert!(!ctx.ledger.contains("2024-103").await);
    }

    #[tokio::test]
    async fn shutdown_mid_year_marks_run_interrupted() {
        let server = MockServer::start().await;
        mount_search(&server).await;
        Mock::given(method("GET"))
            .and(path("/calendar/2024"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "id,date\n101,28/02/2024\n102,29/02/2024\n",
            ))
            .mount(&server)
            .await;
        mount_slow_packages(&server, r"^/packages/daily/2024001\d\d$", Duration::ZERO).await;

        let tmp = tempfile::tempdir().unwrap();
        let (mut download, ingest) = configs(&server, tmp.path());
        download.dispatch_delay = Duration::from_millis(300);

        let shutdown = Shutdown::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.trigger();
        });

        let stats = run_batch(
            &batch(false),
            &download,
            &ingest,
            &shutdown,
            Arc::new(SilentBatchProgress),
        )
        .await
        .unwrap();
        assert_eq!(stats.total, 2);
        assert!(stats.interrupted);
        assert!(stats.failed >= 1);
        assert!(!stats.succeeded());
    }
}
