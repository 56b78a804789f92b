//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use chrono::{Datelike, Local};
use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use tedsync_core::{
    BatchConfig, BatchProgress, LatestConfig, PublicationState, run_batch, run_latest,
};
use tedsync_ingest::{ProgressReporter, index_package};
use tedsync_shared::{
    AppConfig, DownloadConfig, IngestConfig, IngestionResult, Package, RunStats, Shutdown,
    init_config, load_config, load_config_from,
};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// tedsync: keep a search index in sync with TED daily packages.
#[derive(Parser)]
#[command(
    name = "tedsync",
    version,
    about = "Download TED daily packages and bulk load their notices into OpenSearch.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(flatten)]
    pub settings: SettingsArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Overrides for config file values. Each falls back to an env var.
#[derive(Args, Debug, Default)]
pub(crate) struct SettingsArgs {
    /// Config file (defaults to ~/.tedsync/tedsync.toml).
    #[arg(long, env = "TEDSYNC_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Search engine URL.
    #[arg(short = 'u', long, env = "OPENSEARCH_URL", global = true)]
    pub url: Option<String>,

    /// Destination index.
    #[arg(short = 'i', long, env = "OPENSEARCH_INDEX", global = true)]
    pub index: Option<String>,

    /// Basic-auth user name.
    #[arg(long, env = "OPENSEARCH_USERNAME", global = true)]
    pub username: Option<String>,

    /// Basic-auth password.
    #[arg(long, env = "OPENSEARCH_PASSWORD", hide_env_values = true, global = true)]
    pub password: Option<String>,

    /// Minimum total-fields limit for the index.
    #[arg(long, env = "OPENSEARCH_FIELD_LIMIT", global = true)]
    pub field_limit: Option<u64>,

    /// Documents per bulk request.
    #[arg(short = 'b', long, env = "BULK_SIZE", global = true)]
    pub bulk_size: Option<usize>,

    /// Concurrent normalization workers.
    #[arg(short = 'w', long, env = "NUM_WORKERS", global = true)]
    pub workers: Option<usize>,

    /// Where packages and the ledger are stored.
    #[arg(long, env = "TED_DOWNLOAD_DIR", global = true)]
    pub download_dir: Option<String>,

    /// Extension of downloaded package files.
    #[arg(long, env = "PACKAGE_FILE_EXTENSION", global = true)]
    pub file_extension: Option<String>,

    /// Publication calendar CSV endpoint.
    #[arg(long, env = "TED_CALENDAR_URL", global = true)]
    pub calendar_url: Option<String>,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Index a package archive already on disk.
    Index {
        /// Path to a .tar.gz or .zip package.
        package: PathBuf,
    },

    /// Download and index the newest released publication of a year.
    Latest {
        /// Calendar year (defaults to the current year).
        #[arg(short, long, env = "TED_YEAR")]
        year: Option<i32>,

        /// Only download the package.
        #[arg(long)]
        download_only: bool,
    },

    /// Download and index every released publication in a range of years.
    Batch {
        /// First year to process.
        #[arg(long, default_value_t = 2015)]
        start_year: i32,

        /// Last year to process (defaults to the current year).
        #[arg(long)]
        end_year: Option<i32>,

        /// Skip publications already recorded as processed.
        #[arg(long)]
        skip_existing: bool,

        /// Years processed at the same time.
        #[arg(long)]
        max_concurrent_years: Option<usize>,

        /// Downloads in flight per year.
        #[arg(long)]
        max_concurrent_downloads: Option<usize>,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "tedsync=info",
        1 => "tedsync=debug",
        _ => "tedsync=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt().json().with_env_filter(env_filter).init();
        }
    }
}

// ---------------------------------------------------------------------------
// Settings resolution
// ---------------------------------------------------------------------------

impl SettingsArgs {
    /// Load the config file and layer flag/env overrides on top.
    fn resolve(&self) -> Result<AppConfig> {
        let mut config = match &self.config {
            Some(path) => load_config_from(path)?,
            None => load_config()?,
        };
        self.apply(&mut config);
        Ok(config)
    }

    fn apply(&self, config: &mut AppConfig) {
        if let Some(url) = &self.url {
            config.search.url = url.clone();
        }
        if let Some(index) = &self.index {
            config.search.index = index.clone();
        }
        if let Some(username) = &self.username {
            config.search.username = Some(username.clone());
        }
        if let Some(limit) = self.field_limit {
            config.search.field_limit = limit;
        }
        if let Some(bulk_size) = self.bulk_size {
            config.ingest.bulk_size = bulk_size;
        }
        if let Some(workers) = self.workers {
            config.ingest.workers = workers;
        }
        if let Some(dir) = &self.download_dir {
            config.download.download_dir = dir.clone();
        }
        if let Some(ext) = &self.file_extension {
            config.download.file_extension = ext.clone();
        }
        if let Some(url) = &self.calendar_url {
            config.download.calendar_url = url.clone();
        }
    }

    fn ingest_config(&self, config: &AppConfig) -> IngestConfig {
        let mut ingest = IngestConfig::from(config);
        if let Some(password) = self.password.as_ref().filter(|p| !p.is_empty()) {
            ingest.search.credentials.password = Some(password.clone());
        }
        ingest
    }
}

/// Shutdown flag raised on Ctrl-C. In-flight requests finish; nothing new starts.
fn install_shutdown_handler() -> Shutdown {
    let shutdown = Shutdown::new();
    let flag = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, letting in-flight work finish");
            flag.trigger();
        }
    });
    shutdown
}

fn exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Command::Index { package } => cmd_index(&cli.settings, package).await,
        Command::Latest {
            year,
            download_only,
        } => cmd_latest(&cli.settings, year, download_only).await,
        Command::Batch {
            start_year,
            end_year,
            skip_existing,
            max_concurrent_years,
            max_concurrent_downloads,
        } => {
            cmd_batch(
                &cli.settings,
                start_year,
                end_year,
                skip_existing,
                max_concurrent_years,
                max_concurrent_downloads,
            )
            .await
        }
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show(&cli.settings).await,
        },
    }
}

async fn cmd_index(settings: &SettingsArgs, package: PathBuf) -> Result<ExitCode> {
    if !package.is_file() {
        return Err(eyre!("package not found: {}", package.display()));
    }

    let config = settings.resolve()?;
    let ingest = settings.ingest_config(&config);
    let shutdown = install_shutdown_handler();

    info!(
        package = %package.display(),
        url = %ingest.search.url,
        index = %ingest.search.index,
        "indexing package"
    );

    let reporter = CliProgress::new();
    let result = index_package(&Package::from_path(&package), &ingest, &shutdown, &reporter).await?;

    println!();
    println!("  Package indexed.");
    print_ingestion(&result);
    println!();

    Ok(exit_code(result.is_complete()))
}

async fn cmd_latest(
    settings: &SettingsArgs,
    year: Option<i32>,
    download_only: bool,
) -> Result<ExitCode> {
    let config = settings.resolve()?;
    let ingest = settings.ingest_config(&config);
    let download = DownloadConfig::from(&config);
    let shutdown = install_shutdown_handler();

    let today = Local::now().date_naive();
    let latest = LatestConfig {
        year: year.unwrap_or_else(|| today.year()),
        download_only,
        today,
    };

    let reporter = CliProgress::new();
    let outcome = run_latest(&latest, &download, &ingest, &shutdown, &reporter).await?;
    reporter.spinner.finish_and_clear();

    println!();
    println!(
        "  Publication {} of {} ({})",
        outcome.publication.id, outcome.publication.year, outcome.publication.release_date
    );
    println!("  Package:   {}", outcome.package.local_path.display());
    match &outcome.ingestion {
        Some(result) => print_ingestion(result),
        None => println!("  Indexing skipped (download only)."),
    }
    println!();

    Ok(exit_code(outcome.succeeded()))
}

async fn cmd_batch(
    settings: &SettingsArgs,
    start_year: i32,
    end_year: Option<i32>,
    skip_existing: bool,
    max_concurrent_years: Option<usize>,
    max_concurrent_downloads: Option<usize>,
) -> Result<ExitCode> {
    let mut config = settings.resolve()?;
    if let Some(years) = max_concurrent_years {
        config.download.max_concurrent_years = years;
    }
    if let Some(downloads) = max_concurrent_downloads {
        config.download.max_concurrent_downloads = downloads;
    }
    let ingest = settings.ingest_config(&config);
    let download = DownloadConfig::from(&config);
    let shutdown = install_shutdown_handler();

    let today = Local::now().date_naive();
    let batch = BatchConfig {
        start_year,
        end_year: end_year.unwrap_or_else(|| today.year()),
        skip_existing,
        today,
    };

    info!(
        start_year = batch.start_year,
        end_year = batch.end_year,
        skip_existing,
        "starting batch download and indexing"
    );

    let stats = run_batch(&batch, &download, &ingest, &shutdown, Arc::new(BatchBar::new())).await?;
    print_stats(&stats);

    Ok(exit_code(stats.succeeded()))
}

async fn cmd_config_init() -> Result<ExitCode> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(ExitCode::SUCCESS)
}

async fn cmd_config_show(settings: &SettingsArgs) -> Result<ExitCode> {
    let config = settings.resolve()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(ExitCode::SUCCESS)
}

fn print_ingestion(result: &IngestionResult) {
    println!("  Files:     {}", result.attempted);
    println!("  Indexed:   {}", result.indexed);
    println!("  Failed:    {}", result.failed);
}

fn print_stats(stats: &RunStats) {
    println!();
    println!("  Batch processing completed.");
    println!("  Total:      {}", stats.total);
    println!("  Downloaded: {}", stats.downloaded);
    println!("  Indexed:    {}", stats.indexed);
    println!("  Failed:     {}", stats.failed);
    println!("  Skipped:    {}", stats.skipped);
    if stats.interrupted {
        println!("  Interrupted before all publications were dispatched.");
    }
    println!();
}

// ---------------------------------------------------------------------------
// CLI progress reporters
// ---------------------------------------------------------------------------

/// Spinner for single-package commands.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
            spinner.set_style(
                style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
            );
        }
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn file_processed(&self, current: usize, total: usize) {
        self.spinner
            .set_message(format!("Indexing documents [{current}/{total}]"));
    }

    fn done(&self, _result: &IngestionResult) {
        self.spinner.finish_and_clear();
    }
}

/// Bar over all publications of a batch run; grows as calendars resolve.
struct BatchBar {
    bar: ProgressBar,
}

impl BatchBar {
    fn new() -> Self {
        let bar = ProgressBar::new(0);
        if let Ok(style) =
            ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} publications {msg}")
        {
            bar.set_style(style);
        }
        Self { bar }
    }
}

impl BatchProgress for BatchBar {
    fn year_started(&self, year: i32, publications: usize) {
        self.bar.inc_length(publications as u64);
        self.bar.set_message(format!("(year {year})"));
    }

    fn publication_finished(&self, token: &str, state: PublicationState) {
        self.bar.inc(1);
        self.bar.set_message(format!("{token}: {state}"));
    }

    fn done(&self, _stats: &RunStats) {
        self.bar.finish_and_clear();
    }
}
