//! Publication scheduling for tedsync.
//!
//! This crate ties the calendar, package downloads and ingestion together:
//! - [`download`]: archive naming, URLs and streaming downloads
//! - [`ledger`]: the append-only record of completed publications
//! - [`orchestrator`]: [`run_batch`] over a range of years
//! - [`latest`]: [`run_latest`] for the newest publication of one year

pub mod download;
pub mod latest;
pub mod ledger;
pub mod orchestrator;

pub use download::{Downloader, archive_url, formatted_id, package_file_name};
pub use latest::{LatestConfig, LatestOutcome, run_latest};
pub use ledger::Ledger;
pub use orchestrator::{
    BatchConfig, BatchProgress, PublicationState, SilentBatchProgress, run_batch,
};
