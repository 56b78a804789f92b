//! Shared types, error model, and configuration for tedsync.
//!
//! This crate is the foundation depended on by all other tedsync crates.
//! It provides:
//! - [`TedSyncError`]: the unified error type
//! - Domain types ([`Publication`], [`Package`], [`Document`], [`IngestionResult`], [`RunStats`])
//! - Configuration ([`AppConfig`], [`SearchConfig`], [`IngestConfig`], [`DownloadConfig`])
//! - [`Shutdown`]: cooperative cancellation flag

pub mod config;
pub mod error;
pub mod shutdown;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, DownloadConfig, DownloadSection, IngestConfig, IngestSection, SearchConfig,
    SearchSection, config_dir, config_file_path, init_config, load_config, load_config_from,
};
pub use error::{Result, TedSyncError};
pub use shutdown::Shutdown;
pub use types::{
    ContainerFormat, Credentials, Document, IngestionResult, Package, Publication, RunStats,
};
