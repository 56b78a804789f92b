//! Package ingestion: extract, normalize in parallel, batch, bulk load.
//!
//! - [`BatchAccumulator`] groups documents into bulk-sized batches
//! - [`IngestionPool`] runs the bounded normalize → batch → load pipeline
//! - [`index_package`] is the per-package entry point used by the CLI and
//!   the download orchestrator

pub mod batch;
pub mod package;
pub mod pool;

pub use batch::BatchAccumulator;
pub use package::{ProgressReporter, SilentProgress, index_package};
pub use pool::IngestionPool;
