//! Cooperative cancellation flag shared between the CLI signal handler and
//! long-running pipelines.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cloneable shutdown flag. Pipelines check it before scheduling new work;
/// in-flight requests are bounded by client timeouts.
#[derive(Debug, Clone, Default)]
pub struct Shutdown(Arc<AtomicBool>);

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request that no further work be scheduled.
    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
