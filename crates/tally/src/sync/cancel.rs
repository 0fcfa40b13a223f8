//! Cooperative cancellation for long refreshes

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Error raised when a refresh observes its cancel token mid-flight
///
/// A cancelled refresh persists nothing — in particular it never
/// advances the stored watermark.
#[derive(Debug, thiserror::Error)]
#[error("sync cancelled before completion")]
pub struct SyncCancelled;

/// Shared cancellation flag
///
/// Cloneable and cheap; the pagination loop checks it between pages.
/// Cancellation is sticky — once set, every holder sees it.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation for every holder of this token
    pub fn cancel(&self) {
        self.inner.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.load(Ordering::SeqCst)
    }
}
