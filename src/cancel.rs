//! Cooperative cancellation signal
//!
//! A `CancelToken` is plumbed from the CLI through the coordinator into
//! every blocking point: rate-limiter waits, HTTP retries, and batch
//! workers. Cancellation is cooperative; in-flight work finishes its
//! current source call and then exits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a new, un-cancelled token
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation to all holders of this token
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}
