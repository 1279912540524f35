//! Cooperative cancellation, shared by every blocking wait in this
//! crate (lock waits, lease renewal sleeps, the termination scanner's
//! poll loop).
//!
//! # Examples
//!
//! ```
//! use coord_kernel::cancel::CooperativeCancellationToken;
//!
//! let token = CooperativeCancellationToken::new();
//! assert!(!token.is_cancelled());
//!
//! token.cancel();
//! assert!(token.is_cancelled());
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation token. Cloning shares the same underlying
/// flag and waiter list, so any clone can cancel and every clone
/// observes it.
#[derive(Debug, Clone, Default)]
pub struct CooperativeCancellationToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<tokio::sync::Notify>,
}

impl CooperativeCancellationToken {
    /// Creates a new, not-yet-cancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the token as cancelled and wakes anything parked in
    /// `cancelled()`.
    pub fn cancel(&self) {
        let already_cancelled = self.cancelled.swap(true, Ordering::SeqCst);
        if !already_cancelled {
            self.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once cancellation has been requested. Callers racing
    /// this against a timer or a wait-manager notification should
    /// `tokio::select!` over it rather than poll `is_cancelled()`.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}
