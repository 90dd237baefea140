//! Synchronization utilities for multi-threaded operations.
//!
//! This module provides the cooperative-cancellation primitive used by every long-running
//! enumeration in the library. Exception directories, resource trees and per-compiland symbol
//! walks can each contain tens of thousands of entries, so callers need a way to abandon an
//! in-flight query without waiting for it to complete.
//!
//! # Design Principles
//!
//! - **Cooperative**: cancellation is checked at symbol-by-symbol granularity, never preemptive
//! - **Loud**: a cancelled operation surfaces [`crate::Error::Cancelled`], never a partial result
//! - **Cheap**: tokens are a clone of an `Arc<AtomicBool>`; checking is a relaxed atomic load
//! - **Thread Safety**: tokens can be cloned into any thread and cancelled from any thread

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crate::{Error, Result};

/// A clonable token used to request cancellation of in-flight enumerations.
///
/// All session queries that can enumerate large symbol populations accept a token and check
/// it once per symbol. Cloning the token is cheap and every clone observes the same
/// cancellation state, so a caller can hand one clone to a worker thread and keep another
/// to cancel from a UI or timeout path.
///
/// A default-constructed token is never cancelled, which is the right thing to pass when a
/// caller has no cancellation source.
///
/// # Examples
///
/// ```rust
/// use sizescope::CancellationToken;
///
/// let token = CancellationToken::new();
/// let worker_token = token.clone();
///
/// assert!(worker_token.check().is_ok());
///
/// token.cancel();
/// assert!(worker_token.is_cancelled());
/// assert!(worker_token.check().is_err());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Creates a token in the not-cancelled state.
    #[must_use]
    pub fn new() -> CancellationToken {
        CancellationToken {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Requests cancellation. All clones of this token observe the request.
    ///
    /// Cancelling is idempotent and cannot be undone.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Returns [`Error::Cancelled`] if cancellation has been requested.
    ///
    /// This is the form enumeration loops use: `token.check()?;` once per symbol.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] when the token has been cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn fresh_token_is_not_cancelled() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());
    }

    #[test]
    fn clones_share_state() {
        let token = CancellationToken::new();
        let clone = token.clone();

        token.cancel();

        assert!(clone.is_cancelled());
        assert!(matches!(clone.check(), Err(Error::Cancelled)));
    }

    #[test]
    fn cancellation_is_visible_across_threads() {
        let token = CancellationToken::new();
        let worker = token.clone();

        let handle = thread::spawn(move || {
            while !worker.is_cancelled() {
                thread::yield_now();
            }
            true
        });

        token.cancel();
        assert!(handle.join().unwrap());
    }
}
