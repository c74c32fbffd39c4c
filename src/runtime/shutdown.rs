//! Shutdown flag and the drain sequence that follows it.
//!
//! `Shutdown` is the only process-wide state: a monotonic flag plus the
//! means to wake everything that waits on it. Triggering it never does any
//! cleanup itself; `ShutdownCoordinator` runs the cleanup on the main thread
//! once the acceptor has stopped.

use crate::runtime::registry::WorkerRegistry;
use crate::runtime::Context;
use crate::storage::StoreError;
use mio::Waker;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{error, info, warn};

/// Monotonic "shutdown requested" flag.
pub struct Shutdown {
    requested: AtomicBool,
    lock: Mutex<()>,
    cvar: Condvar,
    /// Unblocks the acceptor's poll.
    waker: Waker,
}

impl Shutdown {
    pub fn new(waker: Waker) -> Self {
        Self {
            requested: AtomicBool::new(false),
            lock: Mutex::new(()),
            cvar: Condvar::new(),
            waker,
        }
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Request shutdown and wake every waiter.
    ///
    /// Returns `true` only for the call that flipped the flag.
    pub fn trigger(&self) -> bool {
        {
            // Flip under the lock so a sleeper cannot miss the notification.
            let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
            if self.requested.swap(true, Ordering::AcqRel) {
                return false;
            }
        }
        self.cvar.notify_all();

        if let Err(e) = self.waker.wake() {
            // The acceptor still notices within one poll interval.
            warn!(error = %e, "Failed to wake acceptor");
        }
        true
    }

    /// Sleep for `timeout` or until shutdown is requested.
    ///
    /// Returns `true` if shutdown has been requested.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = self
            .cvar
            .wait_timeout_while(guard, timeout, |_| !self.is_requested())
            .unwrap_or_else(PoisonError::into_inner);
        self.is_requested()
    }
}

/// Runs the drain sequence once the acceptor has stopped.
pub struct ShutdownCoordinator {
    ctx: Context,
}

impl ShutdownCoordinator {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Stop the ticker, join every worker, and delete the store.
    ///
    /// Every step runs even if an earlier one failed; failures are
    /// collected into the returned error.
    pub fn drain(
        self,
        mut registry: WorkerRegistry,
        ticker: Option<JoinHandle<()>>,
    ) -> Result<(), ShutdownError> {
        // Already set on the signal path; covers an acceptor that stopped on error.
        self.ctx.shutdown.trigger();

        let mut report = ShutdownError::default();

        if let Some(ticker) = ticker {
            if ticker.join().is_err() {
                error!("Timestamp ticker panicked");
                report.ticker_panicked = true;
            }
        }

        if !registry.is_empty() {
            info!(workers = registry.len(), "Waiting for workers to finish");
        }
        let joined = registry.join_all();
        report.panicked_workers = joined.panicked;

        info!(bytes = self.ctx.store.len(), "Removing store");
        if let Err(e) = self.ctx.store.remove() {
            error!(error = %e, "Failed to remove store");
            report.store = Some(e);
        }

        if report.is_clean() {
            info!(workers = joined.joined, "Shutdown complete");
            Ok(())
        } else {
            warn!(error = %report, "Shutdown completed with errors");
            Err(report)
        }
    }
}

/// Failures collected while draining.
#[derive(Debug, Default)]
pub struct ShutdownError {
    pub panicked_workers: usize,
    pub ticker_panicked: bool,
    pub store: Option<StoreError>,
}

impl ShutdownError {
    fn is_clean(&self) -> bool {
        self.panicked_workers == 0 && !self.ticker_panicked && self.store.is_none()
    }
}

impl std::fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut problems = Vec::new();
        if self.panicked_workers > 0 {
            problems.push(format!("{} worker(s) panicked", self.panicked_workers));
        }
        if self.ticker_panicked {
            problems.push("timestamp ticker panicked".to_string());
        }
        if let Some(e) = &self.store {
            problems.push(e.to_string());
        }
        write!(f, "Unclean shutdown: {}", problems.join("; "))
    }
}

impl std::error::Error for ShutdownError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.store.as_ref().map(|e| e as &(dyn std::error::Error + 'static))
    }
}
