//! Registry of spawned client workers.
//!
//! The acceptor inserts a handle for every worker it spawns and sweeps out
//! finished ones between accepts; the shutdown coordinator joins whatever
//! is left. Removing a handle and joining its thread happen together, so a
//! handle can never be released twice or outlive its bookkeeping.

use slab::Slab;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

/// Sets the completion flag when the worker thread exits, including by panic.
struct CompletionGuard(Arc<AtomicBool>);

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

/// A spawned worker thread and its bookkeeping.
#[derive(Debug)]
pub struct WorkerHandle {
    /// Sequence number of the accepted connection.
    pub conn_id: u64,
    pub peer: SocketAddr,
    done: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl WorkerHandle {
    /// Spawn `work` on a thread named after the connection.
    pub fn spawn<F>(conn_id: u64, peer: SocketAddr, work: F) -> io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let done = Arc::new(AtomicBool::new(false));
        let guard = CompletionGuard(Arc::clone(&done));

        let thread = thread::Builder::new()
            .name(format!("client-{conn_id}"))
            .spawn(move || {
                let _guard = guard;
                work();
            })?;

        Ok(Self {
            conn_id,
            peer,
            done,
            thread,
        })
    }

    /// Whether the worker has finished running its task.
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Wait for the thread to exit. Returns `false` if it panicked.
    fn join(self) -> bool {
        match self.thread.join() {
            Ok(()) => true,
            Err(_) => {
                error!(conn_id = self.conn_id, peer = %self.peer, "Worker panicked");
                false
            }
        }
    }
}

/// Outcome of joining a batch of workers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct JoinSummary {
    pub joined: usize,
    pub panicked: usize,
}

impl JoinSummary {
    fn record(&mut self, clean: bool) {
        self.joined += 1;
        if !clean {
            self.panicked += 1;
        }
    }
}

/// Registry of live workers using slab allocation.
#[derive(Default)]
pub struct WorkerRegistry {
    workers: Slab<WorkerHandle>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of a freshly spawned worker.
    pub fn insert(&mut self, handle: WorkerHandle) -> usize {
        self.workers.insert(handle)
    }

    /// Remove and join every worker whose completion flag is set.
    ///
    /// Never waits on a worker that is still running its task.
    pub fn try_reap(&mut self) -> JoinSummary {
        let finished: Vec<usize> = self
            .workers
            .iter()
            .filter(|(_, worker)| worker.is_done())
            .map(|(key, _)| key)
            .collect();

        let mut summary = JoinSummary::default();
        for key in finished {
            let worker = self.workers.remove(key);
            debug!(conn_id = worker.conn_id, "Reaped worker");
            summary.record(worker.join());
        }
        summary
    }

    /// Block until every registered worker has exited, then empty the registry.
    ///
    /// Calling it again on an empty registry is a no-op.
    pub fn join_all(&mut self) -> JoinSummary {
        let mut summary = JoinSummary::default();
        for worker in self.workers.drain() {
            summary.record(worker.join());
        }
        summary
    }

    /// Number of workers not yet reaped or joined.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}
