//! Thread-per-connection server runtime.
//!
//! - `acceptor`: listener plus the bounded accept loop
//! - `worker`: one receive/append/reply cycle per connection
//! - `registry`: ownership of spawned workers until reaped or joined
//! - `ticker`: periodic timestamp records
//! - `shutdown`: the shutdown flag and the drain sequence
//! - `signals`: SIGINT/SIGTERM delivery to the shutdown flag

mod acceptor;
mod registry;
pub mod shutdown;
pub mod signals;
mod ticker;
mod worker;

use crate::config::Config;
use crate::storage::SharedStore;
use acceptor::ConnectionAcceptor;
use registry::WorkerRegistry;
use shutdown::{Shutdown, ShutdownCoordinator, ShutdownError};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use ticker::TimestampTicker;
use tracing::error;

/// Shared handles passed to every component.
#[derive(Clone)]
pub struct Context {
    pub store: Arc<SharedStore>,
    pub shutdown: Arc<Shutdown>,
}

/// A bound server that has not started accepting yet.
pub struct Server {
    config: Config,
    ctx: Context,
    acceptor: ConnectionAcceptor,
}

impl Server {
    /// Bind the listening socket. No threads are started here, so the
    /// process can still fork afterwards.
    pub fn bind(config: Config, store: Arc<SharedStore>) -> Result<Self, ServerError> {
        let acceptor = ConnectionAcceptor::bind(config.listen, config.backlog, config.poll_interval)?;
        let ctx = Context {
            store,
            shutdown: Arc::clone(acceptor.shutdown()),
        };
        Ok(Self {
            config,
            ctx,
            acceptor,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.acceptor.local_addr()
    }

    /// Handle for requesting shutdown from another thread.
    pub fn shutdown_handle(&self) -> Arc<Shutdown> {
        Arc::clone(&self.ctx.shutdown)
    }

    /// Serve until shutdown is requested, then drain.
    ///
    /// The drain sequence always runs once the ticker has started, even if
    /// the accept loop failed.
    pub fn run(mut self) -> Result<(), ServerError> {
        let ticker = match self.config.timestamp_interval {
            Some(interval) => match TimestampTicker::new(self.ctx.clone(), interval).spawn() {
                Ok(handle) => Some(handle),
                Err(e) => {
                    if let Err(e) = self.ctx.store.remove() {
                        error!(error = %e, "Failed to remove store");
                    }
                    return Err(ServerError::Spawn(e));
                }
            },
            None => None,
        };

        let mut registry = WorkerRegistry::new();
        let accepted = self.acceptor.run(&self.ctx, &mut registry);

        let drained = ShutdownCoordinator::new(self.ctx).drain(registry, ticker);

        accepted?;
        drained.map_err(ServerError::Shutdown)
    }
}

/// Server setup and teardown errors
#[derive(Debug)]
pub enum ServerError {
    Bind(SocketAddr, io::Error),
    Poll(io::Error),
    Signals(io::Error),
    Spawn(io::Error),
    Daemonize(io::Error),
    Shutdown(ShutdownError),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Bind(addr, e) => write!(f, "Failed to listen on {}: {}", addr, e),
            ServerError::Poll(e) => write!(f, "Poller failed: {}", e),
            ServerError::Signals(e) => write!(f, "Failed to set up signal handling: {}", e),
            ServerError::Spawn(e) => write!(f, "Failed to spawn thread: {}", e),
            ServerError::Daemonize(e) => write!(f, "Failed to daemonize: {}", e),
            ServerError::Shutdown(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Bind(_, e)
            | ServerError::Poll(e)
            | ServerError::Signals(e)
            | ServerError::Spawn(e)
            | ServerError::Daemonize(e) => Some(e),
            ServerError::Shutdown(e) => Some(e),
        }
    }
}
