//! Accept loop.
//!
//! The listener is non-blocking and registered with a mio poller next to
//! the shutdown waker. Each iteration waits at most one poll interval,
//! drains every pending connection into a new worker thread, and sweeps
//! finished workers out of the registry.

use crate::runtime::registry::{WorkerHandle, WorkerRegistry};
use crate::runtime::shutdown::Shutdown;
use crate::runtime::worker::ClientWorker;
use crate::runtime::{Context, ServerError};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);

/// Listening socket plus the poller that bounds every accept wait.
pub struct ConnectionAcceptor {
    listener: TcpListener,
    local_addr: SocketAddr,
    poll: Poll,
    events: Events,
    poll_interval: Duration,
    shutdown: Arc<Shutdown>,
    next_conn_id: u64,
}

impl ConnectionAcceptor {
    /// Bind the listener and build the shutdown flag wired to its poller.
    pub fn bind(addr: SocketAddr, backlog: i32, poll_interval: Duration) -> Result<Self, ServerError> {
        let listener = create_listener(addr, backlog).map_err(|e| ServerError::Bind(addr, e))?;
        let local_addr = listener.local_addr().map_err(|e| ServerError::Bind(addr, e))?;

        let poll = Poll::new().map_err(ServerError::Poll)?;
        poll.registry()
            .register(
                &mut SourceFd(&listener.as_raw_fd()),
                LISTENER_TOKEN,
                Interest::READABLE,
            )
            .map_err(ServerError::Poll)?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN).map_err(ServerError::Poll)?;

        info!(addr = %local_addr, backlog, "Listening");

        Ok(Self {
            listener,
            local_addr,
            poll,
            events: Events::with_capacity(64),
            poll_interval,
            shutdown: Arc::new(Shutdown::new(waker)),
            next_conn_id: 0,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(&self) -> &Arc<Shutdown> {
        &self.shutdown
    }

    /// Accept connections until shutdown is requested.
    ///
    /// Returns with the registry still holding any running workers; joining
    /// them is the shutdown coordinator's job.
    pub fn run(&mut self, ctx: &Context, registry: &mut WorkerRegistry) -> Result<(), ServerError> {
        while !self.shutdown.is_requested() {
            match self.poll.poll(&mut self.events, Some(self.poll_interval)) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "Poll failed");
                    return Err(ServerError::Poll(e));
                }
            }

            // Try even without a listener event: an earlier pass may have
            // stopped on a transient error with connections still queued.
            self.accept_connections(ctx, registry);

            let reaped = registry.try_reap();
            if reaped.joined > 0 {
                debug!(reaped = reaped.joined, live = registry.len(), "Reaped workers");
            }
        }

        info!(live = registry.len(), "Stopped accepting connections");
        Ok(())
    }

    /// Drain the accept queue until `WouldBlock`.
    fn accept_connections(&mut self, ctx: &Context, registry: &mut WorkerRegistry) {
        loop {
            if self.shutdown.is_requested() {
                return;
            }

            match self.listener.accept() {
                Ok((stream, peer)) => {
                    info!(peer = %peer, "Accepted connection from {}", peer.ip());
                    if let Err(e) = self.spawn_worker(stream, peer, ctx, registry) {
                        warn!(peer = %peer, error = %e, "Failed to start worker");
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // Transient (e.g. EMFILE, ECONNABORTED); retry next iteration.
                    warn!(error = %e, "Failed to accept connection");
                    return;
                }
            }
        }
    }

    fn spawn_worker(
        &mut self,
        stream: TcpStream,
        peer: SocketAddr,
        ctx: &Context,
        registry: &mut WorkerRegistry,
    ) -> io::Result<()> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(self.poll_interval))?;

        let conn_id = self.next_conn_id;
        self.next_conn_id += 1;

        let worker = ClientWorker::new(stream, peer, ctx.clone());
        let handle = WorkerHandle::spawn(conn_id, peer, move || worker.run())?;
        registry.insert(handle);
        Ok(())
    }
}

/// Create a non-blocking TCP listener with `SO_REUSEADDR`.
///
/// An IPv6 address also accepts IPv4 clients.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}
