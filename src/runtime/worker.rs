//! Per-connection worker.
//!
//! A worker serves exactly one message: it reads until the first newline,
//! appends that line to the store, writes the whole store back, and closes
//! the connection. A connection that ends before a newline is dropped
//! without touching the store.

use crate::runtime::Context;
use crate::storage::StoreError;
use bytes::{Bytes, BytesMut};
use std::io::{self, Read, Write};
use std::net::{Shutdown as NetShutdown, SocketAddr, TcpStream};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Receive chunk size
const RECV_CHUNK: usize = 1024;

/// How long to drain trailing input when the stream has no read timeout.
const DEFAULT_LINGER: Duration = Duration::from_millis(100);

/// How a connection's single message cycle ended.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Message appended and the store sent back.
    Replied { message: usize, reply: usize },
    /// Peer closed before sending a newline.
    Disconnected { discarded: usize },
    /// Shutdown was requested before a newline arrived.
    Abandoned { discarded: usize },
}

enum Received {
    Message(Bytes),
    Closed(usize),
    Abandoned(usize),
}

/// Worker that runs one receive/append/reply cycle on a connection.
pub struct ClientWorker {
    stream: TcpStream,
    peer: SocketAddr,
    ctx: Context,
}

impl ClientWorker {
    /// The stream must be blocking with a read timeout, so receive waits
    /// stay bounded and the shutdown flag is re-checked between them.
    pub fn new(stream: TcpStream, peer: SocketAddr, ctx: Context) -> Self {
        Self { stream, peer, ctx }
    }

    /// Serve the connection, logging rather than propagating failures.
    pub fn run(mut self) {
        match self.serve() {
            Ok(Outcome::Replied { message, reply }) => {
                debug!(peer = %self.peer, message, reply, "Sent store contents");
                self.linger();
            }
            Ok(Outcome::Disconnected { discarded }) => {
                debug!(peer = %self.peer, discarded, "Peer closed before end of message");
            }
            Ok(Outcome::Abandoned { discarded }) => {
                debug!(peer = %self.peer, discarded, "Abandoned connection for shutdown");
            }
            Err(e) => warn!(peer = %self.peer, error = %e, "Connection failed"),
        }

        let _ = self.stream.shutdown(NetShutdown::Both);
        info!(peer = %self.peer, "Closed connection from {}", self.peer.ip());
    }

    fn serve(&mut self) -> Result<Outcome, WorkerError> {
        let message = match self.receive_message()? {
            Received::Message(message) => message,
            Received::Closed(discarded) => return Ok(Outcome::Disconnected { discarded }),
            Received::Abandoned(discarded) => return Ok(Outcome::Abandoned { discarded }),
        };

        self.ctx.store.append(&message).map_err(WorkerError::Append)?;

        // Taken after our own append, so it always includes this message.
        let snapshot = self.ctx.store.snapshot();
        self.stream
            .write_all(&snapshot)
            .and_then(|()| self.stream.flush())
            .map_err(WorkerError::Send)?;

        Ok(Outcome::Replied {
            message: message.len(),
            reply: snapshot.len(),
        })
    }

    /// Half-close and discard input until the peer closes or one read
    /// timeout has passed.
    ///
    /// Closing with unread bytes in the receive queue makes the kernel send
    /// a reset, which can destroy a reply the peer has not read yet.
    fn linger(&mut self) {
        if self.stream.shutdown(NetShutdown::Write).is_err() {
            return;
        }
        let linger = match self.stream.read_timeout() {
            Ok(Some(timeout)) => timeout,
            _ => DEFAULT_LINGER,
        };
        if self.stream.set_read_timeout(Some(linger)).is_err() {
            return;
        }

        let deadline = Instant::now() + linger;
        let mut chunk = [0u8; RECV_CHUNK];
        let mut discarded = 0;
        while Instant::now() < deadline {
            match self.stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => discarded += n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => break,
            }
        }
        if discarded > 0 {
            debug!(peer = %self.peer, discarded, "Discarded input after reply");
        }
    }

    /// Read until the first newline, which is kept as part of the message.
    /// Bytes after it in the same read are dropped.
    fn receive_message(&mut self) -> Result<Received, WorkerError> {
        let mut message = BytesMut::with_capacity(RECV_CHUNK);
        let mut chunk = [0u8; RECV_CHUNK];

        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(Received::Closed(message.len())),
                Ok(n) => match chunk[..n].iter().position(|&b| b == b'\n') {
                    Some(pos) => {
                        message.extend_from_slice(&chunk[..=pos]);
                        if pos + 1 < n {
                            let dropped = n - pos - 1;
                            debug!(peer = %self.peer, dropped, "Ignoring bytes after newline");
                        }
                        return Ok(Received::Message(message.freeze()));
                    }
                    None => message.extend_from_slice(&chunk[..n]),
                },
                Err(ref e)
                    if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
                {
                    if self.ctx.shutdown.is_requested() {
                        return Ok(Received::Abandoned(message.len()));
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(WorkerError::Receive(e)),
            }
        }
    }
}

/// Errors that end a single worker
#[derive(Debug)]
pub enum WorkerError {
    Receive(io::Error),
    Append(StoreError),
    Send(io::Error),
}

impl std::fmt::Display for WorkerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerError::Receive(e) => write!(f, "receive failed: {}", e),
            WorkerError::Append(e) => write!(f, "append failed: {}", e),
            WorkerError::Send(e) => write!(f, "send failed: {}", e),
        }
    }
}

impl std::error::Error for WorkerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WorkerError::Receive(e) | WorkerError::Send(e) => Some(e),
            WorkerError::Append(e) => Some(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::shutdown::Shutdown;
    use crate::storage::SharedStore;
    use mio::{Poll, Token, Waker};
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        _poll: Poll,
        ctx: Context,
        listener: TcpListener,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let poll = Poll::new().unwrap();
        let waker = Waker::new(poll.registry(), Token(0)).unwrap();
        let ctx = Context {
            store: SharedStore::create(dir.path().join("data")).unwrap(),
            shutdown: Arc::new(Shutdown::new(waker)),
        };
        Fixture {
            _dir: dir,
            _poll: poll,
            ctx,
            listener: TcpListener::bind("127.0.0.1:0").unwrap(),
        }
    }

    impl Fixture {
        /// Accept one connection and serve it on this thread.
        fn serve_one(&self) -> Result<Outcome, WorkerError> {
            let (stream, peer) = self.listener.accept().unwrap();
            stream
                .set_read_timeout(Some(Duration::from_millis(20)))
                .unwrap();
            ClientWorker::new(stream, peer, self.ctx.clone()).serve()
        }

        fn connect(&self) -> TcpStream {
            TcpStream::connect(self.listener.local_addr().unwrap()).unwrap()
        }
    }

    fn finish(mut client: TcpStream) -> Vec<u8> {
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).unwrap();
        reply
    }

    #[test]
    fn test_message_split_across_reads() {
        let fx = fixture();
        fx.ctx.store.append(b"earlier\n").unwrap();

        let mut client = fx.connect();
        let sender = thread::spawn(move || {
            for part in [&b"hel"[..], b"lo wor", b"ld\n"] {
                client.write_all(part).unwrap();
                thread::sleep(Duration::from_millis(30));
            }
            client
        });

        let outcome = fx.serve_one().unwrap();
        assert_eq!(
            outcome,
            Outcome::Replied {
                message: 12,
                reply: 20
            }
        );

        let client = sender.join().unwrap();
        assert_eq!(finish(client), b"earlier\nhello world\n");
        assert_eq!(&fx.ctx.store.snapshot()[..], b"earlier\nhello world\n");
    }

    #[test]
    fn test_bytes_after_newline_are_dropped() {
        let fx = fixture();
        let mut client = fx.connect();
        client.write_all(b"first\nsecond\n").unwrap();

        let (stream, peer) = fx.listener.accept().unwrap();
        ClientWorker::new(stream, peer, fx.ctx.clone()).run();

        assert_eq!(finish(client), b"first\n");
        assert_eq!(&fx.ctx.store.snapshot()[..], b"first\n");
    }

    #[test]
    fn test_reply_survives_unread_trailing_input() {
        let fx = fixture();
        let mut client = fx.connect();

        // More than one receive chunk, so input is still queued after the
        // worker has found the newline.
        let mut sent = b"first\n".to_vec();
        sent.extend(std::iter::repeat(b'z').take(4 * RECV_CHUNK));
        client.write_all(&sent).unwrap();
        client.shutdown(NetShutdown::Write).unwrap();

        let (stream, peer) = fx.listener.accept().unwrap();
        stream
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        ClientWorker::new(stream, peer, fx.ctx.clone()).run();

        assert_eq!(finish(client), b"first\n");
        assert_eq!(&fx.ctx.store.snapshot()[..], b"first\n");
    }

    #[test]
    fn test_partial_message_is_not_stored() {
        let fx = fixture();
        let mut client = fx.connect();
        client.write_all(b"partial").unwrap();
        client.shutdown(NetShutdown::Write).unwrap();

        assert_eq!(
            fx.serve_one().unwrap(),
            Outcome::Disconnected { discarded: 7 }
        );
        assert!(fx.ctx.store.snapshot().is_empty());
    }

    #[test]
    fn test_shutdown_abandons_incomplete_message() {
        let fx = fixture();
        let mut client = fx.connect();
        client.write_all(b"no newline yet").unwrap();
        fx.ctx.shutdown.trigger();

        assert_eq!(
            fx.serve_one().unwrap(),
            Outcome::Abandoned { discarded: 14 }
        );
        assert!(fx.ctx.store.snapshot().is_empty());
    }

    #[test]
    fn test_append_failure_ends_worker_only() {
        let fx = fixture();
        fx.ctx.store.remove().unwrap();

        let mut client = fx.connect();
        client.write_all(b"late\n").unwrap();
        assert!(matches!(
            fx.serve_one(),
            Err(WorkerError::Append(StoreError::Closed))
        ));
    }
}
