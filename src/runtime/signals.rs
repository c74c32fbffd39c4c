//! SIGINT/SIGTERM handling without asynchronous signal handlers.
//!
//! The termination signals are blocked before any thread exists, so every
//! thread inherits the mask and the kernel queues them. One listener thread
//! collects them with `sigwait(2)` and does nothing but trigger shutdown.

use crate::runtime::shutdown::Shutdown;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, info};

/// The set of signals that request shutdown.
#[derive(Clone, Copy)]
pub struct TerminationSignals {
    set: libc::sigset_t,
}

impl TerminationSignals {
    /// Block SIGINT and SIGTERM for the calling thread and every thread it
    /// spawns afterwards.
    pub fn block() -> io::Result<Self> {
        // SAFETY: sigemptyset initializes the set before sigaddset reads it.
        let set = unsafe {
            let mut set: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut set);
            libc::sigaddset(&mut set, libc::SIGINT);
            libc::sigaddset(&mut set, libc::SIGTERM);
            set
        };

        // SAFETY: `set` is initialized; the old mask is not requested.
        let rc = unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut()) };
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        Ok(Self { set })
    }

    /// Spawn the thread that turns each received signal into a shutdown
    /// trigger. It lives until the process exits; signals after the first
    /// are logged and otherwise ignored.
    pub fn spawn_listener(self, shutdown: Arc<Shutdown>) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("signal-listener".to_string())
            .spawn(move || loop {
                match self.wait() {
                    Ok(signal) => {
                        info!(signal = signal_name(signal), "Caught signal, exiting");
                        if !shutdown.trigger() {
                            info!("Shutdown already in progress");
                        }
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        error!(error = %e, "Waiting for signals failed");
                        return;
                    }
                }
            })
    }

    fn wait(&self) -> io::Result<libc::c_int> {
        let mut signal: libc::c_int = 0;
        // SAFETY: both pointers refer to live, initialized locals.
        let rc = unsafe { libc::sigwait(&self.set, &mut signal) };
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        Ok(signal)
    }
}

fn signal_name(signal: libc::c_int) -> &'static str {
    match signal {
        libc::SIGINT => "SIGINT",
        libc::SIGTERM => "SIGTERM",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::{Poll, Token, Waker};
    use std::os::unix::thread::JoinHandleExt;
    use std::time::{Duration, Instant};

    #[test]
    fn test_signals_trigger_shutdown_once() {
        let poll = Poll::new().unwrap();
        let waker = Waker::new(poll.registry(), Token(0)).unwrap();
        let shutdown = Arc::new(Shutdown::new(waker));

        // Signals are sent to the listener thread itself so no other test
        // thread can receive them.
        let signals = TerminationSignals::block().unwrap();
        let listener = signals.spawn_listener(Arc::clone(&shutdown)).unwrap();
        let thread = listener.as_pthread_t();

        for signal in [libc::SIGTERM, libc::SIGINT] {
            // SAFETY: the listener thread is alive and blocks both signals.
            assert_eq!(unsafe { libc::pthread_kill(thread, signal) }, 0);
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while !shutdown.is_requested() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(shutdown.is_requested());
        assert!(!shutdown.trigger());
    }

    #[test]
    fn test_signal_names() {
        assert_eq!(signal_name(libc::SIGINT), "SIGINT");
        assert_eq!(signal_name(libc::SIGTERM), "SIGTERM");
        assert_eq!(signal_name(libc::SIGHUP), "unknown");
    }
}
