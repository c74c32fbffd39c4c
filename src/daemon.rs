//! Detaching from the controlling terminal.

use std::fs::OpenOptions;
use std::io;
use std::os::unix::io::AsRawFd;

/// Double-fork into the background.
///
/// Must be called before any thread is spawned: `fork` only copies the
/// calling thread. The original process and the intermediate child exit
/// with status 0; only the grandchild returns.
pub fn daemonize() -> io::Result<()> {
    fork_and_exit_parent()?;

    // SAFETY: plain syscall with no pointer arguments.
    if unsafe { libc::setsid() } == -1 {
        return Err(io::Error::last_os_error());
    }

    // A session leader could reacquire a terminal; its child cannot.
    fork_and_exit_parent()?;

    std::env::set_current_dir("/")?;
    redirect_stdio()
}

fn fork_and_exit_parent() -> io::Result<()> {
    // SAFETY: the process is single-threaded at this point.
    match unsafe { libc::fork() } {
        -1 => Err(io::Error::last_os_error()),
        0 => Ok(()),
        _ => std::process::exit(0),
    }
}

/// Point stdin, stdout and stderr at /dev/null.
fn redirect_stdio() -> io::Result<()> {
    let null = OpenOptions::new().read(true).write(true).open("/dev/null")?;
    for fd in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        // SAFETY: both descriptors are valid for the duration of the call.
        if unsafe { libc::dup2(null.as_raw_fd(), fd) } == -1 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
