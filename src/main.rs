//! aesd-socket: a line-appending TCP log server
//!
//! Each client sends one newline-terminated message. The server appends it
//! to a shared log file and replies with the full log, then closes the
//! connection.
//!
//! Features:
//! - One worker thread per connection, reaped as they finish
//! - Periodic timestamp records interleaved with client messages
//! - Graceful SIGINT/SIGTERM shutdown that joins every worker and deletes the log
//! - Optional daemon mode
//! - Configuration via CLI arguments or TOML file

mod config;
mod daemon;
mod runtime;
mod storage;

use config::Config;
use runtime::signals::TerminationSignals;
use runtime::{Server, ServerError};
use std::sync::Arc;
use storage::SharedStore;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    if let Some(file) = config.open_log_file()? {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false)
                    .with_target(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }

    info!(
        listen = %config.listen,
        data_file = %config.data_file.display(),
        timestamp_interval = ?config.timestamp_interval,
        daemon = config.daemon,
        log_file = ?config.log_file,
        "Starting aesd-socket server"
    );

    let store = SharedStore::create(&config.data_file).map_err(|e| {
        error!(error = %e, "Failed to create store");
        e
    })?;

    let server = match setup(config, Arc::clone(&store)) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "Startup failed");
            discard_store(&store);
            return Err(e.into());
        }
    };

    if let Err(e) = server.run() {
        error!(error = %e, "Server exited with errors");
        return Err(e.into());
    }
    Ok(())
}

/// Bind, detach if requested, and route termination signals to the
/// shutdown flag. Everything up to the signal listener runs while the
/// process is still single-threaded.
fn setup(config: Config, store: Arc<SharedStore>) -> Result<Server, ServerError> {
    let daemon = config.daemon;
    let logs_to_stdout = config.log_file.is_none();
    let server = Server::bind(config, store)?;

    if daemon {
        if logs_to_stdout {
            warn!("No log file configured; log output is discarded once detached");
        }
        info!("Detaching from terminal");
        daemon::daemonize().map_err(ServerError::Daemonize)?;
    }

    let signals = TerminationSignals::block().map_err(ServerError::Signals)?;
    signals
        .spawn_listener(server.shutdown_handle())
        .map_err(ServerError::Spawn)?;

    info!(addr = %server.local_addr(), "Server ready");
    Ok(server)
}

/// Delete the store after a failed startup. A removal failure is logged,
/// not returned.
fn discard_store(store: &SharedStore) {
    if let Err(e) = store.remove() {
        error!(error = %e, "Failed to remove store");
    }
}
