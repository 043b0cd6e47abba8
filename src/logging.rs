use std::fs::File;
use std::io;
use std::panic::set_hook;
use std::path::Path;
use std::sync::Mutex;

use tracing::{error, Level};
use tracing_subscriber::EnvFilter;

#[cfg(not(debug_assertions))]
const DEFAULT_LOG_LEVEL: Level = Level::DEBUG;

#[cfg(debug_assertions)]
const DEFAULT_LOG_LEVEL: Level = Level::TRACE;

/// Initializes logging for the parent process, writing to stderr.
pub fn init_parent_logging() {
    tracing_subscriber::fmt()
        .compact()
        .with_ansi(false)
        .with_writer(io::stderr)
        .with_env_filter(env_filter())
        .init();
}

/// Initializes logging for the daemon process.
///
/// The daemon owns no terminal, so output goes to a log file. A panic hook is
/// installed so that even a crashing daemon leaves a trace behind.
pub fn init_daemon_logging(write_path: impl AsRef<Path>) -> io::Result<()> {
    let writer = File::create(write_path)?;

    tracing_subscriber::fmt()
        .compact()
        .with_ansi(false)
        .with_writer(Mutex::new(writer))
        .with_env_filter(env_filter())
        .init();

    set_hook(Box::new(|p| {
        error!("{p:#?}");
    }));

    Ok(())
}

fn env_filter() -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(DEFAULT_LOG_LEVEL.into())
        .from_env_lossy()
}
