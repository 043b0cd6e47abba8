//! The daemon-side main loop.

use std::fs::{DirBuilder, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use tracing::{debug, error, info};
use valuable::Valuable;

use crate::config::DaemonConfig;
use crate::exit_code::ExitCode;
use crate::pipe::{PipeError, PipeReader, PipeWriter};
use crate::process::SecurityMonitor;
use crate::signals;

// Only one live DaemonLoop may exist per process.
static LIVE_LOOP: AtomicBool = AtomicBool::new(false);

/// The behavior a daemon plugs into its [`DaemonLoop`].
///
/// `handle_parent_message` runs on the input pipe's reader thread,
/// concurrently with `action` on the loop's thread. The framework does no
/// queuing; synchronizing state between the two is the implementor's
/// responsibility.
pub trait DaemonService: Send + Sync {
    /// Runs once after the security checks pass, before the first `action`.
    /// A nonzero return cancels the loop and becomes the exit code.
    fn init(&self) -> i32 {
        0
    }

    /// One loop iteration. Returning nonzero stops the loop with that exit
    /// code; implementations should return promptly so termination and
    /// liveness checks stay responsive.
    fn action(&self) -> i32;

    /// Receives each message the parent writes into the input pipe.
    fn handle_parent_message(&self, message: &[u8]) {
        let _ = message;
    }
}

/// A cloneable handle for sending messages to the parent process.
#[derive(Clone)]
pub struct ParentLink {
    writer: Arc<PipeWriter>,
}

impl ParentLink {
    pub fn send(&self, message: &[u8]) -> Result<(), PipeError> {
        self.writer.send(message)
    }
}

/// Owns the daemon's pipe endpoints, lock file, security monitor, and
/// termination handling, and drives a [`DaemonService`].
///
/// # Panics
///
/// Constructing a second `DaemonLoop` while another one is live in the same
/// process is a programmer error and panics immediately.
pub struct DaemonLoop<S: DaemonService + 'static> {
    config: DaemonConfig,
    service: Arc<S>,
    security: SecurityMonitor,
    reader: Option<PipeReader>,
    writer: Option<Arc<PipeWriter>>,
    lock: Option<Flock<File>>,
    running: AtomicBool,
}

impl<S: DaemonService + 'static> DaemonLoop<S> {
    /// Prepares the loop: claims the per-process instance slot, installs the
    /// SIGTERM handler, and pre-arms both pipe endpoints so neither blocks
    /// the caller.
    pub fn new(config: DaemonConfig, service: Arc<S>) -> Self {
        if LIVE_LOOP.swap(true, Ordering::SeqCst) {
            panic!("created more than one live DaemonLoop in this process");
        }

        if !signals::handler_installed() {
            signals::install_term_handler();
        }
        signals::ignore_sigpipe();

        let security = SecurityMonitor::new(config.security.clone());

        let writer = config.output_pipe.as_ref().map(|path| {
            let writer = Arc::new(PipeWriter::new(path));
            writer.open();
            writer
        });
        let reader = config.input_pipe.as_ref().map(|path| {
            let service = Arc::clone(&service);
            let reader = PipeReader::new(path, config.input_buffer_size, move |bytes: &[u8]| {
                service.handle_parent_message(bytes);
            });
            reader.open();
            reader
        });

        info!(config = config.as_value(), "daemon loop ready");
        Self {
            config,
            service,
            security,
            reader,
            writer,
            lock: None,
            running: AtomicBool::new(false),
        }
    }

    /// Whether [`run`](Self::run) is currently executing.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// A handle for messaging the parent, if the output pipe is configured.
    pub fn parent_link(&self) -> Option<ParentLink> {
        self.writer.as_ref().map(|writer| ParentLink {
            writer: Arc::clone(writer),
        })
    }

    /// Sends a message to the parent through the output pipe.
    pub fn message_parent(&self, message: &[u8]) -> Result<(), PipeError> {
        match &self.writer {
            Some(writer) => writer.send(message),
            None => Err(PipeError::Disabled),
        }
    }

    /// Runs the daemon: acquires the single-instance lock, performs the
    /// configured security checks, then iterates the service's `action`
    /// under termination, liveness, and timeout supervision.
    ///
    /// The return value is the process exit code: an [`ExitCode`] value for
    /// framework-initiated exits, or whatever nonzero value `init`/`action`
    /// returned.
    pub fn run(&mut self) -> i32 {
        if self.running.swap(true, Ordering::SeqCst) {
            return ExitCode::DaemonAlreadyRunning.code();
        }
        let code = self.supervise();
        self.running.store(false, Ordering::SeqCst);
        code
    }

    fn supervise(&mut self) -> i32 {
        if signals::was_terminated() {
            info!("termination signal before startup");
            return ExitCode::Success.code();
        }

        if let Some(path) = self.config.lock_file.clone() {
            if self.lock.is_none() {
                match acquire_lock(&path) {
                    Ok(lock) => self.lock = Some(lock),
                    Err(LockError::Held) => {
                        info!(path = %path.display(), "another daemon holds the lock");
                        return ExitCode::DaemonAlreadyRunning.code();
                    }
                    Err(LockError::Io(err)) => {
                        // Exclusivity cannot be proven, so refuse to run.
                        error!(path = %path.display(), %err, "failed to acquire lock file");
                        return ExitCode::DaemonAlreadyRunning.code();
                    }
                }
            }
        }

        if !self.security.valid_daemon_path() {
            error!("daemon executable path check failed");
            return ExitCode::BadDaemonPath.code();
        }
        if !self.security.valid_parent_path() {
            error!("parent executable path check failed");
            return ExitCode::BadParentPath.code();
        }
        if !self.security.daemon_dir_secured() {
            error!("daemon executable directory is not secured");
            return ExitCode::InsecureDaemonDir.code();
        }
        if !self.security.parent_dir_secured() {
            error!("parent executable directory is not secured");
            return ExitCode::InsecureParentDir.code();
        }

        if signals::was_terminated() {
            info!("termination signal during startup");
            return ExitCode::Success.code();
        }

        let code = self.service.init();
        if code != 0 {
            debug!(code, "service init cancelled the loop");
            return code;
        }

        let started = Instant::now();
        loop {
            if signals::was_terminated() {
                info!("termination signal received, exiting");
                return ExitCode::Success.code();
            }
            if !self.security.parent_running() {
                info!("parent process ended, exiting");
                return ExitCode::ParentEnded.code();
            }
            if let Some(secs) = self.config.timeout_secs {
                if started.elapsed() >= Duration::from_secs(secs) {
                    info!("timeout reached, exiting");
                    return ExitCode::Success.code();
                }
            }
            let code = self.service.action();
            if code != 0 {
                debug!(code, "service action stopped the loop");
                return code;
            }
        }
    }
}

impl<S: DaemonService + 'static> Drop for DaemonLoop<S> {
    fn drop(&mut self) {
        if let Some(reader) = &self.reader {
            reader.close();
        }
        if let Some(writer) = &self.writer {
            writer.close();
        }
        self.lock = None;
        LIVE_LOOP.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, thiserror::Error)]
enum LockError {
    #[error("the lock is held by another process")]
    Held,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Opens the lock file (creating parent directories as needed) and takes an
/// exclusive advisory lock in a single nonblocking operation. The holder's
/// pid is left in the file for inspection.
fn acquire_lock(path: &Path) -> Result<Flock<File>, LockError> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            DirBuilder::new().recursive(true).mode(0o700).create(dir)?;
        }
    }
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .mode(0o644)
        .open(path)?;

    let lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(lock) => lock,
        Err((_, errno)) if errno == Errno::EWOULDBLOCK => return Err(LockError::Held),
        Err((_, errno)) => return Err(LockError::Io(io::Error::from(errno))),
    };

    lock.set_len(0)?;
    let mut file: &File = &lock;
    file.write_all(std::process::id().to_string().as_bytes())?;
    debug!(path = %path.display(), "acquired daemon lock");
    Ok(lock)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::atomic::AtomicI32;
    use std::time::Instant;

    use assert_matches::assert_matches;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    use pretty_assertions::assert_eq;

    use super::*;

    struct TestService {
        actions: AtomicI32,
        limit: i32,
        exit_code: i32,
        init_code: i32,
    }

    impl TestService {
        fn new(limit: i32, exit_code: i32, init_code: i32) -> Self {
            Self {
                actions: AtomicI32::new(0),
                limit,
                exit_code,
                init_code,
            }
        }

        fn actions(&self) -> i32 {
            self.actions.load(Ordering::SeqCst)
        }
    }

    impl DaemonService for TestService {
        fn init(&self) -> i32 {
            self.init_code
        }

        fn action(&self) -> i32 {
            let count = self.actions.fetch_add(1, Ordering::SeqCst) + 1;
            if count >= self.limit {
                self.exit_code
            } else {
                0
            }
        }
    }

    #[test]
    fn lock_file_admits_exactly_one_holder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.lck");

        let first = acquire_lock(&path).unwrap();
        assert_matches!(acquire_lock(&path), Err(LockError::Held));

        drop(first);
        acquire_lock(&path).unwrap();
    }

    #[test]
    fn lock_file_records_the_holder_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.lck");

        let _guard = acquire_lock(&path).unwrap();

        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            std::process::id().to_string()
        );
    }

    #[test]
    fn lock_file_creates_missing_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("var/lock/daemon.lck");

        acquire_lock(&path).unwrap();
        assert!(path.exists());
    }

    // Every DaemonLoop construction lives in this one test: only one live
    // loop may exist per process, and the test harness runs tests
    // concurrently. The SIGTERM section stays last because the termination
    // flag never clears.
    #[test]
    fn daemon_loop_lifecycle() {
        // A nonzero action code stops the loop and becomes the exit code.
        let service = Arc::new(TestService::new(3, 9, 0));
        let mut daemon = DaemonLoop::new(DaemonConfig::default(), Arc::clone(&service));
        assert!(!daemon.is_running());
        assert_eq!(daemon.run(), 9);
        assert_eq!(service.actions(), 3);
        assert!(!daemon.is_running());
        assert_matches!(daemon.message_parent(b"hello"), Err(PipeError::Disabled));
        assert!(daemon.parent_link().is_none());
        drop(daemon);

        // A nonzero init code short-circuits before the first action.
        let service = Arc::new(TestService::new(1, 0, 42));
        let mut daemon = DaemonLoop::new(DaemonConfig::default(), Arc::clone(&service));
        assert_eq!(daemon.run(), 42);
        assert_eq!(service.actions(), 0);
        drop(daemon);

        // A zero-second timeout exits before the first action.
        let service = Arc::new(TestService::new(i32::MAX, 0, 0));
        let config = DaemonConfig {
            timeout_secs: Some(0),
            ..Default::default()
        };
        let mut daemon = DaemonLoop::new(config, Arc::clone(&service));
        assert_eq!(daemon.run(), ExitCode::Success.code());
        assert_eq!(service.actions(), 0);
        drop(daemon);

        // A held lock turns the daemon away; releasing it lets a retry in.
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("daemon.lck");
        let held = acquire_lock(&lock_path).unwrap();
        let service = Arc::new(TestService::new(1, 11, 0));
        let config = DaemonConfig {
            lock_file: Some(lock_path.clone()),
            ..Default::default()
        };
        let mut daemon = DaemonLoop::new(config, Arc::clone(&service));
        assert_eq!(daemon.run(), ExitCode::DaemonAlreadyRunning.code());
        assert_eq!(service.actions(), 0);
        drop(held);
        assert_eq!(daemon.run(), 11);
        assert_eq!(service.actions(), 1);
        drop(daemon);

        // An already-caught SIGTERM makes run() exit before any action.
        let service = Arc::new(TestService::new(i32::MAX, 0, 0));
        let mut daemon = DaemonLoop::new(DaemonConfig::default(), Arc::clone(&service));
        kill(Pid::this(), Signal::SIGTERM).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !signals::was_terminated() {
            assert!(Instant::now() < deadline, "SIGTERM flag never rose");
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(daemon.run(), ExitCode::Success.code());
        assert_eq!(service.actions(), 0);
    }
}
