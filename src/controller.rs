//! The parent-side daemon controller.

use std::ffi::{CString, OsString};
use std::fs;
use std::io;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::stat::Mode;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{execv, fork, ForkResult, Pid};
use tracing::{debug, info, warn};
use valuable::Valuable;

use crate::config::ControllerConfig;
use crate::exit_code::ExitCode;
use crate::pipe::{ensure_fifo, PipeError, PipeReader, PipeWriter};
use crate::signals;

/// How long the daemon gets to act on SIGTERM before SIGKILL follows.
const TERM_GRACE: Duration = Duration::from_secs(2);

/// Poll interval while waiting out the termination grace period.
const TERM_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error(transparent)]
    Pipe(#[from] PipeError),
    #[error("failed to fork the daemon process: {0}")]
    Fork(#[source] Errno),
    #[error("path or argument contains an interior NUL byte: {0:?}")]
    BadArgument(OsString),
}

/// Launches, messages, and terminates one daemon process.
///
/// The controller owns the parent side of both FIFOs and the child pid. The
/// daemon is kept a direct descendant (no double fork) so its liveness stays
/// observable through `waitpid`.
pub struct DaemonController {
    config: ControllerConfig,
    writer: Option<PipeWriter>,
    reader: Option<PipeReader>,
    child: Option<Pid>,
    exit_code: Option<i32>,
}

impl DaemonController {
    /// Prepares the controller, making sure both FIFOs exist with the
    /// expected modes: user-read on the from-daemon pipe, user-write on the
    /// to-daemon pipe. A pre-existing file with any other mode is a
    /// configuration error.
    pub fn new(config: ControllerConfig) -> Result<Self, ControllerError> {
        if let Some(path) = &config.from_daemon_pipe {
            ensure_fifo(path, Mode::S_IRUSR)?;
            debug!(path = %path.display(), "prepared from-daemon pipe");
        }
        if let Some(path) = &config.to_daemon_pipe {
            ensure_fifo(path, Mode::S_IWUSR)?;
            debug!(path = %path.display(), "prepared to-daemon pipe");
        }
        let writer = config.to_daemon_pipe.as_ref().map(PipeWriter::new);
        Ok(Self {
            config,
            writer,
            reader: None,
            child: None,
            exit_code: None,
        })
    }

    /// Forks and execs the daemon binary, arming both pipe endpoints first.
    ///
    /// `sink` receives every message the daemon writes into the from-daemon
    /// pipe, called from the reader thread. Starting an already-started
    /// controller is a no-op.
    ///
    /// In the child, every inherited descriptor except stdin/stdout/stderr
    /// is closed before exec; a leaked descriptor would hand the privileged
    /// daemon whatever the parent had open.
    pub fn start(
        &mut self,
        args: &[OsString],
        sink: impl FnMut(&[u8]) + Send + 'static,
    ) -> Result<(), ControllerError> {
        if self.child.is_some() {
            debug!("daemon process is already running");
            return Ok(());
        }
        signals::ignore_sigpipe();

        // Everything the child needs is allocated before the fork.
        let exec_path = cstring(self.config.daemon_path.as_os_str())?;
        let mut argv = vec![exec_path.clone()];
        for arg in args {
            argv.push(cstring(arg)?);
        }

        if let Some(path) = &self.config.to_daemon_pipe {
            let writer = PipeWriter::new(path);
            writer.open();
            self.writer = Some(writer);
        }
        if let Some(path) = &self.config.from_daemon_pipe {
            let reader = PipeReader::new(path, self.config.buffer_size, sink);
            reader.open();
            self.reader = Some(reader);
        }

        info!(config = self.config.as_value(), "launching daemon");
        match unsafe { fork() }.map_err(ControllerError::Fork)? {
            ForkResult::Parent { child } => {
                info!(pid = child.as_raw(), "daemon process forked");
                self.child = Some(child);
                self.exit_code = None;
                Ok(())
            }
            ForkResult::Child => {
                if sanitize_fds().is_err() {
                    unsafe { libc::_exit(ExitCode::FdCleanupFailed.code()) };
                }
                let _ = execv(&exec_path, &argv);
                unsafe { libc::_exit(ExitCode::DaemonExecFailed.code()) };
            }
        }
    }

    /// Terminates the daemon: SIGTERM, a bounded grace period, then SIGKILL
    /// and a blocking reap. Both pipe endpoints are closed afterwards even
    /// when the daemon had already died on its own.
    pub fn stop(&mut self) {
        if let Some(pid) = self.child {
            debug!(pid = pid.as_raw(), "stopping daemon");
            if let Err(err) = kill(pid, Signal::SIGTERM) {
                warn!(pid = pid.as_raw(), %err, "failed to signal daemon");
            }
            let deadline = Instant::now() + TERM_GRACE;
            while self.is_running() && Instant::now() < deadline {
                thread::sleep(TERM_POLL_INTERVAL);
            }
            if self.is_running() {
                warn!("daemon ignored SIGTERM, sending SIGKILL");
                if let Some(pid) = self.child {
                    let _ = kill(pid, Signal::SIGKILL);
                }
                self.wait_to_exit();
            }
        }

        if let Some(reader) = self.reader.take() {
            reader.close();
        }
        if let Some(writer) = self.writer.take() {
            writer.close();
        }
    }

    /// Polls the daemon without blocking, reaping it if it has exited.
    pub fn is_running(&mut self) -> bool {
        let Some(pid) = self.child else {
            return false;
        };
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => true,
            Ok(WaitStatus::Exited(_, code)) => {
                debug!(pid = pid.as_raw(), code, "daemon exited");
                self.child = None;
                self.exit_code = Some(code);
                false
            }
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                debug!(pid = pid.as_raw(), ?signal, "daemon killed by signal");
                self.child = None;
                self.exit_code = Some(128 + signal as i32);
                false
            }
            Ok(_) => true,
            Err(err) => {
                warn!(pid = pid.as_raw(), %err, "failed to check daemon status");
                self.child = None;
                false
            }
        }
    }

    /// Blocks until the daemon exits and returns its exit code. A daemon
    /// killed by a signal reports `128 + signo`.
    pub fn wait_to_exit(&mut self) -> i32 {
        while let Some(pid) = self.child {
            match waitpid(pid, None) {
                Ok(WaitStatus::Exited(_, code)) => {
                    debug!(pid = pid.as_raw(), code, "daemon exited");
                    self.child = None;
                    self.exit_code = Some(code);
                }
                Ok(WaitStatus::Signaled(_, signal, _)) => {
                    debug!(pid = pid.as_raw(), ?signal, "daemon killed by signal");
                    self.child = None;
                    self.exit_code = Some(128 + signal as i32);
                }
                Ok(status) => {
                    debug!(?status, "daemon changed state");
                }
                Err(Errno::EINTR) => {}
                Err(err) => {
                    warn!(pid = pid.as_raw(), %err, "failed to wait for daemon");
                    self.child = None;
                }
            }
        }
        self.exit_code.unwrap_or_else(|| ExitCode::Success.code())
    }

    /// Sends a message into the to-daemon pipe. A controller without a write
    /// direction silently accepts and drops the message.
    pub fn message(&self, message: &[u8]) -> Result<(), PipeError> {
        match &self.writer {
            Some(writer) => writer.send(message),
            None => Ok(()),
        }
    }

    /// The daemon's pid while it is running.
    pub fn daemon_pid(&mut self) -> Option<Pid> {
        if self.is_running() {
            self.child
        } else {
            None
        }
    }

    /// The exit code recorded after the daemon finished.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }
}

impl Drop for DaemonController {
    fn drop(&mut self) {
        self.stop();
    }
}

fn cstring<S: AsRef<std::ffi::OsStr> + ?Sized>(value: &S) -> Result<CString, ControllerError> {
    let value = value.as_ref();
    CString::new(value.as_bytes()).map_err(|_| ControllerError::BadArgument(value.to_os_string()))
}

/// Closes every inherited descriptor above stderr.
///
/// Runs in the forked child before exec. The `/proc/self/fd` listing
/// includes the directory iterator's own descriptor, which is gone once the
/// iterator drops; closing that number again reports EBADF, which is fine.
fn sanitize_fds() -> io::Result<()> {
    let mut fds: Vec<RawFd> = Vec::new();
    for entry in fs::read_dir("/proc/self/fd")? {
        let entry = entry?;
        if let Some(fd) = entry.file_name().to_str().and_then(|name| name.parse().ok()) {
            fds.push(fd);
        }
    }

    for fd in fds {
        if fd <= 2 {
            continue;
        }
        loop {
            let result = unsafe { libc::close(fd) };
            if result == 0 {
                break;
            }
            match io::Error::last_os_error().raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EBADF) => break,
                _ => return Err(io::Error::last_os_error()),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Instant;

    use pretty_assertions::assert_eq;

    use super::*;

    fn plain_config(daemon_path: &str) -> ControllerConfig {
        ControllerConfig::new(daemon_path)
    }

    fn os_args(args: &[&str]) -> Vec<OsString> {
        args.iter().map(OsString::from).collect()
    }

    #[test]
    fn reaps_the_exit_code_of_a_completed_daemon() {
        let mut controller = DaemonController::new(plain_config("/bin/true")).unwrap();
        controller.start(&[], |_| {}).unwrap();

        assert_eq!(controller.wait_to_exit(), 0);
        assert_eq!(controller.exit_code(), Some(0));
        assert!(!controller.is_running());
    }

    #[test]
    fn reports_a_nonzero_exit_code() {
        let mut controller = DaemonController::new(plain_config("/bin/false")).unwrap();
        controller.start(&[], |_| {}).unwrap();

        assert_eq!(controller.wait_to_exit(), 1);
    }

    #[test]
    fn exec_failure_reports_daemon_exec_failed() {
        let mut controller =
            DaemonController::new(plain_config("/nonexistent/daemon-binary")).unwrap();
        controller.start(&[], |_| {}).unwrap();

        assert_eq!(
            controller.wait_to_exit(),
            ExitCode::DaemonExecFailed.code()
        );
    }

    #[test]
    fn stop_terminates_the_daemon_within_the_grace_window() {
        let mut controller = DaemonController::new(plain_config("/bin/sleep")).unwrap();
        controller.start(&os_args(&["30"]), |_| {}).unwrap();
        assert!(controller.is_running());

        let started = Instant::now();
        controller.stop();

        assert!(!controller.is_running());
        assert!(started.elapsed() < Duration::from_secs(3));
        // sleep dies to the SIGTERM itself.
        assert_eq!(controller.exit_code(), Some(128 + Signal::SIGTERM as i32));
    }

    #[test]
    fn starting_twice_keeps_the_first_daemon() {
        let mut controller = DaemonController::new(plain_config("/bin/sleep")).unwrap();
        controller.start(&os_args(&["30"]), |_| {}).unwrap();
        let first = controller.daemon_pid().unwrap();

        controller.start(&os_args(&["30"]), |_| {}).unwrap();
        assert_eq!(controller.daemon_pid(), Some(first));

        controller.stop();
    }

    #[test]
    fn message_without_a_write_pipe_is_accepted() {
        let controller = DaemonController::new(plain_config("/bin/true")).unwrap();
        assert!(controller.message(b"dropped").is_ok());
    }

    #[test]
    fn receives_daemon_output_through_the_pipe() {
        // The from-daemon FIFO is created user-read-only, so opening it for
        // writing from the child needs root.
        if unsafe { libc::geteuid() } != 0 {
            eprintln!("skipping: requires root to write a 0400 FIFO");
            return;
        }

        let dir = tempfile::tempdir().unwrap();
        let pipe_path = dir.path().join("from-daemon.pipe");
        let mut config = plain_config("/bin/sh");
        config.from_daemon_pipe = Some(pipe_path.clone());

        let (tx, rx) = mpsc::channel();
        let mut controller = DaemonController::new(config).unwrap();
        let command = format!("printf hello > {}", pipe_path.display());
        controller
            .start(&os_args(&["-c", &command]), move |bytes: &[u8]| {
                tx.send(bytes.to_vec()).unwrap();
            })
            .unwrap();

        let received = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(received, b"hello");
        assert_eq!(controller.wait_to_exit(), 0);

        controller.stop();
    }
}
