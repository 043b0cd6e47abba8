use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use valuable::Valuable;

/// Default size of the buffer handed to pipe read callbacks.
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Which self-audit checks the daemon performs, and against which pinned
/// paths. Every check is independently optional; a disabled check always
/// passes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Valuable)]
pub struct SecurityPolicy {
    /// Exact path the daemon executable must be running from.
    pub daemon_path: Option<PathBuf>,
    /// Exact path the parent executable must be running from.
    pub parent_path: Option<PathBuf>,
    /// Require the daemon executable's directory to be root-secured.
    pub check_daemon_dir: bool,
    /// Require the parent executable's directory to be root-secured.
    pub check_parent_dir: bool,
    /// Exit when the parent process stops running.
    pub require_running_parent: bool,
}

/// Configuration for the daemon side of the framework.
///
/// Every optional feature of the daemon loop maps to an `Option` here; the
/// embedding application builds this once and hands it to
/// [`DaemonLoop::new`](crate::DaemonLoop::new).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Valuable)]
pub struct DaemonConfig {
    /// FIFO the daemon reads messages from (the parent writes here).
    pub input_pipe: Option<PathBuf>,
    /// FIFO the daemon writes messages to (the parent reads here).
    pub output_pipe: Option<PathBuf>,
    /// Lock file guaranteeing a single daemon instance.
    pub lock_file: Option<PathBuf>,
    /// Wall-clock seconds after which the loop exits normally.
    pub timeout_secs: Option<u64>,
    /// Size of the input pipe's read buffer.
    pub input_buffer_size: usize,
    pub security: SecurityPolicy,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            input_pipe: None,
            output_pipe: None,
            lock_file: None,
            timeout_secs: None,
            input_buffer_size: DEFAULT_BUFFER_SIZE,
            security: SecurityPolicy::default(),
        }
    }
}

/// Configuration for the parent-side controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Valuable)]
pub struct ControllerConfig {
    /// Path of the daemon binary to fork and exec.
    pub daemon_path: PathBuf,
    /// FIFO the controller writes into (the daemon's input pipe).
    pub to_daemon_pipe: Option<PathBuf>,
    /// FIFO the controller reads from (the daemon's output pipe).
    pub from_daemon_pipe: Option<PathBuf>,
    /// Size of the read buffer for the from-daemon pipe.
    pub buffer_size: usize,
}

impl ControllerConfig {
    pub fn new(daemon_path: impl Into<PathBuf>) -> Self {
        Self {
            daemon_path: daemon_path.into(),
            to_daemon_pipe: None,
            from_daemon_pipe: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}
