use std::path::Path;

use nix::sys::stat::{lstat, Mode, SFlag};
use tracing::debug;

use crate::config::SecurityPolicy;
use crate::process::{ProcessData, ProcessState};

/// Validates the daemon's execution environment against a
/// [`SecurityPolicy`].
///
/// Holds snapshots of the daemon's own process and its parent. Every check
/// gated off in the policy passes trivially, mirroring the original's
/// per-feature build flags.
pub struct SecurityMonitor {
    policy: SecurityPolicy,
    daemon: ProcessData,
    parent: ProcessData,
}

impl SecurityMonitor {
    pub fn new(policy: SecurityPolicy) -> Self {
        let daemon = ProcessData::read(std::process::id() as i32);
        let parent = if daemon.is_valid() {
            ProcessData::read(daemon.parent_pid())
        } else {
            ProcessData::invalid()
        };
        Self {
            policy,
            daemon,
            parent,
        }
    }

    /// The daemon executable runs from its pinned path.
    pub fn valid_daemon_path(&self) -> bool {
        match &self.policy.daemon_path {
            Some(path) => process_at_path(&self.daemon, path),
            None => true,
        }
    }

    /// The parent executable runs from its pinned path.
    pub fn valid_parent_path(&self) -> bool {
        match &self.policy.parent_path {
            Some(path) => process_at_path(&self.parent, path),
            None => true,
        }
    }

    /// The daemon executable's directory is modifiable only by root.
    pub fn daemon_dir_secured(&self) -> bool {
        if !self.policy.check_daemon_dir {
            return true;
        }
        executable_dir_secured(&self.daemon)
    }

    /// The parent executable's directory is modifiable only by root.
    pub fn parent_dir_secured(&self) -> bool {
        if !self.policy.check_parent_dir {
            return true;
        }
        executable_dir_secured(&self.parent)
    }

    /// The parent process is still alive, observed fresh on every call.
    pub fn parent_running(&mut self) -> bool {
        if !self.policy.require_running_parent {
            return true;
        }
        self.parent.update();
        !matches!(
            self.parent.state(),
            ProcessState::Stopped
                | ProcessState::Zombie
                | ProcessState::Dead
                | ProcessState::Invalid
        )
    }
}

fn process_at_path(process: &ProcessData, expected: &Path) -> bool {
    if !process.is_valid() {
        debug!("process record is not valid");
        return false;
    }
    if process.exe_path() != expected {
        debug!(
            actual = %process.exe_path().display(),
            expected = %expected.display(),
            "process running from unexpected executable path"
        );
        return false;
    }
    true
}

fn executable_dir_secured(process: &ProcessData) -> bool {
    if !process.is_valid() {
        return false;
    }
    match process.exe_path().parent() {
        Some(dir) => directory_secured(dir),
        None => false,
    }
}

/// A directory counts as secured when it is a real directory (not a
/// symlink), owned by uid 0 and gid 0, with the world-write bit clear.
fn directory_secured(dir: &Path) -> bool {
    let info = match lstat(dir) {
        Ok(info) => info,
        Err(err) => {
            debug!(dir = %dir.display(), %err, "cannot stat directory, treating as unsecured");
            return false;
        }
    };
    if info.st_mode & SFlag::S_IFMT.bits() != SFlag::S_IFDIR.bits() {
        debug!(dir = %dir.display(), "path is not a directory");
        return false;
    }
    if info.st_uid != 0 || info.st_gid != 0 {
        debug!(dir = %dir.display(), "directory is not exclusively owned by root");
        return false;
    }
    if info.st_mode & Mode::S_IWOTH.bits() != 0 {
        debug!(dir = %dir.display(), "directory is world-writable");
        return false;
    }
    true
}
