use std::fmt::{self, Display};

/// Exit codes the daemon process reports back to its controller through the
/// normal wait status.
///
/// Values returned by a service's `action()` pass through untouched, so
/// user-defined codes should start at 9 to stay clear of this table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ExitCode {
    /// Normal exit: termination signal, timeout, or the service asked to stop.
    Success = 0,
    /// The daemon executable is not running from its pinned path.
    BadDaemonPath = 1,
    /// The parent executable is not running from its pinned path.
    BadParentPath = 2,
    /// The daemon executable's directory is not root-secured.
    InsecureDaemonDir = 3,
    /// The parent executable's directory is not root-secured.
    InsecureParentDir = 4,
    /// Another daemon instance holds the lock file.
    DaemonAlreadyRunning = 5,
    /// The daemon's parent process is no longer alive.
    ParentEnded = 6,
    /// The forked child could not sanitize its inherited file descriptors.
    FdCleanupFailed = 7,
    /// The forked child could not exec the daemon binary.
    DaemonExecFailed = 8,
}

impl ExitCode {
    /// The raw process exit code for this value.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Maps a raw exit code back to its framework meaning, if it has one.
    pub fn from_raw(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Success),
            1 => Some(Self::BadDaemonPath),
            2 => Some(Self::BadParentPath),
            3 => Some(Self::InsecureDaemonDir),
            4 => Some(Self::InsecureParentDir),
            5 => Some(Self::DaemonAlreadyRunning),
            6 => Some(Self::ParentEnded),
            7 => Some(Self::FdCleanupFailed),
            8 => Some(Self::DaemonExecFailed),
            _ => None,
        }
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code.code()
    }
}

impl Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            Self::Success => "normal exit",
            Self::BadDaemonPath => "daemon executable path mismatch",
            Self::BadParentPath => "parent executable path mismatch",
            Self::InsecureDaemonDir => "daemon directory not root-secured",
            Self::InsecureParentDir => "parent directory not root-secured",
            Self::DaemonAlreadyRunning => "another daemon instance holds the lock",
            Self::ParentEnded => "parent process is no longer alive",
            Self::FdCleanupFailed => "failed to sanitize inherited file descriptors",
            Self::DaemonExecFailed => "failed to exec the daemon binary",
        };
        f.write_str(message)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(ExitCode::Success, 0)]
    #[case(ExitCode::BadDaemonPath, 1)]
    #[case(ExitCode::BadParentPath, 2)]
    #[case(ExitCode::InsecureDaemonDir, 3)]
    #[case(ExitCode::InsecureParentDir, 4)]
    #[case(ExitCode::DaemonAlreadyRunning, 5)]
    #[case(ExitCode::ParentEnded, 6)]
    #[case(ExitCode::FdCleanupFailed, 7)]
    #[case(ExitCode::DaemonExecFailed, 8)]
    fn raw_codes_round_trip(#[case] code: ExitCode, #[case] raw: i32) {
        assert_eq!(code.code(), raw);
        assert_eq!(ExitCode::from_raw(raw), Some(code));
    }

    #[rstest]
    #[case(-1)]
    #[case(9)]
    #[case(255)]
    fn user_codes_have_no_framework_meaning(#[case] raw: i32) {
        assert_eq!(ExitCode::from_raw(raw), None);
    }
}
