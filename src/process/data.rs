use std::fs;
use std::path::{Path, PathBuf};

// Field offsets within /proc/<pid>/stat.
const STAT_PID: usize = 0;
const STAT_STATE: usize = 2;
const STAT_PARENT_PID: usize = 3;
const STAT_START_TIME: usize = 21;

/// Scheduler state of a process, from the state character in
/// `/proc/<pid>/stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Sleeping,
    DiskSleep,
    Stopped,
    TracingStop,
    Zombie,
    Dead,
    Idle,
    Unknown,
    /// The process could not be observed, or its pid has been reused.
    Invalid,
}

impl ProcessState {
    fn from_stat_char(c: char) -> Self {
        match c {
            'R' => Self::Running,
            'S' => Self::Sleeping,
            'D' => Self::DiskSleep,
            'T' => Self::Stopped,
            't' => Self::TracingStop,
            'Z' => Self::Zombie,
            'X' | 'x' => Self::Dead,
            'I' => Self::Idle,
            _ => Self::Unknown,
        }
    }
}

/// A snapshot of one process observed through procfs.
///
/// The executable path doubles as an identity check: when a later
/// [`update`](Self::update) finds a different path behind the same pid, the
/// pid has been reused and the record turns invalid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessData {
    pid: i32,
    parent_pid: i32,
    exe_path: PathBuf,
    state: ProcessState,
    start_time: u64,
}

impl ProcessData {
    /// Reads the current state of `pid`. Any read or parse failure yields an
    /// invalid record rather than an error.
    pub fn read(pid: i32) -> Self {
        Self::try_read(pid).unwrap_or_else(Self::invalid)
    }

    /// A record representing an unobservable process.
    pub fn invalid() -> Self {
        Self {
            pid: 0,
            parent_pid: 0,
            exe_path: PathBuf::new(),
            state: ProcessState::Invalid,
            start_time: 0,
        }
    }

    fn try_read(pid: i32) -> Option<Self> {
        let stat = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
        let fields: Vec<&str> = stat.split_whitespace().collect();

        let parsed_pid = fields.get(STAT_PID)?.parse().ok()?;
        let state = fields.get(STAT_STATE)?.chars().next()?;
        let parent_pid = fields.get(STAT_PARENT_PID)?.parse().ok()?;
        let start_time = fields.get(STAT_START_TIME)?.parse().ok()?;

        // Zombies and foreign-owned processes keep their stat file readable
        // while the exe link is not; the record stays valid with an empty
        // path in that case.
        let exe_path = fs::read_link(format!("/proc/{pid}/exe")).unwrap_or_default();

        Some(Self {
            pid: parsed_pid,
            parent_pid,
            exe_path,
            state: ProcessState::from_stat_char(state),
            start_time,
        })
    }

    /// Re-reads the process, invalidating the record when the pid now belongs
    /// to a different executable.
    pub fn update(&mut self) {
        let fresh = Self::read(self.pid);
        if fresh.exe_path == self.exe_path {
            *self = fresh;
        } else {
            *self = Self::invalid();
        }
    }

    pub fn is_valid(&self) -> bool {
        self.state != ProcessState::Invalid
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn parent_pid(&self) -> i32 {
        self.parent_pid
    }

    pub fn exe_path(&self) -> &Path {
        &self.exe_path
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Process start time in clock ticks since boot.
    pub fn start_time(&self) -> u64 {
        self.start_time
    }
}
