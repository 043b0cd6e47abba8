//! Named-pipe endpoints.
//!
//! A FIFO path plus its permission mode is the trust anchor between the
//! parent and the daemon: [`ensure_fifo`] creates the file when absent and
//! refuses to touch an existing file whose mode is not exactly the expected
//! one. Repairing a wrong-mode file would let a local attacker pre-plant a
//! pipe and observe daemon-only traffic.

mod reader;
mod writer;

use std::fs::DirBuilder;
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::stat::{stat, Mode, SFlag};
use nix::unistd::mkfifo;
use tracing::debug;

pub use reader::PipeReader;
pub use writer::PipeWriter;

#[derive(Debug, thiserror::Error)]
pub enum PipeError {
    #[error("failed to inspect pipe path {path:?}: {source}")]
    Stat { path: PathBuf, source: Errno },
    #[error("path {path:?} exists but is not a FIFO with mode {expected:o} (found {actual:o})")]
    WrongMode {
        path: PathBuf,
        expected: libc::mode_t,
        actual: libc::mode_t,
    },
    #[error("failed to create pipe directory for {path:?}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },
    #[error("failed to create FIFO at {path:?}: {source}")]
    Mkfifo { path: PathBuf, source: Errno },
    #[error("pipe endpoint is not configured")]
    Disabled,
    #[error("pipe is not open")]
    NotOpen,
    #[error("short write to pipe: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },
    #[error("failed to write to pipe: {0}")]
    Write(#[from] io::Error),
}

/// Makes sure a FIFO exists at `path` with exactly the given mode.
///
/// An existing path passes only when its mode is exactly `S_IFIFO | mode`;
/// anything else (a regular file, a FIFO with different permissions) is an
/// error and is left untouched. Missing parent directories are created with
/// user-only access.
pub fn ensure_fifo(path: &Path, mode: Mode) -> Result<(), PipeError> {
    match stat(path) {
        Ok(info) => {
            let expected = SFlag::S_IFIFO.bits() | mode.bits();
            if info.st_mode == expected {
                debug!(path = %path.display(), "pipe file already exists with the expected mode");
                Ok(())
            } else {
                Err(PipeError::WrongMode {
                    path: path.to_path_buf(),
                    expected,
                    actual: info.st_mode,
                })
            }
        }
        Err(Errno::ENOENT) => {
            if let Some(dir) = path.parent() {
                if !dir.as_os_str().is_empty() {
                    DirBuilder::new()
                        .recursive(true)
                        .mode(0o700)
                        .create(dir)
                        .map_err(|source| PipeError::CreateDir {
                            path: path.to_path_buf(),
                            source,
                        })?;
                }
            }
            mkfifo(path, mode).map_err(|source| PipeError::Mkfifo {
                path: path.to_path_buf(),
                source,
            })?;
            debug!(path = %path.display(), mode = mode.bits(), "created FIFO");
            Ok(())
        }
        Err(source) => Err(PipeError::Stat {
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn user_rw() -> Mode {
        Mode::S_IRUSR | Mode::S_IWUSR
    }

    #[test]
    fn creates_a_fifo_with_the_requested_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.pipe");

        ensure_fifo(&path, user_rw()).unwrap();

        let info = stat(&path).unwrap();
        assert_eq!(info.st_mode, SFlag::S_IFIFO.bits() | user_rw().bits());
    }

    #[test]
    fn accepts_an_existing_fifo_with_matching_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.pipe");

        ensure_fifo(&path, user_rw()).unwrap();
        ensure_fifo(&path, user_rw()).unwrap();
    }

    #[test]
    fn rejects_an_existing_fifo_with_different_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.pipe");

        ensure_fifo(&path, user_rw()).unwrap();

        assert_matches!(
            ensure_fifo(&path, Mode::S_IRUSR),
            Err(PipeError::WrongMode { .. })
        );
    }

    #[test]
    fn refuses_to_replace_a_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.pipe");
        std::fs::write(&path, b"imposter").unwrap();

        assert_matches!(
            ensure_fifo(&path, user_rw()),
            Err(PipeError::WrongMode { .. })
        );
        assert_eq!(std::fs::read(&path).unwrap(), b"imposter");
    }

    #[test]
    fn creates_missing_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deeply/nested/test.pipe");

        ensure_fifo(&path, user_rw()).unwrap();

        let info = stat(&path).unwrap();
        assert_eq!(info.st_mode, SFlag::S_IFIFO.bits() | user_rw().bits());
    }
}
