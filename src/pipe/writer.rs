use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, error};

use crate::async_init::{AsyncInit, CancelToken};
use crate::input_reader::close_file;
use crate::pipe::PipeError;

/// How long `send` waits for the asynchronous open before giving up.
const SEND_INIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Pause between open attempts while no reader has the FIFO open.
const OPEN_RETRY_INTERVAL: Duration = Duration::from_millis(20);

/// The write end of a named pipe.
///
/// Opening a FIFO for writing only completes once a reader holds the other
/// end, so [`open`](Self::open) arms an [`AsyncInit`] worker instead of
/// blocking the caller. The worker retries a nonblocking open until the
/// reader arrives or the writer is closed.
pub struct PipeWriter {
    path: PathBuf,
    file: Arc<Mutex<Option<File>>>,
    init: AsyncInit,
}

impl PipeWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Arc::new(Mutex::new(None)),
            init: AsyncInit::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Starts opening the pipe for writing in the background.
    pub fn open(&self) {
        let path = self.path.clone();
        let slot = Arc::clone(&self.file);
        self.init.start(move |cancel| open_write_end(&path, &slot, cancel));
    }

    /// Whether the pipe is open and ready for [`send`](Self::send).
    pub fn is_open(&self) -> bool {
        self.init.succeeded() && self.file.lock().unwrap().is_some()
    }

    /// Sends a message through the pipe.
    ///
    /// Waits a bounded time for the asynchronous open to finish, covering the
    /// common race where a send follows hot on the heels of `open`. Partial
    /// writes and I/O errors are reported as failures.
    pub fn send(&self, message: &[u8]) -> Result<(), PipeError> {
        if !self.init.finished() {
            self.init.wait_for(SEND_INIT_TIMEOUT);
        }
        if !self.init.succeeded() {
            return Err(PipeError::NotOpen);
        }

        let guard = self.file.lock().unwrap();
        let Some(file) = guard.as_ref() else {
            return Err(PipeError::NotOpen);
        };
        let mut file: &File = file;
        loop {
            match file.write(message) {
                Ok(written) if written == message.len() => return Ok(()),
                Ok(written) => {
                    return Err(PipeError::ShortWrite {
                        written,
                        expected: message.len(),
                    });
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(PipeError::Write(err)),
            }
        }
    }

    /// Abandons any in-flight open and closes the pipe. Later `send` calls
    /// fail with [`PipeError::NotOpen`].
    pub fn close(&self) {
        self.init.cancel();
        if let Some(file) = self.file.lock().unwrap().take() {
            debug!(path = %self.path.display(), "closing pipe writer");
            close_file(file);
        }
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.close();
    }
}

fn open_write_end(path: &Path, slot: &Mutex<Option<File>>, cancel: &CancelToken) -> bool {
    loop {
        match OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
        {
            Ok(file) => {
                // Restore blocking semantics for the write loop.
                let result = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETFL, 0) };
                if result == -1 {
                    error!(path = %path.display(), "failed to restore blocking mode on pipe");
                    return false;
                }
                debug!(path = %path.display(), "opened pipe for writing");
                *slot.lock().unwrap() = Some(file);
                return true;
            }
            // ENXIO: no reader holds the other end yet.
            Err(err) if err.raw_os_error() == Some(libc::ENXIO) => {
                if cancel.is_cancelled() {
                    debug!(path = %path.display(), "abandoning pipe open");
                    return false;
                }
                thread::sleep(OPEN_RETRY_INTERVAL);
            }
            Err(err) => {
                error!(path = %path.display(), %err, "failed to open pipe for writing");
                return false;
            }
        }
    }
}
