//! Bounded-latency file reader running on a dedicated thread.
//!
//! The reader polls its descriptor with a short timeout so that stop
//! requests are observed within one cycle, then hands each successful read
//! to a sink callback. The C++ ancestry of this design used an abstract
//! class with virtual open/process hooks; here the hooks are capabilities
//! passed at construction.

use std::fs::File;
use std::io::{self, Read};
use std::ops::ControlFlow;
use std::os::fd::{AsFd, IntoRawFd};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, trace};

/// How long the reader thread waits for input before checking whether it
/// should stop.
const READ_TIMEOUT_MS: u8 = 100;

/// Observable reader lifecycle. Transitions only move toward `Closed` or
/// `Failed`; the `Reading`/`Processing` pair oscillates while the loop runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    /// Not yet started accessing the input file.
    Initializing,
    /// Opening the input file.
    Opening,
    /// Input file open, reader thread not yet polling.
    Opened,
    /// Waiting for data to arrive.
    Reading,
    /// Dispatching data to the sink.
    Processing,
    /// Input file has been closed.
    Closed,
    /// Opening the input file failed.
    Failed,
}

#[derive(Debug, thiserror::Error)]
pub enum ReaderError {
    #[error("reader for {path:?} was already closed")]
    AlreadyClosed { path: PathBuf },
    #[error("failed to open {path:?} for reading: {source}")]
    Open { path: PathBuf, source: io::Error },
    #[error("failed to spawn reader thread for {path:?}: {source}")]
    Spawn { path: PathBuf, source: io::Error },
}

type OpenFn = Box<dyn FnOnce(&Path) -> io::Result<File> + Send>;
type SinkFn = Box<dyn FnMut(&[u8]) -> ControlFlow<()> + Send>;

struct Hooks {
    open: OpenFn,
    sink: SinkFn,
}

struct Channel {
    state: ReaderState,
    file: Option<File>,
}

impl Channel {
    fn close(&mut self) {
        if let Some(file) = self.file.take() {
            close_file(file);
        }
        self.state = ReaderState::Closed;
    }
}

struct Shared {
    path: PathBuf,
    channel: Mutex<Channel>,
}

/// Reads a file on a dedicated thread and forwards each read to a sink.
///
/// The sink returns [`ControlFlow`]; `Break` closes the reader from within
/// the dispatch, which is how a consumer stops the loop without holding a
/// reference back to it.
pub struct InputReader {
    shared: Arc<Shared>,
    buffer_size: usize,
    hooks: Mutex<Option<Hooks>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl InputReader {
    pub fn new(
        path: impl Into<PathBuf>,
        buffer_size: usize,
        open: impl FnOnce(&Path) -> io::Result<File> + Send + 'static,
        sink: impl FnMut(&[u8]) -> ControlFlow<()> + Send + 'static,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                path: path.into(),
                channel: Mutex::new(Channel {
                    state: ReaderState::Initializing,
                    file: None,
                }),
            }),
            buffer_size,
            hooks: Mutex::new(Some(Hooks {
                open: Box::new(open),
                sink: Box::new(sink),
            })),
            thread: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    pub fn state(&self) -> ReaderState {
        self.shared.channel.lock().unwrap().state
    }

    /// Opens the input file and starts the reader thread.
    ///
    /// The open capability may block (a FIFO read end waits for a writer), so
    /// callers that must not stall run `start` behind an
    /// [`AsyncInit`](crate::async_init::AsyncInit) worker. Calling `start`
    /// again while the reader is running is a no-op.
    pub fn start(&self) -> Result<(), ReaderError> {
        {
            let mut channel = self.shared.channel.lock().unwrap();
            match channel.state {
                ReaderState::Initializing => channel.state = ReaderState::Opening,
                ReaderState::Closed | ReaderState::Failed => {
                    return Err(ReaderError::AlreadyClosed {
                        path: self.shared.path.clone(),
                    });
                }
                _ => return Ok(()),
            }
        }

        let Hooks { open, sink } = self
            .hooks
            .lock()
            .unwrap()
            .take()
            .expect("hooks are present until the reader leaves Initializing");

        // The open may block; the state lock stays free meanwhile so state()
        // and stop() remain usable.
        let opened = open(&self.shared.path);

        {
            let mut channel = self.shared.channel.lock().unwrap();
            if channel.state != ReaderState::Opening {
                // stop() came through while the open was in flight.
                if let Ok(file) = opened {
                    close_file(file);
                }
                return Err(ReaderError::AlreadyClosed {
                    path: self.shared.path.clone(),
                });
            }
            match opened {
                Ok(file) => {
                    debug!(path = %self.shared.path.display(), "opened input file");
                    channel.file = Some(file);
                    channel.state = ReaderState::Opened;
                }
                Err(source) => {
                    debug!(
                        path = %self.shared.path.display(),
                        %source,
                        "failed to open input file"
                    );
                    channel.state = ReaderState::Failed;
                    return Err(ReaderError::Open {
                        path: self.shared.path.clone(),
                        source,
                    });
                }
            }
        }

        let shared = Arc::clone(&self.shared);
        let buffer_size = self.buffer_size;
        let spawned = thread::Builder::new()
            .name("vigil-reader".into())
            .spawn(move || read_loop(shared, sink, buffer_size));

        match spawned {
            Ok(handle) => {
                *self.thread.lock().unwrap() = Some(handle);
                Ok(())
            }
            Err(source) => {
                self.shared.channel.lock().unwrap().close();
                Err(ReaderError::Spawn {
                    path: self.shared.path.clone(),
                    source,
                })
            }
        }
    }

    /// Closes the input file and stops the reader thread. Safe to call from
    /// any thread other than the reader's own; the sink stops the loop by
    /// returning `ControlFlow::Break` instead.
    pub fn stop(&self) {
        {
            let mut channel = self.shared.channel.lock().unwrap();
            match channel.state {
                ReaderState::Closed | ReaderState::Failed => {}
                _ => {
                    debug!(path = %self.shared.path.display(), "closing reader");
                    channel.close();
                }
            }
        }

        let handle = self.thread.lock().unwrap().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for InputReader {
    fn drop(&mut self) {
        self.stop();
    }
}

fn read_loop(shared: Arc<Shared>, mut sink: SinkFn, buffer_size: usize) {
    let mut buffer = vec![0u8; buffer_size];
    loop {
        // The channel lock is held through the poll-read-dispatch sequence so
        // the sink always observes a consistent descriptor; the poll timeout
        // bounds how long stop() waits for the lock.
        let mut channel = shared.channel.lock().unwrap();
        if channel.file.is_none() {
            break;
        }
        channel.state = ReaderState::Reading;

        let poll_result = {
            let file = channel.file.as_ref().expect("descriptor present while reading");
            let mut fds = [PollFd::new(file.as_fd(), PollFlags::POLLIN)];
            poll(&mut fds, PollTimeout::from(READ_TIMEOUT_MS))
        };
        match poll_result {
            Err(Errno::EINTR) => continue,
            Err(err) => {
                debug!(path = %shared.path.display(), %err, "poll failed, closing reader");
                channel.close();
                break;
            }
            Ok(0) => continue,
            Ok(_) => {}
        }

        channel.state = ReaderState::Processing;
        let read_result = loop {
            let mut file: &File = channel.file.as_ref().expect("descriptor present while processing");
            match file.read(&mut buffer) {
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                other => break other,
            }
        };
        match read_result {
            Ok(0) => {
                debug!(path = %shared.path.display(), "end of input, closing reader");
                channel.close();
                break;
            }
            Err(err) => {
                debug!(path = %shared.path.display(), %err, "read failed, closing reader");
                channel.close();
                break;
            }
            Ok(count) => {
                trace!(count, "dispatching input");
                if sink(&buffer[..count]).is_break() {
                    channel.close();
                    break;
                }
            }
        }
    }
}

/// Closes a file, retrying the close on signal interruption.
pub(crate) fn close_file(file: File) {
    let fd = file.into_raw_fd();
    loop {
        let result = unsafe { libc::close(fd) };
        if result == 0 || io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
            break;
        }
    }
}
