use std::fs::{File, OpenOptions};
use std::io;
use std::ops::ControlFlow;
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::debug;

use crate::async_init::{AsyncInit, CancelToken};
use crate::input_reader::{InputReader, ReaderState};

/// Pause between checks for a writer while none holds the FIFO open.
const OPEN_RETRY_INTERVAL: Duration = Duration::from_millis(20);

/// The read end of a named pipe.
///
/// The FIFO rendezvous (a read open completes only once a writer exists)
/// happens on an [`AsyncInit`] worker, which then runs the
/// [`InputReader`] loop. Each successful read is forwarded to the sink as an
/// opaque byte slice; the reader does no framing.
pub struct PipeReader {
    inner: Arc<InputReader>,
    init: AsyncInit,
}

impl PipeReader {
    pub fn new(
        path: impl Into<PathBuf>,
        buffer_size: usize,
        mut sink: impl FnMut(&[u8]) + Send + 'static,
    ) -> Self {
        let init = AsyncInit::new();
        let token = init.cancel_token();
        let inner = InputReader::new(
            path,
            buffer_size,
            move |path: &Path| await_writer_open(path, &token),
            move |bytes: &[u8]| {
                sink(bytes);
                ControlFlow::Continue(())
            },
        );
        Self {
            inner: Arc::new(inner),
            init,
        }
    }

    pub fn path(&self) -> &Path {
        self.inner.path()
    }

    pub fn state(&self) -> ReaderState {
        self.inner.state()
    }

    /// Starts opening the pipe and reading from it in the background.
    pub fn open(&self) {
        let reader = Arc::clone(&self.inner);
        self.init.start(move |_| match reader.start() {
            Ok(()) => true,
            Err(err) => {
                debug!(%err, "pipe reader did not start");
                false
            }
        });
    }

    /// Abandons any in-flight open and stops the reader thread.
    pub fn close(&self) {
        self.init.cancel();
        self.inner.stop();
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.close();
    }
}

/// Opens the FIFO read-only and waits until a writer holds the other end.
///
/// A nonblocking read open succeeds immediately even with no writer, but
/// reading from it would report end-of-file straight away. Polling
/// distinguishes the cases: `POLLHUP` with no data means no writer yet,
/// anything else means the rendezvous is complete.
fn await_writer_open(path: &Path, cancel: &CancelToken) -> io::Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)?;

    loop {
        if cancel.is_cancelled() {
            return Err(io::Error::new(
                io::ErrorKind::Interrupted,
                "pipe open cancelled",
            ));
        }

        let revents = {
            let mut fds = [PollFd::new(file.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::ZERO) {
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(io::Error::from(err)),
                Ok(0) => break,
                Ok(_) => fds[0].revents().unwrap_or(PollFlags::empty()),
            }
        };
        if revents.contains(PollFlags::POLLIN) {
            break;
        }
        thread::sleep(OPEN_RETRY_INTERVAL);
    }

    // Restore blocking semantics for the read loop.
    let result = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETFL, 0) };
    if result == -1 {
        return Err(io::Error::last_os_error());
    }
    debug!(path = %path.display(), "opened pipe for reading");
    Ok(file)
}
