//! One-shot latch for initialization steps that may block indefinitely.
//!
//! Opening the write end of a FIFO blocks until a reader appears, so the
//! open runs on a worker thread while callers observe progress through this
//! latch: `started`, `finished`, `succeeded`, a bounded `wait_for`, and a
//! `cancel` that tells the worker to give up.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::error;

/// A one-shot latch around a potentially-blocking initialization routine.
///
/// State only moves forward: not started, running, finished. The finished
/// state records whether the routine reported success. Once cancelled, the
/// latch can never be started again.
pub struct AsyncInit {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    done: Condvar,
    cancel_requested: AtomicBool,
}

#[derive(Default)]
struct State {
    started: bool,
    finished: bool,
    succeeded: bool,
    cancelled: bool,
    worker: Option<JoinHandle<()>>,
}

/// Handle the worker routine polls to honor [`AsyncInit::cancel`].
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel_requested.load(Ordering::SeqCst)
    }
}

impl AsyncInit {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                done: Condvar::new(),
                cancel_requested: AtomicBool::new(false),
            }),
        }
    }

    /// A token the initialization routine can poll for cancellation.
    pub fn cancel_token(&self) -> CancelToken {
        CancelToken {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Spawns the worker thread running `init`, unless one was already
    /// spawned or the latch was cancelled. Returns whether this call spawned
    /// the worker.
    pub fn start<F>(&self, init: F) -> bool
    where
        F: FnOnce(&CancelToken) -> bool + Send + 'static,
    {
        let mut state = self.inner.state.lock().unwrap();
        if state.started || state.cancelled {
            return false;
        }
        state.started = true;

        let inner = Arc::clone(&self.inner);
        let token = self.cancel_token();
        let spawned = thread::Builder::new()
            .name("vigil-init".into())
            .spawn(move || {
                let succeeded = init(&token);
                let mut state = inner.state.lock().unwrap();
                state.finished = true;
                state.succeeded = succeeded;
                inner.done.notify_all();
            });

        match spawned {
            Ok(handle) => {
                state.worker = Some(handle);
                true
            }
            Err(err) => {
                error!(%err, "failed to spawn init thread");
                state.finished = true;
                state.succeeded = false;
                self.inner.done.notify_all();
                true
            }
        }
    }

    /// Whether [`start`](Self::start) has been called.
    pub fn started(&self) -> bool {
        self.inner.state.lock().unwrap().started
    }

    /// Whether the worker has finished running.
    pub fn finished(&self) -> bool {
        self.inner.state.lock().unwrap().finished
    }

    /// Whether the worker finished and reported success.
    pub fn succeeded(&self) -> bool {
        let state = self.inner.state.lock().unwrap();
        state.finished && state.succeeded
    }

    /// Blocks until the worker finishes.
    pub fn wait(&self) {
        let mut state = self.inner.state.lock().unwrap();
        while !state.finished {
            state = self.inner.done.wait(state).unwrap();
        }
    }

    /// Blocks until the worker finishes or `timeout` elapses. Returns whether
    /// the worker finished in time.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let state = self.inner.state.lock().unwrap();
        let (state, _) = self
            .inner
            .done
            .wait_timeout_while(state, timeout, |state| !state.finished)
            .unwrap();
        state.finished
    }

    /// Stops a still-running worker, joins it, and marks the latch finished.
    ///
    /// The worker observes the request through its [`CancelToken`] at its
    /// next poll. After cancellation the latch can never be started.
    pub fn cancel(&self) {
        self.inner.cancel_requested.store(true, Ordering::SeqCst);

        let worker = {
            let mut state = self.inner.state.lock().unwrap();
            state.cancelled = true;
            state.worker.take()
        };
        if let Some(worker) = worker {
            let _ = worker.join();
        }

        let mut state = self.inner.state.lock().unwrap();
        if state.started && !state.finished {
            state.finished = true;
            state.succeeded = false;
            self.inner.done.notify_all();
        }
    }
}

impl Default for AsyncInit {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AsyncInit {
    fn drop(&mut self) {
        self.cancel();
    }
}
