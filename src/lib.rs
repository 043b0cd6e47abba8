//! Supervision framework for long-running privileged daemons.
//!
//! A trusted parent application uses a [`DaemonController`] to fork, exec,
//! message, and terminate a daemon binary. The daemon drives a
//! [`DaemonLoop`] that holds a single-instance lock, audits its own
//! execution environment, and exchanges opaque byte messages with the
//! parent over two named pipes. Neither side frames, authenticates, or
//! retries anything: the pipes carry exactly the bytes written into them,
//! and restart policy belongs to the layer above.
//!
//! # Example
//!
//! The parent side supervises the daemon binary:
//!
//! ```no_run
//! # fn main() -> Result<(), vigil::ControllerError> {
//! use std::ffi::OsString;
//!
//! use vigil::{ControllerConfig, DaemonController};
//!
//! let mut config = ControllerConfig::new("/opt/vigil/daemon");
//! config.from_daemon_pipe = Some("/run/vigil/out.pipe".into());
//!
//! let mut controller = DaemonController::new(config)?;
//! controller.start(&[OsString::from("--verbose")], |message: &[u8]| {
//!     println!("daemon sent {} bytes", message.len());
//! })?;
//! let code = controller.wait_to_exit();
//! controller.stop();
//! # let _ = code;
//! # Ok(())
//! # }
//! ```
//!
//! The daemon side plugs its behavior into the loop:
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use vigil::{DaemonConfig, DaemonLoop, DaemonService};
//!
//! struct Heartbeat;
//!
//! impl DaemonService for Heartbeat {
//!     fn action(&self) -> i32 {
//!         std::thread::sleep(std::time::Duration::from_millis(250));
//!         0
//!     }
//! }
//!
//! let config = DaemonConfig {
//!     lock_file: Some("/var/lock/vigil.lck".into()),
//!     ..Default::default()
//! };
//! let mut daemon = DaemonLoop::new(config, Arc::new(Heartbeat));
//! std::process::exit(daemon.run());
//! ```

pub mod async_init;
pub mod config;
pub mod controller;
pub mod daemon;
pub mod exit_code;
pub mod input_reader;
pub mod logging;
pub mod pipe;
pub mod process;
pub mod signals;

pub use config::{ControllerConfig, DaemonConfig, SecurityPolicy};
pub use controller::{ControllerError, DaemonController};
pub use daemon::{DaemonLoop, DaemonService, ParentLink};
pub use exit_code::ExitCode;
pub use input_reader::{InputReader, ReaderState};
pub use pipe::{ensure_fifo, PipeError, PipeReader, PipeWriter};
pub use process::{ProcessData, ProcessState, SecurityMonitor};
