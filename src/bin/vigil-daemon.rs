//! Reference daemon binary.
//!
//! Takes its [`DaemonConfig`] as a JSON string in the first argument and an
//! optional log file path in the second. Every message from the parent is
//! echoed back through the output pipe; the message `exit` makes the next
//! loop iteration return 1.

use std::env;
use std::process::exit;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use vigil::{logging, DaemonConfig, DaemonLoop, DaemonService, ParentLink};

const EXIT_MESSAGE: &[u8] = b"exit";

const ACTION_INTERVAL: Duration = Duration::from_millis(10);

struct EchoService {
    exit_requested: AtomicBool,
    parent: Mutex<Option<ParentLink>>,
}

impl DaemonService for EchoService {
    fn action(&self) -> i32 {
        if self.exit_requested.load(Ordering::SeqCst) {
            return 1;
        }
        thread::sleep(ACTION_INTERVAL);
        0
    }

    fn handle_parent_message(&self, message: &[u8]) {
        if message == EXIT_MESSAGE {
            info!("received exit request");
            self.exit_requested.store(true, Ordering::SeqCst);
            return;
        }
        if let Some(parent) = &*self.parent.lock().unwrap() {
            if let Err(err) = parent.send(message) {
                warn!(%err, "failed to echo message back to the parent");
            }
        }
    }
}

fn main() {
    let args: Vec<String> = env::args().collect();
    let Some(raw_config) = args.get(1) else {
        eprintln!("usage: vigil-daemon <config-json> [log-file]");
        exit(64);
    };
    if let Some(log_file) = args.get(2) {
        logging::init_daemon_logging(log_file).expect("failed to open the log file");
    }
    let config: DaemonConfig =
        serde_json::from_str(raw_config).expect("invalid daemon configuration");

    let service = Arc::new(EchoService {
        exit_requested: AtomicBool::new(false),
        parent: Mutex::new(None),
    });
    let mut daemon = DaemonLoop::new(config, Arc::clone(&service));
    *service.parent.lock().unwrap() = daemon.parent_link();

    exit(daemon.run());
}
