//! Reference parent binary.
//!
//! Takes its [`ControllerConfig`] as a JSON string in the first argument;
//! every remaining argument is forwarded to the daemon. Messages arriving
//! from the daemon are printed to stdout, and the process exits with the
//! daemon's exit code.

use std::env;
use std::ffi::OsString;
use std::process::exit;

use tracing::info;

use vigil::{logging, ControllerConfig, DaemonController};

fn main() {
    logging::init_parent_logging();

    let args: Vec<String> = env::args().collect();
    let Some(raw_config) = args.get(1) else {
        eprintln!("usage: vigil-parent <config-json> [daemon-args...]");
        exit(64);
    };
    let config: ControllerConfig =
        serde_json::from_str(raw_config).expect("invalid controller configuration");
    let daemon_args: Vec<OsString> = args[2..].iter().map(OsString::from).collect();

    let mut controller = DaemonController::new(config).expect("failed to prepare the controller");
    controller
        .start(&daemon_args, |message: &[u8]| {
            println!("daemon: {}", String::from_utf8_lossy(message));
        })
        .expect("failed to launch the daemon");

    let code = controller.wait_to_exit();
    info!(code, "daemon finished");
    exit(code);
}
