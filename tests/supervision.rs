//! End-to-end supervision scenarios against the real daemon binary.

use std::ffi::OsString;
use std::fs;
use std::path::Path;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use vigil::{ControllerConfig, DaemonConfig, DaemonController, ExitCode, SecurityPolicy};

fn daemon_bin() -> &'static str {
    env!("CARGO_BIN_EXE_vigil-daemon")
}

fn daemon_args(config: &DaemonConfig) -> Vec<OsString> {
    vec![OsString::from(serde_json::to_string(config).unwrap())]
}

fn plain_controller() -> DaemonController {
    DaemonController::new(ControllerConfig::new(daemon_bin())).unwrap()
}

fn wait_for_lock_holder(path: &Path) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if fs::read_to_string(path)
            .map(|pid| !pid.is_empty())
            .unwrap_or(false)
        {
            return;
        }
        assert!(Instant::now() < deadline, "daemon never acquired the lock");
        thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn timeout_ends_the_daemon_normally() {
    let config = DaemonConfig {
        timeout_secs: Some(1),
        ..Default::default()
    };
    let mut controller = plain_controller();
    controller.start(&daemon_args(&config), |_| {}).unwrap();
    assert!(controller.is_running());

    let started = Instant::now();
    assert_eq!(controller.wait_to_exit(), ExitCode::Success.code());
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn stop_lets_the_daemon_exit_gracefully() {
    let config = DaemonConfig::default();
    let mut controller = plain_controller();
    controller.start(&daemon_args(&config), |_| {}).unwrap();

    // Give the daemon time to install its termination handler; a SIGTERM
    // before that would kill it outright instead of being caught.
    thread::sleep(Duration::from_millis(500));
    controller.stop();

    assert!(!controller.is_running());
    assert_eq!(controller.exit_code(), Some(ExitCode::Success.code()));
}

#[test]
fn the_lock_admits_one_daemon_at_a_time() {
    let dir = tempfile::tempdir().unwrap();
    let lock_path = dir.path().join("daemon.lck");
    let config = DaemonConfig {
        lock_file: Some(lock_path.clone()),
        ..Default::default()
    };

    let mut first = plain_controller();
    first.start(&daemon_args(&config), |_| {}).unwrap();
    wait_for_lock_holder(&lock_path);

    let mut second = plain_controller();
    second.start(&daemon_args(&config), |_| {}).unwrap();
    assert_eq!(
        second.wait_to_exit(),
        ExitCode::DaemonAlreadyRunning.code()
    );

    first.stop();
    assert_eq!(first.exit_code(), Some(ExitCode::Success.code()));
}

#[test]
fn pinned_path_mismatches_map_to_their_exit_codes() {
    let config = DaemonConfig {
        security: SecurityPolicy {
            daemon_path: Some("/somewhere/else/daemon".into()),
            ..Default::default()
        },
        ..Default::default()
    };
    let mut controller = plain_controller();
    controller.start(&daemon_args(&config), |_| {}).unwrap();
    assert_eq!(
        controller.wait_to_exit(),
        ExitCode::BadDaemonPath.code()
    );

    let config = DaemonConfig {
        security: SecurityPolicy {
            parent_path: Some("/somewhere/else/parent".into()),
            ..Default::default()
        },
        ..Default::default()
    };
    let mut controller = plain_controller();
    controller.start(&daemon_args(&config), |_| {}).unwrap();
    assert_eq!(
        controller.wait_to_exit(),
        ExitCode::BadParentPath.code()
    );
}

#[test]
fn messages_round_trip_and_exit_stops_the_daemon() {
    // The FIFOs are created user-write-only and user-read-only, so the
    // daemon side needs root to open its mirrored ends.
    if unsafe { libc::geteuid() } != 0 {
        eprintln!("skipping: pipe modes require root");
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let to_daemon = dir.path().join("to-daemon.pipe");
    let from_daemon = dir.path().join("from-daemon.pipe");

    let daemon_config = DaemonConfig {
        input_pipe: Some(to_daemon.clone()),
        output_pipe: Some(from_daemon.clone()),
        input_buffer_size: 128,
        ..Default::default()
    };
    let mut controller_config = ControllerConfig::new(daemon_bin());
    controller_config.to_daemon_pipe = Some(to_daemon);
    controller_config.from_daemon_pipe = Some(from_daemon);
    controller_config.buffer_size = 128;

    let (tx, rx) = mpsc::channel();
    let mut controller = DaemonController::new(controller_config).unwrap();
    controller
        .start(&daemon_args(&daemon_config), move |bytes: &[u8]| {
            let _ = tx.send(bytes.to_vec());
        })
        .unwrap();

    // Ping until an echo returns, proving both pipe rendezvous completed.
    let deadline = Instant::now() + Duration::from_secs(10);
    let echo = loop {
        assert!(Instant::now() < deadline, "no echo from the daemon");
        let _ = controller.message(b"ping");
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(echo) => break echo,
            Err(_) => continue,
        }
    };
    assert_eq!(echo, b"ping");

    controller.message(b"exit").unwrap();
    assert_eq!(controller.wait_to_exit(), 1);
    controller.stop();
}
