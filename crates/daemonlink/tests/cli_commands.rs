#![cfg(all(unix, feature = "cli"))]

use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

fn daemonlink() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_daemonlink"));
    cmd.env_remove("DAEMONLINK_TIMEOUT")
        .env_remove("DAEMONLINK_NAME")
        .arg("--log-level")
        .arg("error");
    cmd
}

/// Start `serve` and return the child with the connection name it printed.
fn spawn_server(extra: &[&str]) -> (Child, PathBuf) {
    let mut child = daemonlink()
        .args(["--format", "raw", "serve", "cli-test", "--timeout", "10s"])
        .args(extra)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("serve command should start");

    let stdout = child.stdout.take().expect("stdout should be piped");
    let mut line = String::new();
    BufReader::new(stdout)
        .read_line(&mut line)
        .expect("serve should print its connection name");
    let path = PathBuf::from(line.trim());
    assert!(path.exists(), "connection name {path:?} should exist");
    (child, path)
}

fn wait_with_timeout(child: &mut Child, timeout: Duration) -> std::process::ExitStatus {
    let started = Instant::now();
    loop {
        if let Some(status) = child.try_wait().expect("try_wait should succeed") {
            return status;
        }
        if started.elapsed() >= timeout {
            let _ = child.kill();
            panic!("process did not exit in time");
        }
        std::thread::sleep(Duration::from_millis(25));
    }
}

#[test]
fn send_gets_reply_from_serve() {
    let (mut server, endpoint) = spawn_server(&["--reply", "pong", "--once"]);

    let output = daemonlink()
        .args(["--format", "raw", "send"])
        .arg(&endpoint)
        .args(["--data", "ping", "--timeout", "5s"])
        .output()
        .expect("send command should run");

    assert!(
        output.status.success(),
        "send failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert_eq!(output.stdout, b"pong");

    let status = wait_with_timeout(&mut server, Duration::from_secs(5));
    assert!(status.success(), "serve should exit cleanly after one session");
    assert!(!endpoint.exists(), "socket should be removed on exit");
    assert!(
        !endpoint.parent().expect("socket has a parent").exists(),
        "socket directory should be removed on exit"
    );
}

#[test]
fn serve_echoes_by_default_and_reports_json() {
    let (mut server, endpoint) = spawn_server(&["--count", "2"]);

    for payload in ["first", "second"] {
        let output = daemonlink()
            .args(["--format", "json", "send"])
            .arg(&endpoint)
            .args(["--data", payload])
            .output()
            .expect("send command should run");
        assert!(output.status.success());

        let value: serde_json::Value =
            serde_json::from_slice(&output.stdout).expect("send output should be valid json");
        assert_eq!(value["reply"], payload);
        assert_eq!(value["reply_size"], payload.len());
    }

    let status = wait_with_timeout(&mut server, Duration::from_secs(5));
    assert!(status.success());
}

#[test]
fn send_to_missing_endpoint_is_transport_error() {
    let dir = tempfile::tempdir().expect("temp dir should be creatable");
    let output = daemonlink()
        .arg("send")
        .arg(dir.path().join("nobody.sock"))
        .args(["--data", "ping", "--timeout", "500ms"])
        .output()
        .expect("send command should run");

    assert_eq!(output.status.code(), Some(3));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("connect failed"), "stderr: {stderr}");
}

#[test]
fn serve_with_idle_timeout_exits_with_timeout_code() {
    let mut child = daemonlink()
        .args(["--format", "raw", "serve", "idle", "--timeout", "200ms"])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("serve command should start");

    let stdout = child.stdout.take().expect("stdout should be piped");
    let mut line = String::new();
    BufReader::new(stdout).read_line(&mut line).unwrap();
    let endpoint = PathBuf::from(line.trim());

    let status = wait_with_timeout(&mut child, Duration::from_secs(5));
    assert_eq!(status.code(), Some(124));
    assert!(!endpoint.exists(), "timeout exit should still clean up");
}

#[test]
fn invalid_timeout_is_usage_error() {
    let output = daemonlink()
        .args(["send", "/tmp/unused.sock", "--timeout", "soon"])
        .output()
        .expect("send command should run");
    assert_eq!(output.status.code(), Some(64));
}

#[test]
fn doctor_reports_pass_as_json() {
    let output = daemonlink()
        .args(["--format", "json", "doctor"])
        .output()
        .expect("doctor command should run");

    assert!(
        output.status.success(),
        "doctor failed: {}",
        String::from_utf8_lossy(&output.stdout)
    );
    let value: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("doctor output should be valid json");
    assert_eq!(value["overall"], "pass");
    let checks = value["checks"].as_array().expect("checks should be an array");
    assert!(checks.iter().any(|c| c["name"] == "round_trip"));
}

#[test]
fn version_prints_package_version() {
    let output = daemonlink()
        .arg("version")
        .output()
        .expect("version command should run");
    assert!(output.status.success());
    assert_eq!(
        String::from_utf8_lossy(&output.stdout).trim(),
        format!("daemonlink {}", env!("CARGO_PKG_VERSION"))
    );
}

#[test]
fn extended_version_reports_transport_as_json() {
    let output = daemonlink()
        .args(["--format", "json", "version", "--extended"])
        .output()
        .expect("version command should run");
    assert!(output.status.success());

    let value: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("version output should be valid json");
    assert_eq!(value["transport"], "unix-socket");
    assert_eq!(value["socket_mode"], "600");
    assert_eq!(value["read_chunk"], "100000");
}
