use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::process::{Child, Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

fn bin() -> &'static str {
    env!("CARGO_BIN_EXE_dcp-follower")
}

fn free_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind ephemeral port");
    let addr = listener.local_addr().expect("Failed to resolve bound address");
    format!("127.0.0.1:{}", addr.port())
}

fn run_to_completion(args: &[&str]) -> Output {
    Command::new(bin())
        .args(args)
        .stdin(Stdio::null())
        .output()
        .expect("Failed to run dcp-follower")
}

fn audit_events(path: &Path) -> Vec<serde_json::Value> {
    std::fs::read_to_string(path)
        .expect("audit log written")
        .lines()
        .map(|line| serde_json::from_str(line).expect("audit line is JSON"))
        .collect()
}

struct FollowerProcess {
    child: Child,
}

impl Drop for FollowerProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
    }
}

#[test]
fn bounded_simulated_run_exits_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let audit = dir.path().join("audit.jsonl");
    let output = run_to_completion(&[
        "--simulate",
        "--no-bridge",
        "--interval-ms",
        "10",
        "--max-cycles",
        "5",
        "--audit-log",
        audit.to_str().unwrap(),
    ]);
    assert_eq!(output.status.code(), Some(0), "{output:?}");

    let events = audit_events(&audit);
    assert_eq!(events.first().unwrap()["event_type"], "system_start");
    let last = events.last().unwrap();
    assert_eq!(last["event_type"], "system_shutdown");
    assert_eq!(last["details"]["reason"], "cycle_limit_reached");
    assert_eq!(last["details"]["stats"]["cycles_executed"], 5);
}

#[test]
fn persistent_protection_trip_exits_with_abort_status() {
    let dir = tempfile::tempdir().unwrap();
    let audit = dir.path().join("audit.jsonl");
    let output = run_to_completion(&[
        "--simulate",
        "--no-bridge",
        "--interval-ms",
        "10",
        "--max-cycles",
        "50",
        "--sim-source-volts",
        "12",
        "--sim-ovp-volts",
        "10",
        "--audit-log",
        audit.to_str().unwrap(),
    ]);
    assert_eq!(output.status.code(), Some(2), "{output:?}");

    let events = audit_events(&audit);
    let last = events.last().unwrap();
    assert_eq!(last["event_type"], "follower_aborted");
    assert_eq!(last["details"]["reason"], "recovery_limit_exceeded");
}

#[test]
fn bad_arguments_exit_with_startup_error() {
    let output = run_to_completion(&["--simulate", "--current", "lots"]);
    assert_eq!(output.status.code(), Some(1));

    let output = run_to_completion(&["--no-bridge"]);
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn out_of_range_current_is_a_startup_error() {
    let output = run_to_completion(&["--simulate", "--no-bridge", "--current", "9.5"]);
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn help_exits_successfully() {
    let output = run_to_completion(&["--help"]);
    assert_eq!(output.status.code(), Some(0));
    assert!(String::from_utf8_lossy(&output.stdout).contains("--sim-ovp-volts"));
}

#[test]
fn bridge_streams_status_and_accepts_stop() {
    let bind_addr = free_addr();
    let child = Command::new(bin())
        .args([
            "--simulate",
            "--interval-ms",
            "20",
            "--bind",
            &bind_addr,
        ])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("Failed to start dcp-follower");
    let mut follower = FollowerProcess { child };

    let deadline = Instant::now() + Duration::from_secs(10);
    let stream = loop {
        match TcpStream::connect(&bind_addr) {
            Ok(stream) => break stream,
            Err(_) if Instant::now() < deadline => thread::sleep(Duration::from_millis(50)),
            Err(e) => panic!("bridge never came up: {e}"),
        }
    };
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("read timeout");
    let mut writer = stream.try_clone().expect("clone stream");
    let mut reader = BufReader::new(stream);

    let mut running = false;
    for _ in 0..200 {
        let mut line = String::new();
        if reader.read_line(&mut line).unwrap_or(0) == 0 {
            break;
        }
        let status: serde_json::Value = serde_json::from_str(&line).expect("status is JSON");
        assert_eq!(status["type"], "status");
        if status["loop_state"] == "running" && status["cycle_count"].as_u64() > Some(0) {
            assert_eq!(status["commanded_voltage"], 12.0);
            running = true;
            break;
        }
    }
    assert!(running, "never saw a running status");

    writer
        .write_all(b"{\"type\":\"stop\",\"protocol_version\":{\"major\":1,\"minor\":0}}\n")
        .expect("send stop");

    let deadline = Instant::now() + Duration::from_secs(10);
    let status = loop {
        if let Some(status) = follower.child.try_wait().expect("poll child") {
            break status;
        }
        assert!(Instant::now() < deadline, "follower did not stop");
        thread::sleep(Duration::from_millis(20));
    };
    assert_eq!(status.code(), Some(0));
}
