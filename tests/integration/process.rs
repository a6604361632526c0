#[path = "common/mod.rs"]
mod common;

use std::{
    io::{BufRead, BufReader, Write},
    net::TcpListener,
    sync::mpsc,
    thread,
    time::{Duration, Instant},
};

use common::{descriptor, read_pid};
#[cfg(target_os = "linux")]
use common::{is_process_alive, wait_for_process_exit};
use tempfile::tempdir;
use workbench::{
    coordinator::ShutdownToken,
    logs::Color,
    pid::PidRegistry,
    service::{HealthSettings, HealthStatus, ServiceHandle, ServiceState},
};

/// Serves `GET /health` with 200 and everything else with 404.
fn spawn_health_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind mock server");
    let port = listener.local_addr().unwrap().port();

    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { continue };
            let mut request_line = String::new();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            if reader.read_line(&mut request_line).is_err() {
                continue;
            }
            // Drain headers.
            let mut header = String::new();
            while reader.read_line(&mut header).is_ok_and(|n| n > 2) {
                header.clear();
            }

            let status = if request_line.starts_with("GET /health ") {
                "200 OK"
            } else {
                "404 Not Found"
            };
            let _ = write!(
                stream,
                "HTTP/1.1 {status}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
            );
        }
    });

    port
}

#[test]
fn http_health_check_reports_healthy() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let port = spawn_health_server();

    let mut desc = descriptor(dir, "api", "sleep 100");
    desc.port = Some(port);
    desc.health_check = Some("/health".into());
    let mut service = ServiceHandle::new(desc, Color::Cyan, PidRegistry::new(dir));

    service.start().expect("failed to start");
    let started = Instant::now();
    let status = service.wait_healthy(&HealthSettings::default(), &ShutdownToken::new());

    assert_eq!(status, HealthStatus::Healthy);
    assert_eq!(service.state(), ServiceState::Healthy);
    assert!(started.elapsed() < Duration::from_secs(5));

    service
        .stop(Duration::from_secs(2), Duration::from_millis(500))
        .unwrap();
}

#[test]
fn http_errors_leave_health_inconclusive() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let port = spawn_health_server();

    let mut desc = descriptor(dir, "api", "sleep 100");
    desc.port = Some(port);
    desc.health_check = Some("/missing".into());
    let mut service = ServiceHandle::new(desc, Color::Cyan, PidRegistry::new(dir));

    let settings = HealthSettings {
        timeout: Duration::from_millis(1500),
        poll_interval: Duration::from_millis(200),
        ..HealthSettings::default()
    };

    service.start().expect("failed to start");
    assert_eq!(
        service.wait_healthy(&settings, &ShutdownToken::new()),
        HealthStatus::InconclusiveButAlive
    );
    assert_eq!(service.state(), ServiceState::HealthUnknown);
    assert!(service.is_running());

    service
        .stop(Duration::from_secs(2), Duration::from_millis(500))
        .unwrap();
}

#[test]
fn immediate_exit_fails_health_check() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let mut service = ServiceHandle::new(
        descriptor(dir, "bad", "exit 1"),
        Color::Red,
        PidRegistry::new(dir),
    );

    service.start().expect("spawning sh itself succeeds");
    let status = service.wait_healthy(&HealthSettings::default(), &ShutdownToken::new());

    assert_eq!(status, HealthStatus::Failed);
    assert_eq!(service.state(), ServiceState::Crashed);
    assert_eq!(service.exit_status().and_then(|s| s.code()), Some(1));
}

#[cfg(target_os = "linux")]
#[test]
fn stop_reaches_orphaned_grandchildren() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();

    // The grandchild ignores SIGTERM and survives its parent shell.
    let command = "(trap '' TERM; exec sleep 60) & echo $! > grandchild.pid; wait";
    let mut service = ServiceHandle::new(
        descriptor(dir, "forker", command),
        Color::Yellow,
        PidRegistry::new(dir),
    );

    service.start().expect("failed to start");
    let grandchild = read_pid(&dir.join("grandchild.pid"));
    assert!(is_process_alive(grandchild));

    service
        .stop(Duration::from_secs(1), Duration::from_millis(500))
        .expect("stop failed");

    wait_for_process_exit(grandchild);
    assert_eq!(service.state(), ServiceState::Stopped);
}

#[test]
fn output_is_tagged_and_ends_with_the_process() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let mut service = ServiceHandle::new(
        descriptor(dir, "echoer", "echo ready; echo oops >&2; sleep 30"),
        Color::Green,
        PidRegistry::new(dir),
    );

    service.start().expect("failed to start");
    let (tx, rx) = mpsc::channel();
    let stream = service.stream_output(tx).expect("output available once");

    let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let second = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(first.service, "echoer");
    assert_eq!(first.color, Color::Green);
    assert_eq!((first.text.as_str(), second.text.as_str()), ("ready", "oops"));

    service
        .stop(Duration::from_secs(2), Duration::from_millis(500))
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while !stream.is_finished() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }
    assert!(stream.is_finished());
    stream.join().unwrap();
}
