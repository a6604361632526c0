#[path = "common/mod.rs"]
mod common;

use std::{
    fs,
    io::Read,
    os::unix::process::CommandExt,
    process::{Command as StdCommand, Stdio},
    thread,
    time::{Duration, Instant},
};

use assert_cmd::Command;
#[cfg(target_os = "linux")]
use common::wait_for_process_exit;
use common::{pid_file_count, wait_for_record, write_manifest};
use nix::{
    sys::signal::{Signal, kill},
    unistd::Pid,
};
use predicates::prelude::*;
use tempfile::tempdir;
use workbench::pid::PidRegistry;

fn workbench() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("workbench"))
}

const TWO_SERVICES: &str = r#"
workbench:
  name: demo
repos:
  api:
    start_command: "sleep 60"
    port: 8000
  docs:
    type: infrastructure
"#;

#[test]
fn status_reports_running_and_stopped_services() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    write_manifest(dir, TWO_SERVICES);

    workbench()
        .current_dir(dir)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("stopped"))
        .stdout(predicate::str::contains("reference only"));

    // The test process stands in for a live service.
    PidRegistry::new(dir)
        .write("api", std::process::id(), Some(8000))
        .unwrap();

    workbench()
        .current_dir(dir)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains(format!(
            "running\x1b[0m (pid {})",
            std::process::id()
        )));
}

#[test]
fn status_finds_the_manifest_from_a_subdirectory() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    write_manifest(dir, TWO_SERVICES);
    let nested = dir.join("repos/api");
    fs::create_dir_all(&nested).unwrap();

    workbench()
        .current_dir(&nested)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("api"));
}

#[test]
fn missing_manifest_is_an_error() {
    let temp = tempdir().expect("failed to create tempdir");
    workbench()
        .arg("--manifest")
        .arg(temp.path().join("workbench.yaml"))
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read manifest"));
}

#[test]
fn down_with_nothing_running() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    write_manifest(dir, TWO_SERVICES);

    workbench()
        .current_dir(dir)
        .arg("down")
        .assert()
        .success()
        .stdout(predicate::str::contains("No services are currently running"));
}

#[test]
fn down_clears_stale_records() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    write_manifest(dir, TWO_SERVICES);

    let mut child = StdCommand::new("true").spawn().unwrap();
    let dead_pid = child.id();
    child.wait().unwrap();
    PidRegistry::new(dir).write("api", dead_pid, None).unwrap();

    workbench()
        .current_dir(dir)
        .args(["down", "api"])
        .assert()
        .success()
        .stdout(predicate::str::contains("api already stopped"));
    assert_eq!(pid_file_count(dir), 0);
}

#[test]
fn down_stops_a_recorded_service() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    write_manifest(dir, TWO_SERVICES);

    let mut child = StdCommand::new("sleep")
        .arg("60")
        .process_group(0)
        .stdout(Stdio::null())
        .spawn()
        .unwrap();
    PidRegistry::new(dir).write("api", child.id(), Some(8000)).unwrap();

    workbench()
        .current_dir(dir)
        .arg("down")
        .assert()
        .success()
        .stdout(predicate::str::contains("api stopped"));

    assert!(!child.wait().unwrap().success());
    assert_eq!(pid_file_count(dir), 0);
}

#[test]
fn down_rejects_unknown_services() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    write_manifest(dir, TWO_SERVICES);

    workbench()
        .current_dir(dir)
        .args(["down", "nope"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown service 'nope'"));
}

#[test]
fn up_refuses_services_without_start_commands() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    write_manifest(
        dir,
        r#"
repos:
  api:
    start_command: "sleep 60"
  web:
    port: 3000
  worker: {}
"#,
    );

    workbench()
        .current_dir(dir)
        .arg("up")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Missing start commands for: web, worker"));
    assert_eq!(pid_file_count(dir), 0);
}

#[test]
fn up_refuses_infrastructure_repos() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    write_manifest(dir, TWO_SERVICES);

    workbench()
        .current_dir(dir)
        .args(["up", "docs"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("infrastructure repo"));
}

#[test]
fn up_rolls_back_when_a_service_dies() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    fs::create_dir_all(dir.join("repos/api")).unwrap();
    fs::create_dir_all(dir.join("repos/bad")).unwrap();
    write_manifest(
        dir,
        r#"
repos:
  api:
    start_command: "exec sleep 60"
  bad:
    start_command: "exit 1"
"#,
    );

    workbench()
        .current_dir(dir)
        .args(["up", "--stop-timeout", "2"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("bad failed to start"))
        .stderr(predicate::str::contains("`exit 1` exited"));
    assert_eq!(pid_file_count(dir), 0);
}

#[test]
fn up_exits_once_every_service_finishes() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    fs::create_dir_all(dir.join("repos/job")).unwrap();
    write_manifest(
        dir,
        r#"
repos:
  job:
    start_command: "sleep 3; echo finished"
"#,
    );

    workbench()
        .current_dir(dir)
        .arg("up")
        .timeout(std::time::Duration::from_secs(20))
        .assert()
        .success()
        .stdout(predicate::str::contains("job healthy"))
        .stdout(predicate::str::contains("finished"))
        .stdout(predicate::str::contains("All services exited."));
    assert_eq!(pid_file_count(dir), 0);
}

#[test]
fn up_stops_everything_once_on_sigterm() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    for name in ["api", "web"] {
        fs::create_dir_all(dir.join("repos").join(name)).unwrap();
    }
    write_manifest(
        dir,
        r#"
repos:
  api:
    start_command: "exec sleep 60"
  web:
    start_command: "exec sleep 60"
"#,
    );

    let mut up = StdCommand::new(assert_cmd::cargo::cargo_bin!("workbench"))
        .current_dir(dir)
        .arg("up")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to launch workbench up");

    let registry = PidRegistry::new(dir);
    let service_pids: Vec<u32> = ["api", "web"]
        .iter()
        .map(|name| wait_for_record(&registry, name))
        .collect();

    // Past the liveness grace, so the signal lands while output is streaming.
    thread::sleep(Duration::from_secs(3));
    let workbench_pid = Pid::from_raw(up.id() as i32);
    kill(workbench_pid, Signal::SIGTERM).expect("failed to send SIGTERM");
    thread::sleep(Duration::from_millis(100));
    // The process may already be gone; a second signal must not restart the stop sequence.
    let _ = kill(workbench_pid, Signal::SIGTERM);

    let deadline = Instant::now() + Duration::from_secs(20);
    let status = loop {
        if let Some(status) = up.try_wait().unwrap() {
            break status;
        }
        if Instant::now() >= deadline {
            let _ = up.kill();
            panic!("workbench up did not exit after SIGTERM");
        }
        thread::sleep(Duration::from_millis(50));
    };

    let mut stdout = String::new();
    up.stdout
        .take()
        .unwrap()
        .read_to_string(&mut stdout)
        .unwrap();

    assert!(status.success(), "exit status {status:?}, stdout: {stdout}");
    assert_eq!(stdout.matches("All services stopped.").count(), 1, "stdout: {stdout}");
    assert_eq!(pid_file_count(dir), 0);

    #[cfg(target_os = "linux")]
    {
        for pid in service_pids {
            wait_for_process_exit(pid);
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        for pid in service_pids {
            assert!(!workbench::process::process_exists(pid));
        }
    }
}
