#![allow(dead_code)]

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use workbench::{
    logs::Color,
    pid::PidRegistry,
    service::{LaunchDescriptor, ServiceHandle},
};

pub fn descriptor(dir: &Path, name: &str, command: &str) -> LaunchDescriptor {
    LaunchDescriptor {
        name: name.into(),
        command: command.into(),
        working_dir: dir.to_path_buf(),
        port: None,
        health_check: None,
        env: HashMap::new(),
    }
}

pub fn handle(dir: &Path, name: &str, command: &str) -> ServiceHandle {
    ServiceHandle::new(
        descriptor(dir, name, command),
        Color::Cyan,
        PidRegistry::new(dir),
    )
}

/// Writes `workbench.yaml` into `dir` and returns its path.
pub fn write_manifest(dir: &Path, content: &str) -> PathBuf {
    let path = dir.join("workbench.yaml");
    fs::write(&path, content).expect("failed to write manifest");
    path
}

pub fn pid_dir(root: &Path) -> PathBuf {
    root.join(".workbench").join("pids")
}

/// Number of `.pid` files left on disk, stale or not.
pub fn pid_file_count(root: &Path) -> usize {
    fs::read_dir(pid_dir(root))
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "pid"))
                .count()
        })
        .unwrap_or(0)
}

pub fn wait_for_path(path: &Path) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if path.exists() {
            return;
        }
        thread::sleep(Duration::from_millis(50));
    }
    panic!("Timed out waiting for {:?} to exist", path);
}

pub fn wait_for_lines(path: &Path, expected: usize) -> Vec<String> {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(content) = fs::read_to_string(path) {
            let lines: Vec<_> = content.lines().map(str::to_string).collect();
            if lines.len() >= expected {
                return lines;
            }
        }

        if Instant::now() >= deadline {
            panic!("Timed out waiting for {expected} lines in {:?}", path);
        }

        thread::sleep(Duration::from_millis(50));
    }
}

/// Waits until a complete PID record for `service` can be read.
pub fn wait_for_record(registry: &PidRegistry, service: &str) -> u32 {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(Some(record)) = registry.read(service) {
            return record.pid;
        }
        if Instant::now() >= deadline {
            panic!("Timed out waiting for a PID record for '{service}'");
        }
        thread::sleep(Duration::from_millis(50));
    }
}

/// Reads a PID written by a test script.
pub fn read_pid(path: &Path) -> u32 {
    wait_for_path(path);
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(content) = fs::read_to_string(path)
            && let Ok(pid) = content.trim().parse()
        {
            return pid;
        }
        if Instant::now() >= deadline {
            panic!("Timed out reading a PID from {:?}", path);
        }
        thread::sleep(Duration::from_millis(50));
    }
}

/// Whether `pid` is a live, non-zombie process.
#[cfg(target_os = "linux")]
pub fn is_process_alive(pid: u32) -> bool {
    let stat_path = PathBuf::from(format!("/proc/{pid}/stat"));
    let Ok(stat) = fs::read_to_string(stat_path) else {
        return false;
    };

    // The state character follows the parenthesised command name.
    match stat.rfind(')') {
        Some(end) => !matches!(stat[end + 1..].trim().chars().next(), Some('Z' | 'X')),
        None => true,
    }
}

#[cfg(target_os = "linux")]
pub fn wait_for_process_exit(pid: u32) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if !is_process_alive(pid) {
            return;
        }
        thread::sleep(Duration::from_millis(50));
    }
    panic!("Process {pid} did not exit within the deadline");
}
