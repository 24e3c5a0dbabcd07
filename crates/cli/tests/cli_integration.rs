// TermMux - Serial Terminal Multiplexer Bridge
// Copyright (C) 2026 The termmux developers
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Integration tests for the termmux-server binary.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::io::Read;
use std::process::{Command, Stdio};
use std::time::Duration;

fn binary() -> &'static str {
    env!("CARGO_BIN_EXE_termmux-server")
}

#[test]
fn help_exits_cleanly() {
    let output = Command::new(binary()).arg("--help").output().unwrap();
    assert!(output.status.success());
    let text = String::from_utf8_lossy(&output.stdout);
    assert!(text.contains("--ini"));
    assert!(text.contains("--web-config"));
    assert!(text.contains("--web-port"));
    assert!(text.contains("--debug-wakeups"));
}

#[test]
fn bad_ini_exits_with_error() {
    let dir = tempfile::tempdir().unwrap();
    let ini = dir.path().join("bad.ini");
    std::fs::write(
        &ini,
        "[terminal_server/term0]\nport = /dev/ttyUSB0\nparity = maybe\n",
    )
    .unwrap();

    let output = Command::new(binary())
        .arg(format!("--ini={}", ini.display()))
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    let err = String::from_utf8_lossy(&output.stderr);
    assert!(err.contains("parity"));
}

#[test]
fn missing_ini_path_exits_with_error() {
    let output = Command::new(binary())
        .arg("--ini=/nonexistent/termmux.ini")
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn sigterm_shuts_down_cleanly() {
    // no terminals configured: the server idles until signalled
    let dir = tempfile::tempdir().unwrap();
    let ini = dir.path().join("idle.ini");
    std::fs::write(&ini, "[terminal_server]\nnum_terms = 1\n").unwrap();

    let mut child = Command::new(binary())
        .arg(format!("--ini={}", ini.display()))
        .current_dir(dir.path())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    std::thread::sleep(Duration::from_millis(500));
    kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM).unwrap();

    let status = child.wait().unwrap();
    assert!(status.success());
}

#[test]
fn sigusr1_dumps_json_status() {
    let dir = tempfile::tempdir().unwrap();
    let ini = dir.path().join("status.ini");
    std::fs::write(&ini, "[terminal_server]\nnum_terms = 2\n").unwrap();

    let mut child = Command::new(binary())
        .arg(format!("--ini={}", ini.display()))
        .current_dir(dir.path())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    std::thread::sleep(Duration::from_millis(500));
    let pid = Pid::from_raw(child.id() as i32);
    kill(pid, Signal::SIGUSR1).unwrap();
    std::thread::sleep(Duration::from_millis(500));
    kill(pid, Signal::SIGTERM).unwrap();

    let status = child.wait().unwrap();
    assert!(status.success());

    let mut stdout = String::new();
    child
        .stdout
        .take()
        .unwrap()
        .read_to_string(&mut stdout)
        .unwrap();
    let json_start = stdout.find('{').expect("no JSON in stdout");
    let snapshot: serde_json::Value = serde_json::from_str(stdout[json_start..].trim()).unwrap();
    assert_eq!(snapshot["status"], "running");
    let terminals = snapshot["terminals"].as_array().unwrap();
    assert_eq!(terminals.len(), 4);
    assert_eq!(terminals[0]["active"], false);
}