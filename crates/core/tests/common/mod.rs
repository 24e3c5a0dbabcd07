// TermMux - Serial Terminal Multiplexer Bridge
// Copyright (C) 2026 The termmux developers
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Shared fixtures for the integration suites: pty pairs standing in for
//! USB-serial devices, and a recording host bus.

#![allow(dead_code)]

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::pty::openpty;
use nix::unistd::{read, ttyname, write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use termmux_core::host::{CpuType, HostBus};

/// A pty pair: the slave end plays the part of the serial device file, the
/// master end plays the terminal on the far side of the cable.
pub struct FakeSerialDevice {
    pub master: OwnedFd,
    pub slave_path: String,
}

pub fn open_fake_device() -> FakeSerialDevice {
    let pty = openpty(None, None).expect("openpty");
    let slave_path = ttyname(&pty.slave)
        .expect("slave pty name")
        .to_string_lossy()
        .into_owned();
    drop(pty.slave);

    // non-blocking master so test reads can poll
    let flags = OFlag::from_bits_truncate(fcntl(pty.master.as_raw_fd(), FcntlArg::F_GETFL).unwrap());
    fcntl(
        pty.master.as_raw_fd(),
        FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK),
    )
    .unwrap();

    FakeSerialDevice {
        master: pty.master,
        slave_path,
    }
}

impl FakeSerialDevice {
    /// Type bytes at the far-side terminal.
    pub fn send(&self, data: &[u8]) {
        let mut off = 0;
        while off < data.len() {
            match write(&self.master, &data[off..]) {
                Ok(n) => off += n,
                Err(nix::errno::Errno::EAGAIN) => std::thread::sleep(Duration::from_millis(1)),
                Err(e) => panic!("master write failed: {}", e),
            }
        }
    }

    /// Drain whatever the card has transmitted so far.
    pub fn drain(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            match read(self.master.as_raw_fd(), &mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(_) => break,
            }
        }
        out
    }
}

/// Spin until `pred` holds, with a real-time deadline. Returns false on
/// timeout so the caller can assert with context.
pub fn wait_until(timeout: Duration, mut pred: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    pred()
}

#[derive(Debug, Default)]
pub struct HostLog {
    pub dev_rdy: Vec<bool>,
    pub ibs: Vec<u16>,
    pub halts: usize,
    pub resets: usize,
}

/// Host bus that records every line transition for assertions.
pub struct RecordingHost(pub Arc<Mutex<HostLog>>);

impl RecordingHost {
    pub fn new() -> (Box<dyn HostBus>, Arc<Mutex<HostLog>>) {
        let log = Arc::new(Mutex::new(HostLog::default()));
        (Box::new(Self(Arc::clone(&log))), log)
    }
}

impl HostBus for RecordingHost {
    fn cpu_type(&self) -> CpuType {
        CpuType::Model2200Vp
    }

    fn set_dev_rdy(&mut self, ready: bool) {
        self.0.lock().unwrap().dev_rdy.push(ready);
    }

    fn io_card_cb_ibs(&mut self, value: u16) {
        self.0.lock().unwrap().ibs.push(value);
    }

    fn halt(&mut self) {
        self.0.lock().unwrap().halts += 1;
    }

    fn reset(&mut self, _hard: bool) {
        self.0.lock().unwrap().resets += 1;
    }
}
