// TermMux - Serial Terminal Multiplexer Bridge
// Copyright (C) 2026 The termmux developers
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Asynchronous full-duplex serial port driver.
//!
//! One RX worker thread per port translates blocking OS reads into callback
//! invocations; transmission is a best-effort immediate write with the
//! unwritten remainder queued in a mutex-protected buffer that the worker
//! drains on POLLOUT. A read error or EOF triggers the exponential-backoff
//! reconnect ladder. All counters are lock-free atomics so the emulator
//! thread can sample them without touching the worker.

use crate::{XOFF, XON};
use nix::fcntl::OFlag;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::termios::{
    cfsetispeed, cfsetospeed, tcflush, tcgetattr, tcsetattr, BaudRate, ControlFlags, FlushArg,
    InputFlags, LocalFlags, OutputFlags, SetArg, SpecialCharacterIndices,
};
use nix::unistd::{read, write};
use std::os::fd::{AsFd, BorrowedFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use termmux_config::{Parity, SerialConfig, StopBits};

/// Direction flag passed to capture taps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Rx,
    Tx,
}

pub type RxCallback = Box<dyn Fn(u8) + Send>;
pub type CaptureCallback = Box<dyn Fn(u8, Direction) + Send>;

pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;
pub const BASE_RECONNECT_DELAY_MS: u64 = 250;

const RX_CHUNK: usize = 512;
const POLL_INTERVAL_MS: u16 = 10;
const ACTIVITY_WINDOW: Duration = Duration::from_millis(100);
const ACTIVITY_RESET: Duration = Duration::from_millis(200);

/// Time on the wire for one character with the given framing.
pub fn char_time_ns(cfg: &SerialConfig) -> u64 {
    let mut bits = 1 + cfg.data_bits as u64;
    if cfg.parity != Parity::None {
        bits += 1;
    }
    bits += match cfg.stop_bits {
        StopBits::One => 1,
        StopBits::Two => 2,
    };
    bits * 1_000_000_000 / cfg.baud_rate as u64
}

/// Backoff before reconnect attempt `n`: 250 ms, 500 ms, 1 s, ... capped at 10 s.
pub fn reconnect_delay_ms(attempts: u32) -> u64 {
    (BASE_RECONNECT_DELAY_MS << attempts.min(5)).min(10_000)
}

fn baud_to_speed(baud: u32) -> BaudRate {
    match baud {
        300 => BaudRate::B300,
        1200 => BaudRate::B1200,
        2400 => BaudRate::B2400,
        4800 => BaudRate::B4800,
        9600 => BaudRate::B9600,
        19200 => BaudRate::B19200,
        38400 => BaudRate::B38400,
        57600 => BaudRate::B57600,
        115200 => BaudRate::B115200,
        other => {
            tracing::warn!("unsupported baud rate {}, using 19200", other);
            BaudRate::B19200
        }
    }
}

struct ActivityClock {
    last_rx: Instant,
    last_tx: Instant,
    last_reset: Instant,
}

pub struct SerialPort {
    fd: AtomicI32,
    config: Mutex<SerialConfig>,
    tx_buf: Mutex<Vec<u8>>,
    rx_callback: Mutex<Option<RxCallback>>,
    capture: Mutex<Option<CaptureCallback>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    stop: AtomicBool,
    cancel_rd: OwnedFd,
    cancel_wr: OwnedFd,

    rx_bytes: AtomicU64,
    tx_bytes: AtomicU64,
    recent_rx: AtomicU32,
    recent_tx: AtomicU32,
    activity: Mutex<ActivityClock>,

    xoff_sent: AtomicBool,
    xon_sent_count: AtomicU64,
    xoff_sent_count: AtomicU64,

    connected: AtomicBool,
    reconnect_attempts: AtomicU32,
}

impl SerialPort {
    pub fn new() -> Arc<Self> {
        let (cancel_rd, cancel_wr) =
            nix::unistd::pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC).expect("cancellation pipe");
        let now = Instant::now();
        let idle_since = now.checked_sub(ACTIVITY_WINDOW).unwrap_or(now);
        Arc::new(Self {
            fd: AtomicI32::new(-1),
            config: Mutex::new(SerialConfig::default()),
            tx_buf: Mutex::new(Vec::new()),
            rx_callback: Mutex::new(None),
            capture: Mutex::new(None),
            worker: Mutex::new(None),
            stop: AtomicBool::new(false),
            cancel_rd,
            cancel_wr,
            rx_bytes: AtomicU64::new(0),
            tx_bytes: AtomicU64::new(0),
            recent_rx: AtomicU32::new(0),
            recent_tx: AtomicU32::new(0),
            activity: Mutex::new(ActivityClock {
                last_rx: idle_since,
                last_tx: idle_since,
                last_reset: now,
            }),
            xoff_sent: AtomicBool::new(false),
            xon_sent_count: AtomicU64::new(0),
            xoff_sent_count: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            reconnect_attempts: AtomicU32::new(0),
        })
    }

    pub fn is_open(&self) -> bool {
        self.fd.load(Ordering::SeqCst) >= 0
    }

    pub fn port_name(&self) -> String {
        self.config.lock().unwrap().port_name.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::SeqCst)
    }

    /// Configure and open the device, then start the RX worker. Returns
    /// false with a log line on any failure; the caller decides whether to
    /// retry later.
    pub fn open(self: &Arc<Self>, cfg: &SerialConfig) -> bool {
        if self.is_open() {
            self.close();
        }
        *self.config.lock().unwrap() = cfg.clone();

        let fd = match Self::configure_fd(cfg) {
            Ok(fd) => fd,
            Err(e) => {
                tracing::warn!("failed to open {}: {}", cfg.port_name, e);
                return false;
            }
        };

        self.stop.store(false, Ordering::SeqCst);
        self.drain_cancel_pipe();
        self.fd.store(fd, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        self.reconnect_attempts.store(0, Ordering::SeqCst);

        // the worker holds only a weak handle so an abandoned port can
        // still be dropped; each iteration re-upgrades
        let weak = Arc::downgrade(self);
        let handle = std::thread::Builder::new()
            .name("serial-rx".to_string())
            .spawn(move || Self::rx_worker(weak))
            .expect("spawn serial rx worker");
        *self.worker.lock().unwrap() = Some(handle);

        let parity = match cfg.parity {
            Parity::Odd => 'O',
            Parity::Even => 'E',
            Parity::None => 'N',
        };
        let stop = if cfg.stop_bits == StopBits::One { 1 } else { 2 };
        tracing::info!(
            "opened {} at {} baud, {}{}{}, flow {}",
            cfg.port_name,
            cfg.baud_rate,
            cfg.data_bits,
            parity,
            stop,
            match (cfg.hw_flow_control, cfg.sw_flow_control) {
                (true, true) => "RTS/CTS+XON/XOFF",
                (true, false) => "RTS/CTS",
                (false, true) => "XON/XOFF",
                (false, false) => "none",
            }
        );
        true
    }

    /// Stop the RX worker, drop the handle and flush the TX buffer without
    /// transmitting it.
    pub fn close(&self) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = write(&self.cancel_wr, &[1u8]);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }

        let fd = self.fd.swap(-1, Ordering::SeqCst);
        if fd >= 0 {
            let _ = nix::unistd::close(fd);
            let name = self.config.lock().unwrap().port_name.clone();
            tracing::info!("closed {}", name);
        }
        self.tx_buf.lock().unwrap().clear();
        self.connected.store(false, Ordering::SeqCst);
    }

    fn configure_fd(cfg: &SerialConfig) -> std::io::Result<RawFd> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags((OFlag::O_NOCTTY | OFlag::O_NONBLOCK).bits())
            .open(&cfg.port_name)?;
        let fd = file.into_raw_fd();
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };

        let result = (|| -> nix::Result<()> {
            let mut tty = tcgetattr(borrowed)?;

            tty.control_flags &= !(ControlFlags::CSIZE
                | ControlFlags::PARENB
                | ControlFlags::PARODD
                | ControlFlags::CSTOPB
                | ControlFlags::CRTSCTS);
            tty.input_flags &= !(InputFlags::IXON
                | InputFlags::IXOFF
                | InputFlags::IXANY
                | InputFlags::IGNBRK
                | InputFlags::BRKINT
                | InputFlags::PARMRK
                | InputFlags::ISTRIP
                | InputFlags::INLCR
                | InputFlags::IGNCR
                | InputFlags::ICRNL);
            tty.output_flags &= !OutputFlags::OPOST;
            tty.local_flags &= !(LocalFlags::ICANON
                | LocalFlags::ECHO
                | LocalFlags::ECHONL
                | LocalFlags::ISIG
                | LocalFlags::IEXTEN);

            tty.control_flags |= match cfg.data_bits {
                7 => ControlFlags::CS7,
                8 => ControlFlags::CS8,
                other => {
                    tracing::warn!("invalid data bits {}, using 8", other);
                    ControlFlags::CS8
                }
            };
            match cfg.parity {
                Parity::None => {}
                Parity::Odd => {
                    tty.control_flags |= ControlFlags::PARENB | ControlFlags::PARODD;
                }
                Parity::Even => {
                    tty.control_flags |= ControlFlags::PARENB;
                }
            }
            if cfg.stop_bits == StopBits::Two {
                tty.control_flags |= ControlFlags::CSTOPB;
            }
            tty.control_flags |= ControlFlags::CREAD | ControlFlags::CLOCAL;
            if cfg.hw_flow_control {
                tty.control_flags |= ControlFlags::CRTSCTS;
            }
            // driver-level XON/XOFF, layered under the application watermarks
            if cfg.sw_flow_control {
                tty.input_flags |= InputFlags::IXON | InputFlags::IXOFF;
            }

            let speed = baud_to_speed(cfg.baud_rate);
            cfsetispeed(&mut tty, speed)?;
            cfsetospeed(&mut tty, speed)?;

            tty.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
            tty.control_chars[SpecialCharacterIndices::VTIME as usize] = 1;

            tcsetattr(borrowed, SetArg::TCSANOW, &tty)?;
            tcflush(borrowed, FlushArg::TCIOFLUSH)?;
            Ok(())
        })();

        match result {
            Ok(()) => Ok(fd),
            Err(e) => {
                let _ = nix::unistd::close(fd);
                Err(e.into())
            }
        }
    }

    pub fn set_receive_callback(&self, cb: Option<RxCallback>) {
        *self.rx_callback.lock().unwrap() = cb;
    }

    pub fn set_capture_callback(&self, cb: Option<CaptureCallback>) {
        *self.capture.lock().unwrap() = cb;
    }

    fn capture_byte(&self, byte: u8, dir: Direction) {
        if let Some(cb) = self.capture.lock().unwrap().as_ref() {
            cb(byte, dir);
        }
    }

    /// Non-blocking single-byte transmit: immediate write when the kernel
    /// accepts it, otherwise queued for the worker's POLLOUT drain.
    pub fn send_byte(&self, byte: u8) {
        let fd = self.fd.load(Ordering::SeqCst);
        if fd < 0 {
            tracing::debug!("port closed, dropping TX byte {:#04x}", byte);
            return;
        }
        self.capture_byte(byte, Direction::Tx);

        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        match write(borrowed, &[byte]) {
            Ok(1) => {
                self.tx_bytes.fetch_add(1, Ordering::SeqCst);
                self.note_tx_activity(1);
            }
            Ok(_) | Err(nix::errno::Errno::EAGAIN) => self.enqueue_tx(&[byte]),
            Err(e) => {
                tracing::warn!("serial write failed: {}", e);
            }
        }
    }

    /// Batched transmit with the same immediate-write fast path.
    pub fn send_data(&self, data: &[u8]) {
        let fd = self.fd.load(Ordering::SeqCst);
        if fd < 0 {
            tracing::debug!("port closed, dropping {} TX bytes", data.len());
            return;
        }
        for &b in data {
            self.capture_byte(b, Direction::Tx);
        }

        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        match write(borrowed, data) {
            Ok(n) => {
                self.tx_bytes.fetch_add(n as u64, Ordering::SeqCst);
                self.note_tx_activity(n as u32);
                if n < data.len() {
                    self.enqueue_tx(&data[n..]);
                }
            }
            Err(nix::errno::Errno::EAGAIN) => self.enqueue_tx(data),
            Err(e) => {
                tracing::warn!("serial write failed: {}", e);
            }
        }
    }

    /// Queue bytes for the worker's drain path, bypassing the immediate
    /// write. Overflow beyond the configured queue size is dropped.
    pub fn enqueue_tx(&self, data: &[u8]) {
        let cap = self.tx_queue_capacity();
        let mut buf = self.tx_buf.lock().unwrap();
        if buf.len() + data.len() > cap {
            tracing::warn!(
                "TX queue full ({} + {} > {}), dropping data",
                buf.len(),
                data.len(),
                cap
            );
            let room = cap.saturating_sub(buf.len());
            buf.extend_from_slice(&data[..room]);
            return;
        }
        buf.extend_from_slice(data);
    }

    /// Application-level XON. A no-op unless an XOFF is outstanding.
    pub fn send_xon(&self) {
        if self.xoff_sent.swap(false, Ordering::SeqCst) {
            self.send_byte(XON);
            self.xon_sent_count.fetch_add(1, Ordering::SeqCst);
            tracing::debug!("sent XON to {}", self.config.lock().unwrap().port_name);
        }
    }

    /// Application-level XOFF. Idempotent until released by `send_xon`.
    pub fn send_xoff(&self) {
        if !self.xoff_sent.swap(true, Ordering::SeqCst) {
            self.send_byte(XOFF);
            self.xoff_sent_count.fetch_add(1, Ordering::SeqCst);
            tracing::debug!("sent XOFF to {}", self.config.lock().unwrap().port_name);
        }
    }

    pub fn is_xoff_sent(&self) -> bool {
        self.xoff_sent.load(Ordering::SeqCst)
    }

    pub fn xon_sent_count(&self) -> u64 {
        self.xon_sent_count.load(Ordering::SeqCst)
    }

    pub fn xoff_sent_count(&self) -> u64 {
        self.xoff_sent_count.load(Ordering::SeqCst)
    }

    pub fn rx_byte_count(&self) -> u64 {
        self.rx_bytes.load(Ordering::SeqCst)
    }

    pub fn tx_byte_count(&self) -> u64 {
        self.tx_bytes.load(Ordering::SeqCst)
    }

    pub fn reset_counters(&self) {
        self.rx_bytes.store(0, Ordering::SeqCst);
        self.tx_bytes.store(0, Ordering::SeqCst);
    }

    pub fn tx_queue_len(&self) -> usize {
        self.tx_buf.lock().unwrap().len()
    }

    pub fn tx_queue_capacity(&self) -> usize {
        self.config.lock().unwrap().tx_queue_size
    }

    pub fn is_tx_queue_near_full(&self, threshold: f32) -> bool {
        self.tx_queue_len() as f32 >= self.tx_queue_capacity() as f32 * threshold
    }

    /// Clear the TX queue without transmitting (shutdown path).
    pub fn flush_tx_queue(&self) {
        self.tx_buf.lock().unwrap().clear();
    }

    /// True when any byte moved in either direction within the last 100 ms.
    pub fn has_recent_activity(&self) -> bool {
        let now = Instant::now();
        let mut clock = self.activity.lock().unwrap();
        if now.duration_since(clock.last_reset) > ACTIVITY_RESET {
            self.recent_rx.store(0, Ordering::SeqCst);
            self.recent_tx.store(0, Ordering::SeqCst);
            clock.last_reset = now;
        }
        now.duration_since(clock.last_rx) < ACTIVITY_WINDOW
            || now.duration_since(clock.last_tx) < ACTIVITY_WINDOW
    }

    pub fn recent_rx_bytes(&self) -> u32 {
        self.recent_rx.load(Ordering::SeqCst)
    }

    pub fn recent_tx_bytes(&self) -> u32 {
        self.recent_tx.load(Ordering::SeqCst)
    }

    fn note_tx_activity(&self, n: u32) {
        self.activity.lock().unwrap().last_tx = Instant::now();
        self.recent_tx.fetch_add(n, Ordering::SeqCst);
    }

    fn note_rx_activity(&self) {
        self.activity.lock().unwrap().last_rx = Instant::now();
        self.recent_rx.fetch_add(1, Ordering::SeqCst);
    }

    fn drain_cancel_pipe(&self) {
        let mut scratch = [0u8; 16];
        while matches!(read(self.cancel_rd.as_raw_fd(), &mut scratch), Ok(n) if n > 0) {}
    }

    fn process_received_byte(&self, byte: u8) {
        self.rx_bytes.fetch_add(1, Ordering::SeqCst);
        self.note_rx_activity();
        self.capture_byte(byte, Direction::Rx);
        if let Some(cb) = self.rx_callback.lock().unwrap().as_ref() {
            cb(byte);
        }
    }

    fn rx_worker(weak: std::sync::Weak<Self>) {
        let mut buf = [0u8; RX_CHUNK];
        loop {
            let Some(port) = weak.upgrade() else {
                break;
            };
            if !port.worker_iteration(&mut buf) {
                break;
            }
        }
    }

    /// One poll cycle of the RX worker. Returns false when the worker
    /// should exit.
    fn worker_iteration(&self, buf: &mut [u8]) -> bool {
        if self.stop.load(Ordering::SeqCst) {
            return false;
        }
        let fd = self.fd.load(Ordering::SeqCst);
        if fd < 0 {
            return false;
        }
        let port_fd = unsafe { BorrowedFd::borrow_raw(fd) };

        let mut events = PollFlags::POLLIN;
        if !self.tx_buf.lock().unwrap().is_empty() {
            events |= PollFlags::POLLOUT;
        }
        let mut fds = [
            PollFd::new(port_fd, events),
            PollFd::new(self.cancel_rd.as_fd(), PollFlags::POLLIN),
        ];

        let n = match poll(&mut fds, PollTimeout::from(POLL_INTERVAL_MS)) {
            Ok(n) => n,
            Err(nix::errno::Errno::EINTR) => return true,
            Err(e) => {
                tracing::warn!("poll failed: {}, attempting reconnection", e);
                return self.run_reconnect();
            }
        };
        if n <= 0 {
            return true;
        }

        if fds[1]
            .revents()
            .unwrap_or(PollFlags::empty())
            .contains(PollFlags::POLLIN)
        {
            self.drain_cancel_pipe();
            return false;
        }

        let revents = fds[0].revents().unwrap_or(PollFlags::empty());
        if revents.contains(PollFlags::POLLIN) {
            match read(port_fd.as_raw_fd(), buf) {
                Ok(0) => {
                    tracing::warn!("port disconnected, attempting reconnection");
                    return self.run_reconnect();
                }
                Ok(n) => {
                    for &b in &buf[..n] {
                        self.process_received_byte(b);
                    }
                }
                Err(nix::errno::Errno::EAGAIN) => {}
                Err(e) => {
                    tracing::warn!("read failed: {}, attempting reconnection", e);
                    return self.run_reconnect();
                }
            }
        }
        if revents.contains(PollFlags::POLLOUT) {
            self.drain_tx_buffer();
        }
        true
    }

    fn drain_tx_buffer(&self) {
        let fd = self.fd.load(Ordering::SeqCst);
        if fd < 0 {
            return;
        }
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let mut buf = self.tx_buf.lock().unwrap();
        if buf.is_empty() {
            return;
        }
        match write(borrowed, &buf) {
            Ok(n) if n > 0 => {
                self.tx_bytes.fetch_add(n as u64, Ordering::SeqCst);
                buf.drain(..n);
                drop(buf);
                self.note_tx_activity(n as u32);
            }
            Ok(_) | Err(nix::errno::Errno::EAGAIN) => {}
            Err(e) => {
                tracing::warn!("TX drain failed: {}", e);
            }
        }
    }

    /// Exponential-backoff reopen, interruptible by the cancellation pipe.
    /// Returns true once the device is open again.
    fn run_reconnect(&self) -> bool {
        self.connected.store(false, Ordering::SeqCst);
        let old = self.fd.swap(-1, Ordering::SeqCst);
        if old >= 0 {
            let _ = nix::unistd::close(old);
        }
        let cfg = self.config.lock().unwrap().clone();

        while !self.stop.load(Ordering::SeqCst) {
            let attempts = self.reconnect_attempts.load(Ordering::SeqCst);
            if attempts >= MAX_RECONNECT_ATTEMPTS {
                tracing::warn!("giving up on {} after {} attempts", cfg.port_name, attempts);
                return false;
            }
            let delay = reconnect_delay_ms(attempts);
            tracing::info!(
                "reconnecting {} in {} ms (attempt {}/{})",
                cfg.port_name,
                delay,
                attempts + 1,
                MAX_RECONNECT_ATTEMPTS
            );

            let mut fds = [PollFd::new(self.cancel_rd.as_fd(), PollFlags::POLLIN)];
            let _ = poll(&mut fds, PollTimeout::from(delay.min(u16::MAX as u64) as u16));
            if self.stop.load(Ordering::SeqCst) {
                return false;
            }

            self.reconnect_attempts.fetch_add(1, Ordering::SeqCst);
            match Self::configure_fd(&cfg) {
                Ok(fd) => {
                    self.fd.store(fd, Ordering::SeqCst);
                    self.connected.store(true, Ordering::SeqCst);
                    self.reconnect_attempts.store(0, Ordering::SeqCst);
                    tracing::info!("reconnected {}", cfg.port_name);
                    return true;
                }
                Err(e) => {
                    tracing::debug!("reconnect attempt failed: {}", e);
                }
            }
        }
        false
    }
}

impl Drop for SerialPort {
    fn drop(&mut self) {
        self.close();
    }
}
