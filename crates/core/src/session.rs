// TermMux - Serial Terminal Multiplexer Bridge
// Copyright (C) 2026 The termmux developers
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Uniform byte-channel abstraction between the card and one terminal.
//!
//! The card pushes bytes toward the terminal through [`Session::mxd_to_term`];
//! the reverse path is a callback handed to the concrete session at
//! construction time. Variants are composed, not inherited: a serial session
//! wraps a driver port, an in-process session wraps a channel pair, and the
//! loopback session wires its own output back for tests and demos.

use crate::serial::SerialPort;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};

/// Callback invoked for every byte the terminal sends toward the card.
pub type TermToMxdCallback = Arc<dyn Fn(u8) + Send + Sync>;

pub trait Session: Send + Sync {
    /// Deliver one byte from the card to the terminal.
    fn mxd_to_term(&self, byte: u8);
    fn is_active(&self) -> bool;
    fn describe(&self) -> String;
}

/// Session over a physical serial line.
///
/// Construction installs the port's receive callback; dropping the session
/// clears it again so the port never calls into a dead session.
pub struct SerialSession {
    port: Arc<SerialPort>,
}

impl SerialSession {
    pub fn new(port: Arc<SerialPort>, on_from_term: TermToMxdCallback) -> Arc<Self> {
        port.set_receive_callback(Some(Box::new(move |byte| on_from_term(byte))));
        Arc::new(Self { port })
    }

    pub fn port(&self) -> &Arc<SerialPort> {
        &self.port
    }

    /// (rx_bytes, tx_bytes) as counted by the underlying port.
    pub fn stats(&self) -> (u64, u64) {
        (self.port.rx_byte_count(), self.port.tx_byte_count())
    }
}

impl Session for SerialSession {
    fn mxd_to_term(&self, byte: u8) {
        // dropping bytes on a closed port is normal during startup/shutdown
        if self.port.is_open() {
            self.port.send_byte(byte);
        }
    }

    fn is_active(&self) -> bool {
        self.port.is_open()
    }

    fn describe(&self) -> String {
        format!("Serial:{}", self.port.port_name())
    }
}

impl Drop for SerialSession {
    fn drop(&mut self) {
        self.port.set_receive_callback(None);
        let (rx, tx) = self.stats();
        tracing::debug!("destroyed {} (RX: {}, TX: {} bytes)", self.describe(), rx, tx);
    }
}

/// Session bound to an in-process screen model. Bytes toward the terminal
/// land on an mpsc channel the screen drains; keystrokes come back through
/// [`InProcessSession::key_from_terminal`].
pub struct InProcessSession {
    name: String,
    to_term: Mutex<mpsc::Sender<u8>>,
    on_from_term: TermToMxdCallback,
    active: AtomicBool,
}

impl InProcessSession {
    pub fn new(name: &str, on_from_term: TermToMxdCallback) -> (Arc<Self>, mpsc::Receiver<u8>) {
        let (tx, rx) = mpsc::channel();
        let session = Arc::new(Self {
            name: name.to_string(),
            to_term: Mutex::new(tx),
            on_from_term,
            active: AtomicBool::new(true),
        });
        (session, rx)
    }

    /// A key press on the in-process terminal.
    pub fn key_from_terminal(&self, byte: u8) {
        (self.on_from_term)(byte);
    }
}

impl Session for InProcessSession {
    fn mxd_to_term(&self, byte: u8) {
        if self.to_term.lock().unwrap().send(byte).is_err() {
            // the screen side hung up
            self.active.store(false, Ordering::SeqCst);
        }
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn describe(&self) -> String {
        format!("Terminal:{}", self.name)
    }
}

/// Records every byte it is handed and optionally feeds it straight back
/// into the from-terminal path.
pub struct LoopbackSession {
    on_from_term: TermToMxdCallback,
    sent: Mutex<Vec<u8>>,
    echo: bool,
}

impl LoopbackSession {
    /// Loopback that echoes card output back as terminal input.
    pub fn new(on_from_term: TermToMxdCallback) -> Arc<Self> {
        Arc::new(Self {
            on_from_term,
            sent: Mutex::new(Vec::new()),
            echo: true,
        })
    }

    /// Loopback that only records, without the echo path.
    pub fn silent(on_from_term: TermToMxdCallback) -> Arc<Self> {
        Arc::new(Self {
            on_from_term,
            sent: Mutex::new(Vec::new()),
            echo: false,
        })
    }

    pub fn sent(&self) -> Vec<u8> {
        self.sent.lock().unwrap().clone()
    }

    pub fn take_sent(&self) -> Vec<u8> {
        std::mem::take(&mut self.sent.lock().unwrap())
    }
}

impl Session for LoopbackSession {
    fn mxd_to_term(&self, byte: u8) {
        self.sent.lock().unwrap().push(byte);
        if self.echo {
            (self.on_from_term)(byte);
        }
    }

    fn is_active(&self) -> bool {
        true
    }

    fn describe(&self) -> String {
        "Loopback".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_loopback_records_and_echoes() {
        let echoed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&echoed);
        let session = LoopbackSession::new(Arc::new(move |b| sink.lock().unwrap().push(b)));

        session.mxd_to_term(0x41);
        session.mxd_to_term(0x42);
        assert_eq!(session.sent(), vec![0x41, 0x42]);
        assert_eq!(*echoed.lock().unwrap(), vec![0x41, 0x42]);
        assert!(session.is_active());
    }

    #[test]
    fn test_silent_loopback_does_not_echo() {
        let count = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&count);
        let session = LoopbackSession::silent(Arc::new(move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        }));
        session.mxd_to_term(0x13);
        assert_eq!(session.sent(), vec![0x13]);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_in_process_session_round_trip() {
        let keys = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&keys);
        let (session, screen) =
            InProcessSession::new("term0", Arc::new(move |b| sink.lock().unwrap().push(b)));

        assert_eq!(session.describe(), "Terminal:term0");
        session.mxd_to_term(b'H');
        session.mxd_to_term(b'i');
        assert_eq!(screen.try_recv().unwrap(), b'H');
        assert_eq!(screen.try_recv().unwrap(), b'i');

        session.key_from_terminal(0x0D);
        assert_eq!(*keys.lock().unwrap(), vec![0x0D]);
    }

    #[test]
    fn test_in_process_session_deactivates_when_screen_gone() {
        let (session, screen) = InProcessSession::new("gone", Arc::new(|_| {}));
        assert!(session.is_active());
        drop(screen);
        session.mxd_to_term(0x00);
        assert!(!session.is_active());
    }
}
