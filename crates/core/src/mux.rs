// TermMux - Serial Terminal Multiplexer Bridge
// Copyright (C) 2026 The termmux developers
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Register-level model of the four-channel terminal multiplexer card.
//!
//! The card carries an embedded 8080 running the firmware image from
//! [`crate::rom`], four UART channels, and a strobe/ready-busy register
//! interface toward the host bus. Everything except the per-channel receive
//! path is owned by the emulator thread; RX bytes cross over through
//! [`MuxShared`], whose FIFO mutexes and atomics are the synchronization
//! boundary for the serial workers.

use crate::fifo::{RxFifo, DEFAULT_RX_FIFO_CAPACITY};
use crate::host::HostBus;
use crate::i8080::{Hal, I8080};
use crate::rom::MXD_ROM;
use crate::scheduler::{Scheduler, TimerHandle};
use crate::serial::SerialPort;
use crate::session::Session;
use crate::{MuxError, XOFF, XON};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use termmux_config::{CardConfig, Parity, SerialConfig, StopBits, MAX_TERMINALS};

/// The embedded 8080 runs at 1.78 MHz.
pub const NS_PER_TICK: u64 = 561;

/// One character on a 19200-baud terminal line: start + 8 data + odd parity
/// + stop = 11 bits.
pub const SERIAL_CHAR_DELAY_NS: u64 = 11 * 1_000_000_000 / 19200;

/// TX-queue fullness at or above which the card defers a transmit
/// completion.
pub const TX_BACKPRESSURE_THRESHOLD: f32 = 0.90;

// input ports seen by the embedded CPU
const IN_UART_TXRDY: u8 = 0x00; // parallel poll of TX latches with room (inverted)
const IN_BUS_STATUS: u8 = 0x01; // strobe latches, selection, address offset
const IN_OBUS_N: u8 = 0x02; // read !OB bus, clears obs/cbs strobe latches
const IN_OBSCBS_ADDR: u8 = 0x03; // [7:5] = address offset at strobe time
const IN_UART_RXRDY: u8 = 0x04; // parallel poll of channels with RX data
const IN_UART_DATA: u8 = 0x06; // pop selected channel's RX FIFO
const IN_UART_STATUS: u8 = 0x0E; // selected channel's UART status byte

// output ports
const OUT_CLR_PRIME: u8 = 0x00; // clears the reset latch
const OUT_IB_N: u8 = 0x01; // drive !IB1-!IB8, pulse IBS
const OUT_IB9_N: u8 = 0x11; // same, plus IB9
const OUT_PRIME: u8 = 0x02; // warm system reset
const OUT_HALT_STEP: u8 = 0x03; // one-shot halt strobe
const OUT_UART_SEL: u8 = 0x05; // one-hot uart chip select
const OUT_UART_DATA: u8 = 0x06; // write selected uart TX latch
const OUT_RBI: u8 = 0x07; // ready/busy mask; bit n = address n+1
const OUT_UART_CMD: u8 = 0x0E; // uart command register (stub)

/// Timer payloads the card schedules; dispatched back into
/// [`TermMux::handle_event`] by whoever drives the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxEvent {
    /// The modeled UART serializer finished (or retries under backpressure).
    TxChar { chan: usize, byte: u8 },
}

/// Flow-control counters for one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowStats {
    pub rx_overrun_drops: u32,
    pub xon_sent_count: u64,
    pub xoff_sent_count: u64,
    pub fifo_size: usize,
    pub xoff_sent: bool,
}

/// Per-channel state shared with serial RX worker threads.
struct ChannelShared {
    fifo: Mutex<RxFifo>,
    depth: AtomicUsize,
    xoff_sent: AtomicBool,
    xon_sent_count: AtomicU64,
    xoff_sent_count: AtomicU64,
    port: RwLock<Option<Arc<SerialPort>>>,
    session: RwLock<Option<Arc<dyn Session>>>,
}

impl ChannelShared {
    fn new(fifo_capacity: usize) -> Self {
        Self {
            fifo: Mutex::new(RxFifo::new(fifo_capacity)),
            depth: AtomicUsize::new(0),
            xoff_sent: AtomicBool::new(false),
            xon_sent_count: AtomicU64::new(0),
            xoff_sent_count: AtomicU64::new(0),
            port: RwLock::new(None),
            session: RwLock::new(None),
        }
    }
}

/// The card state reachable from serial RX worker threads: the receive
/// FIFOs, the flow-control machine, and the derived interrupt line.
pub struct MuxShared {
    channels: Vec<ChannelShared>,
    num_terms: usize,
    interrupt: AtomicBool,
}

impl MuxShared {
    fn new(num_terms: usize, fifo_capacity: usize) -> Self {
        Self {
            channels: (0..MAX_TERMINALS)
                .map(|_| ChannelShared::new(fifo_capacity))
                .collect(),
            num_terms,
            interrupt: AtomicBool::new(false),
        }
    }

    pub fn num_terms(&self) -> usize {
        self.num_terms
    }

    /// The interrupt line is the OR of all channels' FIFO non-emptiness;
    /// it is recomputed on every FIFO edge, never queued.
    pub fn interrupt_pending(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    pub fn rx_depth(&self, chan: usize) -> usize {
        self.channels[chan].depth.load(Ordering::SeqCst)
    }

    /// Entry point for a byte received from the terminal side. Safe to call
    /// from a serial RX worker thread.
    pub fn queue_rx_byte(&self, chan: usize, byte: u8) {
        debug_assert!(chan < MAX_TERMINALS);
        if chan >= self.channels.len() {
            return;
        }
        // peer flow control was already consumed by the serial layer; it is
        // not terminal data and never enters the FIFO
        if byte == XON || byte == XOFF {
            tracing::trace!("filtering flow control byte {:#04x} from terminal {}", byte, chan);
            return;
        }

        let ch = &self.channels[chan];
        let crossed_xoff = {
            let mut fifo = ch.fifo.lock().unwrap();
            fifo.push(byte);
            ch.depth.store(fifo.len(), Ordering::SeqCst);
            fifo.at_or_above_xoff()
        };

        if crossed_xoff {
            self.send_xoff(chan);
        }
        self.recompute_interrupt();
    }

    /// Batch insert; equivalent to sequential insertion except the
    /// interrupt line is recomputed once at the end.
    pub fn queue_rx_bytes(&self, chan: usize, data: &[u8]) {
        debug_assert!(chan < MAX_TERMINALS);
        if chan >= self.channels.len() || data.is_empty() {
            return;
        }

        let ch = &self.channels[chan];
        let crossed_xoff = {
            let mut fifo = ch.fifo.lock().unwrap();
            for &byte in data {
                if byte == XON || byte == XOFF {
                    continue;
                }
                fifo.push(byte);
            }
            ch.depth.store(fifo.len(), Ordering::SeqCst);
            fifo.at_or_above_xoff()
        };

        if crossed_xoff {
            self.send_xoff(chan);
        }
        self.recompute_interrupt();
    }

    /// Firmware read of the channel's data register: pop the head (0 when
    /// empty), release XOFF at the low watermark, refresh the interrupt.
    pub fn pop_rx(&self, chan: usize) -> u8 {
        let ch = &self.channels[chan];
        let (byte, at_xon) = {
            let mut fifo = ch.fifo.lock().unwrap();
            let byte = fifo.pop();
            ch.depth.store(fifo.len(), Ordering::SeqCst);
            (byte, fifo.at_or_below_xon())
        };

        if at_xon && ch.xoff_sent.load(Ordering::SeqCst) {
            self.send_xon(chan);
        }
        self.recompute_interrupt();
        byte.unwrap_or(0)
    }

    /// Ask the remote terminal to pause. No-op while an XOFF is already
    /// outstanding or when the channel has no transport to carry it.
    pub fn send_xoff(&self, chan: usize) {
        let ch = &self.channels[chan];
        if ch.xoff_sent.load(Ordering::SeqCst) {
            return;
        }
        if self.emit_flow_byte(chan, XOFF) {
            ch.xoff_sent.store(true, Ordering::SeqCst);
            ch.xoff_sent_count.fetch_add(1, Ordering::SeqCst);
            tracing::debug!(
                "sent XOFF to terminal {} (FIFO size: {})",
                chan,
                ch.depth.load(Ordering::SeqCst)
            );
        }
    }

    /// Release a previously sent XOFF.
    pub fn send_xon(&self, chan: usize) {
        let ch = &self.channels[chan];
        if !ch.xoff_sent.load(Ordering::SeqCst) {
            return;
        }
        if self.emit_flow_byte(chan, XON) {
            ch.xoff_sent.store(false, Ordering::SeqCst);
            ch.xon_sent_count.fetch_add(1, Ordering::SeqCst);
            tracing::debug!(
                "sent XON to terminal {} (FIFO size: {})",
                chan,
                ch.depth.load(Ordering::SeqCst)
            );
        }
    }

    fn emit_flow_byte(&self, chan: usize, byte: u8) -> bool {
        let ch = &self.channels[chan];
        if let Some(port) = ch.port.read().unwrap().as_ref() {
            if port.is_open() {
                if byte == XOFF {
                    port.send_xoff();
                } else {
                    port.send_xon();
                }
                return true;
            }
        }
        if let Some(session) = ch.session.read().unwrap().as_ref() {
            if session.is_active() {
                session.mxd_to_term(byte);
                return true;
            }
        }
        false
    }

    pub fn flow_stats(&self, chan: usize) -> FlowStats {
        let ch = &self.channels[chan];
        let fifo = ch.fifo.lock().unwrap();
        FlowStats {
            rx_overrun_drops: fifo.overrun_drops(),
            xon_sent_count: ch.xon_sent_count.load(Ordering::SeqCst),
            xoff_sent_count: ch.xoff_sent_count.load(Ordering::SeqCst),
            fifo_size: fifo.len(),
            xoff_sent: ch.xoff_sent.load(Ordering::SeqCst),
        }
    }

    pub fn session(&self, chan: usize) -> Option<Arc<dyn Session>> {
        self.channels[chan].session.read().unwrap().clone()
    }

    pub fn port(&self, chan: usize) -> Option<Arc<SerialPort>> {
        self.channels[chan].port.read().unwrap().clone()
    }

    fn recompute_interrupt(&self) {
        let pending = self
            .channels
            .iter()
            .take(self.num_terms)
            .any(|ch| ch.depth.load(Ordering::SeqCst) > 0);
        self.interrupt.store(pending, Ordering::SeqCst);
    }
}

/// Per-channel transmit latch plus the serializer timer that models
/// character time on the wire.
#[derive(Debug, Default)]
struct TxState {
    ready: bool,
    byte: u8,
    timer: Option<TimerHandle>,
}

/// Card state owned by the emulator thread (everything but the FIFOs).
struct CardState {
    shared: Arc<MuxShared>,
    host: Box<dyn HostBus>,
    base_addr: u16,
    ram: [u8; 4096],
    num_terms: usize,
    selected: bool,
    cpb: bool,
    io_offset: u8,
    prime_seen: bool,
    obs_seen: bool,
    cbs_seen: bool,
    obscbs_offset: u8,
    obscbs_data: u8,
    rbi: u8,
    uart_sel: usize,
    tx: [TxState; MAX_TERMINALS],
}

/// The terminal multiplexer card.
pub struct TermMux {
    cpu: I8080,
    state: CardState,
}

impl TermMux {
    /// Build a card from its configuration record. Terminals with a
    /// configured com port get a card-owned serial port opened eagerly; a
    /// failed open leaves the channel free for a session attached later.
    pub fn new(cfg: &CardConfig, host: Box<dyn HostBus>) -> Result<Self, MuxError> {
        Self::with_fifo_capacity(cfg, host, DEFAULT_RX_FIFO_CAPACITY)
    }

    /// As [`TermMux::new`], with an explicit receive FIFO depth.
    pub fn with_fifo_capacity(
        cfg: &CardConfig,
        host: Box<dyn HostBus>,
        fifo_capacity: usize,
    ) -> Result<Self, MuxError> {
        if cfg.num_terminals < 1 || cfg.num_terminals > MAX_TERMINALS {
            return Err(MuxError::BadTerminalCount(cfg.num_terminals));
        }

        let shared = Arc::new(MuxShared::new(cfg.num_terminals, fifo_capacity));
        let mut tx: [TxState; MAX_TERMINALS] = Default::default();
        for t in &mut tx {
            t.ready = true;
        }

        let mut cpu = I8080::new();
        cpu.reset();

        let mut card = Self {
            cpu,
            state: CardState {
                shared,
                host,
                base_addr: cfg.addr,
                ram: [0u8; 4096],
                num_terms: cfg.num_terminals,
                selected: false,
                cpb: true,
                io_offset: 0,
                prime_seen: true,
                obs_seen: false,
                cbs_seen: false,
                obscbs_offset: 0,
                obscbs_data: 0,
                rbi: 0xFF,
                uart_sel: 0,
                tx,
            },
        };

        for n in 0..cfg.num_terminals {
            let term = &cfg.terminals[n];
            if term.com_port.is_empty() {
                tracing::debug!("terminal {} available for session connection", n);
                continue;
            }

            let serial_cfg = SerialConfig {
                port_name: term.com_port.clone(),
                baud_rate: term.baud_rate,
                data_bits: 8,
                stop_bits: StopBits::One,
                parity: Parity::Odd,
                // the terminals this card serves have no RTS/CTS wiring
                hw_flow_control: false,
                sw_flow_control: term.sw_flow_control,
                ..Default::default()
            };

            let port = SerialPort::new();
            if port.open(&serial_cfg) {
                card.attach_port(n, port)?;
                tracing::info!(
                    "terminal {} connected to {} at {} baud",
                    n,
                    term.com_port,
                    term.baud_rate
                );
            } else {
                tracing::warn!(
                    "failed to open {} for terminal {}, available for session connection",
                    term.com_port,
                    n
                );
            }
        }

        Ok(card)
    }

    pub fn name(&self) -> &'static str {
        "2236 MXD"
    }

    pub fn description(&self) -> &'static str {
        "Terminal Mux"
    }

    /// Bus addresses this card responds to: base+1 through base+7, never
    /// base itself.
    pub fn addresses(&self) -> Vec<u16> {
        (1..8).map(|i| self.state.base_addr + i).collect()
    }

    /// Handle to the thread-shared channel state, for wiring RX callbacks.
    pub fn shared(&self) -> Arc<MuxShared> {
        Arc::clone(&self.state.shared)
    }

    // ---- host bus interface -------------------------------------------

    /// The card's own power-on-reset already ran; a bus PRIME strobe only
    /// sets a latch the firmware samples and clears with OUT 0.
    pub fn reset(&mut self, _hard: bool) {
        self.state.prime_seen = true;
    }

    pub fn select(&mut self, ab: u16) {
        self.state.io_offset = (ab & 7) as u8;
        // offset 0 is not claimed
        if self.state.io_offset == 0 {
            return;
        }
        self.state.selected = true;
        self.state.update_rbi();
    }

    pub fn deselect(&mut self) {
        self.state.host.set_dev_rdy(false);
        self.state.selected = false;
        self.state.cpb = true;
    }

    pub fn strobe_obs(&mut self, val: u8) {
        // a previous strobe must have been consumed before the next arrives
        debug_assert!(
            !self.state.obs_seen && !self.state.cbs_seen,
            "OBS strobe before the previous strobe was serviced"
        );
        if self.state.obs_seen || self.state.cbs_seen {
            tracing::warn!("overlapping bus strobes, keeping the latest (OBS)");
        }
        // the address offset is latched on the strobe edge so the host may
        // re-address the card while the firmware is still servicing this
        self.state.obs_seen = true;
        self.state.cbs_seen = false;
        self.state.obscbs_offset = self.state.io_offset;
        self.state.obscbs_data = val;
        self.state.update_rbi();
    }

    pub fn strobe_cbs(&mut self, val: u8) {
        debug_assert!(
            !self.state.obs_seen && !self.state.cbs_seen,
            "CBS strobe before the previous strobe was serviced"
        );
        if self.state.obs_seen || self.state.cbs_seen {
            tracing::warn!("overlapping bus strobes, keeping the latest (CBS)");
        }
        self.state.cbs_seen = true;
        self.state.obs_seen = false;
        self.state.obscbs_offset = self.state.io_offset;
        self.state.obscbs_data = val;
        self.state.update_rbi();
    }

    /// At address offset 5 a gate forces !IB5 low; the host microcode uses
    /// that bit to learn the attached display is 80x24.
    pub fn get_ib(&self) -> u8 {
        if self.state.io_offset == 5 {
            0x10
        } else {
            0x00
        }
    }

    pub fn set_cpu_busy(&mut self, busy: bool) {
        self.state.cpb = busy;
    }

    // ---- embedded CPU -------------------------------------------------

    /// Execute one firmware instruction; returns elapsed virtual
    /// nanoseconds. Called by the system clock driver.
    pub fn exec_one_op(&mut self, sched: &mut Scheduler<MuxEvent>) -> u64 {
        if self.state.shared.interrupt_pending() {
            // offer the RST 7 acknowledge; the core's own mask decides
            let mut hal = CardHal {
                state: &mut self.state,
                sched,
            };
            self.cpu.interrupt(&mut hal, 0xFF);
        }

        let ticks = {
            let mut hal = CardHal {
                state: &mut self.state,
                sched,
            };
            self.cpu.exec_one_op(&mut hal)
        };
        if ticks > 30 {
            // error state: clamp to a fixed cost and keep going
            return 4 * NS_PER_TICK;
        }
        ticks as u64 * NS_PER_TICK
    }

    /// Dispatch a fired scheduler event.
    pub fn handle_event(&mut self, event: MuxEvent, sched: &mut Scheduler<MuxEvent>) {
        match event {
            MuxEvent::TxChar { chan, byte } => self.state.tx_char_done(chan, byte, sched),
        }
    }

    /// Direct access to the embedded CPU's device ports. This is the HAL
    /// contract the firmware runs against, and the seam tests drive.
    pub fn port_in(&mut self, port: u8) -> u8 {
        self.state.port_in(port)
    }

    pub fn port_out(&mut self, sched: &mut Scheduler<MuxEvent>, port: u8, value: u8) {
        self.state.port_out(sched, port, value);
    }

    // ---- terminal bindings --------------------------------------------

    /// Bind an already-opened serial port as the channel's card-owned
    /// transport, wiring its receive path into the channel FIFO. Any
    /// previous transport is torn down first.
    pub fn attach_port(&mut self, chan: usize, port: Arc<SerialPort>) -> Result<(), MuxError> {
        if chan >= MAX_TERMINALS {
            return Err(MuxError::BadTerminal(chan));
        }
        let ch = &self.state.shared.channels[chan];
        if let Some(old) = ch.port.write().unwrap().take() {
            old.set_receive_callback(None);
            old.close();
        }
        ch.session.write().unwrap().take();

        let rx_shared = Arc::clone(&self.state.shared);
        port.set_receive_callback(Some(Box::new(move |byte| {
            rx_shared.queue_rx_byte(chan, byte);
        })));
        *ch.port.write().unwrap() = Some(port);
        Ok(())
    }

    /// Bind (or unbind) a session, tearing down any card-owned serial port
    /// first so the channel has exactly one transport.
    pub fn set_session(
        &mut self,
        chan: usize,
        session: Option<Arc<dyn Session>>,
    ) -> Result<(), MuxError> {
        if chan >= MAX_TERMINALS {
            return Err(MuxError::BadTerminal(chan));
        }
        let ch = &self.state.shared.channels[chan];
        if let Some(port) = ch.port.write().unwrap().take() {
            port.set_receive_callback(None);
            port.close();
        }
        match &session {
            Some(s) => tracing::info!("terminal {} connected to session: {}", chan, s.describe()),
            None => tracing::info!("terminal {} session disconnected", chan),
        }
        *ch.session.write().unwrap() = session;
        Ok(())
    }

    /// A key press arriving from an in-process terminal. Ignored when the
    /// channel is bound to a physical port: the real terminal owns input.
    pub fn receive_keystroke(&mut self, chan: usize, byte: u8) {
        if chan >= MAX_TERMINALS {
            return;
        }
        if self.state.shared.channels[chan].port.read().unwrap().is_some() {
            return;
        }
        self.state.shared.queue_rx_byte(chan, byte);
    }

    pub fn flow_stats(&self, chan: usize) -> FlowStats {
        self.state.shared.flow_stats(chan)
    }
}

impl Drop for TermMux {
    fn drop(&mut self) {
        for ch in &self.state.shared.channels {
            if let Some(port) = ch.port.write().unwrap().take() {
                // pending TX is flushed, not drained, so nothing spurious
                // reaches the terminal after exit
                port.flush_tx_queue();
                port.set_receive_callback(None);
                port.close();
            }
            ch.session.write().unwrap().take();
            ch.fifo.lock().unwrap().clear();
            ch.depth.store(0, Ordering::SeqCst);
        }
    }
}

/// Reschedule delay once a channel's TX queue is past the backpressure
/// threshold: 50 us at 90% rising to about 200 us when full.
pub fn backpressure_delay_ns(fullness: f32) -> u64 {
    let over = (fullness - TX_BACKPRESSURE_THRESHOLD).max(0.0);
    let micros = 50.0 + over * 1500.0;
    (micros * 1000.0) as u64
}

impl CardState {
    /// Recompute the host-visible ready/busy line. Only driven while the
    /// card is selected at a non-zero offset.
    fn update_rbi(&mut self) {
        if self.io_offset == 0 || !self.selected {
            return;
        }
        let busy = ((self.obs_seen || self.cbs_seen) && self.io_offset >= 4)
            || (self.rbi >> (self.io_offset - 1)) & 1 != 0;
        self.host.set_dev_rdy(!busy);
    }

    fn port_in(&mut self, port: u8) -> u8 {
        match port {
            IN_UART_TXRDY => {
                // the hardware inverts the status
                let mut rv = 0u8;
                for (i, t) in self.tx.iter().enumerate() {
                    if !t.ready {
                        rv |= 1 << i;
                    }
                }
                rv
            }

            IN_BUS_STATUS => {
                let cpu_waiting = self.selected && !self.cpb;
                (self.obs_seen as u8)
                    | (self.cbs_seen as u8) << 1
                    | (self.prime_seen as u8) << 2
                    | (cpu_waiting as u8) << 3
                    | (self.selected as u8) << 4
                    | self.io_offset << 5
            }

            // the 8080 sees the inverted bus polarity
            IN_OBUS_N => {
                self.obs_seen = false;
                self.cbs_seen = false;
                self.update_rbi();
                !self.obscbs_data
            }

            IN_OBSCBS_ADDR => self.obscbs_offset << 5,

            IN_UART_RXRDY => {
                let mut rv = 0u8;
                for i in 0..MAX_TERMINALS {
                    if self.shared.rx_depth(i) > 0 {
                        rv |= 1 << i;
                    }
                }
                rv
            }

            IN_UART_DATA => self.shared.pop_rx(self.uart_sel),

            IN_UART_STATUS => {
                let t = &self.tx[self.uart_sel];
                let tx_empty = t.ready && t.timer.is_none();
                let rx_ready = self.shared.rx_depth(self.uart_sel) > 0;
                let dsr = self.uart_sel < self.num_terms;
                (t.ready as u8)
                    | (rx_ready as u8) << 1
                    | (tx_empty as u8) << 2
                    | (dsr as u8) << 7
            }

            other => {
                debug_assert!(false, "read of unmapped port {:#04x}", other);
                0
            }
        }
    }

    fn port_out(&mut self, sched: &mut Scheduler<MuxEvent>, port: u8, value: u8) {
        match port {
            OUT_CLR_PRIME => self.prime_seen = false,

            OUT_IB_N => self.host.io_card_cb_ibs(!value as u16),
            OUT_IB9_N => self.host.io_card_cb_ibs(0x100 | !value as u16),

            OUT_PRIME => self.host.reset(false),
            OUT_HALT_STEP => self.host.halt(),

            OUT_UART_SEL => {
                debug_assert!(
                    matches!(value, 0x00 | 0x01 | 0x02 | 0x04 | 0x08),
                    "uart select is one-hot, got {:#04x}",
                    value
                );
                self.uart_sel = match value {
                    0x02 => 1,
                    0x04 => 2,
                    0x08 => 3,
                    _ => 0,
                };
            }

            OUT_UART_DATA => {
                if self.uart_sel < self.num_terms {
                    let chan = self.uart_sel;
                    if !self.tx[chan].ready {
                        tracing::warn!("terminal {} firmware overwrote the uart tx latch", chan);
                    }
                    self.tx[chan].ready = false;
                    self.tx[chan].byte = value;
                    self.check_tx_buffer(chan, sched);
                }
            }

            // only the handful of 8251 behaviors the firmware relies on are
            // modeled; the command register is accepted and ignored
            OUT_UART_CMD => {}

            OUT_RBI => {
                self.rbi = value;
                self.update_rbi();
            }

            other => {
                debug_assert!(false, "write to unmapped port {:#04x}", other);
            }
        }
    }

    /// Start the modeled serializer if a byte is latched and no character
    /// is already on the wire. The latch stays busy until the completion
    /// callback runs; that is what keeps the host at line rate.
    fn check_tx_buffer(&mut self, chan: usize, sched: &mut Scheduler<MuxEvent>) {
        let t = &mut self.tx[chan];
        if t.ready || t.timer.is_some() {
            return;
        }
        let byte = t.byte;
        t.timer = Some(sched.create_timer(SERIAL_CHAR_DELAY_NS, MuxEvent::TxChar { chan, byte }));
    }

    /// Serializer completion: apply the backpressure gate, deliver the byte
    /// to the bound transport, and only then free the TX latch.
    fn tx_char_done(&mut self, chan: usize, byte: u8, sched: &mut Scheduler<MuxEvent>) {
        self.tx[chan].timer = None;

        let gate_delay = {
            let guard = self.shared.channels[chan].port.read().unwrap();
            guard.as_ref().filter(|p| p.is_open()).and_then(|port| {
                let cap = port.tx_queue_capacity();
                let fullness = port.tx_queue_len() as f32 / cap as f32;
                if fullness >= TX_BACKPRESSURE_THRESHOLD {
                    Some((fullness, backpressure_delay_ns(fullness)))
                } else {
                    None
                }
            })
        };
        if let Some((fullness, delay_ns)) = gate_delay {
            tracing::debug!(
                "terminal {} TX queue {}% full, delaying {} us",
                chan,
                (fullness * 100.0) as u32,
                delay_ns / 1000
            );
            self.tx[chan].timer =
                Some(sched.create_timer(delay_ns, MuxEvent::TxChar { chan, byte }));
            return;
        }

        // transport priority: session, then card-owned serial port
        let ch = &self.shared.channels[chan];
        let session = ch.session.read().unwrap().clone();
        if let Some(session) = session {
            session.mxd_to_term(byte);
        } else {
            let port = ch.port.read().unwrap().clone();
            if let Some(port) = port {
                port.send_byte(byte);
            }
        }

        self.tx[chan].ready = true;
        self.check_tx_buffer(chan, sched);
    }
}

/// Memory map and device ports as seen by the embedded CPU: ROM below
/// 0x1000, RAM at 0x2000..0x2FFF.
struct CardHal<'a> {
    state: &'a mut CardState,
    sched: &'a mut Scheduler<MuxEvent>,
}

impl Hal for CardHal<'_> {
    fn mem_read(&mut self, addr: u16) -> u8 {
        if addr < 0x1000 {
            return MXD_ROM[addr as usize];
        }
        if (0x2000..0x3000).contains(&addr) {
            return self.state.ram[(addr & 0x0FFF) as usize];
        }
        debug_assert!(false, "firmware read of unmapped address {:#06x}", addr);
        0x00
    }

    fn mem_write(&mut self, addr: u16, value: u8) {
        if (0x2000..0x3000).contains(&addr) {
            self.state.ram[(addr & 0x0FFF) as usize] = value;
            return;
        }
        debug_assert!(false, "firmware write of unmapped address {:#06x}", addr);
    }

    fn port_in(&mut self, port: u8) -> u8 {
        self.state.port_in(port)
    }

    fn port_out(&mut self, port: u8, value: u8) {
        self.state.port_out(self.sched, port, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_char_delay_matches_line_rate() {
        // 11 bits at 19200 baud is 572.9 us
        assert!(SERIAL_CHAR_DELAY_NS >= 572_000 && SERIAL_CHAR_DELAY_NS <= 574_000);
    }

    #[test]
    fn test_backpressure_delay_curve() {
        assert_eq!(backpressure_delay_ns(0.90), 50_000);
        let mid = backpressure_delay_ns(0.95);
        assert!(mid > 120_000 && mid < 130_000, "got {}", mid);
        assert_eq!(backpressure_delay_ns(1.0), 200_000);
        // below threshold the gate is never consulted, but clamp anyway
        assert_eq!(backpressure_delay_ns(0.5), 50_000);
    }

    #[test]
    fn test_shared_filters_flow_bytes() {
        let shared = MuxShared::new(4, 64);
        shared.queue_rx_byte(0, XON);
        shared.queue_rx_byte(0, XOFF);
        assert_eq!(shared.rx_depth(0), 0);
        assert!(!shared.interrupt_pending());

        shared.queue_rx_byte(0, b'x');
        assert_eq!(shared.rx_depth(0), 1);
        assert!(shared.interrupt_pending());
    }

    #[test]
    fn test_pop_rx_empty_reads_zero() {
        let shared = MuxShared::new(4, 64);
        assert_eq!(shared.pop_rx(2), 0);
        shared.queue_rx_byte(2, 0x7F);
        assert_eq!(shared.pop_rx(2), 0x7F);
        assert!(!shared.interrupt_pending());
    }

    #[test]
    fn test_batch_insert_recomputes_interrupt_once() {
        let shared = MuxShared::new(4, 64);
        shared.queue_rx_bytes(1, &[1, 2, XON, 3]);
        assert_eq!(shared.rx_depth(1), 3);
        assert!(shared.interrupt_pending());
        assert_eq!(shared.pop_rx(1), 1);
        assert_eq!(shared.pop_rx(1), 2);
        assert_eq!(shared.pop_rx(1), 3);
        assert!(!shared.interrupt_pending());
    }

    #[test]
    fn test_xoff_needs_a_transport() {
        // with no port or session bound, the watermark crossing cannot be
        // signalled and the flag must stay clear
        let shared = MuxShared::new(1, 8);
        for b in 0..8u8 {
            shared.queue_rx_byte(0, 0x20 + b);
        }
        let stats = shared.flow_stats(0);
        assert!(!stats.xoff_sent);
        assert_eq!(stats.xoff_sent_count, 0);
    }
}
