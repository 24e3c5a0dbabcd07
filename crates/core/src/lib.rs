// TermMux - Serial Terminal Multiplexer Bridge
// Copyright (C) 2026 The termmux developers
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Device model for a four-channel intelligent terminal multiplexer card
//! and the plumbing that connects it to physical RS-232 terminals: the
//! virtual-time scheduler, the per-channel receive FIFOs with XON/XOFF
//! watermarks, the asynchronous serial driver, the session abstraction and
//! the emulation driver that keeps it all on wall time.

pub mod fifo;
pub mod host;
pub mod i8080;
pub mod mux;
pub mod rom;
pub mod scheduler;
pub mod serial;
pub mod session;
pub mod system;

/// Wire-level flow control bytes. These are consumed by the flow-control
/// layers and never enter a receive FIFO, regardless of source.
pub const XON: u8 = 0x11;
pub const XOFF: u8 = 0x13;

#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    #[error("terminal index {0} out of range")]
    BadTerminal(usize),
    #[error("terminal count {0} out of range (1..=4)")]
    BadTerminalCount(usize),
}

pub use fifo::RxFifo;
pub use host::{CpuType, HostBus, NullHost};
pub use mux::{
    FlowStats, MuxEvent, MuxShared, TermMux, NS_PER_TICK, SERIAL_CHAR_DELAY_NS,
};
pub use scheduler::{Scheduler, TimerHandle};
pub use serial::{char_time_ns, reconnect_delay_ms, Direction, SerialPort};
pub use session::{
    InProcessSession, LoopbackSession, SerialSession, Session, TermToMxdCallback,
};
pub use system::System;
