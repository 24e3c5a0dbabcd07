// TermMux - Serial Terminal Multiplexer Bridge
// Copyright (C) 2026 The termmux developers
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! The bus contract between the card and the emulated host CPU.
//!
//! The host machine itself is an external collaborator; the card only needs
//! the handful of lines below. The server binary runs against [`NullHost`],
//! which latches the ready line and trace-logs response bytes, so the card
//! can serve terminals with no host machine attached.

/// Host CPU generations the card can be plugged into. The card only uses
/// this to decide boot-time presentation details.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuType {
    Model2200B,
    Model2200T,
    Model2200Vp,
}

pub trait HostBus: Send {
    fn cpu_type(&self) -> CpuType;

    /// Drive the host's "device ready" line.
    fn set_dev_rdy(&mut self, ready: bool);

    /// Deliver a 9-bit response on the host input bus; bit 8 is a control
    /// flag, the low byte is data.
    fn io_card_cb_ibs(&mut self, value: u16);

    /// One-shot halt/step strobe toward the host CPU.
    fn halt(&mut self);

    /// Firmware-requested machine reset (warm unless `hard`).
    fn reset(&mut self, hard: bool);
}

/// Stand-in host for headless terminal service.
#[derive(Debug, Default)]
pub struct NullHost {
    dev_ready: bool,
}

impl NullHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dev_ready(&self) -> bool {
        self.dev_ready
    }
}

impl HostBus for NullHost {
    fn cpu_type(&self) -> CpuType {
        CpuType::Model2200Vp
    }

    fn set_dev_rdy(&mut self, ready: bool) {
        self.dev_ready = ready;
    }

    fn io_card_cb_ibs(&mut self, value: u16) {
        tracing::trace!("IBS response {:#05x}", value);
    }

    fn halt(&mut self) {
        tracing::debug!("host halt strobe");
    }

    fn reset(&mut self, hard: bool) {
        tracing::debug!("host reset requested (hard={})", hard);
    }
}
