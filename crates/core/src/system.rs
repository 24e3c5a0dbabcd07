// TermMux - Serial Terminal Multiplexer Bridge
// Copyright (C) 2026 The termmux developers
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Emulation driver: owns the scheduler and the card, and advances virtual
//! time by stepping the embedded CPU. Everything here runs on the single
//! emulator thread; timer events fired by the scheduler are dispatched
//! straight back into the card.

use crate::mux::{MuxEvent, TermMux};
use crate::scheduler::Scheduler;
use std::time::Instant;

/// Upper bound on how much wall-clock backlog one idle call will replay.
/// Anything beyond it is dropped so a stall never turns into a burst of
/// emulated time.
const MAX_IDLE_BACKLOG_NS: u64 = 50_000_000;

pub struct System {
    sched: Scheduler<MuxEvent>,
    card: TermMux,
    last_idle: Option<Instant>,
    running: bool,
}

impl System {
    pub fn new(card: TermMux) -> Self {
        Self {
            sched: Scheduler::new(),
            card,
            last_idle: None,
            running: true,
        }
    }

    pub fn card(&self) -> &TermMux {
        &self.card
    }

    pub fn card_mut(&mut self) -> &mut TermMux {
        &mut self.card
    }

    pub fn virtual_now(&self) -> u64 {
        self.sched.now()
    }

    pub fn ms_until_next_timer(&self) -> Option<u64> {
        self.sched.ms_until_next()
    }

    pub fn has_pending_timers(&self) -> bool {
        self.sched.has_pending()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    /// Main-loop idle hook: replay the wall time elapsed since the last
    /// call as virtual time. Returns false once the system has been
    /// stopped.
    pub fn on_idle(&mut self) -> bool {
        if !self.running {
            return false;
        }

        let now = Instant::now();
        let elapsed_ns = self
            .last_idle
            .map(|t| now.duration_since(t).as_nanos() as u64)
            .unwrap_or(0);
        self.last_idle = Some(now);

        let budget = if elapsed_ns > MAX_IDLE_BACKLOG_NS {
            tracing::debug!(
                "emulation fell behind, dropping {} ms of backlog",
                (elapsed_ns - MAX_IDLE_BACKLOG_NS) / 1_000_000
            );
            MAX_IDLE_BACKLOG_NS
        } else {
            elapsed_ns
        };

        self.run_virtual(budget);
        true
    }

    /// Advance virtual time by `ns`, interleaving firmware instructions
    /// with due timer events.
    pub fn run_virtual(&mut self, ns: u64) {
        let target = self.sched.now() + ns;
        while self.sched.now() < target {
            let step_ns = self.card.exec_one_op(&mut self.sched);
            let next = self.sched.now() + step_ns;
            for event in self.sched.tick(next) {
                self.card.handle_event(event, &mut self.sched);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::NullHost;
    use termmux_config::CardConfig;

    fn test_system() -> System {
        let cfg = CardConfig {
            num_terminals: 2,
            ..Default::default()
        };
        let card = TermMux::new(&cfg, Box::new(NullHost::new())).unwrap();
        System::new(card)
    }

    #[test]
    fn test_run_virtual_advances_time() {
        let mut sys = test_system();
        assert_eq!(sys.virtual_now(), 0);
        sys.run_virtual(1_000_000);
        assert!(sys.virtual_now() >= 1_000_000);
        // a single instruction never overshoots by more than one op's time
        assert!(sys.virtual_now() < 1_000_000 + 20 * crate::NS_PER_TICK);
    }

    #[test]
    fn test_stop_ends_idle_loop() {
        let mut sys = test_system();
        assert!(sys.on_idle());
        sys.stop();
        assert!(!sys.on_idle());
        assert!(!sys.is_running());
    }

    #[test]
    fn test_firmware_echoes_through_loopback() {
        use crate::session::LoopbackSession;
        use std::sync::Arc;

        let mut sys = test_system();
        let shared = sys.card().shared();
        let loopback = LoopbackSession::silent(Arc::new(|_| {}));
        sys.card_mut().set_session(0, Some(loopback.clone())).unwrap();

        // a keystroke from the terminal side lands in the FIFO; the polling
        // firmware pops it and latches it into the same channel's TX path,
        // and one character time later it comes back out of the session
        shared.queue_rx_byte(0, b'A');
        sys.run_virtual(5 * crate::SERIAL_CHAR_DELAY_NS);

        assert_eq!(loopback.sent(), vec![b'A']);
        assert_eq!(shared.rx_depth(0), 0);
        assert!(!shared.interrupt_pending());
    }
}
