// TermMux - Serial Terminal Multiplexer Bridge
// Copyright (C) 2026 The termmux developers
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use std::collections::{BTreeMap, HashMap};

/// Identifies a pending timer for cancellation. Stale handles (already fired
/// or cancelled) are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

/// Virtual-time event queue.
///
/// Time is integer nanoseconds on a clock that advances only through
/// [`Scheduler::tick`]; it has no relationship to wall time. Events fire in
/// deadline order, with insertion order breaking ties. The owner of the
/// scheduler dispatches the returned events on its own thread, so an event
/// handler is free to schedule or cancel further timers between ticks.
#[derive(Debug)]
pub struct Scheduler<T> {
    now_ns: u64,
    next_id: u64,
    next_seq: u64,
    by_deadline: BTreeMap<(u64, u64), (TimerHandle, T)>,
    by_id: HashMap<u64, (u64, u64)>,
}

impl<T> Default for Scheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Scheduler<T> {
    pub fn new() -> Self {
        Self {
            now_ns: 0,
            next_id: 1,
            next_seq: 0,
            by_deadline: BTreeMap::new(),
            by_id: HashMap::new(),
        }
    }

    /// Current virtual time in nanoseconds.
    pub fn now(&self) -> u64 {
        self.now_ns
    }

    /// Schedule `event` to fire `delay_ns` from now.
    pub fn create_timer(&mut self, delay_ns: u64, event: T) -> TimerHandle {
        let deadline = self.now_ns.saturating_add(delay_ns);
        let seq = self.next_seq;
        self.next_seq += 1;
        let handle = TimerHandle(self.next_id);
        self.next_id += 1;

        self.by_deadline.insert((deadline, seq), (handle, event));
        self.by_id.insert(handle.0, (deadline, seq));
        handle
    }

    /// Remove an unexpired timer. Idempotent: handles that already fired or
    /// were cancelled are silently ignored.
    pub fn cancel(&mut self, handle: TimerHandle) {
        if let Some(key) = self.by_id.remove(&handle.0) {
            self.by_deadline.remove(&key);
        }
    }

    /// Advance virtual time to `now_ns` (never backwards) and collect every
    /// event whose deadline has been reached, in firing order.
    pub fn tick(&mut self, now_ns: u64) -> Vec<T> {
        if now_ns > self.now_ns {
            self.now_ns = now_ns;
        }

        let mut fired = Vec::new();
        while let Some((&(deadline, seq), _)) = self.by_deadline.first_key_value() {
            if deadline > self.now_ns {
                break;
            }
            let (handle, event) = self.by_deadline.remove(&(deadline, seq)).unwrap();
            self.by_id.remove(&handle.0);
            fired.push(event);
        }
        fired
    }

    pub fn has_pending(&self) -> bool {
        !self.by_deadline.is_empty()
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.by_deadline.first_key_value().map(|(&(d, _), _)| d)
    }

    /// Wait budget for the main loop: milliseconds until the next deadline,
    /// rounded up; `Some(0)` when a timer is already overdue.
    pub fn ms_until_next(&self) -> Option<u64> {
        self.next_deadline().map(|d| {
            let delta = d.saturating_sub(self.now_ns);
            delta.div_ceil(1_000_000)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fires_in_deadline_order() {
        let mut s = Scheduler::new();
        s.create_timer(300, "c");
        s.create_timer(100, "a");
        s.create_timer(200, "b");

        assert_eq!(s.tick(50), Vec::<&str>::new());
        assert_eq!(s.tick(250), vec!["a", "b"]);
        assert_eq!(s.tick(300), vec!["c"]);
        assert!(!s.has_pending());
    }

    #[test]
    fn test_ties_break_by_insertion_order() {
        let mut s = Scheduler::new();
        s.create_timer(100, 1);
        s.create_timer(100, 2);
        s.create_timer(100, 3);
        assert_eq!(s.tick(100), vec![1, 2, 3]);
    }

    #[test]
    fn test_zero_delay_fires_on_next_tick() {
        let mut s = Scheduler::new();
        s.create_timer(0, "now");
        assert_eq!(s.tick(0), vec!["now"]);
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let mut s = Scheduler::new();
        let h = s.create_timer(100, "x");
        s.cancel(h);
        s.cancel(h);
        assert_eq!(s.tick(1000), Vec::<&str>::new());
    }

    #[test]
    fn test_cancel_removes_only_target() {
        let mut s = Scheduler::new();
        let a = s.create_timer(100, "a");
        s.create_timer(100, "b");
        s.cancel(a);
        assert_eq!(s.tick(100), vec!["b"]);
    }

    #[test]
    fn test_stale_handle_after_fire_is_ignored() {
        let mut s = Scheduler::new();
        let h = s.create_timer(10, "x");
        assert_eq!(s.tick(10), vec!["x"]);
        // handle already fired; cancelling must not disturb later timers
        s.create_timer(10, "y");
        s.cancel(h);
        assert_eq!(s.tick(20), vec!["y"]);
    }

    #[test]
    fn test_time_never_goes_backwards() {
        let mut s: Scheduler<u8> = Scheduler::new();
        s.tick(500);
        s.tick(100);
        assert_eq!(s.now(), 500);
    }

    #[test]
    fn test_ms_until_next_rounds_up() {
        let mut s = Scheduler::new();
        assert_eq!(s.ms_until_next(), None);
        s.create_timer(1_500_000, "x");
        assert_eq!(s.ms_until_next(), Some(2));

        let mut s = Scheduler::new();
        s.create_timer(2_000_000, "x");
        assert_eq!(s.ms_until_next(), Some(2));

        // overdue timers report zero wait
        let mut s = Scheduler::new();
        s.create_timer(100, "x");
        s.now_ns = 200;
        assert_eq!(s.ms_until_next(), Some(0));
    }

    #[test]
    fn test_timers_scheduled_during_dispatch_wait_for_next_tick() {
        let mut s = Scheduler::new();
        s.create_timer(100, "first");
        let fired = s.tick(100);
        assert_eq!(fired, vec!["first"]);
        // the owner handles "first" and schedules a follow-up
        s.create_timer(100, "second");
        assert_eq!(s.tick(150), Vec::<&str>::new());
        assert_eq!(s.tick(200), vec!["second"]);
    }
}
