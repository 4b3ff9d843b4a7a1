//! Named session timers
//!
//! One scheduler owns every timer a session can hold, so teardown is a
//! single `cancel_all` and a stray callback can never outlive the state
//! it was armed for. Timers are polled with an explicit `Instant`, which
//! keeps tests synchronous.

use std::time::{Duration, Instant};

/// Every timer the session can arm, by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Repeating 100ms sampler driving time-limit checks while racing.
    ElapsedTick,
    /// Repeating 1s pre-race countdown tick.
    CountdownTick,
    /// One-shot fallback that posts locally computed results when the
    /// authoritative finish has not arrived by the end of the grace
    /// window.
    ResultFallback,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    kind: TimerKind,
    due: Instant,
    period: Option<Duration>,
}

/// The session's timer set. At most one slot per [`TimerKind`].
#[derive(Debug, Default)]
pub struct Timers {
    slots: Vec<Slot>,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm (or re-arm) a one-shot timer.
    pub fn arm_once(&mut self, kind: TimerKind, now: Instant, delay: Duration) {
        self.cancel(kind);
        self.slots.push(Slot {
            kind,
            due: now + delay,
            period: None,
        });
    }

    /// Arm (or re-arm) a repeating timer; the first fire is one period out.
    pub fn arm_repeating(&mut self, kind: TimerKind, now: Instant, period: Duration) {
        self.cancel(kind);
        self.slots.push(Slot {
            kind,
            due: now + period,
            period: Some(period),
        });
    }

    pub fn cancel(&mut self, kind: TimerKind) {
        self.slots.retain(|slot| slot.kind != kind);
    }

    /// Teardown path: nothing fires after this.
    pub fn cancel_all(&mut self) {
        self.slots.clear();
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.slots.iter().any(|slot| slot.kind == kind)
    }

    /// Timers due at `now`, in arming order. A repeating timer fires at
    /// most once per poll and re-arms relative to `now`, so a stalled
    /// caller never faces a burst of catch-up ticks.
    pub fn poll(&mut self, now: Instant) -> Vec<TimerKind> {
        let mut fired = Vec::new();
        self.slots.retain_mut(|slot| {
            if slot.due > now {
                return true;
            }
            fired.push(slot.kind);
            match slot.period {
                Some(period) => {
                    slot.due = now + period;
                    true
                }
                None => false,
            }
        });
        fired
    }
}
