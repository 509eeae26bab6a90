//! Per-room timers
//!
//! The room task drives this clock from its event loop: between inbox
//! messages it sleeps until the earliest deadline, then claims the due
//! timers and runs their callbacks on the same task as the simulation
//! tick and message handlers, so timer callbacks never race room state.
//! Disposal clears everything atomically; no callback fires afterwards.

use std::time::Duration;
use tokio::time::Instant;

use crate::room::RoomContext;

pub type TimerCallback = Box<dyn FnMut(&mut RoomContext) + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerId(pub(crate) u64);

struct TimerEntry {
    id: TimerId,
    deadline: Instant,
    /// `Some` for recurring intervals, `None` for one-shot timeouts.
    period: Option<Duration>,
    callback: TimerCallback,
}

/// A timer that came due. Recurring timers are handed back to the clock
/// with [`Clock::rearm`] after the callback runs.
pub(crate) struct FiredTimer {
    pub id: TimerId,
    pub period: Option<Duration>,
    pub callback: TimerCallback,
}

#[derive(Default)]
pub struct Clock {
    timers: Vec<TimerEntry>,
}

impl Clock {
    pub fn new() -> Self {
        Self { timers: Vec::new() }
    }

    pub(crate) fn insert(
        &mut self,
        id: TimerId,
        deadline: Instant,
        period: Option<Duration>,
        callback: TimerCallback,
    ) {
        self.timers.push(TimerEntry {
            id,
            deadline,
            period,
            callback,
        });
    }

    pub fn clear(&mut self, id: TimerId) -> bool {
        let before = self.timers.len();
        self.timers.retain(|t| t.id != id);
        self.timers.len() != before
    }

    pub fn clear_all(&mut self) {
        self.timers.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.iter().map(|t| t.deadline).min()
    }

    /// Claims every timer due at `now`, in deadline order.
    pub(crate) fn take_due(&mut self, now: Instant) -> Vec<FiredTimer> {
        let mut due: Vec<TimerEntry> = Vec::new();
        let mut remaining: Vec<TimerEntry> = Vec::new();
        for entry in self.timers.drain(..) {
            if entry.deadline <= now {
                due.push(entry);
            } else {
                remaining.push(entry);
            }
        }
        self.timers = remaining;
        due.sort_by_key(|t| t.deadline);
        due.into_iter()
            .map(|t| FiredTimer {
                id: t.id,
                period: t.period,
                callback: t.callback,
            })
            .collect()
    }

    /// Reschedules a recurring timer after its callback ran.
    pub(crate) fn rearm(&mut self, fired: FiredTimer, now: Instant) {
        if let Some(period) = fired.period {
            self.insert(fired.id, now + period, Some(period), fired.callback);
        }
    }
}
