//! Coalescing scheduler: turns a burst of triggers into spaced, single-flight
//! cycle starts.
//!
//! The scheduler owns no timers. Every transition takes the current instant
//! and tells the caller which deadline to wait for, so the sync loop can poll
//! it with `sleep_until` and tests can drive it with paused tokio time.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

/// What the caller must do after a scheduler transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// A cycle has begun; run its body once `at` is reached.
    Start { at: Instant },
    /// The last start was too recent; call [`CoalescingScheduler::cooldown_elapsed`] at `until`.
    Wait { until: Instant },
    /// A cycle is in flight; one follow-up is now owed.
    Coalesced,
    /// A cooldown is already pending and will pick this trigger up.
    Pending,
    /// Nothing left to run.
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SchedulerSnapshot {
    pub cooldown_pending: bool,
    pub fire_requested: bool,
    pub in_flight: bool,
}

#[derive(Debug, Clone)]
pub struct CoalescingScheduler {
    min_spacing: Duration,
    start_delay: Duration,
    cooldown: Option<Instant>,
    fire_requested: bool,
    in_flight: bool,
    last_fire: Option<Instant>,
}

impl CoalescingScheduler {
    pub fn new(min_spacing: Duration, start_delay: Duration) -> Self {
        Self {
            min_spacing,
            start_delay,
            cooldown: None,
            fire_requested: false,
            in_flight: false,
            last_fire: None,
        }
    }

    pub fn trigger(&mut self, now: Instant) -> Decision {
        if self.cooldown.is_some() {
            return Decision::Pending;
        }
        if self.in_flight {
            self.fire_requested = true;
            return Decision::Coalesced;
        }
        self.begin_or_wait(now)
    }

    /// The deadline returned in [`Decision::Wait`] has passed.
    pub fn cooldown_elapsed(&mut self, now: Instant) -> Decision {
        self.cooldown = None;
        if self.in_flight {
            self.fire_requested = true;
            return Decision::Coalesced;
        }
        self.begin(now)
    }

    /// The running cycle finished. Starts the owed follow-up, if any.
    pub fn complete(&mut self, now: Instant) -> Decision {
        self.in_flight = false;
        if !self.fire_requested {
            return Decision::Idle;
        }
        self.fire_requested = false;
        self.begin_or_wait(now)
    }

    pub fn cooldown(&self) -> Option<Instant> {
        self.cooldown
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn fire_requested(&self) -> bool {
        self.fire_requested
    }

    pub fn last_fire(&self) -> Option<Instant> {
        self.last_fire
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        SchedulerSnapshot {
            cooldown_pending: self.cooldown.is_some(),
            fire_requested: self.fire_requested,
            in_flight: self.in_flight,
        }
    }

    fn begin_or_wait(&mut self, now: Instant) -> Decision {
        match self.last_fire {
            Some(last) if now.duration_since(last) < self.min_spacing => {
                let until = last + self.min_spacing;
                self.cooldown = Some(until);
                Decision::Wait { until }
            }
            _ => self.begin(now),
        }
    }

    fn begin(&mut self, now: Instant) -> Decision {
        self.last_fire = Some(now);
        self.in_flight = true;
        Decision::Start {
            at: now + self.start_delay,
        }
    }
}
