use crate::interpreter::TimeDelta;
use crate::types::TimerSnapshot;

/// Outcome of [`TimerAccumulator::add_time`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedDelta {
    pub requested: TimeDelta,
    pub applied: TimeDelta,
    pub remaining_seconds: u64,
    pub total_awarded: u64,
}

impl AppliedDelta {
    pub fn clamped(&self) -> bool {
        self.applied < self.requested
    }

    pub fn is_noop(&self) -> bool {
        self.applied == 0
    }
}

/// Outcome of one countdown tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Not running or already at zero.
    Idle,
    Decremented { remaining_seconds: u64 },
    /// The tick reached zero and stopped the timer.
    Expired,
}

/// Authoritative countdown state.
///
/// `total_awarded` starts at the configured starting seconds so the cap bounds
/// the whole lifetime of the timer, and only ever grows.
#[derive(Debug, Clone)]
pub struct TimerAccumulator {
    remaining_seconds: u64,
    total_awarded: u64,
    running: bool,
    max_cap: u64,
    starting_seconds: u64,
}

impl TimerAccumulator {
    pub fn new(starting_seconds: u64, max_cap: u64) -> Self {
        let starting_seconds = starting_seconds.min(max_cap);
        Self {
            remaining_seconds: starting_seconds,
            total_awarded: starting_seconds,
            running: false,
            max_cap,
            starting_seconds,
        }
    }

    /// Adds `delta` seconds, clamped so `total_awarded` never passes the cap.
    pub fn add_time(&mut self, delta: TimeDelta) -> AppliedDelta {
        let room = self.max_cap.saturating_sub(self.total_awarded);
        let applied = delta.min(room);
        self.total_awarded += applied;
        self.remaining_seconds = self.remaining_seconds.saturating_add(applied);

        AppliedDelta {
            requested: delta,
            applied,
            remaining_seconds: self.remaining_seconds,
            total_awarded: self.total_awarded,
        }
    }

    /// Stops scheduling ticks. Returns `true` when the flag changed.
    pub fn pause(&mut self) -> bool {
        std::mem::replace(&mut self.running, false)
    }

    /// Allows ticks again. Returns `true` when the flag changed.
    pub fn resume(&mut self) -> bool {
        !std::mem::replace(&mut self.running, true)
    }

    /// Applies one elapsed second.
    pub fn tick(&mut self) -> TickOutcome {
        if !self.running || self.remaining_seconds == 0 {
            return TickOutcome::Idle;
        }
        self.remaining_seconds -= 1;
        if self.remaining_seconds == 0 {
            self.running = false;
            TickOutcome::Expired
        } else {
            TickOutcome::Decremented {
                remaining_seconds: self.remaining_seconds,
            }
        }
    }

    /// Whether the countdown driver should be scheduling ticks.
    ///
    /// Resuming at zero sets `running` without ticking; the expired state holds
    /// until time is added.
    pub fn should_tick(&self) -> bool {
        self.running && self.remaining_seconds > 0
    }

    pub fn is_capped(&self) -> bool {
        self.total_awarded >= self.max_cap
    }

    pub fn snapshot(&self) -> TimerSnapshot {
        TimerSnapshot {
            remaining_seconds: self.remaining_seconds,
            total_awarded: self.total_awarded,
            running: self.running,
            max_cap: self.max_cap,
            starting_seconds: self.starting_seconds,
        }
    }
}
