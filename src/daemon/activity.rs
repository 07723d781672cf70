//! User activity state and conversion of transitions into second deltas.

use std::fmt;
use std::time::Instant;

use crate::idle::IdleEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityState {
    /// No idle event seen yet.
    Unknown,
    Idle,
    Active,
}

impl fmt::Display for ActivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActivityState::Unknown => write!(f, "unknown"),
            ActivityState::Idle => write!(f, "idle"),
            ActivityState::Active => write!(f, "active"),
        }
    }
}

/// What the tracker should be told on this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delta {
    /// Total length of the current idle period.
    Idle(u64),
    /// Active seconds not yet reported for the current active run.
    Active(u64),
}

#[derive(Debug)]
pub struct UserActivity {
    state: ActivityState,
    since: Option<Instant>,
    /// Seconds of idleness that had already passed when the idle event fired.
    idle_offset: u64,
    /// Whole active seconds already reported since `since`.
    reported_active: u64,
    changed: bool,
}

impl UserActivity {
    /// `idle_offset` is the idle source's threshold in whole seconds.
    pub fn new(idle_offset: u64) -> Self {
        Self {
            state: ActivityState::Unknown,
            since: None,
            idle_offset,
            reported_active: 0,
            changed: true,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> ActivityState {
        self.state
    }

    pub fn on_idle(&mut self, at: Instant) {
        self.state = ActivityState::Idle;
        self.since = Some(at);
        self.changed = true;
    }

    pub fn on_resumed(&mut self, at: Instant) {
        self.state = ActivityState::Active;
        self.since = Some(at);
        self.reported_active = 0;
        self.changed = true;
    }

    pub fn apply(&mut self, event: IdleEvent) {
        match event {
            IdleEvent::Idle { at } => self.on_idle(at),
            IdleEvent::Resumed { at } => self.on_resumed(at),
        }
    }

    /// Returns the current state once after each change.
    pub fn take_transition(&mut self) -> Option<ActivityState> {
        std::mem::take(&mut self.changed).then_some(self.state)
    }

    /// Elapsed time to report at `now`, if any.
    ///
    /// Idle periods are reported in full every call. Active time is reported
    /// only in whole seconds not yet handed out for this active run.
    pub fn delta(&mut self, now: Instant) -> Option<Delta> {
        let since = self.since?;
        let elapsed = now.saturating_duration_since(since).as_secs();

        match self.state {
            ActivityState::Unknown => None,
            ActivityState::Idle => Some(Delta::Idle(self.idle_offset.saturating_add(elapsed))),
            ActivityState::Active => {
                if elapsed <= self.reported_active {
                    return None;
                }
                let delta = elapsed - self.reported_active;
                self.reported_active = elapsed;
                Some(Delta::Active(delta))
            }
        }
    }
}
