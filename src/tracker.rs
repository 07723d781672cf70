//! Safe working time accumulation across independently configured windows.

use serde::Serialize;
use std::collections::HashSet;
use thiserror::Error;
use tracing::{debug, info};

/// Reasons a set of tracking windows is rejected at startup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrackerError {
    #[error("at least one tracking window is required")]
    NoWindows,
    #[error("tracking window name cannot be empty")]
    EmptyName,
    #[error("duplicate tracking window name '{0}'")]
    DuplicateName(String),
    #[error("window '{0}': limit_seconds must be greater than 0")]
    ZeroLimit(String),
    #[error("window '{0}': break_seconds must be greater than 0")]
    ZeroBreak(String),
    #[error("window '{name}': reset_seconds ({reset}) must be less than break_seconds ({brk})")]
    ResetNotBelowBreak { name: String, reset: u64, brk: u64 },
}

/// One named activity budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackingWindow {
    name: String,
    /// Active time beyond which a break is required.
    limit_seconds: u64,
    /// Idle time that clears a below-limit accumulator (0 disables).
    reset_seconds: u64,
    /// Idle time that clears the accumulator unconditionally.
    break_seconds: u64,
    active_seconds: u64,
}

impl TrackingWindow {
    /// Create a window with an empty accumulator.
    pub fn new(
        name: impl Into<String>,
        limit_seconds: u64,
        reset_seconds: u64,
        break_seconds: u64,
    ) -> Result<Self, TrackerError> {
        let name = name.into();
        if name.is_empty() {
            return Err(TrackerError::EmptyName);
        }
        if limit_seconds == 0 {
            return Err(TrackerError::ZeroLimit(name));
        }
        if break_seconds == 0 {
            return Err(TrackerError::ZeroBreak(name));
        }
        if reset_seconds > 0 && reset_seconds >= break_seconds {
            return Err(TrackerError::ResetNotBelowBreak {
                name,
                reset: reset_seconds,
                brk: break_seconds,
            });
        }

        Ok(Self {
            name,
            limit_seconds,
            reset_seconds,
            break_seconds,
            active_seconds: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn active_seconds(&self) -> u64 {
        self.active_seconds
    }

    pub fn is_safe(&self) -> bool {
        self.active_seconds <= self.limit_seconds
    }

    fn apply_idle(&mut self, idle_seconds: u64) {
        if self.active_seconds == 0 {
            return;
        }

        if self.active_seconds < self.limit_seconds
            && self.reset_seconds > 0
            && idle_seconds > self.reset_seconds
        {
            self.active_seconds = 0;
        } else if idle_seconds > self.break_seconds {
            debug!(
                "Break reset for '{}' window after {}s idle",
                self.name, idle_seconds
            );
            self.active_seconds = 0;
        }
    }

    fn apply_active(&mut self, active_seconds: u64) {
        let was_safe = self.is_safe();
        self.active_seconds = self.active_seconds.saturating_add(active_seconds);

        if was_safe && !self.is_safe() {
            info!(
                "'{}' window passed its {}s limit, break required",
                self.name, self.limit_seconds
            );
        }
    }
}

/// Point-in-time view of one window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowStatus {
    pub name: String,
    pub safe: bool,
    #[serde(rename = "accumulated_seconds")]
    pub active_seconds: u64,
    #[serde(rename = "break_at")]
    pub limit_seconds: u64,
}

/// Status of every window, in configuration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub periods: Vec<WindowStatus>,
}

impl StatusSnapshot {
    /// Serialize as a single newline-terminated JSON line.
    pub fn to_json_line(&self) -> serde_json::Result<Vec<u8>> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }
}

/// Accumulates idle and active deltas against all configured windows.
///
/// The tracker is a pure accumulator: it has no notion of time, so callers
/// must pass only the new active seconds since their previous report.
#[derive(Debug, Clone)]
pub struct SafetyTracker {
    windows: Vec<TrackingWindow>,
}

impl SafetyTracker {
    pub fn new(windows: Vec<TrackingWindow>) -> Result<Self, TrackerError> {
        if windows.is_empty() {
            return Err(TrackerError::NoWindows);
        }

        let mut seen = HashSet::new();
        for window in &windows {
            if !seen.insert(window.name.as_str()) {
                return Err(TrackerError::DuplicateName(window.name.clone()));
            }
        }

        Ok(Self { windows })
    }

    #[cfg(test)]
    pub fn windows(&self) -> &[TrackingWindow] {
        &self.windows
    }

    /// Report the total length of the current idle period.
    ///
    /// Safe to call repeatedly with a growing value: resets only ever move
    /// an accumulator to zero.
    pub fn provide_idle_seconds(&mut self, idle_seconds: u64) {
        for window in &mut self.windows {
            window.apply_idle(idle_seconds);
        }
    }

    /// Add newly elapsed active seconds to every window.
    pub fn provide_active_seconds(&mut self, active_seconds: u64) {
        debug_assert!(active_seconds > 0, "active delta must be positive");
        if active_seconds == 0 {
            return;
        }

        for window in &mut self.windows {
            window.apply_active(active_seconds);
        }
    }

    pub fn status_snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            periods: self
                .windows
                .iter()
                .map(|w| WindowStatus {
                    name: w.name().to_string(),
                    safe: w.is_safe(),
                    active_seconds: w.active_seconds(),
                    limit_seconds: w.limit_seconds,
                })
                .collect(),
        }
    }

    /// Dump every window's standing at debug level.
    pub fn log_nag_status(&self) {
        for window in &self.windows {
            debug!(
                "{:>5}/{:>5} ('{}' window) [{}]",
                window.active_seconds,
                window.limit_seconds,
                window.name,
                if window.is_safe() { "SAFE" } else { "BREAK REQUIRED" }
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single(limit: u64, reset: u64, brk: u64) -> SafetyTracker {
        SafetyTracker::new(vec![TrackingWindow::new("w", limit, reset, brk).unwrap()]).unwrap()
    }

    fn default_three() -> SafetyTracker {
        SafetyTracker::new(vec![
            TrackingWindow::new("micro", 180, 15, 30).unwrap(),
            TrackingWindow::new("normal", 2700, 0, 600).unwrap(),
            TrackingWindow::new("workday", 14400, 0, 28800).unwrap(),
        ])
        .unwrap()
    }

    #[test]
    fn test_early_reset_below_limit() {
        let mut tracker = single(180, 15, 30);
        tracker.provide_active_seconds(50);

        tracker.provide_idle_seconds(16);
        assert_eq!(tracker.windows()[0].active_seconds(), 0);
    }

    #[test]
    fn test_over_limit_needs_full_break() {
        let mut tracker = single(180, 15, 30);
        tracker.provide_active_seconds(200);

        tracker.provide_idle_seconds(16);
        assert_eq!(tracker.windows()[0].active_seconds(), 200);

        tracker.provide_idle_seconds(31);
        assert_eq!(tracker.windows()[0].active_seconds(), 0);
    }

    #[test]
    fn test_thresholds_are_exclusive() {
        let mut tracker = single(180, 15, 30);
        tracker.provide_active_seconds(50);
        tracker.provide_idle_seconds(15);
        assert_eq!(tracker.windows()[0].active_seconds(), 50);

        let mut tracker = single(180, 0, 30);
        tracker.provide_active_seconds(200);
        tracker.provide_idle_seconds(30);
        assert_eq!(tracker.windows()[0].active_seconds(), 200);
    }

    #[test]
    fn test_disabled_reset_waits_for_break() {
        let mut tracker = single(2700, 0, 600);
        tracker.provide_active_seconds(100);

        tracker.provide_idle_seconds(599);
        assert_eq!(tracker.windows()[0].active_seconds(), 100);

        tracker.provide_idle_seconds(601);
        assert_eq!(tracker.windows()[0].active_seconds(), 0);
    }

    #[test]
    fn test_repeated_idle_never_increases() {
        let mut tracker = default_three();
        tracker.provide_active_seconds(1000);

        let mut previous: Vec<u64> = tracker.windows().iter().map(|w| w.active_seconds()).collect();
        for idle in [1, 5, 16, 16, 31, 200, 601, 601] {
            tracker.provide_idle_seconds(idle);
            for (window, before) in tracker.windows().iter().zip(&previous) {
                let now = window.active_seconds();
                assert!(now == *before || now == 0, "{} grew or shrank partially", window.name());
            }
            previous = tracker.windows().iter().map(|w| w.active_seconds()).collect();
        }

        assert_eq!(previous, vec![0, 0, 1000]);
    }

    #[test]
    fn test_active_accumulates_monotonically() {
        let mut tracker = default_three();
        let mut last = 0;
        for delta in [1, 1, 3, 7, 1] {
            tracker.provide_active_seconds(delta);
            let now = tracker.windows()[1].active_seconds();
            assert!(now > last);
            last = now;
        }
        assert_eq!(last, 13);
    }

    #[test]
    fn test_snapshot_after_200_seconds() {
        let mut tracker = default_three();
        tracker.provide_active_seconds(200);

        let snapshot = tracker.status_snapshot();
        let names: Vec<&str> = snapshot.periods.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["micro", "normal", "workday"]);

        let safe: Vec<bool> = snapshot.periods.iter().map(|p| p.safe).collect();
        assert_eq!(safe, vec![false, true, true]);
        assert!(snapshot.periods.iter().all(|p| p.active_seconds == 200));
    }

    #[test]
    fn test_limit_itself_is_safe() {
        let mut tracker = single(180, 15, 30);
        tracker.provide_active_seconds(180);
        assert!(tracker.status_snapshot().periods[0].safe);

        tracker.provide_active_seconds(1);
        assert!(!tracker.status_snapshot().periods[0].safe);
    }

    #[test]
    fn test_snapshot_json_shape() {
        let mut tracker = default_three();
        tracker.provide_active_seconds(200);

        let line = tracker.status_snapshot().to_json_line().unwrap();
        let text = String::from_utf8(line).unwrap();
        assert_eq!(
            text,
            "{\"periods\":[\
             {\"name\":\"micro\",\"safe\":false,\"accumulated_seconds\":200,\"break_at\":180},\
             {\"name\":\"normal\",\"safe\":true,\"accumulated_seconds\":200,\"break_at\":2700},\
             {\"name\":\"workday\",\"safe\":true,\"accumulated_seconds\":200,\"break_at\":14400}\
             ]}\n"
        );
    }

    #[test]
    fn test_window_validation() {
        assert_eq!(TrackingWindow::new("", 1, 0, 1), Err(TrackerError::EmptyName));
        assert_eq!(
            TrackingWindow::new("a", 0, 0, 1),
            Err(TrackerError::ZeroLimit("a".to_string()))
        );
        assert!(matches!(
            TrackingWindow::new("a", 10, 30, 30),
            Err(TrackerError::ResetNotBelowBreak { .. })
        ));
        assert!(TrackingWindow::new("a", 10, 0, 30).is_ok());
    }

    #[test]
    fn test_tracker_rejects_duplicates() {
        let windows = vec![
            TrackingWindow::new("micro", 180, 15, 30).unwrap(),
            TrackingWindow::new("micro", 2700, 0, 600).unwrap(),
        ];
        assert_eq!(
            SafetyTracker::new(windows).unwrap_err(),
            TrackerError::DuplicateName("micro".to_string())
        );
        assert_eq!(SafetyTracker::new(Vec::new()).unwrap_err(), TrackerError::NoWindows);
    }
}
