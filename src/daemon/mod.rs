//! Main loop: feeds idle/active time to the tracker and drives the query
//! service, one tick at a time on a single task.

mod activity;

pub use activity::{Delta, UserActivity};

use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::idle::IdleEvent;
use crate::query::{QueryServer, Readiness};
use crate::tracker::SafetyTracker;

/// What ended a loop iteration's wait.
enum Wake {
    Idle(Option<IdleEvent>),
    Io(Readiness),
}

/// Owns all mutable state of the running monitor.
pub struct Daemon {
    tracker: SafetyTracker,
    activity: UserActivity,
    /// `None` when the query service could not be started.
    server: Option<QueryServer>,
    tick: Duration,
}

impl Daemon {
    pub fn new(
        tracker: SafetyTracker,
        activity: UserActivity,
        server: Option<QueryServer>,
        tick: Duration,
    ) -> Self {
        Self {
            tracker,
            activity,
            server,
            tick,
        }
    }

    #[cfg(test)]
    pub fn tracker(&self) -> &SafetyTracker {
        &self.tracker
    }

    #[cfg(test)]
    pub fn activity(&self) -> &UserActivity {
        &self.activity
    }

    /// Run until `shutdown` completes.
    pub async fn run<S>(&mut self, events: &mut mpsc::UnboundedReceiver<IdleEvent>, shutdown: S)
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut source_open = true;

        info!("Entering main loop");

        loop {
            let wake = tokio::select! {
                biased;
                _ = &mut shutdown => break,
                event = events.recv(), if source_open => Wake::Idle(event),
                ready = wait_ready(self.server.as_mut(), self.tick) => Wake::Io(ready),
            };

            let readiness = match wake {
                Wake::Idle(Some(event)) => {
                    self.activity.apply(event);
                    Readiness::default()
                }
                Wake::Idle(None) => {
                    warn!("Idle source disconnected, activity state will no longer change");
                    source_open = false;
                    Readiness::default()
                }
                Wake::Io(ready) => ready,
            };

            self.tick(events, Instant::now(), &readiness);
        }

        info!("Main loop stopped");
    }

    /// One iteration: idle events first, then tracking, then socket I/O.
    pub fn tick(
        &mut self,
        events: &mut mpsc::UnboundedReceiver<IdleEvent>,
        now: Instant,
        readiness: &Readiness,
    ) {
        while let Ok(event) = events.try_recv() {
            self.activity.apply(event);
        }

        self.track(now);

        if let Some(server) = self.server.as_mut() {
            server.service(readiness, &self.tracker);
        }
    }

    fn track(&mut self, now: Instant) {
        if let Some(state) = self.activity.take_transition() {
            info!("user is {}", state);
            self.tracker.log_nag_status();
        }

        match self.activity.delta(now) {
            Some(Delta::Idle(seconds)) => self.tracker.provide_idle_seconds(seconds),
            Some(Delta::Active(seconds)) => self.tracker.provide_active_seconds(seconds),
            None => {}
        }
    }

    /// Close clients and remove the socket.
    pub fn shutdown(&mut self) {
        if let Some(server) = self.server.as_mut() {
            server.shutdown();
        }
    }
}

async fn wait_ready(server: Option<&mut QueryServer>, tick: Duration) -> Readiness {
    match server {
        Some(server) => server.wait_ready(tick).await,
        None => {
            tokio::time::sleep(tick).await;
            Readiness::default()
        }
    }
}
