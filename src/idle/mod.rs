//! Idle detection module with platform-specific probes.
//!
//! A probe only answers "how long since the last user input". The
//! [`IdleMonitor`] polls it on a dedicated thread and turns threshold
//! crossings into [`IdleEvent`]s for the daemon loop.

#[cfg(target_os = "macos")]
mod macos;
#[cfg(target_os = "linux")]
mod linux;

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Idle source notification, stamped with a monotonic timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleEvent {
    /// The user has been idle for at least the configured threshold.
    Idle { at: Instant },
    /// The user has resumed activity.
    Resumed { at: Instant },
}

/// Platform query for time since the last user input.
pub trait IdleProbe: Send + 'static {
    /// Returns `None` when the platform could not be queried this time.
    fn idle_time(&mut self) -> Option<Duration>;
}

/// Open the idle probe for the current platform.
#[cfg(target_os = "linux")]
pub fn platform_probe() -> Result<Box<dyn IdleProbe>> {
    Ok(Box::new(linux::X11Probe::connect()?))
}

/// Open the idle probe for the current platform.
#[cfg(target_os = "macos")]
pub fn platform_probe() -> Result<Box<dyn IdleProbe>> {
    Ok(Box::new(macos::IoKitProbe))
}

/// Open the idle probe for the current platform.
#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub fn platform_probe() -> Result<Box<dyn IdleProbe>> {
    anyhow::bail!("Idle detection is not supported on this platform")
}

/// Polls an [`IdleProbe`] and reports idle/resume transitions.
pub struct IdleMonitor {
    /// Idle threshold duration.
    threshold: Duration,
    /// Probe interval.
    check_interval: Duration,
    /// Whether the monitor thread should keep running.
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl IdleMonitor {
    pub fn new(threshold: Duration, check_interval: Duration) -> Self {
        Self {
            threshold,
            check_interval,
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    /// Start polling `probe`, sending transitions to `events`.
    pub fn start(
        &mut self,
        probe: Box<dyn IdleProbe>,
        events: mpsc::UnboundedSender<IdleEvent>,
    ) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!(
            "Starting idle monitor with threshold {:?}, interval {:?}",
            self.threshold, self.check_interval
        );

        let running = self.running.clone();
        let threshold = self.threshold;
        let check_interval = self.check_interval;
        let handle = thread::Builder::new()
            .name("idle-monitor".to_string())
            .spawn(move || {
                run_idle_monitor(probe, threshold, check_interval, running, events);
            })?;

        self.handle = Some(handle);
        Ok(())
    }

    /// Stop the monitor and wait for its thread to exit.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
            info!("Idle monitor stopped");
        }
    }
}

impl Drop for IdleMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_idle_monitor(
    mut probe: Box<dyn IdleProbe>,
    threshold: Duration,
    check_interval: Duration,
    running: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<IdleEvent>,
) {
    let mut was_idle = false;
    let mut failures: u32 = 0;

    while running.load(Ordering::SeqCst) {
        thread::sleep(check_interval);

        let Some(idle_time) = probe.idle_time() else {
            failures += 1;
            if failures == 1 || failures % 100 == 0 {
                warn!("Failed to query idle time ({} consecutive failures)", failures);
            }
            continue;
        };
        failures = 0;

        let is_now_idle = idle_time >= threshold;
        if is_now_idle == was_idle {
            continue;
        }

        let at = Instant::now();
        let event = if is_now_idle {
            debug!("User became idle (idle for {:?})", idle_time);
            IdleEvent::Idle { at }
        } else {
            debug!("User became active");
            IdleEvent::Resumed { at }
        };

        if events.send(event).is_err() {
            debug!("Idle event receiver dropped");
            break;
        }
        was_idle = is_now_idle;
    }

    debug!("Idle monitor thread exiting");
}
