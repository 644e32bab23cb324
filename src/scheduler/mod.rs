//! Start-time gate.
//!
//! A scheduled campaign holds dispatch until a local time of day on the
//! current date. The gate polls the wall clock and opens once; a time that
//! has already passed opens it immediately.

use chrono::{Local, NaiveDateTime, NaiveTime};
use std::time::Duration;
use tokio::time::sleep;

use crate::campaign::StopHandle;
use crate::config::DispatchMode;

/// Interval between wall-clock checks.
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Source of local wall-clock time.
pub trait WallClock: Send + Sync {
    /// Current local date and time.
    fn now(&self) -> NaiveDateTime;
}

/// The system clock in the local time zone.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl WallClock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// How the gate opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateRelease {
    /// No schedule configured.
    Immediate,
    /// The scheduled time had already passed.
    AlreadyDue,
    /// The gate waited for the scheduled time.
    Reached {
        /// Number of polls spent waiting.
        polls: u32,
    },
    /// A stop was requested while waiting.
    Stopped,
}

/// One-shot wait-until-time gate.
#[derive(Debug)]
pub struct CampaignScheduler {
    mode: DispatchMode,
    poll_interval: Duration,
}

impl CampaignScheduler {
    /// Creates a gate for the dispatch mode.
    pub fn new(mode: DispatchMode) -> Self {
        Self {
            mode,
            poll_interval: POLL_INTERVAL,
        }
    }

    /// Overrides the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Returns the time the gate waits for, on the clock's current date.
    pub fn release_time(&self, clock: &dyn WallClock) -> Option<NaiveDateTime> {
        match self.mode {
            DispatchMode::Immediately => None,
            DispatchMode::Scheduled { at } => Some(release_on(clock.now(), at)),
        }
    }

    /// Blocks until the gate opens. Consumes the gate so it cannot re-arm.
    pub async fn wait(self, clock: &dyn WallClock, stop: &StopHandle) -> GateRelease {
        let target = match self.release_time(clock) {
            Some(target) => target,
            None => return GateRelease::Immediate,
        };

        if clock.now() >= target {
            return GateRelease::AlreadyDue;
        }

        tracing::info!(until = %target, "Waiting for scheduled start");
        let mut polls = 0;
        while clock.now() < target {
            if stop.is_stop_requested() {
                return GateRelease::Stopped;
            }
            sleep(self.poll_interval).await;
            polls += 1;
        }
        GateRelease::Reached { polls }
    }
}

fn release_on(now: NaiveDateTime, at: NaiveTime) -> NaiveDateTime {
    now.date().and_time(at)
}
