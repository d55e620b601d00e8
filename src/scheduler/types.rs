use crate::ping::Model;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Running,
    /// Stop was requested while a cycle was in flight; becomes `Idle` once
    /// that cycle's outcome has been delivered.
    Stopping,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Idle => "idle",
            Phase::Running => "running",
            Phase::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Values applied by `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleConfig {
    pub interval: Duration,
    pub model: Model,
}

/// Read-only view of the scheduler for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleSnapshot {
    pub phase: Phase,
    pub model: Model,
    pub interval: Duration,
    pub timeout: Duration,
    pub in_flight: bool,
    /// Cycles completed since the scheduler was created.
    pub pings: u64,
    /// Time left until the armed timer fires, when running.
    pub next_fire_in: Option<Duration>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("scheduler is already running")]
    AlreadyRunning,
    #[error("interval must be positive")]
    InvalidInterval,
    #[error("timeout must be positive")]
    InvalidTimeout,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TriggerError {
    #[error("a ping is already in flight")]
    Busy,
}

/// Mutable state owned by one scheduler. Only reachable through its lock.
pub(super) struct ScheduleState {
    pub phase: Phase,
    pub interval: Duration,
    pub timeout: Duration,
    pub model: Model,
    pub in_flight: bool,
    pub pings: u64,
    /// Bumped by every start and stop; a timer task only fires while the
    /// generation it was spawned with is current.
    pub generation: u64,
    pub stop_signal: Option<Arc<Notify>>,
    pub next_fire: Option<Instant>,
}

impl ScheduleState {
    pub fn new(model: Model, interval: Duration, timeout: Duration) -> Self {
        Self {
            phase: Phase::Idle,
            interval,
            timeout,
            model,
            in_flight: false,
            pings: 0,
            generation: 0,
            stop_signal: None,
            next_fire: None,
        }
    }

    pub fn snapshot(&self) -> ScheduleSnapshot {
        ScheduleSnapshot {
            phase: self.phase,
            model: self.model,
            interval: self.interval,
            timeout: self.timeout,
            in_flight: self.in_flight,
            pings: self.pings,
            next_fire_in: self
                .next_fire
                .map(|at| at.saturating_duration_since(Instant::now())),
        }
    }
}
