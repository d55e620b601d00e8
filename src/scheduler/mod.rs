pub mod types;

use crate::answer_log::AnswerLog;
use crate::bus::{MessageBus, SchedulerEvent};
use crate::config::AppConfig;
use crate::invoker::{Invoke, Invoker};
use crate::ping::{Model, PingRequest};
use crate::prompts::PromptBook;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{self, Instant};
use tracing::{debug, error, info};
use types::{Phase, ScheduleConfig, ScheduleSnapshot, ScheduleState, SchedulerError, TriggerError};

/// Construction-time settings for a [`Scheduler`].
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub model: Model,
    pub interval: Duration,
    pub timeout: Duration,
    /// Fire as soon as `start` is called instead of one interval later.
    pub fire_on_start: bool,
    pub prompts: PromptBook,
    pub instruction: Option<String>,
}

impl SchedulerSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            model: cfg.model,
            interval: cfg.interval(),
            timeout: cfg.timeout(),
            fire_on_start: cfg.fire_on_start,
            prompts: PromptBook::new(cfg.prompts.clone()),
            instruction: cfg.instruction.clone(),
        }
    }

    /// A request from these settings alone, for one-off pings.
    pub fn build_request(&self) -> PingRequest {
        PingRequest {
            model: self.model,
            prompt: self.prompts.pick().to_string(),
            instruction: self.instruction.clone(),
            timeout: self.timeout,
        }
    }
}

struct SchedulerInner<I> {
    state: Mutex<ScheduleState>,
    invoker: I,
    log: AnswerLog,
    bus: MessageBus,
    prompts: PromptBook,
    instruction: Option<String>,
    fire_on_start: bool,
    cycle_done: Notify,
}

/// Fires one ping per interval, never more than one at a time.
///
/// Each cycle runs on its own task: the invocation is the only thing that
/// blocks, so every control method here returns immediately.
pub struct Scheduler<I: Invoke = Invoker> {
    inner: Arc<SchedulerInner<I>>,
}

impl<I: Invoke> Clone for Scheduler<I> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

enum Rejected {
    Busy,
    /// The timer that asked belongs to a run that has since been stopped.
    Stale,
}

impl<I: Invoke> Scheduler<I> {
    pub fn new(invoker: I, log: AnswerLog, bus: MessageBus, settings: SchedulerSettings) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                state: Mutex::new(ScheduleState::new(
                    settings.model,
                    settings.interval,
                    settings.timeout,
                )),
                invoker,
                log,
                bus,
                prompts: settings.prompts,
                instruction: settings.instruction,
                fire_on_start: settings.fire_on_start,
                cycle_done: Notify::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ScheduleState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn log(&self) -> &AnswerLog {
        &self.inner.log
    }

    /// `Idle` (or `Stopping`) to `Running`. Must be called inside a tokio
    /// runtime.
    pub fn start(&self, config: ScheduleConfig) -> Result<(), SchedulerError> {
        if config.interval.is_zero() {
            return Err(SchedulerError::InvalidInterval);
        }
        let (generation, stop) = {
            let mut state = self.state();
            if state.phase == Phase::Running {
                return Err(SchedulerError::AlreadyRunning);
            }
            state.phase = Phase::Running;
            state.interval = config.interval;
            state.model = config.model;
            state.generation += 1;
            let stop = Arc::new(Notify::new());
            state.stop_signal = Some(stop.clone());
            (state.generation, stop)
        };

        let first_delay = if self.inner.fire_on_start {
            Duration::ZERO
        } else {
            config.interval
        };
        info!(
            model = %config.model,
            interval_secs = config.interval.as_secs(),
            "scheduler started"
        );

        let timer = self.clone();
        tokio::spawn(async move {
            timer.run_timer(generation, stop, first_delay).await;
        });
        Ok(())
    }

    /// Cancels future fires. A cycle already in flight is left to finish and
    /// its outcome is still delivered. Returns whether it was running.
    pub fn stop(&self) -> bool {
        let mut state = self.state();
        if state.phase != Phase::Running {
            return false;
        }
        state.generation += 1;
        state.next_fire = None;
        state.phase = if state.in_flight {
            Phase::Stopping
        } else {
            Phase::Idle
        };
        if let Some(stop) = state.stop_signal.take() {
            stop.notify_one();
        }
        info!(phase = %state.phase, "scheduler stopped");
        true
    }

    /// Starts a cycle right away, in any phase. Rejected while one is in
    /// flight; nothing is queued.
    pub fn trigger_now(&self) -> Result<(), TriggerError> {
        match self.dispatch(None) {
            Ok(()) => Ok(()),
            Err(Rejected::Busy) | Err(Rejected::Stale) => {
                debug!("manual trigger rejected, ping in flight");
                Err(TriggerError::Busy)
            }
        }
    }

    /// Takes effect when the timer next re-arms; the armed timer keeps its
    /// deadline.
    pub fn set_interval(&self, interval: Duration) -> Result<(), SchedulerError> {
        if interval.is_zero() {
            return Err(SchedulerError::InvalidInterval);
        }
        self.state().interval = interval;
        info!(interval_secs = interval.as_secs(), "interval changed");
        Ok(())
    }

    pub fn set_model(&self, model: Model) {
        self.state().model = model;
        info!(model = %model, "model changed");
    }

    pub fn set_timeout(&self, timeout: Duration) -> Result<(), SchedulerError> {
        if timeout.is_zero() {
            return Err(SchedulerError::InvalidTimeout);
        }
        self.state().timeout = timeout;
        Ok(())
    }

    pub fn snapshot(&self) -> ScheduleSnapshot {
        self.state().snapshot()
    }

    /// Resolves once no cycle is in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.cycle_done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let in_flight = self.state().in_flight;
            if !in_flight {
                return;
            }
            notified.await;
        }
    }

    async fn run_timer(self, generation: u64, stop: Arc<Notify>, first_delay: Duration) {
        let mut deadline = Instant::now() + first_delay;
        loop {
            if !self.arm(generation, deadline) {
                break;
            }
            tokio::select! {
                _ = stop.notified() => break,
                _ = time::sleep_until(deadline) => {}
            }
            match self.dispatch(Some(generation)) {
                Ok(()) => {}
                Err(Rejected::Busy) => debug!("previous ping still in flight, skipping this fire"),
                Err(Rejected::Stale) => break,
            }
            let interval = self.state().interval;
            deadline = (deadline + interval).max(Instant::now());
        }
        debug!(generation, "timer exited");
    }

    fn arm(&self, generation: u64, deadline: Instant) -> bool {
        let mut state = self.state();
        if state.phase != Phase::Running || state.generation != generation {
            return false;
        }
        state.next_fire = Some(deadline);
        true
    }

    /// Claims the in-flight slot and spawns the cycle. The request is built
    /// from the state as of this call.
    fn dispatch(&self, generation: Option<u64>) -> Result<(), Rejected> {
        let request = {
            let mut state = self.state();
            if let Some(generation) = generation {
                if state.phase != Phase::Running || state.generation != generation {
                    return Err(Rejected::Stale);
                }
            }
            if state.in_flight {
                return Err(Rejected::Busy);
            }
            state.in_flight = true;
            PingRequest {
                model: state.model,
                prompt: self.inner.prompts.pick().to_string(),
                instruction: self.inner.instruction.clone(),
                timeout: state.timeout,
            }
        };

        let this = self.clone();
        tokio::spawn(async move {
            this.run_cycle(request).await;
        });
        Ok(())
    }

    async fn run_cycle(&self, request: PingRequest) {
        let _slot = InFlightSlot { scheduler: self };

        let outcome = self.inner.invoker.invoke(request).await;
        let (logged, log_error) = match self.inner.log.append(&outcome) {
            Ok(line) => (Some(line), None),
            Err(err) => {
                error!("failed to record answer: {}", err);
                (None, Some(err.to_string()))
            }
        };

        self.inner
            .bus
            .publish(SchedulerEvent::Outcome { outcome, logged })
            .await;
        if let Some(error) = log_error {
            self.inner
                .bus
                .publish(SchedulerEvent::LogWriteFailed { error })
                .await;
        }
    }
}

/// Releases the in-flight slot when a cycle ends, including by panic.
struct InFlightSlot<'a, I: Invoke> {
    scheduler: &'a Scheduler<I>,
}

impl<I: Invoke> Drop for InFlightSlot<'_, I> {
    fn drop(&mut self) {
        {
            let mut state = self.scheduler.state();
            state.in_flight = false;
            state.pings += 1;
            if state.phase == Phase::Stopping {
                state.phase = Phase::Idle;
            }
        }
        self.scheduler.inner.cycle_done.notify_waiters();
    }
}
