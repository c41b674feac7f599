//! Periodic pass scheduler
//!
//! [`PassScheduler`] owns at most one recurring [`Trigger`]. Each trigger is
//! a spawned tokio task that ticks on an interval and invokes the
//! [`ScheduledTask`] it was built with.
//!
//! - `configure` replaces the active trigger atomically; there is never more
//!   than one live trigger per scheduler.
//! - `disable` cancels the trigger but keeps the task, so a later `configure`
//!   resumes without re-wiring.
//! - Cancellation is observed between ticks only. A pass that is already
//!   running completes; overlapping passes are the engine's run-lock's
//!   business, not the scheduler's.

use async_trait::async_trait;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::validate_interval_minutes;
use crate::engine::ReconciliationEngine;
use crate::error::{Error, Result};

/// Work invoked on every tick
#[async_trait]
pub trait ScheduledTask: Send + Sync {
    async fn run(&self);

    /// Name used in logs
    fn name(&self) -> &str {
        "scheduled task"
    }
}

/// Adapts a zero-argument async closure into a [`ScheduledTask`]
pub struct FnTask<F> {
    name: String,
    f: F,
}

impl<F> FnTask<F> {
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F, Fut> ScheduledTask for FnTask<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    async fn run(&self) {
        (self.f)().await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Runs a full reconciliation pass per tick
pub struct EnginePassTask {
    engine: Arc<ReconciliationEngine>,
}

impl EnginePassTask {
    pub fn new(engine: Arc<ReconciliationEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl ScheduledTask for EnginePassTask {
    async fn run(&self) {
        match self.engine.run_pass().await {
            Ok(report) => info!("Scheduled pass: {}", report.summary()),
            Err(Error::PassInProgress) => {
                warn!("Scheduled pass skipped: previous pass still running")
            }
            Err(e) => error!("Scheduled pass failed: {}", e),
        }
    }

    fn name(&self) -> &str {
        "reconciliation pass"
    }
}

/// A live recurring trigger
struct Trigger {
    period: Duration,
    cancel: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl Trigger {
    fn spawn(period: Duration, task: Arc<dyn ScheduledTask>) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Other(format!("scheduler needs a tokio runtime: {}", e)))?;
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();

        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await; // first tick completes immediately

            loop {
                tokio::select! {
                    biased;
                    _ = &mut cancel_rx => break,
                    _ = ticker.tick() => {}
                }

                debug!("Trigger fired, running {}", task.name());
                task.run().await;
            }

            debug!("Trigger for {} stopped", task.name());
        });

        Ok(Self {
            period,
            cancel: Some(cancel_tx),
            handle,
        })
    }

    fn is_live(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Stop after the current run, if any
    fn cancel(mut self) {
        if let Some(tx) = self.cancel.take() {
            let _ = tx.send(());
        }
    }
}

/// Owns the single recurring trigger for one task
pub struct PassScheduler {
    task: Arc<dyn ScheduledTask>,
    trigger: Mutex<Option<Trigger>>,
}

impl PassScheduler {
    pub fn new(task: Arc<dyn ScheduledTask>) -> Self {
        Self {
            task,
            trigger: Mutex::new(None),
        }
    }

    /// Run the task every `interval_minutes` minutes (1..=1440)
    pub fn configure(&self, interval_minutes: u32) -> Result<()> {
        validate_interval_minutes(interval_minutes)?;
        self.configure_interval(Duration::from_secs(u64::from(interval_minutes) * 60))
    }

    /// Run the task every `period`, replacing any active trigger
    pub fn configure_interval(&self, period: Duration) -> Result<()> {
        if period.is_zero() {
            return Err(Error::invalid_input("schedule interval must be positive"));
        }

        let mut slot = self.slot();
        if let Some(previous) = slot.take() {
            debug!("Replacing trigger (was every {:?})", previous.period);
            previous.cancel();
        }
        *slot = Some(Trigger::spawn(period, Arc::clone(&self.task))?);

        info!("Scheduled {} every {:?}", self.task.name(), period);
        Ok(())
    }

    /// Remove the active trigger; returns whether one was active
    pub fn disable(&self) -> bool {
        match self.slot().take() {
            Some(trigger) => {
                trigger.cancel();
                info!("Schedule for {} disabled", self.task.name());
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.slot().as_ref().is_some_and(Trigger::is_live)
    }

    /// Period of the active trigger
    pub fn interval(&self) -> Option<Duration> {
        self.slot()
            .as_ref()
            .filter(|t| t.is_live())
            .map(|t| t.period)
    }

    fn slot(&self) -> MutexGuard<'_, Option<Trigger>> {
        self.trigger
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for PassScheduler {
    fn drop(&mut self) {
        if let Some(trigger) = self.slot().take() {
            trigger.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_task(counter: Arc<AtomicUsize>) -> Arc<dyn ScheduledTask> {
        Arc::new(FnTask::new("count", move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }))
    }

    #[tokio::test]
    async fn rejects_out_of_range_minutes() {
        let scheduler = PassScheduler::new(counting_task(Arc::new(AtomicUsize::new(0))));
        assert!(scheduler.configure(0).is_err());
        assert!(scheduler.configure(1441).is_err());
        assert!(!scheduler.is_active());
    }

    #[tokio::test]
    async fn configure_and_disable() {
        let scheduler = PassScheduler::new(counting_task(Arc::new(AtomicUsize::new(0))));
        scheduler.configure(30).unwrap();
        assert!(scheduler.is_active());
        assert_eq!(scheduler.interval(), Some(Duration::from_secs(1800)));

        assert!(scheduler.disable());
        assert!(!scheduler.is_active());
        assert!(!scheduler.disable());
    }

    #[test]
    fn configure_outside_runtime_is_an_error() {
        let scheduler = PassScheduler::new(counting_task(Arc::new(AtomicUsize::new(0))));
        assert!(scheduler.configure(5).is_err());
        assert!(!scheduler.is_active());
    }
}
