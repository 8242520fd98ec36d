//! Alert cycles and their scheduling.
//!
//! A cycle is query → condition → (on a match) dispatch for one alert, bounded
//! by a deadline. The [`Scheduler`] runs one task per alert and never starts a
//! cycle of an alert before its previous cycle has finished.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::action::{ActionDispatcher, DispatchReport};
use crate::alert::AlertDefinition;
use crate::context::{AlertContext, unix_now};
use crate::error::{Result, WatchError};
use crate::evaluator;
use crate::pool::InterpreterPool;
use crate::search::SearchBackend;

/// Default deadline for one cycle.
pub const DEFAULT_CYCLE_TIMEOUT: Duration = Duration::from_secs(30);

/// How a cycle ended.
#[derive(Debug)]
pub enum CycleOutcome {
    /// The condition evaluated to false.
    NoMatch,
    /// The condition matched and the actions were dispatched.
    Matched(DispatchReport),
    /// The query, the condition or the deadline failed. Nothing was
    /// dispatched unless the deadline hit during dispatch.
    Failed(WatchError),
}

impl CycleOutcome {
    /// Returns true if the condition matched.
    #[must_use]
    pub const fn is_match(&self) -> bool {
        matches!(self, Self::Matched(_))
    }

    /// Returns true if the cycle failed.
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    /// Returns the dispatch report of a matched cycle.
    #[must_use]
    pub const fn report(&self) -> Option<&DispatchReport> {
        match self {
            Self::Matched(report) => Some(report),
            _ => None,
        }
    }
}

/// Runs single cycles. Shared by every alert task.
///
/// Contexts are built fresh for every cycle; nothing a script leaves behind
/// reaches the next cycle.
#[derive(Debug)]
pub struct CycleRunner {
    search: Arc<dyn SearchBackend>,
    pool: InterpreterPool,
    dispatcher: ActionDispatcher,
    cycle_timeout: Duration,
}

impl CycleRunner {
    /// Creates a runner with the default cycle deadline.
    #[must_use]
    pub fn new(
        search: Arc<dyn SearchBackend>,
        pool: InterpreterPool,
        dispatcher: ActionDispatcher,
    ) -> Self {
        Self {
            search,
            pool,
            dispatcher,
            cycle_timeout: DEFAULT_CYCLE_TIMEOUT,
        }
    }

    /// Sets the cycle deadline.
    #[must_use]
    pub const fn with_cycle_timeout(mut self, timeout: Duration) -> Self {
        self.cycle_timeout = timeout;
        self
    }

    /// Returns the interpreter pool.
    #[must_use]
    pub const fn pool(&self) -> &InterpreterPool {
        &self.pool
    }

    /// Runs one cycle of `alert`.
    ///
    /// Never fails: errors and timeouts are reported as
    /// [`CycleOutcome::Failed`], which is never a match.
    pub async fn run_cycle(&self, alert: &AlertDefinition) -> CycleOutcome {
        let started = Instant::now();

        let outcome = match tokio::time::timeout(self.cycle_timeout, self.cycle(alert)).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => CycleOutcome::Failed(e),
            Err(_) => CycleOutcome::Failed(WatchError::Timeout {
                after: self.cycle_timeout,
            }),
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &outcome {
            CycleOutcome::NoMatch => {
                debug!(alert = %alert.name, elapsed_ms, "cycle finished without match");
            }
            CycleOutcome::Matched(report) => {
                info!(
                    alert = %alert.name,
                    elapsed_ms,
                    actions = report.outcomes().len(),
                    failed = report.outcomes().len() - report.succeeded(),
                    "cycle matched"
                );
            }
            CycleOutcome::Failed(e) => {
                warn!(alert = %alert.name, elapsed_ms, error = %e, "cycle failed");
            }
        }

        outcome
    }

    async fn cycle(&self, alert: &AlertDefinition) -> Result<CycleOutcome> {
        let started_ts = unix_now();
        let result = self.search.run_query(&alert.search).await?;

        let context = AlertContext::new(&alert.name, started_ts, result);
        let verdict = evaluator::evaluate(&self.pool, alert, context).await?;
        if !verdict.matched {
            return Ok(CycleOutcome::NoMatch);
        }

        let report = self
            .dispatcher
            .dispatch_all(&alert.actions, &verdict.context)
            .await;
        Ok(CycleOutcome::Matched(report))
    }
}

/// Runs every alert on its own interval until shut down.
#[derive(Debug)]
pub struct Scheduler {
    runner: Arc<CycleRunner>,
    shutdown: CancellationToken,
}

impl Scheduler {
    /// Creates a scheduler over `runner`.
    #[must_use]
    pub fn new(runner: Arc<CycleRunner>) -> Self {
        Self {
            runner,
            shutdown: CancellationToken::new(),
        }
    }

    /// Returns a token that stops every alert task when cancelled.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stops every alert task at its next tick. In-flight cycles finish.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Spawns the task for one alert. The task yields the number of cycles
    /// it ran.
    pub fn spawn(&self, alert: AlertDefinition) -> JoinHandle<u64> {
        let period = alert.interval();
        self.spawn_every(alert, period)
    }

    /// Spawns one task per alert.
    pub fn spawn_all(&self, alerts: impl IntoIterator<Item = AlertDefinition>) -> Vec<JoinHandle<u64>> {
        alerts.into_iter().map(|alert| self.spawn(alert)).collect()
    }

    fn spawn_every(&self, alert: AlertDefinition, period: Duration) -> JoinHandle<u64> {
        info!(alert = %alert.name, interval_ms = period.as_millis() as u64, "scheduling alert");
        tokio::spawn(run_alert(
            Arc::clone(&self.runner),
            alert,
            period,
            self.shutdown.clone(),
        ))
    }
}

async fn run_alert(
    runner: Arc<CycleRunner>,
    alert: AlertDefinition,
    period: Duration,
    shutdown: CancellationToken,
) -> u64 {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut cycles = 0;
    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        // The next tick is only awaited once this cycle is done.
        runner.run_cycle(&alert).await;
        cycles += 1;
    }

    debug!(alert = %alert.name, cycles, "alert task stopped");
    cycles
}
