use crate::config::{ConfigError, RunConfig};
use crate::dispatcher::{DispatchPlan, Dispatcher};
use crate::rate_limiter::RateLimiter;
use crate::request::RequestFactory;
use crate::stats::{StatsAggregator, StatsSnapshot};
use crate::transport::{HttpTransport, Transport};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Upper bound on the worker pool of a single run.
pub const MAX_WORKERS: u32 = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    Stopping,
    Completed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Completed | RunState::Cancelled)
    }
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("run controller has already been started")]
    AlreadyStarted,
    #[error("cannot spawn {requested} workers (limit is {limit})")]
    TooManyWorkers { requested: u32, limit: u32 },
    #[error("failed to build HTTP client: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("start must be called from within a tokio runtime")]
    NoRuntime,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("run has not been started")]
    NotStarted,
    #[error("run has not finished yet (state: {0:?})")]
    NotFinished(RunState),
}

/// Owns the lifecycle of exactly one run:
/// `Idle -> Running -> Stopping -> (Completed | Cancelled)`.
///
/// All methods take `&self`, so the controller can be shared (e.g. behind an
/// `Arc`) between the task awaiting completion and whoever cancels the run.
/// Each controller is an independent context; several can run side by side.
pub struct RunController {
    transport: Option<Arc<dyn Transport>>,
    cancel: CancellationToken,
    state: Arc<watch::Sender<RunState>>,
    snapshots: Arc<watch::Sender<StatsSnapshot>>,
    stats: Mutex<Option<Arc<StatsAggregator>>>,
    final_result: Arc<Mutex<Option<StatsSnapshot>>>,
    seed: Mutex<Option<u64>>,
}

impl RunController {
    /// Controller that talks HTTP to the configured target.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Controller that uses the given transport instead of building an
    /// HTTP client.
    pub fn with_transport(transport: Arc<dyn Transport>) -> Self {
        Self::build(Some(transport))
    }

    fn build(transport: Option<Arc<dyn Transport>>) -> Self {
        let (state, _) = watch::channel(RunState::Idle);
        let (snapshots, _) = watch::channel(StatsSnapshot::default());
        Self {
            transport,
            cancel: CancellationToken::new(),
            state: Arc::new(state),
            snapshots: Arc::new(snapshots),
            stats: Mutex::new(None),
            final_result: Arc::new(Mutex::new(None)),
            seed: Mutex::new(None),
        }
    }

    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    /// Live snapshots, published every `report_interval_ms` and once more
    /// when the run ends.
    pub fn subscribe(&self) -> watch::Receiver<StatsSnapshot> {
        self.snapshots.subscribe()
    }

    /// Seed actually used for request randomization, once started.
    pub fn seed(&self) -> Option<u64> {
        *lock(&self.seed)
    }

    /// Validate `config`, spawn the worker pool and begin the run.
    ///
    /// Nothing is dispatched unless this returns `Ok`.
    pub fn start(&self, config: RunConfig) -> Result<(), StartError> {
        if self.state() != RunState::Idle {
            return Err(StartError::AlreadyStarted);
        }

        config.validate()?;
        if config.workers > MAX_WORKERS {
            return Err(StartError::TooManyWorkers {
                requested: config.workers,
                limit: MAX_WORKERS,
            });
        }
        tokio::runtime::Handle::try_current().map_err(|_| StartError::NoRuntime)?;

        let seed = config.seed.unwrap_or_else(rand::random);
        let factory = RequestFactory::new(&config, seed)?;
        let transport = match &self.transport {
            Some(transport) => transport.clone(),
            None => Arc::new(HttpTransport::new(&config)?) as Arc<dyn Transport>,
        };
        let limiter = if config.rate > 0.0 {
            RateLimiter::with_burst(config.rate, config.effective_burst())
        } else {
            RateLimiter::unlimited()
        };

        let claimed = self.state.send_if_modified(|state| {
            if *state == RunState::Idle {
                *state = RunState::Running;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(StartError::AlreadyStarted);
        }

        info!(
            "Starting run: {} {} workers={} rate={} duration={:?} max_requests={:?} seed={}",
            config.method.to_ascii_uppercase(),
            config.url,
            config.workers,
            config.rate,
            config.duration(),
            config.max_requests,
            seed
        );

        let stats = Arc::new(StatsAggregator::new());
        *lock(&self.stats) = Some(stats.clone());
        *lock(&self.seed) = Some(seed);

        let dispatcher = Dispatcher::spawn(DispatchPlan {
            workers: config.workers,
            max_attempts: config.max_requests,
            factory,
            limiter,
            transport,
            stats: stats.clone(),
        });

        tokio::spawn(supervise(Supervisor {
            dispatcher,
            stats,
            cancel: self.cancel.clone(),
            // A duration past what the clock can represent never expires.
            deadline: config
                .duration()
                .and_then(|d| Instant::now().checked_add(d)),
            grace: config.grace_period(),
            report_interval: config.report_interval(),
            state: self.state.clone(),
            snapshots: self.snapshots.clone(),
            final_result: self.final_result.clone(),
        }));

        Ok(())
    }

    /// Request cooperative cancellation. Safe to call at any time and more
    /// than once; cancelling an idle controller makes it terminal.
    pub fn cancel(&self) {
        self.cancel.cancel();

        let mut final_result = lock(&self.final_result);
        self.state.send_if_modified(|state| {
            if *state == RunState::Idle {
                *final_result = Some(StatsSnapshot::default());
                *state = RunState::Cancelled;
                true
            } else {
                false
            }
        });
    }

    /// Current statistics: live while running, final once terminal.
    pub fn snapshot(&self) -> StatsSnapshot {
        if let Some(result) = lock(&self.final_result).as_ref() {
            return result.clone();
        }
        match lock(&self.stats).as_ref() {
            Some(stats) => stats.snapshot(),
            None => StatsSnapshot::default(),
        }
    }

    /// Block until the run reaches a terminal state and every worker has
    /// been joined, then return the final statistics.
    pub async fn wait(&self) -> Result<StatsSnapshot, StateError> {
        let mut rx = self.state.subscribe();
        if *rx.borrow() == RunState::Idle {
            return Err(StateError::NotStarted);
        }
        rx.wait_for(|state| state.is_terminal())
            .await
            .map_err(|_| StateError::NotFinished(self.state()))?;
        self.final_result()
    }

    /// Final statistics; only available in a terminal state.
    pub fn final_result(&self) -> Result<StatsSnapshot, StateError> {
        match self.state() {
            RunState::Idle => Err(StateError::NotStarted),
            state if !state.is_terminal() => Err(StateError::NotFinished(state)),
            state => lock(&self.final_result)
                .clone()
                .ok_or(StateError::NotFinished(state)),
        }
    }
}

impl Default for RunController {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RunController {
    fn drop(&mut self) {
        // Dropping a running controller stops its workers rather than leaking them.
        self.cancel.cancel();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Supervisor {
    dispatcher: Dispatcher,
    stats: Arc<StatsAggregator>,
    cancel: CancellationToken,
    deadline: Option<Instant>,
    grace: Duration,
    report_interval: Duration,
    state: Arc<watch::Sender<RunState>>,
    snapshots: Arc<watch::Sender<StatsSnapshot>>,
    final_result: Arc<Mutex<Option<StatsSnapshot>>>,
}

async fn supervise(sup: Supervisor) {
    let mut ticker = interval_at(Instant::now() + sup.report_interval, sup.report_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let deadline = sup.deadline;
    let expired = async move {
        match deadline {
            Some(deadline) => sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(expired);

    let cancelled = loop {
        tokio::select! {
            _ = sup.cancel.cancelled() => {
                info!("Run cancelled, stopping workers");
                break true;
            }
            _ = &mut expired => {
                info!("Duration elapsed, stopping workers");
                break false;
            }
            _ = sup.dispatcher.drained() => {
                info!("Request budget exhausted, all workers finished");
                break false;
            }
            _ = ticker.tick() => {
                sup.snapshots.send_replace(sup.stats.snapshot());
            }
        }
    };

    sup.state.send_replace(RunState::Stopping);
    debug!("Joining {} workers", sup.dispatcher.worker_count());
    let report = sup.dispatcher.shutdown(sup.grace).await;

    let snapshot = sup.stats.snapshot();
    if snapshot.attempts != report.issued || !snapshot.is_consistent() {
        warn!(
            "Statistics diverged from worker accounting: recorded={} issued={} failed_workers={}",
            snapshot.attempts, report.issued, report.failed_workers
        );
    }
    info!(
        "Run finished: attempts={} successes={} failures={} elapsed={}ms",
        snapshot.attempts,
        snapshot.successes,
        snapshot.failed(),
        snapshot.elapsed_ms
    );

    *lock(&sup.final_result) = Some(snapshot.clone());
    sup.state.send_replace(if cancelled {
        RunState::Cancelled
    } else {
        RunState::Completed
    });
    sup.snapshots.send_replace(snapshot);
}
