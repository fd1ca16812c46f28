use crate::rate_limiter::RateLimiter;
use crate::request::RequestFactory;
use crate::stats::StatsAggregator;
use crate::transport::{Outcome, Transport};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Everything the worker pool needs for one run.
pub struct DispatchPlan {
    pub workers: u32,
    /// Stop issuing once this many attempts have been claimed
    pub max_attempts: Option<u64>,
    pub factory: RequestFactory,
    pub limiter: RateLimiter,
    pub transport: Arc<dyn Transport>,
    pub stats: Arc<StatsAggregator>,
}

struct Shared {
    factory: RequestFactory,
    limiter: RateLimiter,
    transport: Arc<dyn Transport>,
    stats: Arc<StatsAggregator>,
    max_attempts: Option<u64>,
    next_attempt: AtomicU64,
    live_workers: AtomicUsize,
    /// Stop starting new attempts
    stop: CancellationToken,
    /// Abandon in-flight exchanges
    abort: CancellationToken,
    /// Fires once every worker has exited
    drained: CancellationToken,
}

/// Decrements the live-worker count on every exit path, panics included.
struct LiveGuard(Arc<Shared>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        if self.0.live_workers.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.drained.cancel();
        }
    }
}

/// Result of joining the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    /// Attempts recorded by workers that exited cleanly
    pub issued: u64,
    /// Workers that did not exit cleanly (panicked)
    pub failed_workers: usize,
    /// Whether the grace period ran out and exchanges were abandoned
    pub aborted: bool,
}

/// Fixed-size pool of independent workers. Each loops through
/// admission, build, exchange and record until told to stop or until the
/// attempt budget is used up.
pub struct Dispatcher {
    shared: Arc<Shared>,
    handles: Vec<JoinHandle<u64>>,
}

impl Dispatcher {
    pub fn spawn(plan: DispatchPlan) -> Self {
        let shared = Arc::new(Shared {
            factory: plan.factory,
            limiter: plan.limiter,
            transport: plan.transport,
            stats: plan.stats,
            max_attempts: plan.max_attempts,
            next_attempt: AtomicU64::new(0),
            live_workers: AtomicUsize::new(plan.workers as usize),
            stop: CancellationToken::new(),
            abort: CancellationToken::new(),
            drained: CancellationToken::new(),
        });

        info!(
            "Spawning {} workers (transport={}, rate={})",
            plan.workers,
            shared.transport.name(),
            if shared.limiter.is_unlimited() {
                "unlimited".to_string()
            } else {
                format!("{}/s", shared.limiter.rate())
            }
        );

        let handles = (0..plan.workers)
            .map(|id| tokio::spawn(run_worker(id, shared.clone())))
            .collect();

        Self { shared, handles }
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    pub fn live_workers(&self) -> usize {
        self.shared.live_workers.load(Ordering::Acquire)
    }

    /// Resolves once every worker has exited on its own, e.g. because the
    /// attempt budget is exhausted.
    pub async fn drained(&self) {
        self.shared.drained.cancelled().await
    }

    /// Stop issuing, let in-flight exchanges finish within `grace`, then
    /// abandon whatever is left and join every worker.
    pub async fn shutdown(self, grace: Duration) -> DispatchReport {
        self.shared.stop.cancel();

        let deadline = Instant::now() + grace;
        let mut report = DispatchReport {
            issued: 0,
            failed_workers: 0,
            aborted: false,
        };

        for (id, mut handle) in self.handles.into_iter().enumerate() {
            let joined = match timeout_at(deadline, &mut handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    if !self.shared.abort.is_cancelled() {
                        warn!(
                            "Grace period of {:?} elapsed, abandoning in-flight requests",
                            grace
                        );
                        self.shared.abort.cancel();
                        report.aborted = true;
                    }
                    handle.await
                }
            };

            match joined {
                Ok(issued) => report.issued += issued,
                Err(e) => {
                    error!("Worker {} exited abnormally: {}", id, e);
                    report.failed_workers += 1;
                }
            }
        }

        debug!(
            "All workers joined: issued={} failed_workers={}",
            report.issued, report.failed_workers
        );
        report
    }
}

async fn run_worker(id: u32, shared: Arc<Shared>) -> u64 {
    let _live = LiveGuard(shared.clone());
    let mut issued = 0u64;

    loop {
        if shared.stop.is_cancelled() {
            break;
        }

        let attempt = shared.next_attempt.fetch_add(1, Ordering::Relaxed);
        if shared.max_attempts.is_some_and(|max| attempt >= max) {
            break;
        }

        tokio::select! {
            biased;
            _ = shared.stop.cancelled() => break,
            _ = shared.limiter.admit() => {}
        }

        let request = shared.factory.build(attempt);

        if let Some(pause) = shared.factory.think_time(attempt) {
            tokio::select! {
                biased;
                _ = shared.stop.cancelled() => break,
                _ = sleep(pause) => {}
            }
        }

        let start = Instant::now();
        let outcome = tokio::select! {
            biased;
            _ = shared.abort.cancelled() => Outcome::aborted(start.elapsed(), request.body_len()),
            outcome = shared.transport.execute(&request) => outcome,
        };

        if let Some(class) = outcome.failure_class() {
            debug!(
                "worker {} attempt {} failed: {:?} status={:?}",
                id, attempt, class, outcome.status
            );
        }
        shared.stats.record(&outcome);
        issued += 1;
    }

    issued
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DelayRange, RunConfig};
    use crate::transport::{FailureClass, MockTransport};

    fn base_config() -> RunConfig {
        RunConfig {
            url: "http://localhost:8080/".to_string(),
            duration_secs: Some(1),
            ..RunConfig::default()
        }
    }

    fn plan(workers: u32, max_attempts: Option<u64>, transport: MockTransport) -> DispatchPlan {
        plan_with(&base_config(), workers, max_attempts, transport)
    }

    fn plan_with(
        config: &RunConfig,
        workers: u32,
        max_attempts: Option<u64>,
        transport: MockTransport,
    ) -> DispatchPlan {
        DispatchPlan {
            workers,
            max_attempts,
            factory: RequestFactory::new(config, 1).unwrap(),
            limiter: RateLimiter::unlimited(),
            transport: Arc::new(transport),
            stats: Arc::new(StatsAggregator::new()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_attempts_issued_exactly() {
        let plan = plan(8, Some(1_000), MockTransport::new(Duration::from_millis(3)));
        let stats = plan.stats.clone();
        let dispatcher = Dispatcher::spawn(plan);

        dispatcher.drained().await;
        assert_eq!(dispatcher.live_workers(), 0);

        let report = dispatcher.shutdown(Duration::from_secs(1)).await;
        assert_eq!(report.issued, 1_000);
        assert!(!report.aborted);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.attempts, 1_000);
        assert_eq!(snapshot.successes, 1_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throughput_bounded_by_workers_over_latency() {
        // 4 workers at 10ms each => ~400 attempts per second
        let plan = plan(4, None, MockTransport::new(Duration::from_millis(10)));
        let stats = plan.stats.clone();
        let dispatcher = Dispatcher::spawn(plan);

        sleep(Duration::from_secs(1)).await;
        let report = dispatcher.shutdown(Duration::from_secs(1)).await;

        let attempts = stats.snapshot().attempts;
        assert_eq!(report.issued, attempts);
        assert!((396..=404).contains(&attempts), "attempts: {}", attempts);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_caps_throughput() {
        let mut plan = plan(50, None, MockTransport::new(Duration::from_millis(1)));
        plan.limiter = RateLimiter::with_burst(5.0, 5);
        let stats = plan.stats.clone();
        let dispatcher = Dispatcher::spawn(plan);

        sleep(Duration::from_secs(3)).await;
        dispatcher.shutdown(Duration::from_secs(1)).await;

        let attempts = stats.snapshot().attempts;
        assert!((15..=20).contains(&attempts), "attempts: {}", attempts);
    }

    fn delayed(ms: u64) -> RunConfig {
        let mut config = base_config();
        config.randomize.delay = Some(DelayRange {
            min_ms: ms,
            max_ms: ms,
        });
        config
    }

    #[tokio::test(start_paused = true)]
    async fn test_think_time_lowers_throughput() {
        // 4 workers at 10ms + 100ms pause => 9 full cycles each in one second
        let plan = plan_with(&delayed(100), 4, None, MockTransport::new(Duration::from_millis(10)));
        let stats = plan.stats.clone();
        let dispatcher = Dispatcher::spawn(plan);

        sleep(Duration::from_secs(1)).await;
        let report = dispatcher.shutdown(Duration::from_secs(1)).await;

        let attempts = stats.snapshot().attempts;
        assert_eq!(report.issued, attempts);
        assert!((32..=40).contains(&attempts), "attempts: {}", attempts);
    }

    #[tokio::test(start_paused = true)]
    async fn test_think_time_keeps_rate_bound() {
        let mut plan = plan_with(&delayed(100), 50, None, MockTransport::new(Duration::from_millis(1)));
        plan.limiter = RateLimiter::with_burst(5.0, 5);
        let stats = plan.stats.clone();
        let dispatcher = Dispatcher::spawn(plan);

        sleep(Duration::from_secs(3)).await;
        dispatcher.shutdown(Duration::from_secs(1)).await;

        // At most 5/s for 3s plus a burst of 5.
        let attempts = stats.snapshot().attempts;
        assert!((14..=20).contains(&attempts), "attempts: {}", attempts);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_think_time() {
        let plan = plan_with(
            &delayed(3_600_000),
            6,
            None,
            MockTransport::new(Duration::from_millis(1)),
        );
        let stats = plan.stats.clone();
        let dispatcher = Dispatcher::spawn(plan);

        sleep(Duration::from_millis(100)).await;
        let started = Instant::now();
        let report = dispatcher.shutdown(Duration::from_secs(5)).await;

        assert!(started.elapsed() < Duration::from_millis(10));
        assert!(!report.aborted);
        assert_eq!(report.failed_workers, 0);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.attempts, 0);
        assert!(snapshot.is_consistent());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_abandons_after_grace() {
        let plan = plan(6, None, MockTransport::new(Duration::from_secs(3_600)));
        let stats = plan.stats.clone();
        let dispatcher = Dispatcher::spawn(plan);

        sleep(Duration::from_millis(100)).await;
        let started = Instant::now();
        let report = dispatcher.shutdown(Duration::from_millis(500)).await;

        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(report.aborted);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.attempts, 6);
        assert_eq!(snapshot.failures.get(FailureClass::Aborted), 6);
        assert!(snapshot.is_consistent());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_do_not_stop_workers() {
        let plan = plan(
            2,
            Some(200),
            MockTransport::failing(Duration::from_millis(1), FailureClass::Connection),
        );
        let stats = plan.stats.clone();
        let dispatcher = Dispatcher::spawn(plan);

        dispatcher.drained().await;
        dispatcher.shutdown(Duration::from_secs(1)).await;

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.attempts, 200);
        assert_eq!(snapshot.failures.connection, 200);
        assert_eq!(snapshot.successes, 0);
    }
}
