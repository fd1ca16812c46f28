use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use storm_core::{
    DelayRange, MockTransport, RunConfig, RunController, RunState, StatsSnapshot,
};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "storm")]
#[command(about = "HTTP load generator with rate control and live statistics")]
struct Args {
    /// Target URL (overrides the config file)
    url: Option<String>,

    /// Load settings from a TOML file; flags override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Duration in seconds (default 10 when no request count is given)
    #[arg(short, long)]
    duration: Option<u64>,

    /// Stop after this many requests
    #[arg(short = 'n', long)]
    max_requests: Option<u64>,

    /// Number of concurrent workers
    #[arg(short = 't', long = "threads")]
    workers: Option<u32>,

    /// Requests per second, 0 = unlimited
    #[arg(short, long)]
    rps: Option<f64>,

    /// Burst allowance on top of the steady rate
    #[arg(long)]
    burst: Option<u32>,

    /// HTTP method
    #[arg(short, long)]
    method: Option<String>,

    /// Request timeout in seconds
    #[arg(long)]
    timeout: Option<f64>,

    /// Vary request headers and rotate user agents
    #[arg(long)]
    stealth: bool,

    /// Add a random 10-500ms pause before each request
    #[arg(long)]
    random_delay: bool,

    /// Route requests through this proxy (repeatable)
    #[arg(long = "proxy")]
    proxies: Vec<String>,

    /// Seed for request randomization
    #[arg(long)]
    seed: Option<u64>,

    /// Disable TLS certificate verification
    #[arg(long)]
    no_ssl_verify: bool,

    /// Print stats every N milliseconds
    #[arg(long)]
    print_every_ms: Option<u64>,

    /// Use an in-process mock target (5ms, 200 OK) instead of the network
    #[arg(long)]
    mock: bool,

    /// Directory for the JSON results file
    #[arg(long, default_value = "results")]
    results_dir: PathBuf,

    /// Do not write a results file
    #[arg(long)]
    no_results: bool,
}

#[derive(Debug, Serialize)]
struct RunResult {
    timestamp: String,
    url: String,
    method: String,
    workers: u32,
    target_rps: f64,
    seed: Option<u64>,
    state: RunState,
    achieved_rps: f64,
    success_rate: f64,
    stats: StatsSnapshot,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = build_config(&args)?;

    let controller = Arc::new(if args.mock {
        RunController::with_transport(Arc::new(MockTransport::new(Duration::from_millis(5))))
    } else {
        RunController::new()
    });

    {
        let controller = controller.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling run");
                controller.cancel();
            }
        });
    }

    controller
        .start(config.clone())
        .context("Failed to start run")?;

    let progress = tokio::spawn(report_progress(controller.clone()));
    let stats = controller.wait().await?;
    progress.abort();

    let result = RunResult {
        timestamp: chrono::Utc::now().to_rfc3339(),
        url: config.url.clone(),
        method: config.method.to_ascii_uppercase(),
        workers: config.workers,
        target_rps: config.rate,
        seed: controller.seed(),
        state: controller.state(),
        achieved_rps: stats.average_rps(),
        success_rate: stats.success_rate(),
        stats,
    };

    if !args.no_results {
        let output_path = write_result(&args.results_dir, &result)?;
        info!("Results written to {}", output_path.display());
    }
    print_summary(&result);

    Ok(())
}

fn build_config(args: &Args) -> Result<RunConfig> {
    let mut config = match &args.config {
        Some(path) => RunConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => RunConfig::default(),
    };

    if let Some(url) = &args.url {
        config.url = url.clone();
    }
    if config.url.is_empty() {
        anyhow::bail!("No target URL given (pass it as an argument or set `url` in the config)");
    }

    if let Some(duration) = args.duration {
        config.duration_secs = Some(duration);
    }
    if let Some(max) = args.max_requests {
        config.max_requests = Some(max);
    }
    if config.duration_secs.is_none() && config.max_requests.is_none() {
        config.duration_secs = Some(10);
    }

    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(rps) = args.rps {
        config.rate = rps;
    }
    if args.burst.is_some() {
        config.burst = args.burst;
    }
    if let Some(method) = &args.method {
        config.method = method.clone();
    }
    if let Some(timeout) = args.timeout {
        config.timeout_ms = (timeout * 1000.0).round() as u64;
    }
    if args.stealth {
        config.randomize.headers = true;
        config.randomize.user_agent = true;
    }
    if args.random_delay && config.randomize.delay.is_none() {
        config.randomize.delay = Some(DelayRange::default());
    }
    if !args.proxies.is_empty() {
        config.proxies.urls = args.proxies.clone();
    }
    if args.seed.is_some() {
        config.seed = args.seed;
    }
    if args.no_ssl_verify {
        config.verify_tls = false;
    }
    if let Some(ms) = args.print_every_ms {
        config.report_interval_ms = ms;
    }

    Ok(config)
}

async fn report_progress(controller: Arc<RunController>) {
    let mut snapshots = controller.subscribe();
    let mut previous = StatsSnapshot::default();

    while snapshots.changed().await.is_ok() {
        let snapshot = snapshots.borrow_and_update().clone();
        print_progress(&snapshot, &previous);
        previous = snapshot;
    }
}

fn print_progress(snapshot: &StatsSnapshot, previous: &StatsSnapshot) {
    info!(
        "Progress: attempts={} ok={} failed={} timeouts={} rps={:.1} avg_rps={:.1} p50={:.1}ms p95={:.1}ms p99={:.1}ms",
        snapshot.attempts,
        snapshot.successes,
        snapshot.failed(),
        snapshot.failures.timeout,
        snapshot.rate_since(previous),
        snapshot.average_rps(),
        millis(snapshot.latency.p50_micros),
        millis(snapshot.latency.p95_micros),
        millis(snapshot.latency.p99_micros)
    );
}

fn millis(micros: u64) -> f64 {
    micros as f64 / 1000.0
}

fn write_result(dir: &Path, result: &RunResult) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create results directory {:?}", dir))?;

    let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    let output_path = dir.join(format!("run_{}.json", timestamp));
    let result_json = serde_json::to_string_pretty(result)?;
    std::fs::write(&output_path, result_json)
        .with_context(|| format!("Failed to write {:?}", output_path))?;
    Ok(output_path)
}

fn print_summary(result: &RunResult) {
    let stats = &result.stats;
    println!("\n=== Run Summary ({:?}) ===", result.state);
    println!("Target: {} {}", result.method, result.url);
    println!("Duration: {}ms", stats.elapsed_ms);
    println!("Attempts: {}", stats.attempts);
    println!(
        "Successful: {} ({:.2}%)",
        stats.successes, result.success_rate
    );
    println!("Failed: {}", stats.failed());
    for (class, count) in stats.failures.breakdown().into_iter().take(5) {
        println!("  {:?}: {}", class, count);
    }
    println!("Achieved RPS: {:.2}", result.achieved_rps);
    println!(
        "Latency avg/min/max: {:.1}/{:.1}/{:.1}ms",
        millis(stats.latency.mean_micros),
        millis(stats.latency.min_micros),
        millis(stats.latency.max_micros)
    );
    println!(
        "Latency p50/p90/p95/p99: {:.1}/{:.1}/{:.1}/{:.1}ms",
        millis(stats.latency.p50_micros),
        millis(stats.latency.p90_micros),
        millis(stats.latency.p95_micros),
        millis(stats.latency.p99_micros)
    );
    println!("Data sent: {} bytes", stats.bytes_sent);
    println!("Data received: {} bytes", stats.bytes_received);
    if !stats.status_codes.is_empty() {
        println!("Status codes:");
        for (code, count) in &stats.status_codes {
            let share = *count as f64 * 100.0 / stats.attempts.max(1) as f64;
            println!("  {}: {} ({:.1}%)", code, count, share);
        }
    }
    println!();
}
