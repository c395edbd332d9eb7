use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rand::seq::SliceRandom;
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use turnstile::config::{LoggingSettings, Settings, StoreBackend};
use turnstile::store::{BucketStateStore, MemoryStore};
use turnstile::{LimiterConfig, TokenBucketLimiter};

type Limiter = TokenBucketLimiter<dyn BucketStateStore>;

#[derive(Parser)]
#[command(name = "turnstile")]
#[command(about = "Distributed token bucket admission control", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (YAML); TURNSTILE__* environment variables override it
    #[arg(short, long, env = "TURNSTILE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Try to consume one token for a client
    Check {
        /// Client identifier
        client_id: String,
    },

    /// Show a client's current balance without consuming a token
    Peek {
        /// Client identifier
        client_id: String,
    },

    /// Run concurrent callers against the store and report admissions
    Simulate {
        /// Number of distinct clients
        #[arg(long, default_value_t = 2)]
        clients: usize,

        /// Independent limiter instances per client
        #[arg(long, default_value_t = 8)]
        callers: usize,

        /// Requests issued by each caller
        #[arg(long, default_value_t = 10)]
        requests: usize,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let settings = Settings::load(cli.config.as_deref()).context("Failed to load configuration")?;
    init_tracing(&settings.logging);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        backend = ?settings.store.backend,
        capacity = settings.limiter.capacity,
        refill_rate_per_second = settings.limiter.refill_rate_per_second,
        "Configuration loaded"
    );

    let store = open_store(&settings).await?;
    let limiter_config = settings.limiter_config()?;
    let limiter: Limiter = TokenBucketLimiter::new(store.clone(), limiter_config.clone())?;

    match cli.command {
        Commands::Check { client_id } => {
            let decision = limiter.check(&client_id).await?;
            println!(
                "{}",
                json!({
                    "client_id": client_id,
                    "allowed": decision.allowed,
                    "remaining": decision.remaining,
                    "retry_after_ms": decision.retry_after.as_millis() as u64,
                })
            );
            Ok(if decision.allowed {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(1)
            })
        }
        Commands::Peek { client_id } => {
            match limiter.peek(&client_id).await? {
                Some(snapshot) => println!(
                    "{}",
                    json!({
                        "client_id": client_id,
                        "tokens": snapshot.tokens,
                        "capacity": snapshot.capacity,
                        "last_refill_at_ms": snapshot.last_refill_at_ms,
                    })
                ),
                None => println!("{}", json!({ "client_id": client_id, "tokens": null })),
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Simulate {
            clients,
            callers,
            requests,
        } => {
            let report = simulate(store, limiter_config, clients, callers, requests).await?;
            report.print();
            if report.over_admitted() {
                warn!(
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    bound = report.bound,
                    "A client was admitted beyond its budget"
                );
            }
            Ok(if report.over_admitted() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            })
        }
    }
}

/// Initialize tracing on stderr, leaving stdout for command output.
fn init_tracing(logging: &LoggingSettings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn open_store(settings: &Settings) -> Result<Arc<dyn BucketStateStore>> {
    match settings.store.backend {
        StoreBackend::Memory => {
            warn!("Using the in-memory store; bucket state is not shared with other processes");
            Ok(Arc::new(MemoryStore::new()))
        }
        #[cfg(feature = "redis")]
        StoreBackend::Redis => {
            let store = turnstile::store::RedisStore::connect(settings.redis_config()?)
                .await
                .context("Failed to connect to Redis")?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis"))]
        StoreBackend::Redis => {
            anyhow::bail!("the redis backend requires building with `--features redis`")
        }
    }
}

#[derive(Debug, Default)]
struct Tally {
    admitted: usize,
    denied: usize,
    errors: usize,
}

/// Per-client totals of one simulation run.
#[derive(Debug)]
struct SimulationReport {
    totals: BTreeMap<String, Tally>,
    /// Most admissions any client may receive over the run's duration
    bound: u64,
    elapsed: Duration,
}

impl SimulationReport {
    fn within_bound(&self, tally: &Tally) -> bool {
        tally.admitted as u64 <= self.bound
    }

    /// Returns `true` if any client was admitted more often than its budget allows.
    fn over_admitted(&self) -> bool {
        self.totals.values().any(|tally| !self.within_bound(tally))
    }

    fn print(&self) {
        for (client_id, tally) in &self.totals {
            println!(
                "{}",
                json!({
                    "client_id": client_id,
                    "admitted": tally.admitted,
                    "denied": tally.denied,
                    "errors": tally.errors,
                    "bound": self.bound,
                    "within_bound": self.within_bound(tally),
                })
            );
        }
    }
}

/// Run `callers` independent limiter instances per client against one shared
/// store, each issuing `requests` checks.
async fn simulate(
    store: Arc<dyn BucketStateStore>,
    config: LimiterConfig,
    clients: usize,
    callers: usize,
    requests: usize,
) -> Result<SimulationReport> {
    let run_id = uuid::Uuid::new_v4().simple().to_string();
    let client_ids: Vec<String> = (0..clients)
        .map(|i| format!("sim-{}-{}", &run_id[..8], i))
        .collect();

    let mut assignments: Vec<String> = client_ids
        .iter()
        .flat_map(|id| std::iter::repeat(id.clone()).take(callers))
        .collect();
    assignments.shuffle(&mut rand::thread_rng());

    info!(
        run_id = %run_id,
        clients,
        callers,
        requests,
        "Starting simulation"
    );

    let started = Instant::now();
    let mut tasks = Vec::with_capacity(assignments.len());
    for client_id in assignments {
        let limiter: Limiter = TokenBucketLimiter::new(store.clone(), config.clone())?;
        tasks.push(tokio::spawn(async move {
            let mut tally = Tally::default();
            for _ in 0..requests {
                match limiter.is_allowed(&client_id).await {
                    Ok(true) => tally.admitted += 1,
                    Ok(false) => tally.denied += 1,
                    Err(e) => {
                        warn!(client_id = %client_id, error = %e, "Admission check failed");
                        tally.errors += 1;
                    }
                }
            }
            (client_id, tally)
        }));
    }

    let mut totals: BTreeMap<String, Tally> = BTreeMap::new();
    for result in futures::future::join_all(tasks).await {
        let (client_id, tally) = result.context("Simulation task panicked")?;
        let total = totals.entry(client_id).or_default();
        total.admitted += tally.admitted;
        total.denied += tally.denied;
        total.errors += tally.errors;
    }
    let elapsed = started.elapsed();

    let bound = config.capacity as f64 + elapsed.as_secs_f64() * config.refill_rate_per_second;

    info!(elapsed_ms = elapsed.as_millis() as u64, "Simulation finished");
    Ok(SimulationReport {
        totals,
        bound: bound.floor() as u64,
        elapsed,
    })
}
