use adaptive_batch::adaptive_concurrency::ConcurrencySettings;
use adaptive_batch::adaptive_concurrency::retries::RetrySettings;
use adaptive_batch::{BatchOrchestrator, BatchSettings, Job, JsonLinesCache, ProgressEvent};
use hypernym_client::{HypernymConfig, HypernymService};

use std::env;
use std::error::Error;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, info, warn};

// --- Configuration Environment Variable Names ---
const ENV_SAMPLES_PATH: &str = "SAMPLES_PATH"; // JSON lines, one job per line
const ENV_CACHE_DIR: &str = "CACHE_DIR";
const ENV_INITIAL_WORKERS: &str = "AC_INITIAL_WORKERS";
const ENV_MAX_RETRIES: &str = "RETRY_MAX_RETRIES";
const ENV_USE_CACHE: &str = "USE_CACHE";

// Helper to parse environment variables with a default
fn get_env_var<T: FromStr + std::fmt::Debug>(var_name: &str, default_value: T) -> T
where
    <T as FromStr>::Err: std::fmt::Debug,
{
    env::var(var_name)
        .ok()
        .and_then(|val_str| match val_str.parse::<T>() {
            Ok(val) => Some(val),
            Err(e) => {
                warn!(
                    "Failed to parse env var '{}' (value: '{}'). Error: {:?}. Using default: {:?}",
                    var_name, val_str, e, default_value
                );
                None
            }
        })
        .unwrap_or(default_value)
}

fn read_jobs(path: &PathBuf) -> Result<Vec<Job>, Box<dyn Error + Send + Sync + 'static>> {
    let contents = std::fs::read_to_string(path)?;
    let mut jobs = Vec::new();
    for (index, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let job: Job = serde_json::from_str(line)
            .map_err(|e| format!("{}:{}: {}", path.display(), index + 1, e))?;
        jobs.push(job);
    }
    Ok(jobs)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync + 'static>> {
    let default_log_filter = "info,hypernym_client=info,adaptive_batch=info";
    tracing_subscriber::fmt()
        .with_env_filter(env::var("RUST_LOG").unwrap_or_else(|_| default_log_filter.to_string()))
        .init();

    let config = HypernymConfig::from_env()?;
    info!(
        target: "config_final",
        api_url = %config.api_url,
        poll_interval = ?config.poll_interval,
        "Client configuration loaded."
    );
    let service = HypernymService::new(config)?;

    let samples: PathBuf = get_env_var(ENV_SAMPLES_PATH, PathBuf::from("samples.jsonl"));
    let jobs = read_jobs(&samples)?;
    info!("Loaded {} jobs from {}", jobs.len(), samples.display());

    let cache_dir: PathBuf = get_env_var(ENV_CACHE_DIR, PathBuf::from(".hypernym_cache"));
    std::fs::create_dir_all(&cache_dir)?;
    let cache = JsonLinesCache::open(cache_dir.join("results.jsonl"), cache_dir.join("failures.jsonl"))?;

    let settings = BatchSettings::builder()
        .concurrency(
            ConcurrencySettings::builder()
                .initial_workers(get_env_var(ENV_INITIAL_WORKERS, 8usize))
                .build(),
        )
        .retry(RetrySettings::builder().max_retries(get_env_var(ENV_MAX_RETRIES, 3u32)).build())
        .use_cache(get_env_var(ENV_USE_CACHE, true))
        .build();
    info!(target: "config_loading", ?settings);

    let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                ProgressEvent::BatchStarted { jobs, workers } => {
                    info!("Starting {} jobs on {} workers", jobs, workers)
                }
                ProgressEvent::AttemptFailed {
                    job_id,
                    attempt,
                    error,
                    retry_in: Some(delay),
                } => warn!("[Job {}] attempt {} failed ({}), retrying in {:?}", job_id, attempt, error, delay),
                ProgressEvent::AttemptFailed {
                    job_id, error, ..
                } => error!("[Job {}] giving up: {}", job_id, error),
                ProgressEvent::JobFinished { worker, report } => println!(
                    "[Worker {}] job {} -> {} after {} attempt(s){}",
                    worker,
                    report.job_id,
                    report.outcome.label(),
                    report.attempts,
                    report
                        .outcome
                        .ratio()
                        .map(|r| format!(", ratio {:.2}", r))
                        .unwrap_or_default()
                ),
                _ => {}
            }
        }
    });

    let orchestrator = BatchOrchestrator::new(service.clone(), Arc::new(cache), settings)
        .with_capacity_source(Arc::new(service))
        .with_progress(events_tx);
    let report = orchestrator.run(jobs).await?;

    // Dropping the orchestrator closes the event channel.
    drop(orchestrator);
    if let Err(e) = printer.await {
        error!("[Main] progress printer join error: {}", e);
    }

    println!("{report}");
    Ok(())
}
