//! # Coordinator Binary Entry Point
//!
//! Loads a coordinator config and drives every `[[jobs]]` entry through all
//! stages on the configured backend.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin coordinator -- --config config/coordinator.toml
//! ```
//!
//! Check which credential source would be used, without running anything:
//! ```bash
//! cargo run --bin coordinator -- --config config/coordinator.toml --check-credentials
//! ```
//!
//! The coordinator will:
//! 1. Load configuration from the specified TOML file
//! 2. Build one client per party (resolving the access token for each)
//! 3. Run all jobs concurrently on a single-threaded runtime
//! 4. Print a summary per job and export metrics (if metrics-output specified)

use clap::Parser;
use env_logger::Builder;
use log::{error, info, LevelFilter};
use std::io::Write;
use std::sync::{Arc, Mutex};

use pc_coordinator::client::ClientFactory;
use pc_coordinator::common::config::CoordinatorConfig;
use pc_coordinator::runner::{Job, JobMetrics, JobOutcome, JobRunner, RunnerConfig};

/// Command-line arguments for the coordinator binary
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the coordinator configuration file (TOML format)
    #[arg(short, long)]
    config: String,

    /// Path to write stage metrics JSON output (optional)
    #[arg(long)]
    metrics_output: Option<String>,

    /// Only resolve the access token and report where it came from
    #[arg(long)]
    check_credentials: bool,
}

/// Initialize the logging system with timestamp, level, and message formatting.
///
/// Format: `[HH:MM:SS] [LEVEL] message`
fn init_logger() {
    Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] [{}] {}",
                chrono::Local::now().format("%H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .filter_level(LevelFilter::Info)
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    init_logger();

    let args = Args::parse();
    let config = CoordinatorConfig::from_file(&args.config)?;
    let factory = ClientFactory::new(&config);

    if args.check_credentials {
        factory.check_credentials()?;
        println!("Access token resolved for backend {:?}", factory.backend());
        return Ok(());
    }

    // Construction resolves credentials, so a missing token stops us here
    // with the remediation message before any remote call.
    let jobs = config
        .jobs
        .iter()
        .map(|job| Job::from_config(job, &factory))
        .collect::<Result<Vec<_>, _>>()?;

    if jobs.is_empty() {
        info!("No [[jobs]] configured, nothing to do");
        return Ok(());
    }

    let metrics = args
        .metrics_output
        .as_ref()
        .map(|_| Arc::new(Mutex::new(JobMetrics::new())));

    let mut runner = JobRunner::new(RunnerConfig::from(&config.coordinator));
    if let Some(m) = &metrics {
        runner = runner.with_metrics(m.clone());
    }

    let summaries = runner.run_jobs(jobs).await;

    let mut failed = 0;
    for summary in &summaries {
        println!(
            "{}: {:?} (publisher {}, partner {})",
            summary.name,
            summary.outcome,
            summary.publisher_instance.as_deref().unwrap_or("-"),
            summary.partner_instance.as_deref().unwrap_or("-"),
        );
        if summary.outcome != JobOutcome::Succeeded {
            failed += 1;
        }
    }

    if let (Some(metrics), Some(output_path)) = (metrics, args.metrics_output) {
        let metrics = metrics
            .lock()
            .map_err(|e| anyhow::anyhow!("metrics lock poisoned: {}", e))?;
        metrics.export_to_json(&output_path)?;
        println!("Metrics exported to: {}", output_path);
    }

    if failed > 0 {
        error!("❌ {} of {} jobs did not succeed", failed, summaries.len());
        anyhow::bail!("{} jobs did not succeed", failed);
    }

    Ok(())
}
