//! Hypothesis Engine CLI
//!
//! Operator entrypoint for the hypothesis registry and its batch workers.
//! Workers are externally triggered: a scheduler (cron, systemd timer)
//! invokes `run-worker` or `run-cycle` periodically.
//!
//! # Usage
//!
//! ```bash
//! hypothesis-engine --db ./hypotheses.db init
//! hypothesis-engine run-cycle --feed-dir ./feed
//! hypothesis-engine run-worker experimentation --feed-dir ./feed
//! hypothesis-engine show --code H-0042
//! hypothesis-engine death-rates
//! ```
//!
//! Configuration comes from `--config`, else `HYPOTHESIS_CONFIG_PATH`,
//! else `hypothesis_engine.toml`, else built-in defaults.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use dotenv::dotenv;
use hypothesis_economy::config::EngineConfig;
use hypothesis_economy::economy::{
    EligibilityChecker, EligibilityWorker, ExperimentationWorker, GateLockWorker,
    HypothesisCode, HypothesisRegistry, HypothesisState, JsonDirectorySource, OriginationWorker,
    Worker, WorkerKind, WorkerRunReport,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// CLI ARGUMENTS
// =============================================================================

#[derive(Parser, Debug)]
#[command(name = "hypothesis-engine")]
#[command(about = "Lifecycle manager for falsifiable predictive hypotheses")]
struct Args {
    /// Engine config (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Registry database, overrides the config
    #[arg(long, global = true, env = "HYPOTHESIS_DB_PATH")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the registry schema, optionally writing the effective config
    Init {
        #[arg(long)]
        write_config: Option<PathBuf>,
    },

    /// List hypotheses, optionally filtered by state (e.g. ACTIVE)
    List {
        #[arg(long)]
        state: Option<String>,
    },

    /// Hypothesis record, experiment log and guardrail ledger
    Show {
        #[arg(long)]
        code: String,
    },

    /// Run the pre-validation gate without locking
    Gate {
        #[arg(long)]
        code: String,
    },

    /// Pre-register a DRAFT hypothesis
    Lock {
        #[arg(long)]
        code: String,
    },

    /// Move a PRE_VALIDATED hypothesis to ACTIVE at Tier 1
    Activate {
        #[arg(long)]
        code: String,
    },

    /// Withdraw a hypothesis from testing
    Retire {
        #[arg(long)]
        code: String,
    },

    /// Evaluate and record paper-trading eligibility
    Eligibility {
        #[arg(long)]
        code: String,
    },

    /// Apply verdicts of experiments left unapplied by an interrupted run
    Reconcile,

    /// Observed falsification rate per tier against its target band
    DeathRates,

    /// Run one worker batch
    RunWorker {
        #[arg(value_enum)]
        kind: WorkerArg,

        /// Feed directory with drafts, provenance and evidence
        #[arg(long, env = "HYPOTHESIS_FEED_DIR")]
        feed_dir: PathBuf,
    },

    /// Run every worker once, in pipeline order
    RunCycle {
        #[arg(long, env = "HYPOTHESIS_FEED_DIR")]
        feed_dir: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum WorkerArg {
    Origination,
    GateLock,
    Experimentation,
    Eligibility,
}

impl From<WorkerArg> for WorkerKind {
    fn from(arg: WorkerArg) -> Self {
        match arg {
            WorkerArg::Origination => WorkerKind::Origination,
            WorkerArg::GateLock => WorkerKind::GateLock,
            WorkerArg::Experimentation => WorkerKind::Experimentation,
            WorkerArg::Eligibility => WorkerKind::Eligibility,
        }
    }
}

const PIPELINE: [WorkerKind; 4] = [
    WorkerKind::Origination,
    WorkerKind::GateLock,
    WorkerKind::Experimentation,
    WorkerKind::Eligibility,
];

// =============================================================================
// MAIN
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    init_tracing();

    let args = Args::parse();
    let config = load_config(&args)?;

    if let Commands::Init { write_config } = &args.command {
        if let Some(path) = write_config {
            config
                .save(path)
                .with_context(|| format!("Failed to write config {}", path.display()))?;
            info!(path = %path.display(), "Wrote engine config");
        }
    }

    let registry = Arc::new(
        HypothesisRegistry::open(&config.database_path, &config).with_context(|| {
            format!("Failed to open registry {}", config.database_path.display())
        })?,
    );

    match args.command {
        Commands::Init { .. } => {
            info!(db = %config.database_path.display(), "Registry ready");
        }
        Commands::List { state } => {
            let state = state
                .map(|s| {
                    HypothesisState::parse(&s.to_uppercase())
                        .ok_or_else(|| anyhow!("Unknown state: {}", s))
                })
                .transpose()?;
            print_json(&registry.list(state)?)?;
        }
        Commands::Show { code } => {
            let code = HypothesisCode::new(code);
            let hypothesis = registry.require(&code)?;
            print_json(&serde_json::json!({
                "hypothesis": hypothesis,
                "experiments": registry.experiments(&code)?,
                "guardrail": registry.guardrail_entry(&code)?,
                "eligibility": registry.latest_eligibility(&code)?,
            }))?;
        }
        Commands::Gate { code } => {
            print_json(&registry.evaluate_gate(&HypothesisCode::new(code))?)?;
        }
        Commands::Lock { code } => {
            print_json(&registry.lock(&HypothesisCode::new(code))?)?;
        }
        Commands::Activate { code } => {
            print_json(&registry.activate(&HypothesisCode::new(code))?)?;
        }
        Commands::Retire { code } => {
            print_json(&registry.retire(&HypothesisCode::new(code))?)?;
        }
        Commands::Eligibility { code } => {
            let code = HypothesisCode::new(code);
            let hypothesis = registry.require(&code)?;
            let summary = registry.experiment_summary(&code)?;
            let report = EligibilityChecker::new(config.eligibility.clone())
                .evaluate(&hypothesis, &summary, Utc::now());
            registry.record_eligibility(&report)?;
            print_json(&report)?;
        }
        Commands::Reconcile => {
            print_json(&registry.reconcile()?)?;
        }
        Commands::DeathRates => {
            let rates = registry.death_rates()?;
            for rate in rates.iter().filter(|r| !r.within_target()) {
                warn!(
                    tier = %rate.tier,
                    observed = rate.observed,
                    target_low = rate.target.0,
                    target_high = rate.target.1,
                    "Tier death rate outside target band"
                );
            }
            print_json(&rates)?;
        }
        Commands::RunWorker { kind, feed_dir } => {
            let feed = Arc::new(JsonDirectorySource::new(feed_dir));
            let worker = build_worker(kind.into(), &registry, &feed, &config);
            let report = run_blocking(worker).await?;
            print_json(&report)?;
        }
        Commands::RunCycle { feed_dir } => {
            let feed = Arc::new(JsonDirectorySource::new(feed_dir));
            let mut reports = Vec::with_capacity(PIPELINE.len());
            // Each stage feeds the next, so they run in sequence.
            for kind in PIPELINE {
                let worker = build_worker(kind, &registry, &feed, &config);
                reports.push(run_blocking(worker).await?);
            }
            print_json(&reports)?;
        }
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hypothesis_economy=info,hypothesis_engine=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_config(args: &Args) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::from_env(),
    };
    if let Some(db) = &args.db {
        config.database_path = db.clone();
    }
    config.validate()?;
    Ok(config)
}

fn build_worker(
    kind: WorkerKind,
    registry: &Arc<HypothesisRegistry>,
    feed: &Arc<JsonDirectorySource>,
    config: &EngineConfig,
) -> Arc<dyn Worker> {
    match kind {
        WorkerKind::Origination => Arc::new(OriginationWorker::new(
            registry.clone(),
            feed.clone(),
            feed.clone(),
        )),
        WorkerKind::GateLock => Arc::new(GateLockWorker::new(registry.clone(), config.workers.clone())),
        WorkerKind::Experimentation => Arc::new(ExperimentationWorker::new(
            registry.clone(),
            feed.clone(),
            feed.clone(),
            config.workers.clone(),
        )),
        WorkerKind::Eligibility => Arc::new(EligibilityWorker::new(
            registry.clone(),
            EligibilityChecker::new(config.eligibility.clone()),
            config.workers.clone(),
        )),
    }
}

/// Runs a worker batch on the blocking pool; the registry holds a
/// synchronous SQLite connection.
async fn run_blocking(worker: Arc<dyn Worker>) -> Result<WorkerRunReport> {
    let kind = worker.kind();
    tokio::task::spawn_blocking(move || worker.run_once())
        .await
        .with_context(|| format!("{} worker panicked", kind))?
        .with_context(|| format!("{} worker failed", kind))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
