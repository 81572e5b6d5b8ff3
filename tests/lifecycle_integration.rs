//! Integration tests for the hypothesis lifecycle
//!
//! These tests drive the workers against an on-disk registry and a JSON
//! feed directory, reopen the database to check persistence, and exercise
//! the `hypothesis-engine` CLI.

use chrono::{Duration, TimeZone, Utc};
use hypothesis_economy::config::EngineConfig;
use hypothesis_economy::economy::criteria::{TrialEvidence, WindowObservation};
use hypothesis_economy::economy::models::{
    Comparison, Direction, DirectionalClaim, EconomicContent, FalsificationCriteria,
    FalsificationMetric, HypothesisCode, HypothesisDraft, HypothesisState, MagnitudeClass, Origin,
    PreValidationInputs, RegimeScope, RegimeSnapshot, Tier, TrialClass,
};
use hypothesis_economy::economy::{
    ExperimentationWorker, GateLockWorker, HypothesisRegistry, JsonDirectorySource,
    OriginationWorker, Worker, WorkerConfig,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tempfile::TempDir;

const CODE: &str = "H-INT-001";
const SNAPSHOT: &str = "snap-int";

fn draft() -> HypothesisDraft {
    HypothesisDraft {
        code: HypothesisCode::new(CODE),
        content: EconomicContent {
            rationale: "Stablecoin supply expansion leads spot demand for major assets".into(),
            causal_mechanism: "Fresh stablecoin issuance is deployed into spot within a day of minting"
                .into(),
            behavioral_basis: None,
            counterfactual_scenario: "Issuance is followed by flat or falling spot prices".into(),
        },
        claim: DirectionalClaim {
            direction: Direction::Bullish,
            magnitude_class: MagnitudeClass::Small,
            horizon_hours: 24.0,
        },
        regime_scope: RegimeScope::new(["trending", "ranging"]),
        falsification_criteria: FalsificationCriteria {
            metric: FalsificationMetric::DirectionalAccuracy,
            falsify_when: Comparison::Below,
            threshold: 0.5,
            evaluation_window_hours: 480.0,
        },
        confidence_decay_rate: 0.15,
        max_falsifications: 3,
        pre_validation: PreValidationInputs {
            sample_size_historical: 200,
            prior_hypotheses_count: 2,
            deflated_sharpe_estimate: 0.7,
        },
        initial_confidence: 0.6,
        origin: Origin::theory(),
    }
}

fn windows(n: i64) -> Vec<WindowObservation> {
    let start = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
    (0..n)
        .map(|day| WindowObservation {
            window_start: start + Duration::days(day),
            regime: if day % 2 == 0 { "trending" } else { "ranging" }.to_string(),
            hits: 7,
            trials: 10,
            mean_return_pct: 3.0,
            direction_flipped: false,
            regime_transition: false,
        })
        .collect()
}

fn write_json(path: &Path, value: &impl serde::Serialize) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, serde_json::to_string_pretty(value).unwrap()).unwrap();
}

/// Feed directory with one draft, its regime snapshot and T1 evidence.
fn write_feed(root: &Path) {
    write_json(&root.join("drafts").join(format!("{}.json", CODE)), &draft());
    write_json(
        &root.join("regimes").join(format!("{}.json", SNAPSHOT)),
        &RegimeSnapshot {
            id: SNAPSHOT.into(),
            regime: "trending".into(),
            captured_at: Utc::now(),
        },
    );
    write_json(
        &root.join("evidence").join(CODE).join("t1_falsification_sweep.json"),
        &TrialEvidence {
            dataset_signature: "ds-int-2024q1".into(),
            regime_snapshot_ref: SNAPSHOT.into(),
            error_ref: None,
            reuse_authorized: false,
            windows: windows(20),
        },
    );
}

fn config(dir: &TempDir) -> EngineConfig {
    EngineConfig {
        database_path: dir.path().join("hypotheses.db"),
        ..EngineConfig::default()
    }
}

#[test]
fn test_workers_persist_across_reopen() {
    let dir = TempDir::new().unwrap();
    let feed_dir = dir.path().join("feed");
    write_feed(&feed_dir);
    let config = config(&dir);
    let code = HypothesisCode::new(CODE);

    {
        let registry = Arc::new(HypothesisRegistry::open(&config.database_path, &config).unwrap());
        let feed = Arc::new(JsonDirectorySource::new(&feed_dir));
        let workers: Vec<Box<dyn Worker>> = vec![
            Box::new(OriginationWorker::new(registry.clone(), feed.clone(), feed.clone())),
            Box::new(GateLockWorker::new(registry.clone(), WorkerConfig::default())),
            Box::new(ExperimentationWorker::new(
                registry.clone(),
                feed.clone(),
                feed.clone(),
                WorkerConfig::default(),
            )),
        ];
        for worker in &workers {
            let report = worker.run_once().unwrap();
            assert!(report.failures.is_empty(), "{:?}", report.failures);
        }
    }

    let reopened = HypothesisRegistry::open(&config.database_path, &config).unwrap();
    let h = reopened.require(&code).unwrap();
    assert_eq!(h.state, HypothesisState::Active);
    assert_eq!(h.current_tier, Some(Tier::Two));
    assert!(h.pre_validation_passed);
    assert!(h.pre_registration_timestamp.is_some());
    assert!((h.confidence() - 0.63).abs() < 1e-9);

    let experiments = reopened.experiments(&code).unwrap();
    assert_eq!(experiments.len(), 1);
    assert_eq!(experiments[0].trial_class, TrialClass::FalsificationSweep);
    assert!(reopened.dataset_used(&code, "ds-int-2024q1").unwrap());
    assert!(reopened.application(&experiments[0].id).unwrap().is_some());
    assert!(reopened.reconcile().unwrap().is_empty());
}

fn engine_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_hypothesis-engine"))
}

fn run_cli(db: &Path, args: &[&str]) -> serde_json::Value {
    let output = Command::new(engine_binary())
        .arg("--db")
        .arg(db)
        .args(args)
        .env_remove("HYPOTHESIS_CONFIG_PATH")
        .env("RUST_LOG", "error")
        .output()
        .expect("Failed to run hypothesis-engine");
    assert!(
        output.status.success(),
        "{:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).unwrap_or(serde_json::Value::Null)
}

#[test]
fn test_cli_run_cycle_and_show() {
    let dir = TempDir::new().unwrap();
    let feed_dir = dir.path().join("feed");
    write_feed(&feed_dir);
    let db = dir.path().join("cli.db");
    let feed = feed_dir.to_string_lossy().to_string();

    run_cli(&db, &["init"]);

    let reports = run_cli(&db, &["run-cycle", "--feed-dir", &feed]);
    let reports = reports.as_array().unwrap();
    assert_eq!(reports.len(), 4);
    assert_eq!(reports[0]["worker"], "origination");
    assert_eq!(reports[3]["worker"], "eligibility");

    let shown = run_cli(&db, &["show", "--code", CODE]);
    assert_eq!(shown["hypothesis"]["state"], "ACTIVE");
    assert_eq!(shown["experiments"].as_array().unwrap().len(), 1);
    assert_eq!(shown["guardrail"]["degrees_of_freedom"], 1);
    assert_eq!(shown["eligibility"]["eligible"], false);

    let rates = run_cli(&db, &["death-rates"]);
    assert_eq!(rates[0]["experiments"], 1);

    let retired = run_cli(&db, &["retire", "--code", CODE]);
    assert_eq!(retired["state"], "RETIRED");
}
