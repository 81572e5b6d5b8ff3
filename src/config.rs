//! Engine configuration
//!
//! Thresholds for every component, loaded from TOML. Every field has a
//! default so partial files load.

use crate::economy::confidence::ConfidenceConfig;
use crate::economy::eligibility::EligibilityConfig;
use crate::economy::experimentation::TierConfig;
use crate::economy::guardrail::GuardrailConfig;
use crate::economy::pre_validation::GateConfig;
use crate::economy::workers::WorkerConfig;
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// SQLite registry database
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Pre-validation gate thresholds
    #[serde(default)]
    pub gate: GateConfig,

    /// Tier criteria and trial plans
    #[serde(default)]
    pub tiers: TierConfig,

    /// Degrees-of-freedom ceiling
    #[serde(default)]
    pub guardrail: GuardrailConfig,

    #[serde(default)]
    pub confidence: ConfidenceConfig,

    /// Paper-trading eligibility floors
    #[serde(default)]
    pub eligibility: EligibilityConfig,

    /// Batch worker claims
    #[serde(default)]
    pub workers: WorkerConfig,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("hypotheses.db")
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            gate: GateConfig::default(),
            tiers: TierConfig::default(),
            guardrail: GuardrailConfig::default(),
            confidence: ConfidenceConfig::default(),
            eligibility: EligibilityConfig::default(),
            workers: WorkerConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load from TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }

    /// Load from `HYPOTHESIS_CONFIG_PATH` or the default path, falling back
    /// to defaults, then apply the `HYPOTHESIS_DB_PATH` override.
    pub fn from_env() -> Self {
        let path = std::env::var("HYPOTHESIS_CONFIG_PATH")
            .unwrap_or_else(|_| "hypothesis_engine.toml".to_string());

        let mut config = Self::load(&path).unwrap_or_else(|e| {
            tracing::debug!("Using default engine config ({}): {:#}", path, e);
            Self::default()
        });
        if let Ok(db) = std::env::var("HYPOTHESIS_DB_PATH") {
            config.database_path = PathBuf::from(db);
        }
        config
    }

    /// Save to TOML file
    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Rejects incoherent thresholds.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.gate.min_sample_size == 0 {
            errors.push("gate.min_sample_size must be positive".to_string());
        }
        if !(self.gate.max_deflated_sharpe.is_finite() && self.gate.max_deflated_sharpe > 0.0) {
            errors.push("gate.max_deflated_sharpe must be positive".to_string());
        }
        if self.eligibility.min_experiments == 0 {
            errors.push("eligibility.min_experiments must be positive".to_string());
        }

        let sections = [
            ("tiers", self.tiers.validate()),
            ("guardrail", self.guardrail.validate()),
            ("confidence", self.confidence.validate()),
            ("eligibility", self.eligibility.validate()),
            ("workers", self.workers.validate()),
        ];
        for (section, result) in sections {
            if let Err(e) = result {
                errors.push(format!("{}: {}", section, e));
            }
        }

        if !errors.is_empty() {
            bail!("Invalid engine config: {}", errors.join("; "));
        }
        Ok(())
    }
}
