//! Configuration for foreman, read from `.foreman/foreman.toml`.
//!
//! Layering is file → environment → CLI. Every field is defaulted, so a
//! missing file (or a partial one) yields a usable configuration.
//!
//! # Configuration File Format
//!
//! ```toml
//! [project]
//! name = "checkout-service"
//!
//! [evidence]
//! require_coverage = true
//! min_coverage = 85.0
//! allow_skipped_tests = false
//! min_pass_rate = 100.0
//!
//! [context]
//! flash_save_threshold = 144000
//! flash_save_max_tokens = 180000
//! cold_after_turns = 3
//! promote_to = "hot"
//!
//! [orchestrator]
//! max_workers = 4
//! max_agents = 10
//! task_retry_budget = 2
//! provider_retry_budget = 3
//! provider_timeout_secs = 600
//! skills = ["rust", "sql"]
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::context::{FlashSaveConfig, PromotionTier, TierPolicy};
use crate::errors::ForemanError;
use crate::evidence::EvidencePolicy;
use crate::orchestrator::OrchestratorConfig;

/// Name of the per-project data directory.
pub const FOREMAN_DIR: &str = ".foreman";
/// Config file inside [`FOREMAN_DIR`].
pub const CONFIG_FILE: &str = "foreman.toml";

pub const ENV_REQUIRE_COVERAGE: &str = "FOREMAN_REQUIRE_COVERAGE";
pub const ENV_MIN_COVERAGE: &str = "FOREMAN_MIN_COVERAGE";
pub const ENV_ALLOW_SKIPPED_TESTS: &str = "FOREMAN_ALLOW_SKIPPED_TESTS";
pub const ENV_MIN_PASS_RATE: &str = "FOREMAN_MIN_PASS_RATE";
pub const ENV_FLASH_SAVE_THRESHOLD: &str = "FOREMAN_FLASH_SAVE_THRESHOLD";
pub const ENV_FLASH_SAVE_MAX_TOKENS: &str = "FOREMAN_FLASH_SAVE_MAX_TOKENS";
pub const ENV_MAX_WORKERS: &str = "FOREMAN_MAX_WORKERS";
pub const ENV_TASK_RETRY_BUDGET: &str = "FOREMAN_TASK_RETRY_BUDGET";
pub const ENV_PROVIDER_RETRY_BUDGET: &str = "FOREMAN_PROVIDER_RETRY_BUDGET";
pub const ENV_PROVIDER_TIMEOUT_SECS: &str = "FOREMAN_PROVIDER_TIMEOUT_SECS";
pub const ENV_COLD_AFTER_TURNS: &str = "FOREMAN_COLD_AFTER_TURNS";
pub const ENV_PROMOTE_TO: &str = "FOREMAN_PROMOTE_TO";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectSection {
    pub name: Option<String>,
}

/// Evidence gate thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceSection {
    #[serde(default = "default_require_coverage")]
    pub require_coverage: bool,
    #[serde(default = "default_min_coverage")]
    pub min_coverage: f64,
    #[serde(default)]
    pub allow_skipped_tests: bool,
    #[serde(default = "default_min_pass_rate")]
    pub min_pass_rate: f64,
}

fn default_require_coverage() -> bool {
    true
}

fn default_min_coverage() -> f64 {
    85.0
}

fn default_min_pass_rate() -> f64 {
    100.0
}

impl Default for EvidenceSection {
    fn default() -> Self {
        Self {
            require_coverage: default_require_coverage(),
            min_coverage: default_min_coverage(),
            allow_skipped_tests: false,
            min_pass_rate: default_min_pass_rate(),
        }
    }
}

/// Context tiering and flash-save settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSection {
    #[serde(default = "default_flash_save_threshold")]
    pub flash_save_threshold: usize,
    #[serde(default = "default_flash_save_max_tokens")]
    pub flash_save_max_tokens: usize,
    #[serde(default = "default_cold_after_turns")]
    pub cold_after_turns: u32,
    #[serde(default)]
    pub promote_to: PromotionTier,
}

fn default_flash_save_threshold() -> usize {
    144_000
}

fn default_flash_save_max_tokens() -> usize {
    180_000
}

fn default_cold_after_turns() -> u32 {
    3
}

impl Default for ContextSection {
    fn default() -> Self {
        Self {
            flash_save_threshold: default_flash_save_threshold(),
            flash_save_max_tokens: default_flash_save_max_tokens(),
            cold_after_turns: default_cold_after_turns(),
            promote_to: PromotionTier::default(),
        }
    }
}

/// Worker pool and retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSection {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_max_agents")]
    pub max_agents: usize,
    #[serde(default = "default_task_retry_budget")]
    pub task_retry_budget: u32,
    #[serde(default = "default_provider_retry_budget")]
    pub provider_retry_budget: u32,
    #[serde(default = "default_provider_timeout_secs")]
    pub provider_timeout_secs: u64,
    #[serde(default = "default_subagent_context_tokens")]
    pub subagent_context_tokens: usize,
    /// Skills advertised to the provider on every call.
    #[serde(default)]
    pub skills: Vec<String>,
}

fn default_max_workers() -> usize {
    4
}

fn default_max_agents() -> usize {
    10
}

fn default_task_retry_budget() -> u32 {
    2
}

fn default_provider_retry_budget() -> u32 {
    3
}

fn default_provider_timeout_secs() -> u64 {
    600
}

fn default_subagent_context_tokens() -> usize {
    4_000
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            max_agents: default_max_agents(),
            task_retry_budget: default_task_retry_budget(),
            provider_retry_budget: default_provider_retry_budget(),
            provider_timeout_secs: default_provider_timeout_secs(),
            subagent_context_tokens: default_subagent_context_tokens(),
            skills: Vec::new(),
        }
    }
}

/// Contents of `foreman.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForemanToml {
    #[serde(default)]
    pub project: ProjectSection,
    #[serde(default)]
    pub evidence: EvidenceSection,
    #[serde(default)]
    pub context: ContextSection,
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
}

impl ForemanToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse foreman.toml")
    }

    /// Load `.foreman/foreman.toml`, or defaults if the file doesn't exist.
    pub fn load_or_default(foreman_dir: &Path) -> Result<Self> {
        let config_path = foreman_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize foreman.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `FOREMAN_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ForemanError> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Apply `FOREMAN_*` overrides using `lookup` to read variables.
    ///
    /// A value that fails to parse is an error naming the variable; it is
    /// never silently replaced by the default.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<(), ForemanError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let ev = &mut self.evidence;
        override_from(&lookup, ENV_REQUIRE_COVERAGE, &mut ev.require_coverage, parse_bool)?;
        override_from(&lookup, ENV_MIN_COVERAGE, &mut ev.min_coverage, parse_from_str)?;
        override_from(&lookup, ENV_ALLOW_SKIPPED_TESTS, &mut ev.allow_skipped_tests, parse_bool)?;
        override_from(&lookup, ENV_MIN_PASS_RATE, &mut ev.min_pass_rate, parse_from_str)?;

        let cx = &mut self.context;
        override_from(&lookup, ENV_FLASH_SAVE_THRESHOLD, &mut cx.flash_save_threshold, parse_from_str)?;
        override_from(&lookup, ENV_FLASH_SAVE_MAX_TOKENS, &mut cx.flash_save_max_tokens, parse_from_str)?;
        override_from(&lookup, ENV_COLD_AFTER_TURNS, &mut cx.cold_after_turns, parse_from_str)?;
        override_from(&lookup, ENV_PROMOTE_TO, &mut cx.promote_to, parse_from_str)?;

        let orch = &mut self.orchestrator;
        override_from(&lookup, ENV_MAX_WORKERS, &mut orch.max_workers, parse_from_str)?;
        override_from(&lookup, ENV_TASK_RETRY_BUDGET, &mut orch.task_retry_budget, parse_from_str)?;
        override_from(&lookup, ENV_PROVIDER_RETRY_BUDGET, &mut orch.provider_retry_budget, parse_from_str)?;
        override_from(&lookup, ENV_PROVIDER_TIMEOUT_SECS, &mut orch.provider_timeout_secs, parse_from_str)?;
        Ok(())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if !(0.0..=100.0).contains(&self.evidence.min_coverage) {
            warnings.push(format!(
                "min_coverage {} is outside 0-100",
                self.evidence.min_coverage
            ));
        }
        if !(0.0..=100.0).contains(&self.evidence.min_pass_rate) {
            warnings.push(format!(
                "min_pass_rate {} is outside 0-100",
                self.evidence.min_pass_rate
            ));
        }
        if self.context.flash_save_threshold > self.context.flash_save_max_tokens {
            warnings.push(format!(
                "flash_save_threshold {} exceeds flash_save_max_tokens {}",
                self.context.flash_save_threshold, self.context.flash_save_max_tokens
            ));
        }
        if self.context.cold_after_turns < 2 {
            warnings.push(
                "cold_after_turns below 2 skips the WARM tier entirely".to_string(),
            );
        }
        if self.orchestrator.max_workers == 0 {
            warnings.push("max_workers is 0; no issue will ever be dispatched".to_string());
        }
        if self.orchestrator.max_agents < self.orchestrator.max_workers {
            warnings.push(format!(
                "max_agents {} is below max_workers {}",
                self.orchestrator.max_agents, self.orchestrator.max_workers
            ));
        }

        warnings
    }
}

fn override_from<T, F, P>(lookup: &F, key: &str, slot: &mut T, parse: P) -> Result<(), ForemanError>
where
    F: Fn(&str) -> Option<String>,
    P: Fn(&str) -> Option<T>,
{
    if let Some(raw) = lookup(key) {
        *slot = parse(raw.trim()).ok_or_else(|| {
            ForemanError::validation(format!("environment variable {key} has invalid value '{raw}'"))
        })?;
    }
    Ok(())
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_from_str<T: FromStr>(raw: &str) -> Option<T> {
    raw.parse().ok()
}

/// Resolved configuration for one project directory.
///
/// Merges settings from:
/// 1. foreman.toml
/// 2. Environment variables
/// 3. CLI arguments
#[derive(Debug, Clone)]
pub struct ForemanConfig {
    pub project_dir: PathBuf,
    pub foreman_dir: PathBuf,
    pub toml: ForemanToml,
    /// CLI override for max_workers.
    pub cli_max_workers: Option<usize>,
}

impl ForemanConfig {
    /// Load configuration for `project_dir` (file → environment).
    pub fn new(project_dir: PathBuf) -> Result<Self, ForemanError> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")
            .map_err(|e| ForemanError::validation(format!("{e:#}")))?;
        let foreman_dir = project_dir.join(FOREMAN_DIR);
        let mut toml = ForemanToml::load_or_default(&foreman_dir)
            .map_err(|e| ForemanError::validation(format!("{e:#}")))?;
        toml.apply_env()?;

        Ok(Self {
            project_dir,
            foreman_dir,
            toml,
            cli_max_workers: None,
        })
    }

    pub fn with_cli_args(project_dir: PathBuf, max_workers: Option<usize>) -> Result<Self, ForemanError> {
        let mut config = Self::new(project_dir)?;
        config.cli_max_workers = max_workers;
        Ok(config)
    }

    pub fn db_path(&self) -> PathBuf {
        self.foreman_dir.join("state.db")
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.foreman_dir.join("checkpoints")
    }

    pub fn config_file(&self) -> PathBuf {
        self.foreman_dir.join(CONFIG_FILE)
    }

    pub fn evidence_policy(&self) -> EvidencePolicy {
        let ev = &self.toml.evidence;
        EvidencePolicy {
            require_coverage: ev.require_coverage,
            min_coverage: ev.min_coverage,
            allow_skipped_tests: ev.allow_skipped_tests,
            min_pass_rate: ev.min_pass_rate,
        }
    }

    pub fn flash_save(&self) -> FlashSaveConfig {
        FlashSaveConfig {
            threshold_tokens: self.toml.context.flash_save_threshold,
            max_tokens: self.toml.context.flash_save_max_tokens,
        }
    }

    pub fn tier_policy(&self) -> TierPolicy {
        TierPolicy {
            cold_after_turns: self.toml.context.cold_after_turns,
            promote_to: self.toml.context.promote_to,
        }
    }

    /// Orchestrator settings (CLI → env → file → default).
    pub fn orchestrator(&self) -> OrchestratorConfig {
        let orch = &self.toml.orchestrator;
        OrchestratorConfig {
            max_workers: self.cli_max_workers.unwrap_or(orch.max_workers),
            max_agents: orch.max_agents,
            task_retry_budget: orch.task_retry_budget,
            provider_retry_budget: orch.provider_retry_budget,
            provider_timeout: Duration::from_secs(orch.provider_timeout_secs),
            subagent_context_tokens: orch.subagent_context_tokens,
            skills: orch.skills.clone(),
            ..OrchestratorConfig::default()
        }
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}
