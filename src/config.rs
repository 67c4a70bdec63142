//! Configuration surface.
//!
//! All tunables are supplied externally (YAML file, `VIGIL_HOME` env
//! override for the state directory) and validated exactly once at
//! startup. The core never parses arbitrary external schemas beyond this
//! file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::domain::WeightBounds;

/// Circuit breaker tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Rolling failures within the window that open the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Observation window for the rolling failure count
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,

    /// Base cool-down after the circuit opens
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,

    /// Ceiling for the doubling cool-down
    #[serde(default = "default_cooldown_ceiling")]
    pub cooldown_ceiling_seconds: u64,
}

fn default_failure_threshold() -> u32 {
    3
}
fn default_window_seconds() -> u64 {
    300
}
fn default_cooldown_seconds() -> u64 {
    300
}
fn default_cooldown_ceiling() -> u64 {
    3600
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            window_seconds: default_window_seconds(),
            cooldown_seconds: default_cooldown_seconds(),
            cooldown_ceiling_seconds: default_cooldown_ceiling(),
        }
    }
}

/// Healing loop tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealingConfig {
    /// Hard cap on adapter invocations per operation
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Per-kind overrides for the attempt cap (capability name -> cap)
    #[serde(default)]
    pub max_attempts_per_kind: HashMap<String, u32>,

    /// Pause before a same-provider retry
    #[serde(default = "default_retry_pause_ms")]
    pub retry_pause_ms: u64,

    /// When set, quarantined units are revisited once after this interval
    #[serde(default)]
    pub quarantine_revisit_minutes: Option<u64>,
}

fn default_max_attempts() -> u32 {
    6
}
fn default_retry_pause_ms() -> u64 {
    2000
}

impl Default for HealingConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            max_attempts_per_kind: HashMap::new(),
            retry_pause_ms: default_retry_pause_ms(),
            quarantine_revisit_minutes: None,
        }
    }
}

impl HealingConfig {
    /// Attempt ceiling for a capability, falling back to the global cap
    pub fn attempt_ceiling(&self, capability: &str) -> u32 {
        self.max_attempts_per_kind
            .get(capability)
            .copied()
            .unwrap_or(self.max_attempts)
    }
}

/// Orchestrator state machine tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Failure rate across components that moves the system to degraded
    #[serde(default = "default_degraded_failure_rate")]
    pub degraded_failure_rate: f64,

    /// Window for the degraded failure-rate calculation
    #[serde(default = "default_degraded_window_seconds")]
    pub degraded_window_seconds: u64,

    /// Simultaneously open circuits that force the critical state
    #[serde(default = "default_critical_open_circuits")]
    pub critical_open_circuits: u32,

    /// A stage with attempts but zero successes for this long is stalled
    #[serde(default = "default_stage_stall_seconds")]
    pub stage_stall_seconds: u64,

    /// Concurrent content units per cycle
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Floor the emergency repair cycle drops concurrency to
    #[serde(default = "default_min_concurrency")]
    pub min_concurrency: usize,

    /// Concurrent in-flight calls per component (default 1: serialized)
    #[serde(default)]
    pub component_concurrency: HashMap<String, usize>,

    /// Bounded wait for every collaborator call
    #[serde(default = "default_call_timeout_seconds")]
    pub call_timeout_seconds: u64,
}

fn default_degraded_failure_rate() -> f64 {
    0.5
}
fn default_degraded_window_seconds() -> u64 {
    600
}
fn default_critical_open_circuits() -> u32 {
    2
}
fn default_stage_stall_seconds() -> u64 {
    1800
}
fn default_concurrency() -> usize {
    4
}
fn default_min_concurrency() -> usize {
    1
}
fn default_call_timeout_seconds() -> u64 {
    120
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            degraded_failure_rate: default_degraded_failure_rate(),
            degraded_window_seconds: default_degraded_window_seconds(),
            critical_open_circuits: default_critical_open_circuits(),
            stage_stall_seconds: default_stage_stall_seconds(),
            concurrency: default_concurrency(),
            min_concurrency: default_min_concurrency(),
            component_concurrency: HashMap::new(),
            call_timeout_seconds: default_call_timeout_seconds(),
        }
    }
}

impl OrchestratorConfig {
    /// Concurrency limit for one component; unlisted components serialize
    pub fn component_limit(&self, component: &str) -> usize {
        self.component_concurrency
            .get(component)
            .copied()
            .unwrap_or(1)
            .max(1)
    }
}

/// Self-improver tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImproverConfig {
    /// EMA smoothing factor for weight updates
    #[serde(default = "default_alpha")]
    pub alpha: f64,

    /// Outcomes required before a weight can move off the default
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,

    /// Trailing window the improver aggregates over
    #[serde(default = "default_improver_window_hours")]
    pub window_hours: u64,

    /// Blend factors for the niche composite score
    #[serde(default = "default_yield_weight")]
    pub yield_weight: f64,
    #[serde(default = "default_volume_weight")]
    pub volume_weight: f64,

    /// Weight bounds (exploration floor and ceiling)
    #[serde(default)]
    pub bounds: WeightBounds,
}

fn default_alpha() -> f64 {
    0.2
}
fn default_min_samples() -> usize {
    5
}
fn default_improver_window_hours() -> u64 {
    24
}
fn default_yield_weight() -> f64 {
    0.7
}
fn default_volume_weight() -> f64 {
    0.3
}

impl Default for ImproverConfig {
    fn default() -> Self {
        Self {
            alpha: default_alpha(),
            min_samples: default_min_samples(),
            window_hours: default_improver_window_hours(),
            yield_weight: default_yield_weight(),
            volume_weight: default_volume_weight(),
            bounds: WeightBounds::default(),
        }
    }
}

/// Revenue allocation ratios, carried for the downstream financial policy
///
/// The core validates them once and exposes them read-only; it never
/// moves money itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationConfig {
    #[serde(default = "default_reinvest")]
    pub reinvest: f64,
    #[serde(default = "default_reserve")]
    pub reserve: f64,
    #[serde(default = "default_payout")]
    pub payout: f64,
}

fn default_reinvest() -> f64 {
    0.5
}
fn default_reserve() -> f64 {
    0.3
}
fn default_payout() -> f64 {
    0.2
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            reinvest: default_reinvest(),
            reserve: default_reserve(),
            payout: default_payout(),
        }
    }
}

/// One provider entry in a capability ranking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSpec {
    /// Component name (unique across the whole config)
    pub name: String,

    /// Program the command adapter executes
    pub command: String,

    /// Fixed arguments passed before the capability name
    #[serde(default)]
    pub args: Vec<String>,
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub breaker: BreakerConfig,

    #[serde(default)]
    pub healing: HealingConfig,

    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    #[serde(default)]
    pub improver: ImproverConfig,

    #[serde(default)]
    pub allocation: AllocationConfig,

    /// capability name -> ranked providers
    #[serde(default)]
    pub providers: HashMap<String, Vec<ProviderSpec>>,

    /// Content niches the discovery stage selects from
    #[serde(default)]
    pub niches: Vec<String>,

    /// Nearby-alternative topic substitutions for degraded retries
    #[serde(default)]
    pub fallback_topics: HashMap<String, String>,
}

impl Config {
    /// Load and validate a configuration file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self =
            serde_yaml::from_str(&content).context("Failed to parse config YAML")?;
        config.validate()?;

        Ok(config)
    }

    /// Validate all tunables; called once at startup
    pub fn validate(&self) -> Result<()> {
        if self.breaker.failure_threshold == 0 {
            anyhow::bail!("breaker.failure_threshold must be at least 1");
        }
        if self.breaker.window_seconds == 0 {
            anyhow::bail!("breaker.window_seconds must be positive");
        }
        if self.breaker.cooldown_ceiling_seconds < self.breaker.cooldown_seconds {
            anyhow::bail!("breaker.cooldown_ceiling_seconds must be >= cooldown_seconds");
        }

        if self.healing.max_attempts == 0 {
            anyhow::bail!("healing.max_attempts must be at least 1");
        }

        let orch = &self.orchestrator;
        if !(0.0..=1.0).contains(&orch.degraded_failure_rate) {
            anyhow::bail!("orchestrator.degraded_failure_rate must be within [0, 1]");
        }
        if orch.concurrency == 0 {
            anyhow::bail!("orchestrator.concurrency must be at least 1");
        }
        if orch.min_concurrency == 0 || orch.min_concurrency > orch.concurrency {
            anyhow::bail!(
                "orchestrator.min_concurrency must be within [1, concurrency]"
            );
        }
        if orch.call_timeout_seconds == 0 {
            anyhow::bail!("orchestrator.call_timeout_seconds must be positive");
        }

        let imp = &self.improver;
        if !(0.0..=1.0).contains(&imp.alpha) {
            anyhow::bail!("improver.alpha must be within [0, 1]");
        }
        if imp.bounds.min <= 0.0 {
            anyhow::bail!("improver.bounds.min must be positive (exploration floor)");
        }
        if imp.bounds.min >= imp.bounds.max {
            anyhow::bail!("improver.bounds.min must be below bounds.max");
        }
        if imp.bounds.default < imp.bounds.min || imp.bounds.default > imp.bounds.max {
            anyhow::bail!("improver.bounds.default must sit within [min, max]");
        }

        let alloc = &self.allocation;
        let total = alloc.reinvest + alloc.reserve + alloc.payout;
        if (total - 1.0).abs() > 1e-6 {
            anyhow::bail!("allocation ratios must sum to 1.0 (got {total})");
        }
        if alloc.reinvest < 0.0 || alloc.reserve < 0.0 || alloc.payout < 0.0 {
            anyhow::bail!("allocation ratios must be non-negative");
        }

        // Provider names must be unique across capabilities: they key the
        // breaker registry and the weight table.
        let mut seen = std::collections::HashSet::new();
        for (capability, specs) in &self.providers {
            if specs.is_empty() {
                anyhow::bail!("capability '{capability}' has an empty provider list");
            }
            for spec in specs {
                if !seen.insert(spec.name.as_str()) {
                    anyhow::bail!("duplicate provider name '{}'", spec.name);
                }
            }
        }

        Ok(())
    }
}

/// State directory: `$VIGIL_HOME` or `~/.vigil`
pub fn home_dir() -> Result<PathBuf> {
    if let Ok(home) = std::env::var("VIGIL_HOME") {
        return Ok(PathBuf::from(home));
    }

    let home = dirs::home_dir().context("Failed to determine home directory")?;
    Ok(home.join(".vigil"))
}

/// Ledger directory ($VIGIL_HOME/ledger)
pub fn ledger_dir() -> Result<PathBuf> {
    Ok(home_dir()?.join("ledger"))
}

/// Mutable state directory ($VIGIL_HOME/state)
pub fn state_dir() -> Result<PathBuf> {
    Ok(home_dir()?.join("state"))
}

/// Directory the external metrics collector drops files into
pub fn metrics_dir() -> Result<PathBuf> {
    Ok(home_dir()?.join("metrics"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_allocation_must_sum_to_one() {
        let mut config = Config::default();
        config.allocation.reinvest = 0.9;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("sum to 1.0"));
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let mut config = Config::default();
        config.breaker.failure_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cooldown_ceiling_must_cover_base() {
        let mut config = Config::default();
        config.breaker.cooldown_seconds = 600;
        config.breaker.cooldown_ceiling_seconds = 300;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_exploration_floor_must_be_positive() {
        let mut config = Config::default();
        config.improver.bounds.min = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_provider_names_rejected() {
        let mut config = Config::default();
        let spec = ProviderSpec {
            name: "alpha_llm".to_string(),
            command: "alpha".to_string(),
            args: vec![],
        };
        config
            .providers
            .insert("script".to_string(), vec![spec.clone()]);
        config.providers.insert("voice".to_string(), vec![spec]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml = r#"
breaker:
  failure_threshold: 3
  window_seconds: 300
  cooldown_seconds: 120
  cooldown_ceiling_seconds: 1920

healing:
  max_attempts: 5
  max_attempts_per_kind:
    publish: 8

orchestrator:
  concurrency: 2
  component_concurrency:
    mainstream_video: 2

providers:
  script:
    - name: alpha_llm
      command: alpha-cli
      args: ["--fast"]
    - name: beta_llm
      command: beta-cli

niches: [survival, wealth]

fallback_topics:
  "solar storms": "grid failures"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.breaker.cooldown_seconds, 120);
        assert_eq!(config.healing.attempt_ceiling("publish"), 8);
        assert_eq!(config.healing.attempt_ceiling("script"), 5);
        assert_eq!(config.orchestrator.component_limit("mainstream_video"), 2);
        assert_eq!(config.orchestrator.component_limit("anything_else"), 1);
        assert_eq!(config.providers["script"].len(), 2);
        assert_eq!(
            config.fallback_topics["solar storms"],
            "grid failures"
        );
    }

    #[test]
    fn test_env_home_override() {
        std::env::set_var("VIGIL_HOME", "/tmp/vigil-test-home");
        let home = home_dir().unwrap();
        assert_eq!(home, PathBuf::from("/tmp/vigil-test-home"));
        std::env::remove_var("VIGIL_HOME");
    }
}
