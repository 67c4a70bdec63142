//! Circuit breaker registry.
//!
//! One `ComponentHealth` record per named component, owned exclusively by
//! this registry and mutated under a single lock so concurrent outcome
//! reports cannot lose counter updates. State survives restarts through a
//! JSON store keyed by component name (last write wins).

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::BreakerConfig;
use crate::domain::{CircuitState, ComponentHealth, ComponentStatus};

/// Per-component failure tracking with open/half-open/closed state
pub struct BreakerRegistry {
    config: BreakerConfig,
    components: Mutex<HashMap<String, ComponentHealth>>,

    /// When set, health is persisted here after every mutation
    store_path: Option<PathBuf>,
}

impl BreakerRegistry {
    /// In-memory registry (tests, ephemeral runs)
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            components: Mutex::new(HashMap::new()),
            store_path: None,
        }
    }

    /// Registry persisted at `path`, restoring any previous state
    pub async fn with_store(config: BreakerConfig, path: PathBuf) -> Result<Self> {
        let components = if path.exists() {
            let content = fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read health store: {}", path.display()))?;
            serde_json::from_str(&content).context("Failed to parse health store JSON")?
        } else {
            HashMap::new()
        };

        Ok(Self {
            config,
            components: Mutex::new(components),
            store_path: Some(path),
        })
    }

    /// Record the outcome of one call to a component
    pub async fn record_outcome(&self, component: &str, success: bool) {
        self.record_outcome_at(component, success, Utc::now()).await
    }

    /// Outcome recording with an explicit clock, for deterministic tests
    pub async fn record_outcome_at(&self, component: &str, success: bool, now: DateTime<Utc>) {
        let mut components = self.components.lock().await;
        let health = components
            .entry(component.to_string())
            .or_insert_with(|| ComponentHealth::new(self.config.cooldown_seconds));

        if success {
            match health.state {
                CircuitState::HalfOpen => {
                    // Successful trial: close fully and forget history
                    *health = ComponentHealth::new(self.config.cooldown_seconds);
                    info!(component, "circuit closed (trial call succeeded)");
                }
                _ => {
                    health.consecutive_failures = 0;
                    health.probe_in_flight = false;
                }
            }
        } else {
            health.consecutive_failures += 1;
            health.failure_times.push(now);
            health.prune_window(now, self.config.window_seconds);

            match health.state {
                CircuitState::Closed => {
                    // Rolling count within the window is the primary
                    // trigger; the consecutive guard keeps slow-burn
                    // failure runs from sitting closed forever.
                    if health.rolling_count() >= self.config.failure_threshold
                        || health.consecutive_failures >= self.config.failure_threshold
                    {
                        health.state = CircuitState::Open;
                        health.opened_at = Some(now);
                        warn!(
                            component,
                            failures = health.rolling_count(),
                            cooldown_s = health.cooldown_seconds,
                            "circuit opened"
                        );
                    }
                }
                CircuitState::HalfOpen => {
                    // Failed trial: reopen and double the cool-down
                    health.state = CircuitState::Open;
                    health.opened_at = Some(now);
                    health.probe_in_flight = false;
                    health.cooldown_seconds = (health.cooldown_seconds * 2)
                        .min(self.config.cooldown_ceiling_seconds);
                    warn!(
                        component,
                        cooldown_s = health.cooldown_seconds,
                        "circuit reopened (trial call failed)"
                    );
                }
                CircuitState::Open => {}
            }
        }

        self.persist(&components).await;
    }

    /// Whether calls to a component must be short-circuited
    ///
    /// An open circuit whose cool-down has elapsed moves to half-open and
    /// hands out exactly one trial call; every other caller keeps getting
    /// short-circuited until the trial resolves.
    pub async fn is_open(&self, component: &str) -> bool {
        self.is_open_at(component, Utc::now()).await
    }

    /// Gate check with an explicit clock, for deterministic tests
    pub async fn is_open_at(&self, component: &str, now: DateTime<Utc>) -> bool {
        let mut components = self.components.lock().await;

        // Zero recorded history: treated as closed
        let Some(health) = components.get_mut(component) else {
            return false;
        };

        let open = match health.state {
            CircuitState::Closed => false,
            CircuitState::HalfOpen => {
                if health.probe_in_flight {
                    true
                } else {
                    health.probe_in_flight = true;
                    false
                }
            }
            CircuitState::Open => {
                if health.cooldown_elapsed(now) {
                    health.state = CircuitState::HalfOpen;
                    health.probe_in_flight = true;
                    info!(component, "circuit half-open (cool-down elapsed)");
                    false
                } else {
                    true
                }
            }
        };

        self.persist(&components).await;
        open
    }

    /// Operator override: close the circuit regardless of state
    pub async fn reset(&self, component: &str) {
        let mut components = self.components.lock().await;
        components.insert(
            component.to_string(),
            ComponentHealth::new(self.config.cooldown_seconds),
        );
        info!(component, "circuit manually reset");
        self.persist(&components).await;
    }

    /// Emergency repair: close every open circuit past its cool-down
    ///
    /// Returns the number of circuits closed.
    pub async fn force_reset_expired(&self) -> usize {
        self.force_reset_expired_at(Utc::now()).await
    }

    pub async fn force_reset_expired_at(&self, now: DateTime<Utc>) -> usize {
        let mut components = self.components.lock().await;
        let mut closed = 0;

        for (name, health) in components.iter_mut() {
            if health.state != CircuitState::Closed && health.cooldown_elapsed(now) {
                *health = ComponentHealth::new(self.config.cooldown_seconds);
                info!(component = %name, "circuit force-reset");
                closed += 1;
            }
        }

        self.persist(&components).await;
        closed
    }

    /// Current circuit state of a component
    pub async fn state_of(&self, component: &str) -> CircuitState {
        let components = self.components.lock().await;
        components
            .get(component)
            .map(|h| h.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Clone of one component's full health record
    pub async fn health_of(&self, component: &str) -> Option<ComponentHealth> {
        let components = self.components.lock().await;
        components.get(component).cloned()
    }

    /// Components currently in the open state
    pub async fn open_count(&self) -> u32 {
        let components = self.components.lock().await;
        components
            .values()
            .filter(|h| h.state == CircuitState::Open)
            .count() as u32
    }

    /// Per-component status for health snapshots (sorted by name)
    pub async fn snapshot(&self) -> BTreeMap<String, ComponentStatus> {
        let components = self.components.lock().await;
        components
            .iter()
            .map(|(name, health)| {
                (
                    name.clone(),
                    ComponentStatus {
                        state: health.state,
                        consecutive_failures: health.consecutive_failures,
                        rolling_failures: health.rolling_count(),
                    },
                )
            })
            .collect()
    }

    async fn persist(&self, components: &HashMap<String, ComponentHealth>) {
        let Some(path) = &self.store_path else {
            return;
        };

        let result: Result<()> = async {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
            let content = serde_json::to_string_pretty(components)?;
            fs::write(path, content).await?;
            Ok(())
        }
        .await;

        if let Err(e) = result {
            warn!(error = %e, "failed to persist component health");
        }
    }
}
