//! Component health, circuit state, and system-wide health snapshots.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Circuit breaker state for one component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, calls flow through
    Closed,

    /// Failing; calls are short-circuited until the cool-down elapses
    Open,

    /// Cool-down elapsed; exactly one trial call is allowed
    HalfOpen,
}

/// Failure-tracking record for one named component
///
/// Owned by the breaker registry; all mutation goes through it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    /// Failures since the last success
    pub consecutive_failures: u32,

    /// Failure timestamps inside the rolling observation window
    pub failure_times: Vec<DateTime<Utc>>,

    /// Current circuit state
    pub state: CircuitState,

    /// When the circuit last opened
    pub opened_at: Option<DateTime<Utc>>,

    /// Current cool-down; doubles on a failed half-open trial, capped
    pub cooldown_seconds: u64,

    /// Whether the single half-open trial call has been handed out
    pub probe_in_flight: bool,
}

impl ComponentHealth {
    /// Fresh health record: closed circuit, no history
    pub fn new(base_cooldown_seconds: u64) -> Self {
        Self {
            consecutive_failures: 0,
            failure_times: Vec::new(),
            state: CircuitState::Closed,
            opened_at: None,
            cooldown_seconds: base_cooldown_seconds,
            probe_in_flight: false,
        }
    }

    /// Drop failure timestamps older than the observation window
    pub fn prune_window(&mut self, now: DateTime<Utc>, window_seconds: u64) {
        let cutoff = now - Duration::seconds(window_seconds as i64);
        self.failure_times.retain(|t| *t > cutoff);
    }

    /// Failures currently inside the rolling window
    pub fn rolling_count(&self) -> u32 {
        self.failure_times.len() as u32
    }

    /// Whether the open-state cool-down has elapsed
    pub fn cooldown_elapsed(&self, now: DateTime<Utc>) -> bool {
        match self.opened_at {
            Some(opened) => now - opened >= Duration::seconds(self.cooldown_seconds as i64),
            None => true,
        }
    }
}

/// Visible operational state of the whole orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemState {
    /// Starting up, loading persisted state
    Initializing,

    /// Steady state
    Running,

    /// A healing attempt is in progress
    Healing,

    /// Sustained failure rate across components
    Degraded,

    /// Cascading failure; human escalation triggered
    Critical,

    /// Operator-invoked pause; in-flight work drains, new work is rejected
    Maintenance,
}

impl std::fmt::Display for SystemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SystemState::Initializing => "initializing",
            SystemState::Running => "running",
            SystemState::Healing => "healing",
            SystemState::Degraded => "degraded",
            SystemState::Critical => "critical",
            SystemState::Maintenance => "maintenance",
        };
        write!(f, "{name}")
    }
}

/// Per-component entry inside a health snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentStatus {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub rolling_failures: u32,
}

/// Point-in-time aggregate of system health
///
/// Produced by the orchestrator, consumed by external alerting and the
/// CLI. Operators see these, never raw per-unit errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// Overall score, 0-100
    pub score: u8,

    /// Visible orchestrator state
    pub state: SystemState,

    /// Per-component circuit status (sorted by name for stable output)
    pub components: BTreeMap<String, ComponentStatus>,

    /// Components currently with an open circuit
    pub open_circuits: u32,

    /// Content units the scheduler currently runs in parallel
    pub active_concurrency: usize,

    /// Healing loops in progress right now
    pub healing_in_flight: usize,

    /// Healing attempts since startup
    pub heals_attempted: u64,

    /// Healing attempts that recovered the operation
    pub heals_recovered: u64,

    /// Units quarantined since startup
    pub units_quarantined: u64,

    /// When the snapshot was taken
    pub taken_at: DateTime<Utc>,
}

impl HealthSnapshot {
    /// Compute the 0-100 score from the snapshot's own indicators
    pub fn compute_score(
        state: SystemState,
        open_circuits: u32,
        recent_quarantines: u64,
    ) -> u8 {
        let mut score: i64 = 100;
        score -= 15 * open_circuits as i64;
        score -= match state {
            SystemState::Degraded => 20,
            SystemState::Critical => 50,
            _ => 0,
        };
        score -= (5 * recent_quarantines as i64).min(20);
        score.clamp(0, 100) as u8
    }
}
