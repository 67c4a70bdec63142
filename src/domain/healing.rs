//! Healing strategies and their audit records.
//!
//! Every remediation attempt for a failed operation is recorded as a
//! HealingEvent, appended to the run ledger. The events for one operation
//! are ordered by rank.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A remediation strategy, in escalating order of destructiveness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Retry the same provider with the same input after a short pause
    RetrySame,

    /// Deterministically reduce input complexity, retry on the same provider
    SimplifyRetry,

    /// Substitute a semantically nearby alternative input
    ProxySubstitute,

    /// Split the unit of work into smaller sub-units and retry each
    DecomposeRetry,

    /// Move to the next-ranked provider with the original input
    FailOverProvider,

    /// Give up on this unit permanently; the run continues without it
    Quarantine,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Strategy::RetrySame => "retry_same",
            Strategy::SimplifyRetry => "simplify_retry",
            Strategy::ProxySubstitute => "proxy_substitute",
            Strategy::DecomposeRetry => "decompose_retry",
            Strategy::FailOverProvider => "fail_over_provider",
            Strategy::Quarantine => "quarantine",
        };
        write!(f, "{name}")
    }
}

/// Outcome of one applied strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealingOutcome {
    /// The retried operation succeeded
    Recovered,

    /// The strategy did not resolve the failure
    StillFailed,
}

/// Audit record of one remediation attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealingEvent {
    /// Operation this event belongs to
    pub operation_id: Uuid,

    /// Strategy that was applied
    pub strategy: Strategy,

    /// Position in the operation's healing sequence (0-based)
    pub rank: u32,

    /// What happened
    pub outcome: HealingOutcome,

    /// When the strategy resolved
    pub timestamp: DateTime<Utc>,
}

impl HealingEvent {
    pub fn new(operation_id: Uuid, strategy: Strategy, rank: u32, outcome: HealingOutcome) -> Self {
        Self {
            operation_id,
            strategy,
            rank,
            outcome,
            timestamp: Utc::now(),
        }
    }
}
