//! Operations: one attempted unit of pipeline work.
//!
//! An operation is created when a stage begins work on a content unit and
//! reaches exactly one terminal status. Only the orchestrator and the
//! policy engine mutate it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// The kind of work an operation performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Find a topic worth producing
    Discover,

    /// Generate a script for a topic
    ScriptGen,

    /// Synthesize narration audio
    VoiceGen,

    /// Assemble the final video from script and audio
    VideoAssemble,

    /// Publish a finished unit to a platform
    Publish,

    /// Collect downstream outcome numbers for a published unit
    MetricsCollect,
}

impl OperationKind {
    /// Capability name used to look up ranked providers
    pub fn capability(&self) -> &'static str {
        match self {
            OperationKind::Discover => "discovery",
            OperationKind::ScriptGen => "script",
            OperationKind::VoiceGen => "voice",
            OperationKind::VideoAssemble => "video",
            OperationKind::Publish => "publish",
            OperationKind::MetricsCollect => "metrics",
        }
    }

    /// Whether the unit of work can be split into smaller sub-units
    ///
    /// Scripts split at sentence boundaries; video assembly splits into
    /// segments. Discovery, narration, publishing and metrics are atomic.
    pub fn supports_decomposition(&self) -> bool {
        matches!(self, OperationKind::ScriptGen | OperationKind::VideoAssemble)
    }

    /// All kinds in pipeline order
    pub fn all() -> &'static [OperationKind] {
        &[
            OperationKind::Discover,
            OperationKind::ScriptGen,
            OperationKind::VoiceGen,
            OperationKind::VideoAssemble,
            OperationKind::Publish,
            OperationKind::MetricsCollect,
        ]
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.capability())
    }
}

/// Status of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Created, not yet resolved
    Pending,

    /// Succeeded on the first attempt
    Success,

    /// Last attempt failed; healing in progress
    Failed,

    /// Succeeded after at least one healing strategy
    Healed,

    /// Quarantined: permanently given up, pipeline continued without it
    Abandoned,
}

impl OperationStatus {
    /// Terminal statuses end the operation's lifecycle
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationStatus::Success | OperationStatus::Healed | OperationStatus::Abandoned
        )
    }
}

/// One attempted unit of pipeline work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    /// Unique identifier
    pub id: Uuid,

    /// What this operation does
    pub kind: OperationKind,

    /// Component (provider/platform) currently assigned to it
    pub component: String,

    /// Content unit this operation belongs to
    pub unit_id: String,

    /// Fingerprint of the original input (16 hex chars of SHA256)
    pub fingerprint: String,

    /// Number of adapter invocations so far
    pub attempts: u32,

    /// Current status
    pub status: OperationStatus,

    /// When the operation was created
    pub created_at: DateTime<Utc>,

    /// When the operation reached a terminal status
    pub completed_at: Option<DateTime<Utc>>,
}

impl Operation {
    /// Create a pending operation for a stage beginning work
    pub fn new(kind: OperationKind, component: &str, unit_id: &str, input: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            component: component.to_string(),
            unit_id: unit_id.to_string(),
            fingerprint: fingerprint(input),
            attempts: 0,
            status: OperationStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Move to a terminal status
    ///
    /// A terminal operation is never re-resolved; a second call is a
    /// no-op so replayed healing paths cannot flip the outcome.
    pub fn resolve(&mut self, status: OperationStatus) {
        debug_assert!(status.is_terminal());
        if self.status.is_terminal() {
            return;
        }
        self.status = status;
        self.completed_at = Some(Utc::now());
    }
}

/// Fingerprint input content (first 16 hex chars of SHA256)
pub fn fingerprint(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_consistency() {
        let a = fingerprint("storm prep checklist");
        let b = fingerprint("storm prep checklist");
        let c = fingerprint("different topic");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn test_new_operation_is_pending() {
        let op = Operation::new(OperationKind::ScriptGen, "alpha_llm", "unit-1", "topic");
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.attempts, 0);
        assert!(op.completed_at.is_none());
    }

    #[test]
    fn test_resolve_is_single_shot() {
        let mut op = Operation::new(OperationKind::Publish, "mainstream", "unit-1", "video");
        op.resolve(OperationStatus::Healed);
        assert_eq!(op.status, OperationStatus::Healed);

        // Second terminal transition does not overwrite the first
        op.resolve(OperationStatus::Abandoned);
        assert_eq!(op.status, OperationStatus::Healed);
    }

    #[test]
    fn test_decomposition_support() {
        assert!(OperationKind::ScriptGen.supports_decomposition());
        assert!(OperationKind::VideoAssemble.supports_decomposition());
        assert!(!OperationKind::Publish.supports_decomposition());
        assert!(!OperationKind::VoiceGen.supports_decomposition());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(OperationStatus::Success.is_terminal());
        assert!(OperationStatus::Healed.is_terminal());
        assert!(OperationStatus::Abandoned.is_terminal());
        assert!(!OperationStatus::Pending.is_terminal());
        assert!(!OperationStatus::Failed.is_terminal());
    }
}
