//! Error taxonomy for pipeline operations.
//!
//! Every adapter failure carries a tag that the policy engine maps to an
//! ordered healing strategy chain. Classification is structural, never
//! string matching on error text.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tag attached to every failed collaborator call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Call exceeded its bounded wait
    Timeout,

    /// Provider refused the request rate
    RateLimit,

    /// Provider rejected the input as malformed or disallowed
    Validation,

    /// A referenced asset (clip, voice sample, template) was missing or unusable
    Asset,

    /// Provider is down or its circuit is open
    Unavailable,

    /// Anything the adapter could not tag
    Unknown,
}

impl ErrorKind {
    /// Broad class driving propagation policy and strategy selection
    pub fn class(&self) -> ErrorClass {
        match self {
            ErrorKind::Timeout | ErrorKind::RateLimit => ErrorClass::Transient,
            ErrorKind::Validation | ErrorKind::Asset => ErrorClass::InputQuality,
            ErrorKind::Unavailable => ErrorClass::CapabilityUnavailable,
            ErrorKind::Unknown => ErrorClass::Unknown,
        }
    }
}

/// Propagation classes for pipeline errors
///
/// `Transient` and `InputQuality` are resolved inside the healing loop and
/// never surface past the operation boundary. `CapabilityUnavailable`
/// surfaces through circuit state and health snapshots. Systemic failure
/// (cascading outage across components) is assessed by the orchestrator,
/// not per operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    InputQuality,
    CapabilityUnavailable,
    Unknown,
}

/// Errors produced by pipeline operations and stores
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{component} call failed ({kind:?}): {message}")]
    Adapter {
        component: String,
        kind: ErrorKind,
        message: String,
    },

    #[error("circuit open for component '{0}'")]
    CircuitOpen(String),

    #[error("no provider available for capability '{0}'")]
    NoProvider(String),

    #[error("orchestrator is paused for maintenance")]
    Paused,

    #[error("unknown component '{0}'")]
    UnknownComponent(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PipelineError {
    /// Build a tagged adapter failure
    pub fn adapter(component: impl Into<String>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Adapter {
            component: component.into(),
            kind,
            message: message.into(),
        }
    }

    /// Tag of this error, for strategy selection
    ///
    /// Non-adapter errors (stores, config) are not healable and report
    /// `Unknown`; the healing loop only ever sees adapter and circuit
    /// failures.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Adapter { kind, .. } => *kind,
            PipelineError::CircuitOpen(_) | PipelineError::NoProvider(_) => ErrorKind::Unavailable,
            _ => ErrorKind::Unknown,
        }
    }
}
