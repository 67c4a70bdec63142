//! Pipeline stages and content units.
//!
//! A content unit flows one direction through the stage sequence; each
//! stage's output becomes the next stage's input. Units are independent
//! of each other, so sibling units keep flowing when one is quarantined.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::OperationKind;

/// One piece of content moving through the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentUnit {
    /// Unique identifier (niche-prefixed for readable ledgers)
    pub id: String,

    /// Niche this unit belongs to
    pub niche: String,

    /// Topic seed for the discovery stage
    pub topic: String,
}

impl ContentUnit {
    pub fn new(niche: &str, topic: &str) -> Self {
        let suffix = Uuid::new_v4().to_string();
        Self {
            id: format!("{}-{}", niche, &suffix[..8]),
            niche: niche.to_string(),
            topic: topic.to_string(),
        }
    }
}

/// Ordered stage sequence for a pipeline run
#[derive(Debug, Clone)]
pub struct StagePlan {
    stages: Vec<OperationKind>,
}

impl StagePlan {
    /// The full production sequence
    pub fn standard() -> Self {
        Self {
            stages: OperationKind::all().to_vec(),
        }
    }

    /// A prefix of the standard plan (smoke runs, tests)
    pub fn up_to(last: OperationKind) -> Self {
        let stages = OperationKind::all()
            .iter()
            .copied()
            .take_while(|k| *k != last)
            .chain(std::iter::once(last))
            .collect();
        Self { stages }
    }

    pub fn stages(&self) -> &[OperationKind] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}
