//! Read-only oracle for downstream outcome metrics.
//!
//! An external collector deposits per-unit outcome numbers; the
//! self-improver reads them on demand. The core never computes or
//! mutates these figures.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;

/// Outcome numbers for one published content unit
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutcomeMetrics {
    pub views: u64,
    pub conversions: u64,
    pub revenue_usd: f64,
}

impl OutcomeMetrics {
    /// Conversions per view; zero views yields zero
    pub fn yield_rate(&self) -> f64 {
        if self.views == 0 {
            0.0
        } else {
            self.conversions as f64 / self.views as f64
        }
    }
}

/// Supplier of outcome metrics for published units
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Metrics for a unit within a window; `None` when the collector has
    /// nothing for it yet
    async fn outcome_metrics(
        &self,
        unit_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<OutcomeMetrics>>;
}

/// File-backed metrics source
///
/// Reads `<dir>/<unit_id>.json` files written by the external collector.
pub struct JsonMetricsSource {
    dir: PathBuf,
}

/// On-disk record shape the collector writes
#[derive(Debug, Deserialize)]
struct MetricsFile {
    collected_at: DateTime<Utc>,
    #[serde(flatten)]
    metrics: OutcomeMetrics,
}

impl JsonMetricsSource {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

#[async_trait]
impl MetricsSource for JsonMetricsSource {
    async fn outcome_metrics(
        &self,
        unit_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<OutcomeMetrics>> {
        let path = self.dir.join(format!("{unit_id}.json"));
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read metrics file: {}", path.display()))?;

        let file: MetricsFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse metrics file: {}", path.display()))?;

        if file.collected_at < since {
            return Ok(None);
        }

        Ok(Some(file.metrics))
    }
}
