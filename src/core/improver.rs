//! Periodic weight recomputation from ledger history and outcome metrics.
//!
//! Runs on a schedule, never per-operation. Providers are scored by
//! success rate and mean time to recovery; niches by a blend of yield
//! rate and volume from the external metrics oracle. Updates are
//! EMA-smoothed and clamped, and a component must accumulate a minimum
//! sample count before its weight moves at all.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tracing::{debug, info};

use crate::adapters::MetricsSource;
use crate::config::ImproverConfig;
use crate::core::ledger::{LedgerEventType, LedgerRecord, RunLedger};
use crate::domain::WeightTable;

/// Aggregated outcome history for one provider
#[derive(Debug, Clone, Default)]
pub struct ProviderStats {
    pub samples: usize,
    pub successes: usize,

    /// Mean seconds from a failure to the next success on this component
    pub mean_recovery_seconds: Option<f64>,
}

impl ProviderStats {
    pub fn success_rate(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.successes as f64 / self.samples as f64
        }
    }
}

/// Summary of one recomputation pass
#[derive(Debug, Clone, Default)]
pub struct ImprovementReport {
    pub providers_updated: Vec<String>,
    pub niches_updated: Vec<String>,

    /// Components below the minimum sample size, left untouched
    pub skipped_insufficient: Vec<String>,
}

/// Batch weight recomputation
pub struct SelfImprover {
    config: ImproverConfig,

    /// Niches the discovery stage selects from
    niches: Vec<String>,
}

impl SelfImprover {
    pub fn new(config: ImproverConfig, niches: Vec<String>) -> Self {
        Self { config, niches }
    }

    /// Recompute provider and niche weights in place
    pub async fn recompute_weights(
        &self,
        ledger: &RunLedger,
        metrics: &dyn MetricsSource,
        table: &mut WeightTable,
        now: DateTime<Utc>,
    ) -> Result<ImprovementReport> {
        let since = now - Duration::hours(self.config.window_hours as i64);
        let records = ledger.query(None, Some(since), None).await?;

        let mut report = ImprovementReport::default();
        self.update_provider_weights(&records, table, &mut report);
        self.update_niche_weights(&records, metrics, table, since, &mut report)
            .await?;

        info!(
            providers = report.providers_updated.len(),
            niches = report.niches_updated.len(),
            skipped = report.skipped_insufficient.len(),
            "weights recomputed"
        );

        Ok(report)
    }

    /// Per-provider outcome stats over the record window
    pub fn provider_stats(&self, records: &[LedgerRecord]) -> HashMap<String, ProviderStats> {
        let mut stats: HashMap<String, ProviderStats> = HashMap::new();
        let mut pending_failure: HashMap<String, DateTime<Utc>> = HashMap::new();
        let mut recovery_gaps: HashMap<String, Vec<f64>> = HashMap::new();

        for record in records {
            match record.event_type {
                LedgerEventType::AttemptSucceeded => {
                    let entry = stats.entry(record.component.clone()).or_default();
                    entry.samples += 1;
                    entry.successes += 1;

                    if let Some(failed_at) = pending_failure.remove(&record.component) {
                        let gap = (record.timestamp - failed_at).num_milliseconds() as f64 / 1000.0;
                        recovery_gaps
                            .entry(record.component.clone())
                            .or_default()
                            .push(gap.max(0.0));
                    }
                }
                LedgerEventType::AttemptFailed => {
                    let entry = stats.entry(record.component.clone()).or_default();
                    entry.samples += 1;

                    // Track the start of a failure run only
                    pending_failure
                        .entry(record.component.clone())
                        .or_insert(record.timestamp);
                }
                _ => {}
            }
        }

        for (component, gaps) in recovery_gaps {
            if let Some(entry) = stats.get_mut(&component) {
                entry.mean_recovery_seconds =
                    Some(gaps.iter().sum::<f64>() / gaps.len() as f64);
            }
        }

        stats
    }

    fn update_provider_weights(
        &self,
        records: &[LedgerRecord],
        table: &mut WeightTable,
        report: &mut ImprovementReport,
    ) {
        let bounds = self.config.bounds;

        for (component, stats) in self.provider_stats(records) {
            if stats.samples < self.config.min_samples {
                debug!(
                    %component,
                    samples = stats.samples,
                    "insufficient samples, weight unchanged"
                );
                report.skipped_insufficient.push(component);
                continue;
            }

            // Success rate spans the full weight range; slow recovery
            // drags the target down without ever zeroing it.
            let mut target = bounds.min + stats.success_rate() * (bounds.max - bounds.min);
            if let Some(mttr) = stats.mean_recovery_seconds {
                target /= 1.0 + (mttr / 3600.0).min(4.0);
            }

            let old = table.provider(&component);
            let smoothed = old * (1.0 - self.config.alpha) + target * self.config.alpha;
            table.set_provider(&component, smoothed);

            debug!(
                %component,
                old,
                new = table.provider(&component),
                rate = stats.success_rate(),
                "provider weight updated"
            );
            report.providers_updated.push(component);
        }
    }

    async fn update_niche_weights(
        &self,
        records: &[LedgerRecord],
        metrics: &dyn MetricsSource,
        table: &mut WeightTable,
        since: DateTime<Utc>,
        report: &mut ImprovementReport,
    ) -> Result<()> {
        // Published units per niche within the window
        let mut published: HashMap<String, Vec<String>> = HashMap::new();
        for record in records {
            if record.event_type != LedgerEventType::AttemptSucceeded {
                continue;
            }
            if record.kind != crate::domain::OperationKind::Publish {
                continue;
            }
            if let Some(niche) = &record.niche {
                published
                    .entry(niche.clone())
                    .or_default()
                    .push(record.unit_id.clone());
            }
        }

        // Composite score per niche: blended yield rate and volume
        let mut scores: HashMap<String, (f64, f64)> = HashMap::new(); // (yield, volume)
        for (niche, units) in &published {
            let mut views = 0u64;
            let mut conversions = 0u64;
            for unit_id in units {
                if let Some(outcome) = metrics.outcome_metrics(unit_id, since).await? {
                    views += outcome.views;
                    conversions += outcome.conversions;
                }
            }

            let yield_rate = if views == 0 {
                0.0
            } else {
                conversions as f64 / views as f64
            };
            scores.insert(niche.clone(), (yield_rate, units.len() as f64));
        }

        let max_yield = scores
            .values()
            .map(|(y, _)| *y)
            .fold(0.0_f64, f64::max);
        let max_volume = scores
            .values()
            .map(|(_, v)| *v)
            .fold(0.0_f64, f64::max);

        let bounds = self.config.bounds;
        for niche in &self.niches {
            let Some((yield_rate, volume)) = scores.get(niche) else {
                continue;
            };
            if (*volume as usize) < self.config.min_samples {
                report.skipped_insufficient.push(niche.clone());
                continue;
            }

            let yield_norm = if max_yield > 0.0 { yield_rate / max_yield } else { 0.0 };
            let volume_norm = if max_volume > 0.0 { volume / max_volume } else { 0.0 };
            let composite =
                self.config.yield_weight * yield_norm + self.config.volume_weight * volume_norm;

            let target = bounds.min + composite * (bounds.max - bounds.min);
            let old = table.niche(niche);
            let smoothed = old * (1.0 - self.config.alpha) + target * self.config.alpha;
            table.set_niche(niche, smoothed);

            debug!(%niche, old, new = table.niche(niche), "niche weight updated");
            report.niches_updated.push(niche.clone());
        }

        Ok(())
    }
}
