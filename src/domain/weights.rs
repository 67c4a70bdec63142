//! Bounded selection weights for niches and providers.
//!
//! Weights bias topic and provider selection. They are owned by the
//! self-improver; every other component reads them. All writes go through
//! the clamping setters, so no input history can push a weight outside its
//! configured range.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;

/// Inclusive bounds for every weight value
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WeightBounds {
    /// Exploration floor; never zero so failing providers stay sampled
    pub min: f64,
    pub max: f64,
    /// Value assigned to components with no accumulated history
    pub default: f64,
}

impl Default for WeightBounds {
    fn default() -> Self {
        Self {
            min: 0.1,
            max: 5.0,
            default: 1.0,
        }
    }
}

impl WeightBounds {
    pub fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.min, self.max)
    }
}

/// The persisted table of niche and provider weights
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightTable {
    pub version: u32,
    pub bounds: WeightBounds,
    providers: HashMap<String, f64>,
    niches: HashMap<String, f64>,
    pub updated_at: DateTime<Utc>,
}

impl WeightTable {
    pub fn new(bounds: WeightBounds) -> Self {
        Self {
            version: 1,
            bounds,
            providers: HashMap::new(),
            niches: HashMap::new(),
            updated_at: Utc::now(),
        }
    }

    /// Weight for a provider; components with no history get the default
    pub fn provider(&self, name: &str) -> f64 {
        self.providers
            .get(name)
            .copied()
            .unwrap_or(self.bounds.default)
    }

    /// Weight for a niche; unseen niches get the default
    pub fn niche(&self, name: &str) -> f64 {
        self.niches
            .get(name)
            .copied()
            .unwrap_or(self.bounds.default)
    }

    /// Set a provider weight, clamped to bounds
    pub fn set_provider(&mut self, name: &str, value: f64) {
        self.providers
            .insert(name.to_string(), self.bounds.clamp(value));
        self.updated_at = Utc::now();
    }

    /// Set a niche weight, clamped to bounds
    pub fn set_niche(&mut self, name: &str, value: f64) {
        self.niches
            .insert(name.to_string(), self.bounds.clamp(value));
        self.updated_at = Utc::now();
    }

    /// Providers sorted by descending weight, ties broken by name
    pub fn rank_providers<'a>(&self, candidates: &'a [String]) -> Vec<&'a str> {
        let mut ranked: Vec<&str> = candidates.iter().map(|s| s.as_str()).collect();
        ranked.sort_by(|a, b| {
            self.provider(b)
                .partial_cmp(&self.provider(a))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.cmp(b))
        });
        ranked
    }

    /// Niches sorted by descending weight, ties broken by name
    pub fn rank_niches<'a>(&self, candidates: &'a [String]) -> Vec<&'a str> {
        let mut ranked: Vec<&str> = candidates.iter().map(|s| s.as_str()).collect();
        ranked.sort_by(|a, b| {
            self.niche(b)
                .partial_cmp(&self.niche(a))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.cmp(b))
        });
        ranked
    }

    /// All known provider entries
    pub fn provider_entries(&self) -> &HashMap<String, f64> {
        &self.providers
    }

    /// All known niche entries
    pub fn niche_entries(&self) -> &HashMap<String, f64> {
        &self.niches
    }

    /// Load the table from disk, or start fresh with the given bounds
    pub async fn load(path: &Path, bounds: WeightBounds) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new(bounds));
        }

        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read weight table: {}", path.display()))?;

        let mut table: Self =
            serde_json::from_str(&content).context("Failed to parse weight table JSON")?;

        // Re-clamp on load; bounds in config may have tightened since the
        // table was written.
        table.bounds = bounds;
        for value in table.providers.values_mut() {
            *value = bounds.clamp(*value);
        }
        for value in table.niches.values_mut() {
            *value = bounds.clamp(*value);
        }

        Ok(table)
    }

    /// Save the table to disk (last write wins)
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)
            .await
            .with_context(|| format!("Failed to write weight table: {}", path.display()))?;

        Ok(())
    }

    /// Default on-disk location
    pub fn default_path(state_dir: &Path) -> PathBuf {
        state_dir.join("weights.json")
    }
}
