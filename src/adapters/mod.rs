//! Narrow contracts toward external capabilities.
//!
//! The core never sees provider-specific request or response formats; it
//! talks to every generation provider, publishing platform, and financial
//! source through the same `CapabilityAdapter` trait, and to alerting and
//! analytics through `Notifier` and `MetricsSource`.

pub mod command;
pub mod metrics;
pub mod notify;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{OperationKind, PipelineError};

pub use command::CommandAdapter;
pub use metrics::{JsonMetricsSource, MetricsSource, OutcomeMetrics};
pub use notify::{Notifier, Severity, TelegramNotifier, TracingNotifier};

/// Output from a capability invocation
#[derive(Debug, Clone)]
pub struct AdapterOutput {
    /// Content produced by the provider (script text, asset path, post id, ...)
    pub content: String,

    /// Cost in USD, when the provider reports it
    pub cost_usd: Option<f64>,
}

impl AdapterOutput {
    pub fn new(content: String) -> Self {
        Self {
            content,
            cost_usd: None,
        }
    }
}

/// Uniform call interface to one external capability provider
#[async_trait]
pub trait CapabilityAdapter: Send + Sync {
    /// Component name this adapter serves (matches config rankings)
    fn name(&self) -> &str;

    /// Perform one unit of work
    ///
    /// Failures must carry an `ErrorKind` tag; untaggable errors use
    /// `ErrorKind::Unknown`.
    async fn invoke(
        &self,
        kind: OperationKind,
        payload: &str,
    ) -> Result<AdapterOutput, PipelineError>;
}

/// Lookup table from capability to ranked provider components
///
/// The ranking here is the configured base order; live provider weights
/// reorder it at decision time.
pub struct AdapterRegistry {
    /// capability name -> component names, in configured rank order
    rankings: HashMap<String, Vec<String>>,

    /// component name -> adapter instance
    adapters: HashMap<String, Arc<dyn CapabilityAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            rankings: HashMap::new(),
            adapters: HashMap::new(),
        }
    }

    /// Register an adapter under a capability, appended to its ranking
    pub fn register(&mut self, capability: &str, adapter: Arc<dyn CapabilityAdapter>) {
        let name = adapter.name().to_string();
        self.rankings
            .entry(capability.to_string())
            .or_default()
            .push(name.clone());
        self.adapters.insert(name, adapter);
    }

    /// Configured providers for a capability, base rank order
    pub fn providers(&self, capability: &str) -> &[String] {
        self.rankings
            .get(capability)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Look up an adapter by component name
    pub fn adapter(&self, component: &str) -> Result<Arc<dyn CapabilityAdapter>, PipelineError> {
        self.adapters
            .get(component)
            .cloned()
            .ok_or_else(|| PipelineError::UnknownComponent(component.to_string()))
    }

    /// All registered component names
    pub fn components(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}
