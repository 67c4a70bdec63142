//! vigil - Self-healing orchestrator for multi-provider content pipelines
//!
//! Coordinates a multi-stage content pipeline (discovery, generation,
//! assembly, publishing, metrics) across interchangeable external
//! providers, and keeps it running unattended.
//!
//! # Architecture
//!
//! The system is built around an explicit failure-handling core:
//! - Per-component circuit breakers gate every collaborator call
//! - A deterministic policy engine escalates healing strategies per
//!   tagged error class, ending in fail-over or quarantine
//! - An append-only run ledger records every attempt and remediation
//! - A batch self-improver turns ledger history and outcome metrics into
//!   bounded niche/provider selection weights
//!
//! Unit failures are never fatal: a quarantined unit drops out while its
//! siblings keep flowing. Only simultaneous component-wide outages reach
//! the operator.
//!
//! # Modules
//!
//! - `adapters`: Narrow contracts to external capabilities
//! - `core`: Breakers, policy, ledger, improver, orchestrator
//! - `domain`: Data structures (Operation, HealingEvent, weights)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run one pipeline cycle over 4 content units
//! vigil run --units 4
//!
//! # Inspect system health
//! vigil status
//!
//! # Recompute selection weights from the ledger
//! vigil improve
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use config::Config;
pub use core::{BreakerRegistry, ContentUnit, Orchestrator, PolicyEngine, RunLedger, SelfImprover};
pub use domain::{
    CircuitState, ErrorKind, HealingEvent, HealingOutcome, HealthSnapshot, Operation,
    OperationKind, OperationStatus, PipelineError, Strategy, SystemState, WeightTable,
};
