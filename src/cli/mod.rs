//! Command-line interface for vigil.
//!
//! Provides commands for running pipeline cycles, inspecting health,
//! querying the ledger, managing circuit breakers, recomputing weights,
//! and toggling maintenance.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use crate::adapters::{
    AdapterRegistry, CommandAdapter, JsonMetricsSource, Notifier, TelegramNotifier,
    TracingNotifier,
};
use crate::config::{self, Config};
use crate::core::{BreakerRegistry, Orchestrator, RunLedger};
use crate::domain::WeightTable;

/// vigil - self-healing content pipeline orchestrator
#[derive(Parser, Debug)]
#[command(name = "vigil")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to ./vigil.yaml when present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one pipeline cycle
    Run {
        /// Number of content units to produce
        #[arg(short, long, default_value = "4")]
        units: usize,
    },

    /// Run unattended: cycles on an interval, weights recomputed in batch
    Auto {
        /// Minutes between cycles
        #[arg(short, long, default_value = "60")]
        interval: u64,

        /// Content units per cycle
        #[arg(short, long, default_value = "4")]
        units: usize,

        /// Recompute weights every N cycles
        #[arg(long, default_value = "6")]
        improve_every: u64,
    },

    /// Show the current health snapshot
    Status,

    /// Show recent ledger records
    Ledger {
        /// Filter by component name
        #[arg(long)]
        component: Option<String>,

        /// Maximum number of records to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Recompute niche and provider weights from the ledger
    Improve,

    /// Show the current weight table
    Weights,

    /// Show circuit breaker state per component
    Breakers,

    /// Manually reset a component's circuit breaker
    Reset {
        /// Component name
        component: String,
    },

    /// Enter maintenance: new cycles are rejected as paused
    Pause,

    /// Leave maintenance
    Resume,

    /// Show the resolved configuration
    Config,
}

impl Cli {
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run { units } => {
                let orchestrator = build_orchestrator(self.config.as_deref()).await?;
                let cycle_units = orchestrator.build_units(units).await;
                let report = orchestrator.run_cycle(cycle_units).await?;

                println!("run:         {}", report.run_id);
                println!("completed:   {}", report.completed());
                println!("quarantined: {}", report.quarantined());
                if report.paused() > 0 {
                    println!("paused:      {} (maintenance)", report.paused());
                }
                Ok(())
            }

            Commands::Auto {
                interval,
                units,
                improve_every,
            } => {
                let orchestrator = build_orchestrator(self.config.as_deref()).await?;
                let mut cycles: u64 = 0;

                loop {
                    let cycle_units = orchestrator.build_units(units).await;
                    match orchestrator.run_cycle(cycle_units).await {
                        Ok(report) => {
                            cycles += 1;
                            info!(
                                run = %report.run_id,
                                completed = report.completed(),
                                quarantined = report.quarantined(),
                                "cycle done"
                            );
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "cycle failed");
                        }
                    }

                    if improve_every > 0 && cycles > 0 && cycles % improve_every == 0 {
                        if let Err(e) = orchestrator.run_improvement().await {
                            tracing::warn!(error = %e, "weight recomputation failed");
                        }
                    }

                    tokio::time::sleep(std::time::Duration::from_secs(interval * 60)).await;
                }
            }

            Commands::Status => {
                let orchestrator = build_orchestrator(self.config.as_deref()).await?;
                let snapshot = orchestrator.health_snapshot().await;
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
                Ok(())
            }

            Commands::Ledger { component, limit } => {
                let ledger = RunLedger::open(&config::ledger_dir()?).await?;
                let records = ledger.query(component.as_deref(), None, None).await?;

                for record in records.iter().rev().take(limit) {
                    let error = record
                        .error
                        .as_deref()
                        .map(|e| format!("  {e}"))
                        .unwrap_or_default();
                    println!(
                        "{}  {:<18} {:<10} {:?}{}",
                        record.timestamp.format("%Y-%m-%d %H:%M:%S"),
                        record.component,
                        record.kind.to_string(),
                        record.event_type,
                        error,
                    );
                }
                Ok(())
            }

            Commands::Improve => {
                let orchestrator = build_orchestrator(self.config.as_deref()).await?;
                let report = orchestrator.run_improvement().await?;

                println!("providers updated: {}", report.providers_updated.len());
                println!("niches updated:    {}", report.niches_updated.len());
                if !report.skipped_insufficient.is_empty() {
                    println!(
                        "skipped (insufficient samples): {}",
                        report.skipped_insufficient.join(", ")
                    );
                }
                Ok(())
            }

            Commands::Weights => {
                let orchestrator = build_orchestrator(self.config.as_deref()).await?;
                let table = orchestrator.weight_table().await;

                println!("providers:");
                let mut providers: Vec<_> = table.provider_entries().iter().collect();
                providers.sort_by(|a, b| a.0.cmp(b.0));
                for (name, weight) in providers {
                    println!("  {name:<24} {weight:.3}");
                }

                println!("niches:");
                let mut niches: Vec<_> = table.niche_entries().iter().collect();
                niches.sort_by(|a, b| a.0.cmp(b.0));
                for (name, weight) in niches {
                    println!("  {name:<24} {weight:.3}");
                }
                Ok(())
            }

            Commands::Breakers => {
                let orchestrator = build_orchestrator(self.config.as_deref()).await?;
                let snapshot = orchestrator.breakers().snapshot().await;

                if snapshot.is_empty() {
                    println!("no components recorded yet");
                }
                for (name, status) in snapshot {
                    println!(
                        "{name:<24} {:?}  consecutive={} rolling={}",
                        status.state, status.consecutive_failures, status.rolling_failures
                    );
                }
                Ok(())
            }

            Commands::Reset { component } => {
                let orchestrator = build_orchestrator(self.config.as_deref()).await?;
                orchestrator.breakers().reset(&component).await;
                println!("circuit reset: {component}");
                Ok(())
            }

            Commands::Pause => {
                let marker = maintenance_marker()?;
                if let Some(parent) = marker.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&marker, b"")
                    .with_context(|| format!("Failed to write {}", marker.display()))?;
                println!("maintenance on: new cycles will be rejected as paused");
                Ok(())
            }

            Commands::Resume => {
                let marker = maintenance_marker()?;
                if marker.exists() {
                    std::fs::remove_file(&marker)?;
                }
                println!("maintenance off");
                Ok(())
            }

            Commands::Config => {
                let config = load_config(self.config.as_deref())?;
                println!("{}", serde_yaml::to_string(&config)?);
                Ok(())
            }
        }
    }
}

/// Maintenance marker file; its presence pauses any newly built orchestrator
fn maintenance_marker() -> Result<PathBuf> {
    Ok(config::state_dir()?.join("maintenance"))
}

/// Load configuration: explicit path, ./vigil.yaml, or defaults
fn load_config(path: Option<&Path>) -> Result<Config> {
    if let Some(path) = path {
        return Config::from_file(path);
    }

    let local = Path::new("vigil.yaml");
    if local.exists() {
        return Config::from_file(local);
    }

    let config = Config::default();
    config.validate()?;
    Ok(config)
}

/// Wire the orchestrator from configuration and persisted state
pub async fn build_orchestrator(config_path: Option<&Path>) -> Result<Arc<Orchestrator>> {
    let config = load_config(config_path)?;

    let mut registry = AdapterRegistry::new();
    for (capability, specs) in &config.providers {
        for spec in specs {
            registry.register(
                capability,
                Arc::new(CommandAdapter::new(
                    spec.name.clone(),
                    spec.command.clone(),
                    spec.args.clone(),
                )),
            );
        }
    }

    let state_dir = config::state_dir()?;
    let breakers =
        BreakerRegistry::with_store(config.breaker.clone(), state_dir.join("health.json")).await?;
    let ledger = RunLedger::open(&config::ledger_dir()?).await?;
    let weights_path = WeightTable::default_path(&state_dir);
    let weights = WeightTable::load(&weights_path, config.improver.bounds).await?;

    let notifier: Arc<dyn Notifier> = match TelegramNotifier::from_env() {
        Some(telegram) => Arc::new(telegram),
        None => Arc::new(TracingNotifier),
    };
    let metrics = Arc::new(JsonMetricsSource::new(config::metrics_dir()?));

    let orchestrator = Arc::new(
        Orchestrator::new(
            config,
            registry,
            breakers,
            ledger,
            notifier,
            metrics,
            weights,
        )
        .with_weights_path(weights_path)
        .with_stats_path(state_dir.join("cycle.json")),
    );

    if maintenance_marker()?.exists() {
        orchestrator.pause();
    }
    orchestrator.start().await;

    Ok(orchestrator)
}
