//! Top-level pipeline driver and system state machine.
//!
//! Sequences pipeline stages per content unit, gates every call through
//! the breaker registry, invokes the policy engine on failure, and
//! escalates to out-of-band alerting when healing is exhausted. Unit
//! failures are never fatal to a run: quarantine always lets sibling
//! units keep flowing.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::{AdapterRegistry, MetricsSource, Notifier, Severity};
use crate::config::Config;
use crate::domain::{
    CircuitState, ErrorKind, HealingEvent, HealingOutcome, HealthSnapshot, Operation,
    OperationKind, OperationStatus, PipelineError, Strategy, SystemState, WeightTable,
};

use super::breaker::BreakerRegistry;
use super::improver::{ImprovementReport, SelfImprover};
use super::ledger::{LedgerEventType, LedgerRecord, RunLedger};
use super::policy::{DecisionContext, PolicyEngine};
use super::stage::{ContentUnit, StagePlan};

/// Why a unit stopped mid-pipeline
enum UnitStop {
    /// Quarantined at the current stage; siblings keep running
    Quarantined,
}

/// Final outcome for one unit in a cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOutcome {
    /// All stages completed
    Completed,

    /// Quarantined at a stage; the rest of the run continued
    Quarantined { stage: OperationKind },

    /// Rejected or interrupted by maintenance; not a failure
    Paused,
}

/// Per-unit result of a cycle
#[derive(Debug, Clone)]
pub struct UnitReport {
    pub unit: ContentUnit,
    pub outcome: UnitOutcome,
}

/// Result of one pipeline cycle
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub run_id: Uuid,
    pub units: Vec<UnitReport>,
}

impl CycleReport {
    pub fn completed(&self) -> usize {
        self.units
            .iter()
            .filter(|u| u.outcome == UnitOutcome::Completed)
            .count()
    }

    pub fn quarantined(&self) -> usize {
        self.units
            .iter()
            .filter(|u| matches!(u.outcome, UnitOutcome::Quarantined { .. }))
            .count()
    }

    pub fn paused(&self) -> usize {
        self.units
            .iter()
            .filter(|u| u.outcome == UnitOutcome::Paused)
            .count()
    }
}

/// Stage activity marker for stall detection
#[derive(Debug, Clone, Copy, Default)]
struct StageMark {
    /// First attempt since the stage last succeeded
    first_attempt_after_success: Option<DateTime<Utc>>,
}

/// A quarantined unit held for the optional revisit policy
#[derive(Debug, Clone)]
struct QuarantinedUnit {
    unit: ContentUnit,
    at: DateTime<Utc>,
    revisited: bool,
}

/// Lifetime counters persisted across restarts (last write wins)
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct CycleStats {
    pub cycles_completed: u64,
    pub units_completed: u64,
    pub units_quarantined: u64,
    pub heals_attempted: u64,
    pub heals_recovered: u64,
}

/// The pipeline driver
pub struct Orchestrator {
    config: Config,
    registry: AdapterRegistry,
    breakers: BreakerRegistry,
    ledger: RunLedger,
    policy: PolicyEngine,
    improver: SelfImprover,
    notifier: Arc<dyn Notifier>,
    metrics: Arc<dyn MetricsSource>,
    weights: Mutex<WeightTable>,
    plan: StagePlan,

    /// Base operational state; Healing and Maintenance are derived
    state: Mutex<SystemState>,
    paused: AtomicBool,

    /// One alert and one repair cycle per critical episode
    critical_handled: AtomicBool,

    /// Units processed concurrently; dropped to the floor by emergency repair
    active_concurrency: AtomicUsize,

    /// Healing loops currently running (drives the visible Healing state)
    healing_in_flight: AtomicUsize,

    /// Recent call outcomes for the degraded failure-rate window
    outcomes: Mutex<VecDeque<(DateTime<Utc>, bool)>>,

    /// Per-stage activity for stall detection
    stage_marks: Mutex<HashMap<OperationKind, StageMark>>,

    /// Per-component concurrency gates
    component_gates: Mutex<HashMap<String, Arc<Semaphore>>>,

    /// Quarantined units held for the revisit policy
    quarantined: Mutex<Vec<QuarantinedUnit>>,

    heals_attempted: AtomicU64,
    heals_recovered: AtomicU64,
    units_quarantined: AtomicU64,
    cycles_completed: AtomicU64,
    units_completed: AtomicU64,

    /// When set, the weight table is saved here after recomputation
    weights_path: Option<PathBuf>,

    /// When set, lifetime counters are persisted here after each cycle
    stats_path: Option<PathBuf>,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        registry: AdapterRegistry,
        breakers: BreakerRegistry,
        ledger: RunLedger,
        notifier: Arc<dyn Notifier>,
        metrics: Arc<dyn MetricsSource>,
        weights: WeightTable,
    ) -> Self {
        let policy = PolicyEngine::new(config.healing.clone(), config.fallback_topics.clone());
        let improver = SelfImprover::new(config.improver.clone(), config.niches.clone());
        let concurrency = config.orchestrator.concurrency;

        Self {
            config,
            registry,
            breakers,
            ledger,
            policy,
            improver,
            notifier,
            metrics,
            weights: Mutex::new(weights),
            plan: StagePlan::standard(),
            state: Mutex::new(SystemState::Initializing),
            paused: AtomicBool::new(false),
            critical_handled: AtomicBool::new(false),
            active_concurrency: AtomicUsize::new(concurrency),
            healing_in_flight: AtomicUsize::new(0),
            outcomes: Mutex::new(VecDeque::new()),
            stage_marks: Mutex::new(HashMap::new()),
            component_gates: Mutex::new(HashMap::new()),
            quarantined: Mutex::new(Vec::new()),
            heals_attempted: AtomicU64::new(0),
            heals_recovered: AtomicU64::new(0),
            units_quarantined: AtomicU64::new(0),
            cycles_completed: AtomicU64::new(0),
            units_completed: AtomicU64::new(0),
            weights_path: None,
            stats_path: None,
        }
    }

    /// Persist recomputed weights at this path
    pub fn with_weights_path(mut self, path: PathBuf) -> Self {
        self.weights_path = Some(path);
        self
    }

    /// Persist lifetime counters at this path, restoring any previous values
    pub fn with_stats_path(mut self, path: PathBuf) -> Self {
        if let Ok(content) = std::fs::read_to_string(&path) {
            if let Ok(stats) = serde_json::from_str::<CycleStats>(&content) {
                self.cycles_completed = AtomicU64::new(stats.cycles_completed);
                self.units_completed = AtomicU64::new(stats.units_completed);
                self.units_quarantined = AtomicU64::new(stats.units_quarantined);
                self.heals_attempted = AtomicU64::new(stats.heals_attempted);
                self.heals_recovered = AtomicU64::new(stats.heals_recovered);
            }
        }
        self.stats_path = Some(path);
        self
    }

    /// Current lifetime counters
    pub fn cycle_stats(&self) -> CycleStats {
        CycleStats {
            cycles_completed: self.cycles_completed.load(Ordering::SeqCst),
            units_completed: self.units_completed.load(Ordering::SeqCst),
            units_quarantined: self.units_quarantined.load(Ordering::SeqCst),
            heals_attempted: self.heals_attempted.load(Ordering::SeqCst),
            heals_recovered: self.heals_recovered.load(Ordering::SeqCst),
        }
    }

    /// Override the stage plan (smoke runs, tests)
    pub fn with_plan(mut self, plan: StagePlan) -> Self {
        self.plan = plan;
        self
    }

    /// Finish initialization and enter the steady state
    pub async fn start(&self) {
        let mut state = self.state.lock().await;
        if *state == SystemState::Initializing {
            *state = SystemState::Running;
            info!("orchestrator running");
        }
    }

    /// Visible operational state
    pub async fn state(&self) -> SystemState {
        if self.paused.load(Ordering::SeqCst) {
            return SystemState::Maintenance;
        }

        let base = *self.state.lock().await;
        if base == SystemState::Running && self.healing_in_flight.load(Ordering::SeqCst) > 0 {
            return SystemState::Healing;
        }
        base
    }

    /// Enter maintenance: stop accepting work, let in-flight operations drain
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        info!("maintenance: new work will be rejected as paused");
    }

    /// Leave maintenance
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        info!("maintenance ended");
    }

    /// Build content units from the ranked niches
    pub async fn build_units(&self, count: usize) -> Vec<ContentUnit> {
        let weights = self.weights.lock().await;
        let ranked = weights.rank_niches(&self.config.niches);
        if ranked.is_empty() {
            return Vec::new();
        }

        (0..count)
            .map(|i| ContentUnit::new(ranked[i % ranked.len()], ""))
            .collect()
    }

    /// Execute one pipeline cycle over the given units
    #[instrument(skip(self, units), fields(units = units.len()))]
    pub async fn run_cycle(self: &Arc<Self>, mut units: Vec<ContentUnit>) -> Result<CycleReport> {
        let run_id = Uuid::new_v4();

        if self.paused.load(Ordering::SeqCst) {
            info!(%run_id, "cycle rejected: maintenance");
            let units = units
                .into_iter()
                .map(|unit| UnitReport {
                    unit,
                    outcome: UnitOutcome::Paused,
                })
                .collect();
            return Ok(CycleReport { run_id, units });
        }

        units.extend(self.revisit_due().await);
        info!(%run_id, units = units.len(), "cycle started");

        let permits = Arc::new(Semaphore::new(
            self.active_concurrency.load(Ordering::SeqCst).max(1),
        ));
        let mut tasks: JoinSet<UnitReport> = JoinSet::new();

        for unit in units {
            let orchestrator = Arc::clone(self);
            let permits = Arc::clone(&permits);
            tasks.spawn(orchestrator.process_unit(run_id, unit, permits));
        }

        let mut reports = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(e) => error!(error = %e, "unit task panicked"),
            }
        }

        self.assess_system().await;

        let report = CycleReport {
            run_id,
            units: reports,
        };
        self.cycles_completed.fetch_add(1, Ordering::SeqCst);
        self.units_completed
            .fetch_add(report.completed() as u64, Ordering::SeqCst);
        self.persist_stats().await;

        info!(
            %run_id,
            completed = report.completed(),
            quarantined = report.quarantined(),
            "cycle finished"
        );

        Ok(report)
    }

    /// Walk one unit through the stage plan
    async fn process_unit(
        self: Arc<Self>,
        run_id: Uuid,
        unit: ContentUnit,
        permits: Arc<Semaphore>,
    ) -> UnitReport {
        let _permit = match permits.acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                return UnitReport {
                    unit,
                    outcome: UnitOutcome::Paused,
                }
            }
        };

        let mut payload = if unit.topic.is_empty() {
            unit.niche.clone()
        } else {
            unit.topic.clone()
        };

        for kind in self.plan.stages() {
            // Maintenance stops scheduling new operations; already
            // dispatched ones have finished by this point.
            if self.paused.load(Ordering::SeqCst) {
                return UnitReport {
                    unit,
                    outcome: UnitOutcome::Paused,
                };
            }

            match self.execute_operation(run_id, &unit, *kind, &payload).await {
                Ok(output) => payload = output,
                Err(UnitStop::Quarantined) => {
                    return UnitReport {
                        unit,
                        outcome: UnitOutcome::Quarantined { stage: *kind },
                    }
                }
            }
        }

        UnitReport {
            unit,
            outcome: UnitOutcome::Completed,
        }
    }

    /// Run one operation to a terminal status, healing as needed
    async fn execute_operation(
        &self,
        run_id: Uuid,
        unit: &ContentUnit,
        kind: OperationKind,
        input: &str,
    ) -> Result<String, UnitStop> {
        let capability = kind.capability();
        let mut tried: HashSet<String> = HashSet::new();

        let Some(first) = self.select_provider(capability, &tried).await else {
            // Every configured provider is open or missing
            warn!(unit = %unit.id, capability, "no provider available");
            let mut op = Operation::new(kind, "unassigned", &unit.id, input);
            self.append(
                LedgerRecord::new(run_id, &op, LedgerEventType::OperationStarted)
                    .with_niche(Some(&unit.niche)),
            )
            .await;
            self.quarantine(run_id, &mut op, unit, 0).await;
            self.assess_system().await;
            return Err(UnitStop::Quarantined);
        };
        tried.insert(first.clone());

        let mut op = Operation::new(kind, &first, &unit.id, input);
        self.append(
            LedgerRecord::new(run_id, &op, LedgerEventType::OperationStarted)
                .with_niche(Some(&unit.niche)),
        )
        .await;

        let original = input.to_string();
        let mut payload = original.clone();

        let mut last_err = match self.invoke_once(run_id, &mut op, &unit.niche, &payload).await {
            Ok(output) => {
                op.resolve(OperationStatus::Success);
                self.append(
                    LedgerRecord::new(run_id, &op, LedgerEventType::OperationCompleted)
                        .with_niche(Some(&unit.niche)),
                )
                .await;
                return Ok(output);
            }
            Err(e) => e,
        };

        // Healing loop: the policy chain always terminates in quarantine
        self.healing_in_flight.fetch_add(1, Ordering::SeqCst);
        let mut rank: u32 = 0;

        loop {
            let ctx = DecisionContext {
                circuit_open: self.breakers.state_of(&op.component).await == CircuitState::Open,
                alternates_available: self.has_alternate(capability, &tried).await,
            };
            let strategy = self.policy.decide(&op, last_err.kind(), rank, ctx);

            debug!(
                unit = %unit.id,
                operation = %op.id,
                component = %op.component,
                %strategy,
                rank,
                error = %last_err,
                "healing"
            );

            if strategy == Strategy::Quarantine {
                self.quarantine(run_id, &mut op, unit, rank).await;
                self.healing_in_flight.fetch_sub(1, Ordering::SeqCst);
                self.assess_system().await;
                return Err(UnitStop::Quarantined);
            }

            self.heals_attempted.fetch_add(1, Ordering::SeqCst);

            let attempt: Result<String, PipelineError> = match strategy {
                Strategy::RetrySame => {
                    tokio::time::sleep(self.policy.retry_pause()).await;
                    self.invoke_once(run_id, &mut op, &unit.niche, &payload).await
                }
                Strategy::SimplifyRetry => {
                    payload = self.policy.simplify(&original);
                    self.invoke_once(run_id, &mut op, &unit.niche, &payload).await
                }
                Strategy::ProxySubstitute => {
                    payload = self.policy.proxy_substitute(&original);
                    self.invoke_once(run_id, &mut op, &unit.niche, &payload).await
                }
                Strategy::DecomposeRetry => {
                    self.invoke_decomposed(run_id, &mut op, &unit.niche, &payload)
                        .await
                }
                Strategy::FailOverProvider => {
                    match self.select_provider(capability, &tried).await {
                        Some(next) => {
                            info!(
                                unit = %unit.id,
                                from = %op.component,
                                to = %next,
                                "failing over"
                            );
                            tried.insert(next.clone());
                            op.component = next;
                            // Fail-over replays the original, non-degraded input
                            payload = original.clone();
                            self.invoke_once(run_id, &mut op, &unit.niche, &payload).await
                        }
                        None => Err(PipelineError::NoProvider(capability.to_string())),
                    }
                }
                Strategy::Quarantine => unreachable!("handled above"),
            };

            let outcome = if attempt.is_ok() {
                HealingOutcome::Recovered
            } else {
                HealingOutcome::StillFailed
            };
            let event = HealingEvent::new(op.id, strategy, rank, outcome);
            self.append(
                LedgerRecord::new(run_id, &op, LedgerEventType::HealingApplied)
                    .with_niche(Some(&unit.niche))
                    .with_healing(event),
            )
            .await;

            match attempt {
                Ok(output) => {
                    self.heals_recovered.fetch_add(1, Ordering::SeqCst);
                    op.resolve(OperationStatus::Healed);
                    self.append(
                        LedgerRecord::new(run_id, &op, LedgerEventType::OperationCompleted)
                            .with_niche(Some(&unit.niche)),
                    )
                    .await;
                    self.healing_in_flight.fetch_sub(1, Ordering::SeqCst);
                    self.assess_system().await;
                    return Ok(output);
                }
                Err(e) => {
                    last_err = e;
                    rank += 1;
                    self.assess_system().await;
                }
            }
        }
    }

    /// One gated, bounded adapter invocation
    async fn invoke_once(
        &self,
        run_id: Uuid,
        op: &mut Operation,
        niche: &str,
        payload: &str,
    ) -> Result<String, PipelineError> {
        let component = op.component.clone();

        // Fail fast while the circuit is open: zero adapter calls
        if self.breakers.is_open(&component).await {
            return Err(PipelineError::CircuitOpen(component));
        }

        let adapter = self.registry.adapter(&component)?;
        let gate = self.component_gate(&component).await;
        let _permit = gate
            .acquire_owned()
            .await
            .map_err(|_| PipelineError::UnknownComponent(component.clone()))?;

        op.attempts += 1;
        op.status = OperationStatus::Pending;
        self.mark_attempt(op.kind).await;

        let wait = Duration::from_secs(self.config.orchestrator.call_timeout_seconds);
        let result = match tokio::time::timeout(wait, adapter.invoke(op.kind, payload)).await {
            Ok(Ok(output)) => Ok(output.content),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(PipelineError::adapter(
                &component,
                ErrorKind::Timeout,
                format!("no response within {}s", wait.as_secs()),
            )),
        };

        match &result {
            Ok(_) => {
                self.breakers.record_outcome(&component, true).await;
                self.record_window_outcome(true).await;
                self.mark_success(op.kind).await;
                self.append(
                    LedgerRecord::new(run_id, op, LedgerEventType::AttemptSucceeded)
                        .with_niche(Some(niche)),
                )
                .await;
            }
            Err(e) => {
                op.status = OperationStatus::Failed;
                self.breakers.record_outcome(&component, false).await;
                self.record_window_outcome(false).await;
                self.append(
                    LedgerRecord::new(run_id, op, LedgerEventType::AttemptFailed)
                        .with_niche(Some(niche))
                        .with_error(e.to_string()),
                )
                .await;
            }
        }

        result
    }

    /// Split the payload and run each part through the same provider
    async fn invoke_decomposed(
        &self,
        run_id: Uuid,
        op: &mut Operation,
        niche: &str,
        payload: &str,
    ) -> Result<String, PipelineError> {
        let parts = self.policy.decompose(payload);
        let mut outputs = Vec::with_capacity(parts.len());

        for part in &parts {
            let output = self.invoke_once(run_id, op, niche, part).await?;
            outputs.push(output);
        }

        Ok(outputs.join("\n"))
    }

    /// Next-ranked provider with a workable circuit, excluding the tried set
    async fn select_provider(
        &self,
        capability: &str,
        exclude: &HashSet<String>,
    ) -> Option<String> {
        let candidates = self.registry.providers(capability);
        if candidates.is_empty() {
            return None;
        }

        let ranked: Vec<String> = {
            let weights = self.weights.lock().await;
            weights
                .rank_providers(candidates)
                .into_iter()
                .map(|s| s.to_string())
                .collect()
        };

        for candidate in ranked {
            if exclude.contains(&candidate) {
                continue;
            }
            if self.breakers.state_of(&candidate).await != CircuitState::Open {
                return Some(candidate);
            }
        }
        None
    }

    async fn has_alternate(&self, capability: &str, tried: &HashSet<String>) -> bool {
        self.select_provider(capability, tried).await.is_some()
    }

    /// Quarantine the unit: permanently failed, run continues without it
    async fn quarantine(&self, run_id: Uuid, op: &mut Operation, unit: &ContentUnit, rank: u32) {
        warn!(unit = %unit.id, operation = %op.id, "quarantined");

        let event =
            HealingEvent::new(op.id, Strategy::Quarantine, rank, HealingOutcome::StillFailed);
        self.append(
            LedgerRecord::new(run_id, op, LedgerEventType::HealingApplied)
                .with_niche(Some(&unit.niche))
                .with_healing(event),
        )
        .await;

        op.resolve(OperationStatus::Abandoned);
        self.append(
            LedgerRecord::new(run_id, op, LedgerEventType::OperationCompleted)
                .with_niche(Some(&unit.niche)),
        )
        .await;

        self.units_quarantined.fetch_add(1, Ordering::SeqCst);
        self.quarantined.lock().await.push(QuarantinedUnit {
            unit: unit.clone(),
            at: Utc::now(),
            revisited: false,
        });
    }

    /// Quarantined units due for their one configured revisit
    async fn revisit_due(&self) -> Vec<ContentUnit> {
        let Some(minutes) = self.config.healing.quarantine_revisit_minutes else {
            return Vec::new();
        };

        let cutoff = Utc::now() - chrono::Duration::minutes(minutes as i64);
        let mut quarantined = self.quarantined.lock().await;
        let mut due = Vec::new();

        for entry in quarantined.iter_mut() {
            if !entry.revisited && entry.at <= cutoff {
                entry.revisited = true;
                due.push(entry.unit.clone());
            }
        }

        if !due.is_empty() {
            info!(count = due.len(), "revisiting quarantined units");
        }
        due
    }

    /// Reassess the visible system state from recent evidence
    async fn assess_system(&self) {
        if self.paused.load(Ordering::SeqCst) {
            return;
        }

        let now = Utc::now();
        let (failures, samples) = self.window_stats(now).await;
        let open_circuits = self.breakers.open_count().await;
        let stalled_stage = self.stalled_stage(now).await;

        let systemic = open_circuits >= self.config.orchestrator.critical_open_circuits
            || stalled_stage.is_some();

        if systemic {
            // One alert and one repair cycle per episode
            if !self.critical_handled.swap(true, Ordering::SeqCst) {
                {
                    let mut state = self.state.lock().await;
                    *state = SystemState::Critical;
                }

                let detail = match stalled_stage {
                    Some(kind) => format!("stage '{kind}' has produced no successes"),
                    None => format!("{open_circuits} circuits open simultaneously"),
                };
                error!(%detail, "entering critical state");
                self.notifier
                    .alert(
                        Severity::Critical,
                        &format!("pipeline critical: {detail}; starting emergency repair"),
                    )
                    .await;

                self.emergency_repair().await;
            }
            return;
        }

        let failure_rate = if samples > 0 {
            failures as f64 / samples as f64
        } else {
            0.0
        };

        let mut state = self.state.lock().await;
        if samples >= 4 && failure_rate >= self.config.orchestrator.degraded_failure_rate {
            if *state != SystemState::Degraded {
                warn!(failure_rate, samples, "entering degraded state");
            }
            *state = SystemState::Degraded;
        } else if *state != SystemState::Initializing {
            *state = SystemState::Running;
            self.critical_handled.store(false, Ordering::SeqCst);
            self.active_concurrency
                .store(self.config.orchestrator.concurrency, Ordering::SeqCst);
        }
    }

    /// Force-reset expired breakers, drop concurrency, resume running
    async fn emergency_repair(&self) {
        let reset = self.breakers.force_reset_expired().await;
        self.active_concurrency
            .store(self.config.orchestrator.min_concurrency, Ordering::SeqCst);

        let mut state = self.state.lock().await;
        *state = SystemState::Running;

        info!(
            breakers_reset = reset,
            concurrency = self.config.orchestrator.min_concurrency,
            "emergency repair cycle complete"
        );
    }

    /// Point-in-time health aggregate for operators and alerting
    pub async fn health_snapshot(&self) -> HealthSnapshot {
        let components = self.breakers.snapshot().await;
        let open_circuits = components
            .values()
            .filter(|c| c.state == CircuitState::Open)
            .count() as u32;
        let state = self.state().await;
        let quarantined = self.units_quarantined.load(Ordering::SeqCst);

        HealthSnapshot {
            score: HealthSnapshot::compute_score(state, open_circuits, quarantined),
            state,
            components,
            open_circuits,
            active_concurrency: self.active_concurrency.load(Ordering::SeqCst),
            healing_in_flight: self.healing_in_flight.load(Ordering::SeqCst),
            heals_attempted: self.heals_attempted.load(Ordering::SeqCst),
            heals_recovered: self.heals_recovered.load(Ordering::SeqCst),
            units_quarantined: quarantined,
            taken_at: Utc::now(),
        }
    }

    /// Batch weight recomputation; saves the table when a path is set
    pub async fn run_improvement(&self) -> Result<ImprovementReport> {
        let mut weights = self.weights.lock().await;
        let report = self
            .improver
            .recompute_weights(&self.ledger, self.metrics.as_ref(), &mut weights, Utc::now())
            .await?;

        if let Some(path) = &self.weights_path {
            weights
                .save(path)
                .await
                .context("Failed to persist recomputed weights")?;
        }

        Ok(report)
    }

    /// Current weight table contents (clone)
    pub async fn weight_table(&self) -> WeightTable {
        self.weights.lock().await.clone()
    }

    /// Operator access to breaker state
    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    /// Read access to the ledger
    pub fn ledger(&self) -> &RunLedger {
        &self.ledger
    }

    /// Revenue allocation ratios for the downstream financial policy
    pub fn allocation(&self) -> (f64, f64, f64) {
        let alloc = &self.config.allocation;
        (alloc.reinvest, alloc.reserve, alloc.payout)
    }

    // ── internals ──

    async fn persist_stats(&self) {
        let Some(path) = &self.stats_path else {
            return;
        };

        let result: Result<()> = async {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let content = serde_json::to_string_pretty(&self.cycle_stats())?;
            tokio::fs::write(path, content).await?;
            Ok(())
        }
        .await;

        if let Err(e) = result {
            warn!(error = %e, "failed to persist cycle stats");
        }
    }

    async fn append(&self, record: LedgerRecord) {
        if let Err(e) = self.ledger.append(&record).await {
            warn!(error = %e, "ledger append failed");
        }
    }

    async fn component_gate(&self, component: &str) -> Arc<Semaphore> {
        let mut gates = self.component_gates.lock().await;
        gates
            .entry(component.to_string())
            .or_insert_with(|| {
                Arc::new(Semaphore::new(
                    self.config.orchestrator.component_limit(component),
                ))
            })
            .clone()
    }

    async fn record_window_outcome(&self, success: bool) {
        let now = Utc::now();
        let window =
            chrono::Duration::seconds(self.config.orchestrator.degraded_window_seconds as i64);
        let mut outcomes = self.outcomes.lock().await;
        outcomes.push_back((now, success));
        while let Some((t, _)) = outcomes.front() {
            if now - *t > window {
                outcomes.pop_front();
            } else {
                break;
            }
        }
    }

    async fn window_stats(&self, now: DateTime<Utc>) -> (usize, usize) {
        let window =
            chrono::Duration::seconds(self.config.orchestrator.degraded_window_seconds as i64);
        let outcomes = self.outcomes.lock().await;
        let recent: Vec<bool> = outcomes
            .iter()
            .filter(|(t, _)| now - *t <= window)
            .map(|(_, s)| *s)
            .collect();

        let failures = recent.iter().filter(|s| !**s).count();
        (failures, recent.len())
    }

    async fn mark_attempt(&self, kind: OperationKind) {
        let mut marks = self.stage_marks.lock().await;
        let mark = marks.entry(kind).or_default();
        if mark.first_attempt_after_success.is_none() {
            mark.first_attempt_after_success = Some(Utc::now());
        }
    }

    async fn mark_success(&self, kind: OperationKind) {
        let mut marks = self.stage_marks.lock().await;
        let mark = marks.entry(kind).or_default();
        mark.first_attempt_after_success = None;
    }

    /// A stage that has been attempting without success past the stall window
    async fn stalled_stage(&self, now: DateTime<Utc>) -> Option<OperationKind> {
        let stall = chrono::Duration::seconds(self.config.orchestrator.stage_stall_seconds as i64);
        let marks = self.stage_marks.lock().await;
        marks
            .iter()
            .find(|(_, mark)| {
                mark.first_attempt_after_success
                    .map_or(false, |t| now - t > stall)
            })
            .map(|(kind, _)| *kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{AdapterOutput, CapabilityAdapter, TracingNotifier};
    use crate::config::ProviderSpec;
    use crate::domain::WeightBounds;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;
    use tempfile::TempDir;

    /// Adapter that fails a scripted number of times, then succeeds
    struct FlakyAdapter {
        name: String,
        failures: AtomicU32,
        kind: ErrorKind,
    }

    impl FlakyAdapter {
        fn new(name: &str, failures: u32, kind: ErrorKind) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                failures: AtomicU32::new(failures),
                kind,
            })
        }
    }

    #[async_trait]
    impl CapabilityAdapter for FlakyAdapter {
        fn name(&self) -> &str {
            &self.name
        }

        async fn invoke(
            &self,
            _kind: OperationKind,
            payload: &str,
        ) -> Result<AdapterOutput, PipelineError> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(PipelineError::adapter(&self.name, self.kind, "scripted"));
            }
            Ok(AdapterOutput::new(format!("{}:{}", self.name, payload)))
        }
    }

    struct NoMetrics;

    #[async_trait]
    impl MetricsSource for NoMetrics {
        async fn outcome_metrics(
            &self,
            _unit_id: &str,
            _since: DateTime<Utc>,
        ) -> Result<Option<crate::adapters::OutcomeMetrics>> {
            Ok(None)
        }
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.healing.retry_pause_ms = 1;
        config.niches = vec!["survival".to_string()];
        // Provider specs are informational here; adapters are injected
        config.providers.insert(
            "script".to_string(),
            vec![ProviderSpec {
                name: "alpha_llm".to_string(),
                command: "alpha".to_string(),
                args: vec![],
            }],
        );
        config
    }

    async fn orchestrator_with(
        config: Config,
        temp: &TempDir,
        adapters: Vec<(&str, Arc<dyn CapabilityAdapter>)>,
        plan: StagePlan,
    ) -> Arc<Orchestrator> {
        let mut registry = AdapterRegistry::new();
        for (capability, adapter) in adapters {
            registry.register(capability, adapter);
        }

        let breakers = BreakerRegistry::new(config.breaker.clone());
        let ledger = RunLedger::open(temp.path()).await.unwrap();
        let weights = WeightTable::new(WeightBounds::default());

        let orchestrator = Arc::new(
            Orchestrator::new(
                config,
                registry,
                breakers,
                ledger,
                Arc::new(TracingNotifier),
                Arc::new(NoMetrics),
                weights,
            )
            .with_plan(plan),
        );
        orchestrator.start().await;
        orchestrator
    }

    #[tokio::test]
    async fn test_clean_run_completes_all_units() {
        let temp = TempDir::new().unwrap();
        let adapters: Vec<(&str, Arc<dyn CapabilityAdapter>)> = vec![
            ("discovery", FlakyAdapter::new("trendscan", 0, ErrorKind::Unknown)),
        ];
        let orchestrator = orchestrator_with(
            test_config(),
            &temp,
            adapters,
            StagePlan::up_to(OperationKind::Discover),
        )
        .await;

        let units = vec![
            ContentUnit::new("survival", "storm prep"),
            ContentUnit::new("survival", "water storage"),
        ];
        let report = orchestrator.run_cycle(units).await.unwrap();

        assert_eq!(report.completed(), 2);
        assert_eq!(report.quarantined(), 0);
        assert_eq!(orchestrator.state().await, SystemState::Running);
    }

    #[tokio::test]
    async fn test_transient_failure_heals_within_running() {
        let temp = TempDir::new().unwrap();
        let adapters: Vec<(&str, Arc<dyn CapabilityAdapter>)> = vec![
            ("discovery", FlakyAdapter::new("trendscan", 1, ErrorKind::Timeout)),
        ];
        let orchestrator = orchestrator_with(
            test_config(),
            &temp,
            adapters,
            StagePlan::up_to(OperationKind::Discover),
        )
        .await;

        let report = orchestrator
            .run_cycle(vec![ContentUnit::new("survival", "storm prep")])
            .await
            .unwrap();

        assert_eq!(report.completed(), 1);

        // The healed operation shows up in the ledger with its event
        let records = orchestrator.ledger().replay().await.unwrap();
        let healed = records
            .iter()
            .filter(|r| r.event_type == LedgerEventType::HealingApplied)
            .count();
        assert_eq!(healed, 1);
        let terminal = records
            .iter()
            .find(|r| r.event_type == LedgerEventType::OperationCompleted)
            .unwrap();
        assert_eq!(terminal.status, OperationStatus::Healed);
    }

    #[tokio::test]
    async fn test_paused_cycle_rejects_without_failing() {
        let temp = TempDir::new().unwrap();
        let adapters: Vec<(&str, Arc<dyn CapabilityAdapter>)> = vec![
            ("script", FlakyAdapter::new("alpha_llm", 0, ErrorKind::Unknown)),
        ];
        let orchestrator = orchestrator_with(
            test_config(),
            &temp,
            adapters,
            StagePlan::standard(),
        )
        .await;

        orchestrator.pause();
        assert_eq!(orchestrator.state().await, SystemState::Maintenance);

        let report = orchestrator
            .run_cycle(vec![ContentUnit::new("survival", "topic")])
            .await
            .unwrap();
        assert_eq!(report.paused(), 1);
        assert_eq!(report.completed(), 0);

        // Nothing reached the ledger
        assert!(orchestrator.ledger().replay().await.unwrap().is_empty());

        orchestrator.resume();
        assert_eq!(orchestrator.state().await, SystemState::Running);
    }

    #[tokio::test]
    async fn test_build_units_follows_niche_ranking() {
        let temp = TempDir::new().unwrap();
        let mut config = test_config();
        config.niches = vec!["survival".to_string(), "wealth".to_string()];
        let adapters: Vec<(&str, Arc<dyn CapabilityAdapter>)> = vec![
            ("script", FlakyAdapter::new("alpha_llm", 0, ErrorKind::Unknown)),
        ];
        let orchestrator = orchestrator_with(config, &temp, adapters, StagePlan::standard()).await;

        let units = orchestrator.build_units(4).await;
        assert_eq!(units.len(), 4);
        // Equal weights: ties break alphabetically, then round-robin
        assert_eq!(units[0].niche, "survival");
        assert_eq!(units[1].niche, "wealth");
        assert_eq!(units[2].niche, "survival");
    }

    #[tokio::test]
    async fn test_cycle_stats_survive_restart() {
        let temp = TempDir::new().unwrap();
        let stats_path = temp.path().join("state").join("cycle.json");

        {
            let mut registry = AdapterRegistry::new();
            registry.register(
                "discovery",
                FlakyAdapter::new("trendscan", 0, ErrorKind::Unknown),
            );
            let config = test_config();
            let breakers = BreakerRegistry::new(config.breaker.clone());
            let ledger = RunLedger::open(&temp.path().join("ledger")).await.unwrap();
            let orchestrator = Arc::new(
                Orchestrator::new(
                    config,
                    registry,
                    breakers,
                    ledger,
                    Arc::new(TracingNotifier),
                    Arc::new(NoMetrics),
                    WeightTable::new(WeightBounds::default()),
                )
                .with_plan(StagePlan::up_to(OperationKind::Discover))
                .with_stats_path(stats_path.clone()),
            );
            orchestrator.start().await;

            orchestrator
                .run_cycle(vec![ContentUnit::new("survival", "storm prep")])
                .await
                .unwrap();
            assert_eq!(orchestrator.cycle_stats().cycles_completed, 1);
        }

        // A fresh orchestrator restores the persisted counters
        let registry = AdapterRegistry::new();
        let config = test_config();
        let breakers = BreakerRegistry::new(config.breaker.clone());
        let ledger = RunLedger::open(&temp.path().join("ledger")).await.unwrap();
        let revived = Orchestrator::new(
            config,
            registry,
            breakers,
            ledger,
            Arc::new(TracingNotifier),
            Arc::new(NoMetrics),
            WeightTable::new(WeightBounds::default()),
        )
        .with_stats_path(stats_path);

        let stats = revived.cycle_stats();
        assert_eq!(stats.cycles_completed, 1);
        assert_eq!(stats.units_completed, 1);
    }

    #[tokio::test]
    async fn test_allocation_ratios_exposed() {
        let temp = TempDir::new().unwrap();
        let adapters: Vec<(&str, Arc<dyn CapabilityAdapter>)> = vec![
            ("script", FlakyAdapter::new("alpha_llm", 0, ErrorKind::Unknown)),
        ];
        let orchestrator = orchestrator_with(
            test_config(),
            &temp,
            adapters,
            StagePlan::standard(),
        )
        .await;

        let (reinvest, reserve, payout) = orchestrator.allocation();
        assert!((reinvest + reserve + payout - 1.0).abs() < 1e-9);
    }
}
