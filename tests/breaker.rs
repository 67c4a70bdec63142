//! Circuit Breaker Integration Tests
//!
//! End-to-end breaker behavior through the orchestrator: threshold
//! opening, the zero-call invariant while open, and recovery via the
//! half-open trial.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tempfile::TempDir;

use vigil::adapters::{
    AdapterOutput, AdapterRegistry, CapabilityAdapter, MetricsSource, OutcomeMetrics,
    TracingNotifier,
};
use vigil::config::{BreakerConfig, Config};
use vigil::core::{BreakerRegistry, ContentUnit, Orchestrator, RunLedger, StagePlan};
use vigil::domain::{
    CircuitState, ErrorKind, OperationKind, PipelineError, WeightBounds, WeightTable,
};

/// Adapter that always fails and counts how often it was actually called
struct CountingFailAdapter {
    name: String,
    calls: Arc<AtomicU32>,
    kind: ErrorKind,
}

#[async_trait]
impl CapabilityAdapter for CountingFailAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(
        &self,
        _kind: OperationKind,
        _payload: &str,
    ) -> Result<AdapterOutput, PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(PipelineError::adapter(&self.name, self.kind, "always down"))
    }
}

struct NoMetrics;

#[async_trait]
impl MetricsSource for NoMetrics {
    async fn outcome_metrics(
        &self,
        _unit_id: &str,
        _since: chrono::DateTime<chrono::Utc>,
    ) -> anyhow::Result<Option<OutcomeMetrics>> {
        Ok(None)
    }
}

fn config() -> Config {
    let mut config = Config::default();
    config.breaker = BreakerConfig {
        failure_threshold: 3,
        window_seconds: 300,
        cooldown_seconds: 300,
        cooldown_ceiling_seconds: 1200,
    };
    config.healing.retry_pause_ms = 1;
    config.orchestrator.concurrency = 1;
    config.niches = vec!["survival".to_string()];
    config
}

async fn single_provider_orchestrator(
    temp: &TempDir,
    calls: Arc<AtomicU32>,
) -> Arc<Orchestrator> {
    let mut registry = AdapterRegistry::new();
    registry.register(
        "discovery",
        Arc::new(CountingFailAdapter {
            name: "trendscan".to_string(),
            calls,
            kind: ErrorKind::Timeout,
        }),
    );

    let config = config();
    let breakers = BreakerRegistry::new(config.breaker.clone());
    let ledger = RunLedger::open(temp.path()).await.unwrap();

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
        .with_plan(StagePlan::up_to(OperationKind::Discover)),
    );
    orchestrator.start().await;
    orchestrator
}

#[tokio::test]
async fn test_three_failures_open_circuit_and_short_circuit_calls() {
    let temp = TempDir::new().unwrap();
    let calls = Arc::new(AtomicU32::new(0));
    let orchestrator = single_provider_orchestrator(&temp, Arc::clone(&calls)).await;

    let units = vec![
        ContentUnit::new("survival", "storm prep"),
        ContentUnit::new("survival", "water storage"),
        ContentUnit::new("survival", "first aid"),
    ];
    let report = orchestrator.run_cycle(units).await.unwrap();

    // All three units end up quarantined; the pipeline never halts
    assert_eq!(report.quarantined(), 3);

    // Unit 1 burns two attempts (initial + same-provider retry), unit 2's
    // first attempt is the third failure that trips the breaker. After
    // that the adapter is never invoked again.
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        orchestrator.breakers().state_of("trendscan").await,
        CircuitState::Open
    );

    // Further cycles are short-circuited entirely
    let report = orchestrator
        .run_cycle(vec![ContentUnit::new("survival", "bunker basics")])
        .await
        .unwrap();
    assert_eq!(report.quarantined(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_breaker_registry_window_semantics() {
    let registry = BreakerRegistry::new(BreakerConfig {
        failure_threshold: 3,
        window_seconds: 300,
        cooldown_seconds: 300,
        cooldown_ceiling_seconds: 1200,
    });
    let now = Utc::now();

    // Two failures now, one much later: never three inside one window
    registry.record_outcome_at("uploader", false, now).await;
    registry
        .record_outcome_at("uploader", true, now + Duration::minutes(1))
        .await;
    registry
        .record_outcome_at("uploader", false, now + Duration::minutes(2))
        .await;
    registry
        .record_outcome_at("uploader", true, now + Duration::minutes(3))
        .await;
    registry
        .record_outcome_at("uploader", false, now + Duration::minutes(7))
        .await;

    assert_eq!(
        registry.state_of("uploader").await,
        CircuitState::Closed
    );

    // Three failures inside the window open it
    registry
        .record_outcome_at("uploader", false, now + Duration::minutes(8))
        .await;
    registry
        .record_outcome_at("uploader", false, now + Duration::minutes(9))
        .await;
    assert_eq!(registry.state_of("uploader").await, CircuitState::Open);
}

#[tokio::test]
async fn test_half_open_trial_and_recovery() {
    let registry = BreakerRegistry::new(BreakerConfig {
        failure_threshold: 2,
        window_seconds: 300,
        cooldown_seconds: 60,
        cooldown_ceiling_seconds: 480,
    });
    let now = Utc::now();

    registry.record_outcome_at("renderer", false, now).await;
    registry.record_outcome_at("renderer", false, now).await;
    assert_eq!(registry.state_of("renderer").await, CircuitState::Open);

    // Before the cool-down: short-circuited
    assert!(registry.is_open_at("renderer", now + Duration::seconds(30)).await);

    // After the cool-down: one trial allowed, the next caller is refused
    let after = now + Duration::seconds(61);
    assert!(!registry.is_open_at("renderer", after).await);
    assert!(registry.is_open_at("renderer", after).await);

    // Trial succeeds: closed with a clean slate
    registry.record_outcome_at("renderer", true, after).await;
    let health = registry.health_of("renderer").await.unwrap();
    assert_eq!(health.state, CircuitState::Closed);
    assert_eq!(health.consecutive_failures, 0);
    assert_eq!(health.rolling_count(), 0);
}

#[tokio::test]
async fn test_failed_trials_back_off_exponentially() {
    let registry = BreakerRegistry::new(BreakerConfig {
        failure_threshold: 2,
        window_seconds: 300,
        cooldown_seconds: 60,
        cooldown_ceiling_seconds: 240,
    });
    let mut now = Utc::now();

    registry.record_outcome_at("renderer", false, now).await;
    registry.record_outcome_at("renderer", false, now).await;

    // 60 -> 120 -> 240 -> 240 (ceiling)
    for expected in [120u64, 240, 240] {
        now = now + Duration::seconds(241);
        assert!(!registry.is_open_at("renderer", now).await);
        registry.record_outcome_at("renderer", false, now).await;

        let health = registry.health_of("renderer").await.unwrap();
        assert_eq!(health.cooldown_seconds, expected);
    }
}

#[tokio::test]
async fn test_manual_reset_reopens_traffic() {
    let temp = TempDir::new().unwrap();
    let calls = Arc::new(AtomicU32::new(0));
    let orchestrator = single_provider_orchestrator(&temp, Arc::clone(&calls)).await;

    // Trip the breaker
    let units = (0..3)
        .map(|i| ContentUnit::new("survival", &format!("topic {i}")))
        .collect();
    orchestrator.run_cycle(units).await.unwrap();
    assert_eq!(
        orchestrator.breakers().state_of("trendscan").await,
        CircuitState::Open
    );

    // Operator override puts the component back in rotation
    orchestrator.breakers().reset("trendscan").await;
    assert_eq!(
        orchestrator.breakers().state_of("trendscan").await,
        CircuitState::Closed
    );

    let before = calls.load(Ordering::SeqCst);
    orchestrator
        .run_cycle(vec![ContentUnit::new("survival", "restock")])
        .await
        .unwrap();
    assert!(calls.load(Ordering::SeqCst) > before);
}
