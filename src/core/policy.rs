//! Retry/failover policy engine.
//!
//! Maps a tagged error to the next healing strategy from an ordered,
//! per-class table. The tables are data; the fail-over order is the
//! ranked provider list, not nested control flow. Strategy escalation is
//! monotonic and capped, so every operation terminates.

use std::collections::HashMap;
use std::time::Duration;

use crate::config::HealingConfig;
use crate::domain::{ErrorClass, ErrorKind, Operation, Strategy};

/// Ordered strategy chains, escalating in destructiveness
const TRANSIENT_CHAIN: &[Strategy] = &[
    Strategy::RetrySame,
    Strategy::FailOverProvider,
    Strategy::Quarantine,
];

const INPUT_QUALITY_CHAIN: &[Strategy] = &[
    Strategy::SimplifyRetry,
    Strategy::ProxySubstitute,
    Strategy::DecomposeRetry,
    Strategy::FailOverProvider,
    Strategy::Quarantine,
];

const UNAVAILABLE_CHAIN: &[Strategy] = &[Strategy::FailOverProvider, Strategy::Quarantine];

const UNKNOWN_CHAIN: &[Strategy] = &[
    Strategy::RetrySame,
    Strategy::SimplifyRetry,
    Strategy::FailOverProvider,
    Strategy::Quarantine,
];

/// Context the orchestrator supplies with each decision
#[derive(Debug, Clone, Copy)]
pub struct DecisionContext {
    /// The failing component's circuit is currently open
    pub circuit_open: bool,

    /// At least one alternate provider with a closed circuit remains
    pub alternates_available: bool,
}

/// Deterministic strategy selection for failed operations
pub struct PolicyEngine {
    healing: HealingConfig,

    /// Nearby-alternative topic substitutions for `ProxySubstitute`
    fallback_topics: HashMap<String, String>,
}

impl PolicyEngine {
    pub fn new(healing: HealingConfig, fallback_topics: HashMap<String, String>) -> Self {
        Self {
            healing,
            fallback_topics,
        }
    }

    /// Pick the strategy for a failed operation
    ///
    /// `rank` is how many strategies have already been applied to this
    /// operation. The chain is filtered to applicable entries first, then
    /// indexed by rank; walking past the end saturates on `Quarantine`,
    /// and reaching the attempt ceiling forces it outright.
    pub fn decide(&self, op: &Operation, error: ErrorKind, rank: u32, ctx: DecisionContext) -> Strategy {
        let ceiling = self.healing.attempt_ceiling(op.kind.capability());
        if op.attempts >= ceiling {
            return Strategy::Quarantine;
        }

        let chain = if ctx.circuit_open {
            // An open circuit rules out every same-provider strategy
            UNAVAILABLE_CHAIN
        } else {
            match error.class() {
                ErrorClass::Transient => TRANSIENT_CHAIN,
                ErrorClass::InputQuality => INPUT_QUALITY_CHAIN,
                ErrorClass::CapabilityUnavailable => UNAVAILABLE_CHAIN,
                ErrorClass::Unknown => UNKNOWN_CHAIN,
            }
        };

        let applicable: Vec<Strategy> = chain
            .iter()
            .copied()
            .filter(|s| match s {
                Strategy::DecomposeRetry => op.kind.supports_decomposition(),
                Strategy::FailOverProvider => ctx.alternates_available,
                _ => true,
            })
            .collect();

        let index = (rank as usize).min(applicable.len().saturating_sub(1));
        let strategy = applicable[index];

        // Quarantine is only reached once the providers are exhausted:
        // past the end of the chain, keep failing over while untried
        // closed-circuit providers remain.
        if strategy == Strategy::Quarantine && ctx.alternates_available {
            return Strategy::FailOverProvider;
        }
        strategy
    }

    /// Pause before a same-provider retry
    pub fn retry_pause(&self) -> Duration {
        Duration::from_millis(self.healing.retry_pause_ms)
    }

    /// Reduce input complexity deterministically
    ///
    /// Strips bracketed and parenthesized optional modifiers and collapses
    /// whitespace. Applying it twice yields the same result.
    pub fn simplify(&self, input: &str) -> String {
        let mut out = String::with_capacity(input.len());
        let mut depth_square = 0u32;
        let mut depth_round = 0u32;

        for c in input.chars() {
            match c {
                '[' => depth_square += 1,
                ']' => depth_square = depth_square.saturating_sub(1),
                '(' => depth_round += 1,
                ')' => depth_round = depth_round.saturating_sub(1),
                _ if depth_square == 0 && depth_round == 0 => out.push(c),
                _ => {}
            }
        }

        out.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    /// Swap the input for a semantically nearby alternative
    ///
    /// Uses the configured fallback topic table when a key matches;
    /// otherwise falls back to the lead sentence.
    pub fn proxy_substitute(&self, input: &str) -> String {
        let lowered = input.to_lowercase();
        for (topic, alternative) in &self.fallback_topics {
            if lowered.contains(&topic.to_lowercase()) {
                return lowered.replace(&topic.to_lowercase(), alternative);
            }
        }

        // No configured alternative: keep only the lead sentence
        match input.split_once('.') {
            Some((lead, _)) => format!("{}.", lead.trim()),
            None => input.trim().to_string(),
        }
    }

    /// Split a unit of work into two smaller sub-units
    ///
    /// Splits at the sentence boundary nearest the midpoint; single
    /// sentences split at the nearest word boundary instead.
    pub fn decompose(&self, input: &str) -> Vec<String> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return vec![String::new()];
        }

        let midpoint = trimmed.len() / 2;

        // Prefer a sentence boundary near the midpoint
        let sentence_split = trimmed
            .char_indices()
            .filter(|(_, c)| *c == '.')
            .map(|(i, _)| i + 1)
            .filter(|i| *i < trimmed.len())
            .min_by_key(|i| i.abs_diff(midpoint));

        let split_at = sentence_split.or_else(|| {
            trimmed
                .char_indices()
                .filter(|(_, c)| *c == ' ')
                .map(|(i, _)| i)
                .min_by_key(|i| i.abs_diff(midpoint))
        });

        match split_at {
            Some(i) => {
                let (head, tail) = trimmed.split_at(i);
                let head = head.trim().to_string();
                let tail = tail.trim().to_string();
                if head.is_empty() || tail.is_empty() {
                    vec![trimmed.to_string()]
                } else {
                    vec![head, tail]
                }
            }
            None => vec![trimmed.to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OperationKind;

    fn engine() -> PolicyEngine {
        PolicyEngine::new(
            HealingConfig::default(),
            [("solar storms".to_string(), "grid failures".to_string())]
                .into_iter()
                .collect(),
        )
    }

    fn op(kind: OperationKind, attempts: u32) -> Operation {
        let mut op = Operation::new(kind, "alpha_llm", "unit-1", "topic");
        op.attempts = attempts;
        op
    }

    const OPEN: DecisionContext = DecisionContext {
        circuit_open: true,
        alternates_available: true,
    };
    const HEALTHY: DecisionContext = DecisionContext {
        circuit_open: false,
        alternates_available: true,
    };
    const NO_ALTERNATES: DecisionContext = DecisionContext {
        circuit_open: false,
        alternates_available: false,
    };

    #[test]
    fn test_timeout_retries_same_first() {
        let engine = engine();
        let op = op(OperationKind::ScriptGen, 1);

        assert_eq!(
            engine.decide(&op, ErrorKind::Timeout, 0, HEALTHY),
            Strategy::RetrySame
        );
        assert_eq!(
            engine.decide(&op, ErrorKind::Timeout, 1, HEALTHY),
            Strategy::FailOverProvider
        );
        // Providers exhausted: the chain ends in quarantine
        assert_eq!(
            engine.decide(&op, ErrorKind::Timeout, 2, NO_ALTERNATES),
            Strategy::Quarantine
        );
    }

    #[test]
    fn test_failover_repeats_until_providers_exhausted() {
        let engine = engine();
        let op = op(OperationKind::ScriptGen, 1);

        // Past the end of the chain, untried providers keep the operation
        // failing over instead of quarantining early
        assert_eq!(
            engine.decide(&op, ErrorKind::Timeout, 2, HEALTHY),
            Strategy::FailOverProvider
        );
        assert_eq!(
            engine.decide(&op, ErrorKind::Timeout, 7, HEALTHY),
            Strategy::FailOverProvider
        );
    }

    #[test]
    fn test_validation_escalates_through_degradations() {
        let engine = engine();
        let op = op(OperationKind::ScriptGen, 1);

        let sequence: Vec<Strategy> = (0..4)
            .map(|rank| engine.decide(&op, ErrorKind::Validation, rank, HEALTHY))
            .collect();

        assert_eq!(
            sequence,
            vec![
                Strategy::SimplifyRetry,
                Strategy::ProxySubstitute,
                Strategy::DecomposeRetry,
                Strategy::FailOverProvider,
            ]
        );

        // Once no alternate provider remains, the chain ends in quarantine
        assert_eq!(
            engine.decide(&op, ErrorKind::Validation, 4, NO_ALTERNATES),
            Strategy::Quarantine
        );
    }

    #[test]
    fn test_decompose_skipped_for_atomic_kinds() {
        let engine = engine();
        let op = op(OperationKind::Publish, 1);

        // Publish cannot be decomposed: rank 2 goes straight to fail-over
        assert_eq!(
            engine.decide(&op, ErrorKind::Asset, 2, HEALTHY),
            Strategy::FailOverProvider
        );
    }

    #[test]
    fn test_open_circuit_forces_failover() {
        let engine = engine();
        let op = op(OperationKind::ScriptGen, 1);

        assert_eq!(
            engine.decide(&op, ErrorKind::Validation, 0, OPEN),
            Strategy::FailOverProvider
        );
    }

    #[test]
    fn test_no_alternates_saturates_on_quarantine() {
        let engine = engine();
        let op = op(OperationKind::ScriptGen, 1);

        assert_eq!(
            engine.decide(&op, ErrorKind::Timeout, 1, NO_ALTERNATES),
            Strategy::Quarantine
        );
        // Past the end of any chain: still quarantine
        assert_eq!(
            engine.decide(&op, ErrorKind::Validation, 99, NO_ALTERNATES),
            Strategy::Quarantine
        );
    }

    #[test]
    fn test_attempt_ceiling_forces_quarantine() {
        let engine = engine();
        let op = op(OperationKind::ScriptGen, HealingConfig::default().max_attempts);

        assert_eq!(
            engine.decide(&op, ErrorKind::Timeout, 0, HEALTHY),
            Strategy::Quarantine
        );
    }

    #[test]
    fn test_simplify_strips_modifiers() {
        let engine = engine();
        let simplified =
            engine.simplify("storm prep [cinematic drone shots] checklist (4k, moody)");
        assert_eq!(simplified, "storm prep checklist");

        // Idempotent
        assert_eq!(engine.simplify(&simplified), simplified);
    }

    #[test]
    fn test_proxy_uses_fallback_table() {
        let engine = engine();
        assert_eq!(
            engine.proxy_substitute("why Solar Storms matter"),
            "why grid failures matter"
        );
    }

    #[test]
    fn test_proxy_falls_back_to_lead_sentence() {
        let engine = engine();
        assert_eq!(
            engine.proxy_substitute("First point. Second point. Third."),
            "First point."
        );
    }

    #[test]
    fn test_decompose_splits_near_midpoint() {
        let engine = engine();
        let parts = engine.decompose("Open with the hook. Build tension. Close with the call.");
        assert_eq!(parts.len(), 2);
        assert!(parts[0].ends_with('.'));
        assert_eq!(
            format!("{} {}", parts[0], parts[1]),
            "Open with the hook. Build tension. Close with the call."
        );
    }

    #[test]
    fn test_decompose_single_word_stays_whole() {
        let engine = engine();
        assert_eq!(engine.decompose("indivisible"), vec!["indivisible"]);
    }
}
