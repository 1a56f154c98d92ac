//! Routing policy: a pure function from configuration, query hints and
//! runtime options to a per-query tier decision.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::EngineConfig;
use crate::federation::QueryOptions;
use crate::query::QueryHints;

/// Result-set size below which the hybrid strategy keeps queries hot.
const HYBRID_MIN_COLD_ROWS: i64 = 1000;

/// Storage tier. `Warm` is reserved: no component materializes it yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Hot,
    Warm,
    Cold,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Hot => "hot",
            Self::Warm => "warm",
            Self::Cold => "cold",
        };
        f.write_str(name)
    }
}

/// Per-query routing decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingDecision {
    pub tiers: Vec<Tier>,
    pub use_cold: bool,
    pub reason: String,
    pub max_scan_rows: i64,
    pub query_timeout: Duration,
}

/// Evaluate the routing policy. Rules apply in order: defaults, explicit
/// tier hints, the global engine switch, the configured strategy, and the
/// object-store gate; a hot-only outcome collapses the tier list.
#[must_use]
pub fn evaluate_routing_policy(
    config: &EngineConfig,
    hints: &QueryHints,
    options: &QueryOptions,
) -> RoutingDecision {
    let mut decision = RoutingDecision {
        tiers: vec![Tier::Hot, Tier::Warm, Tier::Cold],
        use_cold: config.enabled,
        reason: "default".to_string(),
        max_scan_rows: config.routing.max_cold_scan_rows,
        query_timeout: config.query_timeout(),
    };

    if !hints.preferred_tiers.is_empty() {
        decision.tiers = hints.preferred_tiers.clone();
        decision.reason = "explicit tier hint".to_string();
    }

    if !config.enabled {
        decision.use_cold = false;
        decision.tiers = vec![Tier::Hot];
        decision.reason = "engine disabled".to_string();
    }

    match config.routing.strategy.as_str() {
        "freshness-first" => {
            if hints.prefer_hot {
                decision.use_cold = false;
                decision.reason = "freshness-first: caller prefers hot".to_string();
            }
        }
        "cost-first" => {
            if config.enabled && options.max_rows > config.routing.max_cold_scan_rows {
                decision.use_cold = true;
                decision.reason = format!(
                    "cost-first: {} rows exceeds cold scan threshold {}",
                    options.max_rows, config.routing.max_cold_scan_rows
                );
            }
        }
        "hybrid" => {
            if hints.prefer_hot {
                decision.use_cold = false;
                decision.reason = "hybrid: caller prefers hot".to_string();
            } else if options.max_rows < HYBRID_MIN_COLD_ROWS {
                decision.use_cold = false;
                decision.reason =
                    format!("hybrid: small result set ({} rows)", options.max_rows);
            } else if config.enabled {
                decision.use_cold = true;
                decision.reason = "hybrid: large result set".to_string();
            }
        }
        other => {
            warn!(strategy = %other, "unknown routing strategy, defaults stand");
            decision.reason = format!("unknown strategy {other:?}, defaults stand");
        }
    }

    if !config.routing.allow_object_store_fallback {
        decision.use_cold = false;
        decision.reason = "object store fallback disabled".to_string();
    }

    if !decision.use_cold {
        decision.tiers = vec![Tier::Hot];
    }
    decision
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RoutingConfig;

    fn config(enabled: bool, strategy: &str) -> EngineConfig {
        EngineConfig {
            enabled,
            routing: RoutingConfig {
                strategy: strategy.to_string(),
                ..RoutingConfig::default()
            },
            ..EngineConfig::default()
        }
    }

    fn options(max_rows: i64) -> QueryOptions {
        QueryOptions {
            max_rows,
            ..QueryOptions::default()
        }
    }

    #[test]
    fn default_tiers_follow_engine_switch() {
        let decision = evaluate_routing_policy(
            &config(true, "unknown-strategy"),
            &QueryHints::default(),
            &options(10),
        );
        assert!(decision.use_cold);
        assert_eq!(decision.tiers, vec![Tier::Hot, Tier::Warm, Tier::Cold]);
        assert!(decision.reason.contains("unknown strategy"));
    }

    #[test]
    fn disabled_engine_collapses_to_hot() {
        let decision = evaluate_routing_policy(
            &config(false, "hybrid"),
            &QueryHints::default(),
            &options(1_000_000),
        );
        assert!(!decision.use_cold);
        assert_eq!(decision.tiers, vec![Tier::Hot]);
    }

    #[test]
    fn hybrid_small_result_set_stays_hot() {
        let decision = evaluate_routing_policy(
            &config(true, "hybrid"),
            &QueryHints::default(),
            &options(500),
        );
        assert!(!decision.use_cold);
        assert!(decision.reason.contains("small result set"));
        assert_eq!(decision.tiers, vec![Tier::Hot]);
    }

    #[test]
    fn hybrid_large_result_set_goes_cold() {
        let decision = evaluate_routing_policy(
            &config(true, "hybrid"),
            &QueryHints::default(),
            &options(50_000),
        );
        assert!(decision.use_cold);
    }

    #[test]
    fn hybrid_prefer_hot_forces_hot() {
        let hints = QueryHints {
            prefer_hot: true,
            ..QueryHints::default()
        };
        let decision = evaluate_routing_policy(&config(true, "hybrid"), &hints, &options(50_000));
        assert!(!decision.use_cold);
    }

    #[test]
    fn cost_first_forces_cold_over_threshold() {
        let mut cfg = config(true, "cost-first");
        cfg.routing.max_cold_scan_rows = 10_000;
        let decision =
            evaluate_routing_policy(&cfg, &QueryHints::default(), &options(20_000));
        assert!(decision.use_cold);
        assert!(decision.reason.contains("cost-first"));

        let decision = evaluate_routing_policy(&cfg, &QueryHints::default(), &options(100));
        // Under the threshold the default (engine enabled) stands.
        assert!(decision.use_cold);
        assert_eq!(decision.reason, "default");
    }

    #[test]
    fn freshness_first_honors_prefer_hot() {
        let hints = QueryHints {
            prefer_hot: true,
            ..QueryHints::default()
        };
        let decision =
            evaluate_routing_policy(&config(true, "freshness-first"), &hints, &options(50_000));
        assert!(!decision.use_cold);
        assert_eq!(decision.tiers, vec![Tier::Hot]);
    }

    #[test]
    fn explicit_tier_hints_survive_when_cold() {
        let hints = QueryHints {
            preferred_tiers: vec![Tier::Cold],
            ..QueryHints::default()
        };
        let decision = evaluate_routing_policy(&config(true, "hybrid"), &hints, &options(50_000));
        assert!(decision.use_cold);
        assert_eq!(decision.tiers, vec![Tier::Cold]);
    }

    #[test]
    fn object_store_gate_wins_last() {
        let mut cfg = config(true, "hybrid");
        cfg.routing.allow_object_store_fallback = false;
        let decision =
            evaluate_routing_policy(&cfg, &QueryHints::default(), &options(50_000));
        assert!(!decision.use_cold);
        assert_eq!(decision.tiers, vec![Tier::Hot]);
    }
}
