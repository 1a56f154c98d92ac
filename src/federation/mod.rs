//! Federated coordinator: routing, dirty-row exclusion, and cold-tier
//! execution behind one read path.
//!
//! Reads either delegate to the hot-tier repository or run the cold
//! template against the analytic engine with the current dirty-id set
//! anti-joined out, so analytic reads never serve rows the flusher has not
//! caught up with.

pub mod routing;

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use crate::config::{EngineConfig, StorageTables};
use crate::error::{LtBaseError, Result};
use crate::query::condition::{Anchor, duck_exclusion_clause, to_dual_clauses};
use crate::query::paged::{PagedQueryParams, SqlDialect, build_paged_query, resolve_sort_keys};
use crate::query::{FederatedQuery, PageCounters, QueryPage};
use crate::record::ScalarValue;
use crate::storage::duckdb::{DuckDbClient, exclusion_args};
use crate::storage::postgres::{DEFAULT_PAGE_LIMIT, PostgresRepository};
use self::routing::{RoutingDecision, Tier, evaluate_routing_policy};

/// Runtime options of one federated read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOptions {
    /// Expected result-set bound, fed to the routing policy.
    pub max_rows: i64,
    /// Reserved for cold-tier scan parallelism hints.
    pub parallelism: usize,
    /// Fall back to the hot tier when the cold path fails.
    pub allow_partial_degraded_mode: bool,
    pub include_execution_plan: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            max_rows: DEFAULT_PAGE_LIMIT,
            parallelism: 0,
            allow_partial_degraded_mode: false,
            include_execution_plan: false,
        }
    }
}

/// Per-source slice of an execution plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcePlan {
    pub tier: Tier,
    pub engine: &'static str,
    pub sql: String,
    pub predicate_pushdown: bool,
    pub row_count: usize,
    pub duration_ms: u64,
}

/// How federated results are reconciled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergePlan {
    pub strategy: &'static str,
    pub prefer_hot: bool,
    pub dedup_keys: [&'static str; 2],
}

impl MergePlan {
    fn new(prefer_hot: bool) -> Self {
        Self {
            strategy: "last-write-wins",
            prefer_hot,
            dedup_keys: ["schema_id", "row_id"],
        }
    }
}

/// Stage timings of one federated read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageTimings {
    pub translate_ms: u64,
    pub fetch_ms: u64,
    pub total_ms: u64,
}

/// Captured execution plan, populated when the caller asks for one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    pub decision: RoutingDecision,
    pub sources: Vec<SourcePlan>,
    pub merge: MergePlan,
    pub timings: StageTimings,
    pub notes: Vec<String>,
}

/// One federated read result.
#[derive(Debug)]
pub struct FederatedResult {
    pub page: QueryPage,
    pub plan: Option<ExecutionPlan>,
}

/// Combines routing, dirty-id exclusion and cold-tier execution.
pub struct FederatedCoordinator {
    repo: Arc<PostgresRepository>,
    cold: Option<Arc<DuckDbClient>>,
    config: EngineConfig,
}

impl FederatedCoordinator {
    #[must_use]
    pub fn new(
        repo: Arc<PostgresRepository>,
        cold: Option<Arc<DuckDbClient>>,
        config: EngineConfig,
    ) -> Self {
        Self { repo, cold, config }
    }

    /// Route and execute one federated read.
    pub async fn query_federated(
        &self,
        tables: &StorageTables,
        query: &FederatedQuery,
        options: &QueryOptions,
    ) -> Result<FederatedResult> {
        let started = Instant::now();
        tables.validate_for_read()?;

        // The cold path engages only when the caller explicitly asks for
        // non-hot tiers.
        let hints = &query.hints;
        let hot_only = hints.preferred_tiers.is_empty()
            || hints.prefer_hot
            || hints.preferred_tiers == [Tier::Hot];
        if hot_only {
            let decision = RoutingDecision {
                tiers: vec![Tier::Hot],
                use_cold: false,
                reason: "caller pinned the hot tier".to_string(),
                max_scan_rows: self.config.routing.max_cold_scan_rows,
                query_timeout: self.config.query_timeout(),
            };
            return self
                .hot_path(tables, query, options, decision, started, Vec::new())
                .await;
        }

        let decision = evaluate_routing_policy(&self.config, hints, options);
        if !decision.use_cold {
            return self
                .hot_path(tables, query, options, decision, started, Vec::new())
                .await;
        }

        match self.execute_cold(tables, query, options, &decision).await {
            Ok(mut result) => {
                if let Some(plan) = &mut result.plan {
                    plan.timings.total_ms = duration_ms(started);
                }
                Ok(result)
            }
            Err(error) if options.allow_partial_degraded_mode => {
                warn!(%error, "cold tier failed, degrading to hot tier");
                let note = format!("cold tier failed, degraded to hot: {error}");
                self.hot_path(tables, query, options, decision, started, vec![note])
                    .await
            }
            Err(error) => Err(error),
        }
    }

    async fn hot_path(
        &self,
        tables: &StorageTables,
        query: &FederatedQuery,
        options: &QueryOptions,
        decision: RoutingDecision,
        started: Instant,
        notes: Vec<String>,
    ) -> Result<FederatedResult> {
        let fetch_started = Instant::now();
        let page = self.repo.query(tables, query).await?;

        let plan = options.include_execution_plan.then(|| {
            let pushdown_sql = self
                .inspect_pushdown(tables, query)
                .unwrap_or_default();
            ExecutionPlan {
                decision,
                sources: vec![SourcePlan {
                    tier: Tier::Hot,
                    engine: "postgres",
                    sql: pushdown_sql.clone(),
                    predicate_pushdown: !pushdown_sql.is_empty(),
                    row_count: page.records.len(),
                    duration_ms: duration_ms(fetch_started),
                }],
                merge: MergePlan::new(query.hints.prefer_hot),
                timings: StageTimings {
                    translate_ms: 0,
                    fetch_ms: duration_ms(fetch_started),
                    total_ms: duration_ms(started),
                },
                notes,
            }
        });
        Ok(FederatedResult { page, plan })
    }

    /// The hot tier's pushdown clause, compiled for plan inspection only.
    fn inspect_pushdown(&self, tables: &StorageTables, query: &FederatedQuery) -> Option<String> {
        let schema_id = self.repo.cache().schema_id(&query.schema)?;
        let attrs = self.repo.cache().attributes(&query.schema)?;
        let mut param_index = 2;
        to_dual_clauses(
            query.condition.as_ref(),
            &tables.eav,
            schema_id,
            &attrs,
            &mut param_index,
        )
        .ok()
        .map(|dual| dual.pg_main_clause)
    }

    async fn execute_cold(
        &self,
        tables: &StorageTables,
        query: &FederatedQuery,
        options: &QueryOptions,
        decision: &RoutingDecision,
    ) -> Result<FederatedResult> {
        let cold = self.cold.as_ref().ok_or(LtBaseError::ColdTierUnavailable)?;

        let translate_started = Instant::now();
        let schema_id = self
            .repo
            .cache()
            .schema_id(&query.schema)
            .ok_or_else(|| LtBaseError::SchemaNotFound {
                schema: query.schema.clone(),
            })?;
        let attrs = self
            .repo
            .cache()
            .attributes(&query.schema)
            .ok_or_else(|| LtBaseError::SchemaNotFound {
                schema: query.schema.clone(),
            })?;

        // Exclude rows the flusher has not caught up with.
        let dirty_ids = match &tables.change_log {
            Some(change_log) => {
                self.repo
                    .fetch_dirty_row_ids(change_log, schema_id)
                    .await?
            }
            None => Vec::new(),
        };

        let mut param_index = 2;
        let dual = to_dual_clauses(
            query.condition.as_ref(),
            &tables.eav,
            schema_id,
            &attrs,
            &mut param_index,
        )?;
        let exclusion_sql = duck_exclusion_clause(dirty_ids.len());
        let exclusion: Vec<ScalarValue> = exclusion_args(&dirty_ids);

        let limit = if query.limit <= 0 {
            DEFAULT_PAGE_LIMIT
        } else {
            query.limit
        };
        let offset = query.offset.max(0);
        let sort_keys = resolve_sort_keys(&query.sort, &attrs);

        let paged = build_paged_query(&PagedQueryParams {
            dialect: SqlDialect::DuckDb,
            main_table: &tables.main,
            eav_table: &tables.eav,
            anchor: Anchor::Main,
            condition_sql: &dual.duck_clause,
            condition_args: &dual.duck_args,
            exclusion_sql: &exclusion_sql,
            exclusion_args: &exclusion,
            sort_keys: &sort_keys,
            schema_id,
            limit,
            offset,
            next_param_index: param_index,
        })?;
        let translate_ms = duration_ms(translate_started);

        debug!(
            schema = %query.schema,
            dirty = dirty_ids.len(),
            reason = %decision.reason,
            "executing cold tier read"
        );

        let fetch_started = Instant::now();
        let duck_args: Vec<duckdb::types::Value> =
            paged.args.iter().map(ScalarValue::to_duck).collect();
        let scanned = cold.query_paged(paged.sql.clone(), duck_args).await?;
        let fetch_ms = duration_ms(fetch_started);

        let mut counters = PageCounters::default();
        let mut records = Vec::with_capacity(scanned.len());
        for (record, row_counters) in scanned {
            counters = row_counters;
            records.push(record);
        }
        let page = QueryPage { records, counters };

        let plan = options.include_execution_plan.then(|| {
            let mut notes = Vec::new();
            if !dual.pg_main_clause.is_empty() {
                notes.push(format!("hot pushdown (inspection): {}", dual.pg_main_clause));
            }
            ExecutionPlan {
                decision: decision.clone(),
                sources: vec![SourcePlan {
                    tier: Tier::Cold,
                    engine: "duckdb",
                    sql: paged.sql,
                    predicate_pushdown: !dual.duck_clause.is_empty(),
                    row_count: page.records.len(),
                    duration_ms: fetch_ms,
                }],
                merge: MergePlan::new(query.hints.prefer_hot),
                timings: StageTimings {
                    translate_ms,
                    fetch_ms,
                    total_ms: 0,
                },
                notes,
            }
        });

        Ok(FederatedResult { page, plan })
    }
}

fn duration_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_plan_dedups_on_the_record_key() {
        let merge = MergePlan::new(true);
        assert_eq!(merge.strategy, "last-write-wins");
        assert_eq!(merge.dedup_keys, ["schema_id", "row_id"]);
        assert!(merge.prefer_hot);
    }

    #[test]
    fn default_options_stay_on_the_safe_path() {
        let options = QueryOptions::default();
        assert!(!options.allow_partial_degraded_mode);
        assert!(!options.include_execution_plan);
        assert_eq!(options.max_rows, DEFAULT_PAGE_LIMIT);
    }
}
