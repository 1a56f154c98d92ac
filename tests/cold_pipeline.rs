//! End-to-end coverage of the optimized paged query and the federated read
//! path against an in-memory analytic engine.

mod common;

use common::{
    ATTR_FEEDBACK, VISIT_SCHEMA, Visit, cold_client, engine_config, offline_repo, seed_visit,
    tables, visit_cache,
};
use ltbase::error::LtBaseError;
use ltbase::federation::{FederatedCoordinator, QueryOptions};
use ltbase::query::condition::{Anchor, duck_exclusion_clause, to_dual_clauses};
use ltbase::query::paged::{PagedQueryParams, SqlDialect, build_paged_query, resolve_sort_keys};
use ltbase::query::{Condition, FederatedQuery, QueryHints, SortKey};
use ltbase::record::ScalarValue;
use ltbase::{Tier, logging};

fn visit_query(condition: Option<Condition>) -> FederatedQuery {
    FederatedQuery {
        schema: VISIT_SCHEMA.to_string(),
        condition,
        sort: vec![SortKey {
            attr: "visited_at".to_string(),
            descending: false,
        }],
        limit: 10,
        offset: 0,
        hints: QueryHints {
            preferred_tiers: vec![Tier::Cold],
            ..QueryHints::default()
        },
    }
}

fn cold_options() -> QueryOptions {
    QueryOptions {
        max_rows: 50_000,
        include_execution_plan: true,
        ..QueryOptions::default()
    }
}

async fn seeded() -> (std::sync::Arc<ltbase::DuckDbClient>, Vec<Visit>) {
    let client = cold_client().await;
    let mut first = Visit::new("scheduled", 1_000);
    first.feedback = Some("initial");
    let mut second = Visit::new("visited", 2_000);
    second.feedback = Some("great visit");
    second.scores = vec![4.5, 3.0];
    let third = Visit::new("visited", 3_000);
    for visit in [&first, &second, &third] {
        seed_visit(&client, visit).await;
    }
    (client, vec![first, second, third])
}

#[tokio::test]
async fn federated_cold_read_filters_and_scans() {
    logging::init_test_logging();
    let (client, visits) = seeded().await;
    let cache = visit_cache();
    let coordinator =
        FederatedCoordinator::new(offline_repo(cache), Some(client), engine_config());

    let query = visit_query(Some(Condition::kv("status", "equals:visited")));
    let result = coordinator
        .query_federated(&tables(), &query, &cold_options())
        .await
        .unwrap();

    assert_eq!(result.page.records.len(), 2);
    assert_eq!(result.page.counters.total_records, 2);
    assert_eq!(result.page.counters.total_pages, 1);
    assert_eq!(result.page.counters.current_page, 1);

    // visited_at ascending: the 2_000ms visit first.
    let first = &result.page.records[0];
    assert_eq!(first.row_id, visits[1].row_id);
    assert_eq!(first.text["text_01"], "visited");
    assert_eq!(first.int64["bigint_01"], 2_000);
    assert_eq!(first.uuid["uuid_01"], visits[1].lead);

    // The EAV tail arrives through the JSON aggregation, PK-ordered.
    assert_eq!(first.other_attributes.len(), 3);
    assert_eq!(first.other_attributes[0].attr_id, ATTR_FEEDBACK);
    assert_eq!(
        first.other_attributes[0].value_text.as_deref(),
        Some("great visit")
    );
    assert_eq!(first.other_attributes[1].array_indices, "0");
    assert_eq!(first.other_attributes[1].value_numeric, Some(4.5));

    // The second record has no EAV rows at all.
    assert!(result.page.records[1].other_attributes.is_empty());

    let plan = result.plan.unwrap();
    assert!(plan.decision.use_cold);
    assert_eq!(plan.sources.len(), 1);
    assert_eq!(plan.sources[0].tier, Tier::Cold);
    assert_eq!(plan.sources[0].engine, "duckdb");
    assert!(plan.sources[0].predicate_pushdown);
    assert_eq!(plan.sources[0].row_count, 2);
    assert_eq!(plan.merge.strategy, "last-write-wins");
}

#[tokio::test]
async fn unconditional_cold_read_returns_every_row() {
    let (client, visits) = seeded().await;
    let cache = visit_cache();
    let coordinator =
        FederatedCoordinator::new(offline_repo(cache), Some(client), engine_config());

    let result = coordinator
        .query_federated(&tables(), &visit_query(None), &cold_options())
        .await
        .unwrap();
    assert_eq!(result.page.counters.total_records, 3);
    let ids: Vec<_> = result.page.records.iter().map(|r| r.row_id).collect();
    for visit in &visits {
        assert!(ids.contains(&visit.row_id));
    }
}

#[tokio::test]
async fn pagination_counters_follow_the_cut() {
    let (client, _) = seeded().await;
    let cache = visit_cache();
    let coordinator =
        FederatedCoordinator::new(offline_repo(cache), Some(client), engine_config());

    let mut query = visit_query(None);
    query.limit = 1;
    query.offset = 1;
    let result = coordinator
        .query_federated(&tables(), &query, &cold_options())
        .await
        .unwrap();

    assert_eq!(result.page.records.len(), 1);
    assert_eq!(result.page.counters.total_records, 3);
    assert_eq!(result.page.counters.total_pages, 3);
    assert_eq!(result.page.counters.current_page, 2);
}

#[tokio::test]
async fn dirty_rows_never_surface_from_the_cold_tier() {
    let (client, visits) = seeded().await;
    let cache = visit_cache();
    let attrs = cache.attributes(VISIT_SCHEMA).unwrap();

    // One of the two visited rows is dirty; the anti-join must hide it.
    let dirty = vec![visits[1].row_id];
    let condition = Condition::kv("status", "equals:visited");
    let mut param_index = 2;
    let dual = to_dual_clauses(
        Some(&condition),
        "entity_eav",
        common::VISIT_SCHEMA_ID,
        &attrs,
        &mut param_index,
    )
    .unwrap();
    let exclusion_sql = duck_exclusion_clause(dirty.len());
    let exclusion_args: Vec<ScalarValue> =
        dirty.iter().map(|id| ScalarValue::Uuid(*id)).collect();

    let paged = build_paged_query(&PagedQueryParams {
        dialect: SqlDialect::DuckDb,
        main_table: "entity_main",
        eav_table: "entity_eav",
        anchor: Anchor::Main,
        condition_sql: &dual.duck_clause,
        condition_args: &dual.duck_args,
        exclusion_sql: &exclusion_sql,
        exclusion_args: &exclusion_args,
        sort_keys: &resolve_sort_keys(&[], &attrs),
        schema_id: common::VISIT_SCHEMA_ID,
        limit: 10,
        offset: 0,
        next_param_index: param_index,
    })
    .unwrap();

    let args: Vec<duckdb::types::Value> = paged.args.iter().map(ScalarValue::to_duck).collect();
    let rows = client.query_paged(paged.sql, args).await.unwrap();

    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].0.row_id, visits[2].row_id);
    for (record, _) in &rows {
        assert!(!dirty.contains(&record.row_id));
    }
}

#[tokio::test]
async fn sort_ties_break_on_row_id_ascending() {
    let client = cold_client().await;
    // Three rows with identical sort keys.
    let mut visits = Vec::new();
    for _ in 0..3 {
        let visit = Visit::new("visited", 5_000);
        seed_visit(&client, &visit).await;
        visits.push(visit);
    }
    let cache = visit_cache();
    let coordinator =
        FederatedCoordinator::new(offline_repo(cache), Some(client), engine_config());

    let result = coordinator
        .query_federated(&tables(), &visit_query(None), &cold_options())
        .await
        .unwrap();

    let mut expected: Vec<String> = visits.iter().map(|v| v.row_id.to_string()).collect();
    expected.sort();
    let returned: Vec<String> = result
        .page
        .records
        .iter()
        .map(|r| r.row_id.to_string())
        .collect();
    assert_eq!(returned, expected);
}

#[tokio::test]
async fn eav_sort_keys_use_the_first_element_subselect() {
    let (client, visits) = seeded().await;
    let cache = visit_cache();
    let coordinator =
        FederatedCoordinator::new(offline_repo(cache), Some(client), engine_config());

    // Sort by the unbound feedback attribute, descending.
    let mut query = visit_query(None);
    query.sort = vec![SortKey {
        attr: "feedback".to_string(),
        descending: true,
    }];
    let result = coordinator
        .query_federated(&tables(), &query, &cold_options())
        .await
        .unwrap();

    assert_eq!(result.page.counters.total_records, 3);
    let with_feedback: Vec<_> = result
        .page
        .records
        .iter()
        .filter(|r| !r.other_attributes.is_empty())
        .map(|r| r.row_id)
        .collect();
    // "initial" < "great visit" descending puts "initial" first.
    assert_eq!(with_feedback, vec![visits[0].row_id, visits[1].row_id]);
}

#[tokio::test]
async fn missing_cold_client_surfaces_routing_error() {
    let cache = visit_cache();
    let coordinator = FederatedCoordinator::new(offline_repo(cache), None, engine_config());

    let err = coordinator
        .query_federated(&tables(), &visit_query(None), &cold_options())
        .await
        .unwrap_err();
    assert!(matches!(err, LtBaseError::ColdTierUnavailable));
}
