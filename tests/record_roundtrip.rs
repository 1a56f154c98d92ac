//! Property coverage for the boundary transformer: a record survives the
//! trip through the full EAV view and back, modulo repository-owned
//! timestamps.

mod common;

use common::{VISIT_SCHEMA, VISIT_SCHEMA_ID, visit_cache};
use ltbase::record::transform::{from_eav_rows, record_from_json, to_eav_rows};
use proptest::prelude::*;
use uuid::Uuid;

fn status_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("scheduled".to_string()),
        Just("visited".to_string()),
        Just("cancelled".to_string()),
        "[a-z]{1,12}",
    ]
}

proptest! {
    #[test]
    fn eav_view_round_trips(
        status in status_strategy(),
        visited_at in 0i64..4_102_444_800_000,
        feedback in proptest::option::of("[ -~]{0,40}"),
        scores in proptest::collection::vec(-1_000.0f64..1_000.0, 0..4),
    ) {
        let cache = visit_cache();
        let attrs = cache.attributes(VISIT_SCHEMA).unwrap();
        let row_id = Uuid::new_v4();

        let mut entity = serde_json::json!({
            "status": status,
            "lead_id": Uuid::new_v4().to_string(),
            "visited_at": visited_at,
            "scores": scores,
        });
        if let Some(feedback) = &feedback {
            entity["feedback"] = serde_json::Value::String(feedback.clone());
        }

        let mut record = record_from_json(VISIT_SCHEMA_ID, row_id, &entity, &attrs).unwrap();
        record.normalize();

        let rows = to_eav_rows(&record, &attrs).unwrap();
        let mut rebuilt = from_eav_rows(VISIT_SCHEMA_ID, row_id, rows, &attrs).unwrap();
        rebuilt.normalize();
        rebuilt.created_at = record.created_at;
        rebuilt.updated_at = record.updated_at;

        prop_assert_eq!(rebuilt, record);
    }
}
