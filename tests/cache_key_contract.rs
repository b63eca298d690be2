mod support;

use serde_json::json;
use vizq_core::cache_key::{query_cache_key, CONTEXT_KEY_PREFIX, QUERY_KEY_PREFIX};
use vizq_core::{QueryContext, QueryObject, ResultType, StaticDatasource, UtcDateTime};

use support::{query, request, sales_by_region, sales_datasource, Fixture};

fn key_for(query: &QueryObject, datasource: &StaticDatasource) -> String {
    query_cache_key(query, datasource, &[]).expect("query key")
}

#[test]
fn given_reordered_query_fields_when_deriving_key_then_key_is_stable() {
    let datasource = sales_datasource();
    let left = query(json!({
        "groupby": ["region"],
        "metrics": ["total_sales"],
        "extras": {"having": "", "where": ""},
        "row_limit": 100
    }));
    let right = query(json!({
        "row_limit": 100,
        "extras": {"where": "", "having": ""},
        "metrics": ["total_sales"],
        "groupby": ["region"]
    }));

    let key = key_for(&left, &datasource);

    assert!(key.starts_with(QUERY_KEY_PREFIX));
    assert_eq!(key, key_for(&right, &datasource));
}

#[test]
fn given_result_shaping_changes_when_deriving_key_then_keys_differ() {
    let datasource = sales_datasource();
    let base = key_for(&query(sales_by_region()), &datasource);

    let variants = [
        json!({"groupby": ["region"], "metrics": ["total_sales"], "row_limit": 10}),
        json!({"groupby": ["ds"], "metrics": ["total_sales"], "row_limit": 100}),
        json!({"groupby": ["region"], "metrics": ["total_sales"], "row_limit": 100, "order_desc": false}),
        json!({
            "groupby": ["region"],
            "metrics": ["total_sales"],
            "row_limit": 100,
            "filters": [{"col": "region", "op": "==", "val": "east"}]
        }),
        json!({
            "groupby": ["region"],
            "metrics": ["total_sales"],
            "row_limit": 100,
            "time_range": "2024-01-01 : 2024-01-02"
        }),
        json!({
            "groupby": ["region"],
            "metrics": ["total_sales"],
            "row_limit": 100,
            "post_processing": [{"operation": "sort", "options": {"columns": {"region": true}}}]
        }),
    ];

    for variant in variants {
        assert_ne!(base, key_for(&query(variant.clone()), &datasource), "{variant}");
    }
}

#[test]
fn given_time_shift_or_offset_when_deriving_key_then_key_changes() {
    let datasource = sales_datasource();
    let base = key_for(&query(sales_by_region()), &datasource);

    let mut shifted = query(sales_by_region());
    shifted.time_shift = Some(String::from("1 week ago"));
    let mut offset = query(sales_by_region());
    offset.time_offset = Some(3);

    let shifted_key = key_for(&shifted, &datasource);
    let offset_key = key_for(&offset, &datasource);

    assert_ne!(base, shifted_key);
    assert_ne!(base, offset_key);
    assert_ne!(shifted_key, offset_key);
}

#[test]
fn given_datasource_state_changes_when_deriving_key_then_key_changes() {
    let query = query(sales_by_region());
    let base = key_for(&query, &sales_datasource());

    let changed = sales_datasource().with_changed_on(
        UtcDateTime::parse("2024-02-01T00:00:00Z").expect("timestamp"),
    );
    let extra = sales_datasource().with_extra_cache_key(json!("tenant-7"));

    assert_ne!(base, key_for(&query, &changed));
    assert_ne!(base, key_for(&query, &extra));
    assert_ne!(
        base,
        query_cache_key(&query, &sales_datasource(), &[3, 9]).expect("query key")
    );
}

#[test]
fn given_annotation_display_fields_when_deriving_key_then_only_data_fields_count() {
    let datasource = sales_datasource();
    let layered = |layer: serde_json::Value| {
        query(json!({
            "groupby": ["region"],
            "metrics": ["total_sales"],
            "annotation_layers": [layer]
        }))
    };

    let red = layered(json!({"name": "Holidays", "sourceType": "NATIVE", "value": 1, "color": "red"}));
    let blue = layered(json!({
        "name": "Holidays",
        "sourceType": "NATIVE",
        "value": 1,
        "color": "blue",
        "opacity": "opacityHigh",
        "show": false
    }));
    let other_layer = layered(json!({"name": "Holidays", "sourceType": "NATIVE", "value": 2, "color": "red"}));

    assert_eq!(key_for(&red, &datasource), key_for(&blue, &datasource));
    assert_ne!(key_for(&red, &datasource), key_for(&other_layer, &datasource));
}

#[test]
fn given_formula_layers_when_deriving_key_then_they_are_ignored() {
    let datasource = sales_datasource();
    let plain = query(sales_by_region());
    let with_formula = query(json!({
        "groupby": ["region"],
        "metrics": ["total_sales"],
        "row_limit": 100,
        "annotation_layers": [{"name": "Target", "annotationType": "FORMULA", "value": "y = 10"}]
    }));

    assert_eq!(key_for(&plain, &datasource), key_for(&with_formula, &datasource));
}

#[test]
fn given_equal_requests_when_deriving_context_key_then_force_and_timeout_do_not_count() {
    let fixture = Fixture::sales();
    let plain = QueryContext::new(request(vec![sales_by_region()]), &fixture.services)
        .expect("context");
    let forced = QueryContext::new(
        request(vec![sales_by_region()])
            .with_force(true)
            .with_custom_cache_timeout(30),
        &fixture.services,
    )
    .expect("context");

    let key = plain.cache_key().expect("context key");

    assert!(key.starts_with(CONTEXT_KEY_PREFIX));
    assert_eq!(key, forced.cache_key().expect("context key"));
}

#[test]
fn given_different_result_type_when_deriving_context_key_then_keys_differ() {
    let fixture = Fixture::sales();
    let full = QueryContext::new(request(vec![sales_by_region()]), &fixture.services)
        .expect("context");
    let samples = QueryContext::new(
        request(vec![sales_by_region()]).with_result_type(ResultType::Samples),
        &fixture.services,
    )
    .expect("context");

    assert_ne!(
        full.cache_key().expect("context key"),
        samples.cache_key().expect("context key")
    );
}

#[test]
fn given_context_when_deriving_query_key_then_it_matches_the_free_function() {
    let fixture = Fixture::sales();
    let context = QueryContext::new(request(vec![sales_by_region()]), &fixture.services)
        .expect("context");
    let query = &context.queries()[0];

    assert_eq!(
        context.query_cache_key(query),
        Some(key_for(query, &fixture.datasource))
    );
}
