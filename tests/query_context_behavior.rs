//! Behavior tests for query retrieval through the orchestrator: cache reuse,
//! force refresh, cache-only reads, failure envelopes, annotations and the
//! access gate.

mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use support::{region_sales_datasource, request, sales_by_region, sales_datasource, Fixture, SALES_ID};
use vizq_core::{
    Annotation, AnnotationLayer, AnnotationLayerRef, CacheStore, Cell, Chart, ColumnDescriptor,
    CoreError, Datasource, DatasourceRef, DatasourceRegistry, DatasourceResult,
    MemoryAnnotationLayerStore, MemoryCacheStore, MemoryChartStore, QueryContext,
    QueryContextConfig, QueryContextServices, QueryObject, QueryStatus, ResultType, SourceError,
    StaticAccessPolicy, StaticDatasource, Table, UtcDateTime,
};

// =============================================================================
// Cache round-trip
// =============================================================================

#[test]
fn given_a_fresh_query_when_fetched_twice_then_the_second_result_comes_from_cache() {
    // Given: a context over the sales datasource with an empty cache
    let fixture = Fixture::sales();
    let context = QueryContext::new(request(vec![sales_by_region()]), &fixture.services)
        .expect("context should build");
    let query = &context.queries()[0];

    // When: the same query is retrieved twice
    let first = context.get_df_payload(query, false).expect("first fetch");
    let second = context.get_df_payload(query, false).expect("second fetch");

    // Then: the source ran once and the second envelope is a cache hit
    assert_eq!(fixture.executions(), 1, "source should be queried once");
    assert!(!first.is_cached);
    assert!(second.is_cached);
    assert!(second.cached_dttm.is_some(), "hit should report when it was cached");
    assert_eq!(first.cache_key, second.cache_key);

    // And: the cached table equals the post-processed one
    assert_eq!(second.table, first.table);
    assert_eq!(second.query, first.query);
    assert_eq!(second.rowcount, 2);
    assert_eq!(second.table.row(0), vec![Cell::from("east"), Cell::Int(17)]);
}

#[test]
fn given_a_cached_result_when_fetched_with_force_then_source_runs_and_entry_is_rewritten() {
    // Given: a result already in the cache
    let fixture = Fixture::sales();
    let cached = QueryContext::new(request(vec![sales_by_region()]), &fixture.services)
        .expect("context should build");
    cached
        .get_df_payload(&cached.queries()[0], false)
        .expect("priming fetch");

    // When: the same request is sent with force refresh
    let forced = QueryContext::new(
        request(vec![sales_by_region()]).with_force(true),
        &fixture.services,
    )
    .expect("forced context should build");
    let envelope = forced
        .get_df_payload(&forced.queries()[0], false)
        .expect("forced fetch");

    // Then: the cache is bypassed and written again
    assert!(!envelope.is_cached);
    assert_eq!(fixture.executions(), 2);
    assert_eq!(fixture.stats.count("set_cache_key"), 2);
    assert_eq!(fixture.stats.count("loaded_from_source_without_force"), 1);
    assert_eq!(fixture.cache.len(), 1, "forced write should overwrite, not add");
}

#[test]
fn given_no_cached_entry_when_fetched_cache_only_then_cache_unavailable_and_source_untouched() {
    // Given: an empty cache
    let fixture = Fixture::sales();
    let context = QueryContext::new(request(vec![sales_by_region()]), &fixture.services)
        .expect("context should build");

    // When: a cache-only read is requested
    let err = context
        .get_df_payload(&context.queries()[0], true)
        .expect_err("cache-only miss should fail");

    // Then: the distinct cache-unavailable condition is raised without a source call
    assert!(matches!(err, CoreError::CacheUnavailable { cache_key: Some(ref key) } if key.starts_with("qo-")));
    assert_eq!(fixture.executions(), 0);
}

#[test]
fn given_a_cached_entry_when_fetched_cache_only_then_the_entry_is_served() {
    let fixture = Fixture::sales();
    let context = QueryContext::new(request(vec![sales_by_region()]), &fixture.services)
        .expect("context should build");
    let query = &context.queries()[0];
    context.get_df_payload(query, false).expect("priming fetch");

    let envelope = context.get_df_payload(query, true).expect("cache-only hit");

    assert!(envelope.is_cached);
    assert_eq!(envelope.status, QueryStatus::Success);
    assert_eq!(fixture.executions(), 1);
}

// =============================================================================
// Failure envelopes
// =============================================================================

#[test]
fn given_unknown_columns_when_fetched_then_failed_envelope_lists_exactly_those_columns() {
    // Given: a query naming two columns the datasource does not have
    let fixture = Fixture::sales();
    let context = QueryContext::new(
        request(vec![json!({
            "columns": ["region", "profit", "__timestamp", "margin"],
            "row_limit": 10
        })]),
        &fixture.services,
    )
    .expect("context should build");

    // When: it is fetched
    let envelope = context
        .get_df_payload(&context.queries()[0], false)
        .expect("validation failures become envelopes");

    // Then: the envelope fails before any source call, naming only the unknown columns
    assert_eq!(envelope.status, QueryStatus::Failed);
    assert_eq!(
        envelope.error.as_deref(),
        Some("Columns missing in datasource: 'profit', 'margin'")
    );
    assert!(envelope.stacktrace.is_none());
    assert_eq!(fixture.executions(), 0);
    assert!(fixture.cache.is_empty(), "failed results are never cached");
}

#[test]
fn given_an_undeclared_metric_when_fetched_then_failed_envelope_mentions_it() {
    // Given: a datasource with columns {region, sales}
    let fixture = Fixture::new(region_sales_datasource());
    let context = QueryContext::new(
        request(vec![json!({ "groupby": ["region"], "metrics": ["revenue"] })]),
        &fixture.services,
    )
    .expect("context should build");

    // When: the undeclared metric `revenue` is requested
    let envelope = context
        .get_df_payload(&context.queries()[0], false)
        .expect("envelope");

    // Then
    assert_eq!(envelope.status, QueryStatus::Failed);
    assert!(envelope.error.as_deref().unwrap_or_default().contains("revenue"));
}

#[test]
fn given_a_failing_source_when_fetched_then_failed_envelope_keeps_a_stacktrace() {
    let fixture = Fixture::new(sales_datasource().failing(SourceError::unavailable("warehouse offline")));
    let context = QueryContext::new(request(vec![sales_by_region()]), &fixture.services)
        .expect("context should build");

    let envelope = context
        .get_df_payload(&context.queries()[0], false)
        .expect("unexpected errors become envelopes");

    assert_eq!(envelope.status, QueryStatus::Failed);
    assert!(envelope
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("warehouse offline"));
    assert!(envelope.stacktrace.is_some(), "unexpected errors keep a stack trace");
    assert!(fixture.cache.is_empty());
}

/// Source that answers every query with a FAILED result instead of an error.
struct RejectingSource {
    executions: AtomicUsize,
}

impl Datasource for RejectingSource {
    fn reference(&self) -> DatasourceRef {
        DatasourceRef::table(SALES_ID)
    }

    fn name(&self) -> &str {
        "rejecting"
    }

    fn column_names(&self) -> Vec<String> {
        vec![String::from("region"), String::from("sales")]
    }

    fn column(&self, name: &str) -> Option<ColumnDescriptor> {
        self.column_names()
            .contains(&name.to_string())
            .then(|| ColumnDescriptor::new(name))
    }

    fn query_text(&self, _query: &QueryObject) -> Result<String, CoreError> {
        Ok(String::from("SELECT region, sales FROM rejecting"))
    }

    fn query(&self, query: &QueryObject) -> Result<DatasourceResult, CoreError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        Ok(DatasourceResult::failed(self.query_text(query)?, "quota exceeded"))
    }
}

#[test]
fn given_a_source_reporting_failure_when_fetched_twice_then_nothing_is_cached() {
    // Given
    let source = Arc::new(RejectingSource {
        executions: AtomicUsize::new(0),
    });
    let cache = Arc::new(MemoryCacheStore::new());
    let services = QueryContextServices::new(DatasourceRegistry::new().with(source.clone()))
        .with_cache(cache.clone());
    let context = QueryContext::new(
        request(vec![json!({"columns": ["region", "sales"], "row_limit": 10})]),
        &services,
    )
    .expect("context should build");
    let query = &context.queries()[0];

    // When
    let first = context.get_df_payload(query, false).expect("first fetch");
    let second = context.get_df_payload(query, false).expect("second fetch");

    // Then: both attempts reach the source and the cache stays empty
    assert_eq!(first.status, QueryStatus::Failed);
    assert_eq!(first.error.as_deref(), Some("quota exceeded"));
    assert!(!second.is_cached);
    assert_eq!(second.status, QueryStatus::Failed);
    assert_eq!(source.executions.load(Ordering::SeqCst), 2);
    assert!(cache.is_empty(), "failed results must not be cached");
}

#[test]
fn given_an_unreadable_cache_entry_when_fetched_then_it_is_a_miss_and_the_source_runs() {
    // Given: garbage stored under the query's cache key
    let fixture = Fixture::sales();
    let context = QueryContext::new(request(vec![sales_by_region()]), &fixture.services)
        .expect("context should build");
    let query = &context.queries()[0];
    let key = context.query_cache_key(query).expect("cache key");
    fixture
        .cache
        .set(&key, &json!("garbage"), 0, None)
        .expect("seed cache");

    // When
    let envelope = context.get_df_payload(query, false).expect("envelope");

    // Then: the entry is ignored, the source runs and the entry is rewritten
    assert!(!envelope.is_cached);
    assert_eq!(envelope.status, QueryStatus::Success);
    assert_eq!(fixture.executions(), 1);
    let again = context.get_df_payload(query, false).expect("second fetch");
    assert!(again.is_cached, "the rewritten entry should be readable");
    assert_eq!(fixture.executions(), 1);
}

#[test]
fn given_a_pipeline_producing_infinity_when_fetched_twice_then_the_second_fetch_is_cached() {
    // Given: a running product that overflows to infinity
    let table = Table::from_rows(
        ["region", "value"],
        vec![
            vec![Cell::from("east"), Cell::Float(1e200)],
            vec![Cell::from("west"), Cell::Float(1e200)],
        ],
    )
    .expect("table is rectangular");
    let fixture = Fixture::new(StaticDatasource::new(DatasourceRef::table(SALES_ID), "huge", table));
    let context = QueryContext::new(
        request(vec![json!({
            "columns": ["region", "value"],
            "row_limit": 10,
            "post_processing": [
                {"operation": "cum", "options": {"columns": ["value"], "operator": "prod"}}
            ]
        })]),
        &fixture.services,
    )
    .expect("context should build");
    let query = &context.queries()[0];

    // When
    let first = context.get_df_payload(query, false).expect("first fetch");
    let second = context.get_df_payload(query, false).expect("second fetch");

    // Then: the infinite product is nulled and the entry reads back
    assert_eq!(first.status, QueryStatus::Success);
    assert_eq!(first.table.row(1)[1], Cell::Null);
    assert!(second.is_cached, "non-finite results must stay cacheable");
    assert_eq!(fixture.executions(), 1);
    assert_eq!(second.table, first.table);
}

// =============================================================================
// Empty results and annotations
// =============================================================================

fn holidays_layer() -> AnnotationLayer {
    AnnotationLayer {
        id: 3,
        name: String::from("Holidays"),
        descr: None,
        annotations: vec![Annotation {
            start_dttm: Some(UtcDateTime::parse("2024-01-01T00:00:00Z").expect("timestamp")),
            end_dttm: Some(UtcDateTime::parse("2024-01-02T00:00:00Z").expect("timestamp")),
            short_descr: Some(String::from("New Year")),
            long_descr: None,
            json_metadata: None,
        }],
    }
}

#[test]
fn given_a_query_matching_no_rows_when_fetched_then_pipeline_is_skipped_and_annotations_merge() {
    // Given: a native annotation layer and a filter that matches nothing
    let fixture = Fixture::sales().map_services(|services| {
        services.with_annotation_layers(Arc::new(
            MemoryAnnotationLayerStore::new().with_layer(holidays_layer()),
        ))
    });
    let mut empty = json!({
        "columns": ["region", "sales"],
        "filters": [{"col": "sales", "op": ">", "val": 1000}]
    });
    empty["annotation_layers"] =
        serde_json::to_value(vec![AnnotationLayerRef::native("Holidays", 3)]).expect("layer json");
    let context =
        QueryContext::new(request(vec![empty]), &fixture.services).expect("context should build");

    // When
    let envelope = context
        .get_df_payload(&context.queries()[0], false)
        .expect("envelope");

    // Then: zero rows, untouched by the pipeline, with annotations attached
    assert_eq!(envelope.status, QueryStatus::Success);
    assert_eq!(envelope.rowcount, 0);
    assert!(!envelope.table.is_time_normalized());
    let holidays = envelope
        .annotation_data
        .get("Holidays")
        .expect("native layer should be merged");
    assert_eq!(holidays["records"][0]["short_descr"], json!("New Year"));
    assert_eq!(holidays["records"][0]["start_dttm"], json!(1_704_067_200_000_i64));
}

#[test]
fn given_native_and_derived_layers_sharing_a_name_when_merged_then_the_derived_one_wins() {
    // Given: a native "Holidays" layer and a chart-backed layer of the same name
    let chart = Chart {
        id: 9,
        slice_name: String::from("Sales by region"),
        datasource: DatasourceRef::table(support::SALES_ID),
        form_data: json!({ "queries": [sales_by_region()] }),
    };
    let fixture = Fixture::sales().map_services(|services| {
        services
            .with_annotation_layers(Arc::new(
                MemoryAnnotationLayerStore::new().with_layer(holidays_layer()),
            ))
            .with_charts(Arc::new(MemoryChartStore::new().with_chart(chart)))
    });
    let mut spec = sales_by_region();
    spec["annotation_layers"] = serde_json::to_value(vec![
        AnnotationLayerRef::native("Holidays", 3),
        AnnotationLayerRef::chart("Holidays", "line", 9),
    ])
    .expect("layers json");
    let context =
        QueryContext::new(request(vec![spec]), &fixture.services).expect("context should build");

    // When
    let envelope = context
        .get_df_payload(&context.queries()[0], false)
        .expect("envelope");

    // Then: exactly one entry, holding the chart's rendered records
    assert_eq!(envelope.annotation_data.len(), 1);
    let holidays = &envelope.annotation_data["Holidays"];
    assert_eq!(
        holidays,
        &json!([
            {"region": "east", "total_sales": 17},
            {"region": "west", "total_sales": 16}
        ])
    );
}

#[test]
fn given_a_missing_chart_layer_when_fetched_then_failed_envelope_names_the_chart() {
    let fixture = Fixture::sales()
        .map_services(|services| services.with_charts(Arc::new(MemoryChartStore::new())));
    let mut spec = sales_by_region();
    spec["annotation_layers"] =
        serde_json::to_value(vec![AnnotationLayerRef::chart("Trend", "table", 404)]).expect("layers");
    let context =
        QueryContext::new(request(vec![spec]), &fixture.services).expect("context should build");

    let envelope = context
        .get_df_payload(&context.queries()[0], false)
        .expect("envelope");

    assert_eq!(envelope.status, QueryStatus::Failed);
    assert_eq!(envelope.error.as_deref(), Some("The chart 404 does not exist"));
}

// =============================================================================
// Cache timeout
// =============================================================================

#[test]
fn given_timeouts_at_every_level_when_resolved_then_first_configured_one_wins() {
    let configured = Fixture::new(
        sales_datasource()
            .with_cache_timeout(600)
            .with_database_cache_timeout(1200),
    );
    let database_only = Fixture::new(sales_datasource().with_database_cache_timeout(1200));
    let bare = Fixture::sales();

    let timeout = |fixture: &Fixture, custom: Option<u64>| {
        let mut request = request(vec![sales_by_region()]);
        request.custom_cache_timeout = custom;
        QueryContext::new(request, &fixture.services)
            .expect("context should build")
            .cache_timeout()
    };

    assert_eq!(timeout(&configured, Some(60)), 60);
    assert_eq!(timeout(&configured, None), 600);
    assert_eq!(timeout(&database_only, None), 1200);
    assert_eq!(timeout(&bare, None), 86_400);
}

// =============================================================================
// Access gate and payloads
// =============================================================================

#[test]
fn given_a_principal_without_access_when_payload_requested_then_access_error_before_any_fetch() {
    let fixture = Fixture::sales()
        .map_services(|services| services.with_security(Arc::new(StaticAccessPolicy::new())));
    let context = QueryContext::new(request(vec![sales_by_region()]), &fixture.services)
        .expect("context should build");

    let err = context
        .get_payload(false, false)
        .expect_err("access should be denied");

    assert!(matches!(err, CoreError::Access(_)));
    assert_eq!(fixture.executions(), 0);
}

#[test]
fn given_an_invalid_query_when_payload_requested_then_validation_runs_before_security() {
    let fixture = Fixture::sales()
        .map_services(|services| services.with_security(Arc::new(StaticAccessPolicy::new())));
    let context = QueryContext::new(
        request(vec![sales_by_region(), json!({ "row_limit": 5 })]),
        &fixture.services,
    )
    .expect("context should build");

    let err = context
        .get_payload(false, false)
        .expect_err("empty query should be rejected");

    assert!(err.is_validation(), "got {err}");
    assert_eq!(fixture.executions(), 0);
}

#[test]
fn given_a_cached_context_when_reloaded_by_key_then_queries_are_answered_from_cache() {
    // Given: a payload computed with context caching
    let fixture = Fixture::sales();
    let context = QueryContext::new(request(vec![sales_by_region()]), &fixture.services)
        .expect("context should build");
    let payload = context.get_payload(true, false).expect("payload");
    let key = payload.cache_key.expect("context key should be returned");
    assert!(key.starts_with("qc-"));

    // When: the context is rebuilt from its key and run cache-only
    let reloaded = QueryContext::load_cached(&key, &fixture.services).expect("cached context");
    let replay = reloaded.get_payload(false, true).expect("cache-only replay");

    // Then
    assert_eq!(reloaded.cache_values(), context.cache_values());
    assert_eq!(replay.queries[0]["is_cached"], json!(true));
    assert_eq!(replay.queries[0]["data"], payload.queries[0]["data"]);
    assert_eq!(fixture.executions(), 1);
}

#[test]
fn given_an_unknown_context_key_when_loaded_then_cache_unavailable() {
    let fixture = Fixture::sales();

    let err = QueryContext::load_cached("qc-missing", &fixture.services)
        .err()
        .expect("unknown key should fail");

    assert!(matches!(err, CoreError::CacheUnavailable { .. }));
}

#[test]
fn given_each_result_type_when_payload_requested_then_shape_follows_the_type() {
    let fixture = Fixture::sales();
    let mut filtered = sales_by_region();
    filtered["filters"] = json!([
        {"col": "region", "op": "==", "val": "east"},
        {"col": "country", "op": "==", "val": "NL"}
    ]);
    filtered["time_range"] = json!("2024-01-01 : 2024-02-01");

    let payload = |result_type: ResultType| -> Value {
        let context = QueryContext::new(
            request(vec![filtered.clone()]).with_result_type(result_type),
            &fixture.services,
        )
        .expect("context should build");
        context
            .get_payload(false, false)
            .expect("payload")
            .queries
            .remove(0)
    };

    let query = payload(ResultType::Query);
    assert_eq!(query["language"], json!("sql"));
    assert!(query["query"]
        .as_str()
        .unwrap_or_default()
        .contains("GROUP BY \"region\""));

    let samples = payload(ResultType::Samples);
    assert_eq!(samples["colnames"], json!(["ds", "region", "sales"]));

    let results = payload(ResultType::Results);
    assert!(results.get("data").is_some());
    assert!(results.get("status").is_none(), "results carry data only");

    let full = payload(ResultType::Full);
    assert_eq!(full["status"], json!("success"));
    assert_eq!(full["colnames"], json!(["region", "total_sales"]));
    assert_eq!(full["coltypes"], json!(["string", "numeric"]));
    assert_eq!(
        full["applied_filters"],
        json!([{"column": "region"}, {"column": "__time_range"}])
    );
    assert_eq!(
        full["rejected_filters"],
        json!([{"column": "country", "reason": "not_in_datasource"}])
    );
}

#[test]
fn given_a_failed_query_when_full_payload_requested_then_data_is_an_empty_list() {
    // Given: a query on a column the datasource lacks
    let fixture = Fixture::sales();
    let context = QueryContext::new(
        request(vec![json!({"columns": ["country"], "row_limit": 10})]),
        &fixture.services,
    )
    .expect("context should build");

    // When
    let mut payload = context.get_payload(false, false).expect("payload");
    let failed = payload.queries.remove(0);

    // Then: the envelope reports the failure and still carries `data`
    assert_eq!(failed["status"], json!("failed"));
    assert_eq!(failed["data"], json!([]));
    assert!(failed.get("colnames").is_none());
    assert_eq!(fixture.executions(), 0);
}

// =============================================================================
// Keys and row-level security
// =============================================================================

#[test]
fn given_row_level_security_when_principals_differ_then_query_keys_differ() {
    let keyed = |filter_ids: Vec<i64>| {
        let fixture = Fixture::new(sales_datasource().with_row_level_security()).map_services(|services| {
            services
                .with_config(QueryContextConfig {
                    row_level_security: true,
                    ..QueryContextConfig::default()
                })
                .with_security(Arc::new(
                    StaticAccessPolicy::new()
                        .allow("1__table")
                        .with_row_level_security("1__table", filter_ids),
                ))
        });
        let context = QueryContext::new(request(vec![sales_by_region()]), &fixture.services)
            .expect("context should build");
        context
            .query_cache_key(&context.queries()[0])
            .expect("key should derive")
    };

    assert_ne!(keyed(vec![1]), keyed(vec![2]));
    assert_eq!(keyed(vec![2, 1]), keyed(vec![1, 2]));
}

#[test]
fn given_a_timeseries_query_when_fetched_then_timestamps_are_normalized_and_shifted() {
    let fixture = Fixture::new(sales_datasource().with_offset(2));
    let context = QueryContext::new(
        request(vec![json!({
            "granularity": "ds",
            "is_timeseries": true,
            "metrics": ["total_sales"],
            "time_shift": "1 day ago"
        })]),
        &fixture.services,
    )
    .expect("context should build");

    let envelope = context
        .get_df_payload(&context.queries()[0], false)
        .expect("envelope");

    assert_eq!(envelope.status, QueryStatus::Success);
    assert!(envelope.table.is_time_normalized());
    let expected = UtcDateTime::parse("2023-12-31T02:00:00Z").expect("timestamp");
    assert_eq!(envelope.table.row(0)[0], Cell::Timestamp(expected));
}
