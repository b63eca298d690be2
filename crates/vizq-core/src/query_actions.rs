//! Result-type dispatch: what each query of a context returns.

use serde_json::{json, Map, Value};

use crate::{CoreError, Datasource, QueryContext, QueryObject, ResultFormat, ResultType, Table};

const TIME_RANGE_FILTER: &str = "__time_range";

/// Produces the payload of one query for `result_type`.
pub fn get_query_results(
    result_type: ResultType,
    context: &QueryContext<'_>,
    query: &QueryObject,
    force_cached: bool,
) -> Result<Value, CoreError> {
    match result_type {
        ResultType::Full => get_full(context, query, force_cached, false),
        ResultType::Results => get_full(context, query, force_cached, true),
        ResultType::Samples => get_samples(context, query, force_cached),
        ResultType::Query => Ok(get_query(context, query)),
    }
}

fn get_full(
    context: &QueryContext<'_>,
    query: &QueryObject,
    force_cached: bool,
    data_only: bool,
) -> Result<Value, CoreError> {
    let envelope = context.get_df_payload(query, force_cached)?;
    let failed = envelope.is_failed();
    let data = if failed {
        empty_data(context.result_format())
    } else {
        context.get_data(&envelope.table)?.into_value()
    };

    if data_only && !failed {
        return Ok(json!({ "data": data }));
    }

    let table = envelope.table.clone();
    let mut payload = match serde_json::to_value(&envelope)? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    if !failed {
        payload.insert(String::from("colnames"), json!(table.column_names()));
        payload.insert(String::from("coltypes"), json!(column_types(&table)));
    }
    payload.insert(String::from("data"), data);

    let (applied, rejected) = filter_status(context.datasource(), query);
    payload.insert(String::from("applied_filters"), Value::Array(applied));
    payload.insert(String::from("rejected_filters"), Value::Array(rejected));
    Ok(Value::Object(payload))
}

fn get_samples(
    context: &QueryContext<'_>,
    query: &QueryObject,
    force_cached: bool,
) -> Result<Value, CoreError> {
    let samples = query.to_samples(
        context.datasource().column_names(),
        context.services().config().samples_row_limit,
    );
    get_full(context, &samples, force_cached, false)
}

fn get_query(context: &QueryContext<'_>, query: &QueryObject) -> Value {
    let datasource = context.datasource();
    let language = datasource.query_language();
    match query
        .validate()
        .map_err(CoreError::from)
        .and_then(|()| datasource.query_text(query))
    {
        Ok(text) => json!({ "query": text, "language": language }),
        Err(err) => json!({ "error": err.to_string(), "language": language }),
    }
}

/// Failed queries carry no rows, in the shape of the result format.
fn empty_data(format: ResultFormat) -> Value {
    match format {
        ResultFormat::Json => Value::Array(Vec::new()),
        ResultFormat::Csv => Value::String(String::new()),
    }
}

fn column_types(table: &Table) -> Vec<Value> {
    table
        .dtypes()
        .into_iter()
        .map(|dtype| json!(dtype.generic()))
        .collect()
}

/// Splits the query's filters into those the datasource can apply and those
/// it rejects.
fn filter_status(datasource: &dyn Datasource, query: &QueryObject) -> (Vec<Value>, Vec<Value>) {
    let columns = datasource.column_names();
    let mut applied = Vec::new();
    let mut rejected = Vec::new();

    for filter in &query.filters {
        if columns.contains(&filter.col) {
            applied.push(json!({ "column": filter.col }));
        } else {
            rejected.push(json!({ "reason": "not_in_datasource", "column": filter.col }));
        }
    }

    if matches!(query.time_bounds(), Ok(Some(_))) {
        let has_temporal_column = columns.iter().any(|name| {
            datasource
                .column(name)
                .is_some_and(|column| column.is_dttm)
        });
        if has_temporal_column {
            applied.push(json!({ "column": TIME_RANGE_FILTER }));
        } else {
            rejected.push(json!({ "reason": "no_temporal_column", "column": TIME_RANGE_FILTER }));
        }
    }

    (applied, rejected)
}
