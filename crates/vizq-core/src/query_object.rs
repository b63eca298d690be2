//! One tabular query as requested by a chart.

use std::collections::{BTreeMap, HashSet};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{AnnotationLayerRef, DatasourceRef, TimeShift, UtcDateTime, ValidationError};

/// Synthetic name of the time column produced for time-series queries.
pub const DTTM_ALIAS: &str = "__timestamp";

/// How the result of a query is shaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultType {
    #[default]
    Full,
    Results,
    Samples,
    Query,
}

impl ResultType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Results => "results",
            Self::Samples => "samples",
            Self::Query => "query",
        }
    }
}

impl Display for ResultType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encoding of the `data` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultFormat {
    #[default]
    Json,
    Csv,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdhocColumn {
    pub column_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "expressionType")]
pub enum AdhocExpression {
    #[serde(rename = "SIMPLE")]
    Simple {
        column: AdhocColumn,
        aggregate: String,
    },
    #[serde(rename = "SQL")]
    Sql {
        #[serde(rename = "sqlExpression")]
        sql_expression: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdhocMetric {
    #[serde(flatten)]
    pub expression: AdhocExpression,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// A saved metric referenced by name, or an ad-hoc aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Metric {
    Saved(String),
    Adhoc(AdhocMetric),
}

impl Metric {
    pub fn simple(aggregate: &str, column: &str) -> Self {
        Self::Adhoc(AdhocMetric {
            expression: AdhocExpression::Simple {
                column: AdhocColumn {
                    column_name: column.to_owned(),
                },
                aggregate: aggregate.to_owned(),
            },
            label: None,
        })
    }

    /// Output column name of the metric.
    pub fn label(&self) -> String {
        match self {
            Self::Saved(name) => name.clone(),
            Self::Adhoc(metric) => metric.label.clone().unwrap_or_else(|| {
                match &metric.expression {
                    AdhocExpression::Simple { column, aggregate } => {
                        format!("{}({})", aggregate.to_uppercase(), column.column_name)
                    }
                    AdhocExpression::Sql { sql_expression } => sql_expression.clone(),
                }
            }),
        }
    }

    /// Datasource column the metric reads, if it names one. A saved metric that
    /// the datasource does not define is treated as a column reference.
    pub fn referenced_column(&self, saved_metrics: &[String]) -> Option<String> {
        match self {
            Self::Saved(name) if saved_metrics.iter().any(|saved| saved == name) => None,
            Self::Saved(name) => Some(name.clone()),
            Self::Adhoc(AdhocMetric {
                expression: AdhocExpression::Simple { column, .. },
                ..
            }) => Some(column.column_name.clone()),
            Self::Adhoc(_) => None,
        }
    }
}

/// Comparison operator of a filter clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterOperator {
    #[serde(rename = "==")]
    Equals,
    #[serde(rename = "!=")]
    NotEquals,
    #[serde(rename = ">")]
    GreaterThan,
    #[serde(rename = "<")]
    LessThan,
    #[serde(rename = ">=")]
    GreaterThanOrEquals,
    #[serde(rename = "<=")]
    LessThanOrEquals,
    #[serde(rename = "IN", alias = "in")]
    In,
    #[serde(rename = "NOT IN", alias = "not in")]
    NotIn,
    #[serde(rename = "IS NULL")]
    IsNull,
    #[serde(rename = "IS NOT NULL")]
    IsNotNull,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryFilter {
    pub col: String,
    pub op: FilterOperator,
    #[serde(default)]
    pub val: Value,
}

/// A named table transform applied after retrieval.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PostProcessingStep {
    #[serde(default)]
    pub operation: String,
    #[serde(default)]
    pub options: Map<String, Value>,
}

impl PostProcessingStep {
    pub fn new(operation: impl Into<String>, options: Value) -> Self {
        Self {
            operation: operation.into(),
            options: match options {
                Value::Object(options) => options,
                _ => Map::new(),
            },
        }
    }
}

/// Half-open `[since, until)` interval parsed from `time_range`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeBounds {
    pub since: Option<UtcDateTime>,
    pub until: Option<UtcDateTime>,
}

impl TimeBounds {
    pub fn contains(&self, value: UtcDateTime) -> bool {
        self.since.map(|since| value >= since).unwrap_or(true)
            && self.until.map(|until| value < until).unwrap_or(true)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryObject {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub datasource: Option<DatasourceRef>,
    pub granularity: Option<String>,
    /// `<since> : <until>`; either side may be empty. `No filter` disables it.
    pub time_range: Option<String>,
    pub is_timeseries: bool,
    pub time_shift: Option<String>,
    /// Hours added to the time column in place of the datasource offset.
    pub time_offset: Option<i32>,
    pub columns: Vec<String>,
    pub groupby: Vec<String>,
    pub metrics: Vec<Metric>,
    #[serde(alias = "filter")]
    pub filters: Vec<QueryFilter>,
    pub orderby: Vec<(String, bool)>,
    pub row_limit: Option<usize>,
    pub row_offset: usize,
    pub order_desc: bool,
    pub extras: BTreeMap<String, Value>,
    pub post_processing: Vec<PostProcessingStep>,
    pub annotation_layers: Vec<AnnotationLayerRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_type: Option<ResultType>,
}

impl Default for QueryObject {
    fn default() -> Self {
        Self {
            datasource: None,
            granularity: None,
            time_range: None,
            is_timeseries: false,
            time_shift: None,
            time_offset: None,
            columns: Vec::new(),
            groupby: Vec::new(),
            metrics: Vec::new(),
            filters: Vec::new(),
            orderby: Vec::new(),
            row_limit: None,
            row_offset: 0,
            order_desc: true,
            extras: BTreeMap::new(),
            post_processing: Vec::new(),
            annotation_layers: Vec::new(),
            result_type: None,
        }
    }
}

impl QueryObject {
    pub fn metric_labels(&self) -> Vec<String> {
        self.metrics.iter().map(Metric::label).collect()
    }

    /// Every datasource column the query reads: columns, group-by and metric
    /// columns, without duplicates, in that order.
    pub fn referenced_columns(&self, saved_metrics: &[String]) -> Vec<String> {
        let mut seen = HashSet::new();
        self.columns
            .iter()
            .chain(self.groupby.iter())
            .cloned()
            .chain(
                self.metrics
                    .iter()
                    .filter_map(|metric| metric.referenced_column(saved_metrics)),
            )
            .filter(|name| seen.insert(name.clone()))
            .collect()
    }

    /// Output columns produced by grouping, before metrics.
    pub fn dimension_columns(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.columns
            .iter()
            .chain(self.groupby.iter())
            .filter(|name| seen.insert(name.as_str()))
            .cloned()
            .collect()
    }

    /// Annotation layers the query carries; formula layers are evaluated client
    /// side and never fetched.
    pub fn annotation_layers(&self) -> impl Iterator<Item = &AnnotationLayerRef> {
        self.annotation_layers
            .iter()
            .filter(|layer| !layer.is_formula())
    }

    pub fn parsed_time_shift(&self) -> Result<Option<TimeShift>, ValidationError> {
        self.time_shift
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(TimeShift::from_str)
            .transpose()
    }

    pub fn time_bounds(&self) -> Result<Option<TimeBounds>, ValidationError> {
        let Some(range) = self.time_range.as_deref().map(str::trim) else {
            return Ok(None);
        };
        if range.is_empty() || range.eq_ignore_ascii_case("no filter") {
            return Ok(None);
        }

        let invalid = || ValidationError::InvalidTimeRange {
            value: range.to_owned(),
        };
        let padded = format!(" {range} ");
        let (since, until) = padded.split_once(" : ").ok_or_else(invalid)?;
        let parse_side = |side: &str| -> Result<Option<UtcDateTime>, ValidationError> {
            let side = side.trim();
            if side.is_empty() {
                return Ok(None);
            }
            UtcDateTime::parse_iso8601(side).map(Some).ok_or_else(invalid)
        };

        Ok(Some(TimeBounds {
            since: parse_side(since)?,
            until: parse_side(until)?,
        }))
    }

    /// Structural checks that do not need the datasource.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.columns.is_empty() && self.groupby.is_empty() && self.metrics.is_empty() {
            return Err(ValidationError::EmptyQuery);
        }

        let mut seen = HashSet::new();
        let mut duplicates = Vec::new();
        for label in self.dimension_columns().into_iter().chain(self.metric_labels()) {
            if !seen.insert(label.clone()) && !duplicates.contains(&label) {
                duplicates.push(label);
            }
        }
        if !duplicates.is_empty() {
            return Err(ValidationError::DuplicateLabels { labels: duplicates });
        }

        if self
            .post_processing
            .iter()
            .any(|step| step.operation.trim().is_empty())
        {
            return Err(ValidationError::UndefinedPostProcessingOperation);
        }

        self.parsed_time_shift()?;
        self.time_bounds()?;
        Ok(())
    }

    /// Copy of the query that returns raw rows of every datasource column.
    pub fn to_samples(&self, datasource_columns: Vec<String>, samples_row_limit: usize) -> Self {
        let row_limit = self
            .row_limit
            .map(|limit| limit.min(samples_row_limit))
            .unwrap_or(samples_row_limit);
        Self {
            is_timeseries: false,
            orderby: Vec::new(),
            groupby: Vec::new(),
            metrics: Vec::new(),
            post_processing: Vec::new(),
            row_limit: Some(row_limit),
            row_offset: 0,
            columns: datasource_columns,
            ..self.clone()
        }
    }

    /// Fields that shape the result, as they enter the per-query cache key.
    pub fn cache_state(&self) -> Map<String, Value> {
        let mut state = Map::new();
        state.insert(String::from("granularity"), json_or_null(&self.granularity));
        state.insert(String::from("groupby"), json_or_null(&self.groupby));
        state.insert(String::from("is_timeseries"), Value::Bool(self.is_timeseries));
        state.insert(String::from("metrics"), json_or_null(&self.metrics));
        state.insert(String::from("row_limit"), json_or_null(&self.row_limit));
        state.insert(String::from("row_offset"), Value::from(self.row_offset));
        state.insert(String::from("filter"), json_or_null(&self.filters));
        state.insert(String::from("order_desc"), Value::Bool(self.order_desc));
        state.insert(String::from("extras"), json_or_null(&self.extras));
        state.insert(String::from("columns"), json_or_null(&self.columns));
        state.insert(String::from("orderby"), json_or_null(&self.orderby));

        if let Some(time_range) = &self.time_range {
            state.insert(String::from("time_range"), Value::String(time_range.clone()));
        }
        if let Some(time_shift) = &self.time_shift {
            state.insert(String::from("time_shift"), Value::String(time_shift.clone()));
        }
        if let Some(time_offset) = self.time_offset {
            state.insert(String::from("time_offset"), Value::from(time_offset));
        }
        if !self.post_processing.is_empty() {
            state.insert(
                String::from("post_processing"),
                json_or_null(&self.post_processing),
            );
        }

        let layers = self
            .annotation_layers()
            .map(AnnotationLayerRef::cache_state)
            .collect::<Vec<_>>();
        if !layers.is_empty() {
            state.insert(String::from("annotation_layers"), Value::Array(layers));
        }

        state
    }
}

fn json_or_null<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn query(value: Value) -> QueryObject {
        serde_json::from_value(value).expect("query object")
    }

    #[test]
    fn deserializes_wire_shape() {
        let query = query(json!({
            "granularity": "ds",
            "groupby": ["region"],
            "metrics": ["count", {"expressionType": "SIMPLE", "column": {"column_name": "sales"}, "aggregate": "sum"}],
            "filter": [{"col": "region", "op": "IN", "val": ["east"]}],
            "orderby": [["count", false]],
            "post_processing": [{"operation": "sort", "options": {"by": "count"}}]
        }));

        assert_eq!(query.metric_labels(), vec!["count", "SUM(sales)"]);
        assert_eq!(query.filters[0].op, FilterOperator::In);
        assert_eq!(query.orderby, vec![(String::from("count"), false)]);
        assert_eq!(query.post_processing[0].operation, "sort");
    }

    #[test]
    fn undeclared_saved_metric_counts_as_column_reference() {
        let query = query(json!({"metrics": ["revenue", "count"]}));
        let referenced = query.referenced_columns(&[String::from("count")]);
        assert_eq!(referenced, vec!["revenue"]);
    }

    #[test]
    fn validate_rejects_duplicate_labels() {
        let err = query(json!({"columns": ["a"], "metrics": ["a"]}))
            .validate()
            .expect_err("must fail");
        assert_eq!(
            err,
            ValidationError::DuplicateLabels {
                labels: vec![String::from("a")]
            }
        );
    }

    #[test]
    fn validate_rejects_empty_and_malformed_queries() {
        assert_eq!(
            QueryObject::default().validate(),
            Err(ValidationError::EmptyQuery)
        );

        let missing_operation = query(json!({"columns": ["a"], "post_processing": [{"options": {}}]}));
        assert_eq!(
            missing_operation.validate(),
            Err(ValidationError::UndefinedPostProcessingOperation)
        );

        let bad_shift = query(json!({"columns": ["a"], "time_shift": "sometime"}));
        assert!(matches!(
            bad_shift.validate(),
            Err(ValidationError::InvalidTimeShift { .. })
        ));
    }

    #[test]
    fn time_range_accepts_open_sides() {
        let bounds = query(json!({"time_range": "2024-01-01 : "}))
            .time_bounds()
            .expect("bounds")
            .expect("some bounds");
        assert!(bounds.since.is_some());
        assert!(bounds.until.is_none());

        let none = query(json!({"time_range": "No filter"}))
            .time_bounds()
            .expect("bounds");
        assert!(none.is_none());
    }

    #[test]
    fn samples_strip_aggregation() {
        let original = query(json!({
            "groupby": ["region"],
            "metrics": ["count"],
            "is_timeseries": true,
            "row_limit": 5000,
            "row_offset": 10,
            "post_processing": [{"operation": "sort"}]
        }));
        let samples = original.to_samples(vec![String::from("region"), String::from("sales")], 1000);

        assert!(samples.groupby.is_empty());
        assert!(samples.metrics.is_empty());
        assert!(samples.post_processing.is_empty());
        assert!(!samples.is_timeseries);
        assert_eq!(samples.row_limit, Some(1000));
        assert_eq!(samples.row_offset, 0);
        assert_eq!(samples.columns, vec!["region", "sales"]);
    }

    #[test]
    fn cache_state_omits_unset_optional_fields() {
        let state = query(json!({"columns": ["a"]})).cache_state();
        assert!(!state.contains_key("time_range"));
        assert!(!state.contains_key("post_processing"));
        assert!(!state.contains_key("annotation_layers"));
        assert_eq!(state["columns"], json!(["a"]));
    }
}
