//! Annotation layers: references carried by queries, the stores that resolve
//! them, and the merger that builds per-query annotation data.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::{CoreError, DatasourceRef, QueryContextServices, QueryObject, UtcDateTime, ValidationError};

/// Columns emitted for every native annotation record.
pub const NATIVE_ANNOTATION_COLUMNS: [&str; 5] = [
    "start_dttm",
    "end_dttm",
    "short_descr",
    "long_descr",
    "json_metadata",
];

/// Layer fields that change the fetched data; everything else is display only.
const CACHE_KEY_FIELDS: [&str; 9] = [
    "annotationType",
    "descriptionColumns",
    "intervalEndColumn",
    "name",
    "overrides",
    "sourceType",
    "timeColumn",
    "titleColumn",
    "value",
];

/// Annotation data keyed by layer name.
pub type AnnotationData = IndexMap<String, Value>;

/// Reference to an annotation layer as sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationLayerRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_type: Option<String>,
    /// Layer id for native layers, chart id for derived ones.
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overrides: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title_column: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description_columns: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_end_column: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_column: Option<String>,
    /// Styling such as `color`, `opacity` or `show`.
    #[serde(flatten)]
    pub display: Map<String, Value>,
}

impl AnnotationLayerRef {
    pub fn native(name: impl Into<String>, layer_id: i64) -> Self {
        Self::with_source(name, "NATIVE", Value::from(layer_id))
    }

    /// Layer rendered from a saved chart; `source_type` is `line` or `table`.
    pub fn chart(name: impl Into<String>, source_type: &str, chart_id: i64) -> Self {
        Self::with_source(name, source_type, Value::from(chart_id))
    }

    fn with_source(name: impl Into<String>, source_type: &str, value: Value) -> Self {
        Self {
            name: name.into(),
            annotation_type: None,
            source_type: Some(source_type.to_owned()),
            value,
            overrides: None,
            title_column: None,
            description_columns: None,
            interval_end_column: None,
            time_column: None,
            display: Map::new(),
        }
    }

    pub fn is_native(&self) -> bool {
        self.source_type.as_deref() == Some("NATIVE")
    }

    pub fn is_chart(&self) -> bool {
        matches!(self.source_type.as_deref(), Some("line" | "table"))
    }

    pub fn is_formula(&self) -> bool {
        self.annotation_type.as_deref() == Some("FORMULA")
    }

    /// Numeric id carried in `value`.
    pub fn target_id(&self) -> Result<i64, ValidationError> {
        match &self.value {
            Value::Number(number) => number.as_i64(),
            Value::String(text) => text.trim().parse().ok(),
            _ => None,
        }
        .ok_or_else(|| ValidationError::InvalidAnnotationLayer {
            name: self.name.clone(),
            reason: format!("expected a numeric id, got {}", self.value),
        })
    }

    /// Projection of the layer onto the fields that enter the cache key.
    pub fn cache_state(&self) -> Value {
        let Ok(Value::Object(full)) = serde_json::to_value(self) else {
            return Value::Null;
        };
        Value::Object(
            full.into_iter()
                .filter(|(field, _)| CACHE_KEY_FIELDS.contains(&field.as_str()))
                .collect(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    pub start_dttm: Option<UtcDateTime>,
    pub end_dttm: Option<UtcDateTime>,
    pub short_descr: Option<String>,
    pub long_descr: Option<String>,
    pub json_metadata: Option<String>,
}

impl Annotation {
    fn record(&self) -> IndexMap<String, Value> {
        let timestamp = |value: Option<UtcDateTime>| {
            value
                .map(|value| Value::from(value.unix_millis()))
                .unwrap_or(Value::Null)
        };
        let text = |value: &Option<String>| {
            value.clone().map(Value::String).unwrap_or(Value::Null)
        };

        let mut record = IndexMap::with_capacity(NATIVE_ANNOTATION_COLUMNS.len());
        record.insert(String::from("start_dttm"), timestamp(self.start_dttm));
        record.insert(String::from("end_dttm"), timestamp(self.end_dttm));
        record.insert(String::from("short_descr"), text(&self.short_descr));
        record.insert(String::from("long_descr"), text(&self.long_descr));
        record.insert(String::from("json_metadata"), text(&self.json_metadata));
        record
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotationLayer {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub descr: Option<String>,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
}

/// Lookup of native annotation layers.
pub trait AnnotationLayerStore: Send + Sync {
    fn find_by_ids(&self, ids: &[i64]) -> Result<Vec<AnnotationLayer>, CoreError>;
}

/// Saved visualization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chart {
    pub id: i64,
    #[serde(default)]
    pub slice_name: String,
    pub datasource: DatasourceRef,
    /// Request snapshot the chart was saved with; carries a `queries` array.
    pub form_data: Value,
}

pub trait ChartStore: Send + Sync {
    fn find_by_id(&self, id: i64) -> Result<Option<Chart>, CoreError>;
}

/// Re-executes a saved chart and returns its rendered data.
pub trait ChartRenderer: Send + Sync {
    fn render(
        &self,
        chart: &Chart,
        force: bool,
        services: &QueryContextServices,
    ) -> Result<Value, CoreError>;
}

/// Builds the annotation data of one query: native layers first, derived layers
/// after, later names overwriting earlier ones.
pub struct AnnotationMerger<'a> {
    services: &'a QueryContextServices,
    force: bool,
}

impl<'a> AnnotationMerger<'a> {
    pub fn new(services: &'a QueryContextServices, force: bool) -> Self {
        Self { services, force }
    }

    pub fn merge(&self, query: &QueryObject) -> Result<AnnotationData, CoreError> {
        let mut data = self.native_annotation_data(query)?;
        for layer in query.annotation_layers().filter(|layer| layer.is_chart()) {
            let rendered = self.chart_annotation_data(layer)?;
            data.insert(layer.name.clone(), rendered);
        }
        Ok(data)
    }

    fn native_annotation_data(&self, query: &QueryObject) -> Result<AnnotationData, CoreError> {
        let layers = query
            .annotation_layers()
            .filter(|layer| layer.is_native())
            .collect::<Vec<_>>();
        if layers.is_empty() {
            return Ok(AnnotationData::new());
        }

        let ids = layers
            .iter()
            .map(|layer| layer.target_id())
            .collect::<Result<Vec<_>, _>>()?;
        let Some(store) = self.services.annotation_layers() else {
            warn!(layers = layers.len(), "no annotation layer store configured");
            return Ok(AnnotationData::new());
        };
        let found = store
            .find_by_ids(&ids)?
            .into_iter()
            .map(|layer| (layer.id, layer))
            .collect::<IndexMap<_, _>>();

        let mut data = AnnotationData::new();
        for (layer, id) in layers.into_iter().zip(ids) {
            let Some(stored) = found.get(&id) else {
                warn!(layer = %layer.name, id, "annotation layer not found");
                continue;
            };
            let records = stored
                .annotations
                .iter()
                .map(Annotation::record)
                .collect::<Vec<_>>();
            debug!(layer = %layer.name, records = records.len(), "loaded native annotations");
            data.insert(
                layer.name.clone(),
                serde_json::json!({
                    "columns": NATIVE_ANNOTATION_COLUMNS,
                    "records": records,
                }),
            );
        }
        Ok(data)
    }

    fn chart_annotation_data(&self, layer: &AnnotationLayerRef) -> Result<Value, CoreError> {
        let chart_id = layer.target_id()?;
        let chart = self
            .services
            .charts()
            .map(|charts| charts.find_by_id(chart_id))
            .transpose()
            .map_err(|err| chart_render_error(&err))?
            .flatten()
            .ok_or(ValidationError::ChartNotFound { chart_id })?;

        self.services
            .chart_renderer()
            .render(&chart, self.force, self.services)
            .map_err(|err| chart_render_error(&err).into())
    }
}

fn chart_render_error(err: &CoreError) -> ValidationError {
    ValidationError::ChartRender {
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn layer_ref_reads_camel_case_and_keeps_display_fields() {
        let layer: AnnotationLayerRef = serde_json::from_value(json!({
            "name": "Holidays",
            "annotationType": "EVENT",
            "sourceType": "NATIVE",
            "value": 4,
            "color": "#ff0000",
            "show": true
        }))
        .expect("layer");

        assert!(layer.is_native());
        assert_eq!(layer.target_id().expect("id"), 4);
        assert_eq!(layer.display.get("color"), Some(&json!("#ff0000")));
    }

    #[test]
    fn cache_state_drops_display_fields() {
        let mut layer = AnnotationLayerRef::chart("Trend", "line", 9);
        layer.display.insert(String::from("color"), json!("blue"));

        let state = layer.cache_state();
        assert_eq!(
            state,
            json!({"name": "Trend", "sourceType": "line", "value": 9})
        );
    }

    #[test]
    fn target_id_rejects_non_numeric_values() {
        let mut layer = AnnotationLayerRef::native("Broken", 1);
        layer.value = json!({"id": 1});
        let err = layer.target_id().expect_err("must fail");
        assert!(matches!(err, ValidationError::InvalidAnnotationLayer { .. }));
    }

    #[test]
    fn native_record_uses_epoch_millis() {
        let annotation = Annotation {
            start_dttm: Some(UtcDateTime::parse("2024-01-01T00:00:00Z").expect("ts")),
            end_dttm: None,
            short_descr: Some(String::from("New year")),
            long_descr: None,
            json_metadata: None,
        };
        let record = annotation.record();
        assert_eq!(record["start_dttm"], json!(1_704_067_200_000_i64));
        assert_eq!(record["end_dttm"], Value::Null);
        assert_eq!(
            record.keys().cloned().collect::<Vec<_>>(),
            NATIVE_ANNOTATION_COLUMNS.to_vec()
        );
    }
}
