use serde_json::{Map, Value};
use tracing::debug;

use crate::{
    Chart, ChartRenderer, CoreError, QueryContext, QueryContextRequest, QueryContextServices,
    ResultType, ValidationError,
};

/// Renders a chart by running the queries saved in its form data.
///
/// Annotation layers of the saved queries are dropped so a chart used as an
/// annotation source cannot recurse into itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct FormDataRenderer;

impl ChartRenderer for FormDataRenderer {
    fn render(&self, chart: &Chart, force: bool, services: &QueryContextServices) -> Result<Value, CoreError> {
        let queries = chart
            .form_data
            .get("queries")
            .and_then(Value::as_array)
            .filter(|queries| !queries.is_empty())
            .ok_or_else(|| ValidationError::ChartRender {
                message: format!("chart {} has no saved queries", chart.id),
            })?
            .iter()
            .map(|query| match query {
                Value::Object(map) => {
                    let mut map: Map<String, Value> = map.clone();
                    map.remove("annotation_layers");
                    Value::Object(map)
                }
                other => other.clone(),
            })
            .collect();

        let request = QueryContextRequest {
            datasource: chart.datasource,
            queries,
            force,
            custom_cache_timeout: None,
            result_type: Some(ResultType::Full),
            result_format: None,
        };
        debug!(chart_id = chart.id, chart = %chart.slice_name, "rendering chart");
        let context = QueryContext::new(request, services)?;
        let payload = context.get_payload(false, false)?;

        let first = payload.queries.into_iter().next().unwrap_or(Value::Null);
        if let Some(error) = first.get("error").and_then(Value::as_str) {
            return Err(ValidationError::ChartRender {
                message: error.to_owned(),
            }
            .into());
        }
        Ok(first.get("data").cloned().unwrap_or(Value::Array(Vec::new())))
    }
}
