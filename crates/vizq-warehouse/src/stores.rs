//! Annotation layer and chart stores backed by the catalog tables.

use std::collections::BTreeMap;

use ::duckdb::{params, OptionalExt, Row};
use vizq_core::{
    Annotation, AnnotationLayer, AnnotationLayerStore, Chart, ChartStore, CoreError, DatasourceKind,
    DatasourceRef, UtcDateTime,
};

use crate::{SessionKind, Warehouse, WarehouseError};

#[derive(Clone)]
pub struct WarehouseAnnotationStore {
    warehouse: Warehouse,
}

impl WarehouseAnnotationStore {
    pub fn new(warehouse: Warehouse) -> Self {
        Self { warehouse }
    }

    fn load(&self, ids: &[i64]) -> Result<Vec<AnnotationLayer>, WarehouseError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let id_list = ids
            .iter()
            .map(i64::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        let connection = self.warehouse.session(SessionKind::Metadata)?;

        let mut layers = BTreeMap::new();
        let mut statement = connection.prepare(&format!(
            "SELECT id, name, descr FROM annotation_layers WHERE id IN ({id_list})"
        ))?;
        let mut rows = statement.query(params![])?;
        while let Some(row) = rows.next()? {
            let id: i64 = row.get(0)?;
            layers.insert(
                id,
                AnnotationLayer {
                    id,
                    name: row.get(1)?,
                    descr: row.get(2)?,
                    annotations: Vec::new(),
                },
            );
        }

        let mut statement = connection.prepare(&format!(
            "SELECT layer_id, start_dttm, end_dttm, short_descr, long_descr, json_metadata \
             FROM annotations WHERE layer_id IN ({id_list}) ORDER BY layer_id, position"
        ))?;
        let mut rows = statement.query(params![])?;
        while let Some(row) = rows.next()? {
            let layer_id: i64 = row.get(0)?;
            let annotation = read_annotation(row)?;
            if let Some(layer) = layers.get_mut(&layer_id) {
                layer.annotations.push(annotation);
            }
        }

        Ok(layers.into_values().collect())
    }
}

fn read_annotation(row: &Row<'_>) -> Result<Annotation, WarehouseError> {
    Ok(Annotation {
        start_dttm: read_timestamp(row.get(1)?)?,
        end_dttm: read_timestamp(row.get(2)?)?,
        short_descr: row.get(3)?,
        long_descr: row.get(4)?,
        json_metadata: row.get(5)?,
    })
}

fn read_timestamp(value: Option<String>) -> Result<Option<UtcDateTime>, WarehouseError> {
    value
        .map(|value| {
            UtcDateTime::parse(&value).map_err(|err| WarehouseError::InvalidRecord {
                table: "annotations",
                reason: err.to_string(),
            })
        })
        .transpose()
}

impl AnnotationLayerStore for WarehouseAnnotationStore {
    fn find_by_ids(&self, ids: &[i64]) -> Result<Vec<AnnotationLayer>, CoreError> {
        Ok(self.load(ids)?)
    }
}

#[derive(Clone)]
pub struct WarehouseChartStore {
    warehouse: Warehouse,
}

impl WarehouseChartStore {
    pub fn new(warehouse: Warehouse) -> Self {
        Self { warehouse }
    }

    fn load(&self, id: i64) -> Result<Option<Chart>, WarehouseError> {
        let connection = self.warehouse.session(SessionKind::Metadata)?;
        let row = connection
            .query_row(
                "SELECT slice_name, datasource_type, datasource_id, form_data FROM charts WHERE id = ?",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((slice_name, datasource_type, datasource_id, form_data)) = row else {
            return Ok(None);
        };
        let kind: DatasourceKind = datasource_type
            .parse()
            .map_err(|err: vizq_core::ValidationError| WarehouseError::InvalidRecord {
                table: "charts",
                reason: err.to_string(),
            })?;

        Ok(Some(Chart {
            id,
            slice_name,
            datasource: DatasourceRef::new(kind, datasource_id),
            form_data: serde_json::from_str(&form_data)?,
        }))
    }
}

impl ChartStore for WarehouseChartStore {
    fn find_by_id(&self, id: i64) -> Result<Option<Chart>, CoreError> {
        Ok(self.load(id)?)
    }
}
