use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::{AnnotationLayer, AnnotationLayerStore, Chart, ChartStore, CoreError, SourceError};

/// Annotation layers held in memory, keyed by id.
#[derive(Debug, Default)]
pub struct MemoryAnnotationLayerStore {
    layers: RwLock<BTreeMap<i64, AnnotationLayer>>,
}

impl MemoryAnnotationLayerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_layer(self, layer: AnnotationLayer) -> Self {
        if let Ok(mut layers) = self.layers.write() {
            layers.insert(layer.id, layer);
        }
        self
    }
}

impl AnnotationLayerStore for MemoryAnnotationLayerStore {
    fn find_by_ids(&self, ids: &[i64]) -> Result<Vec<AnnotationLayer>, CoreError> {
        let layers = self
            .layers
            .read()
            .map_err(|_| SourceError::internal("annotation layer store lock poisoned"))?;
        Ok(ids.iter().filter_map(|id| layers.get(id).cloned()).collect())
    }
}

/// Saved charts held in memory, keyed by id.
#[derive(Debug, Default)]
pub struct MemoryChartStore {
    charts: RwLock<BTreeMap<i64, Chart>>,
}

impl MemoryChartStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chart(self, chart: Chart) -> Self {
        if let Ok(mut charts) = self.charts.write() {
            charts.insert(chart.id, chart);
        }
        self
    }
}

impl ChartStore for MemoryChartStore {
    fn find_by_id(&self, id: i64) -> Result<Option<Chart>, CoreError> {
        let charts = self
            .charts
            .read()
            .map_err(|_| SourceError::internal("chart store lock poisoned"))?;
        Ok(charts.get(&id).cloned())
    }
}
