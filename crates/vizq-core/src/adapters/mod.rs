mod memory;
mod static_source;

pub use memory::{MemoryAnnotationLayerStore, MemoryChartStore};
pub use static_source::StaticDatasource;
