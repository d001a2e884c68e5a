//! Tiled raster engine: geometry, buffers, products, tile providers and the
//! operator lifecycle shared by every processing step.

pub mod rectangle;
pub mod buffer;
pub mod product;
pub mod complex;
pub mod provider;
pub mod operator;
pub mod params;
pub mod executor;
pub mod registry;

// Re-export main types
pub use rectangle::{Halo, Rectangle, TileIndex};
pub use buffer::{DataType, RasterBuffer, SampleKind};
pub use product::{Band, MetadataElement, MetadataValue, Product, Unit, ABSTRACTED_METADATA};
pub use complex::{build_containers, master_for, master_slave_pairs, CplxContainer};
pub use provider::{BorderPolicy, ProductTileProvider, TileProvider};
pub use operator::{computed_bands, Operator, OperatorContext, OperatorState, StateCell, TrainingLatch};
pub use params::ParameterMap;
pub use executor::{CancellationToken, ExecutorParams, TileExecutor};
pub use registry::{OperatorFactory, OperatorRegistry};
