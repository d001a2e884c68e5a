//! sartile: tiled SAR/InSAR raster operators
//!
//! Products are processed one target tile at a time. Each operator declares
//! its output bands at initialization and then computes any tile on demand,
//! reading source data (with a halo where its kernel needs neighbours)
//! through a [`engine::TileProvider`]. Unsupervised classifiers train once
//! on first use and share the model between all tile computations.

pub mod types;
pub mod engine;
pub mod core;
pub mod cluster;

// Re-export main types for easier access
pub use types::{SarComplex, SarError, SarResult};
pub use engine::{
    Operator, OperatorRegistry, OperatorState, ParameterMap, Product, RasterBuffer, Rectangle,
    TileExecutor, TileIndex, TileProvider,
};
