//! Whole-product execution of an initialized operator, tile by tile.

use crate::engine::buffer::RasterBuffer;
use crate::engine::operator::{computed_bands, not_initialized, Operator};
use crate::engine::product::{Band, Product};
use crate::engine::rectangle::Rectangle;
use crate::types::{SarError, SarResult};
use ndarray::Array2;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Shared flag a caller flips to abort a running execution
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn check(&self) -> SarResult<()> {
        if self.is_cancelled() {
            Err(SarError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Executor configuration
#[derive(Debug, Clone)]
pub struct ExecutorParams {
    pub tile_width: usize,
    pub tile_height: usize,
}

impl Default for ExecutorParams {
    fn default() -> Self {
        Self {
            tile_width: 512,
            tile_height: 512,
        }
    }
}

/// Pulls every tile of every target band and assembles the target product.
#[derive(Debug, Clone, Default)]
pub struct TileExecutor {
    params: ExecutorParams,
    cancel: CancellationToken,
}

type TileResult = (Rectangle, BTreeMap<String, RasterBuffer>);

impl TileExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_params(params: ExecutorParams) -> Self {
        Self {
            params,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_tile_size(tile_width: usize, tile_height: usize) -> Self {
        Self::with_params(ExecutorParams {
            tile_width,
            tile_height,
        })
    }

    /// Token that cancels runs of this executor
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Compute the full target product of `operator`.
    ///
    /// Returns [`SarError::Cancelled`] and no product when the token fires.
    pub fn execute(&self, operator: &dyn Operator) -> SarResult<Product> {
        let start = Instant::now();
        let target = operator
            .target_product()
            .ok_or_else(|| not_initialized(operator.id()))?;
        let tiles = Rectangle::tiles(
            target.width(),
            target.height(),
            self.params.tile_width,
            self.params.tile_height,
        )?;
        let band_names = computed_bands(&target);

        log::info!(
            "{}: computing {} band(s) of {}x{} in {} tiles",
            operator.id(),
            band_names.len(),
            target.width(),
            target.height(),
            tiles.len()
        );

        #[cfg(feature = "parallel")]
        let results: Vec<TileResult> = tiles
            .par_iter()
            .map(|rect| self.compute_one(operator, &band_names, rect))
            .collect::<SarResult<Vec<_>>>()?;

        #[cfg(not(feature = "parallel"))]
        let results: Vec<TileResult> = tiles
            .iter()
            .map(|rect| self.compute_one(operator, &band_names, rect))
            .collect::<SarResult<Vec<_>>>()?;

        let product = self.assemble(&target, &band_names, &results)?;
        log::info!(
            "{}: finished in {:.2}s",
            operator.id(),
            start.elapsed().as_secs_f64()
        );
        Ok(product)
    }

    fn compute_one(
        &self,
        operator: &dyn Operator,
        band_names: &[String],
        rect: &Rectangle,
    ) -> SarResult<TileResult> {
        self.cancel.check()?;
        log::debug!("{}: tile {}", operator.id(), rect);
        let tiles = if operator.produces_tile_stack() {
            operator.compute_tile_stack(rect)?
        } else {
            let mut tiles = BTreeMap::new();
            for name in band_names {
                self.cancel.check()?;
                tiles.insert(name.clone(), operator.compute_tile(name, rect)?);
            }
            tiles
        };
        Ok((*rect, tiles))
    }

    fn assemble(
        &self,
        target: &Product,
        band_names: &[String],
        results: &[TileResult],
    ) -> SarResult<Product> {
        let mut rasters: BTreeMap<&str, Array2<f64>> = band_names
            .iter()
            .map(|name| (name.as_str(), Array2::zeros((target.height(), target.width()))))
            .collect();

        for (rect, tiles) in results {
            for (name, tile) in tiles {
                let Some(raster) = rasters.get_mut(name.as_str()) else {
                    continue;
                };
                for y in rect.y..rect.max_y() {
                    self.cancel.check()?;
                    for x in rect.x..rect.max_x() {
                        raster[[y as usize, x as usize]] = tile.get(x, y);
                    }
                }
            }
        }

        let mut product = Product::new(target.name(), target.width(), target.height());
        *product.metadata_mut() = target.metadata().clone();
        for band in target.bands() {
            let out = match (band.expression(), rasters.remove(band.name())) {
                (Some(expression), _) => Band::virtual_band(
                    band.name(),
                    band.unit(),
                    expression,
                    band.width(),
                    band.height(),
                ),
                (None, Some(raster)) => {
                    let out = Band::with_data(band.name(), band.unit(), band.data_type(), raster);
                    match band.no_data_value() {
                        Some(v) => out.with_no_data(v),
                        None => out,
                    }
                }
                (None, None) => band.clone(),
            };
            product.add_band(out)?;
        }
        Ok(product)
    }
}
