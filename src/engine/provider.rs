//! Source tile access for operators.

use crate::engine::buffer::{RasterBuffer, SampleKind};
use crate::engine::complex::CplxContainer;
use crate::engine::product::{Band, Product};
use crate::engine::rectangle::Rectangle;
use crate::types::{SarError, SarResult};
use std::sync::Arc;

/// How requests reaching past the raster border are answered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BorderPolicy {
    /// Return only the part of the request inside the raster
    Clip,
    /// Return exactly the requested rectangle, zeros outside the raster
    ZeroExtend,
}

/// Supplies source tiles on demand. Tiles are never cached.
pub trait TileProvider: Send + Sync {
    fn get_tile(&self, band: &str, rect: &Rectangle, border: BorderPolicy) -> SarResult<RasterBuffer>;

    /// Interleaved complex tile assembled from a real/imaginary band pair.
    fn get_complex_tile(
        &self,
        container: &CplxContainer,
        rect: &Rectangle,
        border: BorderPolicy,
    ) -> SarResult<RasterBuffer> {
        let re = self.get_tile(&container.real_band, rect, border)?;
        let im = self.get_tile(&container.imag_band, rect, border)?;
        let out_rect = re.rectangle();
        let mut out = RasterBuffer::new(out_rect, re.data_type(), SampleKind::Complex);
        let mut index = out.tile_index();
        let mut src_index = re.tile_index();
        for y in out_rect.y..out_rect.max_y() {
            index.calculate_stride(y);
            src_index.calculate_stride(y);
            for x in out_rect.x..out_rect.max_x() {
                let dst = index.index(x);
                let src = src_index.index(x);
                out.set_at(dst, re.get_at(src));
                out.set_at(dst + 1, im.get_at(src));
            }
        }
        Ok(out)
    }
}

/// Provider reading from the in-memory rasters of a product
#[derive(Debug, Clone)]
pub struct ProductTileProvider {
    product: Arc<Product>,
}

impl ProductTileProvider {
    pub fn new(product: Arc<Product>) -> Self {
        Self { product }
    }

    pub fn product(&self) -> &Arc<Product> {
        &self.product
    }

    fn raster_band(&self, name: &str) -> SarResult<&Band> {
        let band = self.product.require_band(name)?;
        if band.raster().is_none() {
            return Err(SarError::OutOfRange(format!(
                "Band '{}' of product '{}' has no raster data",
                name,
                self.product.name()
            )));
        }
        Ok(band)
    }
}

impl TileProvider for ProductTileProvider {
    fn get_tile(&self, band: &str, rect: &Rectangle, border: BorderPolicy) -> SarResult<RasterBuffer> {
        let source = self.raster_band(band)?;
        let inside = rect.clip_to(source.width(), source.height());

        let out_rect = match border {
            BorderPolicy::ZeroExtend => *rect,
            BorderPolicy::Clip => inside.ok_or_else(|| {
                SarError::OutOfRange(format!(
                    "Rectangle {} lies outside band '{}' ({}x{})",
                    rect,
                    band,
                    source.width(),
                    source.height()
                ))
            })?,
        };

        let mut buffer = RasterBuffer::new(out_rect, source.data_type(), SampleKind::Real);

        let (Some(inside), Some(raster)) = (inside, source.raster()) else {
            return Ok(buffer);
        };

        let mut index = buffer.tile_index();
        for y in inside.y..inside.max_y() {
            index.calculate_stride(y);
            let row = raster.row(y as usize);
            for x in inside.x..inside.max_x() {
                buffer.set_at(index.index(x), row[x as usize]);
            }
        }
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::complex::build_containers;
    use crate::engine::buffer::DataType;
    use crate::engine::product::Unit;
    use ndarray::Array2;

    fn provider() -> ProductTileProvider {
        let mut product = Product::new("src", 4, 3);
        let re = Array2::from_shape_fn((3, 4), |(r, c)| (r * 4 + c) as f64);
        let im = re.mapv(|v| -v);
        product.add_band(Band::with_data("i_VV", Unit::Real, DataType::Float32, re)).unwrap();
        product.add_band(Band::with_data("q_VV", Unit::Imaginary, DataType::Float32, im)).unwrap();
        product.add_band(Band::new("declared", Unit::Intensity, DataType::Float32, 4, 3)).unwrap();
        ProductTileProvider::new(Arc::new(product))
    }

    #[test]
    fn test_zero_extend_keeps_requested_rectangle() {
        let provider = provider();
        let rect = Rectangle::new(-1, -1, 3, 3);
        let tile = provider.get_tile("i_VV", &rect, BorderPolicy::ZeroExtend).unwrap();
        assert_eq!(tile.rectangle(), rect);
        assert_eq!(tile.get(-1, -1), 0.0);
        assert_eq!(tile.get(1, 1), 5.0);
    }

    #[test]
    fn test_clip_returns_intersection() {
        let provider = provider();
        let tile = provider
            .get_tile("i_VV", &Rectangle::new(2, 1, 5, 5), BorderPolicy::Clip)
            .unwrap();
        assert_eq!(tile.rectangle(), Rectangle::new(2, 1, 2, 2));
        assert_eq!(tile.get(3, 2), 11.0);

        let outside = provider.get_tile("i_VV", &Rectangle::new(10, 10, 2, 2), BorderPolicy::Clip);
        assert!(matches!(outside, Err(SarError::OutOfRange(_))));
    }

    #[test]
    fn test_missing_bands_are_out_of_range() {
        let provider = provider();
        let rect = Rectangle::of_size(2, 2);
        assert!(matches!(
            provider.get_tile("nope", &rect, BorderPolicy::Clip),
            Err(SarError::OutOfRange(_))
        ));
        assert!(matches!(
            provider.get_tile("declared", &rect, BorderPolicy::Clip),
            Err(SarError::OutOfRange(_))
        ));
    }

    #[test]
    fn test_complex_tile_interleaves_pair() {
        let provider = provider();
        let containers = build_containers("test", provider.product()).unwrap();
        let tile = provider
            .get_complex_tile(&containers[0], &Rectangle::of_size(4, 3), BorderPolicy::Clip)
            .unwrap();
        assert_eq!(tile.kind(), SampleKind::Complex);
        let z = tile.get_complex(2, 1);
        assert_eq!(z.re, 6.0);
        assert_eq!(z.im, -6.0);
    }
}
