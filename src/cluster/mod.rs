//! Operators that scan the whole source raster before producing tiles:
//! k-means and EM cluster analysis and principal component analysis.

pub mod linalg;
pub mod kmeans;
pub mod em;
pub mod pca;

pub use kmeans::{KMeansAccumulator, KMeansClusterOp, KMeansParams};
pub use em::{EmClusterOp, EmParams};
pub use pca::{PcaModel, PcaOp, PcaParams};

use crate::engine::buffer::RasterBuffer;
use crate::engine::params::ParameterMap;
use crate::engine::product::{Product, Unit};
use crate::engine::provider::{BorderPolicy, TileProvider};
use crate::engine::rectangle::Rectangle;
use crate::types::{SarError, SarResult};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Band holding the cluster index of each pixel
pub const CLASS_INDICES: &str = "class_indices";

/// Class index written outside the ROI and for invalid pixels
pub const NO_CLASS: f64 = -1.0;

/// Rows per strip when scanning the full raster
const SCAN_STRIP_HEIGHT: usize = 64;

/// Sampling rounds before falling back to an ordered scan
const SAMPLING_ROUNDS: usize = 8;

/// A trained cluster
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    pub mean: Vec<f64>,
    /// EM only
    pub covariance: Option<Array2<f64>>,
    pub prior: f64,
    pub member_count: usize,
}

#[inline]
pub fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Index of the closest mean; on equal distance the lowest index wins
pub fn nearest(means: &[Vec<f64>], sample: &[f64]) -> usize {
    let mut best = 0;
    let mut best_dist = f64::INFINITY;
    for (k, mean) in means.iter().enumerate() {
        let d = squared_distance(mean, sample);
        if d < best_dist {
            best_dist = d;
            best = k;
        }
    }
    best
}

/// The bands forming each pixel's feature vector, plus an optional ROI mask.
///
/// A pixel takes part when the mask is non-zero (or absent) and every
/// feature sample is finite and differs from its band's no-data value.
#[derive(Debug, Clone)]
pub struct FeatureSpace {
    bands: Vec<String>,
    no_data: Vec<Option<f64>>,
    roi_band: Option<String>,
    width: usize,
    height: usize,
}

impl FeatureSpace {
    /// An empty `band_names` selects every non-virtual band except the mask.
    pub fn new(
        operator: &str,
        product: &Product,
        band_names: &[String],
        roi_band: Option<&str>,
    ) -> SarResult<Self> {
        let bands: Vec<String> = if band_names.is_empty() {
            product
                .bands()
                .iter()
                .filter(|b| !b.is_virtual() && Some(b.name()) != roi_band && b.unit() != Unit::Class)
                .map(|b| b.name().to_string())
                .collect()
        } else {
            band_names.to_vec()
        };
        if bands.is_empty() {
            return Err(SarError::config(operator, "no source bands to analyse"));
        }

        let mut no_data = Vec::with_capacity(bands.len());
        for name in &bands {
            let band = product
                .band(name)
                .ok_or_else(|| SarError::config(operator, format!("source band '{}' not found", name)))?;
            if band.raster().is_none() {
                return Err(SarError::config(
                    operator,
                    format!("source band '{}' has no raster data", name),
                ));
            }
            no_data.push(band.no_data_value());
        }
        if let Some(roi) = roi_band {
            product
                .band(roi)
                .filter(|b| b.raster().is_some())
                .ok_or_else(|| SarError::config(operator, format!("ROI mask band '{}' not found", roi)))?;
        }

        Ok(Self {
            bands,
            no_data,
            roi_band: roi_band.map(str::to_string),
            width: product.width(),
            height: product.height(),
        })
    }

    pub fn dimension(&self) -> usize {
        self.bands.len()
    }

    pub fn bands(&self) -> &[String] {
        &self.bands
    }

    pub fn read(&self, provider: &dyn TileProvider, rect: &Rectangle) -> SarResult<FeatureTile> {
        let tiles = self
            .bands
            .iter()
            .map(|b| provider.get_tile(b, rect, BorderPolicy::ZeroExtend))
            .collect::<SarResult<Vec<_>>>()?;
        let mask = self
            .roi_band
            .as_ref()
            .map(|b| provider.get_tile(b, rect, BorderPolicy::ZeroExtend))
            .transpose()?;
        Ok(FeatureTile {
            rect: *rect,
            tiles,
            mask,
            no_data: self.no_data.clone(),
        })
    }

    /// Visit every valid ROI pixel of the raster in row-major order.
    pub fn scan<F>(&self, provider: &dyn TileProvider, mut visit: F) -> SarResult<()>
    where
        F: FnMut(&[f64]) -> SarResult<()>,
    {
        let mut sample = vec![0.0; self.dimension()];
        for y0 in (0..self.height).step_by(SCAN_STRIP_HEIGHT) {
            let rows = SCAN_STRIP_HEIGHT.min(self.height - y0);
            let strip = Rectangle::new(0, y0 as i64, self.width, rows);
            let tile = self.read(provider, &strip)?;
            for y in strip.y..strip.max_y() {
                for x in strip.x..strip.max_x() {
                    if tile.pixel(x, y, &mut sample) {
                        visit(&sample)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Number of pixels a scan visits
    pub fn count(&self, provider: &dyn TileProvider) -> SarResult<usize> {
        let mut n = 0;
        self.scan(provider, |_| {
            n += 1;
            Ok(())
        })?;
        Ok(n)
    }

    /// `count` feature vectors with pairwise different values, drawn at
    /// random from the `population` pixels a scan visits.
    pub fn sample_distinct(
        &self,
        operator: &str,
        provider: &dyn TileProvider,
        count: usize,
        population: usize,
        rng: &mut StdRng,
    ) -> SarResult<Vec<Vec<f64>>> {
        let mut chosen: Vec<Vec<f64>> = Vec::with_capacity(count);
        if population == 0 {
            return Err(SarError::config(operator, "no valid pixels inside the ROI"));
        }

        for _ in 0..SAMPLING_ROUNDS {
            if chosen.len() >= count {
                break;
            }
            let wanted = 2 * (count - chosen.len());
            let mut picks: Vec<(usize, usize)> = (0..wanted)
                .map(|slot| (rng.random_range(0..population), slot))
                .collect();
            picks.sort_unstable();

            let mut fetched = vec![Vec::new(); wanted];
            let mut ordinal = 0;
            let mut cursor = 0;
            self.scan(provider, |sample| {
                while cursor < picks.len() && picks[cursor].0 == ordinal {
                    fetched[picks[cursor].1] = sample.to_vec();
                    cursor += 1;
                }
                ordinal += 1;
                Ok(())
            })?;

            for sample in fetched {
                if chosen.len() < count && !sample.is_empty() && !chosen.contains(&sample) {
                    chosen.push(sample);
                }
            }
        }

        if chosen.len() < count {
            log::debug!("{}: random sampling found {} distinct values, scanning", operator, chosen.len());
            self.scan(provider, |sample| {
                if chosen.len() < count && !chosen.iter().any(|c| c.as_slice() == sample) {
                    chosen.push(sample.to_vec());
                }
                Ok(())
            })?;
        }

        if chosen.len() < count {
            return Err(SarError::compute(
                operator,
                format!(
                    "only {} distinct feature vectors for {} clusters",
                    chosen.len(),
                    count
                ),
            ));
        }
        Ok(chosen)
    }
}

/// Feature band tiles over one rectangle
#[derive(Debug, Clone)]
pub struct FeatureTile {
    rect: Rectangle,
    tiles: Vec<RasterBuffer>,
    mask: Option<RasterBuffer>,
    no_data: Vec<Option<f64>>,
}

impl FeatureTile {
    pub fn rectangle(&self) -> Rectangle {
        self.rect
    }

    /// Fill `out` with the feature vector at `(x, y)`; false when the pixel
    /// is outside the ROI or invalid.
    pub fn pixel(&self, x: i64, y: i64, out: &mut [f64]) -> bool {
        if let Some(mask) = &self.mask {
            if mask.get(x, y) == 0.0 {
                return false;
            }
        }
        for ((tile, nd), v) in self.tiles.iter().zip(&self.no_data).zip(out.iter_mut()) {
            let s = tile.get(x, y);
            if !s.is_finite() || *nd == Some(s) {
                return false;
            }
            *v = s;
        }
        true
    }
}

/// Parameters shared by the cluster operators
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterSelection {
    /// Empty selects all bands
    pub source_bands: Vec<String>,
    pub roi_mask_band: Option<String>,
}

impl ClusterSelection {
    pub fn from_parameters(params: &ParameterMap) -> Self {
        Self {
            source_bands: params.get_list("sourceBandNames"),
            roi_mask_band: params.get_str("roiMaskName").map(str::to_string),
        }
    }

    pub fn feature_space(&self, operator: &str, product: &Product) -> SarResult<FeatureSpace> {
        FeatureSpace::new(operator, product, &self.source_bands, self.roi_mask_band.as_deref())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::engine::buffer::DataType;
    use crate::engine::product::Band;
    use crate::engine::provider::ProductTileProvider;
    use rand::SeedableRng;
    use std::sync::Arc;

    /// Two-band product with values clustered around `centres`, one centre
    /// per column stripe, and a mask excluding the first row.
    pub(crate) fn clustered_product(width: usize, height: usize, centres: &[(f64, f64)]) -> Product {
        let stripe = width / centres.len();
        let value = |c: usize, r: usize, band: usize| {
            let (a, b) = centres[(c / stripe).min(centres.len() - 1)];
            let jitter = ((r * 7 + c * 3) % 5) as f64 * 0.01;
            if band == 0 {
                a + jitter
            } else {
                b - jitter
            }
        };
        let mut product = Product::new("features", width, height);
        for (i, name) in ["band_1", "band_2"].iter().enumerate() {
            let data = Array2::from_shape_fn((height, width), |(r, c)| value(c, r, i));
            product
                .add_band(Band::with_data(name, Unit::Intensity, DataType::Float32, data))
                .unwrap();
        }
        let mask = Array2::from_shape_fn((height, width), |(r, _)| if r == 0 { 0.0 } else { 1.0 });
        product
            .add_band(Band::with_data("roi", Unit::Dimensionless, DataType::Float32, mask))
            .unwrap();
        product
    }

    #[test]
    fn test_nearest_prefers_lowest_index_on_ties() {
        let means = vec![vec![0.0], vec![2.0], vec![2.0]];
        assert_eq!(nearest(&means, &[1.0]), 0);
        assert_eq!(nearest(&means, &[3.0]), 1);
    }

    #[test]
    fn test_scan_honours_roi_and_no_data() {
        let mut product = clustered_product(6, 100, &[(1.0, 1.0), (5.0, 5.0)]);
        let mut data = Array2::from_elem((100, 6), 2.0);
        data[[10, 3]] = f64::NAN;
        data[[20, 4]] = -9.0;
        product
            .add_band(Band::with_data("band_3", Unit::Intensity, DataType::Float32, data).with_no_data(-9.0))
            .unwrap();
        let provider = ProductTileProvider::new(Arc::new(product.clone()));

        let all = FeatureSpace::new("test", &product, &[], None).unwrap();
        assert_eq!(all.bands(), &["band_1", "band_2", "roi", "band_3"]);

        let space = FeatureSpace::new("test", &product, &["band_1".into(), "band_3".into()], Some("roi")).unwrap();
        // first row masked, two invalid samples
        assert_eq!(space.count(&provider).unwrap(), 6 * 99 - 2);

        assert!(FeatureSpace::new("test", &product, &["missing".into()], None)
            .unwrap_err()
            .is_configuration());
    }

    #[test]
    fn test_sample_distinct_values() {
        let mut product = Product::new("flat", 4, 4);
        let data = Array2::from_shape_fn((4, 4), |(r, _)| if r < 2 { 1.0 } else { 2.0 });
        product
            .add_band(Band::with_data("b", Unit::Intensity, DataType::Float32, data))
            .unwrap();
        let provider = ProductTileProvider::new(Arc::new(product.clone()));
        let space = FeatureSpace::new("test", &product, &[], None).unwrap();
        let mut rng = StdRng::seed_from_u64(7);

        let mut picked = space.sample_distinct("test", &provider, 2, 16, &mut rng).unwrap();
        picked.sort_by(|a, b| a[0].total_cmp(&b[0]));
        assert_eq!(picked, vec![vec![1.0], vec![2.0]]);

        let err = space.sample_distinct("test", &provider, 3, 16, &mut rng).unwrap_err();
        assert!(matches!(err, SarError::Compute { .. }));
    }
}
