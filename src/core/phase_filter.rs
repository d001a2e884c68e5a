use crate::core::spectral::{check_power_of_two, smooth_circular, Fft2d};
use crate::engine::buffer::{DataType, RasterBuffer, SampleKind};
use crate::engine::complex::{build_containers, CplxContainer};
use crate::engine::operator::{Operator, OperatorContext, OperatorState};
use crate::engine::params::ParameterMap;
use crate::engine::product::{Band, Product};
use crate::engine::provider::{BorderPolicy, TileProvider};
use crate::engine::rectangle::Rectangle;
use crate::types::{SarComplex, SarError, SarResult};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const GOLDSTEIN_ID: &str = "Goldstein-Phase-Filtering";

/// Spectra whose peak amplitude is at or below this are left unfiltered
const AMPLITUDE_FLOOR: f64 = 1e-20;

/// Goldstein filter parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoldsteinParams {
    /// Spectrum exponent in [0, 1]
    pub alpha: f64,
    /// FFT block edge, power of two
    pub block_size: usize,
    /// Block border discarded on every side
    pub overlap: usize,
    /// Odd 1D kernel smoothing the amplitude spectrum; length 1 disables smoothing
    pub smoothing_kernel: Vec<f64>,
}

impl Default for GoldsteinParams {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            block_size: 32,
            overlap: 3,
            smoothing_kernel: vec![1.0 / 3.0; 3],
        }
    }
}

impl GoldsteinParams {
    pub fn from_parameters(params: &ParameterMap) -> SarResult<Self> {
        let defaults = Self::default();
        Ok(Self {
            alpha: params.get_or(GOLDSTEIN_ID, "alpha", defaults.alpha)?,
            block_size: params.get_or(GOLDSTEIN_ID, "blockSize", defaults.block_size)?,
            overlap: params.get_or(GOLDSTEIN_ID, "overlap", defaults.overlap)?,
            smoothing_kernel: params
                .get_f64_list(GOLDSTEIN_ID, "smoothingKernel")?
                .unwrap_or(defaults.smoothing_kernel),
        })
    }

    pub fn validate(&self) -> SarResult<()> {
        if !(0.0..=1.0).contains(&self.alpha) {
            return Err(SarError::config(
                GOLDSTEIN_ID,
                format!("alpha must lie in [0, 1], got {}", self.alpha),
            ));
        }
        check_power_of_two(GOLDSTEIN_ID, "blockSize", self.block_size)?;
        if 2 * self.overlap >= self.block_size {
            return Err(SarError::config(
                GOLDSTEIN_ID,
                format!("overlap {} leaves no interior in a {} block", self.overlap, self.block_size),
            ));
        }
        let k = self.smoothing_kernel.len();
        if k % 2 == 0 || k > self.block_size {
            return Err(SarError::config(
                GOLDSTEIN_ID,
                format!("smoothing kernel must have odd length <= blockSize, got {}", k),
            ));
        }
        Ok(())
    }

    /// Output pixels committed per block and axis
    pub fn block_stride(&self) -> usize {
        self.block_size - 2 * self.overlap
    }
}

/// Filter one square block of complex samples in place.
pub fn goldstein_block(block: &mut Array2<SarComplex>, fft: &Fft2d, params: &GoldsteinParams) {
    fft.forward(block);

    let mut amplitude = block.mapv(|v| v.norm());
    if params.smoothing_kernel.len() > 1 {
        amplitude = smooth_circular(&amplitude, &params.smoothing_kernel);
    }
    let max = amplitude.iter().cloned().fold(0.0f64, f64::max);

    if max > AMPLITUDE_FLOOR {
        ndarray::Zip::from(&mut *block).and(&amplitude).for_each(|v, a| {
            *v *= (a / max).powf(params.alpha);
        });
    }
    fft.inverse(block);
}

/// Goldstein adaptive phase filter.
///
/// Blocks sit on a grid anchored at the image origin: block `(bx, by)` reads
/// source pixels starting at `(bx * stride - overlap, by * stride - overlap)`
/// and commits its `stride x stride` interior, so results do not depend on
/// how the image is tiled.
#[derive(Debug)]
pub struct GoldsteinFilterOp {
    ctx: OperatorContext,
    params: GoldsteinParams,
    containers: Vec<CplxContainer>,
    fft: Option<Fft2d>,
}

impl GoldsteinFilterOp {
    pub fn new() -> Self {
        Self::with_params(GoldsteinParams::default())
    }

    pub fn with_params(params: GoldsteinParams) -> Self {
        Self {
            ctx: OperatorContext::new(GOLDSTEIN_ID),
            params,
            containers: Vec::new(),
            fft: None,
        }
    }

    pub fn from_parameters(params: &ParameterMap) -> SarResult<Self> {
        Ok(Self::with_params(GoldsteinParams::from_parameters(params)?))
    }

    fn filter_container(&self, container: &CplxContainer, rect: &Rectangle) -> SarResult<RasterBuffer> {
        let provider = self.ctx.provider()?;
        let fft = self
            .fft
            .as_ref()
            .ok_or_else(|| SarError::config(GOLDSTEIN_ID, "operator has not been initialized"))?;
        let size = self.params.block_size;
        let stride = self.params.block_stride() as i64;
        let overlap = self.params.overlap as i64;

        let mut out = RasterBuffer::new(*rect, DataType::Float64, SampleKind::Complex);
        for by in rect.y.div_euclid(stride)..=(rect.max_y() - 1).div_euclid(stride) {
            for bx in rect.x.div_euclid(stride)..=(rect.max_x() - 1).div_euclid(stride) {
                let block_rect = Rectangle::new(bx * stride - overlap, by * stride - overlap, size, size);
                let tile = provider.get_complex_tile(container, &block_rect, BorderPolicy::ZeroExtend)?;
                let mut block = tile.to_complex_array();
                goldstein_block(&mut block, fft, &self.params);

                let interior = Rectangle::new(bx * stride, by * stride, stride as usize, stride as usize);
                let Some(commit) = interior.intersection(rect) else {
                    continue;
                };
                for y in commit.y..commit.max_y() {
                    for x in commit.x..commit.max_x() {
                        let v = block[[(y - block_rect.y) as usize, (x - block_rect.x) as usize]];
                        out.set_complex(x, y, v);
                    }
                }
            }
        }
        Ok(out)
    }

    fn split_components(
        &self,
        container: &CplxContainer,
        filtered: &RasterBuffer,
        out: &mut BTreeMap<String, RasterBuffer>,
    ) -> SarResult<()> {
        let source = self.ctx.source()?;
        let rect = filtered.rectangle();
        let mut re = RasterBuffer::new(rect, source.require_band(&container.real_band)?.data_type(), SampleKind::Real);
        let mut im = RasterBuffer::new(rect, source.require_band(&container.imag_band)?.data_type(), SampleKind::Real);
        for y in rect.y..rect.max_y() {
            for x in rect.x..rect.max_x() {
                let v = filtered.get_complex(x, y);
                re.set(x, y, v.re);
                im.set(x, y, v.im);
            }
        }
        out.insert(container.real_band.clone(), re);
        out.insert(container.imag_band.clone(), im);
        Ok(())
    }
}

impl Default for GoldsteinFilterOp {
    fn default() -> Self {
        Self::new()
    }
}

impl Operator for GoldsteinFilterOp {
    fn id(&self) -> &str {
        self.ctx.id()
    }

    fn state(&self) -> OperatorState {
        self.ctx.state()
    }

    fn initialize(&mut self, source: Arc<Product>) -> SarResult<Arc<Product>> {
        self.params.validate()?;
        self.containers = build_containers(GOLDSTEIN_ID, &source)?;
        self.fft = Some(Fft2d::new(self.params.block_size, self.params.block_size));

        let mut target = source.derived("Flt");
        for band in source.bands() {
            let declared = match band.expression() {
                Some(expr) => Band::virtual_band(band.name(), band.unit(), expr, band.width(), band.height()),
                None => {
                    let b = Band::new(band.name(), band.unit(), band.data_type(), band.width(), band.height());
                    match band.no_data_value() {
                        Some(nd) => b.with_no_data(nd),
                        None => b,
                    }
                }
            };
            target.add_band(declared)?;
        }

        log::info!(
            "Goldstein filter: {} complex pair(s), alpha {}, block {}, overlap {}",
            self.containers.len(),
            self.params.alpha,
            self.params.block_size,
            self.params.overlap
        );
        Ok(self.ctx.bind(source, target, true))
    }

    fn target_product(&self) -> Option<Arc<Product>> {
        self.ctx.target()
    }

    fn compute_tile(&self, band: &str, rect: &Rectangle) -> SarResult<RasterBuffer> {
        self.ctx.check_target_band(band)?;
        match self
            .containers
            .iter()
            .find(|c| c.real_band == band || c.imag_band == band)
        {
            Some(container) => {
                let filtered = self.filter_container(container, rect)?;
                let mut tiles = BTreeMap::new();
                self.split_components(container, &filtered, &mut tiles)?;
                tiles.remove(band).ok_or_else(|| {
                    SarError::compute(GOLDSTEIN_ID, format!("band '{}' was not produced", band))
                })
            }
            None => self.ctx.provider()?.get_tile(band, rect, BorderPolicy::ZeroExtend),
        }
    }

    fn produces_tile_stack(&self) -> bool {
        true
    }

    fn compute_tile_stack(&self, rect: &Rectangle) -> SarResult<BTreeMap<String, RasterBuffer>> {
        let source = self.ctx.source()?;
        let provider = self.ctx.provider()?;
        let mut tiles = BTreeMap::new();
        for container in &self.containers {
            let filtered = self.filter_container(container, rect)?;
            self.split_components(container, &filtered, &mut tiles)?;
        }
        for band in source.bands().iter().filter(|b| !b.is_virtual()) {
            if !tiles.contains_key(band.name()) {
                tiles.insert(
                    band.name().to_string(),
                    provider.get_tile(band.name(), rect, BorderPolicy::ZeroExtend)?,
                );
            }
        }
        Ok(tiles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::product::Unit;
    use approx::assert_abs_diff_eq;

    fn fringes(width: usize, height: usize) -> Arc<Product> {
        let mut product = Product::new("ifg", width, height);
        let phase = |r: usize, c: usize| 0.4 * c as f64 + 0.15 * r as f64 + ((r * 7 + c * 3) % 5) as f64 * 0.2;
        product
            .add_band(Band::with_data(
                "i_ifg",
                Unit::Real,
                DataType::Float64,
                Array2::from_shape_fn((height, width), |(r, c)| phase(r, c).cos()),
            ))
            .unwrap();
        product
            .add_band(Band::with_data(
                "q_ifg",
                Unit::Imaginary,
                DataType::Float64,
                Array2::from_shape_fn((height, width), |(r, c)| phase(r, c).sin()),
            ))
            .unwrap();
        product
            .add_band(Band::with_data(
                "coh",
                Unit::Coherence,
                DataType::Float32,
                Array2::from_elem((height, width), 0.5),
            ))
            .unwrap();
        Arc::new(product)
    }

    #[test]
    fn test_validation() {
        let mut params = GoldsteinParams::default();
        assert!(params.validate().is_ok());
        params.block_size = 24;
        assert!(params.validate().unwrap_err().is_configuration());
        params.block_size = 8;
        params.overlap = 4;
        assert!(params.validate().is_err());
        params.overlap = 1;
        params.smoothing_kernel = vec![0.5, 0.5];
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_alpha_zero_is_identity() {
        let params = GoldsteinParams {
            alpha: 0.0,
            block_size: 8,
            overlap: 1,
            smoothing_kernel: vec![1.0],
        };
        let fft = Fft2d::new(8, 8);
        let original = Array2::from_shape_fn((8, 8), |(r, c)| SarComplex::new(r as f64, -(c as f64)));
        let mut block = original.clone();
        goldstein_block(&mut block, &fft, &params);
        for (a, b) in block.iter().zip(original.iter()) {
            assert_abs_diff_eq!(a.re, b.re, epsilon = 1e-9);
            assert_abs_diff_eq!(a.im, b.im, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_zero_block_left_unfiltered() {
        let fft = Fft2d::new(8, 8);
        let mut block = Array2::from_elem((8, 8), SarComplex::new(0.0, 0.0));
        goldstein_block(&mut block, &fft, &GoldsteinParams::default());
        assert!(block.iter().all(|v| v.norm() == 0.0));
    }

    #[test]
    fn test_tiling_does_not_change_result() {
        let params = GoldsteinParams {
            alpha: 0.8,
            block_size: 16,
            overlap: 2,
            ..Default::default()
        };
        let mut op = GoldsteinFilterOp::with_params(params);
        op.initialize(fringes(30, 22)).unwrap();

        let whole = op.compute_tile("q_ifg", &Rectangle::of_size(30, 22)).unwrap();
        for tile in Rectangle::tiles(30, 22, 7, 9).unwrap() {
            let part = op.compute_tile("q_ifg", &tile).unwrap();
            for y in tile.y..tile.max_y() {
                for x in tile.x..tile.max_x() {
                    assert_abs_diff_eq!(part.get(x, y), whole.get(x, y), epsilon = 1e-12);
                }
            }
        }
    }

    #[test]
    fn test_non_complex_band_passes_through() {
        let mut op = GoldsteinFilterOp::new();
        op.initialize(fringes(10, 10)).unwrap();
        let stack = op.compute_tile_stack(&Rectangle::new(2, 2, 4, 4)).unwrap();
        assert_eq!(stack.len(), 3);
        assert_eq!(stack["coh"].get(3, 3), 0.5);
    }
}
