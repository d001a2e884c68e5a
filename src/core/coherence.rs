use crate::engine::buffer::{DataType, RasterBuffer, SampleKind};
use crate::engine::complex::{build_containers, master_slave_pairs, CplxContainer};
use crate::engine::operator::{Operator, OperatorContext, OperatorState};
use crate::engine::params::ParameterMap;
use crate::engine::product::{Band, Product, Unit};
use crate::engine::provider::{BorderPolicy, TileProvider};
use crate::engine::rectangle::{Halo, Rectangle};
use crate::types::{SarComplex, SarError, SarResult};
use ndarray::Array2;
use num_traits::Zero;
use serde::{Deserialize, Serialize};
use std::ops::Add;
use std::sync::Arc;

pub const COHERENCE_ID: &str = "Coherence";

/// Coherence estimation parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoherenceParams {
    /// Estimation window in range (columns)
    pub win_range: usize,
    /// Estimation window in azimuth (rows)
    pub win_azimuth: usize,
}

impl Default for CoherenceParams {
    fn default() -> Self {
        Self {
            win_range: 10,
            win_azimuth: 10,
        }
    }
}

impl CoherenceParams {
    pub fn from_parameters(params: &ParameterMap) -> SarResult<Self> {
        let defaults = Self::default();
        Ok(Self {
            win_range: params.get_or(COHERENCE_ID, "cohWinRg", defaults.win_range)?,
            win_azimuth: params.get_or(COHERENCE_ID, "cohWinAz", defaults.win_azimuth)?,
        })
    }

    pub fn halo(&self) -> Halo {
        Halo::for_window(self.win_range, self.win_azimuth)
    }

    /// Reject empty windows and windows larger than a `width` x `height` raster.
    pub fn validate(&self, operator: &str, width: usize, height: usize) -> SarResult<()> {
        if self.win_range == 0 || self.win_azimuth == 0 {
            return Err(SarError::config(operator, "coherence window must not be empty"));
        }
        if self.win_range > width || self.win_azimuth > height {
            return Err(SarError::config(
                operator,
                format!(
                    "coherence window {}x{} exceeds image size {}x{}",
                    self.win_range, self.win_azimuth, width, height
                ),
            ));
        }
        Ok(())
    }
}

/// `|sum| / sqrt(p1 * p2)`, zero when either power vanishes
pub fn coherence_value(sum_abs: f64, power_master: f64, power_slave: f64) -> f64 {
    let power = power_master * power_slave;
    if power > 0.0 {
        (sum_abs / power.sqrt()).min(1.0)
    } else {
        0.0
    }
}

/// Window sums of `values` for every output pixel.
///
/// `values` covers `out.expand(halo)`; entry `[r, c]` of the result is the sum
/// over the window anchored at source row `r`, column `c`.
fn window_sums<T>(values: &Array2<T>, win_range: usize, win_azimuth: usize, out: &Rectangle) -> Array2<T>
where
    T: Copy + Zero + Add<Output = T>,
{
    let src_rows = values.nrows();
    let mut along_range = Array2::from_elem((src_rows, out.width), T::zero());
    for r in 0..src_rows {
        for c in 0..out.width {
            let mut acc = T::zero();
            for k in 0..win_range {
                acc = acc + values[[r, c + k]];
            }
            along_range[[r, c]] = acc;
        }
    }

    let mut sums = Array2::from_elem((out.height, out.width), T::zero());
    for r in 0..out.height {
        for c in 0..out.width {
            let mut acc = T::zero();
            for k in 0..win_azimuth {
                acc = acc + along_range[[r + k, c]];
            }
            sums[[r, c]] = acc;
        }
    }
    sums
}

/// Complex coherence of two interleaved complex tiles covering
/// `out.expand(params.halo())`.
pub fn complex_coherence(
    master: &RasterBuffer,
    slave: &RasterBuffer,
    out: &Rectangle,
    params: &CoherenceParams,
) -> Array2<f64> {
    let m = master.to_complex_array();
    let s = slave.to_complex_array();
    let cross: Array2<SarComplex> = ndarray::Zip::from(&m).and(&s).map_collect(|a, b| a * b.conj());
    let pm = m.mapv(|v| v.norm_sqr());
    let ps = s.mapv(|v| v.norm_sqr());

    let cross = window_sums(&cross, params.win_range, params.win_azimuth, out);
    let pm = window_sums(&pm, params.win_range, params.win_azimuth, out);
    let ps = window_sums(&ps, params.win_range, params.win_azimuth, out);

    ndarray::Zip::from(&cross)
        .and(&pm)
        .and(&ps)
        .map_collect(|c, a, b| coherence_value(c.norm(), *a, *b))
}

/// Coherence of detected (real-valued) tiles: `|sum m s| / sqrt(sum m^2 sum s^2)`
pub fn detected_coherence(
    master: &RasterBuffer,
    slave: &RasterBuffer,
    out: &Rectangle,
    params: &CoherenceParams,
) -> Array2<f64> {
    let m = master.to_array();
    let s = slave.to_array();
    let cross = &m * &s;
    let pm = m.mapv(|v| v * v);
    let ps = s.mapv(|v| v * v);

    let cross = window_sums(&cross, params.win_range, params.win_azimuth, out);
    let pm = window_sums(&pm, params.win_range, params.win_azimuth, out);
    let ps = window_sums(&ps, params.win_range, params.win_azimuth, out);

    ndarray::Zip::from(&cross)
        .and(&pm)
        .and(&ps)
        .map_collect(|c, a, b| coherence_value(c.abs(), *a, *b))
}

#[derive(Debug, Clone)]
enum PairSource {
    Complex {
        master: CplxContainer,
        slave: CplxContainer,
    },
    Detected {
        master: String,
        slave: String,
    },
}

#[derive(Debug, Clone)]
struct CoherencePair {
    target_band: String,
    source: PairSource,
    no_data: Option<f64>,
}

/// Windowed coherence between the master and every slave of a stack
#[derive(Debug)]
pub struct CoherenceOp {
    ctx: OperatorContext,
    params: CoherenceParams,
    pairs: Vec<CoherencePair>,
}

impl CoherenceOp {
    pub fn new() -> Self {
        Self::with_params(CoherenceParams::default())
    }

    pub fn with_params(params: CoherenceParams) -> Self {
        Self {
            ctx: OperatorContext::new(COHERENCE_ID),
            params,
            pairs: Vec::new(),
        }
    }

    pub fn from_parameters(params: &ParameterMap) -> SarResult<Self> {
        Ok(Self::with_params(CoherenceParams::from_parameters(params)?))
    }

    pub fn params(&self) -> &CoherenceParams {
        &self.params
    }

    fn detected_pairs(source: &Product) -> SarResult<Vec<CoherencePair>> {
        let detected: Vec<&Band> = source
            .bands()
            .iter()
            .filter(|b| !b.is_virtual() && b.raster().is_some())
            .filter(|b| matches!(b.unit(), Unit::Intensity | Unit::Amplitude))
            .collect();
        if detected.len() < 2 {
            return Err(SarError::config(
                COHERENCE_ID,
                "at least two complex or detected bands are required",
            ));
        }
        let master = detected[0];
        Ok(detected[1..]
            .iter()
            .map(|slave| CoherencePair {
                target_band: format!("coh_{}", slave.name()),
                source: PairSource::Detected {
                    master: master.name().to_string(),
                    slave: slave.name().to_string(),
                },
                no_data: master.no_data_value(),
            })
            .collect())
    }

    fn complex_pairs(source: &Product, containers: Vec<CplxContainer>) -> SarResult<Vec<CoherencePair>> {
        master_slave_pairs(COHERENCE_ID, &containers)?
            .into_iter()
            .map(|(master, slave)| -> SarResult<CoherencePair> {
                Ok(CoherencePair {
                    target_band: format!("coh_{}", slave.name),
                    no_data: source.require_band(&master.real_band)?.no_data_value(),
                    source: PairSource::Complex { master, slave },
                })
            })
            .collect()
    }

    fn compute_pair(&self, pair: &CoherencePair, rect: &Rectangle) -> SarResult<RasterBuffer> {
        let provider = self.ctx.provider()?;
        let src_rect = rect.expand(self.params.halo());

        let (values, slave_real) = match &pair.source {
            PairSource::Complex { master, slave } => {
                let m = provider.get_complex_tile(master, &src_rect, BorderPolicy::ZeroExtend)?;
                let s = provider.get_complex_tile(slave, &src_rect, BorderPolicy::ZeroExtend)?;
                (complex_coherence(&m, &s, rect, &self.params), s)
            }
            PairSource::Detected { master, slave } => {
                let m = provider.get_tile(master, &src_rect, BorderPolicy::ZeroExtend)?;
                let s = provider.get_tile(slave, &src_rect, BorderPolicy::ZeroExtend)?;
                (detected_coherence(&m, &s, rect, &self.params), s)
            }
        };

        let mut tile = RasterBuffer::new(*rect, DataType::Float32, SampleKind::Real);
        for y in rect.y..rect.max_y() {
            for x in rect.x..rect.max_x() {
                let r = (y - rect.y) as usize;
                let c = (x - rect.x) as usize;
                let value = match pair.no_data {
                    Some(nd) if slave_real.get(x, y) == nd => nd,
                    _ => values[[r, c]],
                };
                tile.set(x, y, value);
            }
        }
        Ok(tile)
    }
}

impl Default for CoherenceOp {
    fn default() -> Self {
        Self::new()
    }
}

impl Operator for CoherenceOp {
    fn id(&self) -> &str {
        self.ctx.id()
    }

    fn state(&self) -> OperatorState {
        self.ctx.state()
    }

    fn initialize(&mut self, source: Arc<Product>) -> SarResult<Arc<Product>> {
        self.params.validate(COHERENCE_ID, source.width(), source.height())?;

        let containers = build_containers(COHERENCE_ID, &source)?;
        self.pairs = if containers.is_empty() {
            Self::detected_pairs(&source)?
        } else {
            Self::complex_pairs(&source, containers)?
        };

        let mut target = source.derived("Coh");
        for pair in &self.pairs {
            let mut band = Band::new(
                &pair.target_band,
                Unit::Coherence,
                DataType::Float32,
                source.width(),
                source.height(),
            );
            if let Some(nd) = pair.no_data {
                band = band.with_no_data(nd);
            }
            target.add_band(band)?;
        }

        log::info!(
            "Coherence: {} pair(s), window {}x{} (range x azimuth)",
            self.pairs.len(),
            self.params.win_range,
            self.params.win_azimuth
        );
        Ok(self.ctx.bind(source, target, true))
    }

    fn target_product(&self) -> Option<Arc<Product>> {
        self.ctx.target()
    }

    fn compute_tile(&self, band: &str, rect: &Rectangle) -> SarResult<RasterBuffer> {
        self.ctx.check_target_band(band)?;
        let pair = self
            .pairs
            .iter()
            .find(|p| p.target_band == band)
            .ok_or_else(|| SarError::OutOfRange(format!("No coherence pair for band '{}'", band)))?;
        self.compute_pair(pair, rect)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn stack(width: usize, height: usize) -> Arc<Product> {
        let mut product = Product::new("stack", width, height);
        let phase = |r: usize, c: usize| (r as f64 * 0.3 + c as f64 * 0.7).sin();
        let mst_re = Array2::from_shape_fn((height, width), |(r, c)| 1.0 + phase(r, c));
        let mst_im = Array2::from_shape_fn((height, width), |(r, c)| phase(c, r));
        let slv_re = Array2::from_shape_fn((height, width), |(r, c)| 0.5 + phase(r, c) * 0.8);
        let slv_im = Array2::from_shape_fn((height, width), |(r, c)| (r * c % 5) as f64 * 0.1);
        for (name, unit, data) in [
            ("i_VV_mst", Unit::Real, mst_re),
            ("q_VV_mst", Unit::Imaginary, mst_im),
            ("i_VV_slv1", Unit::Real, slv_re),
            ("q_VV_slv1", Unit::Imaginary, slv_im),
        ] {
            product.add_band(Band::with_data(name, unit, DataType::Float64, data)).unwrap();
        }
        Arc::new(product)
    }

    #[test]
    fn test_coherence_value_edge_cases() {
        assert_eq!(coherence_value(1.0, 0.0, 4.0), 0.0);
        assert_abs_diff_eq!(coherence_value(2.0, 2.0, 2.0), 1.0);
    }

    #[test]
    fn test_bounds_and_target_bands() {
        let mut op = CoherenceOp::with_params(CoherenceParams {
            win_range: 5,
            win_azimuth: 3,
        });
        let target = op.initialize(stack(12, 9)).unwrap();
        assert_eq!(target.band_names(), vec!["coh_VV_slv1"]);
        assert_eq!(op.state(), OperatorState::Ready);

        let tile = op.compute_tile("coh_VV_slv1", &Rectangle::of_size(12, 9)).unwrap();
        for v in tile.to_array().iter() {
            assert!((0.0..=1.0).contains(v), "coherence {} out of range", v);
        }
    }

    #[test]
    fn test_window_larger_than_image() {
        let mut op = CoherenceOp::with_params(CoherenceParams {
            win_range: 20,
            win_azimuth: 3,
        });
        let err = op.initialize(stack(12, 9)).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_detected_mode() {
        let mut product = Product::new("amp", 6, 6);
        let a = Array2::from_shape_fn((6, 6), |(r, c)| 1.0 + (r + c) as f64);
        product
            .add_band(Band::with_data("Intensity_mst", Unit::Intensity, DataType::Float32, a.clone()))
            .unwrap();
        product
            .add_band(Band::with_data("Intensity_slv", Unit::Intensity, DataType::Float32, a * 2.0))
            .unwrap();

        let mut op = CoherenceOp::with_params(CoherenceParams {
            win_range: 3,
            win_azimuth: 3,
        });
        op.initialize(Arc::new(product)).unwrap();
        let tile = op.compute_tile("coh_Intensity_slv", &Rectangle::new(1, 1, 4, 4)).unwrap();
        // proportional signals are fully coherent
        for v in tile.to_array().iter() {
            assert_abs_diff_eq!(*v, 1.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_detected_mode_ignores_virtual_bands() {
        let mut product = Product::new("amp", 6, 6);
        let a = Array2::from_shape_fn((6, 6), |(r, c)| 1.0 + (r * c) as f64);
        product
            .add_band(Band::with_data("Amplitude_VV", Unit::Amplitude, DataType::Float32, a))
            .unwrap();
        product
            .add_virtual_band("Intensity_VV", Unit::Intensity, "Amplitude_VV * Amplitude_VV")
            .unwrap();

        let mut op = CoherenceOp::with_params(CoherenceParams {
            win_range: 3,
            win_azimuth: 3,
        });
        let err = op.initialize(Arc::new(product)).unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(op.state(), OperatorState::Uninitialized);
    }

    #[test]
    fn test_no_data_passthrough() {
        let mut product = Product::new("stack", 4, 4);
        let mut slv = Array2::from_elem((4, 4), 1.0);
        slv[[2, 2]] = 0.0;
        product
            .add_band(Band::with_data("i_mst", Unit::Real, DataType::Float32, Array2::from_elem((4, 4), 1.0)).with_no_data(0.0))
            .unwrap();
        product
            .add_band(Band::with_data("q_mst", Unit::Imaginary, DataType::Float32, Array2::zeros((4, 4))))
            .unwrap();
        product.add_band(Band::with_data("i_slv", Unit::Real, DataType::Float32, slv)).unwrap();
        product
            .add_band(Band::with_data("q_slv", Unit::Imaginary, DataType::Float32, Array2::zeros((4, 4))))
            .unwrap();

        let mut op = CoherenceOp::with_params(CoherenceParams {
            win_range: 3,
            win_azimuth: 3,
        });
        op.initialize(Arc::new(product)).unwrap();
        let tile = op.compute_tile("coh_slv", &Rectangle::of_size(4, 4)).unwrap();
        assert_eq!(tile.get(2, 2), 0.0);
        assert_abs_diff_eq!(tile.get(0, 0), 1.0, epsilon = 1e-6);
    }
}
