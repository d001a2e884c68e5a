use crate::core::spectral::{bin_frequency, check_power_of_two, hamming, wrap_frequency, Fft1d};
use crate::engine::buffer::{DataType, RasterBuffer, SampleKind};
use crate::engine::complex::{build_containers, master_slave_pairs, CplxContainer};
use crate::engine::operator::{Operator, OperatorContext, OperatorState};
use crate::engine::params::ParameterMap;
use crate::engine::product::{Band, Product};
use crate::engine::provider::{BorderPolicy, TileProvider};
use crate::engine::rectangle::Rectangle;
use crate::types::{SarComplex, SarError, SarResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const AZIMUTH_FILTER_ID: &str = "Azimuth-Filter";

/// Metadata attribute keys read per acquisition (falling back to the
/// abstracted metadata)
pub const ATTR_PRF: &str = "PRF";
pub const ATTR_AZIMUTH_BANDWIDTH: &str = "azimuth_bandwidth";
pub const ATTR_DOPPLER: &str = "doppler_centroid";
pub const ATTR_DOPPLER_SLOPE: &str = "doppler_centroid_slope";

/// Azimuth common-band filter parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AzimuthFilterParams {
    /// FFT length along azimuth, power of two
    pub fft_length: usize,
    /// Rows discarded at both ends of every block
    pub overlap: usize,
    /// Hamming weighting used by the processor and for the new window
    pub hamming_alpha: f64,
    /// Filter the master as well as the slaves
    pub filter_master: bool,
    /// Overrides for the metadata values [Hz]
    pub prf: Option<f64>,
    pub azimuth_bandwidth: Option<f64>,
}

impl Default for AzimuthFilterParams {
    fn default() -> Self {
        Self {
            fft_length: 256,
            overlap: 16,
            hamming_alpha: 0.75,
            filter_master: true,
            prf: None,
            azimuth_bandwidth: None,
        }
    }
}

impl AzimuthFilterParams {
    pub fn from_parameters(params: &ParameterMap) -> SarResult<Self> {
        let d = Self::default();
        Ok(Self {
            fft_length: params.get_or(AZIMUTH_FILTER_ID, "fftLength", d.fft_length)?,
            overlap: params.get_or(AZIMUTH_FILTER_ID, "overlap", d.overlap)?,
            hamming_alpha: params.get_or(AZIMUTH_FILTER_ID, "hammingAlpha", d.hamming_alpha)?,
            filter_master: params.get_bool(AZIMUTH_FILTER_ID, "filterMaster", d.filter_master)?,
            prf: params.get_opt(AZIMUTH_FILTER_ID, "prf")?,
            azimuth_bandwidth: params.get_opt(AZIMUTH_FILTER_ID, "azimuthBandwidth")?,
        })
    }

    pub fn validate(&self) -> SarResult<()> {
        check_power_of_two(AZIMUTH_FILTER_ID, "fftLength", self.fft_length)?;
        if 2 * self.overlap >= self.fft_length {
            return Err(SarError::config(
                AZIMUTH_FILTER_ID,
                format!("overlap {} leaves no interior in a {} FFT", self.overlap, self.fft_length),
            ));
        }
        if !(0.0..=1.0).contains(&self.hamming_alpha) {
            return Err(SarError::config(
                AZIMUTH_FILTER_ID,
                format!("hammingAlpha must lie in [0, 1], got {}", self.hamming_alpha),
            ));
        }
        Ok(())
    }

    fn block_stride(&self) -> usize {
        self.fft_length - 2 * self.overlap
    }
}

/// Doppler centroid varying linearly with range pixel
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Doppler {
    pub centroid: f64,
    pub slope: f64,
}

impl Doppler {
    pub fn at(&self, x: i64) -> f64 {
        self.centroid + self.slope * x as f64
    }
}

/// Spectral weights of one column: new Hamming window over the common band
/// divided by the processor's original weighting.
pub fn common_band_filter(
    n: usize,
    prf: f64,
    bandwidth: f64,
    alpha: f64,
    own_doppler: f64,
    other_doppler: f64,
) -> Vec<f64> {
    let mean = 0.5 * (own_doppler + other_doppler);
    let new_bandwidth = bandwidth - (own_doppler - other_doppler).abs();
    (0..n)
        .map(|k| {
            let f = bin_frequency(k, n, prf);
            let new = hamming(wrap_frequency(f - mean, prf), new_bandwidth, alpha);
            let old = hamming(wrap_frequency(f - own_doppler, prf), bandwidth, alpha);
            if new == 0.0 || old <= f64::EPSILON {
                0.0
            } else {
                new / old
            }
        })
        .collect()
}

#[derive(Debug, Clone)]
struct FilterTarget {
    container: CplxContainer,
    own: Doppler,
    other: Doppler,
}

/// Azimuth common-band filter for coregistered master/slave stacks.
///
/// Each column is filtered along azimuth in FFT blocks on a grid anchored at
/// row 0; only the block interior is written.
#[derive(Debug)]
pub struct AzimuthFilterOp {
    ctx: OperatorContext,
    params: AzimuthFilterParams,
    prf: f64,
    bandwidth: f64,
    targets: Vec<FilterTarget>,
    fft: Option<Fft1d>,
}

impl AzimuthFilterOp {
    pub fn new() -> Self {
        Self::with_params(AzimuthFilterParams::default())
    }

    pub fn with_params(params: AzimuthFilterParams) -> Self {
        Self {
            ctx: OperatorContext::new(AZIMUTH_FILTER_ID),
            params,
            prf: 0.0,
            bandwidth: 0.0,
            targets: Vec::new(),
            fft: None,
        }
    }

    pub fn from_parameters(params: &ParameterMap) -> SarResult<Self> {
        Ok(Self::with_params(AzimuthFilterParams::from_parameters(params)?))
    }

    pub fn filter_master(&self) -> bool {
        self.params.filter_master
    }

    fn doppler(container: &CplxContainer, product: &Product) -> SarResult<Doppler> {
        let centroid = container.attribute_f64(ATTR_DOPPLER, product).ok_or_else(|| {
            SarError::config(
                AZIMUTH_FILTER_ID,
                format!("no {} for acquisition '{}'", ATTR_DOPPLER, container.name),
            )
        })?;
        Ok(Doppler {
            centroid,
            slope: container.attribute_f64(ATTR_DOPPLER_SLOPE, product).unwrap_or(0.0),
        })
    }

    fn acquisition_value(
        &self,
        override_value: Option<f64>,
        key: &str,
        master: &CplxContainer,
        product: &Product,
    ) -> SarResult<f64> {
        let value = override_value
            .or_else(|| master.attribute_f64(key, product))
            .ok_or_else(|| SarError::config(AZIMUTH_FILTER_ID, format!("missing {} in metadata", key)))?;
        if value <= 0.0 {
            return Err(SarError::config(AZIMUTH_FILTER_ID, format!("{} must be positive", key)));
        }
        Ok(value)
    }

    fn filter_container(&self, target: &FilterTarget, rect: &Rectangle) -> SarResult<RasterBuffer> {
        let provider = self.ctx.provider()?;
        let fft = self
            .fft
            .as_ref()
            .ok_or_else(|| SarError::config(AZIMUTH_FILTER_ID, "operator has not been initialized"))?;
        let n = self.params.fft_length;
        let stride = self.params.block_stride() as i64;
        let overlap = self.params.overlap as i64;

        let filters: Vec<Vec<f64>> = (rect.x..rect.max_x())
            .map(|x| {
                common_band_filter(
                    n,
                    self.prf,
                    self.bandwidth,
                    self.params.hamming_alpha,
                    target.own.at(x),
                    target.other.at(x),
                )
            })
            .collect();

        let mut out = RasterBuffer::new(*rect, DataType::Float64, SampleKind::Complex);
        let mut column = vec![SarComplex::new(0.0, 0.0); n];
        for by in rect.y.div_euclid(stride)..=(rect.max_y() - 1).div_euclid(stride) {
            let block_rect = Rectangle::new(rect.x, by * stride - overlap, rect.width, n);
            let tile = provider.get_complex_tile(&target.container, &block_rect, BorderPolicy::ZeroExtend)?;
            let interior = Rectangle::new(rect.x, by * stride, rect.width, stride as usize);
            let Some(commit) = interior.intersection(rect) else {
                continue;
            };

            for (x, filter) in (rect.x..rect.max_x()).zip(&filters) {
                for (i, v) in column.iter_mut().enumerate() {
                    *v = tile.get_complex(x, block_rect.y + i as i64);
                }
                fft.forward(&mut column);
                column.iter_mut().zip(filter).for_each(|(v, w)| *v *= *w);
                fft.inverse(&mut column);

                for y in commit.y..commit.max_y() {
                    out.set_complex(x, y, column[(y - block_rect.y) as usize]);
                }
            }
        }
        Ok(out)
    }

    fn split_into(
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

impl Default for AzimuthFilterOp {
    fn default() -> Self {
        Self::new()
    }
}

impl Operator for AzimuthFilterOp {
    fn id(&self) -> &str {
        self.ctx.id()
    }

    fn state(&self) -> OperatorState {
        self.ctx.state()
    }

    fn initialize(&mut self, source: Arc<Product>) -> SarResult<Arc<Product>> {
        self.params.validate()?;
        let containers = build_containers(AZIMUTH_FILTER_ID, &source)?;
        if containers.is_empty() {
            return Err(SarError::config(AZIMUTH_FILTER_ID, "source product has no complex bands"));
        }
        let pairs = master_slave_pairs(AZIMUTH_FILTER_ID, &containers)?;

        // PRF and bandwidth are shared by every polarisation of the master pass
        let first_master = &pairs[0].0;
        self.prf = self.acquisition_value(self.params.prf, ATTR_PRF, first_master, &source)?;
        self.bandwidth =
            self.acquisition_value(self.params.azimuth_bandwidth, ATTR_AZIMUTH_BANDWIDTH, first_master, &source)?;

        self.targets.clear();
        let mut masters: Vec<FilterTarget> = Vec::new();
        for (master, slave) in &pairs {
            let master_doppler = Self::doppler(master, &source)?;
            let own = Self::doppler(slave, &source)?;
            let common = self.bandwidth - (own.centroid - master_doppler.centroid).abs();
            if common <= 0.0 {
                return Err(SarError::config(
                    AZIMUTH_FILTER_ID,
                    format!("'{}' shares no Doppler bandwidth with '{}'", slave.name, master.name),
                ));
            }
            if common < 0.1 * self.bandwidth {
                log::warn!(
                    "Azimuth filter: common bandwidth of '{}' is only {:.1} Hz of {:.1} Hz",
                    slave.name,
                    common,
                    self.bandwidth
                );
            }
            self.targets.push(FilterTarget {
                container: slave.clone(),
                own,
                other: master_doppler,
            });
            // a master is filtered against its first slave
            if self.params.filter_master && !masters.iter().any(|t| t.container.name == master.name) {
                masters.push(FilterTarget {
                    container: master.clone(),
                    own: master_doppler,
                    other: own,
                });
            }
        }
        self.targets.extend(masters);

        self.fft = Some(Fft1d::new(self.params.fft_length));

        let mut target = source.derived("AzFilt");
        for band in source.bands() {
            let declared = match band.expression() {
                Some(expr) => Band::virtual_band(band.name(), band.unit(), expr, band.width(), band.height()),
                None => Band::new(band.name(), band.unit(), band.data_type(), band.width(), band.height()),
            };
            target.add_band(declared)?;
        }

        log::info!(
            "Azimuth filter: PRF {:.1} Hz, bandwidth {:.1} Hz, {} acquisition(s) filtered, master {}",
            self.prf,
            self.bandwidth,
            self.targets.len(),
            if self.params.filter_master { "filtered" } else { "copied" }
        );
        Ok(self.ctx.bind(source, target, true))
    }

    fn target_product(&self) -> Option<Arc<Product>> {
        self.ctx.target()
    }

    fn compute_tile(&self, band: &str, rect: &Rectangle) -> SarResult<RasterBuffer> {
        self.ctx.check_target_band(band)?;
        match self
            .targets
            .iter()
            .find(|t| t.container.real_band == band || t.container.imag_band == band)
        {
            Some(target) => {
                let filtered = self.filter_container(target, rect)?;
                let mut tiles = BTreeMap::new();
                self.split_into(&target.container, &filtered, &mut tiles)?;
                tiles.remove(band).ok_or_else(|| {
                    SarError::compute(AZIMUTH_FILTER_ID, format!("band '{}' was not produced", band))
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
        for target in &self.targets {
            let filtered = self.filter_container(target, rect)?;
            self.split_into(&target.container, &filtered, &mut tiles)?;
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
