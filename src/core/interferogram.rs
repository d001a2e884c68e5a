use crate::core::coherence::{complex_coherence, CoherenceParams};
use crate::engine::buffer::{DataType, RasterBuffer, SampleKind};
use crate::engine::complex::{build_containers, master_slave_pairs, CplxContainer};
use crate::engine::operator::{Operator, OperatorContext, OperatorState};
use crate::engine::params::ParameterMap;
use crate::engine::product::{Band, Product, Unit};
use crate::engine::provider::{BorderPolicy, TileProvider};
use crate::engine::rectangle::Rectangle;
use crate::types::{SarComplex, SarError, SarResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const INTERFEROGRAM_ID: &str = "Interferogram";

/// `master * conj(slave)`
///
/// re = Re(m)Re(s) + Im(m)Im(s), im = Im(m)Re(s) - Re(m)Im(s)
#[inline]
pub fn conjugate_multiply(master: SarComplex, slave: SarComplex) -> SarComplex {
    SarComplex::new(
        master.re * slave.re + master.im * slave.im,
        master.im * slave.re - master.re * slave.im,
    )
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterferogramParams {
    /// Also estimate `coh_<slave>` in the same pass
    pub include_coherence: bool,
    pub coherence: CoherenceParams,
}

impl Default for InterferogramParams {
    fn default() -> Self {
        Self {
            include_coherence: false,
            coherence: CoherenceParams::default(),
        }
    }
}

impl InterferogramParams {
    pub fn from_parameters(params: &ParameterMap) -> SarResult<Self> {
        Ok(Self {
            include_coherence: params.get_bool(INTERFEROGRAM_ID, "includeCoherence", false)?,
            coherence: CoherenceParams {
                win_range: params.get_or(INTERFEROGRAM_ID, "cohWinRg", CoherenceParams::default().win_range)?,
                win_azimuth: params.get_or(INTERFEROGRAM_ID, "cohWinAz", CoherenceParams::default().win_azimuth)?,
            },
        })
    }
}

#[derive(Debug, Clone)]
struct IfgPair {
    master: CplxContainer,
    slave: CplxContainer,
    i_band: String,
    q_band: String,
    coh_band: Option<String>,
}

/// Complex interferogram of every slave of a stack against the master of its
/// polarisation and swath
#[derive(Debug)]
pub struct InterferogramOp {
    ctx: OperatorContext,
    params: InterferogramParams,
    pairs: Vec<IfgPair>,
}

impl InterferogramOp {
    pub fn new() -> Self {
        Self::with_params(InterferogramParams::default())
    }

    pub fn with_params(params: InterferogramParams) -> Self {
        Self {
            ctx: OperatorContext::new(INTERFEROGRAM_ID),
            params,
            pairs: Vec::new(),
        }
    }

    pub fn from_parameters(params: &ParameterMap) -> SarResult<Self> {
        Ok(Self::with_params(InterferogramParams::from_parameters(params)?))
    }

    fn compute_pair(
        &self,
        pair: &IfgPair,
        rect: &Rectangle,
        out: &mut BTreeMap<String, RasterBuffer>,
    ) -> SarResult<()> {
        let provider = self.ctx.provider()?;
        let master = &pair.master;

        let m = provider.get_complex_tile(master, rect, BorderPolicy::ZeroExtend)?;
        let s = provider.get_complex_tile(&pair.slave, rect, BorderPolicy::ZeroExtend)?;

        let mut i_tile = RasterBuffer::new(*rect, DataType::Float32, SampleKind::Real);
        let mut q_tile = RasterBuffer::new(*rect, DataType::Float32, SampleKind::Real);
        for y in rect.y..rect.max_y() {
            for x in rect.x..rect.max_x() {
                let ifg = conjugate_multiply(m.get_complex(x, y), s.get_complex(x, y));
                i_tile.set(x, y, ifg.re);
                q_tile.set(x, y, ifg.im);
            }
        }
        out.insert(pair.i_band.clone(), i_tile);
        out.insert(pair.q_band.clone(), q_tile);

        if let Some(coh_band) = &pair.coh_band {
            let coh_params = &self.params.coherence;
            let src_rect = rect.expand(coh_params.halo());
            let m = provider.get_complex_tile(master, &src_rect, BorderPolicy::ZeroExtend)?;
            let s = provider.get_complex_tile(&pair.slave, &src_rect, BorderPolicy::ZeroExtend)?;
            let values = complex_coherence(&m, &s, rect, coh_params);
            let mut coh_tile = RasterBuffer::new(*rect, DataType::Float32, SampleKind::Real);
            for ((r, c), v) in values.indexed_iter() {
                coh_tile.set(rect.x + c as i64, rect.y + r as i64, *v);
            }
            out.insert(coh_band.clone(), coh_tile);
        }
        Ok(())
    }
}

impl Default for InterferogramOp {
    fn default() -> Self {
        Self::new()
    }
}

impl Operator for InterferogramOp {
    fn id(&self) -> &str {
        self.ctx.id()
    }

    fn state(&self) -> OperatorState {
        self.ctx.state()
    }

    fn initialize(&mut self, source: Arc<Product>) -> SarResult<Arc<Product>> {
        let containers = build_containers(INTERFEROGRAM_ID, &source)?;
        if containers.is_empty() {
            return Err(SarError::config(INTERFEROGRAM_ID, "source product has no complex bands"));
        }
        if self.params.include_coherence {
            self.params
                .coherence
                .validate(INTERFEROGRAM_ID, source.width(), source.height())?;
        }

        let (w, h) = (source.width(), source.height());
        let mut target = source.derived("Ifg");
        self.pairs.clear();
        for (master, slave) in master_slave_pairs(INTERFEROGRAM_ID, &containers)? {
            let suffix = slave.name.clone();
            let pair = IfgPair {
                i_band: format!("i_ifg_{}", suffix),
                q_band: format!("q_ifg_{}", suffix),
                coh_band: self
                    .params
                    .include_coherence
                    .then(|| format!("coh_{}", suffix)),
                master,
                slave,
            };
            target.add_band(Band::new(&pair.i_band, Unit::Real, DataType::Float32, w, h))?;
            target.add_band(Band::new(&pair.q_band, Unit::Imaginary, DataType::Float32, w, h))?;
            target.add_virtual_band(
                &format!("Intensity_ifg_{}", suffix),
                Unit::Intensity,
                &format!("{i} * {i} + {q} * {q}", i = pair.i_band, q = pair.q_band),
            )?;
            target.add_virtual_band(
                &format!("Phase_ifg_{}", suffix),
                Unit::Phase,
                &format!("atan2({}, {})", pair.q_band, pair.i_band),
            )?;
            if let Some(coh_band) = &pair.coh_band {
                target.add_band(Band::new(coh_band, Unit::Coherence, DataType::Float32, w, h))?;
            }
            self.pairs.push(pair);
        }

        log::info!(
            "Interferogram: {} master(s) against {} slave(s)",
            containers.iter().filter(|c| c.is_master).count(),
            self.pairs.len()
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
            .find(|p| p.i_band == band || p.q_band == band || p.coh_band.as_deref() == Some(band))
            .ok_or_else(|| SarError::OutOfRange(format!("No interferogram pair for band '{}'", band)))?;
        let mut tiles = BTreeMap::new();
        self.compute_pair(pair, rect, &mut tiles)?;
        tiles
            .remove(band)
            .ok_or_else(|| SarError::compute(INTERFEROGRAM_ID, format!("band '{}' was not produced", band)))
    }

    fn produces_tile_stack(&self) -> bool {
        true
    }

    fn compute_tile_stack(&self, rect: &Rectangle) -> SarResult<BTreeMap<String, RasterBuffer>> {
        let mut tiles = BTreeMap::new();
        for pair in &self.pairs {
            self.compute_pair(pair, rect, &mut tiles)?;
        }
        Ok(tiles)
    }
}
