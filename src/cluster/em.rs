//! Expectation-maximization cluster analysis with multivariate normal
//! components.

use super::linalg::{symmetric_eigen, WeightedMoments};
use super::{Cluster, ClusterSelection, FeatureSpace, CLASS_INDICES, NO_CLASS};
use crate::engine::buffer::{DataType, RasterBuffer, SampleKind};
use crate::engine::operator::{not_initialized, Operator, OperatorContext, OperatorState, TrainingLatch};
use crate::engine::params::ParameterMap;
use crate::engine::product::{Band, Product, Unit};
use crate::engine::provider::{ProductTileProvider, TileProvider};
use crate::engine::rectangle::Rectangle;
use crate::types::{SarError, SarResult};
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::sync::Arc;

pub const EM_ID: &str = "EM-Cluster-Analysis";

/// Added to the covariance diagonal after every update
pub const COVARIANCE_FLOOR: f64 = 1e-4;

/// Orders the trained clusters; the first one gets class index 0
pub type ClusterComparator = fn(&Cluster, &Cluster) -> Ordering;

fn by_descending_prior(a: &Cluster, b: &Cluster) -> Ordering {
    b.prior.total_cmp(&a.prior)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmParams {
    pub cluster_count: usize,
    /// EM runs exactly this many iterations
    pub iteration_count: usize,
    pub random_seed: u64,
    /// Also write the posterior of every cluster as `probability_<k>`
    pub include_probability_bands: bool,
    pub selection: ClusterSelection,
}

impl Default for EmParams {
    fn default() -> Self {
        Self {
            cluster_count: 14,
            iteration_count: 30,
            random_seed: 31415,
            include_probability_bands: false,
            selection: ClusterSelection::default(),
        }
    }
}

impl EmParams {
    pub fn from_parameters(params: &ParameterMap) -> SarResult<Self> {
        let defaults = Self::default();
        Ok(Self {
            cluster_count: params.get_or(EM_ID, "clusterCount", defaults.cluster_count)?,
            iteration_count: params.get_or(EM_ID, "iterationCount", defaults.iteration_count)?,
            random_seed: params.get_or(EM_ID, "randomSeed", defaults.random_seed)?,
            include_probability_bands: params.get_bool(EM_ID, "includeProbabilityBands", false)?,
            selection: ClusterSelection::from_parameters(params),
        })
    }

    pub fn validate(&self) -> SarResult<()> {
        if self.cluster_count < 2 {
            return Err(SarError::config(EM_ID, "clusterCount must be at least 2"));
        }
        if self.iteration_count == 0 {
            return Err(SarError::config(EM_ID, "iterationCount must be positive"));
        }
        Ok(())
    }
}

/// Multivariate normal density evaluated through the eigen decomposition of
/// its covariance.
#[derive(Debug, Clone)]
pub struct Gaussian {
    mean: Array1<f64>,
    eigenvalues: Vec<f64>,
    eigenvectors: Array2<f64>,
    log_norm: f64,
}

impl Gaussian {
    pub fn new(mean: &[f64], covariance: &Array2<f64>) -> SarResult<Self> {
        let eigen = symmetric_eigen(covariance).map_err(|e| e.within(EM_ID))?;
        if let Some(bad) = eigen.values.iter().find(|v| !(v.is_finite() && **v > 0.0)) {
            return Err(SarError::compute(
                EM_ID,
                format!("covariance matrix is not positive definite (eigenvalue {})", bad),
            ));
        }
        let d = mean.len() as f64;
        let log_det: f64 = eigen.values.iter().map(|v| v.ln()).sum();
        Ok(Self {
            mean: Array1::from(mean.to_vec()),
            log_norm: -0.5 * (d * (2.0 * PI).ln() + log_det),
            eigenvalues: eigen.values,
            eigenvectors: eigen.vectors,
        })
    }

    /// Natural log of the density at `x`
    pub fn log_density(&self, x: &[f64]) -> f64 {
        let centred: Array1<f64> = Array1::from_iter(x.iter().zip(self.mean.iter()).map(|(a, m)| a - m));
        let projected = self.eigenvectors.t().dot(&centred);
        let mahalanobis: f64 = projected
            .iter()
            .zip(&self.eigenvalues)
            .map(|(p, l)| p * p / l)
            .sum();
        self.log_norm - 0.5 * mahalanobis
    }
}

/// Posterior probabilities of every component for one sample, written to
/// `out`.
fn posteriors(components: &[Gaussian], log_priors: &[f64], x: &[f64], out: &mut [f64]) {
    let mut max = f64::NEG_INFINITY;
    for ((o, g), lp) in out.iter_mut().zip(components).zip(log_priors) {
        *o = lp + g.log_density(x);
        max = max.max(*o);
    }
    if !max.is_finite() {
        let uniform = 1.0 / out.len() as f64;
        out.iter_mut().for_each(|o| *o = uniform);
        return;
    }
    let mut total = 0.0;
    for o in out.iter_mut() {
        *o = (*o - max).exp();
        total += *o;
    }
    out.iter_mut().for_each(|o| *o /= total);
}

/// Trained mixture
#[derive(Debug, Clone)]
pub struct EmModel {
    pub clusters: Vec<Cluster>,
    components: Vec<Gaussian>,
    log_priors: Vec<f64>,
}

impl EmModel {
    fn new(clusters: Vec<Cluster>) -> SarResult<Self> {
        let components = clusters
            .iter()
            .map(|c| {
                let cov = c
                    .covariance
                    .as_ref()
                    .ok_or_else(|| SarError::compute(EM_ID, "cluster without covariance"))?;
                Gaussian::new(&c.mean, cov)
            })
            .collect::<SarResult<Vec<_>>>()?;
        let log_priors = clusters.iter().map(|c| c.prior.ln()).collect();
        Ok(Self {
            clusters,
            components,
            log_priors,
        })
    }

    pub fn posteriors(&self, x: &[f64], out: &mut [f64]) {
        posteriors(&self.components, &self.log_priors, x, out)
    }
}

/// Index of the largest value; ties keep the lowest index
fn argmax(values: &[f64]) -> usize {
    let mut best = 0;
    for (k, v) in values.iter().enumerate() {
        if *v > values[best] {
            best = k;
        }
    }
    best
}

/// Full EM training over the pixels a scan of `space` visits
pub fn train_em(
    space: &FeatureSpace,
    provider: &dyn TileProvider,
    params: &EmParams,
    population: usize,
    order: ClusterComparator,
) -> SarResult<EmModel> {
    let k = params.cluster_count;
    let d = space.dimension();
    let mut rng = StdRng::seed_from_u64(params.random_seed);
    let mut clusters: Vec<Cluster> = space
        .sample_distinct(EM_ID, provider, k, population, &mut rng)?
        .into_iter()
        .map(|mean| Cluster {
            mean,
            covariance: Some(Array2::eye(d)),
            prior: 1.0 / k as f64,
            member_count: 0,
        })
        .collect();

    for iteration in 0..params.iteration_count {
        let model = EmModel::new(clusters)?;
        let mut moments = vec![WeightedMoments::new(d); k];
        let mut post = vec![0.0; k];
        let mut members = vec![0usize; k];
        let mut n = 0usize;
        space.scan(provider, |x| {
            model.posteriors(x, &mut post);
            for (m, p) in moments.iter_mut().zip(&post) {
                m.push(x, *p);
            }
            members[argmax(&post)] += 1;
            n += 1;
            Ok(())
        })?;

        clusters = model
            .clusters
            .into_iter()
            .zip(moments)
            .zip(members)
            .map(|((old, m), count)| {
                let Some(mut cov) = m.covariance() else {
                    return Cluster {
                        prior: 0.0,
                        member_count: 0,
                        ..old
                    };
                };
                for i in 0..d {
                    cov[[i, i]] += COVARIANCE_FLOOR;
                }
                Cluster {
                    mean: m.mean().to_vec(),
                    covariance: Some(cov),
                    prior: m.weight() / n.max(1) as f64,
                    member_count: count,
                }
            })
            .collect();
        log::debug!("{}: iteration {} done", EM_ID, iteration + 1);
    }

    clusters.sort_by(order);
    EmModel::new(clusters)
}

/// Gaussian mixture classification trained by expectation-maximization
#[derive(Debug)]
pub struct EmClusterOp {
    ctx: OperatorContext,
    params: EmParams,
    order: ClusterComparator,
    space: Option<FeatureSpace>,
    population: usize,
    latch: TrainingLatch<EmModel>,
}

impl EmClusterOp {
    pub fn new() -> Self {
        Self::with_params(EmParams::default())
    }

    pub fn with_params(params: EmParams) -> Self {
        Self {
            ctx: OperatorContext::new(EM_ID),
            params,
            order: by_descending_prior,
            space: None,
            population: 0,
            latch: TrainingLatch::new(),
        }
    }

    pub fn from_parameters(params: &ParameterMap) -> SarResult<Self> {
        Ok(Self::with_params(EmParams::from_parameters(params)?))
    }

    /// Replace the default descending-prior ordering of the clusters
    pub fn with_comparator(mut self, order: ClusterComparator) -> Self {
        self.order = order;
        self
    }

    pub fn model(&self) -> SarResult<Arc<EmModel>> {
        let space = self.space.as_ref().ok_or_else(|| not_initialized(EM_ID))?;
        let provider = self.ctx.provider()?;
        let model = self.latch.get_or_train(EM_ID, self.ctx.state_cell(), || {
            train_em(space, provider, &self.params, self.population, self.order)
        })?;
        if self.ctx.state() == OperatorState::Trained {
            self.ctx.state_cell().set(OperatorState::Ready);
        }
        Ok(model)
    }

    fn probability_band(k: usize) -> String {
        format!("probability_{}", k)
    }
}

impl Default for EmClusterOp {
    fn default() -> Self {
        Self::new()
    }
}

impl Operator for EmClusterOp {
    fn id(&self) -> &str {
        self.ctx.id()
    }

    fn state(&self) -> OperatorState {
        self.ctx.state()
    }

    fn initialize(&mut self, source: Arc<Product>) -> SarResult<Arc<Product>> {
        self.params.validate()?;
        let space = self.params.selection.feature_space(EM_ID, &source)?;
        let population = space.count(&ProductTileProvider::new(source.clone()))?;
        if population < self.params.cluster_count {
            return Err(SarError::config(
                EM_ID,
                format!(
                    "{} valid ROI pixels are not enough for {} clusters",
                    population, self.params.cluster_count
                ),
            ));
        }

        let (w, h) = (source.width(), source.height());
        let mut target = source.derived("EM");
        target.add_band(Band::new(CLASS_INDICES, Unit::Class, DataType::Float32, w, h).with_no_data(NO_CLASS))?;
        if self.params.include_probability_bands {
            for k in 0..self.params.cluster_count {
                target.add_band(Band::new(&Self::probability_band(k), Unit::Probability, DataType::Float32, w, h))?;
            }
        }

        log::info!(
            "{}: {} clusters, {} iterations, {} ROI pixels",
            EM_ID,
            self.params.cluster_count,
            self.params.iteration_count,
            population
        );
        self.space = Some(space);
        self.population = population;
        self.latch.reset();
        Ok(self.ctx.bind(source, target, false))
    }

    fn target_product(&self) -> Option<Arc<Product>> {
        self.ctx.target()
    }

    fn compute_tile(&self, band: &str, rect: &Rectangle) -> SarResult<RasterBuffer> {
        self.ctx.check_target_band(band)?;
        let mut tiles = self.compute_tile_stack(rect)?;
        tiles
            .remove(band)
            .ok_or_else(|| SarError::compute(EM_ID, format!("band '{}' was not produced", band)))
    }

    fn produces_tile_stack(&self) -> bool {
        true
    }

    fn compute_tile_stack(&self, rect: &Rectangle) -> SarResult<BTreeMap<String, RasterBuffer>> {
        let model = self.model()?;
        let space = self.space.as_ref().ok_or_else(|| not_initialized(EM_ID))?;
        let k = self.params.cluster_count;

        let features = space.read(self.ctx.provider()?, rect)?;
        let mut classes = RasterBuffer::new(*rect, DataType::Float32, SampleKind::Real);
        let mut probabilities: Vec<RasterBuffer> = if self.params.include_probability_bands {
            (0..k)
                .map(|_| RasterBuffer::new(*rect, DataType::Float32, SampleKind::Real))
                .collect()
        } else {
            Vec::new()
        };

        let mut sample = vec![0.0; space.dimension()];
        let mut post = vec![0.0; k];
        for y in rect.y..rect.max_y() {
            for x in rect.x..rect.max_x() {
                if !features.pixel(x, y, &mut sample) {
                    classes.set(x, y, NO_CLASS);
                    continue;
                }
                model.posteriors(&sample, &mut post);
                classes.set(x, y, argmax(&post) as f64);
                for (tile, p) in probabilities.iter_mut().zip(&post) {
                    tile.set(x, y, *p);
                }
            }
        }

        let mut tiles = BTreeMap::new();
        tiles.insert(CLASS_INDICES.to_string(), classes);
        for (k, tile) in probabilities.into_iter().enumerate() {
            tiles.insert(Self::probability_band(k), tile);
        }
        Ok(tiles)
    }
}
