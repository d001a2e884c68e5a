//! K-means cluster analysis

use super::{nearest, squared_distance, Cluster, ClusterSelection, FeatureSpace, CLASS_INDICES, NO_CLASS};
use crate::engine::buffer::{DataType, RasterBuffer, SampleKind};
use crate::engine::operator::{Operator, OperatorContext, OperatorState, TrainingLatch};
use crate::engine::params::ParameterMap;
use crate::engine::product::{Band, Product, Unit};
use crate::engine::provider::{ProductTileProvider, TileProvider};
use crate::engine::rectangle::Rectangle;
use crate::types::{SarError, SarResult};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const KMEANS_ID: &str = "KMeans-Cluster-Analysis";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KMeansParams {
    pub cluster_count: usize,
    /// Upper bound; training stops earlier once no mean moves
    pub iteration_count: usize,
    pub random_seed: u64,
    pub selection: ClusterSelection,
}

impl Default for KMeansParams {
    fn default() -> Self {
        Self {
            cluster_count: 14,
            iteration_count: 30,
            random_seed: 31415,
            selection: ClusterSelection::default(),
        }
    }
}

impl KMeansParams {
    pub fn from_parameters(params: &ParameterMap) -> SarResult<Self> {
        let defaults = Self::default();
        Ok(Self {
            cluster_count: params.get_or(KMEANS_ID, "clusterCount", defaults.cluster_count)?,
            iteration_count: params.get_or(KMEANS_ID, "iterationCount", defaults.iteration_count)?,
            random_seed: params.get_or(KMEANS_ID, "randomSeed", defaults.random_seed)?,
            selection: ClusterSelection::from_parameters(params),
        })
    }

    pub fn validate(&self) -> SarResult<()> {
        if self.cluster_count < 2 {
            return Err(SarError::config(KMEANS_ID, "clusterCount must be at least 2"));
        }
        if self.iteration_count == 0 {
            return Err(SarError::config(KMEANS_ID, "iterationCount must be positive"));
        }
        Ok(())
    }
}

/// Sums and counts of one assignment pass
#[derive(Debug, Clone)]
pub struct KMeansAccumulator {
    sums: Vec<Vec<f64>>,
    counts: Vec<usize>,
}

/// Outcome of one assignment pass
#[derive(Debug, Clone, PartialEq)]
pub struct KMeansStep {
    pub means: Vec<Vec<f64>>,
    pub counts: Vec<usize>,
    /// Total squared distance the means moved
    pub movement: f64,
}

impl KMeansAccumulator {
    pub fn new(cluster_count: usize, dimension: usize) -> Self {
        Self {
            sums: vec![vec![0.0; dimension]; cluster_count],
            counts: vec![0; cluster_count],
        }
    }

    pub fn add(&mut self, means: &[Vec<f64>], sample: &[f64]) {
        let k = nearest(means, sample);
        for (s, v) in self.sums[k].iter_mut().zip(sample) {
            *s += v;
        }
        self.counts[k] += 1;
    }

    /// New means; an empty cluster keeps its previous mean.
    pub fn finish(self, means: &[Vec<f64>]) -> KMeansStep {
        let mut movement = 0.0;
        let new_means: Vec<Vec<f64>> = self
            .sums
            .into_iter()
            .zip(&self.counts)
            .zip(means)
            .map(|((sum, &n), old)| {
                let mean = if n > 0 {
                    sum.into_iter().map(|s| s / n as f64).collect()
                } else {
                    old.clone()
                };
                movement += squared_distance(&mean, old);
                mean
            })
            .collect();
        KMeansStep {
            means: new_means,
            counts: self.counts,
            movement,
        }
    }
}

/// Full k-means training over the pixels a scan of `space` visits
pub fn train_kmeans(
    space: &FeatureSpace,
    provider: &dyn TileProvider,
    params: &KMeansParams,
    population: usize,
) -> SarResult<Vec<Cluster>> {
    let mut rng = StdRng::seed_from_u64(params.random_seed);
    let mut means = space.sample_distinct(KMEANS_ID, provider, params.cluster_count, population, &mut rng)?;
    let assign = |means: &[Vec<f64>]| -> SarResult<KMeansStep> {
        let mut acc = KMeansAccumulator::new(means.len(), space.dimension());
        space.scan(provider, |sample| {
            acc.add(means, sample);
            Ok(())
        })?;
        Ok(acc.finish(means))
    };

    let mut counts = vec![0; means.len()];
    let mut converged = false;
    for iteration in 0..params.iteration_count {
        let step = assign(&means)?;
        log::debug!("{}: iteration {} moved {:.6e}", KMEANS_ID, iteration + 1, step.movement);
        converged = step.movement == 0.0;
        means = step.means;
        counts = step.counts;
        if converged {
            log::info!("{}: converged after {} iterations", KMEANS_ID, iteration + 1);
            break;
        }
    }

    // counts of the last step belong to the means before the update
    if !converged {
        log::info!(
            "{}: stopped after {} iterations without converging",
            KMEANS_ID,
            params.iteration_count
        );
        counts = assign(&means)?.counts;
    }

    let total: usize = counts.iter().sum();
    let mut clusters: Vec<Cluster> = means
        .into_iter()
        .zip(counts)
        .map(|(mean, n)| Cluster {
            mean,
            covariance: None,
            prior: if total > 0 { n as f64 / total as f64 } else { 0.0 },
            member_count: n,
        })
        .collect();
    clusters.sort_by(|a, b| b.member_count.cmp(&a.member_count));
    Ok(clusters)
}

/// Classifies every pixel into the nearest of K trained means
#[derive(Debug)]
pub struct KMeansClusterOp {
    ctx: OperatorContext,
    params: KMeansParams,
    space: Option<FeatureSpace>,
    population: usize,
    latch: TrainingLatch<Vec<Cluster>>,
}

impl KMeansClusterOp {
    pub fn new() -> Self {
        Self::with_params(KMeansParams::default())
    }

    pub fn with_params(params: KMeansParams) -> Self {
        Self {
            ctx: OperatorContext::new(KMEANS_ID),
            params,
            space: None,
            population: 0,
            latch: TrainingLatch::new(),
        }
    }

    pub fn from_parameters(params: &ParameterMap) -> SarResult<Self> {
        Ok(Self::with_params(KMeansParams::from_parameters(params)?))
    }

    pub fn params(&self) -> &KMeansParams {
        &self.params
    }

    /// Trained clusters, training first if needed; sorted by member count.
    pub fn clusters(&self) -> SarResult<Arc<Vec<Cluster>>> {
        let space = self
            .space
            .as_ref()
            .ok_or_else(|| crate::engine::operator::not_initialized(KMEANS_ID))?;
        let provider = self.ctx.provider()?;
        let clusters = self.latch.get_or_train(KMEANS_ID, self.ctx.state_cell(), || {
            train_kmeans(space, provider, &self.params, self.population)
        })?;
        if self.ctx.state() == OperatorState::Trained {
            self.ctx.state_cell().set(OperatorState::Ready);
        }
        Ok(clusters)
    }

    pub fn training_passes(&self) -> usize {
        self.latch.training_passes()
    }
}

impl Default for KMeansClusterOp {
    fn default() -> Self {
        Self::new()
    }
}

impl Operator for KMeansClusterOp {
    fn id(&self) -> &str {
        self.ctx.id()
    }

    fn state(&self) -> OperatorState {
        self.ctx.state()
    }

    fn initialize(&mut self, source: Arc<Product>) -> SarResult<Arc<Product>> {
        self.params.validate()?;
        let space = self.params.selection.feature_space(KMEANS_ID, &source)?;
        let population = space.count(&ProductTileProvider::new(source.clone()))?;
        if population < self.params.cluster_count {
            return Err(SarError::config(
                KMEANS_ID,
                format!(
                    "{} valid ROI pixels are not enough for {} clusters",
                    population, self.params.cluster_count
                ),
            ));
        }

        let mut target = source.derived("KMeans");
        target.add_band(
            Band::new(CLASS_INDICES, Unit::Class, DataType::Float32, source.width(), source.height())
                .with_no_data(NO_CLASS),
        )?;

        log::info!(
            "{}: {} clusters over {} band(s), {} ROI pixels",
            KMEANS_ID,
            self.params.cluster_count,
            space.dimension(),
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
        let clusters = self.clusters()?;
        let means: Vec<Vec<f64>> = clusters.iter().map(|c| c.mean.clone()).collect();
        let space = self
            .space
            .as_ref()
            .ok_or_else(|| crate::engine::operator::not_initialized(KMEANS_ID))?;

        let features = space.read(self.ctx.provider()?, rect)?;
        let mut sample = vec![0.0; space.dimension()];
        let mut out = RasterBuffer::new(*rect, DataType::Float32, SampleKind::Real);
        for y in rect.y..rect.max_y() {
            for x in rect.x..rect.max_x() {
                let class = if features.pixel(x, y, &mut sample) {
                    nearest(&means, &sample) as f64
                } else {
                    NO_CLASS
                };
                out.set(x, y, class);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::tests::clustered_product;
    use ndarray::Array2;

    fn params(k: usize) -> KMeansParams {
        KMeansParams {
            cluster_count: k,
            selection: ClusterSelection {
                source_bands: vec!["band_1".into(), "band_2".into()],
                roi_mask_band: Some("roi".into()),
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_accumulator_is_idempotent_at_convergence() {
        let samples = [[0.0, 0.0], [0.2, 0.0], [5.0, 5.0], [5.2, 5.0], [5.0, 5.4]];
        let mut means = vec![vec![0.0, 0.0], vec![5.0, 5.0]];
        for _ in 0..10 {
            let mut acc = KMeansAccumulator::new(2, 2);
            samples.iter().for_each(|s| acc.add(&means, s));
            let step = acc.finish(&means);
            means = step.means;
            if step.movement == 0.0 {
                break;
            }
        }
        let mut acc = KMeansAccumulator::new(2, 2);
        samples.iter().for_each(|s| acc.add(&means, s));
        let step = acc.finish(&means);
        assert_eq!(step.movement, 0.0);
        assert_eq!(step.means, means);
        assert_eq!(step.counts, vec![2, 3]);
    }

    #[test]
    fn test_empty_cluster_keeps_mean() {
        let means = vec![vec![0.0], vec![100.0]];
        let mut acc = KMeansAccumulator::new(2, 1);
        acc.add(&means, &[1.0]);
        let step = acc.finish(&means);
        assert_eq!(step.means, vec![vec![1.0], vec![100.0]]);
        assert_eq!(step.counts, vec![1, 0]);
    }

    #[test]
    fn test_separates_stripes() {
        let _ = env_logger::builder().is_test(true).try_init();

        let product = Arc::new(clustered_product(20, 8, &[(1.0, 10.0), (20.0, 0.0)]));
        let mut op = KMeansClusterOp::with_params(params(2));
        op.initialize(product).unwrap();
        assert_eq!(op.state(), OperatorState::Initialized);

        let tile = op.compute_tile(CLASS_INDICES, &Rectangle::of_size(20, 8)).unwrap();
        assert_eq!(op.state(), OperatorState::Ready);
        assert_eq!(tile.get(4, 0), NO_CLASS);

        let a = tile.get(2, 3);
        let b = tile.get(15, 3);
        assert_ne!(a, b);
        for y in 1..8 {
            for x in 0..10 {
                assert_eq!(tile.get(x, y), a);
                assert_eq!(tile.get(x + 10, y), b);
            }
        }

        let clusters = op.clusters().unwrap();
        assert!(clusters.windows(2).all(|w| w[0].member_count >= w[1].member_count));
        assert_eq!(clusters.iter().map(|c| c.member_count).sum::<usize>(), 20 * 7);
        assert_eq!(op.training_passes(), 1);
    }

    #[test]
    fn test_unconverged_counts_match_final_means() {
        let mut product = Product::new("ramp", 12, 6);
        let data = Array2::from_shape_fn((6, 12), |(r, c)| ((r * 12 + c) as f64).powi(2));
        product
            .add_band(Band::with_data("band_1", Unit::Intensity, DataType::Float64, data))
            .unwrap();
        let product = Arc::new(product);
        let provider = ProductTileProvider::new(product.clone());
        let space = FeatureSpace::new(KMEANS_ID, &product, &["band_1".to_string()], None).unwrap();
        let population = space.count(&provider).unwrap();

        for seed in 0..8 {
            let params = KMeansParams {
                cluster_count: 3,
                iteration_count: 1,
                random_seed: seed,
                ..Default::default()
            };
            let clusters = train_kmeans(&space, &provider, &params, population).unwrap();
            let means: Vec<Vec<f64>> = clusters.iter().map(|c| c.mean.clone()).collect();
            let mut counts = vec![0; means.len()];
            space
                .scan(&provider, |sample| {
                    counts[nearest(&means, sample)] += 1;
                    Ok(())
                })
                .unwrap();
            let members: Vec<usize> = clusters.iter().map(|c| c.member_count).collect();
            assert_eq!(members, counts, "seed {}", seed);
        }
    }

    #[test]
    fn test_too_few_roi_pixels() {
        let product = Arc::new(clustered_product(3, 2, &[(1.0, 1.0)]));
        let mut op = KMeansClusterOp::with_params(params(10));
        let err = op.initialize(product).unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(op.training_passes(), 0);
    }
}
