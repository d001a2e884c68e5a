//! Principal component analysis over the selected bands

use super::linalg::{symmetric_eigen, WeightedMoments};
use super::{ClusterSelection, FeatureSpace};
use crate::engine::buffer::{DataType, RasterBuffer, SampleKind};
use crate::engine::operator::{not_initialized, Operator, OperatorContext, OperatorState, TrainingLatch};
use crate::engine::params::ParameterMap;
use crate::engine::product::{Band, Product, Unit};
use crate::engine::provider::{ProductTileProvider, TileProvider};
use crate::engine::rectangle::Rectangle;
use crate::types::{SarError, SarResult};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const PCA_ID: &str = "Principal-Components";

pub const RESPONSE_BAND: &str = "response";
pub const ERROR_BAND: &str = "error";

/// How many eigenvectors span the retained subspace
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ComponentSelection {
    /// Smallest leading set explaining at least this percentage of the variance
    EigenvalueThreshold(f64),
    Count(usize),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PcaParams {
    pub components: ComponentSelection,
    /// Subtract the per-pixel mean over all bands before the analysis
    pub subtract_mean_image: bool,
    pub selection: ClusterSelection,
}

impl Default for PcaParams {
    fn default() -> Self {
        Self {
            components: ComponentSelection::EigenvalueThreshold(100.0),
            subtract_mean_image: false,
            selection: ClusterSelection::default(),
        }
    }
}

impl PcaParams {
    pub fn from_parameters(params: &ParameterMap) -> SarResult<Self> {
        let components = match params.get_str("selectEigenvaluesBy").map(str::trim) {
            None | Some("Eigenvalue Threshold") => {
                ComponentSelection::EigenvalueThreshold(params.get_or(PCA_ID, "eigenvalueThreshold", 100.0)?)
            }
            Some("Number of Eigenvalues") => ComponentSelection::Count(params.get_or(PCA_ID, "numPCA", 1)?),
            Some(other) => {
                return Err(SarError::config(
                    PCA_ID,
                    format!("unknown eigenvalue selection '{}'", other),
                ))
            }
        };
        Ok(Self {
            components,
            subtract_mean_image: params.get_bool(PCA_ID, "subtractMeanImage", false)?,
            selection: ClusterSelection::from_parameters(params),
        })
    }

    fn validate(&self, band_count: usize) -> SarResult<()> {
        if band_count < 2 {
            return Err(SarError::config(PCA_ID, "more than one source band is required"));
        }
        match self.components {
            ComponentSelection::EigenvalueThreshold(t) if !(t > 0.0 && t <= 100.0) => Err(SarError::config(
                PCA_ID,
                format!("eigenvalue threshold {} is outside (0, 100]", t),
            )),
            ComponentSelection::Count(n) if n == 0 || n > band_count => Err(SarError::config(
                PCA_ID,
                format!("{} components requested from {} bands", n, band_count),
            )),
            _ => Ok(()),
        }
    }

    /// Number of component bands declared on the target
    fn declared_components(&self, band_count: usize) -> usize {
        match self.components {
            ComponentSelection::Count(n) => n,
            ComponentSelection::EigenvalueThreshold(_) => band_count,
        }
    }
}

/// Eigen basis of the band covariance
#[derive(Debug, Clone, PartialEq)]
pub struct PcaModel {
    pub mean: Vec<f64>,
    /// Descending
    pub eigenvalues: Vec<f64>,
    /// Eigenvectors as columns, matching `eigenvalues`
    pub basis: Array2<f64>,
    /// Leading components spanning the retained subspace
    pub retained: usize,
    subtract_mean_image: bool,
}

/// Per-pixel result of a projection
#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    /// Coefficients of the retained components
    pub coefficients: Vec<f64>,
    /// Share of the centred sample's energy inside the retained subspace
    pub response: f64,
    /// Norm of the residual outside the retained subspace
    pub error: f64,
}

impl PcaModel {
    fn centre(&self, sample: &mut [f64]) {
        if self.subtract_mean_image {
            subtract_mean_image(sample);
        }
        for (v, m) in sample.iter_mut().zip(&self.mean) {
            *v -= m;
        }
    }

    pub fn project(&self, sample: &[f64]) -> Projection {
        let mut centred = sample.to_vec();
        self.centre(&mut centred);
        let energy: f64 = centred.iter().map(|v| v * v).sum();
        let coefficients: Vec<f64> = (0..self.retained)
            .map(|i| {
                self.basis
                    .column(i)
                    .iter()
                    .zip(&centred)
                    .map(|(e, v)| e * v)
                    .sum()
            })
            .collect();
        let inside: f64 = coefficients.iter().map(|c| c * c).sum();
        Projection {
            coefficients,
            response: if energy > 0.0 { (inside / energy).min(1.0) } else { 1.0 },
            error: (energy - inside).max(0.0).sqrt(),
        }
    }
}

fn subtract_mean_image(sample: &mut [f64]) {
    let mean = sample.iter().sum::<f64>() / sample.len() as f64;
    sample.iter_mut().for_each(|v| *v -= mean);
}

/// Accumulate the band statistics over a full scan and decompose them
pub fn train_pca(space: &FeatureSpace, provider: &dyn TileProvider, params: &PcaParams) -> SarResult<PcaModel> {
    let d = space.dimension();
    let mut moments = WeightedMoments::new(d);
    let mut buffer = vec![0.0; d];
    space.scan(provider, |sample| {
        buffer.copy_from_slice(sample);
        if params.subtract_mean_image {
            subtract_mean_image(&mut buffer);
        }
        moments.push(&buffer, 1.0);
        Ok(())
    })?;

    let covariance = moments
        .covariance()
        .ok_or_else(|| SarError::compute(PCA_ID, "no valid pixels to analyse"))?;
    let eigen = symmetric_eigen(&covariance).map_err(|e| e.within(PCA_ID))?;
    // tiny negative values are round-off of a PSD matrix
    let eigenvalues: Vec<f64> = eigen.values.iter().map(|v| v.max(0.0)).collect();
    let total: f64 = eigenvalues.iter().sum();

    let retained = match params.components {
        ComponentSelection::Count(n) => n,
        ComponentSelection::EigenvalueThreshold(threshold) => {
            let mut running = 0.0;
            let mut retained = d;
            for (i, v) in eigenvalues.iter().enumerate() {
                running += v;
                if total <= 0.0 || running / total * 100.0 >= threshold {
                    retained = i + 1;
                    break;
                }
            }
            retained
        }
    };
    log::info!(
        "{}: eigenvalues {:?}, retaining {} of {} components",
        PCA_ID,
        eigenvalues,
        retained,
        d
    );

    Ok(PcaModel {
        mean: moments.mean().to_vec(),
        eigenvalues,
        basis: eigen.vectors,
        retained,
        subtract_mean_image: params.subtract_mean_image,
    })
}

/// Projects every pixel onto the principal components of the source bands
#[derive(Debug)]
pub struct PcaOp {
    ctx: OperatorContext,
    params: PcaParams,
    space: Option<FeatureSpace>,
    components: usize,
    latch: TrainingLatch<PcaModel>,
}

impl PcaOp {
    pub fn new() -> Self {
        Self::with_params(PcaParams::default())
    }

    pub fn with_params(params: PcaParams) -> Self {
        Self {
            ctx: OperatorContext::new(PCA_ID),
            params,
            space: None,
            components: 0,
            latch: TrainingLatch::new(),
        }
    }

    pub fn from_parameters(params: &ParameterMap) -> SarResult<Self> {
        Ok(Self::with_params(PcaParams::from_parameters(params)?))
    }

    pub fn model(&self) -> SarResult<Arc<PcaModel>> {
        let space = self.space.as_ref().ok_or_else(|| not_initialized(PCA_ID))?;
        let provider = self.ctx.provider()?;
        let model = self
            .latch
            .get_or_train(PCA_ID, self.ctx.state_cell(), || train_pca(space, provider, &self.params))?;
        if self.ctx.state() == OperatorState::Trained {
            self.ctx.state_cell().set(OperatorState::Ready);
        }
        Ok(model)
    }

    fn component_band(i: usize) -> String {
        format!("component_{}", i)
    }
}

impl Default for PcaOp {
    fn default() -> Self {
        Self::new()
    }
}

impl Operator for PcaOp {
    fn id(&self) -> &str {
        self.ctx.id()
    }

    fn state(&self) -> OperatorState {
        self.ctx.state()
    }

    fn initialize(&mut self, source: Arc<Product>) -> SarResult<Arc<Product>> {
        let space = self.params.selection.feature_space(PCA_ID, &source)?;
        self.params.validate(space.dimension())?;
        let population = space.count(&ProductTileProvider::new(source.clone()))?;
        if population < 2 {
            return Err(SarError::config(
                PCA_ID,
                format!("{} valid pixels are not enough for a covariance estimate", population),
            ));
        }

        let (w, h) = (source.width(), source.height());
        let components = self.params.declared_components(space.dimension());
        let mut target = source.derived("PCA");
        for i in 0..components {
            target.add_band(Band::new(&Self::component_band(i), Unit::Dimensionless, DataType::Float32, w, h))?;
        }
        target.add_band(Band::new(RESPONSE_BAND, Unit::Dimensionless, DataType::Float32, w, h))?;
        target.add_band(Band::new(ERROR_BAND, Unit::Dimensionless, DataType::Float32, w, h))?;

        self.space = Some(space);
        self.components = components;
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
            .ok_or_else(|| SarError::compute(PCA_ID, format!("band '{}' was not produced", band)))
    }

    fn produces_tile_stack(&self) -> bool {
        true
    }

    fn compute_tile_stack(&self, rect: &Rectangle) -> SarResult<BTreeMap<String, RasterBuffer>> {
        let model = self.model()?;
        let space = self.space.as_ref().ok_or_else(|| not_initialized(PCA_ID))?;
        let features = space.read(self.ctx.provider()?, rect)?;

        let new_tile = || RasterBuffer::new(*rect, DataType::Float32, SampleKind::Real);
        let mut components: Vec<RasterBuffer> = (0..self.components).map(|_| new_tile()).collect();
        let mut response = new_tile();
        let mut error = new_tile();

        let mut sample = vec![0.0; space.dimension()];
        for y in rect.y..rect.max_y() {
            for x in rect.x..rect.max_x() {
                if !features.pixel(x, y, &mut sample) {
                    continue;
                }
                let p = model.project(&sample);
                // components past the retained subspace stay zero
                for (tile, c) in components.iter_mut().zip(&p.coefficients) {
                    tile.set(x, y, *c);
                }
                response.set(x, y, p.response);
                error.set(x, y, p.error);
            }
        }

        let mut tiles: BTreeMap<String, RasterBuffer> = components
            .into_iter()
            .enumerate()
            .map(|(i, t)| (Self::component_band(i), t))
            .collect();
        tiles.insert(RESPONSE_BAND.to_string(), response);
        tiles.insert(ERROR_BAND.to_string(), error);
        Ok(tiles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    /// band_2 = 2 * band_1 + 1, band_3 = band_1 plus a small checkerboard
    fn correlated_product() -> Arc<Product> {
        let (w, h) = (8, 6);
        let base = Array2::from_shape_fn((h, w), |(r, c)| (r * w + c) as f64 * 0.5);
        let mut product = Product::new("pca", w, h);
        product
            .add_band(Band::with_data("band_1", Unit::Intensity, DataType::Float64, base.clone()))
            .unwrap();
        product
            .add_band(Band::with_data(
                "band_2",
                Unit::Intensity,
                DataType::Float64,
                base.mapv(|v| 2.0 * v + 1.0),
            ))
            .unwrap();
        let checker = Array2::from_shape_fn((h, w), |(r, c)| if (r + c) % 2 == 0 { 0.1 } else { -0.1 });
        product
            .add_band(Band::with_data("band_3", Unit::Intensity, DataType::Float64, &base + &checker))
            .unwrap();
        Arc::new(product)
    }

    #[test]
    fn test_full_threshold_keeps_energy() {
        let _ = env_logger::builder().is_test(true).try_init();

        let mut op = PcaOp::new();
        let target = op.initialize(correlated_product()).unwrap();
        assert_eq!(
            target.band_names(),
            vec!["component_0", "component_1", "component_2", "response", "error"]
        );

        let tiles = op.compute_tile_stack(&Rectangle::of_size(8, 6)).unwrap();
        let model = op.model().unwrap();
        assert!(model.eigenvalues.windows(2).all(|w| w[0] >= w[1]));
        assert!(model.retained <= 3);
        for y in 0..6 {
            for x in 0..8 {
                assert_abs_diff_eq!(tiles[ERROR_BAND].get(x, y), 0.0, epsilon = 1e-3);
            }
        }
        assert_eq!(op.state(), OperatorState::Ready);
    }

    #[test]
    fn test_single_component_captures_line() {
        let params = PcaParams {
            components: ComponentSelection::Count(1),
            selection: ClusterSelection {
                source_bands: vec!["band_1".into(), "band_2".into()],
                roi_mask_band: None,
            },
            ..Default::default()
        };
        let mut op = PcaOp::with_params(params);
        op.initialize(correlated_product()).unwrap();
        let model = op.model().unwrap();

        // the data lies on a line of direction (1, 2)
        let e = model.basis.column(0);
        assert_abs_diff_eq!((e[1] / e[0]), 2.0, epsilon = 1e-9);
        assert_abs_diff_eq!(model.eigenvalues[1], 0.0, epsilon = 1e-9);

        let response = op.compute_tile(RESPONSE_BAND, &Rectangle::new(2, 2, 3, 3)).unwrap();
        assert_abs_diff_eq!(response.get(3, 3), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_parameter_validation() {
        let params = PcaParams {
            components: ComponentSelection::Count(4),
            ..Default::default()
        };
        assert!(PcaOp::with_params(params)
            .initialize(correlated_product())
            .unwrap_err()
            .is_configuration());

        let map = ParameterMap::new()
            .with("selectEigenvaluesBy", "Number of Eigenvalues")
            .with("numPCA", 2)
            .with("subtractMeanImage", true);
        let parsed = PcaParams::from_parameters(&map).unwrap();
        assert_eq!(parsed.components, ComponentSelection::Count(2));
        assert!(parsed.subtract_mean_image);
    }
}
