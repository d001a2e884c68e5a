//! Alias → factory table for building operators from parameter sets.

use crate::cluster::em::{EmClusterOp, EM_ID};
use crate::cluster::kmeans::{KMeansClusterOp, KMEANS_ID};
use crate::cluster::pca::{PcaOp, PCA_ID};
use crate::core::azimuth_filter::{AzimuthFilterOp, AZIMUTH_FILTER_ID};
use crate::core::calibrate::{CalibrationOp, CALIBRATION_ID};
use crate::core::coherence::{CoherenceOp, COHERENCE_ID};
use crate::core::interferogram::{InterferogramOp, INTERFEROGRAM_ID};
use crate::core::phase_filter::{GoldsteinFilterOp, GOLDSTEIN_ID};
use crate::core::thermal_noise::{ThermalNoiseOp, THERMAL_NOISE_ID};
use crate::engine::operator::Operator;
use crate::engine::params::ParameterMap;
use crate::types::{SarError, SarResult};
use std::collections::BTreeMap;

/// Builds a configured, uninitialized operator
pub type OperatorFactory = fn(&ParameterMap) -> SarResult<Box<dyn Operator>>;

#[derive(Debug, Clone, Default)]
pub struct OperatorRegistry {
    factories: BTreeMap<String, OperatorFactory>,
}

impl OperatorRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every operator of this crate
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(COHERENCE_ID, |p| Ok(Box::new(CoherenceOp::from_parameters(p)?)));
        registry.register(INTERFEROGRAM_ID, |p| Ok(Box::new(InterferogramOp::from_parameters(p)?)));
        registry.register(GOLDSTEIN_ID, |p| Ok(Box::new(GoldsteinFilterOp::from_parameters(p)?)));
        registry.register(AZIMUTH_FILTER_ID, |p| Ok(Box::new(AzimuthFilterOp::from_parameters(p)?)));
        registry.register(CALIBRATION_ID, |p| Ok(Box::new(CalibrationOp::from_parameters(p)?)));
        registry.register(THERMAL_NOISE_ID, |p| Ok(Box::new(ThermalNoiseOp::from_parameters(p)?)));
        registry.register(KMEANS_ID, |p| Ok(Box::new(KMeansClusterOp::from_parameters(p)?)));
        registry.register(EM_ID, |p| Ok(Box::new(EmClusterOp::from_parameters(p)?)));
        registry.register(PCA_ID, |p| Ok(Box::new(PcaOp::from_parameters(p)?)));
        registry
    }

    /// Add or replace the factory for `alias`
    pub fn register(&mut self, alias: &str, factory: OperatorFactory) {
        if self.factories.insert(alias.to_string(), factory).is_some() {
            log::debug!("Replaced operator factory '{}'", alias);
        }
    }

    pub fn contains(&self, alias: &str) -> bool {
        self.factories.contains_key(alias)
    }

    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Build the operator registered under `alias`.
    pub fn create(&self, alias: &str, params: &ParameterMap) -> SarResult<Box<dyn Operator>> {
        let factory = self
            .factories
            .get(alias)
            .ok_or_else(|| SarError::config(alias, "no operator registered under this name"))?;
        let operator = factory(params)?;
        log::debug!("Created operator '{}' with {} parameter(s)", alias, params.len());
        Ok(operator)
    }
}
