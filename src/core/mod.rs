//! SAR/InSAR processing operators and their numeric kernels

pub mod lut;
pub mod spectral;
pub mod calibrate;
pub mod thermal_noise;
pub mod coherence;
pub mod interferogram;
pub mod phase_filter;
pub mod azimuth_filter;

// Re-export main types
pub use lut::{LutGrid, LutVector};
pub use calibrate::{CalibrationInfo, CalibrationOp, CalibrationParams, CalibrationType, CalibrationVector};
pub use thermal_noise::{NoiseVector, ThermalNoiseInfo, ThermalNoiseOp, ThermalNoiseParams};
pub use coherence::{CoherenceOp, CoherenceParams};
pub use interferogram::{conjugate_multiply, InterferogramOp, InterferogramParams};
pub use phase_filter::{GoldsteinFilterOp, GoldsteinParams};
pub use azimuth_filter::{AzimuthFilterOp, AzimuthFilterParams, Doppler};
