use num_complex::Complex;

/// Complex-valued SAR sample (I + jQ)
pub type SarComplex = Complex<f64>;

/// Error types for SAR processing
#[derive(Debug, thiserror::Error)]
pub enum SarError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Bad or missing bands, mismatched raster sizes, invalid parameters.
    #[error("[{operator}] configuration error: {message}")]
    Configuration { operator: String, message: String },

    /// Tile, pixel, band or component index outside the valid bounds.
    #[error("Index out of range: {0}")]
    OutOfRange(String),

    /// Numerical failure while computing a tile or training a model.
    #[error("[{operator}] compute error: {message}")]
    Compute { operator: String, message: String },

    #[error("Metadata error: {0}")]
    Metadata(String),

    #[error("XML parsing error: {0}")]
    XmlParsing(String),

    #[error("Processing cancelled")]
    Cancelled,
}

impl SarError {
    pub fn config(operator: &str, message: impl Into<String>) -> Self {
        SarError::Configuration {
            operator: operator.to_string(),
            message: message.into(),
        }
    }

    pub fn compute(operator: &str, message: impl Into<String>) -> Self {
        SarError::Compute {
            operator: operator.to_string(),
            message: message.into(),
        }
    }

    /// Re-tag a lower level error with the operator that was running when it
    /// happened. Configuration and compute errors keep their original operator.
    pub fn within(self, operator: &str) -> Self {
        match self {
            SarError::XmlParsing(message) | SarError::Metadata(message) => {
                SarError::compute(operator, message)
            }
            other => other,
        }
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, SarError::Configuration { .. })
    }
}

/// Result type for SAR operations
pub type SarResult<T> = Result<T, SarError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_carries_operator_id() {
        let err = SarError::config("Coherence", "window larger than image");
        assert!(err.is_configuration());
        assert_eq!(
            err.to_string(),
            "[Coherence] configuration error: window larger than image"
        );

        let err = SarError::compute("EM-Cluster-Analysis", "singular covariance");
        assert!(err.to_string().contains("EM-Cluster-Analysis"));
    }
}
