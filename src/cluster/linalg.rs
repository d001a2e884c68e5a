//! Small dense linear algebra for the statistics operators: symmetric
//! eigendecomposition and streaming weighted moments.

use crate::types::{SarError, SarResult};
use ndarray::{Array1, Array2};

const JACOBI_EPS: f64 = 1e-12;

/// Eigen decomposition of a symmetric matrix, eigenvalues in descending
/// order, eigenvectors stored as the matching columns of `vectors`.
#[derive(Debug, Clone, PartialEq)]
pub struct Eigen {
    pub values: Vec<f64>,
    pub vectors: Array2<f64>,
}

/// Jacobi eigenvalue algorithm for symmetric matrices
pub fn symmetric_eigen(matrix: &Array2<f64>) -> SarResult<Eigen> {
    let n = matrix.nrows();
    if n == 0 || matrix.ncols() != n {
        return Err(SarError::OutOfRange(format!(
            "Eigen decomposition needs a square matrix, got {:?}",
            matrix.dim()
        )));
    }
    if matrix.iter().any(|v| !v.is_finite()) {
        return Err(SarError::Metadata("Matrix contains non-finite values".to_string()));
    }

    let mut a = matrix.clone();
    let mut v = Array2::<f64>::eye(n);
    let scale = a.iter().fold(0.0_f64, |m, x| m.max(x.abs())).max(f64::MIN_POSITIVE);
    let max_iter = 100 * n * n;

    for _ in 0..max_iter {
        let mut max_val = 0.0;
        let (mut p, mut q) = (0, 0);
        for i in 0..n {
            for j in (i + 1)..n {
                if a[[i, j]].abs() > max_val {
                    max_val = a[[i, j]].abs();
                    p = i;
                    q = j;
                }
            }
        }
        if max_val <= JACOBI_EPS * scale {
            break;
        }

        let theta = if (a[[p, p]] - a[[q, q]]).abs() < JACOBI_EPS * scale {
            std::f64::consts::FRAC_PI_4 * a[[p, q]].signum()
        } else {
            0.5 * (2.0 * a[[p, q]] / (a[[p, p]] - a[[q, q]])).atan()
        };
        let (s, c) = theta.sin_cos();

        for i in 0..n {
            if i != p && i != q {
                let aip = a[[i, p]];
                let aiq = a[[i, q]];
                a[[i, p]] = c * aip + s * aiq;
                a[[p, i]] = a[[i, p]];
                a[[i, q]] = -s * aip + c * aiq;
                a[[q, i]] = a[[i, q]];
            }
        }
        let (app, aqq, apq) = (a[[p, p]], a[[q, q]], a[[p, q]]);
        a[[p, p]] = c * c * app + 2.0 * s * c * apq + s * s * aqq;
        a[[q, q]] = s * s * app - 2.0 * s * c * apq + c * c * aqq;
        a[[p, q]] = 0.0;
        a[[q, p]] = 0.0;

        for i in 0..n {
            let vip = v[[i, p]];
            let viq = v[[i, q]];
            v[[i, p]] = c * vip + s * viq;
            v[[i, q]] = -s * vip + c * viq;
        }
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&i, &j| a[[j, j]].total_cmp(&a[[i, i]]));

    let values = order.iter().map(|&i| a[[i, i]]).collect();
    let mut vectors = Array2::zeros((n, n));
    for (col, &i) in order.iter().enumerate() {
        vectors.column_mut(col).assign(&v.column(i));
    }
    Ok(Eigen { values, vectors })
}

/// Weighted running mean and co-moment (West's incremental update).
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedMoments {
    weight: f64,
    mean: Array1<f64>,
    comoment: Array2<f64>,
}

impl WeightedMoments {
    pub fn new(dimension: usize) -> Self {
        Self {
            weight: 0.0,
            mean: Array1::zeros(dimension),
            comoment: Array2::zeros((dimension, dimension)),
        }
    }

    pub fn push(&mut self, sample: &[f64], weight: f64) {
        if weight <= 0.0 {
            return;
        }
        let total = self.weight + weight;
        let delta: Vec<f64> = sample.iter().zip(self.mean.iter()).map(|(x, m)| x - m).collect();
        let r = weight / total;
        for (m, d) in self.mean.iter_mut().zip(&delta) {
            *m += d * r;
        }
        let n = delta.len();
        for i in 0..n {
            for j in 0..n {
                self.comoment[[i, j]] += weight * delta[i] * (sample[j] - self.mean[j]);
            }
        }
        self.weight = total;
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn mean(&self) -> &Array1<f64> {
        &self.mean
    }

    /// Weighted population covariance, `None` before any sample
    pub fn covariance(&self) -> Option<Array2<f64>> {
        (self.weight > 0.0).then(|| &self.comoment / self.weight)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_eigen_reconstructs_matrix() {
        let m = array![[4.0, 1.0, 0.5], [1.0, 3.0, 0.2], [0.5, 0.2, 1.0]];
        let eigen = symmetric_eigen(&m).unwrap();
        assert!(eigen.values.windows(2).all(|w| w[0] >= w[1]));

        let d = Array2::from_diag(&Array1::from(eigen.values.clone()));
        let rebuilt = eigen.vectors.dot(&d).dot(&eigen.vectors.t());
        for (a, b) in rebuilt.iter().zip(m.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_eigen_of_diagonal() {
        let eigen = symmetric_eigen(&array![[1.0, 0.0], [0.0, 5.0]]).unwrap();
        assert_eq!(eigen.values, vec![5.0, 1.0]);
        assert_abs_diff_eq!(eigen.vectors[[1, 0]].abs(), 1.0);
        assert!(symmetric_eigen(&Array2::zeros((2, 3))).is_err());
    }

    #[test]
    fn test_weighted_moments_match_batch() {
        let samples = [[1.0, 2.0], [3.0, 1.0], [2.0, 5.0], [0.0, 0.0]];
        let weights = [1.0, 0.5, 2.0, 0.25];
        let mut moments = WeightedMoments::new(2);
        for (s, w) in samples.iter().zip(weights) {
            moments.push(s, w);
        }

        let total: f64 = weights.iter().sum();
        let mean: Vec<f64> = (0..2)
            .map(|d| samples.iter().zip(weights).map(|(s, w)| s[d] * w).sum::<f64>() / total)
            .collect();
        let cov01 = samples
            .iter()
            .zip(weights)
            .map(|(s, w)| w * (s[0] - mean[0]) * (s[1] - mean[1]))
            .sum::<f64>()
            / total;

        assert_abs_diff_eq!(moments.mean()[0], mean[0], epsilon = 1e-12);
        assert_abs_diff_eq!(moments.mean()[1], mean[1], epsilon = 1e-12);
        let cov = moments.covariance().unwrap();
        assert_abs_diff_eq!(cov[[0, 1]], cov01, epsilon = 1e-12);
        assert_abs_diff_eq!(cov[[1, 0]], cov01, epsilon = 1e-12);
    }
}
