//! FFT plans and spectral windows shared by the frequency-domain filters.

use crate::types::{SarComplex, SarError, SarResult};
use ndarray::Array2;
use rustfft::{Fft, FftPlanner};
use std::f64::consts::PI;
use std::sync::Arc;

pub fn check_power_of_two(operator: &str, name: &str, value: usize) -> SarResult<()> {
    if value < 2 || !value.is_power_of_two() {
        return Err(SarError::config(
            operator,
            format!("{} must be a power of two >= 2, got {}", name, value),
        ));
    }
    Ok(())
}

/// Forward and normalised inverse FFT of one length
#[derive(Clone)]
pub struct Fft1d {
    size: usize,
    forward: Arc<dyn Fft<f64>>,
    inverse: Arc<dyn Fft<f64>>,
}

impl std::fmt::Debug for Fft1d {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fft1d").field("size", &self.size).finish()
    }
}

impl Fft1d {
    pub fn new(size: usize) -> Self {
        let mut planner = FftPlanner::new();
        Self {
            size,
            forward: planner.plan_fft_forward(size),
            inverse: planner.plan_fft_inverse(size),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn forward(&self, buffer: &mut [SarComplex]) {
        debug_assert_eq!(buffer.len(), self.size);
        self.forward.process(buffer);
    }

    /// Inverse transform scaled by 1/N
    pub fn inverse(&self, buffer: &mut [SarComplex]) {
        debug_assert_eq!(buffer.len(), self.size);
        self.inverse.process(buffer);
        let scale = 1.0 / self.size as f64;
        buffer.iter_mut().for_each(|v| *v *= scale);
    }
}

/// Row/column separable 2D FFT on (azimuth x range) blocks
#[derive(Debug, Clone)]
pub struct Fft2d {
    rows: Fft1d,
    cols: Fft1d,
}

impl Fft2d {
    /// Plan for blocks of `height` x `width`
    pub fn new(height: usize, width: usize) -> Self {
        Self {
            rows: Fft1d::new(width),
            cols: Fft1d::new(height),
        }
    }

    pub fn forward(&self, block: &mut Array2<SarComplex>) {
        self.apply(block, false);
    }

    /// Inverse transform scaled by 1/(height * width)
    pub fn inverse(&self, block: &mut Array2<SarComplex>) {
        self.apply(block, true);
    }

    fn apply(&self, block: &mut Array2<SarComplex>, inverse: bool) {
        let mut line = Vec::with_capacity(block.nrows().max(block.ncols()));
        for mut row in block.rows_mut() {
            line.clear();
            line.extend(row.iter().copied());
            if inverse {
                self.rows.inverse(&mut line);
            } else {
                self.rows.forward(&mut line);
            }
            row.iter_mut().zip(&line).for_each(|(dst, src)| *dst = *src);
        }
        for mut col in block.columns_mut() {
            line.clear();
            line.extend(col.iter().copied());
            if inverse {
                self.cols.inverse(&mut line);
            } else {
                self.cols.forward(&mut line);
            }
            col.iter_mut().zip(&line).for_each(|(dst, src)| *dst = *src);
        }
    }
}

/// Generalised Hamming weight `alpha + (1 - alpha) cos(2 pi f / bw)`,
/// zero outside `|f| <= bw / 2`.
pub fn hamming(frequency: f64, bandwidth: f64, alpha: f64) -> f64 {
    if bandwidth <= 0.0 || frequency.abs() > bandwidth / 2.0 {
        return 0.0;
    }
    alpha + (1.0 - alpha) * (2.0 * PI * frequency / bandwidth).cos()
}

/// Frequency of FFT bin `k` for `n` samples at sampling rate `fs`, in [-fs/2, fs/2)
pub fn bin_frequency(k: usize, n: usize, fs: f64) -> f64 {
    let k = if k < n / 2 { k as f64 } else { k as f64 - n as f64 };
    k * fs / n as f64
}

/// Wrap a frequency difference into [-fs/2, fs/2)
pub fn wrap_frequency(f: f64, fs: f64) -> f64 {
    (f + fs / 2.0).rem_euclid(fs) - fs / 2.0
}

/// Circular convolution of every row and then every column with an odd,
/// centred kernel.
pub fn smooth_circular(values: &Array2<f64>, kernel: &[f64]) -> Array2<f64> {
    let half = (kernel.len() / 2) as isize;
    let (rows, cols) = values.dim();

    let mut pass = Array2::<f64>::zeros((rows, cols));
    for r in 0..rows {
        for c in 0..cols {
            pass[[r, c]] = kernel
                .iter()
                .enumerate()
                .map(|(k, w)| {
                    let cc = (c as isize + k as isize - half).rem_euclid(cols as isize) as usize;
                    w * values[[r, cc]]
                })
                .sum();
        }
    }

    let mut out = Array2::<f64>::zeros((rows, cols));
    for r in 0..rows {
        for c in 0..cols {
            out[[r, c]] = kernel
                .iter()
                .enumerate()
                .map(|(k, w)| {
                    let rr = (r as isize + k as isize - half).rem_euclid(rows as isize) as usize;
                    w * pass[[rr, c]]
                })
                .sum();
        }
    }
    out
}
