//! Piecewise-linear (azimuth time, range pixel) lookup tables as used by the
//! calibration and thermal noise annotations.

use crate::types::{SarError, SarResult};
use chrono::NaiveDateTime;

/// One annotated LUT row: values at increasing range pixels for one azimuth time
#[derive(Debug, Clone, PartialEq)]
pub struct LutVector {
    /// Seconds, same time base as the grid's first line time
    pub azimuth_time: f64,
    pub line: i64,
    pub pixels: Vec<i64>,
    pub values: Vec<f64>,
}

/// Validated set of LUT vectors plus the image line timing needed to place
/// an image row between two of them.
#[derive(Debug, Clone, PartialEq)]
pub struct LutGrid {
    first_line_time: f64,
    line_time_interval: f64,
    vectors: Vec<LutVector>,
}

impl LutGrid {
    /// Build a grid; vectors must be ordered by line and azimuth time and
    /// share the same pixel positions.
    pub fn new(first_line_time: f64, line_time_interval: f64, vectors: Vec<LutVector>) -> SarResult<Self> {
        if vectors.len() < 2 {
            return Err(SarError::Metadata(format!(
                "LUT needs at least two vectors, found {}",
                vectors.len()
            )));
        }
        if !(line_time_interval.is_finite() && line_time_interval > 0.0) {
            return Err(SarError::Metadata(format!(
                "Invalid line time interval {}",
                line_time_interval
            )));
        }
        for (i, v) in vectors.iter().enumerate() {
            if v.pixels.len() < 2 || v.pixels.len() != v.values.len() {
                return Err(SarError::Metadata(format!(
                    "LUT vector {} has {} pixels and {} values",
                    i,
                    v.pixels.len(),
                    v.values.len()
                )));
            }
            if v.pixels.windows(2).any(|w| w[1] <= w[0]) {
                return Err(SarError::Metadata(format!(
                    "Pixel indices of LUT vector {} are not strictly increasing",
                    i
                )));
            }
            if v.pixels != vectors[0].pixels {
                return Err(SarError::Metadata(format!(
                    "LUT vector {} is sampled at different pixels than vector 0",
                    i
                )));
            }
        }
        if vectors
            .windows(2)
            .any(|w| w[1].azimuth_time <= w[0].azimuth_time || w[1].line <= w[0].line)
        {
            return Err(SarError::Metadata(
                "LUT vectors are not strictly increasing in azimuth time and line".to_string(),
            ));
        }

        Ok(Self {
            first_line_time,
            line_time_interval,
            vectors,
        })
    }

    pub fn vectors(&self) -> &[LutVector] {
        &self.vectors
    }

    pub fn first_line_time(&self) -> f64 {
        self.first_line_time
    }

    pub fn line_time_interval(&self) -> f64 {
        self.line_time_interval
    }

    /// Index of the upper bracketing vector for image line `y`, clamped so
    /// that `idx + 1` is valid.
    fn vector_index(&self, y: i64) -> usize {
        let last = self.vectors.len() - 2;
        match self.vectors.iter().position(|v| y < v.line) {
            Some(0) => 0,
            Some(i) => (i - 1).min(last),
            None => last,
        }
    }

    fn pixel_index(pixels: &[i64], x: i64) -> usize {
        let last = pixels.len() - 2;
        match pixels.iter().position(|&p| x < p) {
            Some(0) => 0,
            Some(i) => (i - 1).min(last),
            None => last,
        }
    }

    /// Interpolated LUT values for pixels `x0 .. x0 + width` of image line `y`.
    ///
    /// The pixel bracket is found once for `x0` and then only moves forward
    /// along the row.
    pub fn row(&self, y: i64, x0: i64, width: usize) -> Vec<f64> {
        let idx = self.vector_index(y);
        let v0 = &self.vectors[idx];
        let v1 = &self.vectors[idx + 1];

        let az_time = self.first_line_time + y as f64 * self.line_time_interval;
        let mu_y = (az_time - v0.azimuth_time) / (v1.azimuth_time - v0.azimuth_time);

        let pixels = &v0.pixels;
        let last = pixels.len() - 2;
        let mut p = Self::pixel_index(pixels, x0);

        let mut out = Vec::with_capacity(width);
        for x in x0..x0 + width as i64 {
            while p < last && x > pixels[p + 1] {
                p += 1;
            }
            let mu_x = (x - pixels[p]) as f64 / (pixels[p + 1] - pixels[p]) as f64;
            out.push(bilinear(
                v0.values[p],
                v0.values[p + 1],
                v1.values[p],
                v1.values[p + 1],
                mu_x,
                mu_y,
            ));
        }
        out
    }
}

/// Bilinear blend; `v01` is right of `v00`, `v10` below it.
#[inline]
pub fn bilinear(v00: f64, v01: f64, v10: f64, v11: f64, mu_x: f64, mu_y: f64) -> f64 {
    (1.0 - mu_y) * ((1.0 - mu_x) * v00 + mu_x * v01) + mu_y * ((1.0 - mu_x) * v10 + mu_x * v11)
}

/// Annotation UTC time such as `2020-01-15T05:40:02.123456` as seconds since the epoch
pub fn parse_utc_seconds(text: &str) -> SarResult<f64> {
    let t = NaiveDateTime::parse_from_str(text.trim(), "%Y-%m-%dT%H:%M:%S%.f")
        .map_err(|e| SarError::XmlParsing(format!("Invalid time '{}': {}", text, e)))?;
    Ok(t.and_utc().timestamp_micros() as f64 * 1e-6)
}

/// Whitespace separated numbers
pub fn parse_list<T: std::str::FromStr>(text: &str, tag: &str) -> SarResult<Vec<T>> {
    text.split_whitespace()
        .map(|s| {
            s.parse()
                .map_err(|_| SarError::XmlParsing(format!("Invalid number '{}' in <{}>", s, tag)))
        })
        .collect()
}
