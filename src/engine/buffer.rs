//! Typed, fixed-size sample buffers holding one tile of one band.

use crate::engine::rectangle::{Rectangle, TileIndex};
use crate::types::{SarComplex, SarError, SarResult};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Numeric storage type of a band or buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Float32,
    Float64,
}

/// Real samples, or complex samples interleaved as (re, im) pairs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleKind {
    Real,
    Complex,
}

impl SampleKind {
    pub fn components(&self) -> usize {
        match self {
            SampleKind::Real => 1,
            SampleKind::Complex => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Samples {
    Float32(Vec<f32>),
    Float64(Vec<f64>),
}

/// One tile of raster data addressed by absolute image coordinates.
///
/// The buffer covers exactly [`RasterBuffer::rectangle`]; callers never deal
/// with tile-local offsets, even when the rectangle was halo-expanded.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterBuffer {
    rect: Rectangle,
    kind: SampleKind,
    samples: Samples,
}

impl RasterBuffer {
    /// Zero-filled buffer
    pub fn new(rect: Rectangle, data_type: DataType, kind: SampleKind) -> Self {
        let len = rect.area() * kind.components();
        let samples = match data_type {
            DataType::Float32 => Samples::Float32(vec![0.0; len]),
            DataType::Float64 => Samples::Float64(vec![0.0; len]),
        };
        Self {
            rect,
            kind,
            samples,
        }
    }

    /// Real buffer initialised from an (azimuth x range) array whose first
    /// element sits at `(rect.x, rect.y)`.
    pub fn from_array(rect: Rectangle, data_type: DataType, values: &Array2<f64>) -> SarResult<Self> {
        if values.dim() != (rect.height, rect.width) {
            return Err(SarError::OutOfRange(format!(
                "Array of shape {:?} does not match rectangle {}",
                values.dim(),
                rect
            )));
        }
        let mut buffer = Self::new(rect, data_type, SampleKind::Real);
        for ((row, col), &v) in values.indexed_iter() {
            buffer.set(rect.x + col as i64, rect.y + row as i64, v);
        }
        Ok(buffer)
    }

    pub fn rectangle(&self) -> Rectangle {
        self.rect
    }

    pub fn kind(&self) -> SampleKind {
        self.kind
    }

    pub fn data_type(&self) -> DataType {
        match self.samples {
            Samples::Float32(_) => DataType::Float32,
            Samples::Float64(_) => DataType::Float64,
        }
    }

    /// Index helper matching this buffer's layout
    pub fn tile_index(&self) -> TileIndex {
        TileIndex::new(self.rect, self.kind.components())
    }

    pub fn len(&self) -> usize {
        match &self.samples {
            Samples::Float32(v) => v.len(),
            Samples::Float64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sample at a flat offset (see [`TileIndex`])
    pub fn get_at(&self, offset: usize) -> f64 {
        match &self.samples {
            Samples::Float32(v) => v[offset] as f64,
            Samples::Float64(v) => v[offset],
        }
    }

    pub fn set_at(&mut self, offset: usize, value: f64) {
        match &mut self.samples {
            Samples::Float32(v) => v[offset] = value as f32,
            Samples::Float64(v) => v[offset] = value,
        }
    }

    fn offset(&self, x: i64, y: i64) -> usize {
        debug_assert!(self.rect.contains(x, y), "({}, {}) outside {}", x, y, self.rect);
        ((y - self.rect.y) as usize * self.rect.width + (x - self.rect.x) as usize)
            * self.kind.components()
    }

    /// Real sample (or real component of a complex sample) at `(x, y)`
    pub fn get(&self, x: i64, y: i64) -> f64 {
        self.get_at(self.offset(x, y))
    }

    pub fn set(&mut self, x: i64, y: i64, value: f64) {
        let offset = self.offset(x, y);
        self.set_at(offset, value);
    }

    /// Bounds-checked read
    pub fn value(&self, x: i64, y: i64) -> SarResult<f64> {
        if !self.rect.contains(x, y) {
            return Err(SarError::OutOfRange(format!(
                "Pixel ({}, {}) outside tile {}",
                x, y, self.rect
            )));
        }
        Ok(self.get(x, y))
    }

    pub fn get_complex(&self, x: i64, y: i64) -> SarComplex {
        let offset = self.offset(x, y);
        match self.kind {
            SampleKind::Real => SarComplex::new(self.get_at(offset), 0.0),
            SampleKind::Complex => SarComplex::new(self.get_at(offset), self.get_at(offset + 1)),
        }
    }

    pub fn set_complex(&mut self, x: i64, y: i64, value: SarComplex) {
        let offset = self.offset(x, y);
        self.set_at(offset, value.re);
        if self.kind == SampleKind::Complex {
            self.set_at(offset + 1, value.im);
        }
    }

    pub fn fill(&mut self, value: f64) {
        match &mut self.samples {
            Samples::Float32(v) => v.iter_mut().for_each(|s| *s = value as f32),
            Samples::Float64(v) => v.iter_mut().for_each(|s| *s = value),
        }
    }

    /// Copy of the real components as an (azimuth x range) array
    pub fn to_array(&self) -> Array2<f64> {
        let mut out = Array2::zeros((self.rect.height, self.rect.width));
        let components = self.kind.components();
        for ((row, col), v) in out.indexed_iter_mut() {
            *v = self.get_at((row * self.rect.width + col) * components);
        }
        out
    }

    /// Copy of the samples as complex values (imaginary part zero for real buffers)
    pub fn to_complex_array(&self) -> Array2<SarComplex> {
        let mut out = Array2::zeros((self.rect.height, self.rect.width));
        for ((row, col), v) in out.indexed_iter_mut() {
            *v = self.get_complex(self.rect.x + col as i64, self.rect.y + row as i64);
        }
        out
    }

    /// Copy every sample of `other` that falls inside this buffer.
    pub fn copy_from(&mut self, other: &RasterBuffer) -> SarResult<()> {
        if self.kind != other.kind {
            return Err(SarError::OutOfRange(format!(
                "Cannot copy {:?} samples into a {:?} buffer",
                other.kind, self.kind
            )));
        }
        let Some(overlap) = self.rect.intersection(&other.rect) else {
            return Ok(());
        };
        let components = self.kind.components();
        for y in overlap.y..overlap.max_y() {
            for x in overlap.x..overlap.max_x() {
                let src = other.offset(x, y);
                let dst = self.offset(x, y);
                for c in 0..components {
                    self.set_at(dst + c, other.get_at(src + c));
                }
            }
        }
        Ok(())
    }
}
