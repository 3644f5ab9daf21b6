//! Host tensor layouts.
//!
//! Host code works with HWC-interleaved tensors ([`HostTensor`]). The
//! device stores the same data as an array of RGBA planes
//! ([`PlanarTensor`]): plane-major, then rows, then columns, four floats per
//! pixel. Lanes past the channel count in the last plane are padding and
//! are kept at zero.

use crate::error::{GraphError, Result};
use crate::graph::TensorShape;

/// HWC-ordered host tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    pub shape: TensorShape,
    pub data: Vec<f32>,
}

impl HostTensor {
    /// Wrap HWC data, checking its length.
    pub fn new(shape: TensorShape, data: Vec<f32>) -> Result<Self> {
        if data.len() != shape.element_count() {
            return Err(GraphError::ShapeMismatch(format!(
                "{shape} tensor needs {} values, got {}",
                shape.element_count(),
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    pub fn zeros(shape: TensorShape) -> Self {
        Self {
            shape,
            data: vec![0.0; shape.element_count()],
        }
    }

    /// Tensor with `f(x, y, c)` at every position.
    pub fn from_fn(shape: TensorShape, mut f: impl FnMut(u32, u32, u32) -> f32) -> Self {
        let mut data = Vec::with_capacity(shape.element_count());
        for y in 0..shape.height {
            for x in 0..shape.width {
                for c in 0..shape.channels {
                    data.push(f(x, y, c));
                }
            }
        }
        Self { shape, data }
    }

    pub fn get(&self, x: u32, y: u32, c: u32) -> f32 {
        let s = self.shape;
        self.data[((y * s.width + x) * s.channels + c) as usize]
    }

    /// Convert to the device plane layout.
    pub fn to_planar(&self) -> PlanarTensor {
        let s = self.shape;
        let mut planar = PlanarTensor::zeros(s);
        for y in 0..s.height {
            for x in 0..s.width {
                let src = ((y * s.width + x) * s.channels) as usize;
                for c in 0..s.channels {
                    let dst = planar.index(c / 4, x, y) + (c % 4) as usize;
                    planar.data[dst] = self.data[src + c as usize];
                }
            }
        }
        planar
    }

    /// Largest absolute elementwise difference, `None` if shapes differ.
    pub fn max_abs_diff(&self, other: &HostTensor) -> Option<f32> {
        if self.shape != other.shape {
            return None;
        }
        Some(
            self.data
                .iter()
                .zip(&other.data)
                .map(|(a, b)| (a - b).abs())
                .fold(0.0, f32::max),
        )
    }
}

/// Plane-major RGBA tensor, the layout of device buffers and dump payloads.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanarTensor {
    pub shape: TensorShape,
    pub data: Vec<f32>,
}

impl PlanarTensor {
    pub fn zeros(shape: TensorShape) -> Self {
        Self {
            shape,
            data: vec![0.0; shape.padded_element_count()],
        }
    }

    /// Wrap plane-major data. Padding lanes are cleared.
    pub fn from_raw(shape: TensorShape, data: Vec<f32>) -> Result<Self> {
        if data.len() != shape.padded_element_count() {
            return Err(GraphError::ShapeMismatch(format!(
                "{shape} planar tensor needs {} values, got {}",
                shape.padded_element_count(),
                data.len()
            )));
        }
        let mut tensor = Self { shape, data };
        tensor.clear_padding();
        Ok(tensor)
    }

    /// Offset of the first lane of pixel `(x, y)` in `plane`.
    pub fn index(&self, plane: u32, x: u32, y: u32) -> usize {
        let s = self.shape;
        (((plane * s.height + y) * s.width + x) * 4) as usize
    }

    /// Values of one plane (`width * height * 4` floats).
    pub fn plane(&self, plane: u32) -> &[f32] {
        let len = (self.shape.width * self.shape.height * 4) as usize;
        let start = plane as usize * len;
        &self.data[start..start + len]
    }

    /// Zero the unused lanes of the last plane.
    pub fn clear_padding(&mut self) {
        let used = self.shape.channels % 4;
        if used == 0 || self.shape.planes() == 0 {
            return;
        }
        let last = self.shape.planes() - 1;
        for y in 0..self.shape.height {
            for x in 0..self.shape.width {
                let base = self.index(last, x, y);
                for lane in used as usize..4 {
                    self.data[base + lane] = 0.0;
                }
            }
        }
    }

    /// Convert back to HWC, dropping padding lanes.
    pub fn to_host(&self) -> HostTensor {
        let s = self.shape;
        let mut data = Vec::with_capacity(s.element_count());
        for y in 0..s.height {
            for x in 0..s.width {
                for c in 0..s.channels {
                    data.push(self.data[self.index(c / 4, x, y) + (c % 4) as usize]);
                }
            }
        }
        HostTensor { shape: s, data }
    }
}
