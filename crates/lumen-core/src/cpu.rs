//! Host-side layer programs.
//!
//! A few layer kinds (classifier heads mostly) only have host
//! implementations. They operate on tensors flattened in HWC order: row,
//! then column, then channel, which matches the Keras `Flatten` layout the
//! dense weights were trained against.

use crate::error::{GraphError, Result};
use std::str::FromStr;

/// Elementwise activation function.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Activation {
    #[default]
    Identity,
    Relu,
    LeakyRelu {
        alpha: f32,
    },
    Sigmoid,
    Tanh,
    Silu,
    /// Normalizes over the whole vector.
    Softmax,
}

impl Activation {
    /// Apply in place.
    pub fn apply(&self, values: &mut [f32]) {
        match *self {
            Activation::Identity => {}
            Activation::Relu => values.iter_mut().for_each(|v| *v = v.max(0.0)),
            Activation::LeakyRelu { alpha } => values
                .iter_mut()
                .for_each(|v| *v = if *v < 0.0 { alpha * *v } else { *v }),
            Activation::Sigmoid => values.iter_mut().for_each(|v| *v = sigmoid(*v)),
            Activation::Tanh => values.iter_mut().for_each(|v| *v = v.tanh()),
            Activation::Silu => values.iter_mut().for_each(|v| *v *= sigmoid(*v)),
            Activation::Softmax => softmax(values),
        }
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

fn softmax(values: &mut [f32]) {
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;
    for v in values.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    if sum > 0.0 {
        values.iter_mut().for_each(|v| *v /= sum);
    }
}

impl FromStr for Activation {
    type Err = GraphError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "linear" | "identity" => Ok(Activation::Identity),
            "relu" => Ok(Activation::Relu),
            "leakyrelu" | "leaky_relu" => Ok(Activation::LeakyRelu { alpha: 0.3 }),
            "sigmoid" => Ok(Activation::Sigmoid),
            "tanh" => Ok(Activation::Tanh),
            "silu" | "swish" => Ok(Activation::Silu),
            "softmax" => Ok(Activation::Softmax),
            other => Err(GraphError::InvalidOption(format!(
                "unknown activation '{other}'"
            ))),
        }
    }
}

/// Fixed host computation of a CPU stage.
#[derive(Debug, Clone, PartialEq)]
pub enum CpuProgram {
    /// Pass the HWC-ordered input through unchanged.
    Flatten,
    /// Fully connected layer. `weights` is row-major `outputs x inputs`.
    Dense {
        weights: Vec<f32>,
        bias: Vec<f32>,
        inputs: usize,
        outputs: usize,
        activation: Activation,
    },
    /// Elementwise activation over the whole tensor.
    Activation(Activation),
}

impl CpuProgram {
    /// Evaluate the program on HWC-ordered inputs.
    ///
    /// Only the first input is consumed; host layers are single-input.
    ///
    /// # Errors
    /// Returns [`GraphError::CpuLayer`] when there is no input or its
    /// length does not match the program's weights.
    pub fn execute(&self, inputs: &[&[f32]]) -> Result<Vec<f32>> {
        let input = inputs
            .first()
            .ok_or_else(|| GraphError::CpuLayer("CPU layer called without inputs".to_string()))?;

        match self {
            CpuProgram::Flatten => Ok(input.to_vec()),
            CpuProgram::Dense {
                weights,
                bias,
                inputs: in_features,
                outputs,
                activation,
            } => {
                if input.len() != *in_features {
                    return Err(GraphError::CpuLayer(format!(
                        "dense layer expects {in_features} inputs, got {}",
                        input.len()
                    )));
                }
                if weights.len() != in_features * outputs || bias.len() != *outputs {
                    return Err(GraphError::CpuLayer(format!(
                        "dense layer has {} weights and {} biases for {in_features}x{outputs}",
                        weights.len(),
                        bias.len()
                    )));
                }
                let mut out: Vec<f32> = weights
                    .chunks_exact(*in_features)
                    .zip(bias)
                    .map(|(row, b)| row.iter().zip(input.iter()).map(|(w, x)| w * x).sum::<f32>() + b)
                    .collect();
                activation.apply(&mut out);
                Ok(out)
            }
            CpuProgram::Activation(activation) => {
                let mut out = input.to_vec();
                activation.apply(&mut out);
                Ok(out)
            }
        }
    }
}

/// Index of the largest value, or `None` for an empty slice.
pub fn argmax(values: &[f32]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f32)>, (i, &v)| match best {
            Some((_, bv)) if bv >= v => best,
            _ => Some((i, v)),
        })
        .map(|(i, _)| i)
}
