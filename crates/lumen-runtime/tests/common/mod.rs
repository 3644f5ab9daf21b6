//! Common test utilities for end-to-end GPU tests.
//!
//! Graph builders, deterministic inputs and a host reference convolution
//! shared by the runtime integration tests.

#![allow(dead_code)]

use lumen_core::{BufferRef, GraphOptions, HostTensor, InferenceGraph, TensorShape, WeightAccessMethod};
use lumen_runtime::Runtime;
use lumen_runtime::kernels::{Conv2dParams, conv2d_layer};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Initialize the runtime, panicking with a clear message if no GPU is present.
pub async fn runtime() -> Runtime {
    init_tracing();
    Runtime::new()
        .await
        .expect("Failed to initialize runtime (is a GPU available?)")
}

/// Deterministic input with positive and negative values.
pub fn pattern_tensor(shape: TensorShape) -> HostTensor {
    HostTensor::from_fn(shape, |x, y, c| {
        let v = (x * 7 + y * 13 + c * 3) % 17;
        v as f32 / 8.0 - 1.0
    })
}

/// Convolution weights with distinct small values.
pub fn conv_params(in_channels: u32, out_channels: u32, kernel: u32) -> Conv2dParams {
    let count = (out_channels * kernel * kernel * in_channels) as usize;
    Conv2dParams {
        out_channels,
        kernel,
        weights: (0..count).map(|i| ((i % 11) as f32 - 5.0) / 10.0).collect(),
        bias: (0..out_channels).map(|o| o as f32 * 0.25).collect(),
        relu: false,
    }
}

/// Single convolution layer graph over one model input.
pub fn conv_graph(input: TensorShape, params: &Conv2dParams) -> InferenceGraph {
    let mut graph = InferenceGraph::new("conv", vec![input]).with_options(GraphOptions {
        weight_access: WeightAccessMethod::Textures,
        ..Default::default()
    });
    graph.push_layer(conv2d_layer("conv", BufferRef::ModelInput(0), input, params));
    graph
}

/// Same-size convolution computed on the host.
pub fn reference_conv2d(input: &HostTensor, params: &Conv2dParams) -> HostTensor {
    let s = input.shape;
    let k = params.kernel as i64;
    let radius = k / 2;
    let out_shape = TensorShape::new(s.width, s.height, params.out_channels);

    HostTensor::from_fn(out_shape, |x, y, o| {
        let mut acc = params.bias[o as usize];
        for ky in 0..k {
            for kx in 0..k {
                let ix = x as i64 + kx - radius;
                let iy = y as i64 + ky - radius;
                if ix < 0 || iy < 0 || ix >= s.width as i64 || iy >= s.height as i64 {
                    continue;
                }
                let base = (((o as i64 * k + ky) * k + kx) * s.channels as i64) as usize;
                for i in 0..s.channels {
                    acc += params.weights[base + i as usize] * input.get(ix as u32, iy as u32, i);
                }
            }
        }
        if params.relu { acc.max(0.0) } else { acc }
    })
}

pub fn assert_close(actual: &HostTensor, expected: &HostTensor, tolerance: f32) {
    assert_eq!(actual.shape, expected.shape);
    let diff = actual
        .max_abs_diff(expected)
        .expect("tensors of equal shape");
    assert!(
        diff <= tolerance,
        "max abs difference {diff} exceeds {tolerance}"
    );
}
