//! Built-in kernels.
//!
//! A small set of layers with known semantics, used by the integration
//! tests and the profiling tool to exercise the engine without an external
//! model compiler.

use lumen_core::{
    BufferRef, Layer, LayerInput, LayerKind, MrtMode, Pass, TensorShape, WeightResource,
    pass_count, pass_planes,
};

/// Direct convolution, one rasterization pass per output plane.
pub const CONV2D_WGSL: &str = include_str!("../shaders/conv2d.wgsl");

/// Elementwise ReLU as a single compute pass.
pub const RELU_WGSL: &str = include_str!("../shaders/relu.wgsl");

/// Workgroup size of [`RELU_WGSL`] in x and y.
pub const RELU_WORKGROUP: u32 = 8;

/// Parameters of a same-size convolution layer.
#[derive(Debug, Clone)]
pub struct Conv2dParams {
    pub out_channels: u32,
    /// Odd kernel size.
    pub kernel: u32,
    /// `out_channels x kernel x kernel x in_channels`, row-major.
    pub weights: Vec<f32>,
    pub bias: Vec<f32>,
    pub relu: bool,
}

/// Build a convolution layer reading `source` of shape `input`.
///
/// The kernel writes one plane per pass and reads its weights from storage
/// buffers, so the layer is only valid in graphs using
/// [`MrtMode::SinglePlane`] and [`lumen_core::WeightAccessMethod::Textures`].
pub fn conv2d_layer(name: &str, source: BufferRef, input: TensorShape, params: &Conv2dParams) -> Layer {
    let output = TensorShape::new(input.width, input.height, params.out_channels);
    let mut layer = Layer::new(name, LayerKind::Conv2D, output)
        .with_input(LayerInput::with_shape(source, input));

    for k in 0..pass_count(params.out_channels, MrtMode::SinglePlane) {
        let planes = pass_planes(k, params.out_channels, MrtMode::SinglePlane);
        let uniform = [input.channels, params.out_channels, planes.start * 4, params.kernel];
        let mut pass = Pass::rasterization(CONV2D_WGSL, "fs_main", planes.start, planes.len() as u32)
            .with_input(0, 0)
            .with_uniform(1, bytemuck::cast_slice(&uniform).to_vec())
            .with_weight(2, WeightResource::Storage(params.weights.clone()))
            .with_weight(3, WeightResource::Storage(params.bias.clone()));
        if params.relu {
            pass = pass.with_define("RELU", "true");
        }
        layer = layer.with_pass(pass);
    }
    layer
}

/// Build a ReLU layer over `source` of shape `shape`, as a compute pass.
pub fn relu_layer(name: &str, source: BufferRef, shape: TensorShape) -> Layer {
    let dispatch = [
        shape.width.div_ceil(RELU_WORKGROUP),
        shape.height.div_ceil(RELU_WORKGROUP),
        shape.planes(),
    ];
    Layer::new(name, LayerKind::Activation, shape)
        .with_input(LayerInput::with_shape(source, shape))
        .with_compute_pass(Pass::compute(RELU_WGSL, "cs_main", dispatch, 1).with_input(0, 0))
}
