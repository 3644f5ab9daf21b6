//! Inference graph data contract.
//!
//! An [`InferenceGraph`] is produced by the external model compiler and is
//! read once while the engine builds its stages. Layers are stored in
//! topological order: a layer may only consume model inputs or outputs of
//! layers that come before it.

use crate::cpu::CpuProgram;
use crate::error::GraphError;
use crate::packing::{MrtMode, plane_count};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Shape of an activation tensor (batch is always 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorShape {
    pub width: u32,
    pub height: u32,
    pub channels: u32,
}

impl TensorShape {
    pub const fn new(width: u32, height: u32, channels: u32) -> Self {
        Self {
            width,
            height,
            channels,
        }
    }

    /// Number of 4-channel planes used to store this tensor on the device.
    pub fn planes(&self) -> u32 {
        plane_count(self.channels)
    }

    /// Number of logical values (`width * height * channels`).
    pub fn element_count(&self) -> usize {
        self.width as usize * self.height as usize * self.channels as usize
    }

    /// Number of floats in the plane-major RGBA layout, padding included.
    pub fn padded_element_count(&self) -> usize {
        self.width as usize * self.height as usize * self.planes() as usize * 4
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.width, self.height, self.channels)
    }
}

/// Reference to a tensor consumed by a layer.
///
/// Stage outputs are addressed by layer index, so edges are plain arena
/// indices rather than pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferRef {
    /// The n-th model input supplied in the run parameters.
    ModelInput(usize),
    /// Output of the layer with this index.
    StageOutput(usize),
}

impl fmt::Display for BufferRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferRef::ModelInput(i) => write!(f, "input[{i}]"),
            BufferRef::StageOutput(i) => write!(f, "stage[{i}]"),
        }
    }
}

/// One input edge of a layer.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerInput {
    pub source: BufferRef,
    /// Shape the layer was compiled against. Checked during construction.
    pub expected: Option<TensorShape>,
}

impl LayerInput {
    pub fn new(source: BufferRef) -> Self {
        Self {
            source,
            expected: None,
        }
    }

    pub fn with_shape(source: BufferRef, shape: TensorShape) -> Self {
        Self {
            source,
            expected: Some(shape),
        }
    }
}

/// Layer type tags emitted by the model compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerKind {
    InputLayer,
    Conv2D,
    SeparableConv2D,
    DepthwiseConv2D,
    Deconv2D,
    MaxPooling2D,
    AveragePooling2D,
    AdaptiveAvgPool2D,
    BatchNormalization,
    InstanceNormalization,
    Activation,
    Unary,
    Pad,
    Add,
    Concatenate,
    UpSampling2D,
    SubpixelMerge,
    Flatten,
    Dense,
}

impl LayerKind {
    const ALL: [LayerKind; 19] = [
        LayerKind::InputLayer,
        LayerKind::Conv2D,
        LayerKind::SeparableConv2D,
        LayerKind::DepthwiseConv2D,
        LayerKind::Deconv2D,
        LayerKind::MaxPooling2D,
        LayerKind::AveragePooling2D,
        LayerKind::AdaptiveAvgPool2D,
        LayerKind::BatchNormalization,
        LayerKind::InstanceNormalization,
        LayerKind::Activation,
        LayerKind::Unary,
        LayerKind::Pad,
        LayerKind::Add,
        LayerKind::Concatenate,
        LayerKind::UpSampling2D,
        LayerKind::SubpixelMerge,
        LayerKind::Flatten,
        LayerKind::Dense,
    ];

    /// Whether kernels for this layer kind can run on the GPU at all.
    ///
    /// Flatten and Dense terminate classifier heads and only exist as host
    /// programs; every other kind is compiled to GPU passes.
    pub fn is_gpu_capable(self) -> bool {
        !matches!(self, LayerKind::Flatten | LayerKind::Dense)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LayerKind::InputLayer => "InputLayer",
            LayerKind::Conv2D => "Conv2D",
            LayerKind::SeparableConv2D => "SeparableConv2D",
            LayerKind::DepthwiseConv2D => "DepthwiseConv2D",
            LayerKind::Deconv2D => "Conv2DTranspose",
            LayerKind::MaxPooling2D => "MaxPooling2D",
            LayerKind::AveragePooling2D => "AveragePooling2D",
            LayerKind::AdaptiveAvgPool2D => "AdaptiveAvgPool2D",
            LayerKind::BatchNormalization => "BatchNormalization",
            LayerKind::InstanceNormalization => "InstanceNormalization",
            LayerKind::Activation => "Activation",
            LayerKind::Unary => "Unary",
            LayerKind::Pad => "ZeroPadding2D",
            LayerKind::Add => "Add",
            LayerKind::Concatenate => "Concatenate",
            LayerKind::UpSampling2D => "UpSampling2D",
            LayerKind::SubpixelMerge => "SubpixelMerge",
            LayerKind::Flatten => "Flatten",
            LayerKind::Dense => "Dense",
        }
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LayerKind {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(kind) = LayerKind::ALL.iter().find(|k| k.as_str() == s) {
            return Ok(*kind);
        }
        // Aliases used by older model exports.
        match s {
            "Deconv2D" => Ok(LayerKind::Deconv2D),
            "Pad" => Ok(LayerKind::Pad),
            "InputLayer2D" => Ok(LayerKind::InputLayer),
            other => Err(GraphError::UnsupportedLayer(other.to_string())),
        }
    }
}

/// Kind of GPU program a pass runs, fixed by the compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassProgram {
    /// Full-screen draw writing `output_slice_count` planes starting at
    /// `output_slice_index`, one render target per plane.
    Rasterization {
        output_slice_index: u32,
        output_slice_count: u32,
    },
    /// Compute dispatch writing the output through a storage texture.
    Compute { dispatch: [u32; 3] },
}

/// How layer weights reach the kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WeightAccessMethod {
    /// Weights are baked into the kernel source; nothing is bound.
    #[default]
    Constants,
    /// Weights are bound as textures or buffers.
    Textures,
}

impl FromStr for WeightAccessMethod {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CONSTANTS" => Ok(WeightAccessMethod::Constants),
            "TEXTURES" => Ok(WeightAccessMethod::Textures),
            other => Err(GraphError::InvalidOption(format!(
                "unknown weight access method '{other}'"
            ))),
        }
    }
}

/// Weight data bound to a pass.
#[derive(Debug, Clone, PartialEq)]
pub enum WeightResource {
    /// RGBA float texture array; `data` holds `width * height * layers * 4`
    /// floats in plane-major order.
    Texture {
        width: u32,
        height: u32,
        layers: u32,
        data: Vec<f32>,
    },
    /// Read-only storage buffer.
    Storage(Vec<f32>),
    /// Uniform buffer (std140 layout is the compiler's job).
    Uniform(Vec<f32>),
}

impl WeightResource {
    pub fn values(&self) -> &[f32] {
        match self {
            WeightResource::Texture { data, .. } => data,
            WeightResource::Storage(data) | WeightResource::Uniform(data) => data,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WeightBinding {
    pub binding: u32,
    pub resource: WeightResource,
}

/// Raw uniform block (for example per-layer scale/offset parameters).
#[derive(Debug, Clone, PartialEq)]
pub struct UniformBinding {
    pub binding: u32,
    pub data: Vec<u8>,
}

/// Which shared sampler a binding receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SamplerKind {
    /// Nearest filtering, clamp to a transparent border.
    Input,
    /// Nearest filtering, clamp to edge.
    Weight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplerBinding {
    pub binding: u32,
    pub kind: SamplerKind,
}

/// Binds `layer.inputs[input]` as a sampled texture array at `binding`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputBinding {
    pub binding: u32,
    pub input: usize,
}

/// One GPU kernel of a layer.
#[derive(Debug, Clone, PartialEq)]
pub struct Pass {
    pub program: PassProgram,
    /// WGSL source, composed with `defines` before compilation.
    pub source: String,
    pub entry_point: String,
    /// Shader defs; integer-looking values become `Int`, everything else `Bool`.
    pub defines: HashMap<String, String>,
    pub inputs: Vec<InputBinding>,
    pub weights: Vec<WeightBinding>,
    pub uniforms: Vec<UniformBinding>,
    pub samplers: Vec<SamplerBinding>,
    /// Binding of the shared debug storage buffer, if the kernel writes to it.
    pub debug_binding: Option<u32>,
    /// Storage-texture binding of the output (compute passes only).
    pub output_binding: Option<u32>,
}

impl Pass {
    /// Rasterization pass writing `count` planes from `first`.
    pub fn rasterization(
        source: impl Into<String>,
        entry_point: impl Into<String>,
        first: u32,
        count: u32,
    ) -> Self {
        Self::with_program(
            PassProgram::Rasterization {
                output_slice_index: first,
                output_slice_count: count,
            },
            source,
            entry_point,
        )
    }

    /// Compute pass writing its output through `output_binding`.
    pub fn compute(
        source: impl Into<String>,
        entry_point: impl Into<String>,
        dispatch: [u32; 3],
        output_binding: u32,
    ) -> Self {
        let mut pass = Self::with_program(PassProgram::Compute { dispatch }, source, entry_point);
        pass.output_binding = Some(output_binding);
        pass
    }

    fn with_program(
        program: PassProgram,
        source: impl Into<String>,
        entry_point: impl Into<String>,
    ) -> Self {
        Self {
            program,
            source: source.into(),
            entry_point: entry_point.into(),
            defines: HashMap::new(),
            inputs: Vec::new(),
            weights: Vec::new(),
            uniforms: Vec::new(),
            samplers: Vec::new(),
            debug_binding: None,
            output_binding: None,
        }
    }

    pub fn with_input(mut self, binding: u32, input: usize) -> Self {
        self.inputs.push(InputBinding { binding, input });
        self
    }

    pub fn with_weight(mut self, binding: u32, resource: WeightResource) -> Self {
        self.weights.push(WeightBinding { binding, resource });
        self
    }

    pub fn with_uniform(mut self, binding: u32, data: Vec<u8>) -> Self {
        self.uniforms.push(UniformBinding { binding, data });
        self
    }

    pub fn with_sampler(mut self, binding: u32, kind: SamplerKind) -> Self {
        self.samplers.push(SamplerBinding { binding, kind });
        self
    }

    pub fn with_define(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.defines.insert(name.into(), value.into());
        self
    }

    pub fn with_debug_binding(mut self, binding: u32) -> Self {
        self.debug_binding = Some(binding);
        self
    }

    pub fn is_compute(&self) -> bool {
        matches!(self.program, PassProgram::Compute { .. })
    }
}

/// One model layer.
#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    pub name: String,
    pub kind: LayerKind,
    pub output: TensorShape,
    pub inputs: Vec<LayerInput>,
    /// Kernels in pass order (rasterization unless the compiler chose compute).
    pub passes: Vec<Pass>,
    /// Compute-kernel alternatives, used when [`GraphOptions::compute`] is set.
    pub compute_passes: Vec<Pass>,
    /// Host implementation, required when the layer runs on the CPU.
    pub cpu_program: Option<CpuProgram>,
    /// Run on the CPU even though the kind is GPU-capable.
    pub force_cpu: bool,
}

impl Layer {
    pub fn new(name: impl Into<String>, kind: LayerKind, output: TensorShape) -> Self {
        Self {
            name: name.into(),
            kind,
            output,
            inputs: Vec::new(),
            passes: Vec::new(),
            compute_passes: Vec::new(),
            cpu_program: None,
            force_cpu: false,
        }
    }

    pub fn with_input(mut self, input: LayerInput) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn with_pass(mut self, pass: Pass) -> Self {
        self.passes.push(pass);
        self
    }

    pub fn with_compute_pass(mut self, pass: Pass) -> Self {
        self.compute_passes.push(pass);
        self
    }

    pub fn with_cpu_program(mut self, program: CpuProgram) -> Self {
        self.cpu_program = Some(program);
        self
    }

    /// Pin the layer to the host backend.
    pub fn on_cpu(mut self, program: CpuProgram) -> Self {
        self.force_cpu = true;
        self.cpu_program = Some(program);
        self
    }

    /// Whether this layer executes on the host.
    pub fn runs_on_cpu(&self) -> bool {
        self.force_cpu || !self.kind.is_gpu_capable()
    }
}

/// What the final stage's result means to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModelType {
    /// Image-to-image model; result goes to the output device buffer.
    #[default]
    Image,
    /// Result is a score vector; the argmax is reported.
    Classification,
    /// Result rows are handed back on the host.
    Detection,
}

/// Options the compiler attaches to a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GraphOptions {
    pub mrt_mode: MrtMode,
    pub weight_access: WeightAccessMethod,
    /// Store intermediate tensors as 16-bit floats.
    pub prefer_half_precision: bool,
    /// Prefer compute-kernel passes where the layer provides them.
    pub compute: bool,
}

/// Device-agnostic model graph.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceGraph {
    pub name: String,
    /// Shapes of the model inputs, addressed by [`BufferRef::ModelInput`].
    pub inputs: Vec<TensorShape>,
    pub layers: Vec<Layer>,
    pub options: GraphOptions,
    pub model_type: ModelType,
}

impl InferenceGraph {
    pub fn new(name: impl Into<String>, inputs: Vec<TensorShape>) -> Self {
        Self {
            name: name.into(),
            inputs,
            layers: Vec::new(),
            options: GraphOptions::default(),
            model_type: ModelType::default(),
        }
    }

    pub fn with_options(mut self, options: GraphOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_model_type(mut self, model_type: ModelType) -> Self {
        self.model_type = model_type;
        self
    }

    /// Append a layer and return its index.
    pub fn push_layer(&mut self, layer: Layer) -> usize {
        self.layers.push(layer);
        self.layers.len() - 1
    }

    /// Shape of a referenced tensor, if the reference is valid.
    pub fn shape_of(&self, source: BufferRef) -> Option<TensorShape> {
        match source {
            BufferRef::ModelInput(i) => self.inputs.get(i).copied(),
            BufferRef::StageOutput(i) => self.layers.get(i).map(|l| l.output),
        }
    }

    /// Shape of the final layer's output.
    pub fn output_shape(&self) -> Option<TensorShape> {
        self.layers.last().map(|l| l.output)
    }
}
