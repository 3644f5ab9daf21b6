//! Latency profiling on a synthetic graph.
//!
//! Builds a stack of built-in convolutions followed by a compute ReLU and,
//! optionally, a host-side classifier head, then runs it repeatedly with a
//! static input and summarizes the per-stage timings.

use anyhow::{Context, Result};
use lumen_core::timing::{format_summary_table, summarize};
use lumen_core::{
    Activation, BufferRef, CpuProgram, GraphOptions, HostTensor, InferenceGraph, Layer,
    LayerInput, LayerKind, ModelType, TensorShape, TimeStats, TimingSummary, WeightAccessMethod,
};
use lumen_runtime::kernels::{Conv2dParams, conv2d_layer, relu_layer};
use lumen_runtime::{CreationParameters, MixedLayerInput, RunParameters, Runtime};
use std::path::PathBuf;

/// Shape and schedule of a profiling session.
#[derive(Debug, Clone)]
pub struct ProfileConfig {
    pub width: u32,
    pub height: u32,
    /// Output channels of every convolution.
    pub channels: u32,
    pub conv_layers: u32,
    pub kernel: u32,
    /// Classes of the host classifier head; 0 ends the graph on the GPU.
    pub classes: u32,
    pub half_precision: bool,
    pub runs: usize,
    pub skip_head: usize,
    pub skip_tail: usize,
    pub dump_dir: Option<PathBuf>,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            width: 64,
            height: 64,
            channels: 16,
            conv_layers: 3,
            kernel: 3,
            classes: 10,
            half_precision: false,
            runs: 20,
            skip_head: 2,
            skip_tail: 1,
            dump_dir: None,
        }
    }
}

/// Summarized timings of a profiling session.
#[derive(Debug, Clone)]
pub struct ProfileReport {
    pub rows: Vec<(String, TimingSummary)>,
    /// 1-based class index of the last run, if the graph has a classifier.
    pub classifier_output: Option<usize>,
}

impl ProfileReport {
    pub fn table(&self) -> String {
        format_summary_table(&self.rows)
    }
}

/// Deterministic weights in `[-0.5, 0.5]`, scaled down with fan-in.
fn synthetic_weights(count: usize, fan_in: usize, seed: usize) -> Vec<f32> {
    let scale = 1.0 / (fan_in.max(1) as f32).sqrt();
    (0..count)
        .map(|i| (((i * 31 + seed * 17) % 23) as f32 / 22.0 - 0.5) * scale)
        .collect()
}

/// Input image of the synthetic graph.
pub fn synthetic_input(shape: TensorShape) -> HostTensor {
    HostTensor::from_fn(shape, |x, y, c| ((x + 2 * y + 3 * c) % 9) as f32 / 8.0)
}

/// Build the synthetic graph described by `config`.
pub fn build_profile_graph(config: &ProfileConfig) -> InferenceGraph {
    let input = TensorShape::new(config.width, config.height, 3);
    let model_type = if config.classes > 0 {
        ModelType::Classification
    } else {
        ModelType::Detection
    };
    let mut graph = InferenceGraph::new("profile", vec![input])
        .with_model_type(model_type)
        .with_options(GraphOptions {
            weight_access: WeightAccessMethod::Textures,
            prefer_half_precision: config.half_precision,
            ..Default::default()
        });

    let mut source = BufferRef::ModelInput(0);
    let mut shape = input;
    for i in 0..config.conv_layers {
        let fan_in = (config.kernel * config.kernel * shape.channels) as usize;
        let params = Conv2dParams {
            out_channels: config.channels,
            kernel: config.kernel,
            weights: synthetic_weights(fan_in * config.channels as usize, fan_in, i as usize),
            bias: vec![0.01; config.channels as usize],
            relu: i + 1 < config.conv_layers,
        };
        let layer = conv2d_layer(&format!("conv{i}"), source, shape, &params);
        shape = layer.output;
        source = BufferRef::StageOutput(graph.push_layer(layer));
    }

    let relu = graph.push_layer(relu_layer("relu", source, shape));

    if config.classes > 0 {
        let features = shape.element_count();
        let classes = config.classes as usize;
        let flatten = graph.push_layer(
            Layer::new("flatten", LayerKind::Flatten, TensorShape::new(1, 1, features as u32))
                .with_input(LayerInput::new(BufferRef::StageOutput(relu)))
                .with_cpu_program(CpuProgram::Flatten),
        );
        graph.push_layer(
            Layer::new("dense", LayerKind::Dense, TensorShape::new(1, 1, config.classes))
                .with_input(LayerInput::new(BufferRef::StageOutput(flatten)))
                .with_cpu_program(CpuProgram::Dense {
                    weights: synthetic_weights(features * classes, features, 7),
                    bias: vec![0.0; classes],
                    inputs: features,
                    outputs: classes,
                    activation: Activation::Softmax,
                }),
        );
    }
    graph
}

/// Build the synthetic graph, run it `config.runs` times and summarize.
pub fn run_profile(runtime: &Runtime, config: &ProfileConfig) -> Result<ProfileReport> {
    let graph = build_profile_graph(config);
    let input_shape = graph.inputs[0];

    let mut params = CreationParameters::new(graph);
    if let Some(dir) = &config.dump_dir {
        params = params.with_dumps(dir.clone());
    }
    let mut core = runtime
        .create_core(params)
        .context("Failed to build the inference core")?;

    tracing::info!(
        stages = core.stages().len(),
        format = ?core.intermediate_format(),
        "Profiling {} runs",
        config.runs
    );

    let input = synthetic_input(input_shape);
    let mut stats = TimeStats::new();
    let mut classifier_output = None;
    for i in 0..config.runs {
        let mut run = RunParameters::new(vec![MixedLayerInput::FloatVector(input.data.clone())]);
        core.run(&mut run).with_context(|| format!("Run {i} failed"))?;
        core.write_time_stat(&mut stats);
        if config.classes > 0 {
            classifier_output = Some(run.model_output.classifier_output);
        }
    }

    Ok(ProfileReport {
        rows: summarize(&stats, config.skip_head, config.skip_tail),
        classifier_output,
    })
}
