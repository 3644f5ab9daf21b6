//! End-to-end tests of the mixed inference core.
//!
//! All tests need a GPU and are ignored by default:
//! `cargo test -p lumen-runtime -- --ignored`

mod common;

use common::*;
use lumen_core::{
    Activation, BufferRef, CpuProgram, GraphOptions, HostTensor, InferenceGraph, Layer, LayerInput,
    LayerKind, ModelType, MrtMode, Pass, TensorShape, TimeStats, load_dump, pass_count, pass_planes,
};
use lumen_runtime::kernels::relu_layer;
use lumen_runtime::{
    CreationParameters, DeviceTensorBuffer, InferenceError, MixedLayerInput, RunParameters,
    TensorFormat, check_target_formats,
};

fn relu(values: &[f32]) -> Vec<f32> {
    values.iter().map(|v| v.max(0.0)).collect()
}

#[pollster::test]
#[ignore] // Requires GPU
async fn test_conv2d_matches_host_reference() {
    let runtime = runtime().await;
    let input_shape = TensorShape::new(8, 8, 3);
    let params = conv_params(3, 8, 3);
    let graph = conv_graph(input_shape, &params);

    let mut core = runtime.create_core(CreationParameters::new(graph)).unwrap();
    assert_eq!(core.stages().len(), 1);
    assert_eq!(core.stages()[0].passes().len(), 2);
    assert_eq!(core.get_input_dims(), &[input_shape]);

    let input = pattern_tensor(input_shape);
    let input_buffer = DeviceTensorBuffer::from_planar(
        runtime.device(),
        runtime.queue(),
        "input",
        &input.to_planar(),
        TensorFormat::Rgba32Float,
    )
    .unwrap();
    let output_buffer = DeviceTensorBuffer::new(
        runtime.device(),
        "output",
        TensorShape::new(8, 8, 8),
        TensorFormat::Rgba32Float,
    )
    .unwrap();

    let mut run = RunParameters::new(vec![MixedLayerInput::DeviceBuffer(input_buffer)])
        .with_output_buffer(output_buffer.clone());
    core.run(&mut run).unwrap();

    let actual = output_buffer
        .read_planar(runtime.device(), runtime.queue())
        .unwrap()
        .to_host();
    assert_close(&actual, &reference_conv2d(&input, &params), 1e-4);
    assert_close(&core.get_output().unwrap(), &actual, 0.0);
}

#[pollster::test]
#[ignore] // Requires GPU
async fn test_consecutive_runs_are_deterministic() {
    let runtime = runtime().await;
    let input_shape = TensorShape::new(8, 8, 3);
    let mut params = conv_params(3, 8, 3);
    params.relu = true;
    let graph = conv_graph(input_shape, &params);
    let mut core = runtime.create_core(CreationParameters::new(graph)).unwrap();

    let output_buffer = DeviceTensorBuffer::new(
        runtime.device(),
        "output",
        TensorShape::new(8, 8, 8),
        TensorFormat::Rgba32Float,
    )
    .unwrap();
    let input = pattern_tensor(input_shape);

    let mut outputs = Vec::new();
    for _ in 0..2 {
        let mut run = RunParameters::new(vec![MixedLayerInput::FloatVector(input.data.clone())])
            .with_output_buffer(output_buffer.clone());
        core.run(&mut run).unwrap();
        outputs.push(core.get_output().unwrap());
    }

    assert_eq!(outputs[0], outputs[1]);
    assert_close(&outputs[0], &reference_conv2d(&input, &params), 1e-4);
}

#[pollster::test]
#[ignore] // Requires GPU
async fn test_gpu_to_cpu_transition_matches_readback() {
    let runtime = runtime().await;

    for channels in [1, 4, 5, 32, 127] {
        let shape = TensorShape::new(5, 3, channels);
        let mut graph = InferenceGraph::new("transition", vec![shape])
            .with_model_type(ModelType::Detection);
        graph.push_layer(relu_layer("relu", BufferRef::ModelInput(0), shape));
        graph.push_layer(
            Layer::new("flatten", LayerKind::Flatten, TensorShape::new(1, 1, shape.element_count() as u32))
                .with_input(LayerInput::new(BufferRef::StageOutput(0)))
                .with_cpu_program(CpuProgram::Flatten),
        );

        let mut core = runtime.create_core(CreationParameters::new(graph)).unwrap();
        let input = pattern_tensor(shape);
        let mut run = RunParameters::new(vec![MixedLayerInput::FloatVector(input.data.clone())]);
        core.run(&mut run).unwrap();

        let direct = core
            .stage_buffer(0)
            .unwrap()
            .read_planar(runtime.device(), runtime.queue())
            .unwrap()
            .to_host();
        assert_eq!(run.output[0], direct.data, "channels = {channels}");
        assert_eq!(direct.data, relu(&input.data), "channels = {channels}");
    }
}

#[pollster::test]
#[ignore] // Requires GPU
async fn test_cpu_to_gpu_transition() {
    let runtime = runtime().await;
    let shape = TensorShape::new(4, 2, 6);
    let rows = TensorShape::new(8, 1, 6);

    let mut graph = InferenceGraph::new("round_trip", vec![shape]).with_model_type(ModelType::Detection);
    graph.push_layer(relu_layer("relu0", BufferRef::ModelInput(0), shape));
    graph.push_layer(
        Layer::new("scale", LayerKind::Activation, rows)
            .with_input(LayerInput::new(BufferRef::StageOutput(0)))
            .on_cpu(CpuProgram::Activation(Activation::LeakyRelu { alpha: 0.5 })),
    );
    graph.push_layer(relu_layer("relu1", BufferRef::StageOutput(1), rows));

    let mut core = runtime.create_core(CreationParameters::new(graph)).unwrap();
    let transitions: Vec<String> = core.stages().iter().map(|s| s.transition().to_string()).collect();
    assert_eq!(transitions, ["NONE", "GPU_TO_CPU", "CPU_TO_GPU"]);

    let input = pattern_tensor(shape);
    let mut run = RunParameters::new(vec![MixedLayerInput::FloatVector(input.data.clone())]);
    core.run(&mut run).unwrap();

    let expected = relu(&input.data);
    assert_eq!(run.output[0], expected);
    assert_eq!(run.model_output.model_type, ModelType::Detection);
    assert_eq!(run.model_output.detection_output.len(), 8);
    assert_eq!(run.model_output.detection_output[3], expected[18..24].to_vec());
}

#[pollster::test]
#[ignore] // Requires GPU
async fn test_classifier_output() {
    let runtime = runtime().await;
    let shape = TensorShape::new(1, 1, 4);

    let mut graph = InferenceGraph::new("classifier", vec![shape])
        .with_model_type(ModelType::Classification);
    graph.push_layer(relu_layer("relu", BufferRef::ModelInput(0), shape));
    graph.push_layer(
        Layer::new("dense", LayerKind::Dense, TensorShape::new(1, 1, 3))
            .with_input(LayerInput::new(BufferRef::StageOutput(0)))
            .with_cpu_program(CpuProgram::Dense {
                weights: vec![
                    1.0, 0.0, 0.0, 0.0, //
                    0.0, 1.0, 0.0, 0.0, //
                    0.0, 0.0, 1.0, 0.0,
                ],
                bias: vec![0.0; 3],
                inputs: 4,
                outputs: 3,
                activation: Activation::Identity,
            }),
    );

    let mut core = runtime.create_core(CreationParameters::new(graph)).unwrap();
    let mut run = RunParameters::new(vec![MixedLayerInput::FloatVector(vec![0.1, -2.0, 0.9, 0.3])]);
    core.run(&mut run).unwrap();

    assert_eq!(run.output[0], vec![0.1, 0.0, 0.9]);
    assert_eq!(run.model_output.classifier_output, 3);
}

#[pollster::test]
#[ignore] // Requires GPU
async fn test_half_precision_intermediates() {
    let runtime = runtime().await;
    let shape = TensorShape::new(6, 6, 5);
    let mut graph = InferenceGraph::new("half", vec![shape])
        .with_model_type(ModelType::Detection)
        .with_options(GraphOptions {
            prefer_half_precision: true,
            ..Default::default()
        });
    graph.push_layer(relu_layer("relu", BufferRef::ModelInput(0), shape));

    let mut core = runtime.create_core(CreationParameters::new(graph)).unwrap();
    assert_eq!(core.intermediate_format(), TensorFormat::Rgba16Float);

    let input = pattern_tensor(shape);
    let mut run = RunParameters::new(vec![MixedLayerInput::FloatVector(input.data.clone())]);
    core.run(&mut run).unwrap();

    for (actual, expected) in run.output[0].iter().zip(relu(&input.data)) {
        assert!((actual - expected).abs() < 1e-2);
    }
}

const ADD_WGSL: &str = r#"
struct Params {
    plane: u32,
}

@group(0) @binding(0) var lhs: texture_2d_array<f32>;
@group(0) @binding(1) var rhs: texture_2d_array<f32>;
@group(0) @binding(2) var<uniform> params: Params;

@fragment
fn fs_main(@builtin(position) pos: vec4<f32>) -> @location(0) vec4<f32> {
    let p = vec2<i32>(pos.xy);
    let plane = i32(params.plane);
    return textureLoad(lhs, p, plane, 0) + textureLoad(rhs, p, plane, 0);
}
"#;

#[pollster::test]
#[ignore] // Requires GPU
async fn test_two_input_stage_reads_earlier_output_and_model_input() {
    let runtime = runtime().await;
    let shape = TensorShape::new(6, 4, 8);

    let mut graph =
        InferenceGraph::new("skip", vec![shape, shape]).with_model_type(ModelType::Detection);
    let relu_out = graph.push_layer(relu_layer("relu", BufferRef::ModelInput(0), shape));
    let mut add = Layer::new("add", LayerKind::Add, shape)
        .with_input(LayerInput::with_shape(BufferRef::StageOutput(relu_out), shape))
        .with_input(LayerInput::with_shape(BufferRef::ModelInput(1), shape));
    for k in 0..pass_count(shape.channels, MrtMode::SinglePlane) {
        let planes = pass_planes(k, shape.channels, MrtMode::SinglePlane);
        add = add.with_pass(
            Pass::rasterization(ADD_WGSL, "fs_main", planes.start, planes.len() as u32)
                .with_input(0, 0)
                .with_input(1, 1)
                .with_uniform(2, planes.start.to_le_bytes().to_vec()),
        );
    }
    graph.push_layer(add);

    let mut core = runtime.create_core(CreationParameters::new(graph)).unwrap();
    assert_eq!(core.stages()[1].passes().len(), 2);

    let a = pattern_tensor(shape);
    let b = HostTensor::from_fn(shape, |x, y, c| (x + 2 * y) as f32 * 0.5 - c as f32);
    let mut run = RunParameters::new(vec![
        MixedLayerInput::FloatVector(a.data.clone()),
        MixedLayerInput::FloatVector(b.data.clone()),
    ]);
    core.run(&mut run).unwrap();

    let expected: Vec<f32> = relu(&a.data).iter().zip(&b.data).map(|(x, y)| x + y).collect();
    let actual = HostTensor::new(shape, run.output[0].clone()).unwrap();
    assert_close(&actual, &HostTensor::new(shape, expected).unwrap(), 1e-5);
}

const DOUBLE_PLANE_WGSL: &str = r#"
struct Params {
    first_plane: u32,
}

struct Out {
    @location(0) p0: vec4<f32>,
    @location(1) p1: vec4<f32>,
}

@group(0) @binding(0) var input0: texture_2d_array<f32>;
@group(0) @binding(1) var<uniform> params: Params;

fn channel_offsets(plane: u32) -> vec4<f32> {
    let c = f32(plane * 4u);
    return vec4<f32>(c, c + 1.0, c + 2.0, c + 3.0) * 100.0;
}

@fragment
fn fs_main(@builtin(position) pos: vec4<f32>) -> Out {
    let texel = textureLoad(input0, vec2<i32>(pos.xy), 0, 0);
    return Out(
        texel + channel_offsets(params.first_plane),
        texel + channel_offsets(params.first_plane + 1u),
    );
}
"#;

#[pollster::test]
#[ignore] // Requires GPU
async fn test_double_plane_pass_writes_both_attachments() {
    let runtime = runtime().await;
    let input_shape = TensorShape::new(4, 4, 4);
    let shape = TensorShape::new(4, 4, 16);
    let mode = MrtMode::DoublePlane;

    let mut graph = InferenceGraph::new("double", vec![input_shape])
        .with_model_type(ModelType::Detection)
        .with_options(GraphOptions {
            mrt_mode: mode,
            ..Default::default()
        });
    let mut layer = Layer::new("wide", LayerKind::Conv2D, shape)
        .with_input(LayerInput::with_shape(BufferRef::ModelInput(0), input_shape));
    for k in 0..pass_count(shape.channels, mode) {
        let planes = pass_planes(k, shape.channels, mode);
        assert_eq!(planes.len(), 2);
        layer = layer.with_pass(
            Pass::rasterization(DOUBLE_PLANE_WGSL, "fs_main", planes.start, planes.len() as u32)
                .with_input(0, 0)
                .with_uniform(1, planes.start.to_le_bytes().to_vec()),
        );
    }
    graph.push_layer(layer);

    let mut core = runtime.create_core(CreationParameters::new(graph)).unwrap();
    assert_eq!(core.stages()[0].passes().len(), 2);

    let input = pattern_tensor(input_shape);
    let mut run = RunParameters::new(vec![MixedLayerInput::FloatVector(input.data.clone())]);
    core.run(&mut run).unwrap();

    let expected = HostTensor::from_fn(shape, |x, y, c| input.get(x, y, c % 4) + 100.0 * c as f32);
    let actual = HostTensor::new(shape, run.output[0].clone()).unwrap();
    assert_close(&actual, &expected, 1e-4);

    // Every plane was rendered, not only the first attachment of each pass.
    let planar = core.stage_buffer(0).unwrap().read_planar(runtime.device(), runtime.queue()).unwrap();
    let expected_planar = expected.to_planar();
    for plane in 0..shape.planes() {
        for (a, b) in planar.plane(plane).iter().zip(expected_planar.plane(plane)) {
            assert!((a - b).abs() < 1e-4, "plane {plane}: {a} != {b}");
        }
    }
}

#[pollster::test]
#[ignore] // Requires GPU
async fn test_quad_plane_f32_targets_exceeding_limits_are_rejected() {
    let runtime = runtime().await;
    let limits = runtime.device().limits();
    if check_target_formats(&[TensorFormat::Rgba32Float; 4], &limits).is_complete() {
        eprintln!("Skipping test: device accepts four rgba32float targets");
        return;
    }

    let source = r#"
struct Out {
    @location(0) p0: vec4<f32>,
    @location(1) p1: vec4<f32>,
    @location(2) p2: vec4<f32>,
    @location(3) p3: vec4<f32>,
}

@fragment
fn fs_main(@builtin(position) pos: vec4<f32>) -> Out {
    return Out(vec4<f32>(0.0), vec4<f32>(1.0), vec4<f32>(2.0), vec4<f32>(3.0));
}
"#;
    let shape = TensorShape::new(4, 4, 16);
    let mut graph = InferenceGraph::new("quad", vec![TensorShape::new(4, 4, 4)]).with_options(GraphOptions {
        mrt_mode: MrtMode::QuadPlane,
        ..Default::default()
    });
    graph.push_layer(
        Layer::new("wide", LayerKind::Conv2D, shape)
            .with_input(LayerInput::new(BufferRef::ModelInput(0)))
            .with_pass(Pass::rasterization(source, "fs_main", 0, 4)),
    );

    let result = runtime.create_core(CreationParameters::new(graph));
    let err = result.err().expect("construction must fail");
    assert!(matches!(err, InferenceError::IncompleteTarget { .. }), "got {err}");
    assert!(!err.is_retryable());
}

#[pollster::test]
#[ignore] // Requires GPU
async fn test_invalid_run_parameters() {
    let runtime = runtime().await;
    let input_shape = TensorShape::new(8, 8, 3);
    let graph = conv_graph(input_shape, &conv_params(3, 4, 1));
    let mut core = runtime.create_core(CreationParameters::new(graph)).unwrap();

    let mut no_inputs = RunParameters::default();
    let err = core.run(&mut no_inputs).unwrap_err();
    assert!(matches!(err, InferenceError::InvalidRunParameters(_)));
    assert!(!err.is_retryable());

    let input = pattern_tensor(input_shape);
    let mut no_output = RunParameters::new(vec![MixedLayerInput::FloatVector(input.data.clone())]);
    assert!(matches!(
        core.run(&mut no_output),
        Err(InferenceError::InvalidRunParameters(_))
    ));

    let mut short_input = RunParameters::new(vec![MixedLayerInput::FloatVector(vec![0.0; 5])]);
    assert!(matches!(
        core.run(&mut short_input),
        Err(InferenceError::InvalidRunParameters(_))
    ));
}

#[pollster::test]
#[ignore] // Requires GPU
async fn test_write_time_stat_accumulates_series() {
    let runtime = runtime().await;
    let input_shape = TensorShape::new(8, 8, 3);
    let params = conv_params(3, 8, 3);
    let mut core = runtime
        .create_core(CreationParameters::new(conv_graph(input_shape, &params)))
        .unwrap();
    let output_buffer = DeviceTensorBuffer::new(
        runtime.device(),
        "output",
        TensorShape::new(8, 8, 8),
        TensorFormat::Rgba32Float,
    )
    .unwrap();
    let input = pattern_tensor(input_shape);

    let mut stats = TimeStats::new();
    for _ in 0..3 {
        let mut run = RunParameters::new(vec![MixedLayerInput::FloatVector(input.data.clone())])
            .with_output_buffer(output_buffer.clone());
        core.run(&mut run).unwrap();
        core.write_time_stat(&mut stats);
    }

    assert_eq!(stats["conv_8x8x3_8x8x8"].len(), 3);
    assert_eq!(stats["Total GPU runtime"].len(), 3);
    assert_eq!(stats["Total CPU runtime"].len(), 3);
    assert!(stats["Total CPU runtime"].iter().all(|ms| *ms > 0.0));
    assert!(core.timing_report().contains("conv_8x8x3_8x8x8"));
}

#[pollster::test]
#[ignore] // Requires GPU
async fn test_cpu_stage_time_excludes_input_readback() {
    let runtime = runtime().await;
    let shape = TensorShape::new(64, 64, 8);
    let mut graph = InferenceGraph::new("readback", vec![shape]).with_model_type(ModelType::Detection);
    graph.push_layer(relu_layer("relu", BufferRef::ModelInput(0), shape));
    graph.push_layer(
        Layer::new("flatten", LayerKind::Flatten, TensorShape::new(1, 1, shape.element_count() as u32))
            .with_input(LayerInput::new(BufferRef::StageOutput(0)))
            .with_cpu_program(CpuProgram::Flatten),
    );
    let mut core = runtime.create_core(CreationParameters::new(graph)).unwrap();
    assert_eq!(core.stages()[0].transition_timer_name(), None);
    let series = core.stages()[1].transition_timer_name().unwrap();
    assert_eq!(series, format!("{} transition", core.stages()[1].timer_name()));

    let input = pattern_tensor(shape);
    let mut stats = TimeStats::new();
    for _ in 0..2 {
        let mut run = RunParameters::new(vec![MixedLayerInput::FloatVector(input.data.clone())]);
        core.run(&mut run).unwrap();
        core.write_time_stat(&mut stats);

        let flatten = &core.stages()[1];
        assert!(flatten.transition_ms() > 0.0);
        assert_eq!(core.stages()[0].transition_ms(), 0.0);
        let total = stats["Total CPU runtime"].last().copied().unwrap();
        assert!(flatten.elapsed_ms() + flatten.transition_ms() <= total);
    }
    assert_eq!(stats[&series].len(), 2);
    assert_eq!(stats[core.stages()[1].timer_name()].len(), 2);
}

#[pollster::test]
#[ignore] // Requires GPU
async fn test_debug_dumps() {
    let runtime = runtime().await;
    let dir = tempfile::tempdir().unwrap();
    let input_shape = TensorShape::new(4, 4, 3);
    let params = conv_params(3, 8, 3);

    let mut graph = conv_graph(input_shape, &params).with_model_type(ModelType::Classification);
    graph.push_layer(
        Layer::new("flatten", LayerKind::Flatten, TensorShape::new(1, 1, 128))
            .with_input(LayerInput::new(BufferRef::StageOutput(0)))
            .with_cpu_program(CpuProgram::Flatten),
    );

    let mut core = runtime
        .create_core(CreationParameters::new(graph).with_dumps(dir.path()))
        .unwrap();
    assert!(dir.path().join("kernels/conv pass[0].wgsl").exists());
    assert!(dir.path().join("kernels/conv pass[1].wgsl").exists());

    let input = pattern_tensor(input_shape);
    let mut run = RunParameters::new(vec![MixedLayerInput::FloatVector(input.data.clone())]);
    core.run(&mut run).unwrap();

    // Stage output and inputs are named after the last pass.
    let conv = load_dump(dir.path().join("conv pass[1].dump"), None).unwrap().to_host();
    assert_close(&conv, &reference_conv2d(&input, &params), 1e-4);
    assert!(!dir.path().join("conv pass[0].dump").exists());

    let dumped_input = load_dump(dir.path().join("conv pass[1]_input.dump"), None).unwrap().to_host();
    assert_eq!(dumped_input, input);

    // Two weights per pass: pass 0 writes _0 and _1, pass 1 writes _2 and _3.
    let weights = load_dump(dir.path().join("weights/conv pass[0]_0.dump"), None).unwrap();
    assert_eq!(&weights.data[..8], &params.weights[..8]);
    let bias = load_dump(dir.path().join("weights/conv pass[1]_3.dump"), None).unwrap();
    assert_eq!(&bias.data[..8], params.bias.as_slice());

    let text = std::fs::read_to_string(dir.path().join("flatten cpu layer.txt")).unwrap();
    assert_eq!(text.lines().count(), 1);
    let line = text.lines().next().unwrap();
    assert!(line.ends_with(", "));
    assert_eq!(line.split_terminator(", ").count(), 128);
}

#[pollster::test]
#[ignore] // Requires GPU
async fn test_single_pass_with_host_inputs() {
    let runtime = runtime().await;
    let input_shape = TensorShape::new(8, 8, 3);
    let params = conv_params(3, 8, 3);
    let mut core = runtime
        .create_core(CreationParameters::new(conv_graph(input_shape, &params)))
        .unwrap();

    let input = pattern_tensor(input_shape);
    let expected = reference_conv2d(&input, &params);
    let mut ctx = lumen_runtime::BinderContext::new();

    let pass = core.pass_mut(0, 1).unwrap();
    pass.run_with_float_vectors(std::slice::from_ref(&input), &mut ctx).unwrap();
    assert_eq!(ctx.current(), None);

    // Only plane 1 (channels 4..8) is written by the second pass.
    let planar = pass.texture_data_out().unwrap();
    let expected_planar = expected.to_planar();
    for (a, b) in planar.plane(1).iter().zip(expected_planar.plane(1)) {
        assert!((a - b).abs() < 1e-4, "{a} != {b}");
    }
    assert!(core.pass_mut(0, 2).is_none());
}

#[pollster::test]
#[ignore] // Requires GPU
async fn test_pass_reruns_with_bound_inputs() {
    let runtime = runtime().await;
    let input_shape = TensorShape::new(8, 8, 3);
    let params = conv_params(3, 4, 3);
    let mut core = runtime
        .create_core(CreationParameters::new(conv_graph(input_shape, &params)))
        .unwrap();
    let mut ctx = lumen_runtime::BinderContext::new();

    let pass = core.pass_mut(0, 0).unwrap();
    assert!(matches!(
        pass.run_bound(&mut ctx),
        Err(InferenceError::InvalidRunParameters(_))
    ));

    let input = pattern_tensor(input_shape);
    pass.run_with_float_vectors(std::slice::from_ref(&input), &mut ctx).unwrap();
    let first = pass.get_output().unwrap();

    pass.run_bound(&mut ctx).unwrap();
    assert_eq!(pass.get_output().unwrap(), first);
    assert_close(&first, &reference_conv2d(&input, &params), 1e-4);
}
