//! The mixed inference core: top-level scheduler over render stages.

use crate::binder::BinderContext;
use crate::device_buffer::{DeviceTensorBuffer, TensorFormat, map_and_read};
use crate::error::{InferenceError, Result};
use crate::render_pass::{PassBuilder, RenderPass};
use crate::resources::{DEBUG_BUFFER_SIZE, SharedResources};
use crate::runtime::{ErrorScope, wait_idle};
use crate::stage::{Frame, RenderStage, StageWork, TensorSlot};
use crate::timer::{CpuTimer, GpuTimestamps, span_ms};
use lumen_core::dump::write_text_rows;
use lumen_core::shader::HALF_PRECISION_DEF;
use lumen_core::timing::{TOTAL_CPU_TIMER, TOTAL_GPU_TIMER, format_summary_table};
use lumen_core::{
    Backend, BufferRef, GraphOptions, HostTensor, InferenceGraph, ModelType, ShaderCache,
    StagePlan, TensorShape, TimeStats, TimingSummary, argmax, plan_stages,
};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// Directory dumps are written to unless configured otherwise.
pub const DEFAULT_DUMP_DIR: &str = "inferenceCoreDump";

/// Everything needed to build a core.
#[derive(Debug, Clone)]
pub struct CreationParameters {
    pub graph: InferenceGraph,
    /// Requested output size. Zero takes the value from the graph; any
    /// other value must match it.
    pub output_width: u32,
    pub output_height: u32,
    pub output_depth: u32,
    /// Write kernels at construction and tensors after every run.
    pub dump_outputs: bool,
    pub dump_dir: PathBuf,
}

impl CreationParameters {
    pub fn new(graph: InferenceGraph) -> Self {
        Self {
            graph,
            output_width: 0,
            output_height: 0,
            output_depth: 0,
            dump_outputs: false,
            dump_dir: PathBuf::from(DEFAULT_DUMP_DIR),
        }
    }

    pub fn with_output_dims(mut self, width: u32, height: u32, depth: u32) -> Self {
        self.output_width = width;
        self.output_height = height;
        self.output_depth = depth;
        self
    }

    pub fn with_dumps(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dump_outputs = true;
        self.dump_dir = dir.into();
        self
    }
}

/// How a model input is supplied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixedLayerInputType {
    DeviceBuffer,
    FloatVector,
}

/// One model input for a run.
#[derive(Debug, Clone)]
pub enum MixedLayerInput {
    /// Tensor already on the device.
    DeviceBuffer(DeviceTensorBuffer),
    /// Host tensor in HWC order.
    FloatVector(Vec<f32>),
}

impl MixedLayerInput {
    pub fn input_type(&self) -> MixedLayerInputType {
        match self {
            MixedLayerInput::DeviceBuffer(_) => MixedLayerInputType::DeviceBuffer,
            MixedLayerInput::FloatVector(_) => MixedLayerInputType::FloatVector,
        }
    }
}

/// Scalar results of a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelOutput {
    pub model_type: ModelType,
    /// Winning class plus one; 0 when there is no result.
    pub classifier_output: usize,
    /// Final tensor split into rows of `channels` values.
    pub detection_output: Vec<Vec<f32>>,
}

/// Per-call inputs and outputs.
#[derive(Debug, Clone, Default)]
pub struct RunParameters {
    pub inputs: Vec<MixedLayerInput>,
    /// Required for image models; receives the final tensor.
    pub output_buffer: Option<DeviceTensorBuffer>,
    /// Host results in HWC order, filled for classification and detection models.
    pub output: Vec<Vec<f32>>,
    pub model_output: ModelOutput,
}

impl RunParameters {
    pub fn new(inputs: Vec<MixedLayerInput>) -> Self {
        Self {
            inputs,
            ..Default::default()
        }
    }

    pub fn with_output_buffer(mut self, buffer: DeviceTensorBuffer) -> Self {
        self.output_buffer = Some(buffer);
        self
    }
}

/// Runs an inference graph stage by stage on the GPU and the host.
///
/// Built once per model and resolution; `run` is then called once per
/// frame. Not safe for concurrent use.
pub struct MixedInferenceCore {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    name: String,
    model_type: ModelType,
    options: GraphOptions,
    input_shapes: Vec<TensorShape>,
    output_shape: TensorShape,
    intermediate_format: TensorFormat,
    stages: Vec<RenderStage>,
    /// Model inputs followed by one slot per stage output.
    slots: Vec<TensorSlot>,
    ctx: BinderContext,
    shared: SharedResources,
    timestamps: Option<GpuTimestamps>,
    dump_dir: Option<PathBuf>,
    last_gpu_ms: f64,
    last_cpu_ms: f64,
}

impl MixedInferenceCore {
    /// Build every stage, pass and shared resource for `params.graph`.
    ///
    /// # Errors
    /// Fails on the first defective layer: an invalid graph, a kernel that
    /// does not compile or bind, or an incomplete render target. Device
    /// errors raised while building are reported as well.
    #[tracing::instrument(skip_all, fields(model = %params.graph.name))]
    pub fn create(
        device: Arc<wgpu::Device>,
        queue: Arc<wgpu::Queue>,
        params: CreationParameters,
    ) -> Result<Self> {
        let start = Instant::now();

        let scope = ErrorScope::open(&device);
        let built = Self::build(Arc::clone(&device), queue, &params);
        let scoped = scope.close();

        let core = built.and_then(|core| scoped.map(|_| core).map_err(InferenceError::from));
        match &core {
            Ok(core) => tracing::info!(
                stages = core.stages.len(),
                mrt_mode = %core.options.mrt_mode,
                format = ?core.intermediate_format,
                timestamps = core.timestamps.is_some(),
                elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
                "inference core created"
            ),
            Err(e) => tracing::error!(error = %e, "failed to create inference core"),
        }
        core
    }

    fn build(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>, params: &CreationParameters) -> Result<Self> {
        let graph = &params.graph;
        let plans = plan_stages(graph)?;
        let output_shape = Self::resolve_output_shape(graph, params)?;

        let intermediate_format = if graph.options.prefer_half_precision {
            TensorFormat::Rgba16Float
        } else {
            TensorFormat::Rgba32Float
        };

        let mut slots: Vec<TensorSlot> = graph
            .inputs
            .iter()
            .enumerate()
            .map(|(i, shape)| TensorSlot::new(format!("input{i}"), *shape, TensorFormat::Rgba32Float))
            .collect();
        slots.extend(
            graph
                .layers
                .iter()
                .map(|layer| TensorSlot::new(layer.name.clone(), layer.output, intermediate_format)),
        );

        let shared = SharedResources::new(&device)?;
        let dump_dir = params.dump_outputs.then(|| params.dump_dir.clone());
        let builder = PassBuilder {
            device: &device,
            queue: &queue,
            shared: &shared,
            keep_weights: dump_dir.is_some(),
        };

        let mut cache = ShaderCache::new();
        let mut stages = Vec::with_capacity(plans.len());
        let mut gpu_stages = 0;
        for plan in &plans {
            let layer = &graph.layers[plan.layer];
            let stage = Self::build_stage(&builder, &mut cache, graph, plan, intermediate_format, dump_dir.as_deref())
                .inspect_err(|e| {
                    tracing::error!(layer = %layer.name, shape = %layer.output, error = %e, "stage construction failed");
                })?;

            let gpu_index = (plan.backend == Backend::Gpu).then(|| {
                gpu_stages += 1;
                gpu_stages - 1
            });
            tracing::debug!(
                layer = %layer.name,
                kind = %layer.kind.as_str(),
                backend = ?plan.backend,
                transition = %plan.transition,
                passes = stage.passes().len(),
                "built stage"
            );

            stages.push(RenderStage {
                name: layer.name.clone(),
                kind: layer.kind,
                layer: plan.layer,
                work: stage.work,
                transition: plan.transition,
                input_slots: plan.inputs.iter().map(|r| slot_index(graph, *r)).collect(),
                output_slot: graph.inputs.len() + plan.layer,
                input_shapes: plan.input_shapes.clone(),
                output_shape: plan.output,
                timer_name: plan.timer_name.clone(),
                gpu_index,
                timer: CpuTimer::new(),
                elapsed_ms: 0.0,
                transition_ms: 0.0,
            });
        }
        tracing::debug!(modules = cache.len(), hits = cache.hits(), "kernels compiled");

        let timestamps = GpuTimestamps::new(&device, &queue, gpu_stages);

        Ok(Self {
            device,
            queue,
            name: graph.name.clone(),
            model_type: graph.model_type,
            options: graph.options,
            input_shapes: graph.inputs.clone(),
            output_shape,
            intermediate_format,
            stages,
            slots,
            ctx: BinderContext::new(),
            shared,
            timestamps,
            dump_dir,
            last_gpu_ms: 0.0,
            last_cpu_ms: 0.0,
        })
    }

    fn resolve_output_shape(graph: &InferenceGraph, params: &CreationParameters) -> Result<TensorShape> {
        let shape = graph
            .output_shape()
            .ok_or_else(|| InferenceError::construction(&graph.name, "graph has no output"))?;
        let requested = [
            (params.output_width, shape.width),
            (params.output_height, shape.height),
            (params.output_depth, shape.channels),
        ];
        if requested.iter().any(|&(want, have)| want != 0 && want != have) {
            return Err(InferenceError::construction(
                &graph.name,
                format!(
                    "requested output {}x{}x{} but the graph produces {shape}",
                    params.output_width, params.output_height, params.output_depth
                ),
            ));
        }
        Ok(shape)
    }

    fn build_stage(
        builder: &PassBuilder<'_>,
        cache: &mut ShaderCache,
        graph: &InferenceGraph,
        plan: &StagePlan,
        format: TensorFormat,
        dump_dir: Option<&Path>,
    ) -> Result<BuiltStage> {
        let layer = &graph.layers[plan.layer];

        if plan.backend == Backend::Cpu {
            let program = layer
                .cpu_program
                .clone()
                .ok_or_else(|| lumen_core::GraphError::MissingCpuProgram(layer.name.clone()))?;
            return Ok(BuiltStage {
                work: StageWork::Cpu { program },
            });
        }

        let output = DeviceTensorBuffer::new(builder.device, &layer.name, layer.output, format)?;
        let mut passes = Vec::new();
        for (k, pass) in plan.selected_passes(layer).iter().enumerate() {
            let label = pass_label(&layer.name, k);
            let mut defines = pass.defines.clone();
            if graph.options.prefer_half_precision {
                defines.insert(HALF_PRECISION_DEF.to_string(), "true".to_string());
            }
            if let Some(dir) = dump_dir {
                dump_kernel(dir, &label, &pass.source);
            }

            let module = cache
                .get_or_compile(&label, &pass.source, &defines)
                .map_err(|e| InferenceError::construction(&layer.name, e.to_string()))?;
            passes.push(RenderPass::new(builder, &label, pass, module, &output)?);
        }

        Ok(BuiltStage {
            work: StageWork::Gpu { passes },
        })
    }

    /// Execute every stage once.
    ///
    /// # Errors
    /// Malformed parameters are reported before any work is issued. Device
    /// errors are returned as retryable [`InferenceError::Device`] values;
    /// the frame should be dropped.
    #[tracing::instrument(skip_all, fields(model = %self.name))]
    pub fn run(&mut self, params: &mut RunParameters) -> Result<()> {
        self.check_run_parameters(params)?;

        let scope = ErrorScope::open(&self.device);
        let result = self.execute(params);
        let scoped = scope.close();

        if let Err(e) = &result {
            tracing::warn!(error = %e, retryable = e.is_retryable(), "run failed");
        }
        result?;
        scoped?;
        Ok(())
    }

    fn check_run_parameters(&self, params: &RunParameters) -> Result<()> {
        if params.inputs.len() != self.input_shapes.len() {
            return Err(InferenceError::InvalidRunParameters(format!(
                "model takes {} inputs, {} supplied",
                self.input_shapes.len(),
                params.inputs.len()
            )));
        }
        for (i, (input, shape)) in params.inputs.iter().zip(&self.input_shapes).enumerate() {
            match input {
                MixedLayerInput::DeviceBuffer(buffer) if buffer.shape() != *shape => {
                    return Err(InferenceError::InvalidRunParameters(format!(
                        "input {i} is {}, model expects {shape}",
                        buffer.shape()
                    )));
                }
                MixedLayerInput::FloatVector(values) if values.len() != shape.element_count() => {
                    return Err(InferenceError::InvalidRunParameters(format!(
                        "input {i} has {} values, model expects {shape}",
                        values.len()
                    )));
                }
                _ => {}
            }
        }
        if self.model_type == ModelType::Image && params.output_buffer.is_none() {
            return Err(InferenceError::InvalidRunParameters(
                "image model run without an output buffer".to_string(),
            ));
        }
        Ok(())
    }

    fn execute(&mut self, params: &mut RunParameters) -> Result<()> {
        let wall = Instant::now();
        let mut frame = Frame::new(&self.device, &self.queue);
        frame
            .encoder()
            .clear_buffer(&self.shared.debug_buffer, 0, None);

        for slot in &mut self.slots {
            slot.invalidate();
        }
        for (slot, input) in self.slots.iter_mut().zip(&params.inputs) {
            match input {
                MixedLayerInput::DeviceBuffer(buffer) => slot.set_device(buffer.clone()),
                MixedLayerInput::FloatVector(values) => slot.set_host(values.clone()),
            }
        }

        let timestamps = self.timestamps.as_ref();
        for stage in &mut self.stages {
            stage.run(&mut frame, &mut self.ctx, &mut self.slots, timestamps)?;
        }

        self.deliver_output(&mut frame, params)?;

        let timestamps = self.timestamps.as_ref();
        if let Some(ts) = timestamps {
            ts.encode_resolve(frame.encoder());
        }
        frame.flush();
        wait_idle(&self.device)?;

        if let Some(ts) = timestamps {
            let ms = ts.read_ms(&self.device)?;
            for stage in &mut self.stages {
                if let Some(index) = stage.gpu_index {
                    let (begin, end) = GpuTimestamps::slots(index);
                    stage.elapsed_ms = span_ms(&ms, begin, end);
                }
            }
        }
        self.last_gpu_ms = self
            .stages
            .iter()
            .filter(|s| s.backend() == Backend::Gpu)
            .map(|s| s.elapsed_ms)
            .sum();
        self.last_cpu_ms = wall.elapsed().as_secs_f64() * 1000.0;

        if let Some(dir) = self.dump_dir.clone() {
            self.write_dumps(&frame, &dir);
            self.log_debug_buffer();
        }
        tracing::debug!(gpu_ms = self.last_gpu_ms, cpu_ms = self.last_cpu_ms, "run complete");
        Ok(())
    }

    fn deliver_output(&mut self, frame: &mut Frame, params: &mut RunParameters) -> Result<()> {
        let out = self
            .stages
            .last()
            .map(|s| s.output_slot)
            .ok_or_else(|| InferenceError::construction(&self.name, "no stages"))?;
        params.model_output.model_type = self.model_type;

        if self.model_type == ModelType::Image {
            let target = params.output_buffer.as_ref().ok_or_else(|| {
                InferenceError::InvalidRunParameters("image model run without an output buffer".to_string())
            })?;
            let produced = self.slots[out].ensure_device(frame)?;
            return produced.encode_copy_to(frame.encoder(), target);
        }

        self.slots[out].ensure_host(frame)?;
        let data = self.slots[out].host().map(<[f32]>::to_vec).unwrap_or_default();
        match self.model_type {
            ModelType::Classification => {
                params.model_output.classifier_output = argmax(&data).map_or(0, |i| i + 1);
            }
            ModelType::Detection => {
                let row = self.output_shape.channels.max(1) as usize;
                params.model_output.detection_output = data.chunks(row).map(<[f32]>::to_vec).collect();
            }
            ModelType::Image => {}
        }
        params.output = vec![data];
        Ok(())
    }

    fn write_dumps(&self, frame: &Frame, dir: &Path) {
        for stage in &self.stages {
            if let Err(e) = self.dump_stage(frame, dir, stage) {
                tracing::warn!(stage = stage.name(), error = %e, "failed to write dump");
            }
        }
    }

    fn dump_stage(&self, frame: &Frame, dir: &Path, stage: &RenderStage) -> Result<()> {
        let name = stage.name();
        let output = &self.slots[stage.output_slot];
        match &stage.work {
            StageWork::Gpu { passes } => {
                let Some(last) = passes.last() else {
                    return Ok(());
                };
                last.dump_inputs(dir)?;
                for (k, pass) in passes.iter().enumerate() {
                    pass.debug_pass_weights(dir, k)?;
                }
                lumen_core::save_dump(dir.join(format!("{}.dump", last.label())), &output.read_planar(frame)?)?;
            }
            StageWork::Cpu { .. } => {
                let values = output.read_planar(frame)?.to_host();
                std::fs::create_dir_all(dir)?;
                let file = File::create(dir.join(format!("{name} cpu layer.txt")))?;
                write_text_rows(BufWriter::new(file), &values.data, values.shape.channels as usize)?;
            }
        }
        Ok(())
    }

    fn log_debug_buffer(&self) {
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("debug_readback"),
            size: DEBUG_BUFFER_SIZE,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("debug_readback"),
            });
        encoder.copy_buffer_to_buffer(&self.shared.debug_buffer, 0, &staging, 0, DEBUG_BUFFER_SIZE);
        self.queue.submit(std::iter::once(encoder.finish()));

        match map_and_read(&self.device, &staging) {
            Ok(raw) => {
                let values: Vec<f32> = bytemuck::pod_collect_to_vec(&raw);
                let used = values.iter().rposition(|v| *v != 0.0).map_or(0, |i| i + 1);
                if used > 0 {
                    let head = &values[..used.min(16)];
                    tracing::debug!(used, ?head, "debug buffer");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to read debug buffer"),
        }
    }

    /// Append this run's timings to `stats`, one series per stage plus the
    /// totals.
    pub fn write_time_stat(&self, stats: &mut TimeStats) {
        for stage in &self.stages {
            stats
                .entry(stage.timer_name.clone())
                .or_default()
                .push(stage.elapsed_ms);
            if let Some(name) = stage.transition_timer_name() {
                stats.entry(name).or_default().push(stage.transition_ms);
            }
        }
        stats.entry(TOTAL_GPU_TIMER.to_string()).or_default().push(self.last_gpu_ms);
        stats.entry(TOTAL_CPU_TIMER.to_string()).or_default().push(self.last_cpu_ms);
    }

    /// Timings of the last run as a text table.
    pub fn timing_report(&self) -> String {
        let mut rows: Vec<(String, TimingSummary)> = self
            .stages
            .iter()
            .filter_map(|s| {
                TimingSummary::from_series(&[s.elapsed_ms], 0, 0).map(|t| (s.timer_name.clone(), t))
            })
            .collect();
        for (name, ms) in [(TOTAL_GPU_TIMER, self.last_gpu_ms), (TOTAL_CPU_TIMER, self.last_cpu_ms)] {
            if let Some(t) = TimingSummary::from_series(&[ms], 0, 0) {
                rows.push((name.to_string(), t));
            }
        }
        let report = format_summary_table(&rows);
        tracing::debug!("timing report:\n{report}");
        report
    }

    /// Shapes of the model inputs.
    pub fn get_input_dims(&self) -> &[TensorShape] {
        &self.input_shapes
    }

    /// Final tensor of the last run, in HWC order. Synchronizes with the device.
    pub fn get_output(&self) -> Result<HostTensor> {
        let slot = self
            .stages
            .last()
            .map(|s| &self.slots[s.output_slot])
            .ok_or_else(|| InferenceError::construction(&self.name, "no stages"))?;
        let frame = Frame::new(&self.device, &self.queue);
        Ok(slot.read_planar(&frame)?.to_host())
    }

    /// Output of stage `index` from the last run, in HWC order.
    pub fn stage_output(&self, index: usize) -> Result<HostTensor> {
        let stage = self.stages.get(index).ok_or_else(|| {
            InferenceError::InvalidRunParameters(format!("no stage {index}"))
        })?;
        let frame = Frame::new(&self.device, &self.queue);
        Ok(self.slots[stage.output_slot].read_planar(&frame)?.to_host())
    }

    /// Device buffer written by GPU stage `index`.
    pub fn stage_buffer(&self, index: usize) -> Option<&DeviceTensorBuffer> {
        self.stages.get(index)?.passes().first().map(RenderPass::output)
    }

    /// Pass `pass` of GPU stage `stage`, for running one kernel in isolation.
    pub fn pass_mut(&mut self, stage: usize, pass: usize) -> Option<&mut RenderPass> {
        match &mut self.stages.get_mut(stage)?.work {
            StageWork::Gpu { passes } => passes.get_mut(pass),
            StageWork::Cpu { .. } => None,
        }
    }

    pub fn output_shape(&self) -> TensorShape {
        self.output_shape
    }

    pub fn model_type(&self) -> ModelType {
        self.model_type
    }

    pub fn stages(&self) -> &[RenderStage] {
        &self.stages
    }

    /// Format of GPU stage outputs.
    pub fn intermediate_format(&self) -> TensorFormat {
        self.intermediate_format
    }

    pub fn binder_context(&self) -> &BinderContext {
        &self.ctx
    }

    pub fn device(&self) -> &Arc<wgpu::Device> {
        &self.device
    }

    pub fn queue(&self) -> &Arc<wgpu::Queue> {
        &self.queue
    }
}

struct BuiltStage {
    work: StageWork,
}

impl BuiltStage {
    fn passes(&self) -> &[RenderPass] {
        match &self.work {
            StageWork::Gpu { passes } => passes,
            StageWork::Cpu { .. } => &[],
        }
    }
}

fn slot_index(graph: &InferenceGraph, source: BufferRef) -> usize {
    match source {
        BufferRef::ModelInput(i) => i,
        BufferRef::StageOutput(j) => graph.inputs.len() + j,
    }
}

/// Name of pass `k` of `layer`, also the stem of its dump files.
pub fn pass_label(layer: &str, k: usize) -> String {
    format!("{layer} pass[{k}]")
}

fn dump_kernel(dir: &Path, label: &str, source: &str) {
    let path = dir.join("kernels").join(format!("{label}.wgsl"));
    let result = path
        .parent()
        .map_or(Ok(()), std::fs::create_dir_all)
        .and_then(|_| std::fs::write(&path, source));
    if let Err(e) = result {
        tracing::warn!(path = %path.display(), error = %e, "failed to dump kernel");
    }
}
