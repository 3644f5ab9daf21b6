//! Render stages and the tensor slots they exchange data through.

use crate::binder::BinderContext;
use crate::device_buffer::{DeviceTensorBuffer, TensorFormat};
use crate::error::{InferenceError, Result};
use crate::render_pass::{PassTimestamps, RenderPass};
use crate::runtime::wait_idle;
use crate::timer::{CpuTimer, GpuTimestamps};
use lumen_core::{Backend, CpuProgram, GraphError, HostTensor, LayerKind, PlanarTensor, TensorShape, Transition};
use std::sync::Arc;
use std::time::Instant;

/// Device handles plus the command encoder being recorded for this run.
pub(crate) struct Frame {
    pub device: Arc<wgpu::Device>,
    pub queue: Arc<wgpu::Queue>,
    encoder: Option<wgpu::CommandEncoder>,
}

impl Frame {
    pub fn new(device: &Arc<wgpu::Device>, queue: &Arc<wgpu::Queue>) -> Self {
        Self {
            device: Arc::clone(device),
            queue: Arc::clone(queue),
            encoder: None,
        }
    }

    /// Encoder for GPU work, created on first use.
    pub fn encoder(&mut self) -> &mut wgpu::CommandEncoder {
        let device = &self.device;
        self.encoder.get_or_insert_with(|| {
            device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("inference_frame"),
            })
        })
    }

    /// Submit everything recorded so far.
    pub fn flush(&mut self) {
        if let Some(encoder) = self.encoder.take() {
            self.queue.submit(std::iter::once(encoder.finish()));
        }
    }
}

/// Current contents of one model input or stage output.
///
/// A tensor may be valid on the device, on the host, or both. Reading it
/// on the other side performs the backend transition.
pub(crate) struct TensorSlot {
    pub name: String,
    pub shape: TensorShape,
    format: TensorFormat,
    device: Option<DeviceTensorBuffer>,
    host: Option<Vec<f32>>,
    /// Upload target owned by the slot, allocated on first upload.
    upload: Option<DeviceTensorBuffer>,
}

impl TensorSlot {
    pub fn new(name: impl Into<String>, shape: TensorShape, format: TensorFormat) -> Self {
        Self {
            name: name.into(),
            shape,
            format,
            device: None,
            host: None,
            upload: None,
        }
    }

    /// Forget the contents of the previous run.
    pub fn invalidate(&mut self) {
        self.device = None;
        self.host = None;
    }

    pub fn set_device(&mut self, buffer: DeviceTensorBuffer) {
        self.device = Some(buffer);
        self.host = None;
    }

    pub fn set_host(&mut self, data: Vec<f32>) {
        self.host = Some(data);
        self.device = None;
    }

    pub fn host(&self) -> Option<&[f32]> {
        self.host.as_deref()
    }

    pub fn device(&self) -> Option<&DeviceTensorBuffer> {
        self.device.as_ref()
    }

    /// Device copy of the tensor, uploading host data if needed.
    pub fn ensure_device(&mut self, frame: &Frame) -> Result<DeviceTensorBuffer> {
        if let Some(buffer) = &self.device {
            return Ok(buffer.clone());
        }
        let data = self.host.as_ref().ok_or_else(|| self.empty_error())?;
        let host = HostTensor::new(self.shape, data.clone())?;

        let upload = match &self.upload {
            Some(buffer) => buffer.clone(),
            None => {
                let buffer = DeviceTensorBuffer::new(
                    &frame.device,
                    &format!("{}_upload", self.name),
                    self.shape,
                    self.format,
                )?;
                self.upload = Some(buffer.clone());
                buffer
            }
        };
        upload.upload(&frame.queue, &host.to_planar())?;
        tracing::trace!(slot = %self.name, "uploaded host tensor");

        self.device = Some(upload.clone());
        Ok(upload)
    }

    /// Make the host copy valid, reading the device copy back if needed.
    /// Pending GPU work is submitted first.
    pub fn ensure_host(&mut self, frame: &mut Frame) -> Result<()> {
        if self.host.is_some() {
            return Ok(());
        }
        let buffer = self.device.as_ref().ok_or_else(|| self.empty_error())?;
        frame.flush();
        let planar = buffer.read_planar(&frame.device, &frame.queue)?;
        tracing::trace!(slot = %self.name, "read device tensor back");
        self.host = Some(planar.to_host().data);
        Ok(())
    }

    /// Host copy in plane layout, for dumps.
    pub fn read_planar(&self, frame: &Frame) -> Result<PlanarTensor> {
        match (&self.host, &self.device) {
            (Some(data), _) => Ok(HostTensor::new(self.shape, data.clone())?.to_planar()),
            (None, Some(buffer)) => buffer.read_planar(&frame.device, &frame.queue),
            (None, None) => Err(self.empty_error()),
        }
    }

    fn empty_error(&self) -> InferenceError {
        InferenceError::InvalidRunParameters(format!("tensor '{}' was not produced", self.name))
    }
}

/// What a stage executes.
pub enum StageWork {
    Gpu { passes: Vec<RenderPass> },
    Cpu { program: CpuProgram },
}

/// Runtime unit for one layer.
pub struct RenderStage {
    pub(crate) name: String,
    pub(crate) kind: LayerKind,
    pub(crate) layer: usize,
    pub(crate) work: StageWork,
    pub(crate) transition: Transition,
    /// Slot indices of the layer inputs, in layer order.
    pub(crate) input_slots: Vec<usize>,
    pub(crate) output_slot: usize,
    pub(crate) input_shapes: Vec<TensorShape>,
    pub(crate) output_shape: TensorShape,
    pub(crate) timer_name: String,
    /// Index among GPU stages, used for timestamp query slots.
    pub(crate) gpu_index: Option<usize>,
    pub(crate) timer: CpuTimer,
    pub(crate) elapsed_ms: f64,
    /// Time a CPU stage spent making its inputs host resident.
    pub(crate) transition_ms: f64,
}

impl RenderStage {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> LayerKind {
        self.kind
    }

    pub fn layer(&self) -> usize {
        self.layer
    }

    pub fn backend(&self) -> Backend {
        match self.work {
            StageWork::Gpu { .. } => Backend::Gpu,
            StageWork::Cpu { .. } => Backend::Cpu,
        }
    }

    pub fn transition(&self) -> Transition {
        self.transition
    }

    pub fn passes(&self) -> &[RenderPass] {
        match &self.work {
            StageWork::Gpu { passes } => passes,
            StageWork::Cpu { .. } => &[],
        }
    }

    pub fn output_shape(&self) -> TensorShape {
        self.output_shape
    }

    pub fn timer_name(&self) -> &str {
        &self.timer_name
    }

    /// Duration of the last run in milliseconds.
    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed_ms
    }

    /// Input read-back time of the last run in milliseconds. Zero for GPU
    /// stages.
    pub fn transition_ms(&self) -> f64 {
        self.transition_ms
    }

    /// Series name of the read-back time, for stages reading GPU results
    /// on the host.
    pub fn transition_timer_name(&self) -> Option<String> {
        (self.transition == Transition::GpuToCpu).then(|| format!("{} transition", self.timer_name))
    }

    /// Execute the stage, reading from and writing to `slots`.
    ///
    /// With `timestamps` the GPU passes are only recorded and the caller
    /// reads the timing after the frame completes; otherwise GPU work is
    /// submitted and waited for here so the wall clock covers it.
    pub(crate) fn run(
        &mut self,
        frame: &mut Frame,
        ctx: &mut BinderContext,
        slots: &mut [TensorSlot],
        timestamps: Option<&GpuTimestamps>,
    ) -> Result<()> {
        let (earlier, rest) = slots.split_at_mut(self.output_slot);
        let Some(output) = rest.first_mut() else {
            return Err(InferenceError::construction(&self.name, "output slot out of range"));
        };

        match &mut self.work {
            StageWork::Gpu { passes } => {
                let inputs = self
                    .input_slots
                    .iter()
                    .map(|&i| earlier[i].ensure_device(frame))
                    .collect::<Result<Vec<_>>>()?;
                let refs: Vec<&DeviceTensorBuffer> = inputs.iter().collect();

                let queries = match (timestamps, self.gpu_index) {
                    (Some(ts), Some(index)) => Some((ts.query_set(), GpuTimestamps::slots(index))),
                    _ => None,
                };
                if queries.is_none() {
                    frame.flush();
                    wait_idle(&frame.device)?;
                    self.timer.start();
                }

                let last = passes.len().saturating_sub(1);
                for (k, pass) in passes.iter_mut().enumerate() {
                    let pass_ts = queries.map(|(query_set, (begin, end))| PassTimestamps {
                        query_set,
                        begin: (k == 0).then_some(begin),
                        end: (k == last).then_some(end),
                    });
                    pass.encode(frame.encoder(), &refs, ctx, pass_ts)?;
                }

                if queries.is_none() {
                    frame.flush();
                    wait_idle(&frame.device)?;
                    self.elapsed_ms = self.timer.stop();
                }

                let produced = passes
                    .first()
                    .map(|p| p.output().clone())
                    .ok_or_else(|| InferenceError::construction(&self.name, "GPU stage without passes"))?;
                output.set_device(produced);
            }
            StageWork::Cpu { program } => {
                // Read-back waits for earlier GPU stages and is timed separately.
                let transfer = Instant::now();
                for &i in &self.input_slots {
                    earlier[i].ensure_host(frame)?;
                }
                self.transition_ms = transfer.elapsed().as_secs_f64() * 1000.0;

                self.timer.start();
                let inputs: Vec<&[f32]> = self
                    .input_slots
                    .iter()
                    .filter_map(|&i| earlier[i].host())
                    .collect();

                let result = program.execute(&inputs)?;
                if result.len() != self.output_shape.element_count() {
                    return Err(GraphError::CpuLayer(format!(
                        "layer '{}' produced {} values for output {}",
                        self.name,
                        result.len(),
                        self.output_shape
                    ))
                    .into());
                }
                output.set_host(result);
                self.elapsed_ms = self.timer.stop();
            }
        }
        Ok(())
    }
}
