//! Render passes: one compiled kernel bound to its resources.
//!
//! A pass is built once from a [`Pass`] descriptor. Weights, uniforms,
//! samplers, the debug buffer and the output are bound at construction;
//! only the input tensors may change between calls, in which case the
//! bind group is rebuilt.

use crate::binder::{BinderContext, RenderTargetBinder};
use crate::device_buffer::{DeviceTensorBuffer, TensorFormat};
use crate::error::{InferenceError, Result};
use crate::reflect::{ReflectedBinding, reflect_bindings};
use crate::resources::{FULLSCREEN_ENTRY, SharedResources};
use lumen_core::{HostTensor, InputBinding, Pass, PassProgram, PlanarTensor, TensorShape, WeightResource};
use std::borrow::Cow;
use std::path::Path;
use std::sync::Arc;
use wgpu::util::DeviceExt;

/// Timestamp slots a pass writes, if any.
#[derive(Clone, Copy)]
pub(crate) struct PassTimestamps<'a> {
    pub query_set: &'a wgpu::QuerySet,
    pub begin: Option<u32>,
    pub end: Option<u32>,
}

/// Device handles and shared resources needed to build passes.
pub(crate) struct PassBuilder<'a> {
    pub device: &'a Arc<wgpu::Device>,
    pub queue: &'a Arc<wgpu::Queue>,
    pub shared: &'a SharedResources,
    /// Keep host copies of weights for dumping.
    pub keep_weights: bool,
}

enum PassKind {
    Rasterization {
        pipeline: wgpu::RenderPipeline,
        binder: RenderTargetBinder,
    },
    Compute {
        pipeline: wgpu::ComputePipeline,
        dispatch: [u32; 3],
    },
}

/// Resource bound at construction time.
enum FixedResource {
    Buffer(wgpu::Buffer),
    Sampler(wgpu::Sampler),
    View(wgpu::TextureView),
}

struct BoundInputs {
    buffers: Vec<DeviceTensorBuffer>,
    group: wgpu::BindGroup,
}

/// One GPU kernel of a stage.
pub struct RenderPass {
    label: String,
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    kind: PassKind,
    layout: wgpu::BindGroupLayout,
    fixed: Vec<(u32, FixedResource)>,
    inputs: Vec<InputBinding>,
    output: DeviceTensorBuffer,
    bound: Option<BoundInputs>,
    weights: Vec<(u32, WeightResource)>,
}

impl RenderPass {
    /// Build a pass writing into `output`.
    ///
    /// # Arguments
    /// * `builder` - Device and shared resources
    /// * `label` - Name used for GPU objects and dump files
    /// * `pass` - Descriptor from the inference graph
    /// * `module` - Compiled kernel for `pass`
    /// * `output` - Stage output buffer
    ///
    /// # Errors
    /// Fails when a kernel binding has no resource, the entry point is
    /// missing, or the render target is incomplete.
    pub(crate) fn new(
        builder: &PassBuilder<'_>,
        label: &str,
        pass: &Pass,
        module: &naga::Module,
        output: &DeviceTensorBuffer,
    ) -> Result<Self> {
        let device = builder.device;

        if !module.entry_points.iter().any(|ep| ep.name == pass.entry_point) {
            return Err(InferenceError::construction(
                label,
                format!("entry point '{}' not found", pass.entry_point),
            ));
        }

        let visibility = match pass.program {
            PassProgram::Rasterization { .. } => wgpu::ShaderStages::FRAGMENT,
            PassProgram::Compute { .. } => wgpu::ShaderStages::COMPUTE,
        };
        let reflected = reflect_bindings(module, label)?;
        let entries: Vec<_> = reflected
            .iter()
            .map(|b| wgpu::BindGroupLayoutEntry {
                binding: b.binding,
                visibility,
                ty: b.ty,
                count: None,
            })
            .collect();
        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(&format!("{label}_layout")),
            entries: &entries,
        });

        let fixed = Self::create_fixed_resources(builder, label, pass, &reflected, output)?;

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(&format!("{label}_pipeline_layout")),
            bind_group_layouts: &[&layout],
            immediate_size: 0,
        });
        let shader_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(label),
            source: wgpu::ShaderSource::Naga(Cow::Owned(module.clone())),
        });

        let kind = match pass.program {
            PassProgram::Rasterization {
                output_slice_index,
                output_slice_count,
            } => {
                let mut binder = RenderTargetBinder::new(format!("{label}_target"));
                binder.attach(output, output_slice_index, output_slice_count)?;
                if let Err(e) = binder.ensure_complete(&device.limits()) {
                    tracing::error!(pass = label, shape = %output.shape(), "{e}");
                    return Err(e);
                }
                let targets = binder.color_targets();

                let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                    label: Some(label),
                    layout: Some(&pipeline_layout),
                    vertex: wgpu::VertexState {
                        module: &builder.shared.fullscreen,
                        entry_point: Some(FULLSCREEN_ENTRY),
                        compilation_options: Default::default(),
                        buffers: &[],
                    },
                    primitive: wgpu::PrimitiveState::default(),
                    depth_stencil: None,
                    multisample: wgpu::MultisampleState::default(),
                    fragment: Some(wgpu::FragmentState {
                        module: &shader_module,
                        entry_point: Some(&pass.entry_point),
                        compilation_options: Default::default(),
                        targets: &targets,
                    }),
                    multiview_mask: None,
                    cache: None,
                });
                PassKind::Rasterization { pipeline, binder }
            }
            PassProgram::Compute { dispatch } => {
                let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some(label),
                    layout: Some(&pipeline_layout),
                    module: &shader_module,
                    entry_point: Some(&pass.entry_point),
                    compilation_options: Default::default(),
                    cache: None,
                });
                PassKind::Compute { pipeline, dispatch }
            }
        };

        let weights = if builder.keep_weights {
            pass.weights
                .iter()
                .map(|w| (w.binding, w.resource.clone()))
                .collect()
        } else {
            Vec::new()
        };

        Ok(Self {
            label: label.to_string(),
            device: Arc::clone(builder.device),
            queue: Arc::clone(builder.queue),
            kind,
            layout,
            fixed,
            inputs: pass.inputs.clone(),
            output: output.clone(),
            bound: None,
            weights,
        })
    }

    /// Resolve every reflected binding except the per-call inputs.
    fn create_fixed_resources(
        builder: &PassBuilder<'_>,
        label: &str,
        pass: &Pass,
        reflected: &[ReflectedBinding],
        output: &DeviceTensorBuffer,
    ) -> Result<Vec<(u32, FixedResource)>> {
        let device = builder.device;
        let mut fixed = Vec::new();

        for b in reflected {
            let binding = b.binding;
            if pass.inputs.iter().any(|i| i.binding == binding) {
                if !matches!(b.ty, wgpu::BindingType::Texture { .. }) {
                    return Err(InferenceError::construction(
                        label,
                        format!("input binding {binding} is not a sampled texture"),
                    ));
                }
                continue;
            }

            let resource = if let Some(weight) = pass.weights.iter().find(|w| w.binding == binding) {
                Self::create_weight(builder, label, binding, &weight.resource)?
            } else if let Some(uniform) = pass.uniforms.iter().find(|u| u.binding == binding) {
                // Uniform bindings must be a multiple of 16 bytes.
                let mut data = uniform.data.clone();
                data.resize(data.len().max(16).next_multiple_of(16), 0);
                FixedResource::Buffer(device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some(&format!("{label}_uniform{binding}")),
                    contents: &data,
                    usage: wgpu::BufferUsages::UNIFORM,
                }))
            } else if let Some(sampler) = pass.samplers.iter().find(|s| s.binding == binding) {
                FixedResource::Sampler(builder.shared.sampler(sampler.kind).clone())
            } else if pass.debug_binding == Some(binding) {
                FixedResource::Buffer(builder.shared.debug_buffer.clone())
            } else if pass.output_binding == Some(binding) {
                if let wgpu::BindingType::StorageTexture { format, .. } = b.ty
                    && format != output.format().texture_format()
                {
                    return Err(InferenceError::construction(
                        label,
                        format!(
                            "kernel writes {format:?} but the output is {:?}",
                            output.format()
                        ),
                    ));
                }
                FixedResource::View(output.array_view())
            } else {
                return Err(InferenceError::construction(
                    label,
                    format!("binding {binding} has no resource"),
                ));
            };
            fixed.push((binding, resource));
        }

        Ok(fixed)
    }

    fn create_weight(
        builder: &PassBuilder<'_>,
        label: &str,
        binding: u32,
        resource: &WeightResource,
    ) -> Result<FixedResource> {
        let device = builder.device;
        let name = format!("{label}_weight{binding}");
        match resource {
            WeightResource::Texture {
                width,
                height,
                layers,
                data,
            } => {
                let shape = TensorShape::new(*width, *height, layers * 4);
                let planar = PlanarTensor::from_raw(shape, data.clone())?;
                let texture = DeviceTensorBuffer::from_planar(
                    device,
                    builder.queue,
                    &name,
                    &planar,
                    TensorFormat::Rgba32Float,
                )?;
                Ok(FixedResource::View(texture.array_view()))
            }
            WeightResource::Storage(data) | WeightResource::Uniform(data) => {
                let usage = if matches!(resource, WeightResource::Uniform(_)) {
                    wgpu::BufferUsages::UNIFORM
                } else {
                    wgpu::BufferUsages::STORAGE
                };
                let mut padded = data.clone();
                padded.resize(padded.len().max(4).next_multiple_of(4), 0.0);
                Ok(FixedResource::Buffer(device.create_buffer_init(
                    &wgpu::util::BufferInitDescriptor {
                        label: Some(&name),
                        contents: bytemuck::cast_slice(&padded),
                        usage,
                    },
                )))
            }
        }
    }

    /// Rebuild the bind group if the input buffers changed since last call.
    fn bind_inputs(&mut self, inputs: &[&DeviceTensorBuffer]) -> Result<()> {
        for binding in &self.inputs {
            if binding.input >= inputs.len() {
                return Err(InferenceError::InvalidRunParameters(format!(
                    "pass '{}' binds input {} but {} were supplied",
                    self.label,
                    binding.input,
                    inputs.len()
                )));
            }
        }

        let unchanged = self.bound.as_ref().is_some_and(|b| {
            b.buffers.len() == inputs.len()
                && b.buffers.iter().zip(inputs).all(|(a, b)| a.handle() == b.handle())
        });
        if unchanged {
            return Ok(());
        }

        let input_views: Vec<(u32, wgpu::TextureView)> = self
            .inputs
            .iter()
            .map(|b| (b.binding, inputs[b.input].array_view()))
            .collect();

        let mut entries: Vec<wgpu::BindGroupEntry<'_>> = Vec::new();
        for (binding, view) in &input_views {
            entries.push(wgpu::BindGroupEntry {
                binding: *binding,
                resource: wgpu::BindingResource::TextureView(view),
            });
        }
        for (binding, resource) in &self.fixed {
            let resource = match resource {
                FixedResource::Buffer(buffer) => buffer.as_entire_binding(),
                FixedResource::Sampler(sampler) => wgpu::BindingResource::Sampler(sampler),
                FixedResource::View(view) => wgpu::BindingResource::TextureView(view),
            };
            entries.push(wgpu::BindGroupEntry {
                binding: *binding,
                resource,
            });
        }

        let group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(&format!("{}_bind_group", self.label)),
            layout: &self.layout,
            entries: &entries,
        });
        tracing::trace!(pass = %self.label, "rebuilt bind group");

        self.bound = Some(BoundInputs {
            buffers: inputs.iter().map(|b| (*b).clone()).collect(),
            group,
        });
        Ok(())
    }

    /// Record this pass into `encoder`.
    pub(crate) fn encode(
        &mut self,
        encoder: &mut wgpu::CommandEncoder,
        inputs: &[&DeviceTensorBuffer],
        ctx: &mut BinderContext,
        timestamps: Option<PassTimestamps<'_>>,
    ) -> Result<()> {
        self.bind_inputs(inputs)?;
        let Some(bound) = self.bound.as_ref() else {
            return Err(InferenceError::InvalidRunParameters(format!(
                "pass '{}' has no bound inputs",
                self.label
            )));
        };

        match &self.kind {
            PassKind::Rasterization { pipeline, binder } => {
                let attachments = binder.bind(ctx);
                {
                    let mut rpass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                        label: Some(&self.label),
                        color_attachments: &attachments,
                        timestamp_writes: timestamps.map(|t| wgpu::RenderPassTimestampWrites {
                            query_set: t.query_set,
                            beginning_of_pass_write_index: t.begin,
                            end_of_pass_write_index: t.end,
                        }),
                        ..Default::default()
                    });
                    rpass.set_pipeline(pipeline);
                    rpass.set_bind_group(0, &bound.group, &[]);
                    rpass.draw(0..3, 0..1);
                }
                binder.unbind(ctx);
            }
            PassKind::Compute { pipeline, dispatch } => {
                let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some(&self.label),
                    timestamp_writes: timestamps.map(|t| wgpu::ComputePassTimestampWrites {
                        query_set: t.query_set,
                        beginning_of_pass_write_index: t.begin,
                        end_of_pass_write_index: t.end,
                    }),
                });
                cpass.set_pipeline(pipeline);
                cpass.set_bind_group(0, &bound.group, &[]);
                cpass.dispatch_workgroups(dispatch[0], dispatch[1], dispatch[2]);
            }
        }
        Ok(())
    }

    /// Execute the pass once against `inputs` and submit it.
    pub fn run(&mut self, inputs: &[&DeviceTensorBuffer], ctx: &mut BinderContext) -> Result<()> {
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(&self.label),
            });
        self.encode(&mut encoder, inputs, ctx, None)?;
        self.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    /// Execute the pass again against the inputs bound by the last call.
    ///
    /// # Errors
    /// Fails when the pass has never been run.
    pub fn run_bound(&mut self, ctx: &mut BinderContext) -> Result<()> {
        let buffers = self.bound.as_ref().map(|b| b.buffers.clone()).ok_or_else(|| {
            InferenceError::InvalidRunParameters(format!("pass '{}' has no bound inputs", self.label))
        })?;
        let refs: Vec<&DeviceTensorBuffer> = buffers.iter().collect();
        self.run(&refs, ctx)
    }

    /// Execute with host images uploaded in place of the normal inputs.
    pub fn run_with_images(&mut self, inputs: &[PlanarTensor], ctx: &mut BinderContext) -> Result<()> {
        let buffers = inputs
            .iter()
            .enumerate()
            .map(|(i, tensor)| {
                DeviceTensorBuffer::from_planar(
                    &self.device,
                    &self.queue,
                    &format!("{}_host_input{i}", self.label),
                    tensor,
                    TensorFormat::Rgba32Float,
                )
            })
            .collect::<Result<Vec<_>>>()?;
        let refs: Vec<&DeviceTensorBuffer> = buffers.iter().collect();
        self.run(&refs, ctx)
    }

    /// Execute with HWC float tensors uploaded in place of the normal inputs.
    pub fn run_with_float_vectors(
        &mut self,
        inputs: &[HostTensor],
        ctx: &mut BinderContext,
    ) -> Result<()> {
        let planar: Vec<PlanarTensor> = inputs.iter().map(HostTensor::to_planar).collect();
        self.run_with_images(&planar, ctx)
    }

    /// Read the output buffer back in HWC order. Synchronizes with the device.
    pub fn get_output(&self) -> Result<HostTensor> {
        Ok(self.texture_data_out()?.to_host())
    }

    /// Read the output buffer back in plane layout. Synchronizes with the device.
    pub fn texture_data_out(&self) -> Result<PlanarTensor> {
        self.output.read_planar(&self.device, &self.queue)
    }

    /// Write the output buffer to a dump file.
    pub fn dump_outputs(&self, path: impl AsRef<Path>) -> Result<()> {
        lumen_core::save_dump(path, &self.texture_data_out()?)?;
        Ok(())
    }

    /// Write the inputs bound by the last run. The first goes to
    /// `<dir>/<label>_input.dump`, input `K > 0` to `<label>_input<K>.dump`.
    pub fn dump_inputs(&self, dir: impl AsRef<Path>) -> Result<usize> {
        let Some(bound) = &self.bound else {
            return Ok(0);
        };
        for (k, buffer) in bound.buffers.iter().enumerate() {
            let file = match k {
                0 => format!("{}_input.dump", self.label),
                k => format!("{}_input{k}.dump", self.label),
            };
            lumen_core::save_dump(dir.as_ref().join(file), &buffer.read_planar(&self.device, &self.queue)?)?;
        }
        Ok(bound.buffers.len())
    }

    /// Write weight `i` of pass `pass_index` of its layer to
    /// `<dir>/weights/<label>_<n>.dump` with `n = weights_per_pass * pass_index + i`.
    ///
    /// Only available when the core was built with dumping enabled;
    /// otherwise nothing is written.
    pub fn debug_pass_weights(&self, dir: impl AsRef<Path>, pass_index: usize) -> Result<usize> {
        let per_pass = self.weights.len();
        for (i, (_, resource)) in self.weights.iter().enumerate() {
            let tensor = match resource {
                WeightResource::Texture {
                    width,
                    height,
                    layers,
                    data,
                } => PlanarTensor::from_raw(TensorShape::new(*width, *height, layers * 4), data.clone())?,
                WeightResource::Storage(data) | WeightResource::Uniform(data) => {
                    let width = (data.len() as u32).div_ceil(4).max(1);
                    let mut padded = data.clone();
                    padded.resize(width as usize * 4, 0.0);
                    PlanarTensor::from_raw(TensorShape::new(width, 1, 4), padded)?
                }
            };
            let n = per_pass * pass_index + i;
            let path = dir
                .as_ref()
                .join("weights")
                .join(format!("{}_{n}.dump", self.label));
            lumen_core::save_dump(path, &tensor)?;
        }
        Ok(per_pass)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_compute(&self) -> bool {
        matches!(self.kind, PassKind::Compute { .. })
    }

    pub fn output(&self) -> &DeviceTensorBuffer {
        &self.output
    }
}
