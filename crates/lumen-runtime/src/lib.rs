//! GPU execution engine for mixed GPU/CPU inference graphs.
//!
//! This crate runs the graphs described in `lumen-core` on the GPU using
//! `wgpu`, falling back to host programs for the layers that declare it.
//!
//! # Architecture
//!
//! 1. **GPU initialization** - [`Runtime`] sets up the device and queue
//! 2. **Tensors** - [`DeviceTensorBuffer`] stores a tensor as a texture array
//!    with one RGBA plane per four channels
//! 3. **Execution** - [`MixedInferenceCore`] owns one [`RenderStage`] per
//!    layer; GPU stages run [`RenderPass`]es, CPU stages run host programs,
//!    and tensors move between host and device where backends change
//!
//! # Example
//!
//! ```no_run
//! use lumen_core::{InferenceGraph, ModelType};
//! use lumen_runtime::{CreationParameters, MixedLayerInput, RunParameters, Runtime};
//!
//! # fn build_graph() -> InferenceGraph { unimplemented!() }
//! #[pollster::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = Runtime::new().await?;
//!     let graph = build_graph().with_model_type(ModelType::Classification);
//!     let mut core = runtime.create_core(CreationParameters::new(graph))?;
//!
//!     let shape = core.get_input_dims()[0];
//!     let pixels = vec![0.5f32; shape.element_count()];
//!     let mut params = RunParameters::new(vec![MixedLayerInput::FloatVector(pixels)]);
//!     core.run(&mut params)?;
//!
//!     println!("class: {}", params.model_output.classifier_output);
//!     Ok(())
//! }
//! ```

mod binder;
mod device_buffer;
mod error;
mod inference_core;
pub mod kernels;
mod reflect;
mod render_pass;
mod resources;
mod runtime;
mod stage;
mod timer;

// Public exports
pub use binder::{BinderContext, BinderId, RenderTargetBinder, TargetStatus, check_target_formats};
pub use device_buffer::{BufferHandle, DeviceTensorBuffer, TensorFormat};
pub use error::{DeviceError, InferenceError, Result};
pub use inference_core::{
    CreationParameters, DEFAULT_DUMP_DIR, MixedInferenceCore, MixedLayerInput, MixedLayerInputType,
    ModelOutput, RunParameters, pass_label,
};
pub use render_pass::RenderPass;
pub use resources::{DEBUG_BUFFER_SIZE, SharedResources};
pub use runtime::{Runtime, RuntimeOptions};
pub use stage::{RenderStage, StageWork};
pub use timer::CpuTimer;
