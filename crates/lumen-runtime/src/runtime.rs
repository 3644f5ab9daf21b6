//! Runtime initialization and GPU device management.

use crate::inference_core::{CreationParameters, MixedInferenceCore};
use crate::error::{DeviceError, InferenceError, Result};
use std::sync::Arc;

/// Device selection options.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub power_preference: wgpu::PowerPreference,
    /// Request timestamp queries for per-stage GPU timing when the adapter
    /// has them. Without them stages are timed with the wall clock.
    pub timestamps: bool,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            power_preference: wgpu::PowerPreference::HighPerformance,
            timestamps: true,
        }
    }
}

/// Main entry point for GPU execution.
///
/// Owns the device and queue that every [`MixedInferenceCore`] built from
/// it shares. All work for one device must be issued from one thread.
///
/// # Example
/// ```no_run
/// # use lumen_runtime::{CreationParameters, Runtime};
/// # use lumen_core::InferenceGraph;
/// # fn graph() -> InferenceGraph { unimplemented!() }
/// #[pollster::main]
/// async fn main() -> anyhow::Result<()> {
///     let runtime = Runtime::new().await?;
///     let _core = runtime.create_core(CreationParameters::new(graph()))?;
///     // core.run(&mut params)? once per frame
///     Ok(())
/// }
/// ```
pub struct Runtime {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    adapter_info: wgpu::AdapterInfo,
}

impl Runtime {
    /// Initialize the runtime with the default GPU adapter.
    ///
    /// # Errors
    /// Returns an error if no suitable GPU is found or initialization fails.
    pub async fn new() -> Result<Self> {
        Self::with_options(RuntimeOptions::default()).await
    }

    /// Initialize the runtime with explicit device options.
    ///
    /// # Errors
    /// Returns an error if no suitable GPU is found or initialization fails.
    pub async fn with_options(options: RuntimeOptions) -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: options.power_preference,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|e| {
                InferenceError::Init(format!("Failed to find suitable GPU adapter: {e}"))
            })?;

        Self::with_adapter(&adapter, &options).await
    }

    /// Initialize the runtime with a specific GPU adapter.
    ///
    /// Optional features (timestamp queries, clamp-to-border addressing)
    /// are enabled only when the adapter supports them.
    ///
    /// # Errors
    /// Returns an error if device initialization fails.
    pub async fn with_adapter(adapter: &wgpu::Adapter, options: &RuntimeOptions) -> Result<Self> {
        let adapter_info = adapter.get_info();

        let mut wanted = wgpu::Features::ADDRESS_MODE_CLAMP_TO_BORDER;
        if options.timestamps {
            wanted |= wgpu::Features::TIMESTAMP_QUERY;
        }
        let required_features = adapter.features() & wanted;

        let device_desc = wgpu::DeviceDescriptor {
            label: Some("lumen"),
            required_features,
            required_limits: adapter.limits(),
            ..Default::default()
        };

        let (device, queue) = adapter
            .request_device(&device_desc)
            .await
            .map_err(|e| InferenceError::Init(format!("Failed to create device: {e}")))?;

        tracing::info!(
            adapter = %adapter_info.name,
            backend = ?adapter_info.backend,
            features = ?required_features,
            "GPU runtime initialized"
        );

        Ok(Self {
            device: Arc::new(device),
            queue: Arc::new(queue),
            adapter_info,
        })
    }

    /// Build a mixed inference core for one model and input resolution.
    ///
    /// # Errors
    /// Returns the first construction error; see [`MixedInferenceCore::create`].
    pub fn create_core(&self, params: CreationParameters) -> Result<MixedInferenceCore> {
        MixedInferenceCore::create(Arc::clone(&self.device), Arc::clone(&self.queue), params)
    }

    /// Get information about the GPU adapter.
    pub fn adapter_info(&self) -> &wgpu::AdapterInfo {
        &self.adapter_info
    }

    /// Get a reference to the device.
    pub fn device(&self) -> &Arc<wgpu::Device> {
        &self.device
    }

    /// Get a reference to the queue.
    pub fn queue(&self) -> &Arc<wgpu::Queue> {
        &self.queue
    }
}

/// Captures device errors raised while it is open instead of letting them
/// reach the uncaptured-error handler.
///
/// The scope holds no borrow of the device, so the code it wraps may
/// borrow the owner of the device mutably.
pub(crate) struct ErrorScope {
    // Push order: out of memory, validation, internal.
    guards: [wgpu::ErrorScopeGuard; 3],
}

impl ErrorScope {
    pub fn open(device: &wgpu::Device) -> Self {
        Self {
            guards: [
                device.push_error_scope(wgpu::ErrorFilter::OutOfMemory),
                device.push_error_scope(wgpu::ErrorFilter::Validation),
                device.push_error_scope(wgpu::ErrorFilter::Internal),
            ],
        }
    }

    /// Close the scope, returning the first captured error.
    pub fn close(self) -> std::result::Result<(), DeviceError> {
        let [out_of_memory, validation, internal] = self.guards;
        let internal = pollster::block_on(internal.pop());
        let validation = pollster::block_on(validation.pop());
        let out_of_memory = pollster::block_on(out_of_memory.pop());
        match out_of_memory.or(validation).or(internal) {
            Some(error) => Err(error.into()),
            None => Ok(()),
        }
    }
}

/// Block until all submitted work has finished.
pub(crate) fn wait_idle(device: &wgpu::Device) -> std::result::Result<(), DeviceError> {
    device.poll(wgpu::PollType::Wait {
        submission_index: None,
        timeout: None,
    })?;
    Ok(())
}
