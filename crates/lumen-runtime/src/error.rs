//! Error types for the runtime crate.

use lumen_core::GraphError;
use thiserror::Error;

/// Errors reported by the device itself.
///
/// These are per-frame conditions: a caller may drop the frame and try
/// again on the next one.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("out of device memory")]
    OutOfMemory,

    #[error("validation error: {0}")]
    Validation(String),

    #[error("internal device error: {0}")]
    Internal(String),

    /// Waiting for the queue failed, usually because the device was lost.
    #[error("device poll failed: {0}")]
    Poll(String),
}

/// Inference engine errors.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// GPU initialization failed.
    #[error("GPU initialization failed: {0}")]
    Init(String),

    /// A stage could not be built from its layer.
    #[error("Failed to construct stage '{layer}': {reason}")]
    Construction { layer: String, reason: String },

    /// Render-target binding is incomplete.
    #[error("Render target '{label}' is incomplete: {reason}")]
    IncompleteTarget { label: String, reason: String },

    /// Run parameters do not match the model.
    #[error("Invalid run parameters: {0}")]
    InvalidRunParameters(String),

    /// Device reported an error.
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    /// Reading a buffer back to host memory failed.
    #[error("Read-back failed: {0}")]
    Readback(String),

    /// Buffer mapping failed.
    #[error("Buffer async error: {0}")]
    BufferAsync(#[from] wgpu::BufferAsyncError),

    /// Graph, dump or host layer error.
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl InferenceError {
    /// Whether the failure is transient and the next frame may succeed.
    ///
    /// Construction errors and contract violations are never retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            InferenceError::Device(_) | InferenceError::BufferAsync(_) | InferenceError::Readback(_)
        )
    }

    pub(crate) fn construction(layer: &str, reason: impl Into<String>) -> Self {
        InferenceError::Construction {
            layer: layer.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<wgpu::Error> for DeviceError {
    fn from(error: wgpu::Error) -> Self {
        match error {
            wgpu::Error::OutOfMemory { .. } => DeviceError::OutOfMemory,
            wgpu::Error::Validation { description, .. } => DeviceError::Validation(description),
            wgpu::Error::Internal { description, .. } => DeviceError::Internal(description),
            #[allow(unreachable_patterns)]
            _ => DeviceError::Internal(error.to_string()),
        }
    }
}

impl From<wgpu::PollError> for DeviceError {
    fn from(error: wgpu::PollError) -> Self {
        DeviceError::Poll(error.to_string())
    }
}

/// Specialized Result type for runtime operations.
pub type Result<T> = std::result::Result<T, InferenceError>;
