//! Error types for graph validation, dumps and host-side layers.

use thiserror::Error;

/// Errors raised while validating an inference graph or handling host data.
///
/// Everything in this enum is a property of the model or of the files it
/// was given, so none of these are worth retrying.
#[derive(Debug, Error)]
pub enum GraphError {
    /// The graph contains no layers.
    #[error("Inference graph '{0}' has no layers")]
    EmptyGraph(String),

    /// Layer type tag not known to the engine.
    #[error("Unsupported layer type: {0}")]
    UnsupportedLayer(String),

    /// Graph option value not recognized.
    #[error("Invalid graph option: {0}")]
    InvalidOption(String),

    /// A layer references a model input or stage output that does not exist.
    #[error("Invalid buffer reference: {0}")]
    InvalidReference(String),

    /// Declared and actual tensor shapes disagree.
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Pass list does not follow the channel packing rule.
    #[error("Pass count mismatch: {0}")]
    PassCount(String),

    /// Weight bindings disagree with the graph's weight access method.
    #[error("Weight access mismatch: {0}")]
    WeightAccess(String),

    /// Layer must run on the host but carries no host program.
    #[error("Missing CPU program for layer '{0}'")]
    MissingCpuProgram(String),

    /// Host-side layer could not be evaluated.
    #[error("CPU layer failed: {0}")]
    CpuLayer(String),

    /// WGSL source failed to compose or validate.
    #[error("Shader compilation failed: {0}")]
    ShaderCompilation(String),

    /// Malformed dump header or payload.
    #[error("Invalid dump: {0}")]
    Dump(String),

    /// Underlying file I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Specialized Result type for graph and host operations.
pub type Result<T> = std::result::Result<T, GraphError>;
