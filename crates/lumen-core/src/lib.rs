//! Device-independent half of the lumen mixed inference core.
//!
//! This crate holds everything that can be decided and tested without a GPU:
//! - The inference graph contract (`InferenceGraph`, `Layer`, `Pass`)
//! - Multiple-render-target channel packing (`pass_count`, `pass_index`)
//! - Stage planning: backend assignment and transitions (`plan_stages`)
//! - Host tensor layouts and the binary dump format
//! - Host-side layer programs for CPU stages
//! - WGSL composition with shader defs
//! - Timing statistics

pub mod cpu;
pub mod dump;
pub mod error;
pub mod graph;
pub mod layout;
pub mod packing;
pub mod plan;
pub mod shader;
pub mod timing;

// Re-export commonly used types
pub use cpu::{Activation, CpuProgram, argmax};
pub use dump::{DumpHeader, load_dump, read_dump, save_dump, write_dump};
pub use error::{GraphError, Result};
pub use graph::{
    BufferRef, GraphOptions, InferenceGraph, InputBinding, Layer, LayerInput, LayerKind,
    ModelType, Pass, PassProgram, SamplerBinding, SamplerKind, TensorShape, UniformBinding,
    WeightAccessMethod, WeightBinding, WeightResource,
};
pub use layout::{HostTensor, PlanarTensor};
pub use packing::{MrtMode, pass_count, pass_index, pass_planes, plane_count};
pub use plan::{Backend, PassSelection, StagePlan, Transition, map_transition, plan_stages};
pub use shader::{ShaderCache, compile_wgsl};
pub use timing::{TimeStats, TimingSummary};
