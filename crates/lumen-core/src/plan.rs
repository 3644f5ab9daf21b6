//! Stage planning.
//!
//! Everything the engine decides about a graph before it touches a device:
//! which backend each layer runs on, where backend transitions happen,
//! which pass list is used, and whether the pass list obeys the channel
//! packing rule. Errors here mean the graph is defective.

use crate::error::{GraphError, Result};
use crate::graph::{BufferRef, InferenceGraph, Layer, Pass, PassProgram, TensorShape, WeightAccessMethod};
use crate::packing::{pass_count, pass_planes};
use crate::timing::stage_timer_name;
use std::fmt;

/// Where a stage executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    /// GPU passes; rasterization and compute both count as GPU.
    Gpu,
    /// Host program.
    Cpu,
}

/// Data copy required before a stage because its backend differs from
/// the previous stage's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Transition {
    #[default]
    None,
    GpuToCpu,
    CpuToGpu,
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Transition::None => "NONE",
            Transition::GpuToCpu => "GPU_TO_CPU",
            Transition::CpuToGpu => "CPU_TO_GPU",
        })
    }
}

/// Transition between a stage running on `previous` and one on `current`.
///
/// The first stage (`previous == None`) never transitions.
pub fn map_transition(previous: Option<Backend>, current: Backend) -> Transition {
    match (previous, current) {
        (Some(Backend::Gpu), Backend::Cpu) => Transition::GpuToCpu,
        (Some(Backend::Cpu), Backend::Gpu) => Transition::CpuToGpu,
        _ => Transition::None,
    }
}

/// Which pass list of a GPU layer is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassSelection {
    /// `Layer::passes`.
    Primary,
    /// `Layer::compute_passes`.
    Compute,
}

/// Construction decisions for one layer.
#[derive(Debug, Clone, PartialEq)]
pub struct StagePlan {
    pub layer: usize,
    pub backend: Backend,
    pub transition: Transition,
    pub inputs: Vec<BufferRef>,
    pub input_shapes: Vec<TensorShape>,
    pub output: TensorShape,
    /// `None` for CPU stages.
    pub passes: Option<PassSelection>,
    pub timer_name: String,
}

impl StagePlan {
    /// The passes this plan selected from `layer`.
    pub fn selected_passes<'a>(&self, layer: &'a Layer) -> &'a [Pass] {
        match self.passes {
            Some(PassSelection::Primary) => &layer.passes,
            Some(PassSelection::Compute) => &layer.compute_passes,
            None => &[],
        }
    }
}

/// Plan every stage of `graph`.
///
/// # Errors
/// - [`GraphError::EmptyGraph`] for a graph without layers
/// - [`GraphError::InvalidReference`] for an input that is not a model input
///   or an earlier layer
/// - [`GraphError::ShapeMismatch`] when a declared input shape differs
/// - [`GraphError::MissingCpuProgram`] for host layers without a program
/// - [`GraphError::PassCount`] for pass lists that break the packing rule
/// - [`GraphError::WeightAccess`] for weight bindings the weight access
///   method does not allow
pub fn plan_stages(graph: &InferenceGraph) -> Result<Vec<StagePlan>> {
    if graph.layers.is_empty() {
        return Err(GraphError::EmptyGraph(graph.name.clone()));
    }

    let mut plans: Vec<StagePlan> = Vec::with_capacity(graph.layers.len());
    for (index, layer) in graph.layers.iter().enumerate() {
        let input_shapes = resolve_inputs(graph, index, layer)?;

        let (backend, passes) = if layer.runs_on_cpu() {
            if layer.cpu_program.is_none() {
                return Err(GraphError::MissingCpuProgram(layer.name.clone()));
            }
            (Backend::Cpu, None)
        } else {
            (Backend::Gpu, Some(select_passes(graph, layer)?))
        };

        let previous = plans.last().map(|p| p.backend);
        let input_shape = input_shapes.first().copied().unwrap_or(layer.output);
        plans.push(StagePlan {
            layer: index,
            backend,
            transition: map_transition(previous, backend),
            inputs: layer.inputs.iter().map(|i| i.source).collect(),
            input_shapes,
            output: layer.output,
            passes,
            timer_name: stage_timer_name(&layer.name, input_shape, layer.output),
        });
    }

    Ok(plans)
}

fn resolve_inputs(graph: &InferenceGraph, index: usize, layer: &Layer) -> Result<Vec<TensorShape>> {
    layer
        .inputs
        .iter()
        .map(|input| {
            let valid = match input.source {
                BufferRef::ModelInput(i) => i < graph.inputs.len(),
                BufferRef::StageOutput(i) => i < index,
            };
            let shape = graph.shape_of(input.source).filter(|_| valid).ok_or_else(|| {
                GraphError::InvalidReference(format!(
                    "layer '{}' (#{index}) reads {}",
                    layer.name, input.source
                ))
            })?;

            if let Some(expected) = input.expected
                && expected != shape
            {
                return Err(GraphError::ShapeMismatch(format!(
                    "layer '{}' expects {expected} from {}, which produces {shape}",
                    layer.name, input.source
                )));
            }
            Ok(shape)
        })
        .collect()
}

fn select_passes(graph: &InferenceGraph, layer: &Layer) -> Result<PassSelection> {
    let selection = if !layer.compute_passes.is_empty()
        && (graph.options.compute || layer.passes.is_empty())
    {
        PassSelection::Compute
    } else {
        PassSelection::Primary
    };
    let passes = match selection {
        PassSelection::Primary => &layer.passes,
        PassSelection::Compute => &layer.compute_passes,
    };

    if passes.is_empty() {
        return Err(GraphError::PassCount(format!(
            "GPU layer '{}' ({}) has no passes",
            layer.name, layer.output
        )));
    }

    for pass in passes.iter() {
        for binding in &pass.inputs {
            if binding.input >= layer.inputs.len() {
                return Err(GraphError::InvalidReference(format!(
                    "layer '{}' binds input {} but has {} inputs",
                    layer.name,
                    binding.input,
                    layer.inputs.len()
                )));
            }
        }
    }

    for pass in passes.iter() {
        check_weight_access(graph.options.weight_access, layer, pass)?;
    }

    if passes.iter().all(|p| !p.is_compute()) {
        check_packing(graph, layer, passes)?;
    }
    Ok(selection)
}

/// With [`WeightAccessMethod::Constants`] weights live in the kernel source
/// and no pass may bind any. With [`WeightAccessMethod::Textures`] every
/// weight needs a binding of its own.
fn check_weight_access(method: WeightAccessMethod, layer: &Layer, pass: &Pass) -> Result<()> {
    match method {
        WeightAccessMethod::Constants => {
            if let Some(weight) = pass.weights.first() {
                return Err(GraphError::WeightAccess(format!(
                    "layer '{}' binds weights at binding {} but weights are compiled in as constants",
                    layer.name, weight.binding
                )));
            }
        }
        WeightAccessMethod::Textures => {
            let mut taken: Vec<u32> = pass.inputs.iter().map(|i| i.binding).collect();
            taken.extend(pass.uniforms.iter().map(|u| u.binding));
            taken.extend(pass.samplers.iter().map(|s| s.binding));
            taken.extend(pass.debug_binding);
            taken.extend(pass.output_binding);
            for weight in &pass.weights {
                if taken.contains(&weight.binding) {
                    return Err(GraphError::WeightAccess(format!(
                        "layer '{}' binds a weight at binding {} which is already in use",
                        layer.name, weight.binding
                    )));
                }
                taken.push(weight.binding);
            }
        }
    }
    Ok(())
}

/// Rasterization passes must match `pass_count` and write exactly the
/// planes `pass_planes` assigns them.
fn check_packing(graph: &InferenceGraph, layer: &Layer, passes: &[Pass]) -> Result<()> {
    let mode = graph.options.mrt_mode;
    let expected = pass_count(layer.output.channels, mode);
    if passes.len() as u32 != expected {
        return Err(GraphError::PassCount(format!(
            "layer '{}' ({}) has {} passes, {mode} needs {expected}",
            layer.name,
            layer.output,
            passes.len()
        )));
    }

    for (k, pass) in passes.iter().enumerate() {
        let planes = pass_planes(k as u32, layer.output.channels, mode);
        if let PassProgram::Rasterization {
            output_slice_index,
            output_slice_count,
        } = pass.program
            && (output_slice_index != planes.start || output_slice_count != planes.len() as u32)
        {
            return Err(GraphError::PassCount(format!(
                "layer '{}' pass {k} writes planes {output_slice_index}..{}, expected {}..{}",
                layer.name,
                output_slice_index + output_slice_count,
                planes.start,
                planes.end
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::CpuProgram;
    use crate::graph::{GraphOptions, LayerInput, LayerKind, WeightResource};
    use crate::packing::MrtMode;

    fn raster_passes(channels: u32, mode: MrtMode) -> Vec<Pass> {
        (0..pass_count(channels, mode))
            .map(|k| {
                let planes = pass_planes(k, channels, mode);
                Pass::rasterization("", "fs_main", planes.start, planes.len() as u32).with_input(0, 0)
            })
            .collect()
    }

    fn gpu_layer(name: &str, source: BufferRef, shape: TensorShape, mode: MrtMode) -> Layer {
        let mut layer = Layer::new(name, LayerKind::Conv2D, shape).with_input(LayerInput::new(source));
        layer.passes = raster_passes(shape.channels, mode);
        layer
    }

    fn classifier_graph() -> InferenceGraph {
        let mut graph = InferenceGraph::new("classifier", vec![TensorShape::new(8, 8, 3)]);
        graph.push_layer(gpu_layer(
            "conv",
            BufferRef::ModelInput(0),
            TensorShape::new(4, 4, 8),
            MrtMode::SinglePlane,
        ));
        graph.push_layer(
            Layer::new("flatten", LayerKind::Flatten, TensorShape::new(1, 1, 128))
                .with_input(LayerInput::new(BufferRef::StageOutput(0)))
                .with_cpu_program(CpuProgram::Flatten),
        );
        graph.push_layer(
            gpu_layer(
                "head",
                BufferRef::StageOutput(1),
                TensorShape::new(1, 1, 4),
                MrtMode::SinglePlane,
            ),
        );
        graph
    }

    #[test]
    fn test_backend_transitions() {
        assert_eq!(map_transition(None, Backend::Cpu), Transition::None);
        assert_eq!(map_transition(Some(Backend::Gpu), Backend::Gpu), Transition::None);
        assert_eq!(map_transition(Some(Backend::Gpu), Backend::Cpu), Transition::GpuToCpu);
        assert_eq!(map_transition(Some(Backend::Cpu), Backend::Gpu), Transition::CpuToGpu);
        assert_eq!(map_transition(Some(Backend::Cpu), Backend::Cpu), Transition::None);
    }

    #[test]
    fn test_plan_assigns_backends_and_transitions() {
        let plans = plan_stages(&classifier_graph()).unwrap();
        let summary: Vec<_> = plans.iter().map(|p| (p.backend, p.transition)).collect();
        assert_eq!(
            summary,
            vec![
                (Backend::Gpu, Transition::None),
                (Backend::Cpu, Transition::GpuToCpu),
                (Backend::Gpu, Transition::CpuToGpu),
            ]
        );
        assert_eq!(plans[0].timer_name, "conv_8x8x3_4x4x8");
        assert_eq!(plans[1].input_shapes, vec![TensorShape::new(4, 4, 8)]);
        assert_eq!(plans[1].passes, None);
    }

    #[test]
    fn test_pass_count_must_follow_mrt_mode() {
        let mut graph = InferenceGraph::new("g", vec![TensorShape::new(8, 8, 3)]);
        graph.options = GraphOptions {
            mrt_mode: MrtMode::DoublePlane,
            ..Default::default()
        };
        // Passes laid out for SINGLE_PLANE: 8 passes where DOUBLE_PLANE needs 4.
        graph.push_layer(gpu_layer(
            "conv",
            BufferRef::ModelInput(0),
            TensorShape::new(8, 8, 32),
            MrtMode::SinglePlane,
        ));
        assert!(matches!(plan_stages(&graph), Err(GraphError::PassCount(_))));

        graph.layers[0].passes = raster_passes(32, MrtMode::DoublePlane);
        let plans = plan_stages(&graph).unwrap();
        assert_eq!(plans[0].selected_passes(&graph.layers[0]).len(), 4);
    }

    #[test]
    fn test_pass_slices_must_match_packing() {
        let mut graph = InferenceGraph::new("g", vec![TensorShape::new(8, 8, 3)]);
        let mut layer = gpu_layer(
            "conv",
            BufferRef::ModelInput(0),
            TensorShape::new(8, 8, 8),
            MrtMode::SinglePlane,
        );
        layer.passes.swap(0, 1);
        graph.push_layer(layer);
        assert!(matches!(plan_stages(&graph), Err(GraphError::PassCount(_))));
    }

    #[test]
    fn test_invalid_references() {
        let mut graph = InferenceGraph::new("g", vec![TensorShape::new(8, 8, 3)]);
        graph.push_layer(gpu_layer(
            "self_loop",
            BufferRef::StageOutput(0),
            TensorShape::new(8, 8, 4),
            MrtMode::SinglePlane,
        ));
        assert!(matches!(plan_stages(&graph), Err(GraphError::InvalidReference(_))));

        graph.layers[0].inputs[0].source = BufferRef::ModelInput(2);
        assert!(matches!(plan_stages(&graph), Err(GraphError::InvalidReference(_))));
    }

    #[test]
    fn test_expected_shape_is_checked() {
        let mut graph = InferenceGraph::new("g", vec![TensorShape::new(8, 8, 3)]);
        let mut layer = gpu_layer(
            "conv",
            BufferRef::ModelInput(0),
            TensorShape::new(8, 8, 4),
            MrtMode::SinglePlane,
        );
        layer.inputs[0].expected = Some(TensorShape::new(8, 8, 4));
        graph.push_layer(layer);
        assert!(matches!(plan_stages(&graph), Err(GraphError::ShapeMismatch(_))));
    }

    fn weighted_graph(method: WeightAccessMethod) -> InferenceGraph {
        let mut graph = InferenceGraph::new("g", vec![TensorShape::new(8, 8, 3)]);
        graph.options.weight_access = method;
        let mut layer = gpu_layer(
            "conv",
            BufferRef::ModelInput(0),
            TensorShape::new(8, 8, 8),
            MrtMode::SinglePlane,
        );
        layer.passes = layer
            .passes
            .into_iter()
            .map(|p| p.with_weight(1, WeightResource::Storage(vec![0.5; 8])))
            .collect();
        graph.push_layer(layer);
        graph
    }

    #[test]
    fn test_constants_forbid_weight_bindings() {
        let graph = weighted_graph(WeightAccessMethod::Constants);
        assert!(matches!(plan_stages(&graph), Err(GraphError::WeightAccess(_))));

        // The same layer without bound weights is fine.
        let mut baked = graph.clone();
        for pass in &mut baked.layers[0].passes {
            pass.weights.clear();
        }
        assert!(plan_stages(&baked).is_ok());
    }

    #[test]
    fn test_textures_need_distinct_weight_bindings() {
        let graph = weighted_graph(WeightAccessMethod::Textures);
        assert_eq!(plan_stages(&graph).unwrap().len(), 1);

        // Binding 0 is the layer input.
        let mut clash = graph.clone();
        clash.layers[0].passes[1].weights[0].binding = 0;
        assert!(matches!(plan_stages(&clash), Err(GraphError::WeightAccess(_))));

        let mut twice = graph;
        let extra = twice.layers[0].passes[0].weights[0].clone();
        twice.layers[0].passes[0].weights.push(extra);
        assert!(matches!(plan_stages(&twice), Err(GraphError::WeightAccess(_))));
    }

    #[test]
    fn test_cpu_layer_requires_program() {
        let mut graph = InferenceGraph::new("g", vec![TensorShape::new(1, 1, 4)]);
        graph.push_layer(
            Layer::new("dense", LayerKind::Dense, TensorShape::new(1, 1, 2))
                .with_input(LayerInput::new(BufferRef::ModelInput(0))),
        );
        assert!(matches!(
            plan_stages(&graph),
            Err(GraphError::MissingCpuProgram(ref name)) if name == "dense"
        ));
    }

    #[test]
    fn test_compute_passes_are_preferred_when_requested() {
        let mut graph = InferenceGraph::new("g", vec![TensorShape::new(8, 8, 3)]);
        let layer = gpu_layer(
            "conv",
            BufferRef::ModelInput(0),
            TensorShape::new(8, 8, 8),
            MrtMode::SinglePlane,
        )
        .with_compute_pass(Pass::compute("", "cs_main", [1, 1, 2], 3).with_input(0, 0));
        graph.push_layer(layer);

        let plans = plan_stages(&graph).unwrap();
        assert_eq!(plans[0].passes, Some(PassSelection::Primary));

        graph.options.compute = true;
        let plans = plan_stages(&graph).unwrap();
        assert_eq!(plans[0].passes, Some(PassSelection::Compute));
    }

    #[test]
    fn test_empty_graph() {
        let graph = InferenceGraph::new("empty", vec![]);
        assert!(matches!(plan_stages(&graph), Err(GraphError::EmptyGraph(_))));
    }
}
