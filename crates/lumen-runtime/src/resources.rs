//! Resources shared by every pass of a core.

use crate::error::{InferenceError, Result};
use lumen_core::SamplerKind;
use std::borrow::Cow;
use std::collections::HashMap;

/// Size of the debug read-back buffer in bytes.
pub const DEBUG_BUFFER_SIZE: u64 = 16 * 1024;

/// Entry point of the full-screen vertex shader.
pub(crate) const FULLSCREEN_ENTRY: &str = "vs_main";

/// Full-screen triangle. Fragment kernels address texels through
/// `@builtin(position)`; `uv` is provided for kernels that sample.
const FULLSCREEN_WGSL: &str = r#"
struct VertexOutput {
    @builtin(position) position: vec4<f32>,
    @location(0) uv: vec2<f32>,
}

@vertex
fn vs_main(@builtin(vertex_index) index: u32) -> VertexOutput {
    let corner = vec2<f32>(f32((index << 1u) & 2u), f32(index & 2u));
    var out: VertexOutput;
    out.position = vec4<f32>(corner * 2.0 - 1.0, 0.0, 1.0);
    out.uv = vec2<f32>(corner.x, 1.0 - corner.y);
    return out;
}
"#;

/// Samplers, debug buffer and vertex stage owned by one core.
pub struct SharedResources {
    pub input_sampler: wgpu::Sampler,
    pub weight_sampler: wgpu::Sampler,
    pub debug_buffer: wgpu::Buffer,
    pub(crate) fullscreen: wgpu::ShaderModule,
}

impl SharedResources {
    pub fn new(device: &wgpu::Device) -> Result<Self> {
        let border = device
            .features()
            .contains(wgpu::Features::ADDRESS_MODE_CLAMP_TO_BORDER);
        let (input_mode, border_color) = if border {
            (
                wgpu::AddressMode::ClampToBorder,
                Some(wgpu::SamplerBorderColor::TransparentBlack),
            )
        } else {
            tracing::debug!("clamp-to-border unavailable, input sampler clamps to edge");
            (wgpu::AddressMode::ClampToEdge, None)
        };

        let input_sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("input_sampler"),
            address_mode_u: input_mode,
            address_mode_v: input_mode,
            address_mode_w: input_mode,
            mag_filter: wgpu::FilterMode::Nearest,
            min_filter: wgpu::FilterMode::Nearest,
            border_color,
            ..Default::default()
        });
        let weight_sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("weight_sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Nearest,
            min_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let debug_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("debug_buffer"),
            size: DEBUG_BUFFER_SIZE,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let module = lumen_core::compile_wgsl("fullscreen", FULLSCREEN_WGSL, &HashMap::new())
            .map_err(|e| InferenceError::Init(format!("fullscreen vertex shader: {e}")))?;
        let fullscreen = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("fullscreen"),
            source: wgpu::ShaderSource::Naga(Cow::Owned(module)),
        });

        Ok(Self {
            input_sampler,
            weight_sampler,
            debug_buffer,
            fullscreen,
        })
    }

    pub fn sampler(&self, kind: SamplerKind) -> &wgpu::Sampler {
        match kind {
            SamplerKind::Input => &self.input_sampler,
            SamplerKind::Weight => &self.weight_sampler,
        }
    }
}
