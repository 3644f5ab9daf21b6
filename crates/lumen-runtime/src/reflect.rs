//! Bind group layout reflection from naga modules.

use crate::error::{InferenceError, Result};

/// One resource binding declared by a kernel.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ReflectedBinding {
    pub binding: u32,
    pub ty: wgpu::BindingType,
}

/// Collect the group-0 bindings a module declares.
///
/// Textures are reported as non-filterable float textures and samplers as
/// non-filtering: tensors are always read with nearest sampling.
pub(crate) fn reflect_bindings(module: &naga::Module, label: &str) -> Result<Vec<ReflectedBinding>> {
    let mut bindings = Vec::new();

    for (_, var) in module.global_variables.iter() {
        let Some(resource) = var.binding.as_ref() else {
            continue;
        };
        if resource.group != 0 {
            return Err(InferenceError::construction(
                label,
                format!("binding {} uses group {}, only group 0 is bound", resource.binding, resource.group),
            ));
        }

        let ty = match var.space {
            naga::AddressSpace::Uniform => wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            naga::AddressSpace::Storage { access } => wgpu::BindingType::Buffer {
                // If STORE flag is not present, it's read-only
                ty: wgpu::BufferBindingType::Storage {
                    read_only: !access.contains(naga::StorageAccess::STORE),
                },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            naga::AddressSpace::Handle => handle_binding_type(&module.types[var.ty].inner)
                .ok_or_else(|| {
                    InferenceError::construction(
                        label,
                        format!("binding {} has an unsupported resource type", resource.binding),
                    )
                })?,
            other => {
                return Err(InferenceError::construction(
                    label,
                    format!("binding {} in unsupported address space {other:?}", resource.binding),
                ));
            }
        };

        bindings.push(ReflectedBinding {
            binding: resource.binding,
            ty,
        });
    }

    bindings.sort_by_key(|b| b.binding);
    Ok(bindings)
}

fn handle_binding_type(inner: &naga::TypeInner) -> Option<wgpu::BindingType> {
    match inner {
        naga::TypeInner::Sampler { comparison: false } => Some(wgpu::BindingType::Sampler(
            wgpu::SamplerBindingType::NonFiltering,
        )),
        naga::TypeInner::Image {
            dim: naga::ImageDimension::D2,
            arrayed,
            class,
        } => {
            let view_dimension = if *arrayed {
                wgpu::TextureViewDimension::D2Array
            } else {
                wgpu::TextureViewDimension::D2
            };
            match class {
                naga::ImageClass::Sampled {
                    kind: naga::ScalarKind::Float,
                    multi: false,
                } => Some(wgpu::BindingType::Texture {
                    sample_type: wgpu::TextureSampleType::Float { filterable: false },
                    view_dimension,
                    multisampled: false,
                }),
                naga::ImageClass::Storage { format, access } => {
                    let format = match format {
                        naga::StorageFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
                        naga::StorageFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
                        _ => return None,
                    };
                    let access = if access.contains(naga::StorageAccess::LOAD) {
                        wgpu::StorageTextureAccess::ReadWrite
                    } else {
                        wgpu::StorageTextureAccess::WriteOnly
                    };
                    Some(wgpu::BindingType::StorageTexture {
                        access,
                        format,
                        view_dimension,
                    })
                }
                _ => None,
            }
        }
        _ => None,
    }
}
