//! Device tensor buffers.
//!
//! A tensor of shape `(W, H, C)` lives on the device as a 2D texture array
//! with `ceil(C / 4)` layers of RGBA pixels. The same texture is sampled
//! by later passes, attached as a render target plane by plane, and bound
//! as a storage texture by compute passes.

use crate::error::{InferenceError, Result};
use crate::runtime::wait_idle;
use half::f16;
use lumen_core::{PlanarTensor, TensorShape};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Texel format of a device tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TensorFormat {
    #[default]
    Rgba32Float,
    /// Half precision intermediates.
    Rgba16Float,
}

impl TensorFormat {
    pub fn texture_format(self) -> wgpu::TextureFormat {
        match self {
            TensorFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
            TensorFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
        }
    }

    /// Bytes per pixel of one plane.
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            TensorFormat::Rgba32Float => 16,
            TensorFormat::Rgba16Float => 8,
        }
    }
}

/// Identity of a device buffer, used to notice when a binding must be rebuilt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(u64);

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

impl BufferHandle {
    fn next() -> Self {
        BufferHandle(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed))
    }
}

/// GPU-resident tensor. Cheap to clone; clones share the texture.
#[derive(Debug, Clone)]
pub struct DeviceTensorBuffer {
    texture: Arc<wgpu::Texture>,
    shape: TensorShape,
    format: TensorFormat,
    handle: BufferHandle,
}

impl DeviceTensorBuffer {
    /// Allocate an uninitialized tensor.
    pub fn new(
        device: &wgpu::Device,
        label: &str,
        shape: TensorShape,
        format: TensorFormat,
    ) -> Result<Self> {
        if shape.width == 0 || shape.height == 0 || shape.channels == 0 {
            return Err(InferenceError::InvalidRunParameters(format!(
                "cannot allocate empty tensor '{label}' ({shape})"
            )));
        }

        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width: shape.width,
                height: shape.height,
                depth_or_array_layers: shape.planes(),
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: format.texture_format(),
            usage: wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::STORAGE_BINDING
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });

        Ok(Self {
            texture: Arc::new(texture),
            shape,
            format,
            handle: BufferHandle::next(),
        })
    }

    /// Allocate a tensor and fill it from host data.
    pub fn from_planar(
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        label: &str,
        tensor: &PlanarTensor,
        format: TensorFormat,
    ) -> Result<Self> {
        let buffer = Self::new(device, label, tensor.shape, format)?;
        buffer.upload(queue, tensor)?;
        Ok(buffer)
    }

    pub fn shape(&self) -> TensorShape {
        self.shape
    }

    pub fn format(&self) -> TensorFormat {
        self.format
    }

    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    pub fn texture(&self) -> &wgpu::Texture {
        &self.texture
    }

    /// View of all planes, for sampling and storage binding.
    pub fn array_view(&self) -> wgpu::TextureView {
        self.texture.create_view(&wgpu::TextureViewDescriptor {
            label: Some("tensor array view"),
            dimension: Some(wgpu::TextureViewDimension::D2Array),
            base_array_layer: 0,
            array_layer_count: Some(self.shape.planes()),
            ..Default::default()
        })
    }

    /// Single-plane view, for use as a render target.
    pub fn plane_view(&self, plane: u32) -> wgpu::TextureView {
        self.texture.create_view(&wgpu::TextureViewDescriptor {
            label: Some("tensor plane view"),
            dimension: Some(wgpu::TextureViewDimension::D2),
            base_array_layer: plane,
            array_layer_count: Some(1),
            ..Default::default()
        })
    }

    /// Replace the buffer content with `tensor`.
    ///
    /// The write is ordered before any command buffer submitted afterwards.
    pub fn upload(&self, queue: &wgpu::Queue, tensor: &PlanarTensor) -> Result<()> {
        if tensor.shape != self.shape {
            return Err(InferenceError::InvalidRunParameters(format!(
                "uploading {} tensor into {} buffer",
                tensor.shape, self.shape
            )));
        }

        let bytes: Vec<u8> = match self.format {
            TensorFormat::Rgba32Float => bytemuck::cast_slice(&tensor.data).to_vec(),
            TensorFormat::Rgba16Float => {
                let halves: Vec<f16> = tensor.data.iter().map(|&v| f16::from_f32(v)).collect();
                bytemuck::cast_slice(&halves).to_vec()
            }
        };

        let s = self.shape;
        queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &self.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &bytes,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(s.width * self.format.bytes_per_pixel()),
                rows_per_image: Some(s.height),
            },
            self.extent(),
        );
        Ok(())
    }

    /// Copy the whole tensor into `target`, which must have the same shape
    /// and format.
    pub fn encode_copy_to(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        target: &DeviceTensorBuffer,
    ) -> Result<()> {
        if target.shape != self.shape || target.format != self.format {
            return Err(InferenceError::InvalidRunParameters(format!(
                "output buffer is {} {:?}, model produces {} {:?}",
                target.shape, target.format, self.shape, self.format
            )));
        }
        encoder.copy_texture_to_texture(
            self.texture.as_image_copy(),
            target.texture.as_image_copy(),
            self.extent(),
        );
        Ok(())
    }

    /// Read the tensor back to host memory.
    ///
    /// Submits a copy and blocks until the device has finished all work
    /// queued so far.
    pub fn read_planar(&self, device: &wgpu::Device, queue: &wgpu::Queue) -> Result<PlanarTensor> {
        let s = self.shape;
        let pixel_bytes = self.format.bytes_per_pixel();
        let unpadded_row = s.width * pixel_bytes;
        // wgpu requires `bytes_per_row` to be a multiple of 256.
        let padded_row = unpadded_row.div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT)
            * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let size = padded_row as u64 * s.height as u64 * s.planes() as u64;

        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("tensor_readback_staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("tensor_readback"),
        });
        encoder.copy_texture_to_buffer(
            self.texture.as_image_copy(),
            wgpu::TexelCopyBufferInfo {
                buffer: &staging,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_row),
                    rows_per_image: Some(s.height),
                },
            },
            self.extent(),
        );
        queue.submit(std::iter::once(encoder.finish()));

        let raw = map_and_read(device, &staging)?;

        let mut data = Vec::with_capacity(s.padded_element_count());
        for row in raw.chunks_exact(padded_row as usize) {
            let row = &row[..unpadded_row as usize];
            match self.format {
                TensorFormat::Rgba32Float => data.extend(
                    row.chunks_exact(4)
                        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]])),
                ),
                TensorFormat::Rgba16Float => data.extend(
                    row.chunks_exact(2)
                        .map(|b| f16::from_le_bytes([b[0], b[1]]).to_f32()),
                ),
            }
        }

        Ok(PlanarTensor::from_raw(s, data)?)
    }

    fn extent(&self) -> wgpu::Extent3d {
        wgpu::Extent3d {
            width: self.shape.width,
            height: self.shape.height,
            depth_or_array_layers: self.shape.planes(),
        }
    }
}

/// Map a `MAP_READ` buffer and copy its content out.
pub(crate) fn map_and_read(device: &wgpu::Device, buffer: &wgpu::Buffer) -> Result<Vec<u8>> {
    let slice = buffer.slice(..);
    let (sender, receiver) = futures::channel::oneshot::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        sender.send(result).ok();
    });
    wait_idle(device)?;

    pollster::block_on(receiver)
        .map_err(|_| InferenceError::Readback("Failed to receive map result".to_string()))??;

    let data = slice.get_mapped_range().to_vec();
    buffer.unmap();
    Ok(data)
}
