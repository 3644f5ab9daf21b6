//! Render-target binding.
//!
//! A [`RenderTargetBinder`] collects the planes a rasterization pass writes
//! and turns them into color attachments. Which binder is current is
//! tracked by a [`BinderContext`] that is passed down the call chain
//! instead of living in a global.

use crate::device_buffer::{BufferHandle, DeviceTensorBuffer, TensorFormat};
use crate::error::{InferenceError, Result};
use std::sync::atomic::{AtomicU64, Ordering};

/// Identity of a binder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BinderId(u64);

static NEXT_BINDER: AtomicU64 = AtomicU64::new(1);

/// Tracks the currently bound render target of one core.
#[derive(Debug, Default)]
pub struct BinderContext {
    current: Option<BinderId>,
}

impl BinderContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binder selected by the last [`RenderTargetBinder::bind`], if any.
    pub fn current(&self) -> Option<BinderId> {
        self.current
    }
}

/// Completeness of a binder's attachments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetStatus {
    Complete,
    Incomplete(String),
}

impl TargetStatus {
    pub fn is_complete(&self) -> bool {
        matches!(self, TargetStatus::Complete)
    }
}

/// Check a set of attachment formats against the device limits.
///
/// Targets are incomplete when nothing is attached, when formats differ,
/// or when the count or total bytes per sample exceed what one render
/// pass may write.
pub fn check_target_formats(formats: &[TensorFormat], limits: &wgpu::Limits) -> TargetStatus {
    let Some(first) = formats.first() else {
        return TargetStatus::Incomplete("no planes attached".to_string());
    };
    if let Some(other) = formats.iter().find(|f| *f != first) {
        return TargetStatus::Incomplete(format!("mixed formats {first:?} and {other:?}"));
    }
    if formats.len() as u32 > limits.max_color_attachments {
        return TargetStatus::Incomplete(format!(
            "{} targets exceed the limit of {}",
            formats.len(),
            limits.max_color_attachments
        ));
    }
    let bytes: u32 = formats.iter().map(|f| f.bytes_per_pixel()).sum();
    if bytes > limits.max_color_attachment_bytes_per_sample {
        return TargetStatus::Incomplete(format!(
            "{} targets of {first:?} need {bytes} bytes per sample, limit is {}",
            formats.len(),
            limits.max_color_attachment_bytes_per_sample
        ));
    }
    TargetStatus::Complete
}

struct Attachment {
    view: wgpu::TextureView,
    format: TensorFormat,
    buffer: BufferHandle,
    plane: u32,
}

/// Color attachments of one rasterization pass.
pub struct RenderTargetBinder {
    id: BinderId,
    label: String,
    attachments: Vec<Attachment>,
}

impl RenderTargetBinder {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            id: BinderId(NEXT_BINDER.fetch_add(1, Ordering::Relaxed)),
            label: label.into(),
            attachments: Vec::new(),
        }
    }

    pub fn id(&self) -> BinderId {
        self.id
    }

    /// Attach `plane_count` planes of `buffer` starting at `first_plane`,
    /// one color attachment per plane, after any already attached.
    ///
    /// # Errors
    /// Fails when the plane range is outside the buffer.
    pub fn attach(
        &mut self,
        buffer: &DeviceTensorBuffer,
        first_plane: u32,
        plane_count: u32,
    ) -> Result<()> {
        let planes = buffer.shape().planes();
        if plane_count == 0 || first_plane + plane_count > planes {
            return Err(InferenceError::IncompleteTarget {
                label: self.label.clone(),
                reason: format!(
                    "planes {first_plane}..{} outside buffer with {planes} planes",
                    first_plane + plane_count
                ),
            });
        }
        for plane in first_plane..first_plane + plane_count {
            self.attachments.push(Attachment {
                view: buffer.plane_view(plane),
                format: buffer.format(),
                buffer: buffer.handle(),
                plane,
            });
        }
        Ok(())
    }

    /// Remove all attachments.
    pub fn detach(&mut self) {
        self.attachments.clear();
    }

    pub fn status(&self, limits: &wgpu::Limits) -> TargetStatus {
        let formats: Vec<_> = self.attachments.iter().map(|a| a.format).collect();
        check_target_formats(&formats, limits)
    }

    pub fn is_complete(&self, limits: &wgpu::Limits) -> bool {
        self.status(limits).is_complete()
    }

    /// Fail with [`InferenceError::IncompleteTarget`] unless complete.
    pub fn ensure_complete(&self, limits: &wgpu::Limits) -> Result<()> {
        match self.status(limits) {
            TargetStatus::Complete => Ok(()),
            TargetStatus::Incomplete(reason) => Err(InferenceError::IncompleteTarget {
                label: self.label.clone(),
                reason,
            }),
        }
    }

    /// Make this binder current and return its color attachments.
    pub fn bind(&self, ctx: &mut BinderContext) -> Vec<Option<wgpu::RenderPassColorAttachment<'_>>> {
        ctx.current = Some(self.id);
        self.attachments
            .iter()
            .map(|a| {
                Some(wgpu::RenderPassColorAttachment {
                    view: &a.view,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                        store: wgpu::StoreOp::Store,
                    },
                })
            })
            .collect()
    }

    /// Restore the default (no) target if this binder is current.
    pub fn unbind(&self, ctx: &mut BinderContext) {
        if ctx.current == Some(self.id) {
            ctx.current = None;
        }
    }

    /// Color target states for pipeline creation, in attachment order.
    pub fn color_targets(&self) -> Vec<Option<wgpu::ColorTargetState>> {
        self.attachments
            .iter()
            .map(|a| {
                Some(wgpu::ColorTargetState {
                    format: a.format.texture_format(),
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })
            })
            .collect()
    }

    /// Planes currently attached, as `(buffer, plane)` pairs.
    pub fn attached_planes(&self) -> Vec<(BufferHandle, u32)> {
        self.attachments.iter().map(|a| (a.buffer, a.plane)).collect()
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}
