//! Compositing layers.
//!
//! Every property setter stages into the layer's pending record. `commit`
//! publishes the pending record into the drawing record, which is the only
//! state the renderer ever sees. Size is the exception: a layer that already
//! shows a buffer keeps its active size until a buffer large enough for the
//! requested size is latched.

use crate::buffer::{GraphicBuffer, PixelFormat};
use crate::frame_source::{FrameLatch, FrameNumber, FrameSource};
use bitflags::bitflags;
use common::error::{CompositorError, CompositorResult};
use common::geometry::{PixelRect, Point, Size, Transform};
use serde::{Deserialize, Serialize};
use slotmap::new_key_type;
use std::sync::Arc;

new_key_type! {
    /// Unique identifier for a layer.
    pub struct LayerId;
}

bitflags! {
    /// Per-layer state flags, updated through `(current & !mask) | (value & mask)`.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct LayerFlags: u32 {
        /// The layer is skipped during compositing.
        const HIDDEN = 0x01;
        /// Every texel is treated as fully opaque.
        const OPAQUE = 0x02;
        /// The layer never appears in captures.
        const SECURE = 0x80;
    }
}

impl LayerFlags {
    /// Applies a masked update.
    #[inline]
    pub fn masked_update(self, value: LayerFlags, mask: LayerFlags) -> LayerFlags {
        (self & !mask) | (value & mask)
    }
}

/// 2x2 linear part of a layer transform.
///
/// A local point `(x, y)` lands at `(dsdx·x + dsdy·y, dtdx·x + dtdy·y)` before
/// the layer position is added.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LayerMatrix {
    pub dsdx: f32,
    pub dtdx: f32,
    pub dsdy: f32,
    pub dtdy: f32,
}

impl Default for LayerMatrix {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl LayerMatrix {
    pub const IDENTITY: LayerMatrix = LayerMatrix {
        dsdx: 1.0,
        dtdx: 0.0,
        dsdy: 0.0,
        dtdy: 1.0,
    };

    pub const fn new(dsdx: f32, dtdx: f32, dsdy: f32, dtdy: f32) -> Self {
        Self {
            dsdx,
            dtdx,
            dsdy,
            dtdy,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.dsdx.is_finite() && self.dtdx.is_finite() && self.dsdy.is_finite() && self.dtdy.is_finite()
    }

    /// Full layer-to-display transform for a layer placed at `position`.
    pub fn to_transform(&self, position: Point) -> Transform {
        Transform {
            m11: self.dsdx,
            m12: self.dtdx,
            m21: self.dsdy,
            m22: self.dtdy,
            m31: position.x,
            m32: position.y,
        }
    }
}

/// Geometry, visibility and blending properties of a layer.
#[derive(Clone, Debug, PartialEq)]
pub struct LayerState {
    pub position: Point,
    pub requested_size: Size,
    pub crop: Option<PixelRect>,
    pub final_crop: Option<PixelRect>,
    pub matrix: LayerMatrix,
    pub alpha: f32,
    pub layer_stack: u32,
    pub flags: LayerFlags,
    pub z: i32,
}

impl LayerState {
    fn new(size: Size, layer_stack: u32, flags: LayerFlags) -> Self {
        Self {
            position: Point::ZERO,
            requested_size: size,
            crop: None,
            final_crop: None,
            matrix: LayerMatrix::IDENTITY,
            alpha: 1.0,
            layer_stack,
            flags,
            z: 0,
        }
    }
}

/// Creation parameters for a layer.
#[derive(Clone, Debug, PartialEq)]
pub struct LayerDescriptor {
    pub name: String,
    pub size: Size,
    pub format: PixelFormat,
    pub layer_stack: u32,
    pub flags: LayerFlags,
}

impl LayerDescriptor {
    pub fn new(name: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            name: name.into(),
            size: Size::new(width, height),
            format: PixelFormat::default(),
            layer_stack: 0,
            flags: LayerFlags::empty(),
        }
    }

    pub fn with_format(mut self, format: PixelFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_layer_stack(mut self, layer_stack: u32) -> Self {
        self.layer_stack = layer_stack;
        self
    }

    pub fn with_flags(mut self, flags: LayerFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// A compositing layer.
#[derive(Debug)]
pub struct Layer {
    id: LayerId,
    name: String,
    sequence: u64,
    format: PixelFormat,
    pending: LayerState,
    drawing: LayerState,
    modified: bool,
    active_size: Size,
    frame_source: FrameSource,
    buffer: Option<Arc<GraphicBuffer>>,
}

impl Layer {
    pub fn new(id: LayerId, sequence: u64, descriptor: LayerDescriptor, max_queued_frames: usize) -> Self {
        let state = LayerState::new(descriptor.size, descriptor.layer_stack, descriptor.flags);
        Self {
            id,
            name: descriptor.name,
            sequence,
            format: descriptor.format,
            pending: state.clone(),
            drawing: state,
            modified: false,
            active_size: descriptor.size,
            frame_source: FrameSource::new(max_queued_frames),
            buffer: None,
        }
    }

    pub fn id(&self) -> LayerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Committed state that the renderer observes.
    pub fn drawing(&self) -> &LayerState {
        &self.drawing
    }

    /// Staged state awaiting [`commit`](Self::commit).
    pub fn pending(&self) -> &LayerState {
        &self.pending
    }

    pub fn active_size(&self) -> Size {
        self.active_size
    }

    pub fn buffer(&self) -> Option<&Arc<GraphicBuffer>> {
        self.buffer.as_ref()
    }

    pub fn frame_source(&self) -> &FrameSource {
        &self.frame_source
    }

    pub fn is_visible(&self) -> bool {
        !self.drawing.flags.contains(LayerFlags::HIDDEN)
    }

    // -- Staging --

    pub fn set_position(&mut self, x: f32, y: f32) -> CompositorResult<()> {
        let position = Point::new(x, y);
        if !position.is_finite() {
            return Err(CompositorError::invalid(format!("position ({}, {}) is not finite", x, y)));
        }
        self.stage(|state| state.position = position);
        Ok(())
    }

    pub fn set_size(&mut self, width: u32, height: u32) -> CompositorResult<()> {
        let size = Size::new(width, height);
        if size.is_empty() {
            return Err(CompositorError::invalid(format!("layer size {}x{} is empty", width, height)));
        }
        self.stage(|state| state.requested_size = size);
        Ok(())
    }

    pub fn set_crop(&mut self, crop: Option<PixelRect>) {
        self.stage(|state| state.crop = crop);
    }

    pub fn set_final_crop(&mut self, crop: Option<PixelRect>) {
        self.stage(|state| state.final_crop = crop);
    }

    pub fn set_matrix(&mut self, matrix: LayerMatrix) -> CompositorResult<()> {
        if !matrix.is_finite() {
            return Err(CompositorError::invalid(format!("matrix {:?} is not finite", matrix)));
        }
        self.stage(|state| state.matrix = matrix);
        Ok(())
    }

    pub fn set_alpha(&mut self, alpha: f32) -> CompositorResult<()> {
        if !(0.0..=1.0).contains(&alpha) {
            return Err(CompositorError::invalid(format!("alpha {} outside [0, 1]", alpha)));
        }
        self.stage(|state| state.alpha = alpha);
        Ok(())
    }

    pub fn set_layer_stack(&mut self, layer_stack: u32) {
        self.stage(|state| state.layer_stack = layer_stack);
    }

    pub fn set_flags(&mut self, value: LayerFlags, mask: LayerFlags) {
        self.stage(|state| state.flags = state.flags.masked_update(value, mask));
    }

    pub fn set_z_order(&mut self, z: i32) {
        self.stage(|state| state.z = z);
    }

    pub fn show(&mut self) {
        self.set_flags(LayerFlags::empty(), LayerFlags::HIDDEN);
    }

    pub fn hide(&mut self) {
        self.set_flags(LayerFlags::HIDDEN, LayerFlags::HIDDEN);
    }

    fn stage(&mut self, update: impl FnOnce(&mut LayerState)) {
        update(&mut self.pending);
        self.modified = true;
    }

    /// Publishes staged properties. Returns whether anything was staged.
    pub fn commit(&mut self) -> bool {
        if !self.modified {
            return false;
        }

        self.drawing = self.pending.clone();
        self.modified = false;

        // Without pixel data there is nothing to distort.
        if self.buffer.is_none() {
            self.active_size = self.drawing.requested_size;
        }

        true
    }

    // -- Buffers --

    /// Enqueues a producer buffer on this layer's frame source.
    pub fn queue_buffer(&mut self, buffer: Arc<GraphicBuffer>) -> CompositorResult<FrameNumber> {
        if buffer.format() != self.format {
            return Err(CompositorError::invalid(format!(
                "buffer format {:?} does not match layer '{}' format {:?}",
                buffer.format(),
                self.name,
                self.format
            )));
        }
        self.frame_source.submit(buffer)
    }

    /// Accepts every queued frame into the committed buffer.
    pub fn latch(&mut self) -> FrameLatch {
        let newest = self.frame_source.next_frame_number() - 1;
        let latch = self.frame_source.try_commit_up_to(newest);

        if let Some(buffer) = &latch.buffer {
            let requested = self.drawing.requested_size;
            if buffer.size().contains(requested) && self.active_size != requested {
                tracing::debug!(
                    "layer '{}' resized {}x{} -> {}x{}",
                    self.name,
                    self.active_size.width,
                    self.active_size.height,
                    requested.width,
                    requested.height
                );
                self.active_size = requested;
            }
            self.buffer = Some(buffer.clone());
        }

        latch
    }

    /// Frozen drawing state for a composite pass.
    pub fn snapshot(&self) -> LayerSnapshot {
        LayerSnapshot {
            id: self.id,
            sequence: self.sequence,
            z: self.drawing.z,
            layer_stack: self.drawing.layer_stack,
            position: self.drawing.position,
            size: self.active_size,
            crop: self.drawing.crop,
            final_crop: self.drawing.final_crop,
            matrix: self.drawing.matrix,
            alpha: self.drawing.alpha,
            flags: self.drawing.flags,
            buffer: self.buffer.clone(),
        }
    }

    /// Committed properties plus buffer bookkeeping.
    pub fn info(&self) -> LayerInfo {
        LayerInfo {
            id: self.id,
            name: self.name.clone(),
            format: self.format,
            state: self.drawing.clone(),
            active_size: self.active_size,
            next_frame_number: self.frame_source.next_frame_number(),
            committed_frame_number: self.frame_source.committed_frame_number(),
            has_buffer: self.buffer.is_some(),
        }
    }
}

/// A layer's drawing state as read by one composite pass.
#[derive(Clone, Debug)]
pub struct LayerSnapshot {
    pub id: LayerId,
    pub sequence: u64,
    pub z: i32,
    pub layer_stack: u32,
    pub position: Point,
    pub size: Size,
    pub crop: Option<PixelRect>,
    pub final_crop: Option<PixelRect>,
    pub matrix: LayerMatrix,
    pub alpha: f32,
    pub flags: LayerFlags,
    pub buffer: Option<Arc<GraphicBuffer>>,
}

impl LayerSnapshot {
    pub fn is_visible(&self) -> bool {
        !self.flags.contains(LayerFlags::HIDDEN)
    }

    pub fn is_secure(&self) -> bool {
        self.flags.contains(LayerFlags::SECURE)
    }

    pub fn is_opaque(&self) -> bool {
        self.flags.contains(LayerFlags::OPAQUE)
            || self.buffer.as_ref().is_some_and(|b| b.format().is_opaque())
    }

    /// Texels that may be sampled: crop, active size and buffer bounds combined.
    pub fn source_rect(&self) -> Option<PixelRect> {
        let buffer = self.buffer.as_ref()?;
        let mut rect = PixelRect::from_size(self.size).intersection(&buffer.bounds())?;
        if let Some(crop) = &self.crop {
            rect = rect.intersection(crop)?;
        }
        Some(rect)
    }

    pub fn transform(&self) -> Transform {
        self.matrix.to_transform(self.position)
    }
}

/// Introspection record returned by the composer.
#[derive(Clone, Debug)]
pub struct LayerInfo {
    pub id: LayerId,
    pub name: String,
    pub format: PixelFormat,
    pub state: LayerState,
    pub active_size: Size,
    pub next_frame_number: FrameNumber,
    pub committed_frame_number: FrameNumber,
    pub has_buffer: bool,
}
