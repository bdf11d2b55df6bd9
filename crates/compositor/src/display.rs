//! Output displays.

use crate::buffer::PixelBuffer;
use common::geometry::PixelRect;
use slotmap::new_key_type;
use std::sync::Arc;

new_key_type! {
    /// Unique identifier for a display.
    pub struct DisplayId;
}

/// A display shows one layer stack and keeps its most recent frame.
#[derive(Debug)]
pub struct Display {
    id: DisplayId,
    name: String,
    width: u32,
    height: u32,
    layer_stack: u32,
    last_frame: Option<Arc<PixelBuffer>>,
    frame_count: u64,
}

/// Introspection record for a display.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DisplayInfo {
    pub id: DisplayId,
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub layer_stack: u32,
    pub frame_count: u64,
}

impl Display {
    pub fn new(id: DisplayId, name: impl Into<String>, width: u32, height: u32, layer_stack: u32) -> Self {
        Self {
            id,
            name: name.into(),
            width,
            height,
            layer_stack,
            last_frame: None,
            frame_count: 0,
        }
    }

    pub fn id(&self) -> DisplayId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn layer_stack(&self) -> u32 {
        self.layer_stack
    }

    pub fn set_layer_stack(&mut self, layer_stack: u32) {
        self.layer_stack = layer_stack;
    }

    /// Screen area this display composites.
    pub fn bounds(&self) -> PixelRect {
        PixelRect::new(0, 0, self.width, self.height)
    }

    pub fn last_frame(&self) -> Option<Arc<PixelBuffer>> {
        self.last_frame.clone()
    }

    pub(crate) fn present(&mut self, frame: PixelBuffer) {
        self.last_frame = Some(Arc::new(frame));
        self.frame_count += 1;
    }

    pub fn info(&self) -> DisplayInfo {
        DisplayInfo {
            id: self.id,
            name: self.name.clone(),
            width: self.width,
            height: self.height,
            layer_stack: self.layer_stack,
            frame_count: self.frame_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    #[test]
    fn test_present_counts_frames() {
        let mut ids: SlotMap<DisplayId, ()> = SlotMap::with_key();
        let mut display = Display::new(ids.insert(()), "primary", 4, 2, 0);
        assert!(display.last_frame().is_none());

        display.present(PixelBuffer::new(4, 2));
        display.present(PixelBuffer::new(4, 2));

        let info = display.info();
        assert_eq!(info.frame_count, 2);
        assert_eq!(display.bounds(), PixelRect::new(0, 0, 4, 2));
        assert_eq!(display.last_frame().unwrap().width, 4);
    }
}
