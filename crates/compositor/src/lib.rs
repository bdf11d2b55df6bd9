//! Transactional layer compositor.
//!
//! Clients create layers, submit pixel buffers to them and change their
//! properties through transactions. The composer applies each transaction
//! atomically, optionally deferring it until a barrier layer presents a
//! given frame, and composites every layer stack back to front:
//! - position and 2x2 matrix transforms
//! - buffer-space crop and screen-space final crop
//! - per-layer alpha
//! - z-order within a layer stack
//! - visibility flags

pub mod buffer;
pub mod capture;
pub mod compositor;
pub mod config;
pub mod deferred;
pub mod display;
pub mod frame_source;
pub mod layer;
pub mod registry;
pub mod service;
pub mod transaction;

pub use self::compositor::{Composition, Compositor, CompositorStats};
pub use buffer::{GraphicBuffer, PixelBuffer, PixelFormat};
pub use capture::{PixelMismatch, ScreenCapture};
pub use config::{CompositorConfig, DisplayConfig};
pub use display::{DisplayId, DisplayInfo};
pub use frame_source::FrameNumber;
pub use layer::{LayerDescriptor, LayerFlags, LayerId, LayerInfo, LayerMatrix, LayerSnapshot, LayerState};
pub use registry::{LayerRegistry, RegistryLimits};
pub use service::{Composer, ComposerStats};
pub use transaction::{CommitReport, DeferCondition, LayerFailure, Transaction, TransactionId};
