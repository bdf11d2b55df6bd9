//! Compositor configuration.

use crate::buffer::PixelBuffer;
use crate::registry::RegistryLimits;
use common::color::Color;
use common::error::{CompositorError, CompositorResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// A display created when the composer starts up.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayConfig {
    /// Display name, unique per composer.
    pub name: String,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Layer stack shown on this display.
    #[serde(default)]
    pub layer_stack: u32,
}

impl DisplayConfig {
    pub fn new(name: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            name: name.into(),
            width,
            height,
            layer_stack: 0,
        }
    }

    pub fn with_layer_stack(mut self, layer_stack: u32) -> Self {
        self.layer_stack = layer_stack;
        self
    }
}

/// Compositor configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompositorConfig {
    /// Maximum number of live layers.
    pub max_layers: usize,
    /// Largest accepted buffer width or height.
    pub max_buffer_dimension: u32,
    /// Largest accepted buffer in bytes.
    pub max_buffer_bytes: usize,
    /// Frames a layer may have queued before submissions are refused.
    pub max_queued_frames: usize,
    /// Upper bound on a waiting commit, in milliseconds.
    pub transaction_timeout_ms: u64,
    /// Idle wakeup interval of the composition thread, in milliseconds.
    pub refresh_interval_ms: u64,
    /// Background color, hex (`"#000000"`).
    #[serde(with = "hex_color")]
    pub clear_color: Color,
    /// Displays created at startup.
    pub displays: Vec<DisplayConfig>,
}

impl CompositorConfig {
    /// Create a new configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration without any display, for offscreen capture.
    pub fn headless() -> Self {
        Self {
            displays: Vec::new(),
            ..Self::default()
        }
    }

    /// Parse a (possibly partial) JSON document and validate it.
    pub fn from_json(json: &str) -> CompositorResult<Self> {
        let config: CompositorConfig = serde_json::from_str(json)
            .map_err(|e| CompositorError::config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> CompositorResult<()> {
        if self.max_layers == 0 {
            return Err(CompositorError::config("max_layers must be positive"));
        }
        if self.max_buffer_dimension == 0 || self.max_buffer_bytes == 0 {
            return Err(CompositorError::config("buffer limits must be positive"));
        }
        if self.max_queued_frames == 0 {
            return Err(CompositorError::config("max_queued_frames must be positive"));
        }
        if self.refresh_interval_ms == 0 {
            return Err(CompositorError::config("refresh_interval_ms must be positive"));
        }

        let limits = self.limits();
        let mut names = HashSet::new();
        for display in &self.displays {
            if display.width == 0 || display.height == 0 {
                return Err(CompositorError::config(format!(
                    "display '{}' has empty size {}x{}",
                    display.name, display.width, display.height
                )));
            }
            limits
                .check_buffer(display.width, display.height, PixelBuffer::BYTES_PER_PIXEL)
                .map_err(|e| CompositorError::config(format!("display '{}': {}", display.name, e)))?;
            if !names.insert(display.name.as_str()) {
                return Err(CompositorError::config(format!(
                    "duplicate display name '{}'",
                    display.name
                )));
            }
        }
        Ok(())
    }

    /// Set the layer count limit.
    pub fn with_max_layers(mut self, max_layers: usize) -> Self {
        self.max_layers = max_layers;
        self
    }

    /// Set buffer limits.
    pub fn with_buffer_limits(mut self, max_dimension: u32, max_bytes: usize) -> Self {
        self.max_buffer_dimension = max_dimension;
        self.max_buffer_bytes = max_bytes;
        self
    }

    pub fn with_max_queued_frames(mut self, frames: usize) -> Self {
        self.max_queued_frames = frames;
        self
    }

    pub fn with_transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_clear_color(mut self, color: Color) -> Self {
        self.clear_color = color;
        self
    }

    /// Add a display.
    pub fn with_display(mut self, display: DisplayConfig) -> Self {
        self.displays.push(display);
        self
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn limits(&self) -> RegistryLimits {
        RegistryLimits {
            max_layers: self.max_layers,
            max_buffer_dimension: self.max_buffer_dimension,
            max_buffer_bytes: self.max_buffer_bytes,
            max_queued_frames: self.max_queued_frames,
        }
    }
}

impl Default for CompositorConfig {
    fn default() -> Self {
        let limits = RegistryLimits::default();
        Self {
            max_layers: limits.max_layers,
            max_buffer_dimension: limits.max_buffer_dimension,
            max_buffer_bytes: limits.max_buffer_bytes,
            max_queued_frames: limits.max_queued_frames,
            transaction_timeout_ms: 5000,
            refresh_interval_ms: 16,
            clear_color: Color::BLACK,
            displays: vec![DisplayConfig::new("primary", 1280, 720)],
        }
    }
}

mod hex_color {
    use common::color::Color;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(color: &Color, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("#{:02x}{:02x}{:02x}", color.r, color.g, color.b))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Color, D::Error> {
        let text = String::deserialize(deserializer)?;
        Color::from_hex(&text).ok_or_else(|| de::Error::custom(format!("invalid color '{}'", text)))
    }
}
