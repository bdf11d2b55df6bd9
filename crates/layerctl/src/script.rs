//! Scripted compositor sessions.
//!
//! A script is a JSON document listing steps run against one composer:
//!
//! ```json
//! { "steps": [
//!     { "op": "create_layer", "name": "fg", "width": 64, "height": 64 },
//!     { "op": "fill", "layer": "fg", "color": "#c33f3f" },
//!     { "op": "transaction", "ops": [{ "set": "position", "layer": "fg", "x": 64, "y": 64 }] },
//!     { "op": "capture", "region": { "x": 0, "y": 0, "width": 256, "height": 256 } },
//!     { "op": "check_pixel", "x": 75, "y": 75, "color": "#c33f3f" }
//! ] }
//! ```

use anyhow::{anyhow, bail, Context, Result};
use common::color::Color;
use common::geometry::PixelRect;
use compositor::{Composer, LayerFlags, LayerId, PixelFormat, ScreenCapture, Transaction};
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, info};

#[derive(Clone, Debug, Deserialize)]
pub struct Script {
    #[serde(default)]
    pub name: Option<String>,
    pub steps: Vec<Step>,
}

impl Script {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("failed to parse script")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagName {
    Hidden,
    Opaque,
    Secure,
}

impl FlagName {
    fn to_flags(names: &[FlagName]) -> LayerFlags {
        names.iter().fold(LayerFlags::empty(), |flags, name| {
            flags
                | match name {
                    FlagName::Hidden => LayerFlags::HIDDEN,
                    FlagName::Opaque => LayerFlags::OPAQUE,
                    FlagName::Secure => LayerFlags::SECURE,
                }
        })
    }
}

/// Gate for a scripted transaction.
#[derive(Clone, Debug, Deserialize)]
pub struct Defer {
    pub barrier: String,
    /// Absolute frame number. Defaults to the barrier's next frame number.
    #[serde(default)]
    pub frame: Option<u64>,
    /// Added to the barrier's next frame number when `frame` is absent.
    #[serde(default)]
    pub offset: u64,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "set", rename_all = "snake_case")]
pub enum LayerOp {
    Position { layer: String, x: f32, y: f32 },
    Size { layer: String, width: u32, height: u32 },
    Crop { layer: String, rect: Option<PixelRect> },
    FinalCrop { layer: String, rect: Option<PixelRect> },
    Matrix { layer: String, dsdx: f32, dtdx: f32, dsdy: f32, dtdy: f32 },
    Alpha { layer: String, alpha: f32 },
    LayerStack { layer: String, layer_stack: u32 },
    Flags { layer: String, value: Vec<FlagName>, mask: Vec<FlagName> },
    Z { layer: String, z: i32 },
    Show { layer: String },
    Hide { layer: String },
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    CreateLayer {
        name: String,
        width: u32,
        height: u32,
        #[serde(default)]
        layer_stack: u32,
        #[serde(default)]
        format: PixelFormat,
        #[serde(default)]
        flags: Vec<FlagName>,
    },
    Fill {
        layer: String,
        #[serde(deserialize_with = "hex_color")]
        color: Color,
    },
    Transaction {
        ops: Vec<LayerOp>,
        #[serde(default)]
        defer: Option<Defer>,
        #[serde(default = "default_wait")]
        wait: bool,
    },
    DestroyLayer {
        layer: String,
    },
    Capture {
        #[serde(default)]
        layer_stack: u32,
        region: PixelRect,
        #[serde(default)]
        output: Option<PathBuf>,
    },
    CheckPixel {
        x: i32,
        y: i32,
        #[serde(deserialize_with = "hex_color")]
        color: Color,
    },
}

fn default_wait() -> bool {
    true
}

fn hex_color<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Color, D::Error> {
    let text = String::deserialize(deserializer)?;
    Color::from_hex(&text).ok_or_else(|| serde::de::Error::custom(format!("invalid color '{}'", text)))
}

/// Result of a completed script.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScriptSummary {
    pub steps: usize,
    pub checks_passed: usize,
    pub images_written: usize,
}

pub struct ScriptRunner<'a> {
    composer: &'a Composer,
    output_dir: PathBuf,
    layers: HashMap<String, LayerId>,
    capture: Option<ScreenCapture>,
    summary: ScriptSummary,
}

impl<'a> ScriptRunner<'a> {
    pub fn new(composer: &'a Composer, output_dir: Option<PathBuf>) -> Self {
        Self {
            composer,
            output_dir: output_dir.unwrap_or_else(|| PathBuf::from(".")),
            layers: HashMap::new(),
            capture: None,
            summary: ScriptSummary::default(),
        }
    }

    pub fn run(mut self, script: &Script) -> Result<ScriptSummary> {
        if let Some(name) = &script.name {
            info!("Running script '{}'", name);
        }
        for (index, step) in script.steps.iter().enumerate() {
            self.step(step)
                .with_context(|| format!("step {} ({})", index + 1, step.describe()))?;
            self.summary.steps += 1;
        }
        Ok(self.summary)
    }

    fn layer(&self, name: &str) -> Result<LayerId> {
        self.layers
            .get(name)
            .copied()
            .ok_or_else(|| anyhow!("unknown layer '{}'", name))
    }

    fn step(&mut self, step: &Step) -> Result<()> {
        match step {
            Step::CreateLayer {
                name,
                width,
                height,
                layer_stack,
                format,
                flags,
            } => {
                if self.layers.contains_key(name) {
                    bail!("layer '{}' already exists", name);
                }
                let id = self.composer.create_layer(
                    name,
                    *layer_stack,
                    *width,
                    *height,
                    *format,
                    FlagName::to_flags(flags),
                )?;
                self.layers.insert(name.clone(), id);
            }
            Step::Fill { layer, color } => {
                let frame = self.composer.fill_layer(self.layer(layer)?, *color)?;
                debug!("filled '{}' with {} as frame {}", layer, color, frame);
            }
            Step::Transaction { ops, defer, wait } => {
                let mut txn = self.composer.begin_transaction();
                for op in ops {
                    self.stage(&mut txn, op)?;
                }
                if let Some(defer) = defer {
                    let barrier = self.layer(&defer.barrier)?;
                    let frame = match defer.frame {
                        Some(frame) => frame,
                        None => self.composer.next_frame_number(barrier)? + defer.offset,
                    };
                    txn.defer_until(barrier, frame)?;
                }

                let report = self.composer.commit_transaction(txn, *wait);
                debug!(
                    "{}: applied={} deferred={} presented={}",
                    report.transaction, report.applied, report.deferred, report.presented
                );
                if let Some(failure) = report.failures.first() {
                    bail!("{} failed for layer {:?}: {}", report.transaction, failure.layer, failure.error);
                }
            }
            Step::DestroyLayer { layer } => {
                let id = self.layer(layer)?;
                self.composer.destroy_layer(id)?;
                self.layers.remove(layer);
            }
            Step::Capture {
                layer_stack,
                region,
                output,
            } => {
                let capture = self.composer.capture_composite(*layer_stack, *region)?;
                if let Some(output) = output {
                    let path = self.output_dir.join(output);
                    write_png(&capture, &path)?;
                    info!("Capture saved to: {}", path.display());
                    self.summary.images_written += 1;
                }
                self.capture = Some(capture);
            }
            Step::CheckPixel { x, y, color } => {
                let capture = self
                    .capture
                    .as_ref()
                    .ok_or_else(|| anyhow!("check_pixel before any capture"))?;
                capture.check_pixel(*x, *y, color.r, color.g, color.b)?;
                self.summary.checks_passed += 1;
            }
        }
        Ok(())
    }

    fn stage(&self, txn: &mut Transaction, op: &LayerOp) -> Result<()> {
        match op {
            LayerOp::Position { layer, x, y } => {
                txn.set_position(self.layer(layer)?, *x, *y)?;
            }
            LayerOp::Size { layer, width, height } => {
                txn.set_size(self.layer(layer)?, *width, *height)?;
            }
            LayerOp::Crop { layer, rect } => {
                txn.set_crop(self.layer(layer)?, *rect)?;
            }
            LayerOp::FinalCrop { layer, rect } => {
                txn.set_final_crop(self.layer(layer)?, *rect)?;
            }
            LayerOp::Matrix {
                layer,
                dsdx,
                dtdx,
                dsdy,
                dtdy,
            } => {
                txn.set_matrix(self.layer(layer)?, *dsdx, *dtdx, *dsdy, *dtdy)?;
            }
            LayerOp::Alpha { layer, alpha } => {
                txn.set_alpha(self.layer(layer)?, *alpha)?;
            }
            LayerOp::LayerStack { layer, layer_stack } => {
                txn.set_layer_stack(self.layer(layer)?, *layer_stack)?;
            }
            LayerOp::Flags { layer, value, mask } => {
                txn.set_flags(self.layer(layer)?, FlagName::to_flags(value), FlagName::to_flags(mask))?;
            }
            LayerOp::Z { layer, z } => {
                txn.set_z_order(self.layer(layer)?, *z)?;
            }
            LayerOp::Show { layer } => {
                txn.show(self.layer(layer)?)?;
            }
            LayerOp::Hide { layer } => {
                txn.hide(self.layer(layer)?)?;
            }
        }
        Ok(())
    }
}

impl Step {
    fn describe(&self) -> &'static str {
        match self {
            Step::CreateLayer { .. } => "create_layer",
            Step::Fill { .. } => "fill",
            Step::Transaction { .. } => "transaction",
            Step::DestroyLayer { .. } => "destroy_layer",
            Step::Capture { .. } => "capture",
            Step::CheckPixel { .. } => "check_pixel",
        }
    }
}

fn write_png(capture: &ScreenCapture, path: &std::path::Path) -> Result<()> {
    let buffer = capture.buffer();
    let image = image::RgbaImage::from_raw(buffer.width, buffer.height, buffer.to_packed_rgba())
        .ok_or_else(|| anyhow!("capture buffer does not match its dimensions"))?;
    image
        .save(path)
        .with_context(|| format!("failed to write {}", path.display()))
}

const BG: Color = Color::rgb(63, 63, 195);
const FG: Color = Color::rgb(195, 63, 63);
const SYNC: Color = Color::rgb(31, 31, 31);

/// The layer-update scenario: background, foreground and sync layers, a
/// move, and a transaction deferred on the sync layer's next frame.
pub fn builtin_scenario(width: u32, height: u32, save_images: bool) -> Result<Script> {
    if width < 160 || height < 160 {
        bail!("built-in scenario needs a display of at least 160x160, got {}x{}", width, height);
    }

    let create = |name: &str, w: u32, h: u32| Step::CreateLayer {
        name: name.to_string(),
        width: w,
        height: h,
        layer_stack: 0,
        format: PixelFormat::Rgba8888,
        flags: Vec::new(),
    };
    let fill = |layer: &str, color: Color| Step::Fill {
        layer: layer.to_string(),
        color,
    };
    let capture = |output: &str| Step::Capture {
        layer_stack: 0,
        region: PixelRect::new(0, 0, width, height),
        output: save_images.then(|| PathBuf::from(output)),
    };
    let check = |x: i32, y: i32, color: Color| Step::CheckPixel { x, y, color };
    let layer = |name: &str| name.to_string();

    let steps = vec![
        create("bg", width, height),
        fill("bg", BG),
        create("fg", 64, 64),
        fill("fg", FG),
        create("sync", 1, 1),
        fill("sync", SYNC),
        Step::Transaction {
            ops: vec![
                LayerOp::Z { layer: layer("bg"), z: i32::MAX - 2 },
                LayerOp::Show { layer: layer("bg") },
                LayerOp::Z { layer: layer("fg"), z: i32::MAX - 1 },
                LayerOp::Position { layer: layer("fg"), x: 64.0, y: 64.0 },
                LayerOp::Show { layer: layer("fg") },
                LayerOp::Z { layer: layer("sync"), z: i32::MAX - 1 },
                LayerOp::Position {
                    layer: layer("sync"),
                    x: (width - 2) as f32,
                    y: (height - 2) as f32,
                },
                LayerOp::Show { layer: layer("sync") },
            ],
            defer: None,
            wait: true,
        },
        capture("initial.png"),
        check(24, 24, BG),
        check(75, 75, FG),
        check(145, 145, BG),
        Step::Transaction {
            ops: vec![LayerOp::Position { layer: layer("fg"), x: 128.0, y: 128.0 }],
            defer: None,
            wait: true,
        },
        capture("moved.png"),
        check(24, 24, BG),
        check(75, 75, BG),
        check(145, 145, FG),
        Step::Transaction {
            ops: vec![LayerOp::Alpha { layer: layer("fg"), alpha: 0.75 }],
            defer: Some(Defer {
                barrier: layer("sync"),
                frame: None,
                offset: 0,
            }),
            wait: true,
        },
        capture("deferred.png"),
        check(145, 145, FG),
        fill("sync", SYNC),
        capture("released.png"),
        check(145, 145, Color::rgb(162, 63, 96)),
        check((width - 2) as i32, (height - 2) as i32, SYNC),
    ];

    Ok(Script {
        name: Some("layer-update".to_string()),
        steps,
    })
}
