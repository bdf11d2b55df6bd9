//! The composer service.
//!
//! [`Composer`] owns every layer, display and parked transaction behind one
//! mutex. Committing a transaction, accepting a buffer and releasing deferred
//! transactions all happen inside that critical section. Composite passes
//! latch queued frames and copy layer snapshots under the lock, then blend
//! outside it, so a pass sees the state between two commits and never part
//! of one.

use crate::buffer::{GraphicBuffer, PixelBuffer, PixelFormat};
use crate::compositor::{Compositor, CompositorStats};
use crate::config::CompositorConfig;
use crate::deferred::{DeferredTransactions, ParkedTransaction};
use crate::display::{Display, DisplayId, DisplayInfo};
use crate::frame_source::FrameNumber;
use crate::layer::{Layer, LayerDescriptor, LayerFlags, LayerId, LayerInfo, LayerSnapshot};
use crate::registry::LayerRegistry;
use crate::transaction::{
    apply_mutations, CommitReport, LayerFailures, LayerLookup, LayerMutation, Transaction, TransactionId,
};
use common::color::Color;
use common::error::{CompositorError, CompositorResult};
use common::geometry::PixelRect;
use indexmap::IndexMap;
use parking_lot::{Condvar, Mutex};
use slotmap::SlotMap;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Instant;

/// Handle to a composer. Clones share the same state.
#[derive(Clone)]
pub struct Composer {
    shared: Arc<Shared>,
}

/// Aggregate counters.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ComposerStats {
    pub layers: usize,
    pub displays: usize,
    pub parked_transactions: usize,
    pub frames_composited: u64,
    /// Totals of the most recent pass over all displays.
    pub last_pass: CompositorStats,
}

struct Shared {
    config: CompositorConfig,
    compositor: Compositor,
    state: Mutex<ComposerState>,
    /// Signalled when the composition thread has work.
    wake: Condvar,
    /// Signalled after every composite pass.
    frame_done: Condvar,
    /// Serializes composite passes.
    pass_lock: Mutex<()>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

struct ComposerState {
    registry: LayerRegistry,
    deferred: DeferredTransactions,
    displays: SlotMap<DisplayId, Display>,
    /// Bumped by every change a display could show.
    commit_epoch: u64,
    /// Highest commit epoch incorporated by a finished pass.
    composited_epoch: u64,
    running: bool,
    next_transaction: u64,
    frames_composited: u64,
    last_pass: CompositorStats,
}

impl ComposerState {
    fn layer(&self, id: LayerId) -> CompositorResult<&Layer> {
        self.registry
            .get(id)
            .ok_or_else(|| CompositorError::not_found(format!("layer {:?}", id)))
    }

    fn layer_mut(&mut self, id: LayerId) -> CompositorResult<&mut Layer> {
        self.registry
            .get_mut(id)
            .ok_or_else(|| CompositorError::not_found(format!("layer {:?}", id)))
    }

    fn display_mut(&mut self, id: DisplayId) -> CompositorResult<&mut Display> {
        self.displays
            .get_mut(id)
            .ok_or_else(|| CompositorError::not_found(format!("display {:?}", id)))
    }

    fn apply(&mut self, id: TransactionId, mutations: &IndexMap<LayerId, LayerMutation>) -> LayerFailures {
        let failures = apply_mutations(&mut self.registry, id, mutations);
        if !mutations.is_empty() {
            self.commit_epoch += 1;
        }
        failures
    }

    fn apply_parked(&mut self, parked: Vec<ParkedTransaction>) {
        for transaction in parked {
            let failures = self.apply(transaction.id, &transaction.mutations);
            tracing::debug!(
                "{} released with {} failed mutations",
                transaction.id,
                failures.len()
            );
        }
    }

    /// Latches `id` and releases the transactions its new frame satisfies.
    /// Returns the committed frame number, or `None` for an unknown layer.
    fn latch_layer(&mut self, id: LayerId) -> Option<FrameNumber> {
        let target = self.registry.get_mut(id)?;
        let latch = target.latch();
        tracing::trace!("layer '{}' latched frame {}", target.name(), latch.committed_frame_number);

        let ready = self.deferred.take_ready(id, latch.committed_frame_number);
        self.apply_parked(ready);
        if latch.buffer.is_some() {
            self.commit_epoch += 1;
        }
        Some(latch.committed_frame_number)
    }

    /// Latches every layer that has queued frames.
    fn latch_pending(&mut self) -> usize {
        let pending: Vec<LayerId> = self
            .registry
            .iter()
            .filter(|layer| layer.frame_source().pending() > 0)
            .map(Layer::id)
            .collect();
        for &id in &pending {
            self.latch_layer(id);
        }
        pending.len()
    }

    /// Frozen back-to-front snapshot of one layer stack.
    fn snapshot_stack(&self, layer_stack: u32, include_secure: bool) -> Vec<LayerSnapshot> {
        self.registry
            .layers_for_stack(layer_stack)
            .into_iter()
            .map(Layer::snapshot)
            .filter(|snapshot| include_secure || !snapshot.is_secure())
            .collect()
    }
}

impl LayerLookup for Shared {
    fn contains_layer(&self, id: LayerId) -> bool {
        self.state.lock().registry.contains(id)
    }
}

impl Shared {
    /// Runs one pass over every display.
    fn compose_displays(&self) -> u64 {
        let _pass = self.pass_lock.lock();

        let (epoch, jobs) = {
            let mut state = self.state.lock();
            let latched = state.latch_pending();
            if latched > 0 {
                tracing::trace!("pass latched {} layers", latched);
            }
            let jobs: Vec<(DisplayId, PixelRect, Vec<LayerSnapshot>)> = state
                .displays
                .iter()
                .map(|(id, display)| (id, display.bounds(), state.snapshot_stack(display.layer_stack(), true)))
                .collect();
            (state.commit_epoch, jobs)
        };

        let mut totals = CompositorStats::default();
        let frames: Vec<(DisplayId, PixelBuffer)> = jobs
            .into_iter()
            .map(|(id, region, layers)| {
                let composition = self.compositor.composite(&layers, region);
                totals.layers_composited += composition.stats.layers_composited;
                totals.pixels_blended += composition.stats.pixels_blended;
                totals.composition_time_ms += composition.stats.composition_time_ms;
                (id, composition.buffer)
            })
            .collect();

        {
            let mut state = self.state.lock();
            for (id, frame) in frames {
                // The display may have been replaced while blending.
                if let Some(display) = state.displays.get_mut(id) {
                    display.present(frame);
                }
            }
            state.composited_epoch = state.composited_epoch.max(epoch);
            state.frames_composited += 1;
            state.last_pass = totals;
        }
        self.frame_done.notify_all();

        epoch
    }

    /// Blocks until a pass has incorporated `epoch`, or runs one inline
    /// when no composition thread is running.
    fn wait_for_present(&self, epoch: u64) -> bool {
        let deadline = Instant::now() + self.config.transaction_timeout();
        let mut state = self.state.lock();
        while state.composited_epoch < epoch {
            if !state.running {
                drop(state);
                self.compose_displays();
                return true;
            }
            if self.frame_done.wait_until(&mut state, deadline).timed_out() {
                let presented = state.composited_epoch >= epoch;
                if !presented {
                    tracing::warn!(
                        "commit epoch {} not presented within {}ms",
                        epoch,
                        self.config.transaction_timeout_ms
                    );
                }
                return presented;
            }
        }
        true
    }

    /// Sleeps until there is something new to show or the refresh interval
    /// elapses. Returns `false` once the service is stopping.
    fn wait_for_work(&self) -> bool {
        let mut state = self.state.lock();
        if state.running && state.composited_epoch >= state.commit_epoch {
            let _ = self.wake.wait_for(&mut state, self.config.refresh_interval());
        }
        state.running
    }

    fn run(weak: Weak<Shared>) {
        tracing::debug!("composition thread running");
        while let Some(shared) = weak.upgrade() {
            if !shared.wait_for_work() {
                break;
            }
            shared.compose_displays();
        }
        tracing::debug!("composition thread exiting");
    }
}

impl Composer {
    /// Create a composer and the displays named in `config`.
    pub fn new(config: CompositorConfig) -> CompositorResult<Self> {
        config.validate()?;

        let mut displays: SlotMap<DisplayId, Display> = SlotMap::with_key();
        for display in &config.displays {
            displays.insert_with_key(|id| {
                Display::new(id, display.name.clone(), display.width, display.height, display.layer_stack)
            });
        }

        let state = ComposerState {
            registry: LayerRegistry::new(config.limits()),
            deferred: DeferredTransactions::new(),
            displays,
            commit_epoch: 0,
            composited_epoch: 0,
            running: false,
            next_transaction: 0,
            frames_composited: 0,
            last_pass: CompositorStats::default(),
        };

        tracing::debug!("composer created with {} displays", config.displays.len());

        Ok(Self {
            shared: Arc::new(Shared {
                compositor: Compositor::new(config.clear_color),
                config,
                state: Mutex::new(state),
                wake: Condvar::new(),
                frame_done: Condvar::new(),
                pass_lock: Mutex::new(()),
                thread: Mutex::new(None),
            }),
        })
    }

    pub fn config(&self) -> &CompositorConfig {
        &self.shared.config
    }

    pub(crate) fn compositor(&self) -> &Compositor {
        &self.shared.compositor
    }

    // -- Service lifecycle --

    /// Start the composition thread. Does nothing if it is already running.
    pub fn start(&self) -> CompositorResult<()> {
        let mut thread = self.shared.thread.lock();
        if thread.is_some() {
            return Ok(());
        }

        self.shared.state.lock().running = true;
        let weak = Arc::downgrade(&self.shared);
        let spawned = std::thread::Builder::new()
            .name("composer".to_string())
            .spawn(move || Shared::run(weak));

        match spawned {
            Ok(handle) => {
                *thread = Some(handle);
                tracing::info!("Composition thread started");
                Ok(())
            }
            Err(e) => {
                self.shared.state.lock().running = false;
                Err(CompositorError::out_of_resources(format!(
                    "failed to spawn composition thread: {}",
                    e
                )))
            }
        }
    }

    /// Stop the composition thread and wait for it to exit.
    pub fn stop(&self) {
        let Some(handle) = self.shared.thread.lock().take() else {
            return;
        };

        self.shared.state.lock().running = false;
        self.shared.wake.notify_all();
        self.shared.frame_done.notify_all();
        if handle.join().is_err() {
            tracing::error!("composition thread panicked");
        }
        tracing::info!("Composition thread stopped");
    }

    pub fn is_running(&self) -> bool {
        self.shared.state.lock().running
    }

    /// Run a composite pass over every display on the calling thread.
    pub fn compose(&self) {
        self.shared.compose_displays();
    }

    // -- Layers --

    pub fn create_layer(
        &self,
        name: &str,
        layer_stack: u32,
        width: u32,
        height: u32,
        format: PixelFormat,
        flags: LayerFlags,
    ) -> CompositorResult<LayerId> {
        self.create_layer_with(
            LayerDescriptor::new(name, width, height)
                .with_layer_stack(layer_stack)
                .with_format(format)
                .with_flags(flags),
        )
    }

    pub fn create_layer_with(&self, descriptor: LayerDescriptor) -> CompositorResult<LayerId> {
        let name = descriptor.name.clone();
        let id = self.shared.state.lock().registry.create_layer(descriptor)?;
        tracing::debug!("created layer '{}' as {:?}", name, id);
        Ok(id)
    }

    /// Destroy a layer. Transactions parked on it are applied in order.
    pub fn destroy_layer(&self, id: LayerId) -> CompositorResult<()> {
        {
            let mut state = self.shared.state.lock();
            let layer = state.registry.destroy(id)?;

            let flushed = state.deferred.take_all(id);
            if !flushed.is_empty() {
                tracing::warn!(
                    "flushing {} transactions parked on destroyed layer '{}'",
                    flushed.len(),
                    layer.name()
                );
            }
            state.apply_parked(flushed);
            state.commit_epoch += 1;
            tracing::debug!("destroyed layer '{}'", layer.name());
        }
        self.shared.wake.notify_all();
        Ok(())
    }

    pub fn layer_info(&self, id: LayerId) -> CompositorResult<LayerInfo> {
        Ok(self.shared.state.lock().layer(id)?.info())
    }

    /// Frame number the next buffer submitted to `id` will receive.
    pub fn next_frame_number(&self, id: LayerId) -> CompositorResult<FrameNumber> {
        Ok(self.shared.state.lock().layer(id)?.frame_source().next_frame_number())
    }

    /// Layers of `layer_stack`, back to front.
    pub fn layers_for_stack(&self, layer_stack: u32) -> Vec<LayerId> {
        self.shared
            .state
            .lock()
            .registry
            .layers_for_stack(layer_stack)
            .iter()
            .map(|layer| layer.id())
            .collect()
    }

    pub(crate) fn snapshot_stack(&self, layer_stack: u32, include_secure: bool) -> Vec<LayerSnapshot> {
        self.shared.state.lock().snapshot_stack(layer_stack, include_secure)
    }

    // -- Transactions --

    pub fn begin_transaction(&self) -> Transaction {
        let id = {
            let mut state = self.shared.state.lock();
            state.next_transaction += 1;
            TransactionId(state.next_transaction)
        };
        let lookup: Arc<dyn LayerLookup> = self.shared.clone();
        Transaction::new(id, lookup)
    }

    /// Commit a transaction.
    ///
    /// With `wait`, an applied transaction returns only once a composite
    /// pass has incorporated it (or the transaction timeout expires).
    pub fn commit_transaction(&self, transaction: Transaction, wait: bool) -> CommitReport {
        let (id, mutations, defer) = transaction.into_parts();
        let mut report = CommitReport::new(id);

        let epoch = {
            let mut state = self.shared.state.lock();

            if let Some(condition) = defer {
                let reached = state
                    .registry
                    .get(condition.barrier)
                    .map(|barrier| barrier.frame_source().has_reached(condition.frame_number));
                match reached {
                    Some(reached) if !reached || state.deferred.has_parked(condition.barrier) => {
                        state.deferred.park(
                            condition.barrier,
                            ParkedTransaction {
                                id,
                                frame_number: condition.frame_number,
                                mutations,
                            },
                        );
                        report.deferred = true;
                        return report;
                    }
                    Some(_) => {}
                    None => {
                        tracing::warn!(
                            "{}: barrier layer {:?} is gone, applying immediately",
                            id,
                            condition.barrier
                        );
                    }
                }
            }

            report.failures = state.apply(id, &mutations);
            report.applied = true;
            state.commit_epoch
        };
        self.shared.wake.notify_all();

        if wait {
            report.presented = self.shared.wait_for_present(epoch);
        }
        report
    }

    /// Number of transactions parked behind barrier frames.
    pub fn parked_transactions(&self) -> usize {
        self.shared.state.lock().deferred.len()
    }

    // -- Buffers --

    /// Validate raw pixel data and submit it to `layer`.
    pub fn submit_buffer(
        &self,
        layer: LayerId,
        data: impl Into<Arc<[u8]>>,
        width: u32,
        height: u32,
        stride: u32,
        format: PixelFormat,
    ) -> CompositorResult<FrameNumber> {
        self.shared
            .config
            .limits()
            .check_buffer(width, height, format.bytes_per_pixel())?;
        let buffer = GraphicBuffer::new(data, width, height, stride, format)?;
        self.submit(layer, buffer)
    }

    /// Submit a buffer to `layer`, latch it and release any transactions
    /// its new frame number satisfies.
    pub fn submit(&self, layer: LayerId, buffer: GraphicBuffer) -> CompositorResult<FrameNumber> {
        self.shared
            .config
            .limits()
            .check_buffer(buffer.width(), buffer.height(), buffer.format().bytes_per_pixel())?;
        let buffer = Arc::new(buffer);

        let frame_number = {
            let mut state = self.shared.state.lock();
            let frame_number = state.layer_mut(layer)?.queue_buffer(buffer)?;
            state.latch_layer(layer);
            frame_number
        };
        self.shared.wake.notify_all();

        Ok(frame_number)
    }

    /// Queue a buffer on `layer` without latching it.
    ///
    /// The frame stays pending until the next composite pass or an explicit
    /// [`Composer::latch`]. At most `max_queued_frames` frames may be pending;
    /// beyond that the buffer is refused with `OutOfResources` and no frame
    /// number is consumed.
    pub fn queue_buffer(&self, layer: LayerId, buffer: GraphicBuffer) -> CompositorResult<FrameNumber> {
        self.shared
            .config
            .limits()
            .check_buffer(buffer.width(), buffer.height(), buffer.format().bytes_per_pixel())?;

        let frame_number = {
            let mut state = self.shared.state.lock();
            let frame_number = state.layer_mut(layer)?.queue_buffer(Arc::new(buffer))?;
            state.commit_epoch += 1;
            frame_number
        };
        self.shared.wake.notify_all();

        Ok(frame_number)
    }

    /// Latch every frame queued on `layer`. Returns its committed frame number.
    pub fn latch(&self, layer: LayerId) -> CompositorResult<FrameNumber> {
        let committed = self
            .shared
            .state
            .lock()
            .latch_layer(layer)
            .ok_or_else(|| CompositorError::not_found(format!("layer {:?}", layer)))?;
        self.shared.wake.notify_all();
        Ok(committed)
    }

    /// Frames submitted to `layer` and not yet latched.
    pub fn pending_frames(&self, layer: LayerId) -> CompositorResult<usize> {
        Ok(self.shared.state.lock().layer(layer)?.frame_source().pending())
    }

    /// Fill `layer` with one color at its requested size.
    pub fn fill_layer(&self, layer: LayerId, color: Color) -> CompositorResult<FrameNumber> {
        let (size, format) = {
            let state = self.shared.state.lock();
            let target = state.layer(layer)?;
            (target.drawing().requested_size, target.format())
        };
        let buffer = GraphicBuffer::filled(size.width, size.height, format, color)?;
        self.submit(layer, buffer)
    }

    // -- Displays --

    pub fn create_display(&self, name: &str, width: u32, height: u32, layer_stack: u32) -> CompositorResult<DisplayId> {
        if width == 0 || height == 0 {
            return Err(CompositorError::invalid(format!(
                "display '{}' has empty size {}x{}",
                name, width, height
            )));
        }
        self.shared
            .config
            .limits()
            .check_buffer(width, height, PixelBuffer::BYTES_PER_PIXEL)?;

        let mut state = self.shared.state.lock();
        if state.displays.values().any(|display| display.name() == name) {
            return Err(CompositorError::invalid(format!("display '{}' already exists", name)));
        }
        let id = state
            .displays
            .insert_with_key(|id| Display::new(id, name, width, height, layer_stack));
        state.commit_epoch += 1;
        drop(state);

        self.shared.wake.notify_all();
        tracing::debug!("created display '{}' ({}x{}) on stack {}", name, width, height, layer_stack);
        Ok(id)
    }

    pub fn set_display_layer_stack(&self, display: DisplayId, layer_stack: u32) -> CompositorResult<()> {
        {
            let mut state = self.shared.state.lock();
            state.display_mut(display)?.set_layer_stack(layer_stack);
            state.commit_epoch += 1;
        }
        self.shared.wake.notify_all();
        Ok(())
    }

    /// Most recent frame presented on `display`, if any pass has run.
    pub fn display_frame(&self, display: DisplayId) -> CompositorResult<Option<Arc<PixelBuffer>>> {
        Ok(self.shared.state.lock().display_mut(display)?.last_frame())
    }

    pub fn display_info(&self, display: DisplayId) -> CompositorResult<DisplayInfo> {
        Ok(self.shared.state.lock().display_mut(display)?.info())
    }

    pub fn displays(&self) -> Vec<DisplayInfo> {
        self.shared.state.lock().displays.values().map(Display::info).collect()
    }

    pub fn find_display(&self, name: &str) -> Option<DisplayId> {
        self.shared
            .state
            .lock()
            .displays
            .values()
            .find(|display| display.name() == name)
            .map(Display::id)
    }

    pub fn stats(&self) -> ComposerStats {
        let state = self.shared.state.lock();
        ComposerStats {
            layers: state.registry.len(),
            displays: state.displays.len(),
            parked_transactions: state.deferred.len(),
            frames_composited: state.frames_composited,
            last_pass: state.last_pass.clone(),
        }
    }
}
