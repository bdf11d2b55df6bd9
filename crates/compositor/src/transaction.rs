//! Client transactions.
//!
//! A [`Transaction`] batches property mutations for any number of layers.
//! Nothing reaches a layer until the composer commits the transaction, and
//! then every mutation is applied inside a single critical section so a
//! composite pass sees either all of them or none.

use crate::frame_source::FrameNumber;
use crate::layer::{Layer, LayerFlags, LayerId, LayerMatrix};
use crate::registry::LayerRegistry;
use common::error::{CompositorError, CompositorResult};
use common::geometry::{PixelRect, Point, Size};
use indexmap::IndexMap;
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;

/// Identifier of a transaction, unique per composer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(pub u64);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn#{}", self.0)
    }
}

/// Lets staging calls reject layers that do not exist.
pub trait LayerLookup: Send + Sync {
    fn contains_layer(&self, id: LayerId) -> bool;
}

/// Gate attached to a whole transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeferCondition {
    /// Layer whose frame source releases the transaction.
    pub barrier: LayerId,
    /// Frame number the barrier must have committed.
    pub frame_number: FrameNumber,
}

/// Staged property changes for one layer. Each property is last-writer-wins.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LayerMutation {
    pub position: Option<Point>,
    pub size: Option<Size>,
    pub crop: Option<Option<PixelRect>>,
    pub final_crop: Option<Option<PixelRect>>,
    pub matrix: Option<LayerMatrix>,
    pub alpha: Option<f32>,
    pub layer_stack: Option<u32>,
    /// Accumulated `(value, mask)` flag update.
    pub flags: Option<(LayerFlags, LayerFlags)>,
    pub z: Option<i32>,
}

impl LayerMutation {
    pub fn is_empty(&self) -> bool {
        *self == LayerMutation::default()
    }

    fn push_flags(&mut self, value: LayerFlags, mask: LayerFlags) {
        let (prev_value, prev_mask) = self.flags.unwrap_or_default();
        self.flags = Some((prev_value.masked_update(value, mask), prev_mask | mask));
    }

    /// Folds `other` into `self`; `other` wins on every property it sets.
    pub fn merge(&mut self, other: LayerMutation) {
        if other.position.is_some() {
            self.position = other.position;
        }
        if other.size.is_some() {
            self.size = other.size;
        }
        if other.crop.is_some() {
            self.crop = other.crop;
        }
        if other.final_crop.is_some() {
            self.final_crop = other.final_crop;
        }
        if other.matrix.is_some() {
            self.matrix = other.matrix;
        }
        if other.alpha.is_some() {
            self.alpha = other.alpha;
        }
        if other.layer_stack.is_some() {
            self.layer_stack = other.layer_stack;
        }
        if let Some((value, mask)) = other.flags {
            self.push_flags(value, mask);
        }
        if other.z.is_some() {
            self.z = other.z;
        }
    }

    /// Checks every staged value without touching any layer.
    pub fn validate(&self) -> CompositorResult<()> {
        if let Some(position) = self.position {
            if !position.is_finite() {
                return Err(CompositorError::invalid(format!("position {:?} is not finite", position)));
            }
        }
        if let Some(size) = self.size {
            if size.is_empty() {
                return Err(CompositorError::invalid(format!(
                    "layer size {}x{} is empty",
                    size.width, size.height
                )));
            }
        }
        if let Some(matrix) = self.matrix {
            if !matrix.is_finite() {
                return Err(CompositorError::invalid(format!("matrix {:?} is not finite", matrix)));
            }
        }
        if let Some(alpha) = self.alpha {
            if !(0.0..=1.0).contains(&alpha) {
                return Err(CompositorError::invalid(format!("alpha {} outside [0, 1]", alpha)));
            }
        }
        Ok(())
    }

    /// Stages every property on `layer`.
    pub fn apply_to(&self, layer: &mut Layer) -> CompositorResult<()> {
        self.validate()?;

        if let Some(position) = self.position {
            layer.set_position(position.x, position.y)?;
        }
        if let Some(size) = self.size {
            layer.set_size(size.width, size.height)?;
        }
        if let Some(crop) = self.crop {
            layer.set_crop(crop);
        }
        if let Some(crop) = self.final_crop {
            layer.set_final_crop(crop);
        }
        if let Some(matrix) = self.matrix {
            layer.set_matrix(matrix)?;
        }
        if let Some(alpha) = self.alpha {
            layer.set_alpha(alpha)?;
        }
        if let Some(layer_stack) = self.layer_stack {
            layer.set_layer_stack(layer_stack);
        }
        if let Some((value, mask)) = self.flags {
            layer.set_flags(value, mask);
        }
        if let Some(z) = self.z {
            layer.set_z_order(z);
        }
        Ok(())
    }
}

/// A mutation that could not be applied at commit time.
#[derive(Clone, Debug, PartialEq)]
pub struct LayerFailure {
    pub layer: LayerId,
    pub error: CompositorError,
}

/// Failures collected while committing one transaction.
pub type LayerFailures = SmallVec<[LayerFailure; 2]>;

/// Outcome of committing a transaction.
#[derive(Clone, Debug, PartialEq)]
pub struct CommitReport {
    pub transaction: TransactionId,
    /// The mutations reached the drawing state.
    pub applied: bool,
    /// The transaction was parked behind a barrier frame.
    pub deferred: bool,
    /// A composite pass incorporated the state before the call returned.
    pub presented: bool,
    pub failures: LayerFailures,
}

impl CommitReport {
    pub(crate) fn new(transaction: TransactionId) -> Self {
        Self {
            transaction,
            applied: false,
            deferred: false,
            presented: false,
            failures: SmallVec::new(),
        }
    }

    /// Whether every mutation was applied.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// A batch of layer mutations, committed atomically.
pub struct Transaction {
    id: TransactionId,
    lookup: Arc<dyn LayerLookup>,
    mutations: IndexMap<LayerId, LayerMutation>,
    defer: Option<DeferCondition>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("mutations", &self.mutations)
            .field("defer", &self.defer)
            .finish()
    }
}

impl Transaction {
    pub fn new(id: TransactionId, lookup: Arc<dyn LayerLookup>) -> Self {
        Self {
            id,
            lookup,
            mutations: IndexMap::new(),
            defer: None,
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.values().all(LayerMutation::is_empty)
    }

    /// Number of layers touched.
    pub fn layer_count(&self) -> usize {
        self.mutations.len()
    }

    pub fn deferral(&self) -> Option<DeferCondition> {
        self.defer
    }

    /// Staged mutation for `layer`, if any.
    pub fn mutation(&self, layer: LayerId) -> Option<&LayerMutation> {
        self.mutations.get(&layer)
    }

    fn check_layer(&self, layer: LayerId) -> CompositorResult<()> {
        if self.lookup.contains_layer(layer) {
            Ok(())
        } else {
            Err(CompositorError::not_found(format!("layer {:?}", layer)))
        }
    }

    fn stage(&mut self, layer: LayerId, update: impl FnOnce(&mut LayerMutation)) -> CompositorResult<&mut Self> {
        self.check_layer(layer)?;
        update(self.mutations.entry(layer).or_default());
        Ok(self)
    }

    pub fn set_position(&mut self, layer: LayerId, x: f32, y: f32) -> CompositorResult<&mut Self> {
        let position = Point::new(x, y);
        if !position.is_finite() {
            return Err(CompositorError::invalid(format!("position ({}, {}) is not finite", x, y)));
        }
        self.stage(layer, |m| m.position = Some(position))
    }

    pub fn set_size(&mut self, layer: LayerId, width: u32, height: u32) -> CompositorResult<&mut Self> {
        let size = Size::new(width, height);
        if size.is_empty() {
            return Err(CompositorError::invalid(format!("layer size {}x{} is empty", width, height)));
        }
        self.stage(layer, |m| m.size = Some(size))
    }

    /// Restricts sampled texels to `crop` (buffer coordinates); `None` clears it.
    pub fn set_crop(&mut self, layer: LayerId, crop: Option<PixelRect>) -> CompositorResult<&mut Self> {
        self.stage(layer, |m| m.crop = Some(crop))
    }

    /// Restricts visible pixels to `crop` (screen coordinates); `None` clears it.
    pub fn set_final_crop(&mut self, layer: LayerId, crop: Option<PixelRect>) -> CompositorResult<&mut Self> {
        self.stage(layer, |m| m.final_crop = Some(crop))
    }

    pub fn set_matrix(
        &mut self,
        layer: LayerId,
        dsdx: f32,
        dtdx: f32,
        dsdy: f32,
        dtdy: f32,
    ) -> CompositorResult<&mut Self> {
        let matrix = LayerMatrix::new(dsdx, dtdx, dsdy, dtdy);
        if !matrix.is_finite() {
            return Err(CompositorError::invalid(format!("matrix {:?} is not finite", matrix)));
        }
        self.stage(layer, |m| m.matrix = Some(matrix))
    }

    pub fn set_alpha(&mut self, layer: LayerId, alpha: f32) -> CompositorResult<&mut Self> {
        if !(0.0..=1.0).contains(&alpha) {
            return Err(CompositorError::invalid(format!("alpha {} outside [0, 1]", alpha)));
        }
        self.stage(layer, |m| m.alpha = Some(alpha))
    }

    pub fn set_layer_stack(&mut self, layer: LayerId, layer_stack: u32) -> CompositorResult<&mut Self> {
        self.stage(layer, |m| m.layer_stack = Some(layer_stack))
    }

    pub fn set_flags(&mut self, layer: LayerId, value: LayerFlags, mask: LayerFlags) -> CompositorResult<&mut Self> {
        self.stage(layer, |m| m.push_flags(value, mask))
    }

    pub fn set_z_order(&mut self, layer: LayerId, z: i32) -> CompositorResult<&mut Self> {
        self.stage(layer, |m| m.z = Some(z))
    }

    pub fn show(&mut self, layer: LayerId) -> CompositorResult<&mut Self> {
        self.set_flags(layer, LayerFlags::empty(), LayerFlags::HIDDEN)
    }

    pub fn hide(&mut self, layer: LayerId) -> CompositorResult<&mut Self> {
        self.set_flags(layer, LayerFlags::HIDDEN, LayerFlags::HIDDEN)
    }

    /// Holds the whole transaction until `barrier` commits `frame_number`.
    pub fn defer_until(&mut self, barrier: LayerId, frame_number: FrameNumber) -> CompositorResult<&mut Self> {
        self.check_layer(barrier)?;
        self.defer = Some(DeferCondition {
            barrier,
            frame_number,
        });
        Ok(self)
    }

    /// Folds `other` into this transaction; `other` wins per property and
    /// replaces the deferral when it has one.
    pub fn merge(&mut self, other: Transaction) -> &mut Self {
        for (layer, mutation) in other.mutations {
            self.mutations.entry(layer).or_default().merge(mutation);
        }
        if other.defer.is_some() {
            self.defer = other.defer;
        }
        self
    }

    pub(crate) fn into_parts(self) -> (TransactionId, IndexMap<LayerId, LayerMutation>, Option<DeferCondition>) {
        (self.id, self.mutations, self.defer)
    }
}

/// Applies a batch to the registry: stage every mutation, then commit every
/// touched layer. Layers destroyed since staging are reported as conflicts
/// and skipped; the rest of the batch still lands.
pub(crate) fn apply_mutations(
    registry: &mut LayerRegistry,
    transaction: TransactionId,
    mutations: &IndexMap<LayerId, LayerMutation>,
) -> LayerFailures {
    let mut failures = LayerFailures::new();
    let mut touched: SmallVec<[LayerId; 8]> = SmallVec::new();

    for (&id, mutation) in mutations {
        let Some(layer) = registry.get_mut(id) else {
            tracing::warn!("{}: dropping mutation for destroyed layer {:?}", transaction, id);
            failures.push(LayerFailure {
                layer: id,
                error: CompositorError::conflict(format!("layer {:?} destroyed before commit", id)),
            });
            continue;
        };

        if let Err(error) = mutation.validate() {
            tracing::warn!("{}: rejecting mutation for layer '{}': {}", transaction, layer.name(), error);
            failures.push(LayerFailure { layer: id, error });
            continue;
        }

        if let Err(error) = mutation.apply_to(layer) {
            failures.push(LayerFailure { layer: id, error });
            continue;
        }
        touched.push(id);
    }

    for id in touched {
        if let Some(layer) = registry.get_mut(id) {
            layer.commit();
        }
    }

    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashSet;

    #[derive(Default)]
    struct FakeLookup {
        live: Mutex<HashSet<LayerId>>,
    }

    impl LayerLookup for FakeLookup {
        fn contains_layer(&self, id: LayerId) -> bool {
            self.live.lock().contains(&id)
        }
    }

    fn setup() -> (Arc<FakeLookup>, LayerId, LayerId) {
        let mut ids: slotmap::SlotMap<LayerId, ()> = slotmap::SlotMap::with_key();
        let a = ids.insert(());
        let b = ids.insert(());
        let lookup = Arc::new(FakeLookup::default());
        lookup.live.lock().insert(a);
        (lookup, a, b)
    }

    #[test]
    fn test_last_writer_wins() {
        let (lookup, a, _) = setup();
        let mut txn = Transaction::new(TransactionId(1), lookup);
        txn.set_position(a, 1.0, 2.0).unwrap();
        txn.set_alpha(a, 0.5).unwrap();
        txn.set_position(a, 3.0, 4.0).unwrap();

        let mutation = txn.mutation(a).unwrap();
        assert_eq!(mutation.position, Some(Point::new(3.0, 4.0)));
        assert_eq!(mutation.alpha, Some(0.5));
        assert_eq!(txn.layer_count(), 1);
    }

    #[test]
    fn test_flag_updates_compose() {
        let (lookup, a, _) = setup();
        let mut txn = Transaction::new(TransactionId(1), lookup);
        txn.set_flags(a, LayerFlags::OPAQUE, LayerFlags::OPAQUE).unwrap();
        txn.hide(a).unwrap();
        txn.show(a).unwrap();

        let (value, mask) = txn.mutation(a).unwrap().flags.unwrap();
        assert_eq!(value, LayerFlags::OPAQUE);
        assert_eq!(mask, LayerFlags::OPAQUE | LayerFlags::HIDDEN);
    }

    #[test]
    fn test_staging_fails_fast() {
        let (lookup, a, b) = setup();
        let mut txn = Transaction::new(TransactionId(1), lookup);

        assert!(matches!(txn.set_alpha(b, 0.5), Err(CompositorError::NotFound(_))));
        assert!(matches!(txn.set_alpha(a, 2.0), Err(CompositorError::InvalidArgument(_))));
        assert!(matches!(txn.set_size(a, 0, 10), Err(CompositorError::InvalidArgument(_))));
        assert!(matches!(txn.defer_until(b, 1), Err(CompositorError::NotFound(_))));

        // The transaction stays usable after a failed call.
        txn.set_alpha(a, 0.25).unwrap();
        assert_eq!(txn.mutation(a).unwrap().alpha, Some(0.25));
        assert!(txn.mutation(b).is_none());
    }

    #[test]
    fn test_defer_and_merge() {
        let (lookup, a, _) = setup();
        let mut first = Transaction::new(TransactionId(1), lookup.clone());
        first.set_alpha(a, 0.75).unwrap().set_z_order(a, 3).unwrap();

        let mut second = Transaction::new(TransactionId(2), lookup);
        second.set_alpha(a, 0.25).unwrap();
        second.defer_until(a, 7).unwrap();

        first.merge(second);
        let mutation = first.mutation(a).unwrap();
        assert_eq!(mutation.alpha, Some(0.25));
        assert_eq!(mutation.z, Some(3));
        assert_eq!(
            first.deferral(),
            Some(DeferCondition {
                barrier: a,
                frame_number: 7
            })
        );
    }

    #[test]
    fn test_empty_transaction() {
        let (lookup, _, _) = setup();
        let txn = Transaction::new(TransactionId(9), lookup);
        assert!(txn.is_empty());
        assert_eq!(txn.id().to_string(), "txn#9");
    }
}
