//! Layer ownership and lookup.

use crate::layer::{Layer, LayerDescriptor, LayerId};
use common::error::{CompositorError, CompositorResult};
use slotmap::SlotMap;

/// Resource limits enforced when layers are created.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegistryLimits {
    pub max_layers: usize,
    pub max_buffer_dimension: u32,
    pub max_buffer_bytes: usize,
    pub max_queued_frames: usize,
}

impl Default for RegistryLimits {
    fn default() -> Self {
        Self {
            max_layers: 4096,
            max_buffer_dimension: 8192,
            max_buffer_bytes: 64 * 1024 * 1024,
            max_queued_frames: 3,
        }
    }
}

impl RegistryLimits {
    /// Rejects buffer geometry the compositor refuses to allocate.
    pub fn check_buffer(&self, width: u32, height: u32, bytes_per_pixel: usize) -> CompositorResult<()> {
        if width > self.max_buffer_dimension || height > self.max_buffer_dimension {
            return Err(CompositorError::out_of_resources(format!(
                "{}x{} exceeds the maximum dimension {}",
                width, height, self.max_buffer_dimension
            )));
        }
        let bytes = u64::from(width) * u64::from(height) * bytes_per_pixel as u64;
        if bytes > self.max_buffer_bytes as u64 {
            return Err(CompositorError::out_of_resources(format!(
                "{}x{} needs {} bytes, limit is {}",
                width, height, bytes, self.max_buffer_bytes
            )));
        }
        Ok(())
    }
}

/// All live layers, keyed by generational ids.
#[derive(Debug)]
pub struct LayerRegistry {
    layers: SlotMap<LayerId, Layer>,
    next_sequence: u64,
    limits: RegistryLimits,
}

impl LayerRegistry {
    pub fn new(limits: RegistryLimits) -> Self {
        Self {
            layers: SlotMap::with_key(),
            next_sequence: 0,
            limits,
        }
    }

    pub fn limits(&self) -> &RegistryLimits {
        &self.limits
    }

    pub fn create_layer(&mut self, descriptor: LayerDescriptor) -> CompositorResult<LayerId> {
        let size = descriptor.size;
        if size.is_empty() {
            return Err(CompositorError::invalid(format!(
                "layer '{}' has empty size {}x{}",
                descriptor.name, size.width, size.height
            )));
        }
        if self.layers.len() >= self.limits.max_layers {
            return Err(CompositorError::out_of_resources(format!(
                "layer limit {} reached",
                self.limits.max_layers
            )));
        }
        self.limits
            .check_buffer(size.width, size.height, descriptor.format.bytes_per_pixel())?;

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let max_queued_frames = self.limits.max_queued_frames;
        let id = self
            .layers
            .insert_with_key(|id| Layer::new(id, sequence, descriptor, max_queued_frames));

        Ok(id)
    }

    /// Removes a layer and returns it.
    pub fn destroy(&mut self, id: LayerId) -> CompositorResult<Layer> {
        self.layers
            .remove(id)
            .ok_or_else(|| CompositorError::not_found(format!("layer {:?}", id)))
    }

    pub fn contains(&self, id: LayerId) -> bool {
        self.layers.contains_key(id)
    }

    pub fn get(&self, id: LayerId) -> Option<&Layer> {
        self.layers.get(id)
    }

    pub fn get_mut(&mut self, id: LayerId) -> Option<&mut Layer> {
        self.layers.get_mut(id)
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Layer> {
        self.layers.values()
    }

    /// Live layers of `layer_stack`, back to front by `(z, sequence)`.
    pub fn layers_for_stack(&self, layer_stack: u32) -> Vec<&Layer> {
        let mut layers: Vec<&Layer> = self
            .layers
            .values()
            .filter(|layer| layer.drawing().layer_stack == layer_stack)
            .collect();
        layers.sort_by_key(|layer| (layer.drawing().z, layer.sequence()));
        layers
    }
}

impl Default for LayerRegistry {
    fn default() -> Self {
        Self::new(RegistryLimits::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_destroy() {
        let mut registry = LayerRegistry::default();
        let id = registry.create_layer(LayerDescriptor::new("fg", 64, 64)).unwrap();
        assert!(registry.contains(id));
        assert_eq!(registry.get(id).unwrap().name(), "fg");

        registry.destroy(id).unwrap();
        assert!(!registry.contains(id));
        assert!(matches!(registry.destroy(id), Err(CompositorError::NotFound(_))));
    }

    #[test]
    fn test_destroyed_ids_are_not_reused() {
        let mut registry = LayerRegistry::default();
        let old = registry.create_layer(LayerDescriptor::new("a", 1, 1)).unwrap();
        registry.destroy(old).unwrap();
        let new = registry.create_layer(LayerDescriptor::new("b", 1, 1)).unwrap();
        assert_ne!(old, new);
        assert!(registry.get(old).is_none());
    }

    #[test]
    fn test_creation_limits() {
        let limits = RegistryLimits {
            max_layers: 1,
            max_buffer_dimension: 100,
            max_buffer_bytes: 50 * 50 * 4,
            max_queued_frames: 3,
        };
        let mut registry = LayerRegistry::new(limits);

        assert!(matches!(
            registry.create_layer(LayerDescriptor::new("empty", 0, 4)),
            Err(CompositorError::InvalidArgument(_))
        ));
        assert!(matches!(
            registry.create_layer(LayerDescriptor::new("wide", 101, 1)),
            Err(CompositorError::OutOfResources(_))
        ));
        assert!(matches!(
            registry.create_layer(LayerDescriptor::new("heavy", 60, 60)),
            Err(CompositorError::OutOfResources(_))
        ));

        registry.create_layer(LayerDescriptor::new("ok", 50, 50)).unwrap();
        assert!(matches!(
            registry.create_layer(LayerDescriptor::new("extra", 1, 1)),
            Err(CompositorError::OutOfResources(_))
        ));
    }

    #[test]
    fn test_stack_order_by_z_then_creation() {
        let mut registry = LayerRegistry::default();
        let a = registry.create_layer(LayerDescriptor::new("a", 1, 1)).unwrap();
        let b = registry.create_layer(LayerDescriptor::new("b", 1, 1)).unwrap();
        let c = registry.create_layer(LayerDescriptor::new("c", 1, 1)).unwrap();
        let other = registry
            .create_layer(LayerDescriptor::new("other", 1, 1).with_layer_stack(1))
            .unwrap();

        let layer = registry.get_mut(a).unwrap();
        layer.set_z_order(5);
        layer.commit();

        let order: Vec<LayerId> = registry.layers_for_stack(0).iter().map(|l| l.id()).collect();
        assert_eq!(order, vec![b, c, a]);

        let order: Vec<LayerId> = registry.layers_for_stack(1).iter().map(|l| l.id()).collect();
        assert_eq!(order, vec![other]);
    }

    #[test]
    fn test_pending_z_does_not_reorder() {
        let mut registry = LayerRegistry::default();
        let a = registry.create_layer(LayerDescriptor::new("a", 1, 1)).unwrap();
        let b = registry.create_layer(LayerDescriptor::new("b", 1, 1)).unwrap();
        registry.get_mut(a).unwrap().set_z_order(10);

        let order: Vec<LayerId> = registry.layers_for_stack(0).iter().map(|l| l.id()).collect();
        assert_eq!(order, vec![a, b]);
    }
}
