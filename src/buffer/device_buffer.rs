//! Reference-counted device memory trees

use std::fmt;
use std::sync::Arc;

use crate::platform::{DeviceMemory, DevicePlatform, DriverResult, ShapedBuffer};
use crate::shape::Shape;
use crate::transfer::TransferEvent;

/// Device memory for one shape node, shared through `Arc`.
///
/// Tuple nodes own an index table allocation and hold their elements as
/// shared children, so an element can outlive its parent tuple once
/// destructured. Memory goes back to the platform when the last `Arc`
/// is dropped.
pub struct SharedDeviceBuffer {
    platform: Arc<dyn DevicePlatform>,
    on_device_shape: Shape,
    device_ordinal: usize,
    memory: DeviceMemory,
    children: Vec<Arc<SharedDeviceBuffer>>,
    definition_event: TransferEvent,
}

impl fmt::Debug for SharedDeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedDeviceBuffer")
            .field("shape", &self.on_device_shape.to_string())
            .field("device_ordinal", &self.device_ordinal)
            .field("memory", &self.memory)
            .field("children", &self.children.len())
            .field("defined", &self.definition_event.is_ready())
            .finish()
    }
}

impl SharedDeviceBuffer {
    /// Allocate uninitialized memory for `shape` on `device_ordinal`.
    ///
    /// Every node starts with a pending definition event. If any allocation
    /// fails, the ones already made are released before returning.
    pub fn allocate(
        platform: &Arc<dyn DevicePlatform>,
        shape: &Shape,
        device_ordinal: usize,
    ) -> DriverResult<Arc<Self>> {
        let children = shape
            .tuple_elements()
            .iter()
            .map(|element| Self::allocate(platform, element, device_ordinal))
            .collect::<DriverResult<Vec<_>>>()?;
        let memory = platform.allocate(device_ordinal, shape.byte_size())?;
        Ok(Arc::new(SharedDeviceBuffer {
            platform: Arc::clone(platform),
            on_device_shape: shape.clone(),
            device_ordinal,
            memory,
            children,
            definition_event: TransferEvent::pending(),
        }))
    }

    /// Take ownership of a buffer tree whose contents are already defined
    pub fn from_shaped_buffer(platform: &Arc<dyn DevicePlatform>, buffer: ShapedBuffer) -> Arc<Self> {
        let (shape, device_ordinal, memory, children) = buffer.into_parts();
        let children = children
            .into_iter()
            .map(|child| Self::from_shaped_buffer(platform, child))
            .collect();
        Arc::new(SharedDeviceBuffer {
            platform: Arc::clone(platform),
            on_device_shape: shape,
            device_ordinal,
            memory,
            children,
            definition_event: TransferEvent::completed(),
        })
    }

    /// Non-owning view of this tree
    pub fn as_shaped_buffer(&self) -> ShapedBuffer {
        ShapedBuffer::new(
            self.on_device_shape.clone(),
            self.device_ordinal,
            self.memory,
            self.children.iter().map(|c| c.as_shaped_buffer()).collect(),
        )
    }

    pub fn platform(&self) -> &Arc<dyn DevicePlatform> {
        &self.platform
    }

    pub fn on_device_shape(&self) -> &Shape {
        &self.on_device_shape
    }

    pub fn device_ordinal(&self) -> usize {
        self.device_ordinal
    }

    pub fn memory(&self) -> DeviceMemory {
        self.memory
    }

    pub fn children(&self) -> &[Arc<SharedDeviceBuffer>] {
        &self.children
    }

    pub fn definition_event(&self) -> &TransferEvent {
        &self.definition_event
    }

    /// Number of owners of this node
    pub fn reference_count(this: &Arc<Self>) -> usize {
        Arc::strong_count(this)
    }

    /// Array leaves in depth-first order
    pub fn leaves(&self) -> Vec<&SharedDeviceBuffer> {
        if self.on_device_shape.is_tuple() {
            self.children.iter().flat_map(|c| c.leaves()).collect()
        } else {
            vec![self]
        }
    }

    /// Definition events of every node, children before their parent
    pub fn definition_events(&self) -> Vec<TransferEvent> {
        let mut events: Vec<TransferEvent> = self
            .children
            .iter()
            .flat_map(|c| c.definition_events())
            .collect();
        events.push(self.definition_event.clone());
        events
    }

    /// Block until this node and all of its descendants are defined
    pub fn block_until_defined(&self) -> DriverResult<()> {
        self.definition_event.synchronize()?;
        for child in &self.children {
            child.block_until_defined()?;
        }
        Ok(())
    }
}

impl Drop for SharedDeviceBuffer {
    fn drop(&mut self) {
        // A pending transfer task holds its own Arc, so no copy can still
        // target this memory here.
        if let Err(e) = self.platform.deallocate(self.memory) {
            tracing::error!(
                device_ordinal = self.device_ordinal,
                address = self.memory.address,
                error = %e,
                "SharedDeviceBuffer: failed to free device memory"
            );
        }
    }
}
