//! Non-owning view of a device buffer tree

use crate::platform::DeviceMemory;
use crate::shape::Shape;

/// Device memory laid out according to a shape.
///
/// A `ShapedBuffer` describes where a value lives but does not own it;
/// dropping one never frees memory. Tuple nodes carry their index table in
/// `memory` and one child per element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapedBuffer {
    shape: Shape,
    device_ordinal: usize,
    memory: DeviceMemory,
    children: Vec<ShapedBuffer>,
}

impl ShapedBuffer {
    pub fn new(
        shape: Shape,
        device_ordinal: usize,
        memory: DeviceMemory,
        children: Vec<ShapedBuffer>,
    ) -> Self {
        ShapedBuffer {
            shape,
            device_ordinal,
            memory,
            children,
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn device_ordinal(&self) -> usize {
        self.device_ordinal
    }

    pub fn memory(&self) -> DeviceMemory {
        self.memory
    }

    pub fn children(&self) -> &[ShapedBuffer] {
        &self.children
    }

    /// Array leaves in depth-first order
    pub fn leaves(&self) -> Vec<&ShapedBuffer> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a ShapedBuffer>) {
        if self.shape.is_tuple() {
            for child in &self.children {
                child.collect_leaves(out);
            }
        } else {
            out.push(self);
        }
    }

    /// Every allocation in the tree, parents before children
    pub fn allocations(&self) -> Vec<DeviceMemory> {
        let mut out = vec![self.memory];
        for child in &self.children {
            out.extend(child.allocations());
        }
        out
    }

    pub fn into_parts(self) -> (Shape, usize, DeviceMemory, Vec<ShapedBuffer>) {
        (self.shape, self.device_ordinal, self.memory, self.children)
    }
}
