//! Build options for program compilation

use crate::shape::Shape;

/// Options controlling how a program is compiled and placed on devices
#[derive(Debug, Clone, PartialEq)]
pub struct BuildOptions {
    /// Number of replicas the program runs as
    num_replicas: usize,

    /// Explicit replica -> device ordinal mapping; default is replica `i` on device `i`
    device_assignment: Option<Vec<usize>>,

    /// Expected result shape; compilation fails if the program disagrees
    result_shape: Option<Shape>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        BuildOptions {
            num_replicas: 1,
            device_assignment: None,
            result_shape: None,
        }
    }
}

impl BuildOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_num_replicas(mut self, num_replicas: usize) -> Self {
        self.num_replicas = num_replicas;
        self
    }

    pub fn with_device_assignment(mut self, ordinals: Vec<usize>) -> Self {
        self.device_assignment = Some(ordinals);
        self
    }

    pub fn with_result_shape(mut self, shape: Shape) -> Self {
        self.result_shape = Some(shape);
        self
    }

    pub fn num_replicas(&self) -> usize {
        self.num_replicas
    }

    pub fn device_assignment(&self) -> Option<&[usize]> {
        self.device_assignment.as_deref()
    }

    pub fn result_shape(&self) -> Option<&Shape> {
        self.result_shape.as_ref()
    }
}
