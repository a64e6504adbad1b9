//! Replica to device placement

use std::collections::HashSet;
use std::fmt;

use crate::error::{ForgeError, ForgeResult};

/// Device ordinal for each replica of a program, indexed by replica
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAssignment {
    ordinals: Vec<usize>,
}

impl DeviceAssignment {
    /// Replica `i` on device `i`
    pub fn for_replicas(num_replicas: usize, device_count: usize) -> ForgeResult<Self> {
        Self::from_ordinals((0..num_replicas).collect(), device_count)
    }

    /// Explicit placement; every ordinal must exist and appear once
    pub fn from_ordinals(ordinals: Vec<usize>, device_count: usize) -> ForgeResult<Self> {
        if ordinals.is_empty() {
            return Err(ForgeError::InvalidArgument(
                "device assignment needs at least one replica".to_string(),
            ));
        }
        if ordinals.len() > device_count {
            return Err(ForgeError::InvalidArgument(format!(
                "{} replicas requested but only {} devices are visible",
                ordinals.len(),
                device_count
            )));
        }
        let mut seen = HashSet::with_capacity(ordinals.len());
        for (replica, &ordinal) in ordinals.iter().enumerate() {
            if ordinal >= device_count {
                return Err(ForgeError::InvalidArgument(format!(
                    "replica {} assigned to device {} but only {} devices are visible",
                    replica, ordinal, device_count
                )));
            }
            if !seen.insert(ordinal) {
                return Err(ForgeError::InvalidArgument(format!(
                    "device {} is assigned to more than one replica",
                    ordinal
                )));
            }
        }
        Ok(DeviceAssignment { ordinals })
    }

    pub fn num_replicas(&self) -> usize {
        self.ordinals.len()
    }

    pub fn ordinal(&self, replica: usize) -> Option<usize> {
        self.ordinals.get(replica).copied()
    }

    pub fn ordinals(&self) -> &[usize] {
        &self.ordinals
    }
}

impl fmt::Display for DeviceAssignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.ordinals)
    }
}
