//! Device platforms
//!
//! A [`DevicePlatform`] is the driver the client talks to: it enumerates
//! devices, allocates and copies device memory, runs compiled programs and
//! services infeed/outfeed queues. [`HostPlatform`] implements it on host
//! memory so the whole stack runs without accelerator hardware.

pub mod error;
pub mod host;
pub mod registry;
pub mod shaped_buffer;

pub use error::{DriverError, DriverResult};
pub use host::{CustomCallTarget, DeviceStats, HostPlatform};
pub use registry::PlatformRegistry;
pub use shaped_buffer::ShapedBuffer;

use std::fmt;
use std::sync::Arc;

use crate::codec::EncodedValue;
use crate::program::{CompiledArtifact, ProgramCompiler};
use crate::shape::{Shape, TUPLE_ENTRY_BYTES};

/// Handle to one allocation in device memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceMemory {
    pub device_ordinal: usize,
    pub address: u64,
    pub size: usize,
}

/// Static description of one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescription {
    pub ordinal: usize,
    pub name: String,
    pub memory_bytes: usize,
}

/// Driver interface for a family of devices
pub trait DevicePlatform: Send + Sync + fmt::Debug {
    /// Lowercase platform name, e.g. `"host"`
    fn name(&self) -> &str;

    /// Devices in ordinal order
    fn devices(&self) -> DriverResult<Vec<DeviceDescription>>;

    /// Compiler producing artifacts this platform can execute
    fn compiler(&self) -> Arc<dyn ProgramCompiler>;

    fn allocate(&self, device_ordinal: usize, size: usize) -> DriverResult<DeviceMemory>;

    fn deallocate(&self, memory: DeviceMemory) -> DriverResult<()>;

    /// Copy `data` into `memory`; lengths must match
    fn copy_to_device(&self, memory: &DeviceMemory, data: &[u8]) -> DriverResult<()>;

    /// Copy `memory` into `out`; lengths must match
    fn copy_from_device(&self, memory: &DeviceMemory, out: &mut [u8]) -> DriverResult<()>;

    /// Run `artifact` as replica `replica` on `device_ordinal`.
    ///
    /// Blocks until the program finishes. The returned buffer tree is
    /// freshly allocated and owned by the caller, who must eventually
    /// release every allocation in it through [`DevicePlatform::deallocate`].
    fn execute(
        &self,
        device_ordinal: usize,
        replica: usize,
        artifact: &CompiledArtifact,
        arguments: &[ShapedBuffer],
    ) -> DriverResult<ShapedBuffer>;

    /// Append a value to the device infeed queue
    fn transfer_to_infeed(&self, device_ordinal: usize, value: &EncodedValue) -> DriverResult<()>;

    /// Remove the next value from the device outfeed queue, blocking until
    /// one is available. Fails if its shape is not `shape`.
    fn transfer_from_outfeed(&self, device_ordinal: usize, shape: &Shape)
        -> DriverResult<EncodedValue>;
}

/// Device bytes of a tuple index table holding `addresses`.
///
/// Each entry is one child address, little-endian, [`TUPLE_ENTRY_BYTES`] wide.
pub fn encode_tuple_table(addresses: impl IntoIterator<Item = u64>) -> Vec<u8> {
    let mut table = Vec::new();
    for address in addresses {
        table.extend_from_slice(&address.to_le_bytes()[..TUPLE_ENTRY_BYTES]);
    }
    table
}
