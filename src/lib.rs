//! ReplicaForge - local execution client for accelerator devices
//!
//! Moves host values onto devices, keeps them alive as reference-counted
//! device buffers, and runs compiled programs on one or many devices as
//! replicas. Devices are reached through a [`DevicePlatform`]; the bundled
//! [`HostPlatform`] backs every device with host memory.

#![allow(clippy::type_complexity)] // Task and callback signatures
#![allow(clippy::new_without_default)] // Builders mirror their Default impls explicitly

pub mod buffer;
pub mod client;
pub mod codec;
pub mod error;
pub mod executable;
pub mod logging;
pub mod platform;
pub mod program;
pub mod shape;
pub mod transfer;

pub use buffer::{LocalBuffer, SharedDeviceBuffer};
pub use client::{ClientConfig, LocalClient};
pub use codec::{HostValue, HostValueCodec, NativeCodec};
pub use error::{ErrorCode, ForgeError, ForgeResult};
pub use executable::{DeviceAssignment, LocalExecutable};
pub use logging::{init_logging, init_logging_default, LoggingConfig};
pub use platform::{DevicePlatform, HostPlatform, PlatformRegistry, ShapedBuffer};
pub use program::{BuildOptions, Computation, ComputationBuilder};
pub use shape::{ElementType, Shape};
