//! Execution client
//!
//! A [`LocalClient`] binds one device platform to the threads that drive it:
//! a transfer pool for host/device copies and one [`WorkerThread`] per
//! device for executions. Clients are shared through `Arc`; buffers and
//! executables keep their client alive.

pub mod config;
pub mod worker;

pub use config::{ClientConfig, TRANSFER_THREADS_ENV};
pub use worker::WorkerThread;

use std::sync::Arc;

use crate::codec::{HostValue, HostValueCodec, NativeCodec};
use crate::error::{ForgeError, ForgeResult};
use crate::platform::{DeviceDescription, DevicePlatform, PlatformRegistry};
use crate::shape::Shape;
use crate::transfer::TransferManager;

/// Client for the devices of one platform
#[derive(Debug)]
pub struct LocalClient {
    platform: Arc<dyn DevicePlatform>,
    devices: Vec<DeviceDescription>,
    config: ClientConfig,
    transfer_manager: TransferManager,
    execute_threads: Vec<WorkerThread>,
}

impl LocalClient {
    /// Client for the platform registered as `platform_name` in the global
    /// registry, configured from the environment
    pub fn get(platform_name: &str) -> ForgeResult<Arc<LocalClient>> {
        Self::get_with_config(PlatformRegistry::global(), platform_name, ClientConfig::from_env())
    }

    pub fn get_with_config(
        registry: &PlatformRegistry,
        platform_name: &str,
        config: ClientConfig,
    ) -> ForgeResult<Arc<LocalClient>> {
        let platform = registry.get(platform_name).ok_or_else(|| {
            ForgeError::NotFound(format!(
                "platform {} is not registered (available: {})",
                platform_name,
                registry.names().join(", ")
            ))
        })?;
        Self::from_platform(platform, config)
    }

    /// Client over an already constructed platform
    pub fn from_platform(
        platform: Arc<dyn DevicePlatform>,
        config: ClientConfig,
    ) -> ForgeResult<Arc<LocalClient>> {
        let devices = platform
            .devices()
            .map_err(|e| ForgeError::driver("enumerating devices", e))?;
        if devices.is_empty() {
            return Err(ForgeError::FailedPrecondition(format!(
                "platform {} has no devices",
                platform.name()
            )));
        }

        let transfer_manager = TransferManager::new(
            config.resolved_transfer_threads(devices.len()),
            &config.thread_name_prefix,
        )?;
        let execute_threads = devices
            .iter()
            .map(|device| {
                WorkerThread::spawn(
                    device.ordinal,
                    format!("{}-exec-{}", config.thread_name_prefix, device.ordinal),
                )
            })
            .collect::<ForgeResult<Vec<_>>>()?;

        tracing::info!(
            platform = platform.name(),
            devices = devices.len(),
            transfer_threads = transfer_manager.num_threads(),
            "LocalClient: created"
        );

        Ok(Arc::new(LocalClient {
            platform,
            devices,
            config,
            transfer_manager,
            execute_threads,
        }))
    }

    pub fn platform(&self) -> &Arc<dyn DevicePlatform> {
        &self.platform
    }

    pub fn platform_name(&self) -> &str {
        self.platform.name()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn devices(&self) -> &[DeviceDescription] {
        &self.devices
    }

    pub fn transfer_manager(&self) -> &TransferManager {
        &self.transfer_manager
    }

    /// Worker threads, indexed by device ordinal
    pub fn execute_threads(&self) -> &[WorkerThread] {
        &self.execute_threads
    }

    pub fn worker(&self, device_ordinal: usize) -> ForgeResult<&WorkerThread> {
        self.check_device_ordinal(device_ordinal)?;
        Ok(&self.execute_threads[device_ordinal])
    }

    /// `InvalidArgument` unless `device_ordinal` names a visible device
    pub fn check_device_ordinal(&self, device_ordinal: usize) -> ForgeResult<()> {
        if device_ordinal >= self.devices.len() {
            return Err(ForgeError::InvalidArgument(format!(
                "device ordinal {} out of range; {} devices visible",
                device_ordinal,
                self.devices.len()
            )));
        }
        Ok(())
    }

    /// Send `value` to the infeed of `device_ordinal`; returns once the
    /// driver has accepted it
    pub fn transfer_to_infeed(&self, value: &HostValue, device_ordinal: usize) -> ForgeResult<()> {
        let encoded = NativeCodec.encode(value)?;
        tracing::debug!(
            device_ordinal,
            shape = %encoded.shape,
            bytes = encoded.total_bytes(),
            "LocalClient: transfer to infeed"
        );
        self.platform
            .transfer_to_infeed(device_ordinal, &encoded)
            .map_err(|e| {
                ForgeError::driver(format!("transferring to infeed of device {}", device_ordinal), e)
            })
    }

    /// Take the next value of `shape` from the outfeed of `device_ordinal`,
    /// blocking until one is produced
    pub fn transfer_from_outfeed(&self, shape: &Shape, device_ordinal: usize) -> ForgeResult<HostValue> {
        tracing::debug!(device_ordinal, shape = %shape, "LocalClient: transfer from outfeed");
        let encoded = self
            .platform
            .transfer_from_outfeed(device_ordinal, shape)
            .map_err(|e| {
                ForgeError::driver(
                    format!("transferring from outfeed of device {}", device_ordinal),
                    e,
                )
            })?;
        Ok(NativeCodec.decode(&encoded.shape, encoded.leaves)?)
    }
}

impl Drop for LocalClient {
    fn drop(&mut self) {
        tracing::info!(platform = self.platform.name(), "LocalClient: shutting down");
    }
}
