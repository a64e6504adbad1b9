//! Configuration for the execution client
//!
//! [`ClientConfig`] controls the size of the transfer pool and how client
//! threads are named. Defaults suit the host platform; `from_env` lets
//! deployments override them without code changes.

/// Environment variable overriding [`ClientConfig::transfer_threads`]
pub const TRANSFER_THREADS_ENV: &str = "REPLICAFORGE_TRANSFER_THREADS";

/// Configuration for a [`LocalClient`](super::LocalClient)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Threads in the host/device transfer pool; `None` means one per device
    pub transfer_threads: Option<usize>,

    /// Prefix for worker and transfer thread names
    pub thread_name_prefix: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            transfer_threads: None,
            thread_name_prefix: "replicaforge".to_string(),
        }
    }
}

impl ClientConfig {
    /// Create a new client config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by [`TRANSFER_THREADS_ENV`] when it holds a
    /// positive integer
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(value) = std::env::var(TRANSFER_THREADS_ENV) {
            match value.trim().parse::<usize>() {
                Ok(n) if n > 0 => config.transfer_threads = Some(n),
                _ => tracing::warn!(
                    value = %value,
                    "ClientConfig: ignoring invalid {}",
                    TRANSFER_THREADS_ENV
                ),
            }
        }
        config
    }

    /// Set transfer pool size
    pub fn with_transfer_threads(mut self, threads: usize) -> Self {
        self.transfer_threads = Some(threads);
        self
    }

    /// Set thread name prefix
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Transfer pool size for a client over `device_count` devices
    pub fn resolved_transfer_threads(&self, device_count: usize) -> usize {
        self.transfer_threads.unwrap_or(device_count).max(1)
    }
}
