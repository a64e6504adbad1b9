//! Process-wide table of device platforms by name

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;

use crate::platform::{DevicePlatform, HostPlatform};

/// Environment variable holding the device count of the default host platform
pub const HOST_DEVICES_ENV: &str = "REPLICAFORGE_HOST_DEVICES";

static GLOBAL_REGISTRY: Lazy<PlatformRegistry> = Lazy::new(PlatformRegistry::with_defaults);

/// Named device platforms.
///
/// Names are matched case-insensitively; `"cpu"` is an alias of `"host"`.
#[derive(Debug, Default)]
pub struct PlatformRegistry {
    platforms: RwLock<HashMap<String, Arc<dyn DevicePlatform>>>,
}

impl PlatformRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding a `host` platform sized from [`HOST_DEVICES_ENV`]
    pub fn with_defaults() -> Self {
        let device_count = std::env::var(HOST_DEVICES_ENV)
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(1);
        let registry = Self::new();
        registry.register(Arc::new(HostPlatform::new(device_count)));
        registry
    }

    /// The process-global registry, populated on first use
    pub fn global() -> &'static PlatformRegistry {
        &GLOBAL_REGISTRY
    }

    /// Add or replace a platform under its own name
    pub fn register(&self, platform: Arc<dyn DevicePlatform>) {
        let key = canonical_name(platform.name());
        tracing::debug!(platform = %key, "PlatformRegistry: registering platform");
        match self.platforms.write() {
            Ok(mut platforms) => {
                platforms.insert(key, platform);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(key, platform);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn DevicePlatform>> {
        let key = canonical_name(name);
        let platforms = match self.platforms.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        platforms.get(&key).cloned()
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let platforms = match self.platforms.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut names: Vec<String> = platforms.keys().cloned().collect();
        names.sort();
        names
    }
}

fn canonical_name(name: &str) -> String {
    let lower = name.trim().to_ascii_lowercase();
    if lower == "cpu" {
        "host".to_string()
    } else {
        lower
    }
}
