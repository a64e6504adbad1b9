//! Common test utilities
//!
//! Every test builds its own [`HostFixture`]: a fresh host platform plus a
//! client over it, so allocation counts start at zero and leak checks are
//! exact. Tests that touch process-global state (the platform registry,
//! environment variables) run under `#[serial]`.

#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use replicaforge::platform::DevicePlatform;
use replicaforge::program::{Computation, ComputationBuilder};
use replicaforge::{ClientConfig, HostPlatform, LocalClient, Shape};
pub use serial_test::serial;

pub struct HostFixture {
    platform: Arc<HostPlatform>,
    client: Arc<LocalClient>,
}

impl HostFixture {
    pub fn new(device_count: usize) -> Self {
        Self::with_platform(HostPlatform::new(device_count))
    }

    pub fn with_platform(platform: HostPlatform) -> Self {
        let platform = Arc::new(platform);
        let dyn_platform: Arc<dyn DevicePlatform> = platform.clone();
        let client = LocalClient::from_platform(
            dyn_platform,
            ClientConfig::default().with_thread_name_prefix("fixture"),
        )
        .expect("host client should start");
        HostFixture { platform, client }
    }

    pub fn platform(&self) -> &Arc<HostPlatform> {
        &self.platform
    }

    pub fn client(&self) -> &Arc<LocalClient> {
        &self.client
    }

    /// Panics if any device still holds an allocation
    pub fn assert_no_leak(&self) {
        let live = self.platform.total_live_allocations();
        assert_eq!(
            live, 0,
            "device memory leak: {} allocations still live across {} devices",
            live,
            self.platform.device_count()
        );
    }
}

/// Poll `condition` until it holds or five seconds pass
pub fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// `p0 + p1` over two arrays of `shape`
pub fn add_program(shape: &Shape) -> Computation {
    let mut b = ComputationBuilder::new("add");
    let x = b.parameter(0, shape.clone());
    let y = b.parameter(1, shape.clone());
    let sum = b.add(x, y);
    b.build(sum)
}

/// `(p0 * broadcast(replica_id), replica_id)` for an s32 vector parameter
pub fn scale_by_replica_program(len: usize) -> Computation {
    let shape = Shape::array(replicaforge::ElementType::S32, &[len]);
    let mut b = ComputationBuilder::new("scale_by_replica");
    let x = b.parameter(0, shape);
    let id = b.replica_id();
    let ids = b.broadcast_scalar(id, &[len]);
    let scaled = b.multiply(x, ids);
    let root = b.tuple(&[scaled, id]);
    b.build(root)
}
