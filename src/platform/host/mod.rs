//! Host platform: devices backed by host memory
//!
//! Each device owns an arena of byte vectors keyed by address, an infeed and
//! an outfeed queue, and allocation/execution counters. Programs run through
//! the reference interpreter. Addresses are unique across all devices of all
//! host platforms in the process, so a buffer handed to the wrong device is
//! always detected.

mod interpreter;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};

use crate::codec::{EncodedValue, HostValue, HostValueCodec, NativeCodec};
use crate::platform::{
    encode_tuple_table, DeviceDescription, DeviceMemory, DevicePlatform, DriverError,
    DriverResult, ShapedBuffer,
};
use crate::program::{CompiledArtifact, HostCompiler, ProgramCompiler};
use crate::shape::Shape;

use interpreter::Effects;

/// Default memory capacity of one host device
pub const DEFAULT_DEVICE_MEMORY: usize = 1 << 30;

const ADDRESS_ALIGNMENT: u64 = 256;

static NEXT_ADDRESS: AtomicU64 = AtomicU64::new(ADDRESS_ALIGNMENT);

/// Host function callable from programs through a custom call.
///
/// Receives the raw bytes of each array operand and returns the raw bytes of
/// the result, which must match the declared result shape.
pub type CustomCallTarget = Arc<dyn Fn(&[&[u8]]) -> Result<Vec<u8>, String> + Send + Sync>;

/// Counters for one host device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStats {
    pub live_allocations: usize,
    pub live_bytes: usize,
    pub total_allocations: usize,
    pub executions: usize,
    pub peak_concurrent_executions: usize,
}

/// Blocking FIFO of encoded values
#[derive(Debug, Default)]
struct FeedQueue {
    values: Mutex<VecDeque<EncodedValue>>,
    available: Condvar,
}

impl FeedQueue {
    fn push(&self, value: EncodedValue) -> DriverResult<()> {
        self.values.lock()?.push_back(value);
        self.available.notify_all();
        Ok(())
    }

    /// Pop the front value once one exists; a front value of the wrong shape
    /// is left in place and reported.
    fn pop(&self, shape: &Shape) -> DriverResult<EncodedValue> {
        let mut values = self.values.lock()?;
        loop {
            if let Some(front) = values.front() {
                if front.shape != *shape {
                    return Err(DriverError::ShapeMismatch {
                        expected: shape.clone(),
                        actual: front.shape.clone(),
                    });
                }
                return values
                    .pop_front()
                    .ok_or_else(|| DriverError::LockPoisoned("feed queue emptied".to_string()));
            }
            values = self.available.wait(values)?;
        }
    }

    fn len(&self) -> usize {
        self.values.lock().map(|v| v.len()).unwrap_or(0)
    }
}

/// Holds host-to-device copies while closed
#[derive(Debug, Default)]
struct CopyGate {
    held: Mutex<bool>,
    opened: Condvar,
}

impl CopyGate {
    fn set_held(&self, held: bool) -> DriverResult<()> {
        *self.held.lock()? = held;
        if !held {
            self.opened.notify_all();
        }
        Ok(())
    }

    fn wait_open(&self) -> DriverResult<()> {
        let held = self.held.lock()?;
        let _open = self.opened.wait_while(held, |held| *held)?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct DeviceState {
    arena: Mutex<HashMap<u64, Vec<u8>>>,
    stats: Mutex<DeviceStats>,
    active_executions: AtomicUsize,
    infeed: FeedQueue,
    outfeed: FeedQueue,
    fail_executions: AtomicBool,
}

/// Decrements the active execution count when an execution ends
struct ExecutionGuard<'a> {
    active: &'a AtomicUsize,
}

impl Drop for ExecutionGuard<'_> {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A [`DevicePlatform`] whose devices live in host memory
pub struct HostPlatform {
    name: String,
    device_memory: usize,
    devices: Vec<DeviceState>,
    compiler: Arc<HostCompiler>,
    custom_calls: RwLock<HashMap<String, CustomCallTarget>>,
    fail_next_allocation: AtomicBool,
    copy_gate: CopyGate,
    active_executions: AtomicUsize,
    peak_concurrent_executions: AtomicUsize,
}

impl fmt::Debug for HostPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let targets: Vec<String> = self
            .custom_calls
            .read()
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("HostPlatform")
            .field("name", &self.name)
            .field("device_count", &self.devices.len())
            .field("device_memory", &self.device_memory)
            .field("custom_call_targets", &targets)
            .finish()
    }
}

impl HostPlatform {
    /// Platform named `host` with `device_count` devices
    pub fn new(device_count: usize) -> Self {
        Self::with_name("host", device_count)
    }

    pub fn with_name(name: &str, device_count: usize) -> Self {
        HostPlatform {
            name: name.to_ascii_lowercase(),
            device_memory: DEFAULT_DEVICE_MEMORY,
            devices: (0..device_count).map(|_| DeviceState::default()).collect(),
            compiler: Arc::new(HostCompiler),
            custom_calls: RwLock::new(HashMap::new()),
            fail_next_allocation: AtomicBool::new(false),
            copy_gate: CopyGate::default(),
            active_executions: AtomicUsize::new(0),
            peak_concurrent_executions: AtomicUsize::new(0),
        }
    }

    /// Cap every device at `bytes` of live allocations
    pub fn with_device_memory(mut self, bytes: usize) -> Self {
        self.device_memory = bytes;
        self
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    fn device(&self, ordinal: usize) -> DriverResult<&DeviceState> {
        self.devices.get(ordinal).ok_or(DriverError::InvalidDevice {
            ordinal,
            device_count: self.devices.len(),
        })
    }

    pub fn device_stats(&self, ordinal: usize) -> DriverResult<DeviceStats> {
        Ok(*self.device(ordinal)?.stats.lock()?)
    }

    /// Live allocations summed over every device
    pub fn total_live_allocations(&self) -> usize {
        self.devices
            .iter()
            .map(|d| d.stats.lock().map(|s| s.live_allocations).unwrap_or(0))
            .sum()
    }

    /// Highest number of executions running at once across all devices
    pub fn peak_concurrent_executions(&self) -> usize {
        self.peak_concurrent_executions.load(Ordering::SeqCst)
    }

    /// Values waiting on a device's outfeed
    pub fn outfeed_depth(&self, ordinal: usize) -> DriverResult<usize> {
        Ok(self.device(ordinal)?.outfeed.len())
    }

    /// Values waiting on a device's infeed
    pub fn infeed_depth(&self, ordinal: usize) -> DriverResult<usize> {
        Ok(self.device(ordinal)?.infeed.len())
    }

    /// Make `target` callable from programs as a custom call
    pub fn register_custom_call_target(&self, name: &str, target: CustomCallTarget) {
        tracing::debug!(target_name = name, "HostPlatform: registering custom call target");
        match self.custom_calls.write() {
            Ok(mut targets) => {
                targets.insert(name.to_string(), target);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(name.to_string(), target);
            }
        }
    }

    /// The next allocation on any device fails
    pub fn fail_next_allocation(&self) {
        self.fail_next_allocation.store(true, Ordering::SeqCst);
    }

    /// Hold every host-to-device copy until [`HostPlatform::release_copies`]
    pub fn hold_copies(&self) -> DriverResult<()> {
        self.copy_gate.set_held(true)
    }

    /// Let held and future host-to-device copies proceed
    pub fn release_copies(&self) -> DriverResult<()> {
        self.copy_gate.set_held(false)
    }

    /// While set, every execution on `ordinal` fails
    pub fn fail_executions_on(&self, ordinal: usize, fail: bool) -> DriverResult<()> {
        self.device(ordinal)?
            .fail_executions
            .store(fail, Ordering::SeqCst);
        Ok(())
    }

    fn read_value(&self, buffer: &ShapedBuffer) -> DriverResult<HostValue> {
        match buffer.shape() {
            Shape::Array { element_type, dims } => {
                let mut bytes = vec![0u8; buffer.memory().size];
                self.copy_from_device(&buffer.memory(), &mut bytes)?;
                Ok(HostValue::from_raw(*element_type, dims, bytes))
            }
            Shape::Tuple(_) => {
                let elements = buffer
                    .children()
                    .iter()
                    .map(|child| self.read_value(child))
                    .collect::<DriverResult<Vec<_>>>()?;
                Ok(HostValue::tuple(elements))
            }
        }
    }

    /// Allocate a buffer tree on `ordinal` holding `value`; nothing stays
    /// allocated if any step fails.
    fn write_value(&self, ordinal: usize, value: &HostValue) -> DriverResult<ShapedBuffer> {
        match value {
            HostValue::Array { bytes, .. } => {
                let memory = self.allocate(ordinal, bytes.len())?;
                if let Err(e) = self.copy_to_device(&memory, bytes) {
                    let _ = self.deallocate(memory);
                    return Err(e);
                }
                Ok(ShapedBuffer::new(value.shape(), ordinal, memory, Vec::new()))
            }
            HostValue::Tuple(elements) => {
                let mut children = Vec::with_capacity(elements.len());
                let result: DriverResult<()> = elements.iter().try_for_each(|element| {
                    children.push(self.write_value(ordinal, element)?);
                    Ok(())
                });
                let result = result.and_then(|()| {
                    let table = tuple_table(&children);
                    let memory = self.allocate(ordinal, table.len())?;
                    if let Err(e) = self.copy_to_device(&memory, &table) {
                        let _ = self.deallocate(memory);
                        return Err(e);
                    }
                    Ok(memory)
                });
                match result {
                    Ok(memory) => Ok(ShapedBuffer::new(value.shape(), ordinal, memory, children)),
                    Err(e) => {
                        for memory in children.iter().flat_map(ShapedBuffer::allocations) {
                            let _ = self.deallocate(memory);
                        }
                        Err(e)
                    }
                }
            }
        }
    }
}

/// Index table of a tuple node: each child's address, little-endian
fn tuple_table(children: &[ShapedBuffer]) -> Vec<u8> {
    encode_tuple_table(children.iter().map(|child| child.memory().address))
}

/// Side effects of one execution on one device
struct DeviceEffects<'a> {
    platform: &'a HostPlatform,
    device: &'a DeviceState,
}

impl Effects for DeviceEffects<'_> {
    fn infeed(&self, shape: &Shape) -> DriverResult<HostValue> {
        let encoded = self.device.infeed.pop(shape)?;
        NativeCodec
            .decode(&encoded.shape, encoded.leaves)
            .map_err(|e| DriverError::InfeedRejected(e.to_string()))
    }

    fn outfeed(&self, value: &HostValue) -> DriverResult<()> {
        let encoded = NativeCodec
            .encode(value)
            .map_err(|e| DriverError::ExecutionFailed(e.to_string()))?;
        self.device.outfeed.push(encoded)
    }

    fn custom_call(
        &self,
        target: &str,
        operands: &[&HostValue],
        shape: &Shape,
    ) -> DriverResult<HostValue> {
        let function = self
            .platform
            .custom_calls
            .read()?
            .get(target)
            .cloned()
            .ok_or_else(|| {
                DriverError::ExecutionFailed(format!("no custom call target named {}", target))
            })?;
        let inputs: Vec<&[u8]> = operands.iter().filter_map(|o| o.bytes()).collect();
        let bytes = function(&inputs).map_err(|e| {
            DriverError::ExecutionFailed(format!("custom call {} failed: {}", target, e))
        })?;
        match shape {
            Shape::Array { element_type, dims } if bytes.len() == shape.byte_size() => {
                Ok(HostValue::from_raw(*element_type, dims, bytes))
            }
            _ => Err(DriverError::ExecutionFailed(format!(
                "custom call {} returned {} bytes for {}",
                target,
                bytes.len(),
                shape
            ))),
        }
    }
}

impl DevicePlatform for HostPlatform {
    fn name(&self) -> &str {
        &self.name
    }

    fn devices(&self) -> DriverResult<Vec<DeviceDescription>> {
        Ok((0..self.devices.len())
            .map(|ordinal| DeviceDescription {
                ordinal,
                name: format!("{}:{}", self.name, ordinal),
                memory_bytes: self.device_memory,
            })
            .collect())
    }

    fn compiler(&self) -> Arc<dyn ProgramCompiler> {
        self.compiler.clone()
    }

    fn allocate(&self, device_ordinal: usize, size: usize) -> DriverResult<DeviceMemory> {
        let device = self.device(device_ordinal)?;
        if self.fail_next_allocation.swap(false, Ordering::SeqCst) {
            tracing::warn!(device_ordinal, size, "HostPlatform: injected allocation failure");
            return Err(DriverError::MemoryAllocationFailed(format!(
                "injected failure allocating {} bytes on device {}",
                size, device_ordinal
            )));
        }

        let mut stats = device.stats.lock()?;
        if stats.live_bytes.saturating_add(size) > self.device_memory {
            return Err(DriverError::MemoryAllocationFailed(format!(
                "device {} out of memory: {} bytes requested, {} of {} in use",
                device_ordinal, size, stats.live_bytes, self.device_memory
            )));
        }

        let span = (size as u64).max(1).div_ceil(ADDRESS_ALIGNMENT) * ADDRESS_ALIGNMENT;
        let address = NEXT_ADDRESS.fetch_add(span, Ordering::SeqCst);
        device.arena.lock()?.insert(address, vec![0u8; size]);

        stats.live_allocations += 1;
        stats.live_bytes += size;
        stats.total_allocations += 1;

        tracing::trace!(device_ordinal, size, address, "HostPlatform: allocated");
        Ok(DeviceMemory {
            device_ordinal,
            address,
            size,
        })
    }

    fn deallocate(&self, memory: DeviceMemory) -> DriverResult<()> {
        let device = self.device(memory.device_ordinal)?;
        let removed = device.arena.lock()?.remove(&memory.address);
        match removed {
            Some(bytes) => {
                let mut stats = device.stats.lock()?;
                stats.live_allocations = stats.live_allocations.saturating_sub(1);
                stats.live_bytes = stats.live_bytes.saturating_sub(bytes.len());
                tracing::trace!(
                    device_ordinal = memory.device_ordinal,
                    address = memory.address,
                    "HostPlatform: freed"
                );
                Ok(())
            }
            None => Err(DriverError::InvalidAddress {
                ordinal: memory.device_ordinal,
                address: memory.address,
            }),
        }
    }

    fn copy_to_device(&self, memory: &DeviceMemory, data: &[u8]) -> DriverResult<()> {
        let device = self.device(memory.device_ordinal)?;
        self.copy_gate.wait_open()?;
        let mut arena = device.arena.lock()?;
        let target = arena
            .get_mut(&memory.address)
            .ok_or(DriverError::InvalidAddress {
                ordinal: memory.device_ordinal,
                address: memory.address,
            })?;
        if target.len() != data.len() {
            return Err(DriverError::MemoryCopyFailed(format!(
                "host to device copy of {} bytes into allocation of {} bytes",
                data.len(),
                target.len()
            )));
        }
        target.copy_from_slice(data);
        Ok(())
    }

    fn copy_from_device(&self, memory: &DeviceMemory, out: &mut [u8]) -> DriverResult<()> {
        let device = self.device(memory.device_ordinal)?;
        let arena = device.arena.lock()?;
        let source = arena
            .get(&memory.address)
            .ok_or(DriverError::InvalidAddress {
                ordinal: memory.device_ordinal,
                address: memory.address,
            })?;
        if source.len() != out.len() {
            return Err(DriverError::MemoryCopyFailed(format!(
                "device to host copy of allocation of {} bytes into {} bytes",
                source.len(),
                out.len()
            )));
        }
        out.copy_from_slice(source);
        Ok(())
    }

    fn execute(
        &self,
        device_ordinal: usize,
        replica: usize,
        artifact: &CompiledArtifact,
        arguments: &[ShapedBuffer],
    ) -> DriverResult<ShapedBuffer> {
        let device = self.device(device_ordinal)?;

        let running = device.active_executions.fetch_add(1, Ordering::SeqCst) + 1;
        let _device_guard = ExecutionGuard {
            active: &device.active_executions,
        };
        let running_anywhere = self.active_executions.fetch_add(1, Ordering::SeqCst) + 1;
        let _platform_guard = ExecutionGuard {
            active: &self.active_executions,
        };
        self.peak_concurrent_executions
            .fetch_max(running_anywhere, Ordering::SeqCst);
        {
            let mut stats = device.stats.lock()?;
            stats.executions += 1;
            stats.peak_concurrent_executions = stats.peak_concurrent_executions.max(running);
        }

        tracing::debug!(
            program = artifact.name(),
            device_ordinal,
            replica,
            "HostPlatform: executing"
        );

        if device.fail_executions.load(Ordering::SeqCst) {
            return Err(DriverError::ExecutionFailed(format!(
                "injected failure executing {} on device {}",
                artifact.name(),
                device_ordinal
            )));
        }

        if let Some((position, shape)) = artifact
            .instruction_shapes()
            .iter()
            .enumerate()
            .find(|(_, shape)| shape.byte_size() > self.device_memory)
        {
            return Err(DriverError::MemoryAllocationFailed(format!(
                "instruction {} of {} needs {} bytes, device {} holds {}",
                position,
                artifact.name(),
                shape.byte_size(),
                device_ordinal,
                self.device_memory
            )));
        }

        for (index, argument) in arguments.iter().enumerate() {
            if argument.device_ordinal() != device_ordinal {
                return Err(DriverError::ExecutionFailed(format!(
                    "argument {} lives on device {}, not {}",
                    index,
                    argument.device_ordinal(),
                    device_ordinal
                )));
            }
        }
        let values = arguments
            .iter()
            .map(|argument| self.read_value(argument))
            .collect::<DriverResult<Vec<_>>>()?;

        let effects = DeviceEffects {
            platform: self,
            device,
        };
        let result = interpreter::evaluate(artifact, replica, &values, &effects)?;
        if result.shape() != *artifact.result_shape() {
            return Err(DriverError::ShapeMismatch {
                expected: artifact.result_shape().clone(),
                actual: result.shape(),
            });
        }
        self.write_value(device_ordinal, &result)
    }

    fn transfer_to_infeed(&self, device_ordinal: usize, value: &EncodedValue) -> DriverResult<()> {
        tracing::debug!(
            device_ordinal,
            shape = %value.shape,
            "HostPlatform: infeed enqueue"
        );
        self.device(device_ordinal)?.infeed.push(value.clone())
    }

    fn transfer_from_outfeed(
        &self,
        device_ordinal: usize,
        shape: &Shape,
    ) -> DriverResult<EncodedValue> {
        self.device(device_ordinal)?.outfeed.pop(shape)
    }
}
