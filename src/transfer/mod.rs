//! Host/device transfer scheduling
//!
//! Host-to-device copies run on a dedicated rayon pool so that buffer
//! creation returns as soon as device memory is allocated. Each destination
//! buffer carries a [`TransferEvent`] that is recorded once its bytes (and,
//! for tuples, its index table) are on the device.

pub mod event;

pub use event::TransferEvent;

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use rayon::prelude::*;

use crate::buffer::SharedDeviceBuffer;
use crate::codec::EncodedValue;
use crate::error::{ForgeError, ForgeResult};
use crate::platform::{encode_tuple_table, DriverError, DriverResult};

/// Thread pool for host/device copies
#[derive(Debug)]
pub struct TransferManager {
    pool: rayon::ThreadPool,
}

impl TransferManager {
    pub fn new(num_threads: usize, thread_name_prefix: &str) -> ForgeResult<Self> {
        let prefix = thread_name_prefix.to_string();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads.max(1))
            .thread_name(move |i| format!("{}-h2d-{}", prefix, i))
            .panic_handler(|_| tracing::error!("TransferManager: transfer task panicked"))
            .build()
            .map_err(|e| ForgeError::Internal(format!("failed to start transfer pool: {}", e)))?;
        tracing::debug!(
            threads = pool.current_num_threads(),
            "TransferManager: started transfer pool"
        );
        Ok(TransferManager { pool })
    }

    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Run `task` on the transfer pool without waiting for it
    pub fn schedule<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.pool.spawn(task);
    }

    /// Copy `encoded` into `buffer` asynchronously.
    ///
    /// Leaves are written depth-first, then tuple index tables. Every node's
    /// definition event is recorded with the outcome, including when the
    /// driver panics mid-copy.
    pub fn enqueue_host_to_device(&self, buffer: Arc<SharedDeviceBuffer>, encoded: EncodedValue) {
        self.schedule(move || {
            let copy = panic::catch_unwind(AssertUnwindSafe(|| {
                let mut leaves = encoded.leaves.into_iter();
                write_tree(&buffer, &mut leaves).and_then(|()| match leaves.next() {
                    None => Ok(()),
                    Some(_) => Err(DriverError::MemoryCopyFailed(format!(
                        "more leaf payloads than leaves in {}",
                        buffer.on_device_shape()
                    ))),
                })
            }));
            let result = copy.unwrap_or_else(|payload| {
                Err(DriverError::MemoryCopyFailed(format!(
                    "host to device copy panicked: {}",
                    panic_message(payload.as_ref())
                )))
            });
            if let Err(e) = &result {
                tracing::error!(
                    device_ordinal = buffer.device_ordinal(),
                    error = %e,
                    "TransferManager: host to device copy failed"
                );
            }
            // Release this task's reference before waking anyone, so a
            // waiter that drops the last handle frees the memory itself.
            let events = buffer.definition_events();
            drop(buffer);
            for event in events {
                match &result {
                    Ok(()) => event.record_success(),
                    Err(e) => event.record_failure(e.clone()),
                }
            }
        });
    }

    /// Copy every leaf of `buffer` back to the host, depth-first.
    ///
    /// Waits for the buffer to be defined first; leaves are read in parallel
    /// on the transfer pool.
    pub fn device_to_host(&self, buffer: &SharedDeviceBuffer) -> DriverResult<Vec<Vec<u8>>> {
        buffer.block_until_defined()?;
        let leaves = buffer.leaves();
        self.pool.install(|| {
            leaves
                .par_iter()
                .map(|leaf| {
                    let memory = leaf.memory();
                    let mut bytes = vec![0u8; memory.size];
                    leaf.platform().copy_from_device(&memory, &mut bytes)?;
                    Ok(bytes)
                })
                .collect::<DriverResult<Vec<_>>>()
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

fn write_tree(
    buffer: &SharedDeviceBuffer,
    leaves: &mut impl Iterator<Item = Vec<u8>>,
) -> DriverResult<()> {
    let platform = buffer.platform();
    if buffer.on_device_shape().is_tuple() {
        for child in buffer.children() {
            write_tree(child, leaves)?;
        }
        let table = encode_tuple_table(buffer.children().iter().map(|c| c.memory().address));
        platform.copy_to_device(&buffer.memory(), &table)
    } else {
        let bytes = leaves.next().ok_or_else(|| {
            DriverError::MemoryCopyFailed(format!(
                "missing leaf payload for {}",
                buffer.on_device_shape()
            ))
        })?;
        platform.copy_to_device(&buffer.memory(), &bytes)
    }
}
