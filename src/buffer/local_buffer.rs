//! Client-facing handles to values on a device

use std::sync::Arc;

use crate::buffer::SharedDeviceBuffer;
use crate::client::LocalClient;
use crate::codec::{EncodedValue, HostValue, HostValueCodec, NativeCodec};
use crate::error::{ForgeError, ForgeResult};
use crate::platform::ShapedBuffer;
use crate::shape::Shape;

/// Handle to a value resident on one device.
///
/// Holds a reference to the device buffer tree and to the client that owns
/// the device. [`LocalBuffer::delete`] (or dropping the handle) releases that
/// reference; a deleted handle can only report its shape and deleted state.
#[derive(Debug)]
pub struct LocalBuffer {
    on_host_shape: Shape,
    device_ordinal: usize,
    device_buffer: Option<Arc<SharedDeviceBuffer>>,
    client: Option<Arc<LocalClient>>,
}

impl LocalBuffer {
    pub(crate) fn new(
        on_host_shape: Shape,
        device_buffer: Arc<SharedDeviceBuffer>,
        client: Arc<LocalClient>,
    ) -> Self {
        LocalBuffer {
            on_host_shape,
            device_ordinal: device_buffer.device_ordinal(),
            device_buffer: Some(device_buffer),
            client: Some(client),
        }
    }

    /// Copy `value` to `device_ordinal`.
    ///
    /// Returns once device memory is allocated; the copy itself completes
    /// asynchronously on the client's transfer pool.
    pub fn from_host(
        value: &HostValue,
        client: &Arc<LocalClient>,
        device_ordinal: usize,
    ) -> ForgeResult<LocalBuffer> {
        Self::from_host_with_codec(&NativeCodec, value, client, device_ordinal)
    }

    /// [`LocalBuffer::from_host`] for a value type with its own codec
    pub fn from_host_with_codec<C: HostValueCodec>(
        codec: &C,
        value: &C::Value,
        client: &Arc<LocalClient>,
        device_ordinal: usize,
    ) -> ForgeResult<LocalBuffer> {
        client.check_device_ordinal(device_ordinal)?;
        let encoded = codec.encode(value)?;
        let device_buffer = allocate_for(client, &encoded.shape, device_ordinal)?;
        Ok(Self::enqueue(client, device_buffer, encoded))
    }

    /// Copy many values at once, each to its own device.
    ///
    /// Everything is encoded and allocated before any copy is scheduled, so
    /// a failure leaves nothing allocated. Results are in input order.
    pub fn from_host_values(
        values: &[(HostValue, usize)],
        client: &Arc<LocalClient>,
    ) -> ForgeResult<Vec<LocalBuffer>> {
        let mut staged = Vec::with_capacity(values.len());
        for (value, device_ordinal) in values {
            client.check_device_ordinal(*device_ordinal)?;
            staged.push((NativeCodec.encode(value)?, *device_ordinal));
        }

        // Dropping `allocated` on error frees whatever was already allocated
        let mut allocated = Vec::with_capacity(staged.len());
        for (encoded, device_ordinal) in &staged {
            allocated.push(allocate_for(client, &encoded.shape, *device_ordinal)?);
        }

        tracing::debug!(count = allocated.len(), "LocalBuffer: scheduling batched transfers");
        Ok(staged
            .into_iter()
            .zip(allocated)
            .map(|((encoded, _), device_buffer)| Self::enqueue(client, device_buffer, encoded))
            .collect())
    }

    fn enqueue(
        client: &Arc<LocalClient>,
        device_buffer: Arc<SharedDeviceBuffer>,
        encoded: EncodedValue,
    ) -> LocalBuffer {
        let shape = encoded.shape.clone();
        client
            .transfer_manager()
            .enqueue_host_to_device(Arc::clone(&device_buffer), encoded);
        LocalBuffer::new(shape, device_buffer, Arc::clone(client))
    }

    fn live(&self) -> ForgeResult<(&Arc<SharedDeviceBuffer>, &Arc<LocalClient>)> {
        match (&self.device_buffer, &self.client) {
            (Some(buffer), Some(client)) => Ok((buffer, client)),
            _ => Err(ForgeError::InvalidArgument(format!(
                "buffer of shape {} has been deleted",
                self.on_host_shape
            ))),
        }
    }

    /// Copy the value back to the host
    pub fn to_host(&self) -> ForgeResult<HostValue> {
        self.to_host_with_codec(&NativeCodec)
    }

    pub fn to_host_with_codec<C: HostValueCodec>(&self, codec: &C) -> ForgeResult<C::Value> {
        let (buffer, client) = self.live()?;
        let leaves = client
            .transfer_manager()
            .device_to_host(buffer)
            .map_err(|e| {
                ForgeError::driver(
                    format!("copying {} from device {}", self.on_host_shape, self.device_ordinal),
                    e,
                )
            })?;
        Ok(codec.decode(&self.on_host_shape, leaves)?)
    }

    /// Non-owning snapshot of the device memory behind this handle
    pub fn as_shaped_buffer(&self) -> ForgeResult<ShapedBuffer> {
        let (buffer, _) = self.live()?;
        Ok(buffer.as_shaped_buffer())
    }

    /// One handle per tuple element, each sharing that element's memory
    pub fn destructure_tuple(&self) -> ForgeResult<Vec<LocalBuffer>> {
        let (buffer, client) = self.live()?;
        if !self.on_host_shape.is_tuple() {
            return Err(ForgeError::InvalidArgument(format!(
                "destructure_tuple requires a tuple buffer, got {}",
                self.on_host_shape
            )));
        }
        Ok(self
            .on_host_shape
            .tuple_elements()
            .iter()
            .zip(buffer.children())
            .map(|(shape, child)| LocalBuffer::new(shape.clone(), Arc::clone(child), Arc::clone(client)))
            .collect())
    }

    /// Release this handle's reference to device memory; safe to repeat
    pub fn delete(&mut self) {
        if self.device_buffer.take().is_some() {
            tracing::trace!(
                device_ordinal = self.device_ordinal,
                shape = %self.on_host_shape,
                "LocalBuffer: deleted"
            );
        }
        self.client = None;
    }

    pub fn is_deleted(&self) -> bool {
        self.device_buffer.is_none()
    }

    pub fn on_host_shape(&self) -> &Shape {
        &self.on_host_shape
    }

    pub fn device_ordinal(&self) -> usize {
        self.device_ordinal
    }

    pub fn client(&self) -> ForgeResult<&Arc<LocalClient>> {
        Ok(self.live()?.1)
    }

    pub fn device_buffer(&self) -> ForgeResult<&Arc<SharedDeviceBuffer>> {
        Ok(self.live()?.0)
    }

    /// Wait until the value is fully on the device
    pub fn block_host_until_ready(&self) -> ForgeResult<()> {
        let (buffer, _) = self.live()?;
        buffer.block_until_defined().map_err(|e| {
            ForgeError::driver(
                format!("transferring {} to device {}", self.on_host_shape, self.device_ordinal),
                e,
            )
        })
    }
}

fn allocate_for(
    client: &LocalClient,
    shape: &Shape,
    device_ordinal: usize,
) -> ForgeResult<Arc<SharedDeviceBuffer>> {
    SharedDeviceBuffer::allocate(client.platform(), shape, device_ordinal).map_err(|e| {
        ForgeError::driver(
            format!("allocating {} on device {}", shape, device_ordinal),
            e,
        )
    })
}
