//! Device buffers and the handles clients hold to them

pub mod device_buffer;
pub mod local_buffer;

pub use device_buffer::SharedDeviceBuffer;
pub use local_buffer::LocalBuffer;
