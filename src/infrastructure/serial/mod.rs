// Serial module - Device access and health tracking
pub mod device;
pub mod driver;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use device::{Device, DeviceSink, DeviceSource, DeviceState};
pub use driver::{SerialDriver, SerialHandle, SystemSerialDriver};
