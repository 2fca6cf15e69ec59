pub mod controller;
#[cfg(test)]
pub mod fake;
pub mod host;
pub mod locator;
pub mod parse;
pub mod runner;

pub use controller::DeviceController;
pub use host::{HostControllerOptions, HostDeviceController};
