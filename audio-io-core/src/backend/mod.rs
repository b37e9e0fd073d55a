pub mod registry;
pub mod virtual_device;
