pub mod cli;
mod config;
mod telemetry;

pub use config::{parse_devices, BatteryConfig, DeviceEntry};
pub use telemetry::{DeviceTelemetry, TelemetryStore};
