//! `thermobeacon-exporter` library.
//!
//! The binary (`src/main.rs`) is responsible for logging set-up and process
//! exit codes. The ingestion loop lives in [`crate::app`] where it can be
//! tested deterministically with an injected scanner.

pub mod app;
pub mod decoder;
pub mod frame;
pub mod locations;
pub mod mac_address;
pub mod metrics;
pub mod scanner;
pub mod server;

#[cfg(test)]
pub(crate) mod test_utils;

// Re-export commonly used types at the crate root
pub use decoder::{DecodeError, Payload, ProtocolRevision, SensorReading, StatusFrame, decode};
pub use frame::{AdvertisementFrame, FrameFilter};
pub use locations::{LocationEntry, LocationError};
pub use mac_address::MacAddress;
pub use metrics::{MetricsError, MetricsState};
pub use scanner::{Backend, ScanError, ScanFilter};
