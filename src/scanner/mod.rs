//! BLE scanner backends.
//!
//! Each backend runs passively, turns received advertisements into
//! [`AdvertisementFrame`]s and pushes them into a bounded channel. Backends
//! may narrow the stream with hardware or daemon-side filters, but that is
//! only an optimization: the ingestion loop re-checks every frame.

#[cfg(feature = "bluer")]
pub mod bluer;

#[cfg(feature = "hci")]
pub mod hci;

use crate::frame::{AdvertisementFrame, THERMOBEACON_NAME, THERMOBEACON_SERVICE_UUID16};
use thiserror::Error;
use tokio::sync::mpsc;

/// Error type for scanner operations.
#[derive(Error, Debug)]
pub enum ScanError {
    /// Bluetooth/adapter related error
    #[error("Bluetooth error: {0}")]
    Bluetooth(String),
}

/// Bluetooth manufacturer-specific data type (AD type 0xFF)
pub const AD_TYPE_MANUFACTURER_DATA: u8 = 0xFF;

/// Incomplete list of 16-bit service UUIDs (AD type 0x02)
pub const AD_TYPE_INCOMPLETE_UUID16: u8 = 0x02;

/// Shortened local name (AD type 0x08)
pub const AD_TYPE_SHORT_NAME: u8 = 0x08;

/// Complete local name (AD type 0x09)
pub const AD_TYPE_COMPLETE_NAME: u8 = 0x09;

/// Channel buffer size between a backend and the ingestion loop.
pub const FRAME_CHANNEL_BUFFER_SIZE: usize = 100;

/// Available scanner backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Backend {
    /// BlueZ D-Bus backend (requires bluetoothd daemon)
    #[cfg(feature = "bluer")]
    Bluer,
    /// Raw HCI socket backend (direct kernel access, no daemon required)
    #[cfg(feature = "hci")]
    Hci,
}

impl Default for Backend {
    fn default() -> Self {
        #[cfg(feature = "bluer")]
        return Backend::Bluer;
        #[cfg(all(feature = "hci", not(feature = "bluer")))]
        return Backend::Hci;
        #[cfg(not(any(feature = "bluer", feature = "hci")))]
        compile_error!("At least one backend feature must be enabled");
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            #[cfg(feature = "bluer")]
            Backend::Bluer => write!(f, "bluer"),
            #[cfg(feature = "hci")]
            Backend::Hci => write!(f, "hci"),
            #[cfg(not(any(feature = "bluer", feature = "hci")))]
            _ => unreachable!("Backend enum has no variants when no backend features are enabled"),
        }
    }
}

/// Best-effort pre-filter handed to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanFilter {
    /// Advertised name to match
    pub name: String,
    /// 16-bit service UUID the beacons advertise
    pub service_uuid16: u16,
}

impl Default for ScanFilter {
    fn default() -> Self {
        Self {
            name: THERMOBEACON_NAME.to_string(),
            service_uuid16: THERMOBEACON_SERVICE_UUID16,
        }
    }
}

/// Start a passive scan using the specified backend.
///
/// # Returns
/// A receiver of advertisement frames. The channel closes when the backend
/// stops delivering events.
pub async fn start_scan(
    backend: Backend,
    filter: ScanFilter,
) -> Result<mpsc::Receiver<AdvertisementFrame>, ScanError> {
    match backend {
        #[cfg(feature = "bluer")]
        Backend::Bluer => bluer::start_scan(filter).await,
        #[cfg(feature = "hci")]
        Backend::Hci => hci::start_scan(filter).await,
    }
}
