//! Advertisement frames and the ThermoBeacon frame filter.

use crate::mac_address::MacAddress;
use std::collections::HashMap;

/// Advertised name of ThermoBeacon sensors.
pub const THERMOBEACON_NAME: &str = "ThermoBeacon";

/// Manufacturer id ThermoBeacons put their payload under.
pub const THERMOBEACON_MANUFACTURER_ID: u16 = 0x0010;

/// 16-bit service UUID (0xFFF0) advertised by ThermoBeacons.
pub const THERMOBEACON_SERVICE_UUID16: u16 = 0xFFF0;

/// One received BLE advertisement, as handed over by a scanner backend.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdvertisementFrame {
    /// Address of the advertising device
    pub address: MacAddress,
    /// Local name carried in the advertisement itself
    pub local_name: Option<String>,
    /// Name the Bluetooth stack has on record for the device
    pub device_name: Option<String>,
    /// Manufacturer-specific data keyed by company id
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
}

impl AdvertisementFrame {
    /// The advertised name, falling back to the device name when the
    /// advertisement carries none.
    pub fn name(&self) -> Option<&str> {
        self.local_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .or(self.device_name.as_deref())
    }
}

/// Accepts frames from one sensor family and extracts their payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameFilter {
    name: String,
    manufacturer_id: u16,
}

impl Default for FrameFilter {
    fn default() -> Self {
        Self::new(THERMOBEACON_NAME, THERMOBEACON_MANUFACTURER_ID)
    }
}

impl FrameFilter {
    pub fn new(name: impl Into<String>, manufacturer_id: u16) -> Self {
        Self {
            name: name.into(),
            manufacturer_id,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn manufacturer_id(&self) -> u16 {
        self.manufacturer_id
    }

    /// Return the manufacturer payload if `frame` belongs to the target family.
    ///
    /// The name must match exactly (case-sensitive) and the frame must carry
    /// a non-empty payload under the configured manufacturer id. Upstream pre-filtering by
    /// the radio backend is best-effort, so this check always runs.
    pub fn accept<'a>(&self, frame: &'a AdvertisementFrame) -> Option<&'a [u8]> {
        if frame.name() != Some(self.name.as_str()) {
            return None;
        }

        frame
            .manufacturer_data
            .get(&self.manufacturer_id)
            .filter(|data| !data.is_empty())
            .map(Vec::as_slice)
    }
}
