use crate::frame::{AdvertisementFrame, THERMOBEACON_MANUFACTURER_ID, THERMOBEACON_NAME};
use crate::mac_address::MacAddress;
use std::collections::HashMap;

/// A stable address for unit tests.
pub const TEST_MAC: MacAddress = MacAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

/// Build a frame that passes the default filter, carrying `payload`.
pub fn thermobeacon_frame(address: MacAddress, payload: Vec<u8>) -> AdvertisementFrame {
    AdvertisementFrame {
        address,
        local_name: Some(THERMOBEACON_NAME.to_string()),
        device_name: None,
        manufacturer_data: HashMap::from([(THERMOBEACON_MANUFACTURER_ID, payload)]),
    }
}

/// Find the value of the sample whose series (name + labels) is exactly `series`.
pub fn sample(exposition: &str, series: &str) -> Option<f64> {
    exposition
        .lines()
        .filter(|line| !line.starts_with('#'))
        .find_map(|line| line.strip_prefix(series)?.strip_prefix(' '))
        .and_then(|value| value.trim().parse().ok())
}
