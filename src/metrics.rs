//! Latest-value metrics state for all beacons.
//!
//! Every accepted reading overwrites the per-address gauges; nothing is
//! aggregated and nothing expires. Location metadata is exported as an info
//! gauge with value `1` labelled by `(address, location)`.
//!
//! # Exported metrics
//!
//! - `sensor_temperature_celsius{address}`
//! - `sensor_humidity_percent{address}`
//! - `sensor_voltage{address}`
//! - `sensor_uptime_seconds{address}`
//! - `sensor_location_info{address,location}`

use crate::decoder::SensorReading;
use parking_lot::RwLock;
use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};
use thiserror::Error;

pub const TEMPERATURE_METRIC: &str = "sensor_temperature_celsius";
pub const HUMIDITY_METRIC: &str = "sensor_humidity_percent";
pub const VOLTAGE_METRIC: &str = "sensor_voltage";
pub const UPTIME_METRIC: &str = "sensor_uptime_seconds";
pub const LOCATION_METRIC: &str = "sensor_location_info";

/// Errors from building or rendering the metrics registry.
#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("metrics registry error: {0}")]
    Registry(#[from] prometheus::Error),
    #[error("metrics output is not UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Shared latest-value table, exported in Prometheus text format.
///
/// One writer (the ingestion loop) and any number of concurrent readers
/// (scrapes). `publish` holds the write side of `gate` while it touches the
/// per-reading gauges and `render` holds the read side while gathering, so a
/// scrape never pairs a new temperature with an old humidity.
pub struct MetricsState {
    registry: Registry,
    temperature: GaugeVec,
    humidity: GaugeVec,
    voltage: GaugeVec,
    uptime: GaugeVec,
    location: GaugeVec,
    gate: RwLock<()>,
}

impl std::fmt::Debug for MetricsState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsState").finish_non_exhaustive()
    }
}

fn gauge(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> Result<GaugeVec, MetricsError> {
    let gauge = GaugeVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

impl MetricsState {
    /// Create the registry with all gauge families registered and empty.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        Ok(Self {
            temperature: gauge(
                &registry,
                TEMPERATURE_METRIC,
                "Temperature from BLE sensor",
                &["address"],
            )?,
            humidity: gauge(
                &registry,
                HUMIDITY_METRIC,
                "Humidity from BLE sensor",
                &["address"],
            )?,
            voltage: gauge(
                &registry,
                VOLTAGE_METRIC,
                "Battery voltage from BLE sensor",
                &["address"],
            )?,
            uptime: gauge(
                &registry,
                UPTIME_METRIC,
                "Seconds since BLE sensor boot",
                &["address"],
            )?,
            location: gauge(
                &registry,
                LOCATION_METRIC,
                "ThermoBeacon location metadata",
                &["address", "location"],
            )?,
            registry,
            gate: RwLock::new(()),
        })
    }

    /// Overwrite the current values for `address` with `reading`.
    ///
    /// Fields the reading does not carry (legacy payloads have no voltage or
    /// uptime) keep their previous value.
    pub fn publish(&self, address: &str, reading: &SensorReading) {
        let _guard = self.gate.write();
        let labels = [address];

        self.temperature
            .with_label_values(&labels)
            .set(reading.temperature);
        self.humidity.with_label_values(&labels).set(reading.humidity);
        if let Some(voltage) = reading.voltage {
            self.voltage.with_label_values(&labels).set(voltage);
        }
        if let Some(uptime) = reading.uptime {
            self.uptime.with_label_values(&labels).set(f64::from(uptime));
        }
    }

    /// Mark `address` as being at `location`.
    ///
    /// Several locations for one address are all kept as separate series.
    pub fn publish_location(&self, address: &str, location: &str) {
        self.location
            .with_label_values(&[address, location])
            .set(1.0);
    }

    /// Render all gauges in the Prometheus text exposition format.
    pub fn render(&self) -> Result<String, MetricsError> {
        let families = {
            let _guard = self.gate.read();
            self.registry.gather()
        };

        let mut buffer = Vec::with_capacity(1024);
        TextEncoder::new().encode(&families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    /// Content type of [`render`](Self::render) output.
    pub fn content_type(&self) -> &'static str {
        prometheus::TEXT_FORMAT
    }
}
