//! BlueZ D-Bus backend for ThermoBeacon scanning.
//!
//! This backend uses the `bluer` crate to communicate with the BlueZ daemon
//! via D-Bus. It requires the `bluetoothd` daemon to be running. Scanning is
//! done through an advertisement monitor, which BlueZ runs passively.

use super::{
    AD_TYPE_COMPLETE_NAME, AD_TYPE_INCOMPLETE_UUID16, FRAME_CHANNEL_BUFFER_SIZE, ScanError,
    ScanFilter,
};
use crate::frame::AdvertisementFrame;
use bluer::monitor::{Monitor, MonitorEvent, Pattern};
use bluer::{Adapter, Address, Device, DeviceEvent, DeviceProperty, Session};
use futures::StreamExt;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

impl From<bluer::Error> for ScanError {
    fn from(err: bluer::Error) -> Self {
        ScanError::Bluetooth(err.to_string())
    }
}

/// Monitor patterns for the pre-filter; BlueZ matches if any pattern matches.
fn monitor_patterns(filter: &ScanFilter) -> Vec<Pattern> {
    vec![
        Pattern {
            data_type: AD_TYPE_COMPLETE_NAME,
            start_position: 0,
            content: filter.name.as_bytes().to_vec(),
        },
        Pattern {
            data_type: AD_TYPE_INCOMPLETE_UUID16,
            start_position: 0,
            content: filter.service_uuid16.to_le_bytes().to_vec(),
        },
    ]
}

/// Start a passive scan using the BlueZ D-Bus backend.
///
/// Every device the monitor reports is read once immediately and then
/// watched for property changes, so a frame is produced for each new
/// manufacturer payload until BlueZ reports the device lost.
pub async fn start_scan(
    filter: ScanFilter,
) -> Result<mpsc::Receiver<AdvertisementFrame>, ScanError> {
    let session = Session::new().await?;
    let adapter = session.default_adapter().await?;
    adapter.set_powered(true).await?;

    let (tx, rx) = mpsc::channel(FRAME_CHANNEL_BUFFER_SIZE);

    let monitor_manager = adapter.monitor().await?;
    let mut monitor_handle = monitor_manager
        .register(Monitor {
            patterns: Some(monitor_patterns(&filter)),
            ..Default::default()
        })
        .await?;

    // Spawn a task that owns all Bluetooth state and runs the event loop
    tokio::spawn(async move {
        let _session = session;
        let _monitor_manager = monitor_manager;
        let mut watchers: HashMap<Address, JoinHandle<()>> = HashMap::new();

        while let Some(event) = monitor_handle.next().await {
            match event {
                MonitorEvent::DeviceFound(id) => {
                    if is_watched(&watchers, &id.device) {
                        continue;
                    }
                    match watch_device(&adapter, id.device, tx.clone()).await {
                        Ok(handle) => {
                            watchers.insert(id.device, handle);
                        }
                        Err(e) => warn!(address = %id.device, error = %e, "cannot watch device"),
                    }
                }
                MonitorEvent::DeviceLost(id) => {
                    if let Some(handle) = watchers.remove(&id.device) {
                        debug!(address = %id.device, "device lost");
                        handle.abort();
                    }
                }
                _ => {}
            }

            if tx.is_closed() {
                break;
            }
        }

        for (_, handle) in watchers {
            handle.abort();
        }
    });

    Ok(rx)
}

/// Whether `address` still has a running watcher.
///
/// A watcher ends by itself when BlueZ drops the device object, so a
/// finished handle means the device must be watched again.
fn is_watched(watchers: &HashMap<Address, JoinHandle<()>>, address: &Address) -> bool {
    watchers
        .get(address)
        .is_some_and(|handle| !handle.is_finished())
}

/// Read a device's current advertisement and spawn a task that forwards
/// every later manufacturer data change.
async fn watch_device(
    adapter: &Adapter,
    address: Address,
    tx: mpsc::Sender<AdvertisementFrame>,
) -> Result<JoinHandle<()>, ScanError> {
    let device = adapter.device(address)?;
    let mut frame = read_frame(&device).await?;
    let events = device.events().await?;

    Ok(tokio::spawn(async move {
        futures::pin_mut!(events);

        if !frame.manufacturer_data.is_empty() && tx.send(frame.clone()).await.is_err() {
            return;
        }

        while let Some(DeviceEvent::PropertyChanged(property)) = events.next().await {
            match property {
                DeviceProperty::ManufacturerData(data) => {
                    frame.manufacturer_data = data;
                    if tx.send(frame.clone()).await.is_err() {
                        break;
                    }
                }
                DeviceProperty::Name(name) => frame.local_name = Some(name),
                DeviceProperty::Alias(alias) => frame.device_name = Some(alias),
                _ => {}
            }
        }
    }))
}

async fn read_frame(device: &Device) -> Result<AdvertisementFrame, ScanError> {
    Ok(AdvertisementFrame {
        address: device.address().into(),
        local_name: device.name().await?,
        device_name: device.alias().await.ok(),
        manufacturer_data: device.manufacturer_data().await?.unwrap_or_default(),
    })
}
