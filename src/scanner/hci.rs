//! Raw HCI socket backend for ThermoBeacon scanning.
//!
//! This backend uses raw Linux HCI sockets to run a passive LE scan without
//! the BlueZ daemon. It requires CAP_NET_RAW and CAP_NET_ADMIN capabilities
//! or root privileges.
//!
//! Without the daemon nobody remembers device names between packets, so the
//! backend keeps the last advertised name per address and hands it over as
//! the frame's device name.

use super::{
    AD_TYPE_COMPLETE_NAME, AD_TYPE_INCOMPLETE_UUID16, AD_TYPE_MANUFACTURER_DATA,
    AD_TYPE_SHORT_NAME, FRAME_CHANNEL_BUFFER_SIZE, ScanError, ScanFilter,
};
use crate::frame::AdvertisementFrame;
use crate::mac_address::MacAddress;
use libc::{AF_BLUETOOTH, SOCK_CLOEXEC, SOCK_RAW, c_int, c_void, sockaddr, socklen_t};
use std::collections::HashMap;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tracing::{debug, trace};

// HCI protocol constants
const BTPROTO_HCI: c_int = 1;
const SOL_HCI: c_int = 0;
const HCI_FILTER: c_int = 2;
const HCI_CHANNEL_RAW: u16 = 0;

// HCI packet types
const HCI_COMMAND_PKT: u8 = 0x01;
const HCI_EVENT_PKT: u8 = 0x04;

// HCI events
const EVT_LE_META_EVENT: u8 = 0x3E;

// LE Meta event sub-events
const EVT_LE_ADVERTISING_REPORT: u8 = 0x02;

// HCI commands
const OGF_LE_CTL: u16 = 0x08;
const OCF_LE_SET_SCAN_PARAMETERS: u16 = 0x000B;
const OCF_LE_SET_SCAN_ENABLE: u16 = 0x000C;

const LE_SCAN_PASSIVE: u8 = 0x00;
const LE_PUBLIC_ADDRESS: u8 = 0x00;
const FILTER_POLICY_ACCEPT_ALL: u8 = 0x00;

/// Scan interval and window, in 0.625 ms units (10 ms each).
const SCAN_INTERVAL: u16 = 0x0010;
const SCAN_WINDOW: u16 = 0x0010;

/// Largest HCI event: header plus 255 parameter bytes.
const HCI_MAX_EVENT_SIZE: usize = 260;

/// HCI socket address structure
#[repr(C)]
struct SockaddrHci {
    hci_family: u16,
    hci_dev: u16,
    hci_channel: u16,
}

/// HCI filter structure for raw sockets
#[repr(C)]
struct HciFilter {
    type_mask: u32,
    event_mask: [u32; 2],
    opcode: u16,
}

impl HciFilter {
    fn new() -> Self {
        Self {
            type_mask: 0,
            event_mask: [0, 0],
            opcode: 0,
        }
    }

    fn set_ptype(&mut self, ptype: u8) {
        self.type_mask |= 1 << (ptype as u32);
    }

    fn set_event(&mut self, event: u8) {
        let bit = event as usize;
        self.event_mask[bit / 32] |= 1 << (bit % 32);
    }
}

/// Create an HCI command packet
fn hci_command_packet(ogf: u16, ocf: u16, params: &[u8]) -> Vec<u8> {
    let opcode = (ogf << 10) | ocf;
    let mut packet = Vec::with_capacity(4 + params.len());
    packet.push(HCI_COMMAND_PKT);
    packet.extend_from_slice(&opcode.to_le_bytes());
    packet.push(params.len() as u8);
    packet.extend_from_slice(params);
    packet
}

/// Parameters of LE Set Scan Parameters for a passive scan.
fn passive_scan_parameters() -> [u8; 7] {
    let interval = SCAN_INTERVAL.to_le_bytes();
    let window = SCAN_WINDOW.to_le_bytes();
    [
        LE_SCAN_PASSIVE,
        interval[0],
        interval[1],
        window[0],
        window[1],
        LE_PUBLIC_ADDRESS,
        FILTER_POLICY_ACCEPT_ALL,
    ]
}

fn os_error(context: &str) -> ScanError {
    ScanError::Bluetooth(format!("{context}: {}", io::Error::last_os_error()))
}

/// Open a non-blocking raw HCI socket bound to `dev_id`.
fn open_hci_socket(dev_id: u16) -> Result<OwnedFd, ScanError> {
    // SOCK_NONBLOCK is required for AsyncFd
    let fd = unsafe {
        libc::socket(
            AF_BLUETOOTH,
            SOCK_RAW | SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
            BTPROTO_HCI,
        )
    };
    if fd < 0 {
        return Err(os_error("Failed to create HCI socket"));
    }
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    let addr = SockaddrHci {
        hci_family: AF_BLUETOOTH as u16,
        hci_dev: dev_id,
        hci_channel: HCI_CHANNEL_RAW,
    };
    let ret = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &addr as *const SockaddrHci as *const sockaddr,
            mem::size_of::<SockaddrHci>() as socklen_t,
        )
    };
    if ret < 0 {
        return Err(os_error("Failed to bind HCI socket"));
    }

    Ok(fd)
}

/// Only deliver LE meta events to the socket.
fn set_hci_filter(fd: &OwnedFd) -> Result<(), ScanError> {
    let mut filter = HciFilter::new();
    filter.set_ptype(HCI_EVENT_PKT);
    filter.set_event(EVT_LE_META_EVENT);

    let ret = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            SOL_HCI,
            HCI_FILTER,
            &filter as *const HciFilter as *const c_void,
            mem::size_of::<HciFilter>() as socklen_t,
        )
    };
    if ret < 0 {
        return Err(os_error("Failed to set HCI filter"));
    }

    Ok(())
}

fn send_hci_command(fd: &OwnedFd, packet: &[u8]) -> Result<(), ScanError> {
    let ret = unsafe {
        libc::write(
            fd.as_raw_fd(),
            packet.as_ptr() as *const c_void,
            packet.len(),
        )
    };
    if ret < 0 {
        return Err(os_error("Failed to send HCI command"));
    }

    Ok(())
}

/// Configure and enable a passive LE scan.
fn enable_passive_scan(fd: &OwnedFd) -> Result<(), ScanError> {
    let packet = hci_command_packet(
        OGF_LE_CTL,
        OCF_LE_SET_SCAN_PARAMETERS,
        &passive_scan_parameters(),
    );
    send_hci_command(fd, &packet)?;

    // Enable scanning, duplicates included: every advertisement carries fresh values
    let packet = hci_command_packet(OGF_LE_CTL, OCF_LE_SET_SCAN_ENABLE, &[0x01, 0x00]);
    send_hci_command(fd, &packet)
}

/// One advertising report: the frame plus the 16-bit service UUIDs it lists.
#[derive(Debug, Default, PartialEq)]
struct Report {
    frame: AdvertisementFrame,
    uuid16s: Vec<u16>,
}

/// Walk the AD structures of one advertisement.
fn parse_ad_structures(address: MacAddress, ad: &[u8]) -> Report {
    let mut report = Report {
        frame: AdvertisementFrame {
            address,
            ..Default::default()
        },
        uuid16s: Vec::new(),
    };

    let mut offset = 0;
    while offset < ad.len() {
        let len = ad[offset] as usize;
        if len == 0 || offset + 1 + len > ad.len() {
            break;
        }
        let ad_type = ad[offset + 1];
        let value = &ad[offset + 2..offset + 1 + len];

        match ad_type {
            AD_TYPE_SHORT_NAME | AD_TYPE_COMPLETE_NAME => {
                // A complete name wins over a shortened one
                if ad_type == AD_TYPE_COMPLETE_NAME || report.frame.local_name.is_none() {
                    report.frame.local_name = Some(String::from_utf8_lossy(value).into_owned());
                }
            }
            AD_TYPE_INCOMPLETE_UUID16 => {
                report.uuid16s.extend(
                    value
                        .chunks_exact(2)
                        .map(|uuid| u16::from_le_bytes([uuid[0], uuid[1]])),
                );
            }
            AD_TYPE_MANUFACTURER_DATA if value.len() >= 2 => {
                let company = u16::from_le_bytes([value[0], value[1]]);
                report
                    .frame
                    .manufacturer_data
                    .insert(company, value[2..].to_vec());
            }
            _ => {}
        }

        offset += 1 + len;
    }

    report
}

/// Parse an LE Advertising Report event into one report per advertisement.
///
/// `event` is the raw packet starting at the HCI packet type byte. Reports
/// are laid out back to back: event type, address type, address (6 bytes,
/// little-endian), data length, data, RSSI.
fn parse_advertising_report(event: &[u8]) -> Vec<Report> {
    if event.len() < 5
        || event[0] != HCI_EVENT_PKT
        || event[1] != EVT_LE_META_EVENT
        || event[3] != EVT_LE_ADVERTISING_REPORT
    {
        return Vec::new();
    }

    let num_reports = event[4] as usize;
    let mut rest = &event[5..];
    let mut reports = Vec::with_capacity(num_reports);

    for _ in 0..num_reports {
        // event type + address type + address + data length
        if rest.len() < 9 {
            break;
        }
        let mut addr = [0u8; 6];
        addr.copy_from_slice(&rest[2..8]);
        let data_len = rest[8] as usize;

        // data + RSSI
        if rest.len() < 9 + data_len + 1 {
            break;
        }
        let ad = &rest[9..9 + data_len];
        reports.push(parse_ad_structures(MacAddress::from_le_bytes(addr), ad));
        rest = &rest[9 + data_len + 1..];
    }

    reports
}

/// Remembers which addresses advertised the wanted name and applies the
/// pre-filter.
///
/// Only addresses whose last advertised name equals the filter name are
/// kept, so unrelated devices rotating random addresses never accumulate.
#[derive(Debug, Default)]
struct NameCache {
    names: HashMap<MacAddress, String>,
}

impl NameCache {
    /// Record the report's name and decide whether to forward its frame.
    fn admit(&mut self, mut report: Report, filter: &ScanFilter) -> Option<AdvertisementFrame> {
        let frame = &mut report.frame;
        if let Some(name) = frame.local_name.as_ref().filter(|name| !name.is_empty()) {
            if *name == filter.name {
                self.names.insert(frame.address, name.clone());
            } else {
                self.names.remove(&frame.address);
            }
        }
        frame.device_name = self.names.get(&frame.address).cloned();

        let wanted = frame.name() == Some(filter.name.as_str())
            || report.uuid16s.contains(&filter.service_uuid16);

        (wanted && !report.frame.manufacturer_data.is_empty()).then_some(report.frame)
    }
}

/// Start a passive scan using raw HCI sockets on `hci0`.
///
/// # Requirements
/// - CAP_NET_RAW and CAP_NET_ADMIN capabilities or root privileges
/// - An available HCI device (typically hci0)
pub async fn start_scan(
    filter: ScanFilter,
) -> Result<mpsc::Receiver<AdvertisementFrame>, ScanError> {
    let fd = open_hci_socket(0)?;
    set_hci_filter(&fd)?;

    // Separate socket for sending commands
    let cmd_fd = open_hci_socket(0)?;
    enable_passive_scan(&cmd_fd)?;

    let (tx, rx) = mpsc::channel(FRAME_CHANNEL_BUFFER_SIZE);

    let async_fd = AsyncFd::new(fd)
        .map_err(|e| ScanError::Bluetooth(format!("Failed to create async fd: {}", e)))?;

    tokio::spawn(async move {
        let _cmd_fd = cmd_fd; // Keep command socket alive
        let mut buf = [0u8; HCI_MAX_EVENT_SIZE];
        let mut names = NameCache::default();

        'events: loop {
            let mut guard = match async_fd.readable().await {
                Ok(guard) => guard,
                Err(e) => {
                    debug!(error = %e, "HCI socket closed");
                    break;
                }
            };

            // Drain all available packets before waiting again
            loop {
                let n = match guard.try_io(|inner| {
                    let ret = unsafe {
                        libc::read(
                            inner.as_raw_fd(),
                            buf.as_mut_ptr() as *mut c_void,
                            buf.len(),
                        )
                    };
                    if ret < 0 {
                        Err(io::Error::last_os_error())
                    } else {
                        Ok(ret as usize)
                    }
                }) {
                    Ok(Ok(n)) if n > 0 => n,
                    Ok(Ok(_)) => break,
                    Ok(Err(e)) => {
                        trace!(error = %e, "HCI read failed");
                        break;
                    }
                    Err(_would_block) => break,
                };

                for report in parse_advertising_report(&buf[..n]) {
                    if let Some(frame) = names.admit(report, &filter)
                        && tx.send(frame).await.is_err()
                    {
                        break 'events;
                    }
                }
            }
        }
    });

    Ok(rx)
}
