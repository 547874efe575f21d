//! Core application runner for `thermobeacon-exporter`.
//!
//! This module is decoupled from process set-up (logging, exit codes) so the
//! ingestion loop can be tested deterministically with an injected scanner.

use crate::decoder::{self, Payload, ProtocolRevision};
use crate::frame::{
    AdvertisementFrame, FrameFilter, THERMOBEACON_MANUFACTURER_ID, THERMOBEACON_NAME,
    THERMOBEACON_SERVICE_UUID16,
};
use crate::locations::{self, LocationEntry, LocationError};
use crate::metrics::{MetricsError, MetricsState};
use crate::scanner::{Backend, ScanError, ScanFilter};
use crate::server;
use clap::Parser;
use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

/// Command-line configuration.
#[derive(Parser, Debug, Clone)]
#[command(author, about, version)]
pub struct Options {
    /// Port of the Prometheus metrics endpoint
    #[arg(long, default_value_t = 8000)]
    pub port: u16,

    /// Address to bind the metrics endpoint to
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind: IpAddr,

    /// CSV table of device locations (header row, then ADDRESS,LOCATION)
    #[arg(long, default_value = locations::DEFAULT_LOCATIONS_PATH)]
    pub locations: PathBuf,

    /// Additional device location.
    /// Format: --location AA:BB:CC:DD:EE:FF=Kitchen
    #[arg(long = "location", value_parser = locations::parse_location, value_name = "LOCATION")]
    pub extra_locations: Vec<LocationEntry>,

    /// Advertised name of the sensors to listen to
    #[arg(long, default_value = THERMOBEACON_NAME)]
    pub name: String,

    /// Manufacturer id the sensor payload is advertised under (decimal or 0x-prefixed hex)
    #[arg(long, default_value = "0x0010", value_parser = parse_manufacturer_id)]
    pub manufacturer_id: u16,

    /// Payload layout of data frames
    #[arg(long, default_value_t, value_enum)]
    pub protocol: ProtocolRevision,

    /// Bluetooth scanner backend to use
    #[arg(long, default_value_t, value_enum)]
    pub backend: Backend,

    /// Verbose output, enable debug logging
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            port: 8000,
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            locations: PathBuf::from(locations::DEFAULT_LOCATIONS_PATH),
            extra_locations: Vec::new(),
            name: THERMOBEACON_NAME.to_string(),
            manufacturer_id: THERMOBEACON_MANUFACTURER_ID,
            protocol: ProtocolRevision::default(),
            backend: Backend::default(),
            verbose: false,
        }
    }
}

impl Options {
    pub fn metrics_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn frame_filter(&self) -> FrameFilter {
        FrameFilter::new(self.name.clone(), self.manufacturer_id)
    }

    pub fn scan_filter(&self) -> ScanFilter {
        ScanFilter {
            name: self.name.clone(),
            service_uuid16: THERMOBEACON_SERVICE_UUID16,
        }
    }
}

/// Parse a manufacturer id given as decimal or `0x`-prefixed hex.
///
/// # Example
/// ```
/// use thermobeacon_exporter::app::parse_manufacturer_id;
///
/// assert_eq!(parse_manufacturer_id("0x0010"), Ok(16));
/// assert_eq!(parse_manufacturer_id("16"), Ok(16));
/// ```
pub fn parse_manufacturer_id(src: &str) -> Result<u16, String> {
    let parsed = match src.strip_prefix("0x").or_else(|| src.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => src.parse(),
    };
    parsed.map_err(|e| format!("invalid manufacturer id '{src}': {e}"))
}

/// Errors returned by the application runner.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error(transparent)]
    Locations(#[from] LocationError),
    #[error(transparent)]
    Metrics(#[from] MetricsError),
    #[error("metrics server: {0}")]
    Io(#[from] io::Error),
}

/// Scanner abstraction to enable deterministic unit tests without Bluetooth hardware.
pub trait Scanner: Send + Sync {
    fn start_scan(
        &self,
        backend: Backend,
        filter: ScanFilter,
    ) -> Pin<
        Box<dyn Future<Output = Result<mpsc::Receiver<AdvertisementFrame>, ScanError>> + Send + '_>,
    >;
}

/// Real scanner implementation that delegates to the compiled-in backends.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealScanner;

impl Scanner for RealScanner {
    fn start_scan(
        &self,
        backend: Backend,
        filter: ScanFilter,
    ) -> Pin<
        Box<dyn Future<Output = Result<mpsc::Receiver<AdvertisementFrame>, ScanError>> + Send + '_>,
    > {
        Box::pin(async move { crate::scanner::start_scan(backend, filter).await })
    }
}

/// Per-run frame counters of the ingestion loop.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestStats {
    /// Readings published to the metrics state
    pub accepted: u64,
    /// Status frames seen (logged only)
    pub status: u64,
    /// Frames from other devices or without a payload
    pub rejected: u64,
    /// Payloads too short to decode
    pub malformed: u64,
}

/// Outcome of running one frame through filter, decoder and store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameOutcome {
    Accepted,
    Status,
    Rejected,
    Malformed,
}

fn process_frame(
    frame: &AdvertisementFrame,
    filter: &FrameFilter,
    revision: ProtocolRevision,
    state: &MetricsState,
) -> FrameOutcome {
    let Some(payload) = filter.accept(frame) else {
        return FrameOutcome::Rejected;
    };
    let address = frame.address.to_string();

    match decoder::decode(payload, revision) {
        Ok(Payload::Status(status)) => {
            info!(
                address = %address,
                len = payload.len(),
                payload = %status.hex,
                "status frame"
            );
            FrameOutcome::Status
        }
        Ok(Payload::Reading(reading)) => {
            info!(
                address = %address,
                len = payload.len(),
                payload = %hex::encode(payload),
                temperature = reading.temperature,
                humidity = reading.humidity,
                voltage = ?reading.voltage,
                uptime = ?reading.uptime,
                "reading"
            );
            state.publish(&address, &reading);
            FrameOutcome::Accepted
        }
        Err(error) => {
            warn!(
                address = %address,
                payload = %hex::encode(payload),
                %error,
                "dropping undecodable frame"
            );
            FrameOutcome::Malformed
        }
    }
}

/// Run the ingestion loop until `shutdown` resolves or the frame channel closes.
///
/// Every frame is filtered, decoded and published before the next one is
/// received. Per-frame failures are logged and counted, never returned.
pub async fn ingest(
    mut frames: mpsc::Receiver<AdvertisementFrame>,
    filter: &FrameFilter,
    revision: ProtocolRevision,
    state: &MetricsState,
    shutdown: impl Future<Output = ()>,
) -> IngestStats {
    let mut stats = IngestStats::default();
    tokio::pin!(shutdown);

    loop {
        let frame = tokio::select! {
            biased;
            _ = &mut shutdown => {
                info!("stopping ingestion");
                break;
            }
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => {
                    info!("scanner stopped delivering frames");
                    break;
                }
            },
        };

        match process_frame(&frame, filter, revision, state) {
            FrameOutcome::Accepted => stats.accepted += 1,
            FrameOutcome::Status => stats.status += 1,
            FrameOutcome::Rejected => stats.rejected += 1,
            FrameOutcome::Malformed => stats.malformed += 1,
        }
    }

    stats
}

/// Load the location table plus command-line overrides into `state`.
///
/// # Errors
/// Fails when the location table cannot be opened or read.
pub fn load_locations(options: &Options, state: &MetricsState) -> Result<usize, LocationError> {
    let entries = locations::load(&options.locations)?;
    let count = entries.len() + options.extra_locations.len();

    for entry in entries.iter().chain(&options.extra_locations) {
        state.publish_location(&entry.address, &entry.location);
    }

    info!(path = %options.locations.display(), count, "loaded location metadata");
    Ok(count)
}

/// Run the exporter: load locations, start the metrics server and the
/// scanner, then ingest frames until `shutdown` resolves.
///
/// Ingestion stops first; the metrics server is then asked to finish its
/// in-flight requests before this returns.
pub async fn run(
    options: Options,
    scanner: &dyn Scanner,
    shutdown: impl Future<Output = ()>,
) -> Result<IngestStats, RunError> {
    let state = Arc::new(MetricsState::new()?);
    load_locations(&options, &state)?;

    let listener = tokio::net::TcpListener::bind(options.metrics_addr()).await?;
    info!(addr = %listener.local_addr()?, "metrics server listening");

    let (stop_tx, stop_rx) = watch::channel(false);
    let server = tokio::spawn(server::serve(listener, Arc::clone(&state), stop_rx));

    let frames = match scanner.start_scan(options.backend, options.scan_filter()).await {
        Ok(frames) => frames,
        Err(e) => {
            let _ = stop_tx.send(true);
            let _ = server.await;
            return Err(e.into());
        }
    };
    info!(backend = %options.backend, name = %options.name, "scanner started");

    let stats = ingest(
        frames,
        &options.frame_filter(),
        options.protocol,
        &state,
        shutdown,
    )
    .await;
    info!(?stats, "ingestion finished");

    let _ = stop_tx.send(true);
    match server.await {
        Ok(result) => result?,
        Err(e) => warn!(error = %e, "metrics server task failed"),
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::tests::extended_payload;
    use crate::mac_address::MacAddress;
    use crate::test_utils::{TEST_MAC, sample, thermobeacon_frame};
    use std::io::Write;
    use std::sync::Mutex;

    #[derive(Debug)]
    struct FakeScanner {
        frames: Mutex<Vec<AdvertisementFrame>>,
    }

    impl FakeScanner {
        fn new(frames: Vec<AdvertisementFrame>) -> Self {
            Self {
                frames: Mutex::new(frames),
            }
        }
    }

    impl Scanner for FakeScanner {
        fn start_scan(
            &self,
            _backend: Backend,
            _filter: ScanFilter,
        ) -> Pin<
            Box<
                dyn Future<Output = Result<mpsc::Receiver<AdvertisementFrame>, ScanError>>
                    + Send
                    + '_,
            >,
        > {
            let frames = self.frames.lock().unwrap().clone();
            Box::pin(async move {
                let (tx, rx) = mpsc::channel::<AdvertisementFrame>(frames.len().max(1));
                tokio::spawn(async move {
                    for f in frames {
                        let _ = tx.send(f).await;
                    }
                    // drop tx to close channel
                });
                Ok(rx)
            })
        }
    }

    struct FailingScanner;

    impl Scanner for FailingScanner {
        fn start_scan(
            &self,
            _backend: Backend,
            _filter: ScanFilter,
        ) -> Pin<
            Box<
                dyn Future<Output = Result<mpsc::Receiver<AdvertisementFrame>, ScanError>>
                    + Send
                    + '_,
            >,
        > {
            Box::pin(async { Err(ScanError::Bluetooth("no adapter".into())) })
        }
    }

    fn channel_of(frames: Vec<AdvertisementFrame>) -> mpsc::Receiver<AdvertisementFrame> {
        let (tx, rx) = mpsc::channel(frames.len().max(1));
        for frame in frames {
            tx.try_send(frame).unwrap();
        }
        rx
    }

    fn test_options(locations: PathBuf) -> Options {
        Options {
            port: 0,
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            locations,
            ..Options::default()
        }
    }

    fn location_table() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "address,location").unwrap();
        writeln!(file, "AA:BB:CC:DD:EE:FF,Kitchen").unwrap();
        writeln!(file, "onlyonecolumn").unwrap();
        file
    }

    #[tokio::test]
    async fn ingest_publishes_accepted_readings() {
        let state = MetricsState::new().unwrap();
        let frames = channel_of(vec![thermobeacon_frame(TEST_MAC, extended_payload())]);

        let stats = ingest(
            frames,
            &FrameFilter::default(),
            ProtocolRevision::Auto,
            &state,
            std::future::pending(),
        )
        .await;

        assert_eq!(
            stats,
            IngestStats {
                accepted: 1,
                ..Default::default()
            }
        );
        let text = state.render().unwrap();
        assert_eq!(
            sample(&text, "sensor_temperature_celsius{address=\"AA:BB:CC:DD:EE:FF\"}"),
            Some(21.5)
        );
        assert_eq!(
            sample(&text, "sensor_humidity_percent{address=\"AA:BB:CC:DD:EE:FF\"}"),
            Some(31.25)
        );
    }

    #[tokio::test]
    async fn ingest_counts_every_outcome_without_failing() {
        let state = MetricsState::new().unwrap();
        let mut other = thermobeacon_frame(TEST_MAC, extended_payload());
        other.local_name = Some("OtherDevice".into());

        let frames = channel_of(vec![
            thermobeacon_frame(TEST_MAC, vec![0u8; 20]),
            thermobeacon_frame(TEST_MAC, vec![0u8; 5]),
            other,
            thermobeacon_frame(TEST_MAC, extended_payload()),
        ]);

        let stats = ingest(
            frames,
            &FrameFilter::default(),
            ProtocolRevision::Auto,
            &state,
            std::future::pending(),
        )
        .await;

        assert_eq!(
            stats,
            IngestStats {
                accepted: 1,
                status: 1,
                rejected: 1,
                malformed: 1,
            }
        );
    }

    #[tokio::test]
    async fn ingest_rejects_empty_manufacturer_payload() {
        let state = MetricsState::new().unwrap();
        let frames = channel_of(vec![thermobeacon_frame(TEST_MAC, Vec::new())]);

        let stats = ingest(
            frames,
            &FrameFilter::default(),
            ProtocolRevision::Auto,
            &state,
            std::future::pending(),
        )
        .await;

        assert_eq!(
            stats,
            IngestStats {
                rejected: 1,
                ..Default::default()
            }
        );
    }

    #[tokio::test]
    async fn ingest_publishes_nothing_for_status_and_malformed_frames() {
        let state = MetricsState::new().unwrap();
        let frames = channel_of(vec![
            thermobeacon_frame(TEST_MAC, vec![0xAB; 20]),
            thermobeacon_frame(TEST_MAC, vec![0xAB; 13]),
        ]);

        ingest(
            frames,
            &FrameFilter::default(),
            ProtocolRevision::Auto,
            &state,
            std::future::pending(),
        )
        .await;

        let text = state.render().unwrap();
        assert!(!text.contains("AA:BB:CC:DD:EE:FF"));
    }

    #[tokio::test]
    async fn ingest_keeps_latest_reading_per_device() {
        let state = MetricsState::new().unwrap();
        let other = MacAddress([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
        let mut warmer = extended_payload();
        warmer[10..12].copy_from_slice(&400i16.to_le_bytes());

        let frames = channel_of(vec![
            thermobeacon_frame(TEST_MAC, extended_payload()),
            thermobeacon_frame(other, extended_payload()),
            thermobeacon_frame(TEST_MAC, warmer),
        ]);

        ingest(
            frames,
            &FrameFilter::default(),
            ProtocolRevision::Auto,
            &state,
            std::future::pending(),
        )
        .await;

        let text = state.render().unwrap();
        assert_eq!(
            sample(&text, "sensor_temperature_celsius{address=\"AA:BB:CC:DD:EE:FF\"}"),
            Some(25.0)
        );
        assert_eq!(
            sample(&text, "sensor_temperature_celsius{address=\"11:22:33:44:55:66\"}"),
            Some(21.5)
        );
    }

    #[tokio::test]
    async fn ingest_stops_on_shutdown() {
        let state = MetricsState::new().unwrap();
        let (_tx, rx) = mpsc::channel::<AdvertisementFrame>(1);

        let stats = ingest(
            rx,
            &FrameFilter::default(),
            ProtocolRevision::Auto,
            &state,
            async {},
        )
        .await;

        assert_eq!(stats, IngestStats::default());
    }

    #[tokio::test]
    async fn run_ingests_until_scanner_closes() {
        let table = location_table();
        let scanner = FakeScanner::new(vec![
            thermobeacon_frame(TEST_MAC, extended_payload()),
            thermobeacon_frame(TEST_MAC, vec![0u8; 20]),
        ]);

        let stats = run(
            test_options(table.path().to_path_buf()),
            &scanner,
            std::future::pending(),
        )
        .await
        .unwrap();

        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.status, 1);
    }

    #[tokio::test]
    async fn run_fails_without_location_table() {
        let dir = tempfile::tempdir().unwrap();
        let scanner = FakeScanner::new(vec![]);

        let err = run(
            test_options(dir.path().join("missing.csv")),
            &scanner,
            std::future::pending(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, RunError::Locations(_)));
    }

    #[tokio::test]
    async fn run_reports_scanner_failure() {
        let table = location_table();
        let err = run(
            test_options(table.path().to_path_buf()),
            &FailingScanner,
            std::future::pending(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, RunError::Scan(_)));
        assert_eq!(err.to_string(), "Bluetooth error: no adapter");
    }

    #[test]
    fn load_locations_merges_table_and_overrides() {
        let table = location_table();
        let mut options = test_options(table.path().to_path_buf());
        options.extra_locations =
            vec![locations::parse_location("11:22:33:44:55:66=Sauna").unwrap()];
        let state = MetricsState::new().unwrap();

        assert_eq!(load_locations(&options, &state).unwrap(), 2);

        let text = state.render().unwrap();
        assert_eq!(
            sample(
                &text,
                "sensor_location_info{address=\"AA:BB:CC:DD:EE:FF\",location=\"Kitchen\"}"
            ),
            Some(1.0)
        );
        assert_eq!(
            sample(
                &text,
                "sensor_location_info{address=\"11:22:33:44:55:66\",location=\"Sauna\"}"
            ),
            Some(1.0)
        );
    }

    #[test]
    fn options_parse_from_command_line() {
        let options = Options::try_parse_from([
            "thermobeacon-exporter",
            "--port",
            "9100",
            "--manufacturer-id",
            "0x0499",
            "--protocol",
            "legacy",
            "--location",
            "AA:BB:CC:DD:EE:FF=Kitchen",
        ])
        .unwrap();

        assert_eq!(options.port, 9100);
        assert_eq!(options.manufacturer_id, 0x0499);
        assert_eq!(options.protocol, ProtocolRevision::Legacy);
        assert_eq!(options.extra_locations.len(), 1);
        assert_eq!(options.name, "ThermoBeacon");
        assert_eq!(options.locations, PathBuf::from("resources/locations.csv"));
    }

    #[test]
    fn options_defaults_match_default_impl() {
        let parsed = Options::try_parse_from(["thermobeacon-exporter"]).unwrap();
        let default = Options::default();
        assert_eq!(parsed.port, default.port);
        assert_eq!(parsed.bind, default.bind);
        assert_eq!(parsed.manufacturer_id, default.manufacturer_id);
        assert_eq!(parsed.protocol, default.protocol);
        assert_eq!(parsed.backend, default.backend);
        assert_eq!(default.metrics_addr().port(), 8000);
    }

    #[test]
    fn parse_manufacturer_id_rejects_garbage() {
        assert!(parse_manufacturer_id("0xZZ").is_err());
        assert!(parse_manufacturer_id("70000").is_err());
        assert_eq!(parse_manufacturer_id("0X10"), Ok(16));
    }
}
