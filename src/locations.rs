//! Device location registry.
//!
//! Maps beacon addresses to human-readable location labels so dashboards can
//! show "Kitchen" instead of a raw address. Entries come from a two-column
//! CSV table (`address,location`, header row first) loaded once at start-up,
//! plus any `--location ADDR=LABEL` pairs given on the command line.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::trace;

/// Default path of the location table, relative to the working directory.
pub const DEFAULT_LOCATIONS_PATH: &str = "resources/locations.csv";

/// One `address → location` mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationEntry {
    /// Device address as written in the table (e.g., "AA:BB:CC:DD:EE:FF")
    pub address: String,
    /// Location label (e.g., "Kitchen")
    pub location: String,
}

/// Errors that make the location table unusable.
#[derive(Error, Debug)]
pub enum LocationError {
    #[error("cannot open location table {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot read location table: {0}")]
    Read(#[source] csv::Error),
}

/// Load the location table at `path`.
///
/// # Errors
/// Opening or reading the file is fatal; malformed rows are not (see
/// [`from_reader`]).
pub fn load(path: &Path) -> Result<Vec<LocationEntry>, LocationError> {
    let file = File::open(path).map_err(|source| LocationError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    from_reader(file)
}

/// Parse a location table from any reader.
///
/// The first row is a header and is always skipped. Only rows with exactly
/// two columns are kept, both trimmed. Rows of any other shape, including
/// rows that are not valid UTF-8, are skipped without error.
///
/// # Example
/// ```
/// use thermobeacon_exporter::locations::from_reader;
///
/// let table = "address,location\nAA:BB:CC:DD:EE:FF, Kitchen\nonlyonecolumn\n";
/// let entries = from_reader(table.as_bytes()).unwrap();
/// assert_eq!(entries.len(), 1);
/// assert_eq!(entries[0].location, "Kitchen");
/// ```
pub fn from_reader<R: io::Read>(reader: R) -> Result<Vec<LocationEntry>, LocationError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut entries = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = match record {
            Ok(record) => record,
            Err(err) if err.is_io_error() => return Err(LocationError::Read(err)),
            Err(err) => {
                trace!(row = index + 2, error = %err, "skipping undecodable location row");
                continue;
            }
        };

        match (record.len(), record.get(0), record.get(1)) {
            (2, Some(address), Some(location)) => entries.push(LocationEntry {
                address: address.to_string(),
                location: location.to_string(),
            }),
            (columns, ..) => {
                trace!(row = index + 2, columns, "skipping location row");
            }
        }
    }

    Ok(entries)
}

/// Parse a location override in the format "ADDRESS=LOCATION".
///
/// # Example
/// ```
/// use thermobeacon_exporter::locations::parse_location;
///
/// let entry = parse_location("AA:BB:CC:DD:EE:FF=Sauna").unwrap();
/// assert_eq!(entry.address, "AA:BB:CC:DD:EE:FF");
/// assert_eq!(entry.location, "Sauna");
/// ```
pub fn parse_location(src: &str) -> Result<LocationEntry, String> {
    src.split_once('=')
        .map(|(address, location)| LocationEntry {
            address: address.trim().into(),
            location: location.trim().into(),
        })
        .filter(|entry| !entry.address.is_empty())
        .ok_or_else(|| "invalid location: expected format ADDRESS=LOCATION".into())
}
