//! CSV bus configuration.
//!
//! A configuration directory holds two tables:
//!
//! `comm.csv`, one `key,value` row per setting:
//!
//! ```text
//! key,value
//! port,/dev/ttyUSB0
//! baudrate,57600
//! protocol,2.0
//! ```
//!
//! `motors.csv`, one row per motor to register without discovery:
//!
//! ```text
//! id,model
//! 1,X_SERIES
//! 2,X_SERIES
//! ```
//!
//! The motor table is optional; without it the directory starts empty and
//! is expected to be filled by discovery.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, warn};

use dxlbus_core::error::{Error, Result};
use dxlbus_core::types::{MotorId, ProtocolVersion};

pub const COMM_FILE: &str = "comm.csv";
pub const MOTORS_FILE: &str = "motors.csv";

#[derive(Debug, Deserialize)]
struct CommRow {
    key: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct MotorRow {
    id: u8,
    model: String,
}

/// Everything needed to open the bus and seed the directory.
#[derive(Debug, Clone, PartialEq)]
pub struct BusConfig {
    pub port: String,
    pub baud_rate: u32,
    pub protocol: ProtocolVersion,
    /// Motors to register up front, in file order.
    pub motors: Vec<(MotorId, String)>,
}

impl BusConfig {
    /// Load `comm.csv` and, if present, `motors.csv` from `dir`.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let comm_path = dir.join(COMM_FILE);
        let comm = File::open(&comm_path)
            .map_err(|e| Error::Config(format!("{}: {e}", comm_path.display())))?;

        let motors_path = dir.join(MOTORS_FILE);
        let motors = if motors_path.exists() {
            Some(
                File::open(&motors_path)
                    .map_err(|e| Error::Config(format!("{}: {e}", motors_path.display())))?,
            )
        } else {
            debug!(path = %motors_path.display(), "no motor table, directory starts empty");
            None
        };

        let config = Self::from_readers(comm, motors)?;
        debug!(
            port = %config.port,
            baud_rate = config.baud_rate,
            motors = config.motors.len(),
            "configuration loaded"
        );
        Ok(config)
    }

    /// Parse both tables from arbitrary readers.
    pub fn from_readers<C: Read, M: Read>(comm: C, motors: Option<M>) -> Result<Self> {
        let mut port = None;
        let mut baud_rate = None;
        let mut protocol = None;

        for row in csv_reader(comm).deserialize::<CommRow>() {
            let row = row.map_err(csv_error)?;
            match row.key.to_ascii_lowercase().as_str() {
                "port" => port = Some(row.value),
                "baudrate" | "baud_rate" | "baud" => {
                    let baud = row.value.parse::<u32>().map_err(|_| {
                        Error::Config(format!("invalid baudrate: {}", row.value))
                    })?;
                    baud_rate = Some(baud);
                }
                "protocol" => {
                    let version = row
                        .value
                        .parse::<ProtocolVersion>()
                        .map_err(|e| Error::Config(e.to_string()))?;
                    protocol = Some(version);
                }
                other => warn!(key = other, "ignoring unknown configuration key"),
            }
        }

        let motors = match motors {
            Some(reader) => parse_motors(reader)?,
            None => Vec::new(),
        };

        Ok(BusConfig {
            port: port.ok_or_else(|| Error::Config("missing port".into()))?,
            baud_rate: baud_rate.ok_or_else(|| Error::Config("missing baudrate".into()))?,
            protocol: protocol.ok_or_else(|| Error::Config("missing protocol".into()))?,
            motors,
        })
    }
}

fn parse_motors<R: Read>(reader: R) -> Result<Vec<(MotorId, String)>> {
    let mut seen = BTreeSet::new();
    let mut motors = Vec::new();
    for row in csv_reader(reader).deserialize::<MotorRow>() {
        let row = row.map_err(csv_error)?;
        let id = MotorId::new(row.id).map_err(|e| Error::Config(e.to_string()))?;
        if !seen.insert(id) {
            return Err(Error::Config(format!("motor {id} listed twice")));
        }
        motors.push((id, row.model));
    }
    Ok(motors)
}

fn csv_reader<R: Read>(reader: R) -> csv::Reader<R> {
    csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .comment(Some(b'#'))
        .from_reader(reader)
}

fn csv_error(e: csv::Error) -> Error {
    Error::Config(e.to_string())
}
