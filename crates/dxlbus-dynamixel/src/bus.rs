//! BusChannel -- the physical connection to a chain of motors.
//!
//! A [`BusChannel`] owns the transport through a background IO task and
//! exposes the raw primitives every higher layer is built on: open/close,
//! single-register read and write, bulk read and write, ping and broadcast
//! discovery. Primitives take `&self` and may be called from any number of
//! tasks; the IO task runs them one at a time.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tracing::debug;

use dxlbus_core::error::{CommError, Error, Result};
use dxlbus_core::transport::Transport;
use dxlbus_core::types::{MotorId, ProtocolVersion, RegisterValue, Width};

use crate::instructions::{BulkReadEntry, BulkWriteEntry, ModelInfo};
use crate::io::{self, BusIo, Request, STATUS_OVERHEAD, spawn_io_task};

/// Baud rates accepted by Protocol 2.0 motors.
pub const SUPPORTED_BAUD_RATES: &[u32] = &[
    9_600, 57_600, 115_200, 1_000_000, 2_000_000, 3_000_000, 4_000_000, 4_500_000,
];

/// Timing parameters for bus exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusTiming {
    /// Base timeout for one exchange. The time needed to clock the expected
    /// reply bytes at the current baud rate is added on top.
    pub command_timeout: Duration,
    /// Fixed listening window for broadcast discovery. When `None` the
    /// window is derived from the baud rate.
    pub discovery_window: Option<Duration>,
}

impl Default for BusTiming {
    fn default() -> Self {
        BusTiming {
            command_timeout: Duration::from_millis(100),
            discovery_window: None,
        }
    }
}

/// Handle to an open or closed serial bus.
///
/// Created in the closed state; call [`open`](Self::open) before issuing
/// any primitive. While closed, every primitive fails with
/// [`CommError::PortUnavailable`] without touching the transport.
pub struct BusChannel {
    io: BusIo,
    timing: BusTiming,
    /// Baud rate of the open port; zero while closed.
    baud_rate: AtomicU32,
}

impl BusChannel {
    /// Wrap a transport. Must be called from within a Tokio runtime.
    pub fn new(transport: Box<dyn Transport>, timing: BusTiming) -> Self {
        BusChannel {
            io: spawn_io_task(transport, timing),
            timing,
            baud_rate: AtomicU32::new(0),
        }
    }

    pub fn timing(&self) -> BusTiming {
        self.timing
    }

    /// Open the port. Closed → Open.
    ///
    /// Only Protocol 2.0 is spoken; `V1` fails with `InvalidParameter`.
    /// Baud rates outside [`SUPPORTED_BAUD_RATES`] fail with
    /// `BaudRejected` before the transport is touched. Opening an already
    /// open channel fails with `InvalidParameter`; close it first.
    pub async fn open(&self, port: &str, baud_rate: u32, protocol: ProtocolVersion) -> Result<()> {
        if protocol != ProtocolVersion::V2 {
            return Err(Error::InvalidParameter(format!(
                "protocol {protocol} is not supported, only 2.0"
            )));
        }
        if !SUPPORTED_BAUD_RATES.contains(&baud_rate) {
            return Err(CommError::BaudRejected(baud_rate).into());
        }
        self.io
            .call(
                |reply| Request::Open {
                    port: port.to_string(),
                    baud_rate,
                    protocol,
                    reply,
                },
                self.timing.command_timeout,
            )
            .await?;
        self.baud_rate.store(baud_rate, Ordering::Release);
        Ok(())
    }

    /// Close the port. Open → Closed; closing a closed channel is a no-op.
    pub async fn close(&self) -> Result<()> {
        let result = self
            .io
            .call(|reply| Request::Close { reply }, self.timing.command_timeout)
            .await;
        self.baud_rate.store(0, Ordering::Release);
        result
    }

    pub fn is_open(&self) -> bool {
        self.baud_rate().is_some()
    }

    /// Baud rate of the open port.
    pub fn baud_rate(&self) -> Option<u32> {
        match self.baud_rate.load(Ordering::Acquire) {
            0 => None,
            baud => Some(baud),
        }
    }

    /// Reply budget for an exchange expecting `reply_bytes` back.
    fn budget(&self, reply_bytes: usize) -> Duration {
        let baud = self.baud_rate().unwrap_or(SUPPORTED_BAUD_RATES[0]);
        io::exchange_timeout(&self.timing, baud, reply_bytes)
    }

    /// Ping one motor and return its model number and firmware version.
    pub async fn ping(&self, id: MotorId) -> Result<ModelInfo> {
        self.io
            .call(
                |reply| Request::Ping { id, reply },
                self.budget(STATUS_OVERHEAD + 3),
            )
            .await
    }

    /// Read `length` raw bytes starting at `address`.
    pub async fn read_bytes(&self, id: MotorId, address: u16, length: u16) -> Result<Vec<u8>> {
        self.io
            .call(
                |reply| Request::Read {
                    id,
                    address,
                    length,
                    reply,
                },
                self.budget(STATUS_OVERHEAD + length as usize),
            )
            .await
    }

    /// Read one register of `width` bytes.
    ///
    /// Fails with `Timeout` when only partial or corrupt bytes arrived,
    /// `NoResponse` on silence, and `DeviceError` when the motor's status
    /// packet carries a non-zero error byte.
    pub async fn read_register(
        &self,
        id: MotorId,
        address: u16,
        width: Width,
    ) -> Result<RegisterValue> {
        let data = self.read_bytes(id, address, width.bytes() as u16).await?;
        RegisterValue::from_le_bytes(width, &data)
    }

    /// Write one register. The value's width decides how many bytes go out.
    pub async fn write_register(
        &self,
        id: MotorId,
        address: u16,
        value: RegisterValue,
    ) -> Result<()> {
        self.io
            .call(
                |reply| Request::Write {
                    id,
                    address,
                    data: value.to_le_bytes(),
                    reply,
                },
                self.budget(STATUS_OVERHEAD),
            )
            .await
    }

    /// Read several motors in one exchange.
    ///
    /// Every requested motor must answer; the first one missing fails the
    /// whole read with `PartialResponse`.
    pub async fn bulk_read(
        &self,
        entries: Vec<BulkReadEntry>,
    ) -> Result<BTreeMap<MotorId, RegisterValue>> {
        let reply_bytes = entries
            .iter()
            .map(|e| STATUS_OVERHEAD + e.width.bytes())
            .sum();
        let budget = self.budget(reply_bytes);
        self.io
            .call(|reply| Request::BulkRead { entries, reply }, budget)
            .await
    }

    /// Write several motors in one frame. No status packets are expected.
    pub async fn bulk_write(&self, entries: Vec<BulkWriteEntry>) -> Result<()> {
        self.io
            .call(
                |reply| Request::BulkWrite { entries, reply },
                self.timing.command_timeout,
            )
            .await
    }

    /// Broadcast a ping and collect every reply within the discovery window.
    ///
    /// A silent bus is an empty, successful result.
    pub async fn broadcast_discover(&self) -> Result<Vec<(MotorId, ModelInfo)>> {
        let baud = self.baud_rate().unwrap_or(SUPPORTED_BAUD_RATES[0]);
        let window = io::discovery_window(&self.timing, baud);
        debug!(window_ms = window.as_millis() as u64, "starting discovery");
        self.io
            .call(|reply| Request::Discover { reply }, window)
            .await
    }

    /// Stop the IO task and recover the transport.
    ///
    /// Any primitive issued afterwards fails with `PortUnavailable`.
    pub async fn shutdown(&self) -> Result<Box<dyn Transport>> {
        let transport = self.io.shutdown().await;
        self.baud_rate.store(0, Ordering::Release);
        transport
    }
}

impl Drop for BusChannel {
    fn drop(&mut self) {
        self.io.cancel.cancel();
        // A transport read that ignores cancellation must not keep the task alive.
        self.io.task.abort();
    }
}
