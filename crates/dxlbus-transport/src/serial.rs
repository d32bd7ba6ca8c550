//! Serial port transport for the motor bus.
//!
//! This module provides [`SerialTransport`], which implements the
//! [`Transport`] trait for USB-to-RS485/TTL adapters (U2D2, USB2Dynamixel
//! and similar). These present as virtual serial ports and drive the
//! half-duplex bus direction automatically.
//!
//! # Example
//!
//! ```no_run
//! use dxlbus_transport::SerialTransport;
//! use dxlbus_core::transport::Transport;
//! use std::time::Duration;
//!
//! # async fn example() -> dxlbus_core::Result<()> {
//! let mut transport = SerialTransport::new();
//! transport.open("/dev/ttyUSB0", 57_600).await?;
//!
//! // Ping motor 1 (Protocol 2.0)
//! transport
//!     .send(&[0xFF, 0xFF, 0xFD, 0x00, 0x01, 0x03, 0x00, 0x01, 0x19, 0x4E])
//!     .await?;
//!
//! let mut buf = [0u8; 64];
//! let n = transport.receive(&mut buf, Duration::from_millis(50)).await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use dxlbus_core::error::{CommError, Error, Result};
use dxlbus_core::transport::Transport;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPortBuilderExt, SerialStream};

pub use tokio_serial::{DataBits, FlowControl, Parity, StopBits};

/// Serial line settings applied on every [`open()`](Transport::open).
///
/// The baud rate is not part of the configuration; it is supplied to
/// `open()` so that a channel can be reopened at a different rate.
/// Defaults match the motor bus: 8 data bits, 1 stop bit, no parity,
/// no flow control.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
    pub parity: Parity,
    pub flow_control: FlowControl,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
            parity: Parity::None,
            flow_control: FlowControl::None,
        }
    }
}

/// Serial port transport for the motor bus.
pub struct SerialTransport {
    config: SerialConfig,
    port: Option<SerialStream>,
    /// Port name for logging. Empty until the first successful open.
    port_name: String,
}

impl SerialTransport {
    /// Create a closed transport with default line settings.
    pub fn new() -> Self {
        Self::with_config(SerialConfig::default())
    }

    /// Create a closed transport with custom line settings.
    pub fn with_config(config: SerialConfig) -> Self {
        Self {
            config,
            port: None,
            port_name: String::new(),
        }
    }

    /// Get the name of the serial port last opened.
    pub fn port_name(&self) -> &str {
        &self.port_name
    }
}

impl Default for SerialTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// Map a failure from the serial driver onto the bus error taxonomy.
///
/// The driver reports an unsupported rate as `InvalidInput`; everything
/// else means the device itself could not be acquired.
fn open_error(port: &str, baud_rate: u32, e: tokio_serial::Error) -> Error {
    match e.kind() {
        tokio_serial::ErrorKind::InvalidInput => CommError::BaudRejected(baud_rate).into(),
        _ => CommError::PortUnavailable(format!("{port}: {e}")).into(),
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn open(&mut self, port: &str, baud_rate: u32) -> Result<()> {
        if self.port.is_some() {
            return Err(Error::InvalidParameter(format!(
                "serial port {} is already open",
                self.port_name
            )));
        }

        tracing::debug!(
            port = %port,
            baud_rate,
            data_bits = ?self.config.data_bits,
            stop_bits = ?self.config.stop_bits,
            parity = ?self.config.parity,
            "Opening serial port"
        );

        let stream = tokio_serial::new(port, baud_rate)
            .data_bits(self.config.data_bits)
            .stop_bits(self.config.stop_bits)
            .parity(self.config.parity)
            .flow_control(self.config.flow_control)
            .open_native_async()
            .map_err(|e| {
                tracing::error!(port = %port, error = %e, "Failed to open serial port");
                open_error(port, baud_rate, e)
            })?;

        tracing::info!(port = %port, baud_rate, "Serial port opened");

        self.port = Some(stream);
        self.port_name = port.to_string();
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| CommError::PortUnavailable("serial port not open".into()))?;

        tracing::trace!(port = %self.port_name, bytes = data.len(), data = ?data, "Sending data");

        port.write_all(data).await.map_err(|e| {
            tracing::error!(port = %self.port_name, error = %e, "Failed to send data");
            CommError::TxFailed(e.to_string())
        })?;
        port.flush()
            .await
            .map_err(|e| CommError::TxFailed(e.to_string()))?;

        Ok(())
    }

    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| CommError::PortUnavailable("serial port not open".into()))?;

        match tokio::time::timeout(timeout, port.read(buf)).await {
            Ok(Ok(n)) => {
                tracing::trace!(port = %self.port_name, bytes = n, data = ?&buf[..n], "Received data");
                Ok(n)
            }
            Ok(Err(e)) => {
                tracing::error!(port = %self.port_name, error = %e, "Failed to receive data");
                Err(Error::Io(e))
            }
            Err(_) => Err(CommError::NoResponse.into()),
        }
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut port) = self.port.take() {
            if let Err(e) = port.flush().await {
                tracing::warn!(port = %self.port_name, error = %e, "Failed to flush before closing");
            }
            tracing::info!(port = %self.port_name, "Serial port closed");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }
}
