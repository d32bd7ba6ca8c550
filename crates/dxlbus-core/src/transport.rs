//! Transport trait for bus communication.
//!
//! The [`Transport`] trait abstracts over the physical link to the motor
//! bus. A serial implementation lives in `dxlbus-transport`, and a
//! scripted mock lives in `dxlbus-test-harness`.
//!
//! Protocol engines operate on a `Transport` rather than directly on a
//! serial port, so the same engine drives real hardware and deterministic
//! unit tests.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

/// Asynchronous byte-level transport to the motor bus.
///
/// A transport starts closed. [`open()`](Transport::open) acquires the
/// underlying device; [`close()`](Transport::close) releases it and may be
/// followed by another `open()` with different parameters.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the device at `port` with the given baud rate.
    ///
    /// Fails with [`CommError::PortUnavailable`](crate::error::CommError::PortUnavailable)
    /// when the device cannot be opened and
    /// [`CommError::BaudRejected`](crate::error::CommError::BaudRejected)
    /// when the rate cannot be configured.
    async fn open(&mut self, port: &str, baud_rate: u32) -> Result<()>;

    /// Send raw bytes to the bus.
    ///
    /// Implementations should not return until every byte has been handed
    /// to the underlying device.
    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Receive bytes from the bus into the provided buffer.
    ///
    /// Returns the number of bytes read. Waits up to `timeout` for data;
    /// returns [`CommError::NoResponse`](crate::error::CommError::NoResponse)
    /// if nothing arrives within the deadline.
    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Close the transport. Idempotent.
    ///
    /// After calling `close()`, `send()` and `receive()` fail with
    /// [`CommError::PortUnavailable`](crate::error::CommError::PortUnavailable).
    async fn close(&mut self) -> Result<()>;

    /// Check whether the transport is currently open.
    fn is_connected(&self) -> bool;
}
