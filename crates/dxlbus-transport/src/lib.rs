//! Transport implementations for dxlbus.
//!
//! This crate provides [`SerialTransport`], the concrete implementation of
//! the [`Transport`](dxlbus_core::Transport) trait for USB serial adapters
//! attached to the motor bus.

pub mod serial;

pub use serial::{DataBits, FlowControl, Parity, SerialConfig, SerialTransport, StopBits};
