//! dxlbus-test-harness: Test utilities and mock transports for dxlbus.
//!
//! This crate provides [`MockTransport`] for deterministic unit testing of
//! the bus engine without requiring real motors.

pub mod mock_serial;

pub use mock_serial::MockTransport;
