//! dxlbus-core: Core traits, types, and error definitions for dxlbus.
//!
//! This crate defines the protocol-agnostic abstractions shared by the
//! transport implementations and the bus engine. Applications can depend on
//! these types without pulling in a specific wire protocol.
//!
//! # Key types
//!
//! - [`Transport`] -- byte-level communication channel
//! - [`MotorId`], [`RegisterValue`], [`Width`] -- register addressing and values
//! - [`Error`] / [`CommError`] / [`Result`] -- error handling

pub mod error;
pub mod transport;
pub mod types;

pub use error::{CommError, Error, Result};
pub use transport::Transport;
pub use types::*;
