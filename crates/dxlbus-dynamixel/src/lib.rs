//! dxlbus-dynamixel: Dynamixel Protocol 2.0 bus engine.
//!
//! This crate implements register access to Dynamixel motors over a shared
//! half-duplex serial bus. It provides:
//!
//! - [`models`]: per-family register schemas (X-series, MX-series, XL-320)
//! - [`packet`]: Protocol 2.0 packet encoding and status decoding
//! - [`instructions`]: ping, read, write, bulk read and bulk write frames
//! - [`bus`]: the [`BusChannel`] that owns the transport
//! - [`directory`]: the [`MotorDirectory`] of known motors and discovery
//! - [`transaction`]: validated single and bulk [`Transaction`]s
//! - [`controller`]: the [`MotorController`] command surface
//! - [`builder`]: fluent [`BusBuilder`] for constructing a controller
//! - [`config`]: CSV configuration tables

pub mod builder;
pub mod bus;
pub mod config;
pub mod controller;
pub mod directory;
pub mod instructions;
mod io;
pub mod models;
pub mod packet;
pub mod transaction;

pub use builder::BusBuilder;
pub use bus::{BusChannel, BusTiming, SUPPORTED_BAUD_RATES};
pub use config::BusConfig;
pub use controller::{DispatchPolicy, MotorController, RegisterReading};
pub use directory::{DiscoveryReport, Motor, MotorDirectory, SkippedDevice};
pub use instructions::ModelInfo;
pub use models::{RegisterDescriptor, RegisterSchema, model_tag_for_number, supported_models};
pub use transaction::{Direction, Transaction, TransactionEngine, TransferMode};
