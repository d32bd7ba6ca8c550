//! # dxlbus -- Register-level control of serial-bus actuators
//!
//! `dxlbus` is an asynchronous Rust library for driving chains of
//! Dynamixel-style motors that share one half-duplex serial bus. It covers
//! per-model register maps, validated single and bulk transactions, and
//! broadcast discovery.
//!
//! ## Quick Start
//!
//! ```no_run
//! use dxlbus::MotorId;
//! use dxlbus::dynamixel::BusBuilder;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let controller = BusBuilder::new()
//!         .serial_port("/dev/ttyUSB0")
//!         .baud_rate(57_600)
//!         .build()
//!         .await?;
//!
//!     let report = controller.discover_motors().await?;
//!     let positions = controller.read_position(&report.found).await?;
//!     for (id, position) in positions {
//!         println!("motor {id}: {position}");
//!     }
//!
//!     let id = MotorId::new(1)?;
//!     controller.write_torque(&[id], &["1"]).await?;
//!     controller.write_goal_position(&[id], &["2048"]).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! | Crate                 | Purpose                                          |
//! |-----------------------|--------------------------------------------------|
//! | `dxlbus-core`         | [`Transport`] trait, register types, errors      |
//! | `dxlbus-transport`    | Serial transport                                 |
//! | `dxlbus-dynamixel`    | Protocol 2.0 engine: schemas, bus, transactions  |
//! | **`dxlbus`**          | This facade crate -- re-exports everything       |
//!
//! ## Feature Flags
//!
//! | Feature     | Enables                                 | Default |
//! |-------------|-----------------------------------------|---------|
//! | `dynamixel` | [`dynamixel`] module (Protocol 2.0)     | yes     |

pub use dxlbus_core::*;

/// Serial transport.
pub mod transport {
    pub use dxlbus_transport::*;
}

/// Dynamixel Protocol 2.0 engine.
///
/// Provides [`MotorController`](dynamixel::MotorController) and
/// [`BusBuilder`](dynamixel::BusBuilder), plus the lower layers they are
/// built from for callers that want direct bus access.
#[cfg(feature = "dynamixel")]
pub mod dynamixel {
    pub use dxlbus_dynamixel::*;
}

/// Model tags that have a register schema, across enabled backends.
///
/// ```
/// for model in dxlbus::supported_models() {
///     println!("{model}");
/// }
/// ```
pub fn supported_models() -> Vec<&'static str> {
    let mut models = Vec::new();

    #[cfg(feature = "dynamixel")]
    {
        models.extend(dynamixel::supported_models().iter().copied());
    }

    models
}
