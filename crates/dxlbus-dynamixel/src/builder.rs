//! BusBuilder -- fluent builder for constructing [`MotorController`]
//! instances.
//!
//! Separates configuration from construction so that callers can set up
//! the serial port, timing, dispatch policy and an initial motor list
//! before the port is opened.
//!
//! # Example
//!
//! ```no_run
//! use dxlbus_dynamixel::builder::BusBuilder;
//! use std::time::Duration;
//!
//! # async fn example() -> dxlbus_core::Result<()> {
//! let controller = BusBuilder::new()
//!     .serial_port("/dev/ttyUSB0")
//!     .baud_rate(1_000_000)
//!     .command_timeout(Duration::from_millis(50))
//!     .build()
//!     .await?;
//! let report = controller.discover_motors().await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use dxlbus_core::error::{Error, Result};
use dxlbus_core::transport::Transport;
use dxlbus_core::types::{MotorId, ProtocolVersion};

use crate::bus::{BusChannel, BusTiming};
use crate::config::BusConfig;
use crate::controller::{DispatchPolicy, MotorController};
use crate::directory::MotorDirectory;

/// Factory default baud rate of X-series motors.
pub const DEFAULT_BAUD_RATE: u32 = 57_600;

/// Fluent builder for [`MotorController`].
pub struct BusBuilder {
    serial_port: Option<String>,
    baud_rate: u32,
    protocol: ProtocolVersion,
    timing: BusTiming,
    policy: DispatchPolicy,
    motors: Vec<(MotorId, String)>,
}

impl Default for BusBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BusBuilder {
    pub fn new() -> Self {
        BusBuilder {
            serial_port: None,
            baud_rate: DEFAULT_BAUD_RATE,
            protocol: ProtocolVersion::V2,
            timing: BusTiming::default(),
            policy: DispatchPolicy::default(),
            motors: Vec::new(),
        }
    }

    /// Start from a loaded configuration.
    pub fn from_config(config: &BusConfig) -> Self {
        BusBuilder {
            serial_port: Some(config.port.clone()),
            baud_rate: config.baud_rate,
            protocol: config.protocol,
            motors: config.motors.clone(),
            ..Self::new()
        }
    }

    /// Set the serial port path (e.g. `/dev/ttyUSB0` or `COM3`).
    pub fn serial_port(mut self, port: &str) -> Self {
        self.serial_port = Some(port.to_string());
        self
    }

    pub fn baud_rate(mut self, baud: u32) -> Self {
        self.baud_rate = baud;
        self
    }

    pub fn protocol(mut self, protocol: ProtocolVersion) -> Self {
        self.protocol = protocol;
        self
    }

    /// Base timeout for a single exchange (default: 100ms).
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.timing.command_timeout = timeout;
        self
    }

    /// Fixed discovery window instead of one derived from the baud rate.
    pub fn discovery_window(mut self, window: Duration) -> Self {
        self.timing.discovery_window = Some(window);
        self
    }

    pub fn dispatch_policy(mut self, policy: DispatchPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Register a motor without discovery.
    pub fn motor(mut self, id: MotorId, model: &str) -> Self {
        self.motors.push((id, model.to_string()));
        self
    }

    /// Build a [`MotorController`] with a caller-provided transport and
    /// open the bus.
    ///
    /// This is the primary entry point for testing (pass a
    /// `MockTransport` from `dxlbus-test-harness`).
    pub async fn build_with_transport(self, transport: Box<dyn Transport>) -> Result<MotorController> {
        let port = self
            .serial_port
            .ok_or_else(|| Error::InvalidParameter("serial_port is required".into()))?;

        // Seed the directory first so a bad motor list never opens the port.
        let mut directory = MotorDirectory::new();
        for (id, model) in &self.motors {
            directory.register(*id, model)?;
        }

        let bus = BusChannel::new(transport, self.timing);
        bus.open(&port, self.baud_rate, self.protocol).await?;
        Ok(MotorController::with_directory(bus, directory, self.policy))
    }

    /// Build a [`MotorController`] on a serial port.
    pub async fn build(self) -> Result<MotorController> {
        let transport = dxlbus_transport::SerialTransport::new();
        self.build_with_transport(Box::new(transport)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dxlbus_core::error::CommError;
    use dxlbus_test_harness::MockTransport;

    fn id(n: u8) -> MotorId {
        MotorId::new(n).unwrap()
    }

    #[tokio::test]
    async fn builder_defaults() {
        let mock = MockTransport::new();
        let controller = BusBuilder::new()
            .serial_port("/dev/ttyUSB0")
            .build_with_transport(Box::new(mock.clone()))
            .await
            .unwrap();

        assert_eq!(mock.opened(), vec![("/dev/ttyUSB0".to_string(), DEFAULT_BAUD_RATE)]);
        assert_eq!(controller.bus().baud_rate(), Some(DEFAULT_BAUD_RATE));
        assert_eq!(controller.policy(), DispatchPolicy::default());
        assert!(controller.motor_ids().await.is_empty());
    }

    #[tokio::test]
    async fn builder_fluent_chain() {
        let mock = MockTransport::new();
        let controller = BusBuilder::new()
            .serial_port("COM4")
            .baud_rate(1_000_000)
            .command_timeout(Duration::from_millis(20))
            .discovery_window(Duration::from_millis(250))
            .dispatch_policy(DispatchPolicy::all_bulk())
            .motor(id(1), "X_SERIES")
            .motor(id(2), "XL320")
            .build_with_transport(Box::new(mock))
            .await
            .unwrap();

        let timing = controller.bus().timing();
        assert_eq!(timing.command_timeout, Duration::from_millis(20));
        assert_eq!(timing.discovery_window, Some(Duration::from_millis(250)));
        assert_eq!(controller.motor_ids().await, vec![id(1), id(2)]);
    }

    #[tokio::test]
    async fn builder_from_config() {
        let config = BusConfig {
            port: "/dev/ttyACM0".into(),
            baud_rate: 115_200,
            protocol: ProtocolVersion::V2,
            motors: vec![(id(4), "MX_SERIES".into())],
        };
        let mock = MockTransport::new();
        let controller = BusBuilder::from_config(&config)
            .build_with_transport(Box::new(mock.clone()))
            .await
            .unwrap();

        assert_eq!(mock.opened(), vec![("/dev/ttyACM0".to_string(), 115_200)]);
        assert_eq!(controller.motors().await[0].model(), "MX_SERIES");
    }

    #[tokio::test]
    async fn builder_serial_port_required() {
        let result = BusBuilder::new()
            .build_with_transport(Box::new(MockTransport::new()))
            .await;
        assert!(matches!(result, Err(Error::InvalidParameter(_))));
    }

    #[tokio::test]
    async fn builder_unsupported_motor_does_not_open() {
        let mock = MockTransport::new();
        let result = BusBuilder::new()
            .serial_port("/dev/ttyUSB0")
            .motor(id(1), "PRO_SERIES")
            .build_with_transport(Box::new(mock.clone()))
            .await;
        assert!(matches!(result, Err(Error::UnsupportedModel(_))));
        assert!(mock.opened().is_empty());
    }

    #[tokio::test]
    async fn builder_port_unavailable() {
        let mock = MockTransport::new();
        mock.fail_open(CommError::PortUnavailable("/dev/ttyUSB7".into()));
        let result = BusBuilder::new()
            .serial_port("/dev/ttyUSB7")
            .build_with_transport(Box::new(mock))
            .await;
        assert!(matches!(
            result,
            Err(Error::Comm(CommError::PortUnavailable(_)))
        ));
    }
}
