//! MotorController -- the command surface callers use.
//!
//! Each command resolves the requested motors through the directory,
//! builds one [`Transaction`] and executes it. Values arrive as caller
//! strings; a value that does not parse as a number degrades to `0` for
//! that motor only (which means "disable" for torque) and the rest of the
//! batch goes ahead.
//!
//! The directory sits behind a read/write lock. Discovery holds the write
//! lock for the whole broadcast exchange; every other command holds a read
//! lock while it resolves motors and runs its transaction.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use dxlbus_core::error::{Error, Result};
use dxlbus_core::types::{Area, MotorId, RegisterValue};

use crate::bus::BusChannel;
use crate::directory::{DiscoveryReport, Motor, MotorDirectory};
use crate::models::RegisterDescriptor;
use crate::transaction::{Transaction, TransactionEngine, TransferMode};

pub const TORQUE_ENABLE: &str = "TorqueEnable";
pub const GOAL_POSITION: &str = "GoalPosition";
pub const GOAL_VELOCITY: &str = "GoalVelocity";
pub const PRESENT_POSITION: &str = "PresentPosition";

/// Which transfer mode each command family uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchPolicy {
    pub torque: TransferMode,
    /// Used by both `read_position` and `write_goal_position`.
    pub position: TransferMode,
    pub velocity: TransferMode,
    /// Used by the EEPROM and RAM field commands.
    pub registers: TransferMode,
}

impl DispatchPolicy {
    /// Bulk transfers for every command.
    pub fn all_bulk() -> Self {
        DispatchPolicy {
            torque: TransferMode::Bulk,
            position: TransferMode::Bulk,
            velocity: TransferMode::Bulk,
            registers: TransferMode::Bulk,
        }
    }
}

impl Default for DispatchPolicy {
    /// Bulk for motion commands, single exchanges for everything else.
    fn default() -> Self {
        DispatchPolicy {
            torque: TransferMode::Single,
            position: TransferMode::Bulk,
            velocity: TransferMode::Bulk,
            registers: TransferMode::Single,
        }
    }
}

/// One register of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterReading {
    pub name: &'static str,
    pub descriptor: RegisterDescriptor,
    pub value: RegisterValue,
}

/// High-level command surface over a bus channel and motor directory.
pub struct MotorController {
    engine: TransactionEngine,
    directory: RwLock<MotorDirectory>,
    policy: DispatchPolicy,
}

impl MotorController {
    pub fn new(bus: BusChannel, policy: DispatchPolicy) -> Self {
        Self::with_directory(bus, MotorDirectory::new(), policy)
    }

    /// Start from a pre-populated directory, e.g. one loaded from config.
    pub fn with_directory(bus: BusChannel, directory: MotorDirectory, policy: DispatchPolicy) -> Self {
        MotorController {
            engine: TransactionEngine::new(Arc::new(bus)),
            directory: RwLock::new(directory),
            policy,
        }
    }

    pub fn bus(&self) -> &BusChannel {
        self.engine.bus()
    }

    pub fn policy(&self) -> DispatchPolicy {
        self.policy
    }

    // -----------------------------------------------------------------
    // Directory
    // -----------------------------------------------------------------

    /// Scan the bus and replace the directory with what answered.
    pub async fn discover_motors(&self) -> Result<DiscoveryReport> {
        let mut directory = self.directory.write().await;
        directory.discover(self.engine.bus()).await
    }

    pub async fn register_motor(&self, id: MotorId, model: &str) -> Result<()> {
        self.directory.write().await.register(id, model)?;
        Ok(())
    }

    /// Snapshot of every known motor, in ID order.
    pub async fn motors(&self) -> Vec<Motor> {
        self.directory.read().await.select(|_| true)
    }

    pub async fn motor_ids(&self) -> Vec<MotorId> {
        self.directory.read().await.ids()
    }

    pub async fn set_selected(&self, id: MotorId, selected: bool) -> Result<()> {
        self.directory.write().await.set_selected(id, selected)
    }

    /// Flip the selection state of one motor and return the new state.
    pub async fn toggle_selected(&self, id: MotorId) -> Result<bool> {
        let mut directory = self.directory.write().await;
        let selected = !directory.resolve(id)?.is_selected();
        directory.set_selected(id, selected)?;
        Ok(selected)
    }

    pub async fn selected_ids(&self) -> Vec<MotorId> {
        self.directory.read().await.selected()
    }

    pub async fn clear_motors(&self) {
        self.directory.write().await.clear();
    }

    // -----------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------

    /// Read torque enable state.
    pub async fn read_torque(&self, ids: &[MotorId]) -> Result<BTreeMap<MotorId, bool>> {
        let values = self
            .read_field(ids, TORQUE_ENABLE, None, self.policy.torque)
            .await?;
        Ok(values.into_iter().map(|(id, v)| (id, v.raw() != 0)).collect())
    }

    /// Enable or disable torque. Any non-zero number enables; anything that
    /// is not a number disables.
    pub async fn write_torque<S: AsRef<str>>(
        &self,
        ids: &[MotorId],
        values: &[S],
    ) -> Result<BTreeMap<MotorId, RegisterValue>> {
        let values: Vec<i64> = parse_values(ids, values)?
            .into_iter()
            .map(|v| i64::from(v != 0))
            .collect();
        self.write_field(ids, TORQUE_ENABLE, values, None, self.policy.torque)
            .await
    }

    /// Read present position, sign-extended.
    pub async fn read_position(&self, ids: &[MotorId]) -> Result<BTreeMap<MotorId, i64>> {
        let values = self
            .read_field(ids, PRESENT_POSITION, None, self.policy.position)
            .await?;
        Ok(values
            .into_iter()
            .map(|(id, v)| (id, v.to_signed()))
            .collect())
    }

    /// Write goal position. Positions outside the model's range reject the
    /// whole batch before anything is sent.
    pub async fn write_goal_position<S: AsRef<str>>(
        &self,
        ids: &[MotorId],
        values: &[S],
    ) -> Result<BTreeMap<MotorId, RegisterValue>> {
        let values = parse_values(ids, values)?;
        let directory = self.directory.read().await;
        let motors = directory.resolve_all(ids)?;
        for (motor, &value) in motors.iter().zip(&values) {
            if !motor.schema().position_limits().contains(&value) {
                return Err(Error::ValueOutOfRange {
                    register: GOAL_POSITION.to_string(),
                    value,
                });
            }
        }
        let tx = Transaction::write(
            self.policy.position,
            motors.iter().zip(values).map(|(m, v)| (*m, GOAL_POSITION, v)),
        )?;
        self.engine.execute(tx).await
    }

    /// Write goal velocity. Negative values reverse direction.
    pub async fn write_goal_velocity<S: AsRef<str>>(
        &self,
        ids: &[MotorId],
        values: &[S],
    ) -> Result<BTreeMap<MotorId, RegisterValue>> {
        let values = parse_values(ids, values)?;
        self.write_field(ids, GOAL_VELOCITY, values, None, self.policy.velocity)
            .await
    }

    /// Read one EEPROM register. RAM registers are rejected.
    pub async fn read_eeprom(
        &self,
        ids: &[MotorId],
        field: &str,
    ) -> Result<BTreeMap<MotorId, RegisterValue>> {
        self.read_field(ids, field, Some(Area::Eeprom), self.policy.registers)
            .await
    }

    /// Write one EEPROM register. RAM registers are rejected.
    ///
    /// Most motors only accept EEPROM writes while torque is disabled and
    /// answer with an access error otherwise.
    pub async fn write_eeprom<S: AsRef<str>>(
        &self,
        ids: &[MotorId],
        field: &str,
        values: &[S],
    ) -> Result<BTreeMap<MotorId, RegisterValue>> {
        let values = parse_values(ids, values)?;
        self.write_field(ids, field, values, Some(Area::Eeprom), self.policy.registers)
            .await
    }

    /// Read one RAM register. EEPROM registers are rejected.
    pub async fn read_ram(
        &self,
        ids: &[MotorId],
        field: &str,
    ) -> Result<BTreeMap<MotorId, RegisterValue>> {
        self.read_field(ids, field, Some(Area::Ram), self.policy.registers)
            .await
    }

    /// Write one RAM register. EEPROM registers are rejected.
    pub async fn write_ram<S: AsRef<str>>(
        &self,
        ids: &[MotorId],
        field: &str,
        values: &[S],
    ) -> Result<BTreeMap<MotorId, RegisterValue>> {
        let values = parse_values(ids, values)?;
        self.write_field(ids, field, values, Some(Area::Ram), self.policy.registers)
            .await
    }

    /// Read every register of one area, one exchange per motor covering
    /// the whole area.
    pub async fn snapshot(
        &self,
        ids: &[MotorId],
        area: Area,
    ) -> Result<BTreeMap<MotorId, Vec<RegisterReading>>> {
        let directory = self.directory.read().await;
        let motors = directory.resolve_all(ids)?;

        let mut snapshots = BTreeMap::new();
        for motor in motors {
            let schema = motor.schema();
            let Some((start, length)) = schema.span(area) else {
                snapshots.insert(motor.id(), Vec::new());
                continue;
            };
            debug!(id = motor.id().get(), %area, start, length, "snapshot");
            let block = self.engine.bus().read_bytes(motor.id(), start, length).await?;

            let mut readings = Vec::new();
            for (name, descriptor) in schema.registers_in(area) {
                let offset = (descriptor.address - start) as usize;
                let bytes = &block[offset..offset + descriptor.width.bytes()];
                readings.push(RegisterReading {
                    name,
                    descriptor,
                    value: RegisterValue::from_le_bytes(descriptor.width, bytes)?,
                });
            }
            snapshots.insert(motor.id(), readings);
        }
        Ok(snapshots)
    }

    // -----------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------

    async fn read_field(
        &self,
        ids: &[MotorId],
        field: &str,
        area: Option<Area>,
        mode: TransferMode,
    ) -> Result<BTreeMap<MotorId, RegisterValue>> {
        let directory = self.directory.read().await;
        let motors = directory.resolve_all(ids)?;
        if let Some(area) = area {
            check_area(&motors, field, area)?;
        }
        let tx = Transaction::read(mode, motors.iter().map(|m| (*m, field)))?;
        self.engine.execute(tx).await
    }

    async fn write_field(
        &self,
        ids: &[MotorId],
        field: &str,
        values: Vec<i64>,
        area: Option<Area>,
        mode: TransferMode,
    ) -> Result<BTreeMap<MotorId, RegisterValue>> {
        let directory = self.directory.read().await;
        let motors = directory.resolve_all(ids)?;
        if let Some(area) = area {
            check_area(&motors, field, area)?;
        }
        let tx = Transaction::write(
            mode,
            motors.iter().zip(values).map(|(m, v)| (*m, field, v)),
        )?;
        self.engine.execute(tx).await
    }
}

/// Reject registers that live outside `area` on any of the motors.
fn check_area(motors: &[&Motor], field: &str, area: Area) -> Result<()> {
    for motor in motors {
        let descriptor = motor.schema().describe(field)?;
        if descriptor.area != area {
            return Err(Error::InvalidParameter(format!(
                "{field} is a {} register on {}, not {area}",
                descriptor.area,
                motor.model()
            )));
        }
    }
    Ok(())
}

/// Parse one caller value per motor, substituting zero for anything that
/// is not an integer.
fn parse_values<S: AsRef<str>>(ids: &[MotorId], values: &[S]) -> Result<Vec<i64>> {
    if ids.len() != values.len() {
        return Err(Error::InvalidParameter(format!(
            "{} motors but {} values",
            ids.len(),
            values.len()
        )));
    }
    Ok(ids
        .iter()
        .zip(values)
        .map(|(id, raw)| {
            let raw = raw.as_ref();
            raw.trim().parse::<i64>().unwrap_or_else(|_| {
                warn!(id = id.get(), value = raw, "value is not a number, using 0");
                0
            })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusTiming;
    use crate::instructions::{
        BulkReadEntry, BulkWriteEntry, cmd_broadcast_ping, cmd_bulk_read, cmd_bulk_write,
        cmd_read, cmd_write,
    };
    use crate::packet::{INST_STATUS, encode_packet};
    use dxlbus_core::error::CommError;
    use dxlbus_core::types::{ProtocolVersion, Width};
    use dxlbus_test_harness::MockTransport;
    use std::time::Duration;

    fn id(n: u8) -> MotorId {
        MotorId::new(n).unwrap()
    }

    fn status(motor: u8, data: &[u8]) -> Vec<u8> {
        let mut params = vec![0x00];
        params.extend_from_slice(data);
        encode_packet(motor, INST_STATUS, &params)
    }

    async fn controller(mock: &MockTransport, policy: DispatchPolicy) -> MotorController {
        let bus = BusChannel::new(
            Box::new(mock.clone()),
            BusTiming {
                command_timeout: Duration::from_millis(50),
                discovery_window: Some(Duration::from_millis(100)),
            },
        );
        bus.open("/dev/mock", 1_000_000, ProtocolVersion::V2)
            .await
            .unwrap();
        let mut directory = MotorDirectory::new();
        directory.register(id(1), "X_SERIES").unwrap();
        directory.register(id(2), "X_SERIES").unwrap();
        directory.register(id(3), "XL320").unwrap();
        MotorController::with_directory(bus, directory, policy)
    }

    #[tokio::test]
    async fn write_torque_falls_back_to_disable() {
        let mock = MockTransport::new();
        mock.expect(&cmd_write(id(1), 64, &[0x01]), &status(1, &[]));
        mock.expect(&cmd_write(id(2), 64, &[0x00]), &status(2, &[]));
        mock.expect(&cmd_write(id(3), 24, &[0x01]), &status(3, &[]));
        let ctl = controller(&mock, DispatchPolicy::default()).await;

        let written = ctl
            .write_torque(&[id(1), id(2), id(3)], &["1", "on?", "5"])
            .await
            .unwrap();
        assert_eq!(written[&id(1)].raw(), 1);
        assert_eq!(written[&id(2)].raw(), 0);
        // Non-zero values are normalized to 1.
        assert_eq!(written[&id(3)].raw(), 1);
        assert_eq!(mock.remaining_expectations(), 0);
    }

    #[tokio::test]
    async fn read_torque() {
        let mock = MockTransport::new();
        mock.expect(&cmd_read(id(1), 64, 1), &status(1, &[0x01]));
        mock.expect(&cmd_read(id(3), 24, 1), &status(3, &[0x00]));
        let ctl = controller(&mock, DispatchPolicy::default()).await;

        let torque = ctl.read_torque(&[id(1), id(3)]).await.unwrap();
        assert_eq!(torque[&id(1)], true);
        assert_eq!(torque[&id(3)], false);
    }

    #[tokio::test]
    async fn write_goal_position_bulk() {
        let mock = MockTransport::new();
        mock.expect(
            &cmd_bulk_write(&[
                BulkWriteEntry {
                    id: id(1),
                    address: 116,
                    data: vec![0x00, 0x08, 0x00, 0x00],
                },
                BulkWriteEntry {
                    id: id(2),
                    address: 116,
                    data: vec![0x00, 0x00, 0x00, 0x00],
                },
            ]),
            &[],
        );
        let ctl = controller(&mock, DispatchPolicy::default()).await;

        let written = ctl
            .write_goal_position(&[id(1), id(2)], &["2048", "abc"])
            .await
            .unwrap();
        assert_eq!(written[&id(1)].raw(), 2048);
        assert_eq!(written[&id(2)].raw(), 0);
        assert_eq!(mock.sent_data().len(), 1);
    }

    #[tokio::test]
    async fn write_goal_position_out_of_range_sends_nothing() {
        let mock = MockTransport::new();
        let ctl = controller(&mock, DispatchPolicy::default()).await;

        // 2048 is fine for X_SERIES but beyond the XL320 range.
        let err = ctl
            .write_goal_position(&[id(1), id(3)], &["2048", "2048"])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ValueOutOfRange { value: 2048, .. }));
        assert!(mock.sent_data().is_empty());
    }

    #[tokio::test]
    async fn write_goal_velocity_negative() {
        let mock = MockTransport::new();
        mock.expect(
            &cmd_bulk_write(&[BulkWriteEntry {
                id: id(1),
                address: 104,
                data: (-100i32).to_le_bytes().to_vec(),
            }]),
            &[],
        );
        let ctl = controller(&mock, DispatchPolicy::default()).await;

        let written = ctl.write_goal_velocity(&[id(1)], &["-100"]).await.unwrap();
        assert_eq!(written[&id(1)].to_signed(), -100);
    }

    #[tokio::test]
    async fn read_position_bulk() {
        let mock = MockTransport::new();
        mock.expect(
            &cmd_bulk_read(&[
                BulkReadEntry {
                    id: id(1),
                    address: 132,
                    width: Width::Four,
                },
                BulkReadEntry {
                    id: id(2),
                    address: 132,
                    width: Width::Four,
                },
            ]),
            &[status(1, &[0x00, 0x08, 0x00, 0x00]), status(2, &[0xFF, 0xFF, 0xFF, 0xFF])].concat(),
        );
        let ctl = controller(&mock, DispatchPolicy::default()).await;

        let positions = ctl.read_position(&[id(1), id(2)]).await.unwrap();
        assert_eq!(positions[&id(1)], 2048);
        assert_eq!(positions[&id(2)], -1);
    }

    #[tokio::test]
    async fn read_position_with_silent_motor() {
        let mock = MockTransport::new();
        mock.expect(
            &cmd_bulk_read(&[
                BulkReadEntry {
                    id: id(1),
                    address: 132,
                    width: Width::Four,
                },
                BulkReadEntry {
                    id: id(2),
                    address: 132,
                    width: Width::Four,
                },
            ]),
            &status(2, &[0x00, 0x01, 0x00, 0x00]),
        );
        let ctl = controller(&mock, DispatchPolicy::default()).await;

        let err = ctl.read_position(&[id(1), id(2)]).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Comm(CommError::PartialResponse(m)) if m == id(1)
        ));
    }

    #[tokio::test]
    async fn eeprom_commands_reject_ram_registers() {
        let mock = MockTransport::new();
        let ctl = controller(&mock, DispatchPolicy::default()).await;

        let err = ctl.read_eeprom(&[id(1)], "GoalPosition").await.unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));
        let err = ctl
            .write_ram(&[id(1)], "MaxPositionLimit", &["4095"])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));
        assert!(mock.sent_data().is_empty());
    }

    #[tokio::test]
    async fn write_eeprom_read_only_field() {
        let mock = MockTransport::new();
        let ctl = controller(&mock, DispatchPolicy::default()).await;

        let err = ctl
            .write_eeprom(&[id(1)], "ModelNumber", &["1"])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ReadOnlyViolation(_)));
        assert!(mock.sent_data().is_empty());
    }

    #[tokio::test]
    async fn read_and_write_eeprom_field() {
        let mock = MockTransport::new();
        mock.expect(&cmd_read(id(1), 31, 1), &status(1, &[80]));
        mock.expect(&cmd_write(id(1), 31, &[75]), &status(1, &[]));
        let ctl = controller(&mock, DispatchPolicy::default()).await;

        let limits = ctl.read_eeprom(&[id(1)], "TemperatureLimit").await.unwrap();
        assert_eq!(limits[&id(1)].raw(), 80);
        ctl.write_eeprom(&[id(1)], "TemperatureLimit", &["75"])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn ram_field_uses_each_family_address() {
        let mock = MockTransport::new();
        mock.expect(&cmd_write(id(1), 65, &[1]), &status(1, &[]));
        mock.expect(&cmd_write(id(3), 25, &[0]), &status(3, &[]));
        mock.expect(&cmd_read(id(3), 25, 1), &status(3, &[0]));
        let ctl = controller(&mock, DispatchPolicy::default()).await;

        let sent = ctl
            .write_ram(&[id(1), id(3)], "Led", &["1", "off"])
            .await
            .unwrap();
        assert_eq!(sent[&id(1)].raw(), 1);
        assert_eq!(sent[&id(3)].raw(), 0);

        let leds = ctl.read_ram(&[id(3)], "Led").await.unwrap();
        assert_eq!(leds[&id(3)].raw(), 0);
        assert_eq!(mock.remaining_expectations(), 0);
    }

    #[tokio::test]
    async fn unknown_motor_is_config_not_found() {
        let mock = MockTransport::new();
        let ctl = controller(&mock, DispatchPolicy::default()).await;

        let err = ctl.read_torque(&[id(1), id(42)]).await.unwrap_err();
        assert!(matches!(err, Error::MotorConfigNotFound(m) if m == id(42)));
        assert!(mock.sent_data().is_empty());
    }

    #[tokio::test]
    async fn mismatched_value_count() {
        let mock = MockTransport::new();
        let ctl = controller(&mock, DispatchPolicy::default()).await;
        let err = ctl.write_torque(&[id(1), id(2)], &["1"]).await.unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));
    }

    #[tokio::test]
    async fn policy_switches_torque_to_bulk() {
        let mock = MockTransport::new();
        mock.expect(
            &cmd_bulk_write(&[
                BulkWriteEntry {
                    id: id(1),
                    address: 64,
                    data: vec![0x01],
                },
                BulkWriteEntry {
                    id: id(2),
                    address: 64,
                    data: vec![0x01],
                },
            ]),
            &[],
        );
        let ctl = controller(&mock, DispatchPolicy::all_bulk()).await;

        ctl.write_torque(&[id(1), id(2)], &["1", "1"]).await.unwrap();
        assert_eq!(mock.sent_data().len(), 1);
    }

    #[tokio::test]
    async fn snapshot_reads_area_in_one_exchange() {
        let mock = MockTransport::new();
        let mut block = vec![0u8; 29];
        block[0] = 1; // TorqueEnable
        block[6..8].copy_from_slice(&512u16.to_le_bytes()); // GoalPosition at 30
        mock.expect(&cmd_read(id(3), 24, 29), &status(3, &block));
        let ctl = controller(&mock, DispatchPolicy::default()).await;

        let snap = ctl.snapshot(&[id(3)], Area::Ram).await.unwrap();
        let readings = &snap[&id(3)];
        let get = |name: &str| readings.iter().find(|r| r.name == name).unwrap().value.raw();
        assert_eq!(get("TorqueEnable"), 1);
        assert_eq!(get("GoalPosition"), 512);
        assert_eq!(get("Punch"), 0);
        assert_eq!(mock.sent_data().len(), 1);
    }

    #[tokio::test]
    async fn discover_and_select() {
        let mock = MockTransport::new();
        mock.expect(
            &cmd_broadcast_ping(),
            &encode_packet(7, INST_STATUS, &[0x00, 0x24, 0x04, 0x2C]),
        );
        let ctl = controller(&mock, DispatchPolicy::default()).await;

        let report = ctl.discover_motors().await.unwrap();
        assert_eq!(report.found, vec![id(7)]);
        assert_eq!(ctl.motor_ids().await, vec![id(7)]);

        assert!(ctl.toggle_selected(id(7)).await.unwrap());
        assert_eq!(ctl.selected_ids().await, vec![id(7)]);
        assert!(!ctl.toggle_selected(id(7)).await.unwrap());
        assert!(ctl.selected_ids().await.is_empty());
    }

    #[tokio::test]
    async fn register_motor_after_clear() {
        let mock = MockTransport::new();
        let ctl = controller(&mock, DispatchPolicy::default()).await;

        ctl.clear_motors().await;
        assert!(ctl.motors().await.is_empty());
        ctl.register_motor(id(5), "MX_SERIES").await.unwrap();
        assert_eq!(ctl.motors().await[0].model(), "MX_SERIES");
    }
}
