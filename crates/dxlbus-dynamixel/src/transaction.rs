//! Register transactions across one or many motors.
//!
//! A [`Transaction`] is a validated list of register accesses, built from
//! motors and register names. Building it resolves every name through the
//! motor's schema, so an unknown register, a write to a read-only register,
//! or a value that does not fit rejects the whole batch before any byte is
//! sent. [`TransactionEngine::execute`] consumes the transaction and runs
//! it either as one combined bulk frame or as one exchange per motor.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use dxlbus_core::error::{Error, Result};
use dxlbus_core::types::{MotorId, RegisterValue, Width};

use crate::bus::BusChannel;
use crate::directory::Motor;
use crate::instructions::{BulkReadEntry, BulkWriteEntry};

/// Whether a transaction reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// How a transaction is put on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// One exchange per motor, in entry order. The first failure stops the
    /// batch.
    Single,
    /// One combined frame for every motor.
    Bulk,
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferMode::Single => write!(f, "single"),
            TransferMode::Bulk => write!(f, "bulk"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    id: MotorId,
    address: u16,
    width: Width,
    value: Option<RegisterValue>,
}

/// A validated batch of register accesses. Consumed by execution.
#[derive(Debug)]
pub struct Transaction {
    direction: Direction,
    mode: TransferMode,
    slots: Vec<Slot>,
}

impl Transaction {
    /// Build a read of one register per motor.
    pub fn read<'a>(
        mode: TransferMode,
        requests: impl IntoIterator<Item = (&'a Motor, &'a str)>,
    ) -> Result<Self> {
        let mut slots = Vec::new();
        for (motor, register) in requests {
            let desc = motor.schema().describe(register)?;
            slots.push(Slot {
                id: motor.id(),
                address: desc.address,
                width: desc.width,
                value: None,
            });
        }
        Transaction::new(Direction::Read, mode, slots)
    }

    /// Build a write of one register per motor.
    ///
    /// Values are signed so that registers holding two's complement
    /// quantities (velocities, homing offsets) can be written directly.
    pub fn write<'a>(
        mode: TransferMode,
        requests: impl IntoIterator<Item = (&'a Motor, &'a str, i64)>,
    ) -> Result<Self> {
        let mut slots = Vec::new();
        for (motor, register, value) in requests {
            let desc = motor.schema().describe(register)?;
            if !desc.access.is_writable() {
                return Err(Error::ReadOnlyViolation(register.to_string()));
            }
            let encoded = RegisterValue::from_signed(desc.width, value).ok_or_else(|| {
                Error::ValueOutOfRange {
                    register: register.to_string(),
                    value,
                }
            })?;
            slots.push(Slot {
                id: motor.id(),
                address: desc.address,
                width: desc.width,
                value: Some(encoded),
            });
        }
        Transaction::new(Direction::Write, mode, slots)
    }

    fn new(direction: Direction, mode: TransferMode, slots: Vec<Slot>) -> Result<Self> {
        let mut seen = BTreeSet::new();
        for slot in &slots {
            if !seen.insert(slot.id) {
                return Err(Error::InvalidParameter(format!(
                    "motor {} appears twice in one transaction",
                    slot.id
                )));
            }
        }
        Ok(Transaction {
            direction,
            mode,
            slots,
        })
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn mode(&self) -> TransferMode {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Executes transactions against a bus channel.
#[derive(Clone)]
pub struct TransactionEngine {
    bus: Arc<BusChannel>,
}

impl TransactionEngine {
    pub fn new(bus: Arc<BusChannel>) -> Self {
        TransactionEngine { bus }
    }

    pub fn bus(&self) -> &BusChannel {
        &self.bus
    }

    /// Run a transaction.
    ///
    /// Reads return the decoded value of every motor. Writes return the
    /// values that were sent; bulk writes are fire-and-forget, so a
    /// successful return means the frame went out, not that every motor
    /// applied it.
    pub async fn execute(&self, tx: Transaction) -> Result<BTreeMap<MotorId, RegisterValue>> {
        if tx.is_empty() {
            return Ok(BTreeMap::new());
        }
        debug!(
            direction = ?tx.direction,
            mode = %tx.mode,
            motors = tx.slots.len(),
            "executing transaction"
        );
        match (tx.direction, tx.mode) {
            (Direction::Read, TransferMode::Single) => self.single_read(tx.slots).await,
            (Direction::Read, TransferMode::Bulk) => self.bulk_read(tx.slots).await,
            (Direction::Write, TransferMode::Single) => self.single_write(tx.slots).await,
            (Direction::Write, TransferMode::Bulk) => self.bulk_write(tx.slots).await,
        }
    }

    async fn single_read(&self, slots: Vec<Slot>) -> Result<BTreeMap<MotorId, RegisterValue>> {
        let mut values = BTreeMap::new();
        for slot in slots {
            let value = self
                .bus
                .read_register(slot.id, slot.address, slot.width)
                .await?;
            values.insert(slot.id, value);
        }
        Ok(values)
    }

    async fn bulk_read(&self, slots: Vec<Slot>) -> Result<BTreeMap<MotorId, RegisterValue>> {
        let entries = slots
            .iter()
            .map(|s| BulkReadEntry {
                id: s.id,
                address: s.address,
                width: s.width,
            })
            .collect();
        self.bus.bulk_read(entries).await
    }

    async fn single_write(&self, slots: Vec<Slot>) -> Result<BTreeMap<MotorId, RegisterValue>> {
        let mut written = BTreeMap::new();
        for (slot, value) in with_values(slots) {
            self.bus.write_register(slot.id, slot.address, value).await?;
            written.insert(slot.id, value);
        }
        Ok(written)
    }

    async fn bulk_write(&self, slots: Vec<Slot>) -> Result<BTreeMap<MotorId, RegisterValue>> {
        let pairs: Vec<_> = with_values(slots).collect();
        let entries = pairs
            .iter()
            .map(|(slot, value)| BulkWriteEntry {
                id: slot.id,
                address: slot.address,
                data: value.to_le_bytes(),
            })
            .collect();
        self.bus.bulk_write(entries).await?;
        Ok(pairs
            .into_iter()
            .map(|(slot, value)| (slot.id, value))
            .collect())
    }
}

/// Pair each write slot with its value. Write slots always carry one.
fn with_values(slots: Vec<Slot>) -> impl Iterator<Item = (Slot, RegisterValue)> {
    slots
        .into_iter()
        .filter_map(|slot| slot.value.map(|value| (slot, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusTiming;
    use crate::directory::MotorDirectory;
    use crate::instructions::{cmd_bulk_read, cmd_bulk_write, cmd_read, cmd_write};
    use crate::packet::{INST_STATUS, encode_packet};
    use dxlbus_core::error::CommError;
    use dxlbus_core::types::ProtocolVersion;
    use dxlbus_test_harness::MockTransport;
    use std::time::Duration;

    fn id(n: u8) -> MotorId {
        MotorId::new(n).unwrap()
    }

    fn status(motor: u8, error: u8, data: &[u8]) -> Vec<u8> {
        let mut params = vec![error];
        params.extend_from_slice(data);
        encode_packet(motor, INST_STATUS, &params)
    }

    fn directory() -> MotorDirectory {
        let mut dir = MotorDirectory::new();
        dir.register(id(1), "X_SERIES").unwrap();
        dir.register(id(2), "X_SERIES").unwrap();
        dir.register(id(3), "XL320").unwrap();
        dir
    }

    async fn engine(mock: &MockTransport) -> TransactionEngine {
        let bus = BusChannel::new(
            Box::new(mock.clone()),
            BusTiming {
                command_timeout: Duration::from_millis(50),
                discovery_window: None,
            },
        );
        bus.open("/dev/mock", 1_000_000, ProtocolVersion::V2)
            .await
            .unwrap();
        TransactionEngine::new(Arc::new(bus))
    }

    #[tokio::test]
    async fn bulk_write_goal_position_is_one_frame() {
        let dir = directory();
        let mock = MockTransport::new();
        let expected = cmd_bulk_write(&[
            BulkWriteEntry {
                id: id(1),
                address: 116,
                data: vec![0x00, 0x08, 0x00, 0x00],
            },
            BulkWriteEntry {
                id: id(2),
                address: 116,
                data: vec![0x00, 0x08, 0x00, 0x00],
            },
        ]);
        mock.expect(&expected, &[]);
        let engine = engine(&mock).await;

        let motors = dir.resolve_all(&[id(1), id(2)]).unwrap();
        let tx = Transaction::write(
            TransferMode::Bulk,
            motors.iter().map(|m| (*m, "GoalPosition", 2048)),
        )
        .unwrap();
        let written = engine.execute(tx).await.unwrap();

        assert_eq!(written.len(), 2);
        assert!(written.values().all(|v| v.raw() == 2048));
        // One frame, no read-back.
        assert_eq!(mock.sent_data(), vec![expected]);
    }

    #[tokio::test]
    async fn bulk_write_mixed_models_use_each_schema() {
        let dir = directory();
        let mock = MockTransport::new();
        let expected = cmd_bulk_write(&[
            BulkWriteEntry {
                id: id(1),
                address: 116,
                data: vec![0x00, 0x02, 0x00, 0x00],
            },
            BulkWriteEntry {
                id: id(3),
                address: 30,
                data: vec![0x00, 0x02],
            },
        ]);
        mock.expect(&expected, &[]);
        let engine = engine(&mock).await;

        let m1 = dir.resolve(id(1)).unwrap();
        let m3 = dir.resolve(id(3)).unwrap();
        let tx = Transaction::write(
            TransferMode::Bulk,
            [(m1, "GoalPosition", 512), (m3, "GoalPosition", 512)],
        )
        .unwrap();
        engine.execute(tx).await.unwrap();
        assert_eq!(mock.remaining_expectations(), 0);
    }

    #[test]
    fn read_only_register_rejects_whole_batch() {
        let dir = directory();
        let m1 = dir.resolve(id(1)).unwrap();
        let m2 = dir.resolve(id(2)).unwrap();
        let err = Transaction::write(
            TransferMode::Bulk,
            [(m1, "GoalPosition", 100), (m2, "PresentPosition", 100)],
        )
        .unwrap_err();
        assert!(matches!(err, Error::ReadOnlyViolation(r) if r == "PresentPosition"));
    }

    #[test]
    fn unknown_register_rejects_whole_batch() {
        let dir = directory();
        let m1 = dir.resolve(id(1)).unwrap();
        let m3 = dir.resolve(id(3)).unwrap();
        // XL320 has no ProfileVelocity register.
        let err = Transaction::write(
            TransferMode::Bulk,
            [(m1, "ProfileVelocity", 10), (m3, "ProfileVelocity", 10)],
        )
        .unwrap_err();
        assert!(matches!(err, Error::UnknownRegister { .. }));

        let err = Transaction::read(TransferMode::Single, [(m1, "Nope")]).unwrap_err();
        assert!(matches!(err, Error::UnknownRegister { .. }));
    }

    #[test]
    fn value_out_of_range() {
        let dir = directory();
        let m1 = dir.resolve(id(1)).unwrap();
        let err =
            Transaction::write(TransferMode::Single, [(m1, "TorqueEnable", 300)]).unwrap_err();
        assert!(matches!(err, Error::ValueOutOfRange { value: 300, .. }));
    }

    #[test]
    fn duplicate_motor_is_rejected() {
        let dir = directory();
        let m1 = dir.resolve(id(1)).unwrap();
        let err = Transaction::read(TransferMode::Bulk, [(m1, "PresentPosition"), (m1, "Moving")])
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));
    }

    #[test]
    fn read_of_read_only_register_is_fine() {
        let dir = directory();
        let m1 = dir.resolve(id(1)).unwrap();
        let tx = Transaction::read(TransferMode::Bulk, [(m1, "PresentPosition")]).unwrap();
        assert_eq!(tx.direction(), Direction::Read);
        assert_eq!(tx.len(), 1);
    }

    #[tokio::test]
    async fn bulk_read_present_position() {
        let dir = directory();
        let mock = MockTransport::new();
        let request = cmd_bulk_read(&[
            BulkReadEntry {
                id: id(1),
                address: 132,
                width: Width::Four,
            },
            BulkReadEntry {
                id: id(3),
                address: 37,
                width: Width::Two,
            },
        ]);
        let mut replies = status(1, 0, &[0x00, 0x08, 0x00, 0x00]);
        replies.extend(status(3, 0, &[0xFF, 0x01]));
        mock.expect(&request, &replies);
        let engine = engine(&mock).await;

        let motors = dir.resolve_all(&[id(1), id(3)]).unwrap();
        let tx = Transaction::read(
            TransferMode::Bulk,
            motors.iter().map(|m| (*m, "PresentPosition")),
        )
        .unwrap();
        let values = engine.execute(tx).await.unwrap();
        assert_eq!(values[&id(1)].raw(), 2048);
        assert_eq!(values[&id(3)].raw(), 511);
    }

    #[tokio::test]
    async fn bulk_read_silent_motor_is_partial_response() {
        let dir = directory();
        let mock = MockTransport::new();
        let request = cmd_bulk_read(&[
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
        ]);
        mock.expect(&request, &status(1, 0, &[0x00, 0x08, 0x00, 0x00]));
        let engine = engine(&mock).await;

        let motors = dir.resolve_all(&[id(1), id(2)]).unwrap();
        let tx = Transaction::read(
            TransferMode::Bulk,
            motors.iter().map(|m| (*m, "PresentPosition")),
        )
        .unwrap();
        let err = engine.execute(tx).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Comm(CommError::PartialResponse(m)) if m == id(2)
        ));
    }

    #[tokio::test]
    async fn single_write_short_circuits_on_first_error() {
        let dir = directory();
        let mock = MockTransport::new();
        mock.expect(&cmd_write(id(1), 64, &[0x01]), &status(1, 0, &[]));
        mock.expect(&cmd_write(id(2), 64, &[0x01]), &[]);
        let engine = engine(&mock).await;

        let motors = dir.resolve_all(&[id(1), id(2), id(3)]).unwrap();
        let tx = Transaction::write(
            TransferMode::Single,
            motors.iter().map(|m| (*m, "TorqueEnable", 1)),
        )
        .unwrap();
        let err = engine.execute(tx).await.unwrap_err();
        assert!(matches!(err, Error::Comm(CommError::NoResponse)));
        // Motor 3 was never addressed.
        assert_eq!(mock.sent_data().len(), 2);
    }

    #[tokio::test]
    async fn single_read_in_entry_order() {
        let dir = directory();
        let mock = MockTransport::new();
        mock.expect(&cmd_read(id(2), 64, 1), &status(2, 0, &[0x01]));
        mock.expect(&cmd_read(id(1), 64, 1), &status(1, 0, &[0x00]));
        let engine = engine(&mock).await;

        let motors = dir.resolve_all(&[id(2), id(1)]).unwrap();
        let tx = Transaction::read(
            TransferMode::Single,
            motors.iter().map(|m| (*m, "TorqueEnable")),
        )
        .unwrap();
        let values = engine.execute(tx).await.unwrap();
        assert_eq!(values[&id(2)].raw(), 1);
        assert_eq!(values[&id(1)].raw(), 0);
    }

    #[tokio::test]
    async fn signed_velocity_is_twos_complement() {
        let dir = directory();
        let mock = MockTransport::new();
        mock.expect(
            &cmd_write(id(1), 104, &(-50i32).to_le_bytes()),
            &status(1, 0, &[]),
        );
        let engine = engine(&mock).await;

        let m1 = dir.resolve(id(1)).unwrap();
        let tx = Transaction::write(TransferMode::Single, [(m1, "GoalVelocity", -50)]).unwrap();
        let written = engine.execute(tx).await.unwrap();
        assert_eq!(written[&id(1)].to_signed(), -50);
    }

    #[tokio::test]
    async fn empty_transaction_sends_nothing() {
        let mock = MockTransport::new();
        let engine = engine(&mock).await;
        let tx = Transaction::write(TransferMode::Bulk, std::iter::empty()).unwrap();
        assert!(engine.execute(tx).await.unwrap().is_empty());
        assert!(mock.sent_data().is_empty());
    }
}
