//! Instruction packet builders and status payload parsers.
//!
//! All functions are pure: they produce or consume byte vectors without
//! performing any I/O. The IO task sends the bytes and feeds the decoded
//! status packets back into the parsers here.

use bytes::{BufMut, BytesMut};
use dxlbus_core::{Error, MotorId, Result, Width};

use crate::packet::{
    BROADCAST_ID, INST_BULK_READ, INST_BULK_WRITE, INST_PING, INST_READ, INST_WRITE,
    StatusPacket, encode_packet,
};

/// Identity reported by a motor in its ping reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModelInfo {
    /// Model number from the control table (e.g. 1060 for XL430-W250).
    pub model_number: u16,
    /// Firmware version byte.
    pub firmware: u8,
}

/// One motor's slot in a bulk read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkReadEntry {
    pub id: MotorId,
    pub address: u16,
    pub width: Width,
}

/// One motor's slot in a bulk write. `data` is already little-endian.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkWriteEntry {
    pub id: MotorId,
    pub address: u16,
    pub data: Vec<u8>,
}

/// Build a ping addressed to one motor.
pub fn cmd_ping(id: MotorId) -> Vec<u8> {
    encode_packet(id.get(), INST_PING, &[])
}

/// Build a broadcast ping. Every motor on the bus answers in ID order.
pub fn cmd_broadcast_ping() -> Vec<u8> {
    encode_packet(BROADCAST_ID, INST_PING, &[])
}

/// Build a read of `length` bytes starting at `address`.
pub fn cmd_read(id: MotorId, address: u16, length: u16) -> Vec<u8> {
    let mut params = BytesMut::with_capacity(4);
    params.put_u16_le(address);
    params.put_u16_le(length);
    encode_packet(id.get(), INST_READ, &params)
}

/// Build a write of `data` starting at `address`.
pub fn cmd_write(id: MotorId, address: u16, data: &[u8]) -> Vec<u8> {
    let mut params = BytesMut::with_capacity(2 + data.len());
    params.put_u16_le(address);
    params.put_slice(data);
    encode_packet(id.get(), INST_WRITE, &params)
}

/// Build one bulk read covering every entry.
///
/// Motors answer with one status packet each, in the order listed.
pub fn cmd_bulk_read(entries: &[BulkReadEntry]) -> Vec<u8> {
    let mut params = BytesMut::with_capacity(entries.len() * 5);
    for entry in entries {
        params.put_u8(entry.id.get());
        params.put_u16_le(entry.address);
        params.put_u16_le(entry.width.bytes() as u16);
    }
    encode_packet(BROADCAST_ID, INST_BULK_READ, &params)
}

/// Build one bulk write covering every entry.
///
/// Bulk writes are broadcast; no motor sends a status packet back.
pub fn cmd_bulk_write(entries: &[BulkWriteEntry]) -> Vec<u8> {
    let capacity = entries.iter().map(|e| 5 + e.data.len()).sum();
    let mut params = BytesMut::with_capacity(capacity);
    for entry in entries {
        params.put_u8(entry.id.get());
        params.put_u16_le(entry.address);
        params.put_u16_le(entry.data.len() as u16);
        params.put_slice(&entry.data);
    }
    encode_packet(BROADCAST_ID, INST_BULK_WRITE, &params)
}

/// Parse the payload of a ping reply.
pub fn parse_ping(status: &StatusPacket) -> Result<ModelInfo> {
    match status.params.as_slice() {
        [lo, hi, firmware] => Ok(ModelInfo {
            model_number: u16::from_le_bytes([*lo, *hi]),
            firmware: *firmware,
        }),
        other => Err(Error::Protocol(format!(
            "ping reply from {} carries {} bytes, expected 3",
            status.id,
            other.len()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{DecodeResult, decode_status};

    fn id(n: u8) -> MotorId {
        MotorId::new(n).unwrap()
    }

    #[test]
    fn cmd_ping_bytes() {
        assert_eq!(
            cmd_ping(id(1)),
            vec![0xFF, 0xFF, 0xFD, 0x00, 0x01, 0x03, 0x00, 0x01, 0x19, 0x4E]
        );
    }

    #[test]
    fn cmd_broadcast_ping_bytes() {
        assert_eq!(
            cmd_broadcast_ping(),
            vec![0xFF, 0xFF, 0xFD, 0x00, 0xFE, 0x03, 0x00, 0x01, 0x31, 0x42]
        );
    }

    #[test]
    fn cmd_read_present_position() {
        let bytes = cmd_read(id(1), 132, 4);
        assert_eq!(&bytes[7..12], &[INST_READ, 0x84, 0x00, 0x04, 0x00]);
        assert_eq!(&bytes[12..], &[0x1D, 0x15]);
    }

    #[test]
    fn cmd_write_goal_position() {
        let bytes = cmd_write(id(1), 116, &[0x00, 0x02, 0x00, 0x00]);
        assert_eq!(bytes[4], 0x01);
        assert_eq!(&bytes[7..14], &[INST_WRITE, 0x74, 0x00, 0x00, 0x02, 0x00, 0x00]);
    }

    #[test]
    fn cmd_bulk_write_two_motors() {
        let entries = [
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
        ];
        assert_eq!(
            cmd_bulk_write(&entries),
            vec![
                0xFF, 0xFF, 0xFD, 0x00, 0xFE, 0x15, 0x00, 0x93, 0x01, 0x74, 0x00, 0x04, 0x00,
                0x00, 0x08, 0x00, 0x00, 0x02, 0x74, 0x00, 0x04, 0x00, 0x00, 0x08, 0x00, 0x00,
                0xF6, 0xDC
            ]
        );
    }

    #[test]
    fn cmd_bulk_read_mixed_widths() {
        let entries = [
            BulkReadEntry {
                id: id(1),
                address: 132,
                width: Width::Four,
            },
            BulkReadEntry {
                id: id(2),
                address: 124,
                width: Width::Two,
            },
        ];
        let bytes = cmd_bulk_read(&entries);
        assert_eq!(bytes[4], BROADCAST_ID);
        assert_eq!(
            &bytes[7..18],
            &[INST_BULK_READ, 0x01, 0x84, 0x00, 0x04, 0x00, 0x02, 0x7C, 0x00, 0x02, 0x00]
        );
    }

    #[test]
    fn parse_ping_reply() {
        let buf = [
            0xFF, 0xFF, 0xFD, 0x00, 0x01, 0x07, 0x00, 0x55, 0x00, 0x24, 0x04, 0x2C, 0xF1, 0x5F,
        ];
        let DecodeResult::Status(status, _) = decode_status(&buf) else {
            panic!("expected a status packet");
        };
        let info = parse_ping(&status).unwrap();
        assert_eq!(info.model_number, 1060);
        assert_eq!(info.firmware, 0x2C);
    }

    #[test]
    fn parse_ping_rejects_short_payload() {
        let status = StatusPacket {
            id: 3,
            error: 0,
            params: vec![0x24],
        };
        assert!(matches!(parse_ping(&status), Err(Error::Protocol(_))));
    }
}
