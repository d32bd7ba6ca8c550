//! Protocol 2.0 packet encoder/decoder.
//!
//! Every exchange on the bus is an instruction packet from the controller
//! followed by zero or more status packets from motors. This module handles
//! the pure byte-level encoding of instruction packets and decoding of
//! status packets, including CRC-16 and byte stuffing.
//!
//! # Packet format
//!
//! ```text
//! 0xFF 0xFF 0xFD 0x00 <id> <len_l> <len_h> <instruction> [<param>...] <crc_l> <crc_h>
//! ```
//!
//! - Header: `FF FF FD`, followed by a reserved `00`
//! - `id`: target motor, or `0xFE` for broadcast
//! - `len`: little-endian count of instruction + parameters + CRC bytes
//! - Status packets use instruction `0x55` and carry an error byte as their
//!   first parameter
//! - `crc`: CRC-16 (polynomial `0x8005`) over everything before it
//!
//! Any `FF FF FD` sequence inside the instruction/parameter region is
//! stuffed to `FF FF FD FD` so it cannot be mistaken for a header.

use bytes::{BufMut, BytesMut};

/// Packet header, followed on the wire by [`RESERVED`].
pub const HEADER: [u8; 3] = [0xFF, 0xFF, 0xFD];

/// Reserved byte following the header.
pub const RESERVED: u8 = 0x00;

/// Broadcast ID. Every motor executes the instruction.
pub const BROADCAST_ID: u8 = 0xFE;

pub const INST_PING: u8 = 0x01;
pub const INST_READ: u8 = 0x02;
pub const INST_WRITE: u8 = 0x03;
pub const INST_STATUS: u8 = 0x55;
pub const INST_BULK_READ: u8 = 0x92;
pub const INST_BULK_WRITE: u8 = 0x93;

/// Bit set in the status error byte when the motor has a latched hardware
/// fault. The remaining bits carry the instruction-level error number.
pub const ERR_HARDWARE_ALERT: u8 = 0x80;

/// Bytes preceding the length-counted region: header, reserved, id, len.
const PREFIX_LEN: usize = 7;

/// Largest status packet accepted from the bus. Anything claiming more is
/// a corrupted length field.
const MAX_PACKET_LEN: usize = 1024;

/// A decoded status packet from one motor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusPacket {
    /// ID of the responding motor.
    pub id: u8,
    /// Error byte. Zero means the instruction was processed.
    pub error: u8,
    /// Returned data, already unstuffed.
    pub params: Vec<u8>,
}

impl StatusPacket {
    /// Returns `true` if the motor reported no error.
    pub fn is_ok(&self) -> bool {
        self.error == 0
    }
}

/// Compute the Protocol 2.0 CRC-16 (poly `0x8005`, init `0`, not reflected).
pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |crc, &byte| {
        let mut crc = crc ^ ((byte as u16) << 8);
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x8005
            } else {
                crc << 1
            };
        }
        crc
    })
}

/// Insert a stuffing `FD` after every `FF FF FD` run.
fn stuff(region: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(region.len() + region.len() / 3);
    for &byte in region {
        out.push(byte);
        if out.ends_with(&HEADER) {
            out.push(0xFD);
        }
    }
    out
}

/// Remove the stuffing `FD` that follows every `FF FF FD` run.
fn unstuff(region: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(region.len());
    let mut i = 0;
    while i < region.len() {
        out.push(region[i]);
        if out.ends_with(&HEADER) && region.get(i + 1) == Some(&0xFD) {
            i += 1;
        }
        i += 1;
    }
    out
}

/// Encode an instruction packet ready for transmission.
///
/// # Example
///
/// ```
/// use dxlbus_dynamixel::packet::{encode_packet, INST_PING};
///
/// let bytes = encode_packet(0x01, INST_PING, &[]);
/// assert_eq!(bytes, vec![0xFF, 0xFF, 0xFD, 0x00, 0x01, 0x03, 0x00, 0x01, 0x19, 0x4E]);
/// ```
pub fn encode_packet(id: u8, instruction: u8, params: &[u8]) -> Vec<u8> {
    let mut region = Vec::with_capacity(1 + params.len());
    region.push(instruction);
    region.extend_from_slice(params);
    let region = stuff(&region);

    let length = (region.len() + 2) as u16;
    let mut buf = BytesMut::with_capacity(PREFIX_LEN + region.len() + 2);
    buf.put_slice(&HEADER);
    buf.put_u8(RESERVED);
    buf.put_u8(id);
    buf.put_u16_le(length);
    buf.put_slice(&region);
    let crc = crc16(&buf);
    buf.put_u16_le(crc);
    buf.to_vec()
}

/// Result of attempting to decode a status packet from a byte buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeResult {
    /// A complete status packet was decoded. The `usize` is the number of
    /// bytes consumed from the input buffer, including any leading noise.
    Status(StatusPacket, usize),

    /// The buffer does not yet contain a complete packet.
    Incomplete,

    /// A packet was found but is unusable (bad CRC, bad length, or not a
    /// status packet, e.g. an echo of our own instruction). The `usize` is
    /// the number of bytes to discard.
    Discard(usize),
}

/// Attempt to decode one status packet from the front of `buf`.
///
/// Bytes before the first header are treated as line noise and consumed
/// together with the packet.
pub fn decode_status(buf: &[u8]) -> DecodeResult {
    let Some(start) = find_header(buf) else {
        return DecodeResult::Incomplete;
    };
    let packet = &buf[start..];
    if packet.len() < PREFIX_LEN {
        return DecodeResult::Incomplete;
    }

    let length = u16::from_le_bytes([packet[5], packet[6]]) as usize;
    // instruction + error + crc at minimum
    if !(4..=MAX_PACKET_LEN).contains(&length) {
        return DecodeResult::Discard(start + 1);
    }
    let total = PREFIX_LEN + length;
    if packet.len() < total {
        return DecodeResult::Incomplete;
    }

    let expected_crc = u16::from_le_bytes([packet[total - 2], packet[total - 1]]);
    if crc16(&packet[..total - 2]) != expected_crc {
        tracing::debug!(id = packet[4], "discarding packet with bad CRC");
        return DecodeResult::Discard(start + total);
    }

    let region = unstuff(&packet[PREFIX_LEN..total - 2]);
    if region[0] != INST_STATUS || region.len() < 2 {
        return DecodeResult::Discard(start + total);
    }

    let status = StatusPacket {
        id: packet[4],
        error: region[1],
        params: region[2..].to_vec(),
    };
    DecodeResult::Status(status, start + total)
}

/// Find the position of the first full header (`FF FF FD 00`).
fn find_header(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w[..3] == HEADER && w[3] == RESERVED)
}

/// Human-readable description of a status error byte.
pub fn describe_status_error(code: u8) -> String {
    let kind = match code & !ERR_HARDWARE_ALERT {
        0 => None,
        1 => Some("result fail"),
        2 => Some("instruction error"),
        3 => Some("CRC error"),
        4 => Some("data range error"),
        5 => Some("data length error"),
        6 => Some("data limit error"),
        7 => Some("access error"),
        _ => Some("unknown error"),
    };
    match (kind, code & ERR_HARDWARE_ALERT != 0) {
        (Some(kind), true) => format!("{kind} (hardware alert)"),
        (Some(kind), false) => kind.to_string(),
        (None, true) => "hardware alert".to_string(),
        (None, false) => "no error".to_string(),
    }
}
