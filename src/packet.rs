//! Frame codec.
//!
//! Every LoLaN frame starts with a 7-byte header, followed by the CBOR
//! payload and an optional 16-bit CRC:
//!
//! ```text
//!   byte 0   bits 0..2  packet type
//!            bits 3..4  multipart marker
//!            bit  5     ack required
//!   byte 1   bits 0..3  constant 0x4 (802.15.4 frame version 3)
//!            bit  3     security enabled
//!            bit  7     routing requested
//!   byte 2              packet counter
//!   byte 3..4           from id (little-endian)
//!   byte 5..6           to id (little-endian)
//!   byte 7..            payload, then optional CRC-16
//! ```
//!
//! The version marker in byte 1 lets a receiver tell LoLaN frames from other
//! traffic on the same radio. The security bit advertises an external
//! cryptographic envelope which this crate does not implement; such frames
//! are refused at parse time.
//!
//! The CRC is computed over the whole raw frame and appended byte-swapped,
//! so re-running the CRC over a received frame including its trailing CRC
//! bytes yields zero.

use log::debug;

use crate::Error;
use crate::config::{MAX_PACKET_SIZE, MAX_PAYLOAD_SIZE};

const HEADER_SIZE: usize = 7;
const CRC_SIZE: usize = 2;

/// Frame type, 3 bits on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum PacketType {
    Beacon = 0,
    Data = 1,
    #[default]
    Ack = 2,
    Mac = 3,
    Inform = 4,
    Get = 5,
    Set = 6,
    Control = 7,
}

impl PacketType {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x07 {
            0 => PacketType::Beacon,
            1 => PacketType::Data,
            2 => PacketType::Ack,
            3 => PacketType::Mac,
            4 => PacketType::Inform,
            5 => PacketType::Get,
            6 => PacketType::Set,
            _ => PacketType::Control,
        }
    }

    /// Whether frames of this type are handed to the command layer.
    fn dispatchable(self) -> bool {
        matches!(
            self,
            PacketType::Ack
                | PacketType::Inform
                | PacketType::Get
                | PacketType::Set
                | PacketType::Control
        )
    }
}

/// Multipart marker, 2 bits on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum MultiPart {
    #[default]
    None = 0,
    Start = 1,
    Middle = 2,
    End = 3,
}

impl MultiPart {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => MultiPart::None,
            1 => MultiPart::Start,
            2 => MultiPart::Middle,
            _ => MultiPart::End,
        }
    }
}

/// An in-memory frame.
///
/// The payload buffer is inline and fixed-size so that a `Packet` can live
/// in static storage on a heapless target; only the first `payload_size`
/// bytes are meaningful.
#[derive(Debug, Clone)]
pub struct Packet {
    pub packet_type: PacketType,
    pub multi_part: MultiPart,
    pub security_enabled: bool,
    pub ack_required: bool,
    pub routing_requested: bool,
    pub packet_counter: u8,
    pub from_id: u16,
    pub to_id: u16,
    pub payload: [u8; MAX_PAYLOAD_SIZE],
    pub payload_size: usize,
}

impl Default for Packet {
    fn default() -> Self {
        Packet {
            packet_type: PacketType::default(),
            multi_part: MultiPart::default(),
            security_enabled: false,
            ack_required: false,
            routing_requested: false,
            packet_counter: 0,
            from_id: 0,
            to_id: 0,
            payload: [0; MAX_PAYLOAD_SIZE],
            payload_size: 0,
        }
    }
}

impl Packet {
    pub fn new() -> Self {
        Packet::default()
    }

    /// The used part of the payload buffer.
    pub fn payload(&self) -> &[u8] {
        &self.payload[..self.payload_size]
    }

    /// Reset the option fields to their defaults, keeping addresses and
    /// payload untouched.
    pub fn reset_options(&mut self) {
        self.multi_part = MultiPart::None;
        self.security_enabled = false;
        self.ack_required = false;
        self.routing_requested = false;
    }
}

/// CRC-16 over `data`, byte-swapped into wire order.
///
/// Reflected CCITT with the 0x1081 nibble constant. The swap makes the
/// result directly appendable and makes a frame with its CRC attached
/// verify to zero.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        let q = (crc ^ u16::from(byte)) & 0x0F;
        crc = (crc >> 4) ^ q.wrapping_mul(0x1081);
        let q = (crc ^ u16::from(byte >> 4)) & 0x0F;
        crc = (crc >> 4) ^ q.wrapping_mul(0x1081);
    }
    crc.swap_bytes()
}

/// Serialize `pkt` into `buf`, optionally appending the CRC.
///
/// Returns the number of bytes written. Fails with [`Error::General`] when
/// the frame would exceed [`MAX_PACKET_SIZE`] or the buffer.
pub fn create_packet(pkt: &Packet, buf: &mut [u8], with_crc: bool) -> Result<usize, Error> {
    let size = HEADER_SIZE + pkt.payload_size + if with_crc { CRC_SIZE } else { 0 };
    if size > MAX_PACKET_SIZE || size > buf.len() {
        return Err(Error::General);
    }

    buf[0] = pkt.packet_type as u8 | (pkt.multi_part as u8) << 3;
    if pkt.ack_required {
        buf[0] |= 0x20;
    }
    buf[1] = 0x74; // 802.15.4 frame version 3
    if pkt.security_enabled {
        buf[1] |= 0x08;
    }
    if pkt.routing_requested {
        buf[1] |= 0x80;
    }
    buf[2] = pkt.packet_counter;
    buf[3..5].copy_from_slice(&pkt.from_id.to_le_bytes());
    buf[5..7].copy_from_slice(&pkt.to_id.to_le_bytes());
    buf[7..7 + pkt.payload_size].copy_from_slice(pkt.payload());

    if with_crc {
        let crc = crc16(&buf[..7 + pkt.payload_size]);
        buf[7 + pkt.payload_size] = (crc >> 8) as u8;
        buf[7 + pkt.payload_size + 1] = crc as u8;
    }

    Ok(size)
}

/// Parse a raw frame into `pkt`.
///
/// Non-LoLaN traffic (short buffer or wrong version nibble) is reported as
/// [`Error::NotLolan`] so the caller can drop it silently; corrupt or
/// unsupported LoLaN frames come back as [`Error::General`].
pub fn parse_packet(raw: &[u8], pkt: &mut Packet) -> Result<(), Error> {
    if raw.len() < HEADER_SIZE + CRC_SIZE {
        return Err(Error::NotLolan);
    }
    if raw.len() > MAX_PACKET_SIZE {
        return Err(Error::General);
    }
    if (raw[1] >> 4) & 0x03 != 3 {
        return Err(Error::NotLolan);
    }

    pkt.packet_type = PacketType::from_bits(raw[0]);
    pkt.multi_part = MultiPart::from_bits(raw[0] >> 3);
    pkt.ack_required = raw[0] & 0x20 != 0;
    pkt.security_enabled = raw[1] & 0x08 != 0;
    pkt.routing_requested = raw[1] & 0x80 != 0;
    pkt.packet_counter = raw[2];
    pkt.from_id = u16::from_le_bytes([raw[3], raw[4]]);
    pkt.to_id = u16::from_le_bytes([raw[5], raw[6]]);

    if !pkt.packet_type.dispatchable() {
        debug!("dropping frame with non-dispatchable type {:?}", pkt.packet_type);
        return Err(Error::General);
    }
    if pkt.security_enabled {
        // Needs the external crypto envelope.
        debug!("dropping secured frame from {}", pkt.from_id);
        return Err(Error::General);
    }

    let crc = crc16(raw);
    if crc != 0 {
        debug!("frame CRC error ({crc:#06x})");
        return Err(Error::General);
    }

    pkt.payload_size = raw.len() - HEADER_SIZE - CRC_SIZE;
    pkt.payload[..pkt.payload_size].copy_from_slice(&raw[7..7 + pkt.payload_size]);

    Ok(())
}
