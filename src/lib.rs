//! LoLaN: a lightweight request/response protocol for exposing a small set
//! of named, typed variables on a constrained device over an unreliable
//! packet link (sub-GHz or 802.15.4-class radios, typically).
//!
//! A node owns a register map of variables addressed by short hierarchical
//! integer paths. Peers GET and SET those variables, and the node pushes
//! INFORM notifications for values it changed locally. Payloads are CBOR
//! inside a compact 7-byte binary frame with a CRC-16 trailer.
//!
//! The crate is the protocol core only: it turns inbound frames into
//! variable reads/writes and reply frames, and nothing else. The radio or
//! serial transport, retransmission, routing, and the optional
//! cryptographic envelope all live outside.
//!
//! # Usage
//!
//! ```
//! use lolan::{LolanCtx, Packet, PacketType, Slot};
//!
//! let mut temperature = 22i16;
//! let mut ctx = LolanCtx::new(0x0042);
//! ctx.register([1, 2, 0], Slot::I16(&mut temperature), false).unwrap();
//!
//! // The transport hands us a raw frame...
//! # let mut raw_buf = [0u8; lolan::config::MAX_PACKET_SIZE];
//! # let raw_len = {
//! #     let mut req = Packet::new();
//! #     lolan::create_get(None, &mut req, &[1, 2, 0]).unwrap();
//! #     req.from_id = 7;
//! #     lolan::create_packet(&req, &mut raw_buf, true).unwrap()
//! # };
//! # let raw = &raw_buf[..raw_len];
//! let mut pak = Packet::new();
//! lolan::parse_packet(raw, &mut pak).unwrap();
//! let mut reply = Packet::new();
//! match pak.packet_type {
//!     PacketType::Get => lolan::process_get(&ctx, &pak, &mut reply).unwrap(),
//!     PacketType::Set => lolan::process_set(&mut ctx, &pak, &mut reply).unwrap(),
//!     _ => {}
//! }
//! let mut out = [0u8; lolan::config::MAX_PACKET_SIZE];
//! let n = lolan::create_packet(&reply, &mut out, true).unwrap();
//! // ...and takes the reply frame back.
//! # assert_eq!(reply.to_id, 7);
//! # let _ = n;
//! ```
//!
//! The core is single-threaded and synchronous; every call runs to
//! completion on the caller's thread and nothing allocates.

pub mod config;

mod cbor;
mod get;
mod inform;
mod packet;
mod path;
mod regmap;
mod set;
mod simple;

pub use cbor::{UpdateError, UpdateOutcome, Value, read_value, update_var_from_cbor};
pub use get::{create_get, process_get};
pub use inform::{create_inform, create_inform_ex};
pub use packet::{MultiPart, Packet, PacketType, create_packet, crc16, parse_packet};
pub use path::{Path, ROOT, definition_level, is_valid};
pub use regmap::{
    FLAG_AUX, FLAG_INFORM_REQUEST, FLAG_INFORMSEC_REQUEST, FLAG_LOCAL_UPDATE,
    FLAG_REMOTE_READONLY, FLAG_REMOTE_UPDATE, FLAG_REMOTE_UPDATE_MISMATCH,
    FLAG_REMOTE_UPDATE_OUTOFRANGE, LolanCtx, Slot, TYPE_MASK, USER_FLAG_MASK, VarType,
};
pub use set::process_set;
pub use simple::{AckData, simple_create_set, simple_extract_from_inform, simple_process_ack};

/// Library errors.
///
/// Two planes share this type: frame parsing distinguishes foreign traffic
/// ([`Error::NotLolan`], drop silently) from corrupt LoLaN frames
/// ([`Error::General`], log and drop); the command layer additionally
/// reports malformed CBOR ([`Error::Cbor`]) and payload exhaustion
/// ([`Error::OutOfMemory`]), which some callers recover from by retrying
/// with less data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The buffer does not hold a LoLaN frame at all.
    NotLolan,
    /// Malformed request, invalid argument, or CRC failure.
    General,
    /// Unexpected CBOR structure or decoder failure.
    Cbor,
    /// The payload buffer ran out while encoding.
    OutOfMemory,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::NotLolan => write!(f, "not a LoLaN packet"),
            Error::General => write!(f, "protocol error"),
            Error::Cbor => write!(f, "CBOR error"),
            Error::OutOfMemory => write!(f, "payload buffer exhausted"),
        }
    }
}

impl core::error::Error for Error {}
