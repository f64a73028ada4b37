//! GET command processing.
//!
//! A GET request is a CBOR map whose zero-key entry holds the requested
//! (base) path as an array of integers. Fewer elements than the map depth
//! address a whole subtree:
//!
//! ```text
//! [1]     is equivalent to  [1, 0, 0]
//! [3, 2]  is equivalent to  [3, 2, 0]
//! ```
//!
//! The reply shape depends on how many variables the path matches:
//! a bare CBOR value for one intentionally requested variable, a
//! `{0: 200, <nested value>}` map when verbose, `{0: 207, <nested values>}`
//! for a subtree, and `{0: 404 | 405 | 507}` for the error cases.

use log::debug;

use crate::Error;
use crate::cbor::{
    self, PayloadEncoder, SliceWriter, ZeroKey, encode_branch, encode_entry_value,
    encode_status_map,
};
use crate::config::{COPY_ROUTINGREQUEST_ON_ACK, FORCE_GET_VERBOSE_REPLY, REGMAP_RECURSION};
use crate::packet::{MultiPart, Packet, PacketType};
use crate::path::{self, Path};
use crate::regmap::LolanCtx;
use minicbor::encode::Encoder;

/// Process a GET request and fill in the reply packet.
///
/// The reply reuses the request's packet counter and goes back to the
/// sender as an ACK.
pub fn process_get(ctx: &LolanCtx, pak: &Packet, reply: &mut Packet) -> Result<(), Error> {
    if pak.packet_type != PacketType::Get {
        return Err(Error::General);
    }

    let requested = match cbor::zero_key_entry(pak.payload())? {
        Some(ZeroKey::Path(p)) => p,
        Some(ZeroKey::Value(_)) | None => {
            debug!("GET without a path entry");
            return Err(Error::General);
        }
    };
    if !path::is_valid(&requested) {
        debug!("GET with a formally invalid path");
        return Err(Error::General);
    }

    let occurrences = ctx.occurrences(&requested, true);
    let size = {
        let mut enc = Encoder::new(SliceWriter::new(&mut reply.payload));
        match encode_get_reply(ctx, &requested, occurrences, &mut enc) {
            Ok(()) => enc.writer().pos(),
            Err(Error::OutOfMemory) => {
                // Too much data requested; degrade to a bare error code.
                drop(enc);
                let mut enc = Encoder::new(SliceWriter::new(&mut reply.payload));
                encode_status_map(&mut enc, 507)?;
                enc.writer().pos()
            }
            Err(e) => return Err(e),
        }
    };
    reply.payload_size = size;

    reply.packet_counter = pak.packet_counter;
    reply.packet_type = PacketType::Ack;
    reply.multi_part = MultiPart::None;
    if COPY_ROUTINGREQUEST_ON_ACK {
        reply.routing_requested = pak.routing_requested;
    }
    reply.from_id = ctx.my_address();
    reply.to_id = pak.from_id;
    debug!("encoded GET reply to {} bytes", reply.payload_size);

    Ok(())
}

fn encode_get_reply(
    ctx: &LolanCtx,
    requested: &Path,
    occurrences: usize,
    enc: &mut PayloadEncoder,
) -> Result<(), Error> {
    match occurrences {
        0 => encode_status_map(enc, 404),
        1 => {
            // When the single match exists only because recursion collapsed
            // a subtree to one variable, its path differs from the request
            // and must be reported.
            let exact = ctx.find(requested).is_some();
            if FORCE_GET_VERBOSE_REPLY || !exact {
                enc.begin_map()?;
                enc.u8(0)?;
                enc.u16(200)?;
                if !encode_branch(ctx, requested, enc)? {
                    return Err(Error::General);
                }
                enc.end()?;
                Ok(())
            } else {
                let index = ctx.find(requested).unwrap();
                encode_entry_value(ctx.entries[index].as_ref().unwrap(), enc)
            }
        }
        _ => {
            if REGMAP_RECURSION == 0 {
                encode_status_map(enc, 405)
            } else {
                enc.begin_map()?;
                enc.u8(0)?;
                enc.u16(207)?;
                if !encode_branch(ctx, requested, enc)? {
                    return Err(Error::General);
                }
                enc.end()?;
                Ok(())
            }
        }
    }
}

/// Build a GET request for `path`.
///
/// With a context, the packet gets our address and the next outbound
/// counter; pass `None` to leave those fields for the caller.
pub fn create_get(
    ctx: Option<&mut LolanCtx>,
    pak: &mut Packet,
    path: &Path,
) -> Result<(), Error> {
    if !path::is_valid(path) {
        return Err(Error::General);
    }
    let level = path::definition_level(path);

    let size = {
        let mut enc = Encoder::new(SliceWriter::new(&mut pak.payload));
        enc.map(1)?;
        enc.u8(0)?;
        // Trailing zero levels are left off the wire.
        cbor::encode_path_array(&mut enc, &path[..level])?;
        enc.writer().pos()
    };
    pak.payload_size = size;

    pak.packet_type = PacketType::Get;
    pak.multi_part = MultiPart::None;
    if let Some(ctx) = ctx {
        pak.from_id = ctx.my_address();
        pak.packet_counter = ctx.next_counter();
    }
    Ok(())
}
