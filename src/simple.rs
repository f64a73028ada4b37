//! Client-side helpers for single-variable exchanges.
//!
//! These cover the common master pattern: build a one-variable SET, pull
//! the interesting value out of an ACK, pick one variable out of an INFORM.
//! Multi-variable replies are better handled by a full CBOR walk on the
//! host; these helpers deliberately stop at the first matching value.

use core::ops::ControlFlow;

use minicbor::data::Type;
use minicbor::decode::Decoder;
use minicbor::encode::Encoder;

use crate::Error;
use crate::cbor::{self, SliceWriter, Value, ZeroKey, read_value};
use crate::packet::{Packet, PacketType};
use crate::path::{self, Path};
use crate::regmap::LolanCtx;

/// Build an old-style SET request updating the single variable at `path`.
///
/// The target node must be configured with the same map depth and packet
/// size as this one.
pub fn simple_create_set(
    ctx: Option<&mut LolanCtx>,
    pak: &mut Packet,
    path: &Path,
    value: &Value<'_>,
) -> Result<(), Error> {
    if !path::is_valid(path) {
        return Err(Error::General);
    }
    let level = path::definition_level(path);
    if level == 0 {
        // The root cannot name a variable.
        return Err(Error::General);
    }

    let size = {
        let mut enc = Encoder::new(SliceWriter::new(&mut pak.payload));
        enc.map(if level == 1 { 1 } else { 2 })?;
        if level > 1 {
            enc.u8(0)?;
            cbor::encode_path_array(&mut enc, &path[..level - 1])?;
        }
        enc.u8(path[level - 1])?;
        cbor::encode_value(&mut enc, value)?;
        enc.writer().pos()
    };
    pak.payload_size = size;

    pak.packet_type = PacketType::Set;
    if let Some(ctx) = ctx {
        pak.from_id = ctx.my_address();
        pak.packet_counter = ctx.next_counter();
    }
    Ok(())
}

/// What [`simple_process_ack`] found in a reply.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AckData<'p> {
    /// Only the zero-key status code was present (short SET reply).
    StatusCode(u16),
    /// A value: either the bare payload of a short GET reply or the first
    /// non-zero-key entry of a verbose reply.
    Value(Value<'p>),
}

/// Extract the value or status code from the ACK for a simple request.
///
/// Three reply shapes are recognized: a bare CBOR value (short GET reply),
/// a root map holding only the zero-key code (short SET reply), and a root
/// map with further entries (verbose GET/SET replies), where the first
/// non-zero-key value wins. Complex multi-variable replies are out of
/// scope here.
pub fn simple_process_ack(pak: &Packet) -> Result<AckData<'_>, Error> {
    if pak.packet_type != PacketType::Ack {
        return Err(Error::General);
    }

    let mut d = Decoder::new(pak.payload());
    match d.datatype()? {
        Type::Map | Type::MapIndef => {}
        _ => return Ok(AckData::Value(read_value(&mut d)?)),
    }

    // A mapped reply always carries the zero-key code.
    let code = match cbor::zero_key_entry(pak.payload())? {
        Some(ZeroKey::Value(code)) => code,
        _ => return Err(Error::General),
    };
    let (_, first) = cbor::walk_tree(pak.payload(), |_, d| {
        read_value(d).map(ControlFlow::Break)
    })?;
    Ok(match first {
        Some(value) => AckData::Value(value),
        None => AckData::StatusCode(code),
    })
}

/// Extract the value reported for `path` from an INFORM packet.
///
/// Handles both layouts: in the legacy one the packet's base path must be
/// the prefix of `path` one level short of it; in the new one the nested
/// tree is searched for the exact path. `Ok(None)` means the packet simply
/// does not carry that variable.
pub fn simple_extract_from_inform<'p>(
    pak: &'p Packet,
    path: &Path,
) -> Result<Option<Value<'p>>, Error> {
    if pak.packet_type != PacketType::Inform {
        return Err(Error::General);
    }

    let seek = match cbor::zero_key_entry(pak.payload())? {
        Some(ZeroKey::Path(base)) => legacy_seek_path(&base, path),
        None => legacy_seek_path(&path::ROOT, path),
        Some(ZeroKey::Value(299)) => Some(*path),
        Some(ZeroKey::Value(_)) => return Err(Error::General),
    };
    let Some(seek) = seek else {
        return Ok(None);
    };

    let (_, found) = cbor::walk_tree(pak.payload(), |leaf, d| {
        if leaf == &seek {
            read_value(d).map(ControlFlow::Break)
        } else {
            d.skip()?;
            Ok(ControlFlow::Continue(()))
        }
    })?;
    Ok(found)
}

/// The in-payload path of `path` in a legacy INFORM with `base`: just the
/// leaf key, provided the base is `path` minus its last defined level.
fn legacy_seek_path(base: &Path, path: &Path) -> Option<Path> {
    let base_level = path::definition_level(base);
    let level = path::definition_level(path);
    if base_level + 1 != level || base[..base_level] != path[..base_level] {
        return None;
    }
    let mut seek = path::ROOT;
    seek[0] = path[base_level];
    Some(seek)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::get::process_get;
    use crate::inform::create_inform;
    use crate::regmap::{FLAG_INFORM_REQUEST, FLAG_LOCAL_UPDATE, Slot, str_len};
    use crate::set::process_set;

    fn server() -> (LolanCtx<'static>, &'static mut i16, &'static mut [u8]) {
        // Leaked storage keeps the test contexts 'static and independent.
        let temp = Box::leak(Box::new(11i16));
        let name: &'static mut [u8] = Box::leak(Box::new([0u8; 8]));
        name[..5].copy_from_slice(b"LoLaN");
        (LolanCtx::new(0xA0), temp, name)
    }

    #[test]
    fn create_set_builds_old_style_payload() {
        let mut pak = Packet::new();
        simple_create_set(None, &mut pak, &[3, 1, 4], &Value::Int(-72)).unwrap();
        assert_eq!(pak.packet_type, PacketType::Set);
        // {0: [3, 1], 4: -72}
        assert_eq!(pak.payload(), &[0xA2, 0x00, 0x82, 0x03, 0x01, 0x04, 0x38, 0x47]);
    }

    #[test]
    fn create_set_rejects_root_and_invalid_paths() {
        let mut pak = Packet::new();
        assert_eq!(
            simple_create_set(None, &mut pak, &path::ROOT, &Value::Uint(1)),
            Err(Error::General)
        );
        assert_eq!(
            simple_create_set(None, &mut pak, &[0, 1, 0], &Value::Uint(1)),
            Err(Error::General)
        );
    }

    #[test]
    fn round_trip_set_and_short_ack() {
        let (mut ctx, temp, _) = server();
        ctx.register([1, 2, 0], Slot::I16(temp), false).unwrap();

        let mut req = Packet::new();
        simple_create_set(None, &mut req, &[1, 2, 0], &Value::Int(-500)).unwrap();
        let mut reply = Packet::new();
        process_set(&mut ctx, &req, &mut reply).unwrap();

        // The reply has the zero-key main code plus the per-key code; the
        // helper surfaces the per-key value.
        match simple_process_ack(&reply).unwrap() {
            AckData::Value(Value::Uint(200)) => {}
            other => panic!("unexpected ack data {other:?}"),
        }
        assert!(matches!(ctx.slot(&[1, 2, 0]), Some(Slot::I16(v)) if **v == -500));
    }

    #[test]
    fn bare_get_reply_value() {
        let (mut ctx, temp, _) = server();
        ctx.register([1, 2, 0], Slot::I16(temp), false).unwrap();

        let mut req = Packet::new();
        crate::get::create_get(None, &mut req, &[1, 2, 0]).unwrap();
        req.from_id = 7;
        let mut reply = Packet::new();
        process_get(&ctx, &req, &mut reply).unwrap();

        assert_eq!(simple_process_ack(&reply).unwrap(), AckData::Value(Value::Uint(11)));
    }

    #[test]
    fn status_only_ack() {
        // A 404 GET reply has no value entries.
        let (ctx, _, _) = server();
        let mut req = Packet::new();
        crate::get::create_get(None, &mut req, &[9, 0, 0]).unwrap();
        let mut reply = Packet::new();
        process_get(&ctx, &req, &mut reply).unwrap();
        assert_eq!(simple_process_ack(&reply).unwrap(), AckData::StatusCode(404));
    }

    #[test]
    fn non_ack_is_refused() {
        let pak = Packet::new();
        let mut get = pak.clone();
        get.packet_type = PacketType::Get;
        assert_eq!(simple_process_ack(&get), Err(Error::General));
    }

    #[test]
    fn extract_from_legacy_inform() {
        let (mut ctx, temp, name) = server();
        ctx.register([1, 2, 0], Slot::I16(temp), false).unwrap();
        ctx.register([1, 3, 0], Slot::Str(name), false).unwrap();
        for p in [[1, 2, 0], [1, 3, 0]] {
            ctx.set_flag(&p, FLAG_LOCAL_UPDATE | FLAG_INFORM_REQUEST).unwrap();
        }

        let mut pak = Packet::new();
        assert_eq!(create_inform(&mut ctx, &mut pak, true), Ok(true));

        assert_eq!(
            simple_extract_from_inform(&pak, &[1, 2, 0]).unwrap(),
            Some(Value::Uint(11))
        );
        match simple_extract_from_inform(&pak, &[1, 3, 0]).unwrap() {
            Some(Value::Str(s)) => assert_eq!(&s[..str_len(s)], b"LoLaN"),
            other => panic!("unexpected value {other:?}"),
        }
        // A path outside the reported base finds nothing.
        assert_eq!(simple_extract_from_inform(&pak, &[2, 2, 0]).unwrap(), None);
        assert_eq!(simple_extract_from_inform(&pak, &[1, 2, 1]).unwrap(), None);
    }

    #[test]
    fn extract_from_new_style_inform() {
        let (mut ctx, temp, name) = server();
        ctx.register([1, 2, 0], Slot::I16(temp), false).unwrap();
        ctx.register([2, 3, 1], Slot::Str(name), false).unwrap();
        for p in [[1, 2, 0], [2, 3, 1]] {
            ctx.set_flag(&p, FLAG_LOCAL_UPDATE | FLAG_INFORM_REQUEST).unwrap();
        }

        let mut pak = Packet::new();
        assert_eq!(create_inform(&mut ctx, &mut pak, true), Ok(true));

        assert_eq!(
            simple_extract_from_inform(&pak, &[1, 2, 0]).unwrap(),
            Some(Value::Uint(11))
        );
        assert!(simple_extract_from_inform(&pak, &[2, 3, 1]).unwrap().is_some());
        assert_eq!(simple_extract_from_inform(&pak, &[2, 3, 2]).unwrap(), None);
    }

    #[test]
    fn inform_with_wrong_code_is_an_error() {
        let mut pak = Packet::new();
        pak.packet_type = PacketType::Inform;
        let mut enc = Encoder::new(SliceWriter::new(&mut pak.payload));
        enc.map(1).unwrap();
        enc.u8(0).unwrap().u16(200).unwrap();
        pak.payload_size = enc.writer().pos();
        assert_eq!(
            simple_extract_from_inform(&pak, &[1, 0, 0]),
            Err(Error::General)
        );
    }
}
