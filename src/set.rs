//! SET command processing.
//!
//! Two request dialects share the SET packet type, told apart by the
//! zero-key entry:
//!
//! * **old style**: the zero key holds a base path (or is absent, meaning
//!   the root); every other key is the last path level of one variable and
//!   maps to its new value:
//!
//!   ```text
//!   {0: [3, 1], 1: -72, 4: "foo"}   set (3,1,1) and (3,1,4)
//!   {2: 172}                        set (2,0,0)
//!   ```
//!
//! * **new style**: the zero key holds the integer 1 and the other entries
//!   form a nested path tree of new values, the same shape a multi-variable
//!   GET reply uses.
//!
//! The reply mirrors the dialect. Every addressed variable gets its own
//! status code (200, 404, 405, 472, 473) and the zero key summarizes the
//! whole request (204, 200, 207, 470, 471). A failed variable never aborts
//! its siblings.

use core::ops::ControlFlow;

use log::debug;
use minicbor::decode::Decoder;
use minicbor::encode::Encoder;

use crate::Error;
use crate::cbor::{self, EmitKind, SliceWriter, UpdateOutcome, ZeroKey};
use crate::config::{COPY_ROUTINGREQUEST_ON_ACK, REGMAP_DEPTH, REGMAP_SIZE, SET_SHORT_REPLY_IF_OK};
use crate::packet::{MultiPart, Packet, PacketType};
use crate::path::{self, Path};
use crate::regmap::LolanCtx;

enum Style {
    Old(Path),
    New,
}

/// Process a SET request, mutate the addressed variables and fill in the
/// reply packet.
pub fn process_set(ctx: &mut LolanCtx, pak: &Packet, reply: &mut Packet) -> Result<(), Error> {
    if pak.packet_type != PacketType::Set {
        return Err(Error::General);
    }

    let style = match cbor::zero_key_entry(pak.payload())? {
        Some(ZeroKey::Path(base)) => Style::Old(base),
        Some(ZeroKey::Value(signature)) => {
            if signature != 1 {
                debug!("SET with unknown signature {signature}");
                return Err(Error::General);
            }
            Style::New
        }
        None => Style::Old(path::ROOT),
    };

    reply.payload_size = match style {
        Style::Old(base) => process_old_style(ctx, pak, &mut reply.payload, base)?,
        Style::New => process_new_style(ctx, pak, &mut reply.payload)?,
    };

    reply.packet_counter = pak.packet_counter;
    reply.packet_type = PacketType::Ack;
    reply.multi_part = MultiPart::None;
    if COPY_ROUTINGREQUEST_ON_ACK {
        reply.routing_requested = pak.routing_requested;
    }
    reply.from_id = ctx.my_address();
    reply.to_id = pak.from_id;
    debug!("encoded SET reply to {} bytes", reply.payload_size);

    Ok(())
}

fn process_old_style(
    ctx: &mut LolanCtx,
    pak: &Packet,
    out: &mut [u8],
    base: Path,
) -> Result<usize, Error> {
    let level = path::definition_level(&base);
    if level >= REGMAP_DEPTH {
        // The leaf keys supply the last level, so the base must leave room.
        debug!("old-style SET base path is already exact");
        return Err(Error::General);
    }
    if !path::is_valid(&base) {
        return Err(Error::General);
    }

    let mut d = Decoder::new(pak.payload());
    let mut pairs = cbor::enter_root_map(&mut d)?;

    let mut enc = Encoder::new(SliceWriter::new(out));
    enc.begin_map()?;

    let mut problems = false;
    let mut successes = 0usize;
    let mut reported = 0usize;
    while !pairs.at_end(&mut d)? {
        let key = cbor::read_key(&mut d)?;
        pairs.took_pair();
        if !(1..=255).contains(&key) {
            // The zero key was already consumed as the base path; anything
            // else out of range cannot address a variable.
            d.skip()?;
            if key != 0 {
                problems = true;
            }
            continue;
        }
        let mut target = base;
        target[level] = key as u8;
        let outcome = cbor::update_var_from_cbor(ctx, &target, &mut d)?;
        match outcome {
            UpdateOutcome::Updated(_) => successes += 1,
            _ => problems = true,
        }
        reported += 1;
        enc.u8(key as u8)?;
        enc.u16(outcome.status_code())?;
    }

    if !problems && SET_SHORT_REPLY_IF_OK {
        // Start over with just the main code.
        drop(enc);
        let mut enc = Encoder::new(SliceWriter::new(out));
        cbor::encode_status_map(&mut enc, 200)?;
        Ok(enc.writer().pos())
    } else {
        let main = main_code(problems, successes, reported);
        enc.u8(0)?;
        enc.u16(main)?;
        enc.end()?;
        Ok(enc.writer().pos())
    }
}

fn process_new_style(ctx: &mut LolanCtx, pak: &Packet, out: &mut [u8]) -> Result<usize, Error> {
    let mut statuses: [Option<u16>; REGMAP_SIZE] = [None; REGMAP_SIZE];
    let mut found = 0usize;
    let mut updated = 0usize;
    let mut notfound = 0usize;

    let (stats, _) = cbor::walk_tree::<(), _>(pak.payload(), |target, d| {
        let outcome = cbor::update_var_from_cbor(ctx, target, d)?;
        match outcome {
            UpdateOutcome::Updated(index) => {
                found += 1;
                updated += 1;
                statuses[index] = Some(200);
            }
            UpdateOutcome::Refused(index, _) => {
                found += 1;
                statuses[index] = Some(outcome.status_code());
            }
            UpdateOutcome::NotFound => notfound += 1,
        }
        Ok(ControlFlow::Continue(()))
    })?;

    let problems =
        stats.invalid_keys > 0 || stats.too_deep || notfound > 0 || found > updated;

    let mut enc = Encoder::new(SliceWriter::new(out));
    enc.begin_map()?;
    if !problems && SET_SHORT_REPLY_IF_OK {
        enc.u8(0)?;
        enc.u16(200)?;
    } else {
        let main = main_code(problems, updated, found);
        enc.u8(0)?;
        enc.u16(main)?;
        cbor::encode_selected(ctx, &mut enc, |index, _| statuses[index].map(EmitKind::Code))?;
    }
    enc.end()?;
    Ok(enc.writer().pos())
}

fn main_code(problems: bool, successes: usize, reported: usize) -> u16 {
    if !problems {
        match reported {
            0 => 204,
            1 => 200,
            _ => 207,
        }
    } else if successes == 0 {
        471
    } else {
        470
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cbor::{PayloadEncoder, encode_path_array};
    use crate::regmap::{FLAG_REMOTE_UPDATE, LolanCtx, Slot, str_len};
    use minicbor::data::Type;
    use std::collections::BTreeMap;

    fn set_request<F>(from: u16, counter: u8, build: F) -> Packet
    where
        F: FnOnce(&mut PayloadEncoder),
    {
        let mut pak = Packet::new();
        pak.packet_type = PacketType::Set;
        pak.from_id = from;
        pak.packet_counter = counter;
        let mut enc = Encoder::new(SliceWriter::new(&mut pak.payload));
        build(&mut enc);
        pak.payload_size = enc.writer().pos();
        pak
    }

    /// Decode a flat reply map of integer keys and integer values.
    fn decode_flat_reply(payload: &[u8]) -> BTreeMap<i64, u64> {
        let mut d = Decoder::new(payload);
        let mut out = BTreeMap::new();
        let len = d.map().unwrap();
        let mut taken = 0;
        loop {
            match len {
                Some(n) if taken >= n => break,
                None if d.datatype().unwrap() == Type::Break => break,
                _ => {}
            }
            let key = d.i64().unwrap();
            let value = d.u64().unwrap();
            out.insert(key, value);
            taken += 1;
        }
        out
    }

    #[test]
    fn old_style_single_update() {
        let mut level = 0i16;
        let mut ctx = LolanCtx::new(0xAA);
        ctx.register([3, 1, 1], Slot::I16(&mut level), false).unwrap();

        // {0: [3, 1], 1: -72}
        let req = set_request(7, 9, |enc| {
            enc.map(2).unwrap();
            enc.u8(0).unwrap();
            encode_path_array(enc, &[3, 1]).unwrap();
            enc.u8(1).unwrap().i16(-72).unwrap();
        });
        let mut reply = Packet::new();
        process_set(&mut ctx, &req, &mut reply).unwrap();

        assert!(matches!(ctx.slot(&[3, 1, 1]), Some(Slot::I16(v)) if **v == -72));
        assert!(ctx.is_updated(&[3, 1, 1], true).unwrap());
        assert_eq!(reply.packet_type, PacketType::Ack);
        assert_eq!(reply.to_id, 7);
        assert_eq!(reply.packet_counter, 9);
        let codes = decode_flat_reply(reply.payload());
        assert_eq!(codes, BTreeMap::from([(0, 200), (1, 200)]));
    }

    #[test]
    fn old_style_root_base_without_zero_key() {
        let mut speed = 0u32;
        let mut ctx = LolanCtx::new(1);
        ctx.register([2, 0, 0], Slot::U32(&mut speed), false).unwrap();

        // {2: 172} - no zero key, base is the root.
        let req = set_request(7, 1, |enc| {
            enc.map(1).unwrap();
            enc.u8(2).unwrap().u8(172).unwrap();
        });
        let mut reply = Packet::new();
        process_set(&mut ctx, &req, &mut reply).unwrap();

        assert!(matches!(ctx.slot(&[2, 0, 0]), Some(Slot::U32(v)) if **v == 172));
        let codes = decode_flat_reply(reply.payload());
        assert_eq!(codes, BTreeMap::from([(0, 200), (2, 200)]));
    }

    #[test]
    fn old_style_readonly_leaves_value_and_reports_405() {
        let mut name = *b"LoLaN\0\0\0";
        let mut ctx = LolanCtx::new(1);
        ctx.register([1, 1, 0], Slot::Str(&mut name), true).unwrap();

        // {0: [1, 1], 1: "x"}
        let req = set_request(7, 1, |enc| {
            enc.map(2).unwrap();
            enc.u8(0).unwrap();
            encode_path_array(enc, &[1, 1]).unwrap();
            enc.u8(1).unwrap().str("x").unwrap();
        });
        let mut reply = Packet::new();
        process_set(&mut ctx, &req, &mut reply).unwrap();

        let codes = decode_flat_reply(reply.payload());
        assert_eq!(codes, BTreeMap::from([(0, 471), (1, 405)]));
        match ctx.slot(&[1, 1, 0]) {
            Some(Slot::Str(buf)) => assert_eq!(&buf[..str_len(buf)], b"LoLaN"),
            other => panic!("unexpected slot {other:?}"),
        }
    }

    #[test]
    fn old_style_mixed_results() {
        let mut a = 0i8;
        let mut b = 0i8;
        let mut ctx = LolanCtx::new(1);
        ctx.register([5, 1, 0], Slot::I8(&mut a), false).unwrap();
        ctx.register([5, 2, 0], Slot::I8(&mut b), false).unwrap();

        // {0: [5], 1: 3, 2: 1000, 9: 1} - ok, out of range, not found.
        let req = set_request(7, 1, |enc| {
            enc.map(4).unwrap();
            enc.u8(0).unwrap();
            encode_path_array(enc, &[5]).unwrap();
            enc.u8(1).unwrap().u8(3).unwrap();
            enc.u8(2).unwrap().u16(1000).unwrap();
            enc.u8(9).unwrap().u8(1).unwrap();
        });
        let mut reply = Packet::new();
        process_set(&mut ctx, &req, &mut reply).unwrap();

        let codes = decode_flat_reply(reply.payload());
        assert_eq!(codes, BTreeMap::from([(0, 470), (1, 200), (2, 473), (9, 404)]));
        assert!(matches!(ctx.slot(&[5, 1, 0]), Some(Slot::I8(v)) if **v == 3));
        assert!(matches!(ctx.slot(&[5, 2, 0]), Some(Slot::I8(v)) if **v == 0));
        assert_eq!(ctx.get_flag(&[5, 2, 0]) & FLAG_REMOTE_UPDATE, 0);
    }

    #[test]
    fn old_style_exact_base_path_is_refused() {
        let mut a = 0i8;
        let mut ctx = LolanCtx::new(1);
        ctx.register([5, 1, 1], Slot::I8(&mut a), false).unwrap();
        let req = set_request(7, 1, |enc| {
            enc.map(2).unwrap();
            enc.u8(0).unwrap();
            encode_path_array(enc, &[5, 1, 1]).unwrap();
            enc.u8(1).unwrap().u8(3).unwrap();
        });
        let mut reply = Packet::new();
        assert_eq!(process_set(&mut ctx, &req, &mut reply), Err(Error::General));
    }

    #[test]
    fn new_style_nested_update() {
        let mut a = 0u8;
        let mut text = [0u8; 8];
        let mut b = 0i32;
        let mut f = 0f32;
        let mut ctx = LolanCtx::new(1);
        ctx.register([1, 5, 0], Slot::U8(&mut a), false).unwrap();
        ctx.register([2, 1, 3], Slot::Str(&mut text), false).unwrap();
        ctx.register([2, 1, 4], Slot::I32(&mut b), false).unwrap();
        ctx.register([2, 2, 0], Slot::F32(&mut f), false).unwrap();

        // {0: 1, 1: {5: 82}, 2: {1: {3: "bar", 4: -19278}, 2: 3.14159}}
        let req = set_request(7, 1, |enc| {
            enc.begin_map().unwrap();
            enc.u8(0).unwrap().u8(1).unwrap();
            enc.u8(1).unwrap();
            enc.begin_map().unwrap();
            enc.u8(5).unwrap().u8(82).unwrap();
            enc.end().unwrap();
            enc.u8(2).unwrap();
            enc.begin_map().unwrap();
            enc.u8(1).unwrap();
            enc.begin_map().unwrap();
            enc.u8(3).unwrap().str("bar").unwrap();
            enc.u8(4).unwrap().i32(-19278).unwrap();
            enc.end().unwrap();
            enc.u8(2).unwrap().f32(3.14159).unwrap();
            enc.end().unwrap();
            enc.end().unwrap();
        });
        let mut reply = Packet::new();
        process_set(&mut ctx, &req, &mut reply).unwrap();

        assert!(matches!(ctx.slot(&[1, 5, 0]), Some(Slot::U8(v)) if **v == 82));
        match ctx.slot(&[2, 1, 3]) {
            Some(Slot::Str(buf)) => assert_eq!(&buf[..str_len(buf)], b"bar"),
            other => panic!("unexpected slot {other:?}"),
        }
        assert!(matches!(ctx.slot(&[2, 1, 4]), Some(Slot::I32(v)) if **v == -19278));
        assert!(matches!(ctx.slot(&[2, 2, 0]), Some(Slot::F32(v)) if (**v - 3.14159).abs() < 1e-6));

        // {0: 207, 1: {5: 200}, 2: {1: {3: 200, 4: 200}, 2: 200}}
        let mut d = Decoder::new(reply.payload());
        assert_eq!(d.map().unwrap(), None);
        assert_eq!(d.u8().unwrap(), 0);
        assert_eq!(d.u16().unwrap(), 207);
        assert_eq!(d.u8().unwrap(), 1);
        assert_eq!(d.map().unwrap(), None);
        assert_eq!(d.u8().unwrap(), 5);
        assert_eq!(d.u16().unwrap(), 200);
        assert_eq!(d.datatype().unwrap(), Type::Break);
        d.set_position(d.position() + 1);
        assert_eq!(d.u8().unwrap(), 2);
        assert_eq!(d.map().unwrap(), None);
        assert_eq!(d.u8().unwrap(), 1);
        assert_eq!(d.map().unwrap(), None);
        assert_eq!(d.u8().unwrap(), 3);
        assert_eq!(d.u16().unwrap(), 200);
        assert_eq!(d.u8().unwrap(), 4);
        assert_eq!(d.u16().unwrap(), 200);
        assert_eq!(d.datatype().unwrap(), Type::Break);
    }

    #[test]
    fn new_style_wrong_signature_is_refused() {
        let mut ctx = LolanCtx::new(1);
        let req = set_request(7, 1, |enc| {
            enc.map(1).unwrap();
            enc.u8(0).unwrap().u8(2).unwrap();
        });
        let mut reply = Packet::new();
        assert_eq!(process_set(&mut ctx, &req, &mut reply), Err(Error::General));
    }

    #[test]
    fn new_style_not_found_keeps_siblings_and_reports_470() {
        let mut a = 0u8;
        let mut ctx = LolanCtx::new(1);
        ctx.register([1, 1, 0], Slot::U8(&mut a), false).unwrap();

        // {0: 1, 1: {1: 9}, 3: {1: 9}} - second path unknown.
        let req = set_request(7, 1, |enc| {
            enc.begin_map().unwrap();
            enc.u8(0).unwrap().u8(1).unwrap();
            enc.u8(1).unwrap();
            enc.begin_map().unwrap();
            enc.u8(1).unwrap().u8(9).unwrap();
            enc.end().unwrap();
            enc.u8(3).unwrap();
            enc.begin_map().unwrap();
            enc.u8(1).unwrap().u8(9).unwrap();
            enc.end().unwrap();
            enc.end().unwrap();
        });
        let mut reply = Packet::new();
        process_set(&mut ctx, &req, &mut reply).unwrap();

        assert!(matches!(ctx.slot(&[1, 1, 0]), Some(Slot::U8(v)) if **v == 9));
        let mut d = Decoder::new(reply.payload());
        assert_eq!(d.map().unwrap(), None);
        assert_eq!(d.u8().unwrap(), 0);
        assert_eq!(d.u16().unwrap(), 470);
        // Only the found variable gets a per-variable code.
        assert_eq!(d.u8().unwrap(), 1);
        assert_eq!(d.map().unwrap(), None);
        assert_eq!(d.u8().unwrap(), 1);
        assert_eq!(d.u16().unwrap(), 200);
        assert_eq!(d.datatype().unwrap(), Type::Break);
    }

    #[test]
    fn empty_set_is_204() {
        let mut ctx = LolanCtx::new(1);
        let req = set_request(7, 1, |enc| {
            enc.map(0).unwrap();
        });
        let mut reply = Packet::new();
        process_set(&mut ctx, &req, &mut reply).unwrap();
        let codes = decode_flat_reply(reply.payload());
        assert_eq!(codes, BTreeMap::from([(0, 204)]));
    }
}
