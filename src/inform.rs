//! INFORM production.
//!
//! A node pushes variable values to the broadcast address when their
//! pending-update flags are set; nobody asks for an INFORM. Two layouts
//! exist on the wire:
//!
//! * **legacy**: usable when all reported variables share one definition
//!   level and base path: an optional zero-key base path plus one leaf key
//!   per variable:
//!
//!   ```text
//!   {0: [2, 7], 4: v}          reports (2,7,4)
//!   {0: [1], 2: v, 3: v}       reports (1,2,0) and (1,3,0)
//!   {2: v, 7: v}               reports (2,0,0) and (7,0,0)
//!   ```
//!
//! * **new**: a `{0: 299, ...}` header with the variables nested by path,
//!   used when the selection spans mixed base paths (or always, with the
//!   `force-new-style-inform` feature).
//!
//! In multi mode the legacy encoder snapshots the writer before each
//! additional variable; one that no longer fits is rolled back and stays
//! pending for the next call. Overflow on the very first variable surfaces
//! as [`Error::OutOfMemory`] so the caller can retry without multi.

use log::debug;
use minicbor::encode::Encoder;

use crate::Error;
use crate::cbor::{self, EmitKind, SliceWriter, encode_entry_value};
use crate::config::{BROADCAST_ADDRESS, FORCE_NEW_STYLE_INFORM, MAX_PAYLOAD_SIZE, REGMAP_SIZE};
use crate::packet::{MultiPart, Packet, PacketType};
use crate::regmap::{FLAG_INFORM_REQUEST, FLAG_INFORMSEC_REQUEST, FLAG_LOCAL_UPDATE, LolanCtx};

/// Report pending primary updates in an INFORM packet.
///
/// Returns `Ok(false)` when nothing is pending (the packet is untouched and
/// the counter does not advance). After `Ok(true)` more variables may still
/// be pending; call again until `Ok(false)`.
pub fn create_inform(ctx: &mut LolanCtx, pak: &mut Packet, multi: bool) -> Result<bool, Error> {
    create_inform_ex(ctx, pak, multi, false, None, false)
}

/// [`create_inform`] with the advanced knobs: secondary flag channel,
/// payload size override, and payload-only operation (header fields left
/// alone, counter not consumed).
pub fn create_inform_ex(
    ctx: &mut LolanCtx,
    pak: &mut Packet,
    multi: bool,
    secondary: bool,
    payload_size_override: Option<usize>,
    payload_only: bool,
) -> Result<bool, Error> {
    let selection = if secondary {
        FLAG_INFORMSEC_REQUEST
    } else {
        FLAG_LOCAL_UPDATE | FLAG_INFORM_REQUEST
    };
    let capacity = payload_size_override.unwrap_or(MAX_PAYLOAD_SIZE).min(MAX_PAYLOAD_SIZE);

    let scan = ctx.flag_scan(selection);
    if scan.count == 0 {
        return Ok(false);
    }

    // Which entries actually made it into the payload; only those get their
    // pending flag cleared.
    let mut encoded = [false; REGMAP_SIZE];
    let size = {
        let mut enc = Encoder::new(SliceWriter::new(&mut pak.payload[..capacity]));
        match scan.common_base() {
            Some((level, base)) if !FORCE_NEW_STYLE_INFORM => encode_legacy(
                ctx,
                &mut enc,
                selection,
                level,
                &base,
                if multi { scan.count } else { 1 },
                &mut encoded,
            )?,
            _ => encode_new_style(ctx, &mut enc, selection, multi, &mut encoded)?,
        }
        enc.writer().pos()
    };
    pak.payload_size = size;
    debug!("encoded INFORM to {size} bytes");

    for (index, entry) in ctx.entries.iter_mut().enumerate() {
        if !encoded[index] {
            continue;
        }
        let entry = entry.as_mut().unwrap();
        if secondary {
            entry.flags &= !FLAG_INFORMSEC_REQUEST;
        } else {
            entry.flags &= !FLAG_LOCAL_UPDATE;
        }
    }

    if !payload_only {
        pak.packet_counter = ctx.next_counter();
        pak.packet_type = PacketType::Inform;
        pak.multi_part = MultiPart::None;
        pak.from_id = ctx.my_address();
        pak.to_id = BROADCAST_ADDRESS;
        pak.ack_required = false;
    }
    Ok(true)
}

fn encode_new_style(
    ctx: &LolanCtx,
    enc: &mut Encoder<SliceWriter>,
    selection: u16,
    multi: bool,
    encoded: &mut [bool; REGMAP_SIZE],
) -> Result<(), Error> {
    enc.begin_map()?;
    enc.u8(0)?;
    enc.u16(299)?;
    if multi {
        cbor::encode_selected(ctx, enc, |index, entry| {
            (entry.flags & selection == selection).then(|| {
                encoded[index] = true;
                EmitKind::Value
            })
        })?;
    } else {
        let first = ctx
            .entries
            .iter()
            .position(|e| e.as_ref().is_some_and(|e| e.flags & selection == selection))
            .ok_or(Error::General)?;
        cbor::encode_selected(ctx, enc, |index, _| {
            (index == first).then(|| {
                encoded[index] = true;
                EmitKind::Value
            })
        })?;
    }
    enc.end()?;
    Ok(())
}

fn encode_legacy(
    ctx: &LolanCtx,
    enc: &mut Encoder<SliceWriter>,
    selection: u16,
    level: usize,
    base: &[u8],
    count: usize,
    encoded: &mut [bool; REGMAP_SIZE],
) -> Result<(), Error> {
    // A single variable fits a definite-length root map; a batch needs an
    // indefinite one because encoding may stop early on overflow.
    let indefinite = count != 1;
    if indefinite {
        enc.begin_map()?;
    } else {
        enc.map(if level > 1 { 2 } else { 1 })?;
    }
    if level > 1 {
        enc.u8(0)?;
        cbor::encode_path_array(enc, &base[..level - 1])?;
    }

    let mut first = true;
    let mut emitted = 0usize;
    for (index, entry) in ctx.entries.iter().enumerate() {
        let Some(entry) = entry else { continue };
        if entry.flags & selection != selection {
            continue;
        }
        let snapshot = enc.writer().pos();
        let attempt = enc
            .u8(entry.path[level - 1])
            .map_err(Error::from)
            .and_then(|enc| encode_entry_value(entry, enc));
        match attempt {
            Ok(()) => {}
            Err(e) if first => return Err(e),
            Err(_) => {
                enc.writer_mut().rewind(snapshot);
                break;
            }
        }
        // Keep one byte of headroom for the terminating break.
        if indefinite && !first && enc.writer().pos() + 1 > enc.writer().capacity() {
            enc.writer_mut().rewind(snapshot);
            break;
        }
        encoded[index] = true;
        first = false;
        emitted += 1;
        if emitted == count {
            break;
        }
    }
    if indefinite {
        enc.end()?;
    }
    Ok(())
}
