//! CBOR plumbing shared by the GET, SET and INFORM processors.
//!
//! Payloads are encoded straight into fixed packet buffers through a
//! positional slice writer, so running out of room is an ordinary error
//! ([`Error::OutOfMemory`]) that the processors can recover from by
//! rewinding the writer. Decoding walks the payload with
//! [`minicbor::decode::Decoder`]; nested variable trees are traversed by a
//! single depth-bounded walker used by SET and the client-side extractors.

use core::ops::ControlFlow;

use minicbor::data::Type;
use minicbor::decode::Decoder;
use minicbor::encode::{Encoder, Write};

use crate::Error;
use crate::config::{REGMAP_DEPTH, REGMAP_RECURSION};
use crate::path::{self, Path};
use crate::regmap::{
    Entry, FLAG_REMOTE_READONLY, FLAG_REMOTE_UPDATE, FLAG_REMOTE_UPDATE_MISMATCH,
    FLAG_REMOTE_UPDATE_OUTOFRANGE, LolanCtx, Slot, str_len,
};

/// Writer over a borrowed slice, tracking how much has been produced.
///
/// `rewind` drops everything after an earlier position; the INFORM encoder
/// uses it to back out of a variable that no longer fits.
pub(crate) struct SliceWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

/// The slice writer ran out of buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EndOfSlice;

impl<'a> SliceWriter<'a> {
    pub(crate) fn new(buf: &'a mut [u8]) -> Self {
        SliceWriter { buf, pos: 0 }
    }

    pub(crate) fn pos(&self) -> usize {
        self.pos
    }

    pub(crate) fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn rewind(&mut self, pos: usize) {
        debug_assert!(pos <= self.pos);
        self.pos = pos;
    }
}

impl Write for SliceWriter<'_> {
    type Error = EndOfSlice;

    fn write_all(&mut self, data: &[u8]) -> Result<(), EndOfSlice> {
        if self.pos + data.len() > self.buf.len() {
            return Err(EndOfSlice);
        }
        self.buf[self.pos..self.pos + data.len()].copy_from_slice(data);
        self.pos += data.len();
        Ok(())
    }
}

// Only the slice writer can fail while encoding (the encoder itself emits
// primitive items only), so an encode error always means buffer exhaustion.
impl From<minicbor::encode::Error<EndOfSlice>> for Error {
    fn from(_: minicbor::encode::Error<EndOfSlice>) -> Self {
        Error::OutOfMemory
    }
}

impl From<minicbor::decode::Error> for Error {
    fn from(_: minicbor::decode::Error) -> Self {
        Error::Cbor
    }
}

pub(crate) type PayloadEncoder<'w> = Encoder<SliceWriter<'w>>;

/// A single decoded payload value.
///
/// Byte and text strings both come back as [`Value::Str`]; integer values
/// keep their CBOR sign class.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value<'b> {
    Int(i64),
    Uint(u64),
    F32(f32),
    F64(f64),
    Str(&'b [u8]),
}

/// Decode the next payload item as a variable value.
///
/// Anything that cannot represent a variable (containers, booleans, half
/// floats, ...) is [`Error::General`].
pub fn read_value<'b>(d: &mut Decoder<'b>) -> Result<Value<'b>, Error> {
    match d.datatype()? {
        Type::U8 | Type::U16 | Type::U32 | Type::U64 => Ok(Value::Uint(d.u64()?)),
        Type::I8 | Type::I16 | Type::I32 | Type::I64 => Ok(Value::Int(d.i64()?)),
        Type::Int => Err(Error::Cbor),
        Type::Bytes => Ok(Value::Str(d.bytes()?)),
        Type::String => Ok(Value::Str(d.str()?.as_bytes())),
        Type::F32 => Ok(Value::F32(d.f32()?)),
        Type::F64 => Ok(Value::F64(d.f64()?)),
        _ => Err(Error::General),
    }
}

/// Encode a free-standing value (used by the client-side SET builder).
pub(crate) fn encode_value(enc: &mut PayloadEncoder, value: &Value) -> Result<(), Error> {
    match value {
        Value::Int(v) => enc.i64(*v)?,
        Value::Uint(v) => enc.u64(*v)?,
        Value::F32(v) => enc.f32(*v)?,
        Value::F64(v) => enc.f64(*v)?,
        Value::Str(s) => {
            enc.str(core::str::from_utf8(s).map_err(|_| Error::General)?)?
        }
    };
    Ok(())
}

/// Encode a register map entry's current value.
///
/// Strings go out as text (JSON friendliness, like the wire format always
/// did); opaque data goes out as a byte string of its actual length.
pub(crate) fn encode_entry_value(entry: &Entry, enc: &mut PayloadEncoder) -> Result<(), Error> {
    match &entry.slot {
        Slot::I8(v) => enc.i64(i64::from(**v))?,
        Slot::I16(v) => enc.i64(i64::from(**v))?,
        Slot::I32(v) => enc.i64(i64::from(**v))?,
        Slot::I64(v) => enc.i64(**v)?,
        Slot::U8(v) => enc.u64(u64::from(**v))?,
        Slot::U16(v) => enc.u64(u64::from(**v))?,
        Slot::U32(v) => enc.u64(u64::from(**v))?,
        Slot::U64(v) => enc.u64(**v)?,
        Slot::F32(v) => enc.f32(**v)?,
        Slot::F64(v) => enc.f64(**v)?,
        Slot::Str(buf) => {
            let text = &buf[..str_len(buf)];
            enc.str(core::str::from_utf8(text).map_err(|_| Error::General)?)?
        }
        Slot::Data(buf) => enc.bytes(&buf[..entry.size_actual])?,
    };
    Ok(())
}

/// Encode `path` as an array of its defined levels.
pub(crate) fn encode_path_array(enc: &mut PayloadEncoder, levels: &[u8]) -> Result<(), Error> {
    enc.array(levels.len() as u64)?;
    for &level in levels {
        enc.u8(level)?;
    }
    Ok(())
}

/// Encode the definite one-entry map `{0: code}`.
pub(crate) fn encode_status_map(enc: &mut PayloadEncoder, code: u16) -> Result<(), Error> {
    enc.map(1)?;
    enc.u8(0)?;
    enc.u16(code)?;
    Ok(())
}

/// Consume the break byte terminating an indefinite container.
fn consume_break(d: &mut Decoder) {
    d.set_position(d.position() + 1);
}

/// Iteration state for one (definite or indefinite) map level.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MapIter {
    remaining: Option<u64>,
}

impl MapIter {
    pub(crate) fn new(remaining: Option<u64>) -> Self {
        MapIter { remaining }
    }

    /// Whether the map is exhausted; consumes the break of an indefinite
    /// map.
    pub(crate) fn at_end(&self, d: &mut Decoder) -> Result<bool, Error> {
        match self.remaining {
            Some(0) => Ok(true),
            Some(_) => Ok(false),
            None => {
                if d.datatype()? == Type::Break {
                    consume_break(d);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    /// Account for one consumed key-value pair.
    pub(crate) fn took_pair(&mut self) {
        if let Some(n) = &mut self.remaining {
            *n -= 1;
        }
    }
}

/// Decode an integer map key. Non-integer keys are a protocol error.
pub(crate) fn read_key(d: &mut Decoder) -> Result<i64, Error> {
    match d.datatype()? {
        Type::U8 | Type::U16 | Type::U32 | Type::U64 => {
            Ok(i64::try_from(d.u64()?).unwrap_or(i64::MAX))
        }
        Type::I8 | Type::I16 | Type::I32 | Type::I64 => Ok(d.i64()?),
        _ => Err(Error::General),
    }
}

/// Enter the root map of `payload`.
pub(crate) fn enter_root_map<'b>(d: &mut Decoder<'b>) -> Result<MapIter, Error> {
    match d.datatype()? {
        Type::Map | Type::MapIndef => Ok(MapIter::new(d.map()?)),
        _ => Err(Error::General),
    }
}

/// Decode a path from a CBOR array of integers in `0..=255`, at most
/// [`REGMAP_DEPTH`] long. Missing bottom levels stay zero.
pub(crate) fn path_from_cbor(d: &mut Decoder) -> Result<Path, Error> {
    let mut decoded = path::ROOT;
    match d.datatype()? {
        Type::Array | Type::ArrayIndef => {}
        _ => return Err(Error::General),
    }
    let len = d.array()?;
    let mut count = 0usize;
    loop {
        match len {
            Some(n) if count as u64 >= n => break,
            None if d.datatype()? == Type::Break => {
                consume_break(d);
                break;
            }
            _ => {}
        }
        if count >= REGMAP_DEPTH {
            return Err(Error::General);
        }
        let element = read_key(d)?;
        if !(0..=255).contains(&element) {
            return Err(Error::General);
        }
        decoded[count] = element as u8;
        count += 1;
    }
    Ok(decoded)
}

/// The content of a payload's zero-key entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum ZeroKey {
    /// A (base) path.
    Path(Path),
    /// An unsigned integer, clamped to 16 bits.
    Value(u16),
}

/// Find the zero-key entry in the payload's root map.
///
/// Returns `Ok(None)` when the root map has no zero key. The root item must
/// be a map.
pub(crate) fn zero_key_entry(payload: &[u8]) -> Result<Option<ZeroKey>, Error> {
    let mut d = Decoder::new(payload);
    let mut iter = enter_root_map(&mut d)?;
    while !iter.at_end(&mut d)? {
        let key = read_key(&mut d)?;
        iter.took_pair();
        if key != 0 {
            d.skip()?;
            continue;
        }
        return match d.datatype()? {
            Type::Array | Type::ArrayIndef => Ok(Some(ZeroKey::Path(path_from_cbor(&mut d)?))),
            Type::U8 | Type::U16 | Type::U32 | Type::U64 => {
                let value = d.u64()?;
                Ok(Some(ZeroKey::Value(value.min(u64::from(u16::MAX)) as u16)))
            }
            _ => Err(Error::General),
        };
    }
    Ok(None)
}

/// Why a single-variable update was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateError {
    NotFound,
    ReadOnly,
    Mismatch,
    OutOfRange,
}

/// Result of updating one addressed variable from the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Stored; the entry index is reported for status bookkeeping.
    Updated(usize),
    /// The variable exists but refused the value.
    Refused(usize, UpdateError),
    NotFound,
}

impl UpdateOutcome {
    /// The per-variable status code for a SET reply.
    pub fn status_code(self) -> u16 {
        match self {
            UpdateOutcome::Updated(_) => 200,
            UpdateOutcome::NotFound => 404,
            UpdateOutcome::Refused(_, UpdateError::ReadOnly) => 405,
            UpdateOutcome::Refused(_, UpdateError::Mismatch) => 472,
            UpdateOutcome::Refused(_, UpdateError::OutOfRange) => 473,
            UpdateOutcome::Refused(_, UpdateError::NotFound) => unreachable!(
                "UpdateError::NotFound is never produced as a Refused reason"
            ),
        }
    }
}

/// Update the variable at `path` from the next payload item.
///
/// The item is consumed in every case. Diagnostic flags are set on the
/// entry alongside a refusal; a successful store raises
/// [`FLAG_REMOTE_UPDATE`].
pub fn update_var_from_cbor(
    ctx: &mut LolanCtx,
    path: &Path,
    d: &mut Decoder,
) -> Result<UpdateOutcome, Error> {
    let Some(index) = ctx.find(path) else {
        d.skip()?;
        return Ok(UpdateOutcome::NotFound);
    };
    let entry = ctx.entries[index].as_mut().unwrap();
    entry.flags &=
        !(FLAG_REMOTE_UPDATE | FLAG_REMOTE_UPDATE_MISMATCH | FLAG_REMOTE_UPDATE_OUTOFRANGE);
    if entry.flags & FLAG_REMOTE_READONLY != 0 {
        d.skip()?;
        return Ok(UpdateOutcome::Refused(index, UpdateError::ReadOnly));
    }

    let stored = match d.datatype()? {
        Type::U8 | Type::U16 | Type::U32 | Type::U64 => store_unsigned(entry, d.u64()?),
        Type::I8 | Type::I16 | Type::I32 | Type::I64 => store_signed(entry, d.i64()?),
        Type::Int => return Err(Error::Cbor),
        Type::Bytes => store_bytes(entry, d.bytes()?, true),
        Type::String => store_bytes(entry, d.str()?.as_bytes(), false),
        Type::F32 => {
            let value = d.f32()?;
            match &mut entry.slot {
                Slot::F32(slot) => {
                    **slot = value;
                    Ok(())
                }
                // Single and double precision are distinct types on the wire.
                _ => Err(UpdateError::Mismatch),
            }
        }
        Type::F64 => {
            let value = d.f64()?;
            match &mut entry.slot {
                Slot::F64(slot) => {
                    **slot = value;
                    Ok(())
                }
                _ => Err(UpdateError::Mismatch),
            }
        }
        _ => return Err(Error::General),
    };

    Ok(match stored {
        Ok(()) => {
            entry.flags |= FLAG_REMOTE_UPDATE;
            UpdateOutcome::Updated(index)
        }
        Err(reason) => {
            match reason {
                UpdateError::Mismatch => entry.flags |= FLAG_REMOTE_UPDATE_MISMATCH,
                UpdateError::OutOfRange => entry.flags |= FLAG_REMOTE_UPDATE_OUTOFRANGE,
                _ => {}
            }
            UpdateOutcome::Refused(index, reason)
        }
    })
}

fn store_unsigned(entry: &mut Entry, value: u64) -> Result<(), UpdateError> {
    fn fit<T: TryFrom<u64>>(value: u64) -> Result<T, UpdateError> {
        T::try_from(value).map_err(|_| UpdateError::OutOfRange)
    }
    match &mut entry.slot {
        Slot::I8(s) => **s = fit(value)?,
        Slot::I16(s) => **s = fit(value)?,
        Slot::I32(s) => **s = fit(value)?,
        Slot::I64(s) => **s = fit(value)?,
        Slot::U8(s) => **s = fit(value)?,
        Slot::U16(s) => **s = fit(value)?,
        Slot::U32(s) => **s = fit(value)?,
        Slot::U64(s) => **s = value,
        _ => return Err(UpdateError::Mismatch),
    }
    Ok(())
}

fn store_signed(entry: &mut Entry, value: i64) -> Result<(), UpdateError> {
    fn fit<T: TryFrom<i64>>(value: i64) -> Result<T, UpdateError> {
        T::try_from(value).map_err(|_| UpdateError::OutOfRange)
    }
    match &mut entry.slot {
        Slot::I8(s) => **s = fit(value)?,
        Slot::I16(s) => **s = fit(value)?,
        Slot::I32(s) => **s = fit(value)?,
        Slot::I64(s) => **s = value,
        // A negative value can never land in unsigned storage.
        Slot::U8(_) | Slot::U16(_) | Slot::U32(_) | Slot::U64(_) => {
            return Err(UpdateError::OutOfRange);
        }
        _ => return Err(UpdateError::Mismatch),
    }
    Ok(())
}

fn store_bytes(entry: &mut Entry, data: &[u8], byte_string: bool) -> Result<(), UpdateError> {
    match &mut entry.slot {
        Slot::Str(buf) => {
            if data.len() > buf.len() {
                return Err(UpdateError::OutOfRange);
            }
            buf[..data.len()].copy_from_slice(data);
            buf[data.len()..].fill(0);
            Ok(())
        }
        Slot::Data(buf) if byte_string => {
            if data.len() > buf.len() {
                return Err(UpdateError::OutOfRange);
            }
            buf[..data.len()].copy_from_slice(data);
            entry.size_actual = data.len();
            Ok(())
        }
        _ => Err(UpdateError::Mismatch),
    }
}

/// Bookkeeping produced by [`walk_tree`].
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct WalkStats {
    /// A subtree was deeper than [`REGMAP_DEPTH`] and had to be skipped.
    pub(crate) too_deep: bool,
    /// Keys outside `1..=255` (other than the zero key, which is skipped
    /// silently).
    pub(crate) invalid_keys: usize,
}

/// Walk a payload's nested variable tree, calling `on_leaf` for every leaf
/// value with its full path. The closure must consume the value item and may
/// stop the walk early through [`ControlFlow::Break`].
pub(crate) fn walk_tree<'b, T, F>(
    payload: &'b [u8],
    mut on_leaf: F,
) -> Result<(WalkStats, Option<T>), Error>
where
    F: FnMut(&Path, &mut Decoder<'b>) -> Result<ControlFlow<T>, Error>,
{
    let mut d = Decoder::new(payload);
    let mut iters = [MapIter::new(Some(0)); REGMAP_DEPTH];
    iters[0] = enter_root_map(&mut d)?;
    let mut level = 0usize;
    let mut current = path::ROOT;
    let mut stats = WalkStats::default();

    loop {
        if iters[level].at_end(&mut d)? {
            if level == 0 {
                break;
            }
            level -= 1;
            continue;
        }
        let key = read_key(&mut d)?;
        iters[level].took_pair();
        if !(1..=255).contains(&key) {
            if key != 0 {
                stats.invalid_keys += 1;
            }
            d.skip()?;
            continue;
        }
        current[level] = key as u8;
        match d.datatype()? {
            Type::Map | Type::MapIndef => {
                if level + 1 < REGMAP_DEPTH {
                    let inner = d.map()?;
                    level += 1;
                    iters[level] = MapIter::new(inner);
                } else {
                    stats.too_deep = true;
                    d.skip()?;
                }
            }
            _ => {
                current[level + 1..].fill(0);
                if let ControlFlow::Break(found) = on_leaf(&current, &mut d)? {
                    return Ok((stats, Some(found)));
                }
            }
        }
    }
    Ok((stats, None))
}

/// Emitter for sequences of variables nested by path.
///
/// For a path-sorted sequence it opens exactly the maps shared between
/// consecutive paths, so siblings end up in a common parent map:
///
/// ```text
/// (4,1,0) (4,2,1) (4,2,2) (4,3,0)  ->  4: {1: v, 2: {1: v, 2: v}, 3: v}
/// ```
///
/// All nesting maps are indefinite-length; the caller owns the root
/// container.
pub(crate) struct NestedEncoder {
    last_path: Path,
    last_level: usize,
}

impl NestedEncoder {
    pub(crate) fn new() -> Self {
        NestedEncoder { last_path: path::ROOT, last_level: 0 }
    }

    /// Emit the next variable's keys and value. `emit` writes the value
    /// item itself.
    pub(crate) fn push<F>(
        &mut self,
        enc: &mut PayloadEncoder,
        path: &Path,
        emit: F,
    ) -> Result<(), Error>
    where
        F: FnOnce(&mut PayloadEncoder) -> Result<(), Error>,
    {
        let level = path::definition_level(path);
        if level == 0 {
            return Err(Error::General);
        }
        let first_new = if self.last_level == 0 {
            0
        } else {
            // Close maps down to the deepest level still shared with the
            // previous path. The map invariants guarantee a mismatch above
            // both definition levels.
            let mut i = 0;
            while i < self.last_level && path[i] == self.last_path[i] {
                i += 1;
            }
            debug_assert!(i < level);
            for _ in i + 1..self.last_level {
                enc.end()?;
            }
            i.min(level - 1)
        };
        enc.u8(path[first_new])?;
        for i in first_new + 1..level {
            enc.begin_map()?;
            enc.u8(path[i])?;
        }
        emit(enc)?;
        self.last_path = *path;
        self.last_level = level;
        Ok(())
    }

    /// Close every still-open map.
    pub(crate) fn finish(&mut self, enc: &mut PayloadEncoder) -> Result<(), Error> {
        for _ in 1..self.last_level.max(1) {
            enc.end()?;
        }
        self.last_level = 0;
        Ok(())
    }
}

/// Encode all variables under `base` (within the recursion limit), nested
/// by path. Returns whether anything was emitted.
pub(crate) fn encode_branch(
    ctx: &LolanCtx,
    base: &Path,
    enc: &mut PayloadEncoder,
) -> Result<bool, Error> {
    let level = path::definition_level(base);
    let mut nested = NestedEncoder::new();
    let mut any = false;
    for entry in ctx.entries.iter().flatten() {
        if entry.path[..level] != base[..level] {
            continue;
        }
        if path::definition_level(&entry.path) > level + REGMAP_RECURSION {
            continue;
        }
        nested.push(enc, &entry.path, |enc| encode_entry_value(entry, enc))?;
        any = true;
    }
    if any {
        nested.finish(enc)?;
    }
    Ok(any)
}

/// What [`encode_selected`] should emit for an entry.
pub(crate) enum EmitKind {
    /// The variable's value.
    Value,
    /// A bare status code.
    Code(u16),
}

/// Encode a selection of map entries nested by path. `select` decides per
/// entry whether and what to emit. Returns whether anything was emitted.
pub(crate) fn encode_selected<F>(
    ctx: &LolanCtx,
    enc: &mut PayloadEncoder,
    mut select: F,
) -> Result<bool, Error>
where
    F: FnMut(usize, &Entry) -> Option<EmitKind>,
{
    let mut nested = NestedEncoder::new();
    let mut any = false;
    for (index, entry) in ctx.entries.iter().enumerate() {
        let Some(entry) = entry else { continue };
        match select(index, entry) {
            None => continue,
            Some(EmitKind::Value) => {
                nested.push(enc, &entry.path, |enc| encode_entry_value(entry, enc))?;
            }
            Some(EmitKind::Code(code)) => {
                nested.push(enc, &entry.path, |enc| {
                    enc.u16(code)?;
                    Ok(())
                })?;
            }
        }
        any = true;
    }
    if any {
        nested.finish(enc)?;
    }
    Ok(any)
}
