// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Tagged value wire codec
//!
//! Self-describing little-endian encoding. Each value starts with its
//! [`PtrKind`] tag byte:
//!
//! | Tag | Payload |
//! |-----|---------|
//! | 0 null | none |
//! | 1 bool | one byte, 0 or 1 |
//! | 2 number | f64 |
//! | 3 string | u32 length, UTF-8 bytes |
//! | 4 array | u32 count, elements |
//! | 5 object | u32 count, then (u32 key length, key, value) per entry |
//! | 6 function | u32 call target |
//!
//! Decoding materializes straight into the [`HostObjectArena`]; the guest only
//! ever sees the root handle.
//!
//! Numbers travel as f64, so materializing normalizes them: any integral
//! value below 2^53 in magnitude comes back as a JSON integer. `2.0` reads
//! back as `2` and `-0.0` as `0`; fractional and larger values stay floats.

use crate::arena::HostObjectArena;
use crate::error::{CoreError, CoreResult};
use crate::value::{FunctionRef, Handle, PtrKind, TaggedValue};
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use serde_json::{Map, Number, Value};

/// Maximum container nesting accepted by the decoder and materializer.
pub const MAX_DEPTH: usize = 256;

/// Encode host-native JSON.
pub fn encode_json(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    write_json(&mut out, value);
    out
}

fn write_json(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => out.push(PtrKind::Null.tag()),
        Value::Bool(b) => {
            out.push(PtrKind::Bool.tag());
            out.push(*b as u8);
        }
        Value::Number(n) => write_number(out, n.as_f64().unwrap_or(f64::NAN)),
        Value::String(s) => write_string(out, PtrKind::String.tag(), s),
        Value::Array(items) => {
            out.push(PtrKind::Array.tag());
            write_len(out, items.len());
            for item in items {
                write_json(out, item);
            }
        }
        Value::Object(entries) => {
            out.push(PtrKind::Object.tag());
            write_len(out, entries.len());
            for (key, item) in entries {
                write_len(out, key.len());
                out.extend_from_slice(key.as_bytes());
                write_json(out, item);
            }
        }
    }
}

/// Encode an arena value tree, functions included.
pub fn encode_handle(arena: &HostObjectArena, handle: Handle) -> CoreResult<Vec<u8>> {
    let mut out = Vec::new();
    write_handle(arena, handle, &mut out, 0)?;
    Ok(out)
}

fn write_handle(
    arena: &HostObjectArena,
    handle: Handle,
    out: &mut Vec<u8>,
    depth: usize,
) -> CoreResult<()> {
    if depth > MAX_DEPTH {
        return Err(CoreError::Decode(format!(
            "value nesting exceeds {}",
            MAX_DEPTH
        )));
    }
    match arena.resolve(handle)? {
        TaggedValue::Null => out.push(PtrKind::Null.tag()),
        TaggedValue::Bool(b) => {
            out.push(PtrKind::Bool.tag());
            out.push(*b as u8);
        }
        TaggedValue::Number(n) => write_number(out, *n),
        TaggedValue::String(s) => write_string(out, PtrKind::String.tag(), s),
        TaggedValue::Array(items) => {
            out.push(PtrKind::Array.tag());
            write_len(out, items.len());
            for item in items {
                write_handle(arena, *item, out, depth + 1)?;
            }
        }
        TaggedValue::Object(entries) => {
            out.push(PtrKind::Object.tag());
            write_len(out, entries.len());
            for (key, item) in entries {
                write_len(out, key.len());
                out.extend_from_slice(key.as_bytes());
                write_handle(arena, *item, out, depth + 1)?;
            }
        }
        TaggedValue::Function(target) => {
            out.push(PtrKind::Function.tag());
            write_len(out, target.0 as usize);
        }
    }
    Ok(())
}

fn write_number(out: &mut Vec<u8>, n: f64) {
    out.push(PtrKind::Number.tag());
    // Writing into a Vec cannot fail
    let _ = out.write_f64::<LittleEndian>(n);
}

fn write_string(out: &mut Vec<u8>, tag: u8, s: &str) {
    out.push(tag);
    write_len(out, s.len());
    out.extend_from_slice(s.as_bytes());
}

fn write_len(out: &mut Vec<u8>, len: usize) {
    let _ = out.write_u32::<LittleEndian>(len as u32);
}

/// Decode one complete value into the arena and return its root handle.
///
/// Truncated input is `OutOfBounds`; unknown tags, invalid UTF-8, excess
/// nesting and trailing bytes are `Decode` errors. Duplicate object keys
/// keep their first position and take the last value.
pub fn decode_into(arena: &mut HostObjectArena, bytes: &[u8]) -> CoreResult<Handle> {
    let mut decoder = Decoder { bytes, pos: 0 };
    let root = decoder.value(arena, 0)?;
    if decoder.pos != bytes.len() {
        return Err(CoreError::Decode(format!(
            "{} trailing bytes after value",
            bytes.len() - decoder.pos
        )));
    }
    Ok(root)
}

struct Decoder<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn take(&mut self, n: usize) -> CoreResult<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|end| *end <= self.bytes.len());
        match end {
            Some(end) => {
                let slice = &self.bytes[self.pos..end];
                self.pos = end;
                Ok(slice)
            }
            None => Err(CoreError::OutOfBounds {
                offset: self.pos as u64,
                length: n as u64,
                size: self.bytes.len() as u64,
            }),
        }
    }

    fn u8(&mut self) -> CoreResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> CoreResult<u32> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    fn string(&mut self) -> CoreResult<String> {
        let at = self.pos;
        let len = self.u32()? as usize;
        let raw = self.take(len)?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|e| CoreError::Decode(format!("invalid UTF-8 in string at {}: {}", at, e)))
    }

    fn value(&mut self, arena: &mut HostObjectArena, depth: usize) -> CoreResult<Handle> {
        if depth > MAX_DEPTH {
            return Err(CoreError::Decode(format!(
                "value nesting exceeds {}",
                MAX_DEPTH
            )));
        }

        let at = self.pos;
        let tag = self.u8()?;
        let kind = PtrKind::from_tag(tag)
            .ok_or_else(|| CoreError::Decode(format!("unknown tag {} at {}", tag, at)))?;

        let value = match kind {
            PtrKind::Null => return Ok(Handle::NULL),
            PtrKind::Bool => match self.u8()? {
                0 => TaggedValue::Bool(false),
                1 => TaggedValue::Bool(true),
                other => {
                    return Err(CoreError::Decode(format!(
                        "invalid bool byte {} at {}",
                        other,
                        at + 1
                    )))
                }
            },
            PtrKind::Number => TaggedValue::Number(LittleEndian::read_f64(self.take(8)?)),
            PtrKind::String => TaggedValue::String(self.string()?),
            PtrKind::Array => {
                let count = self.u32()? as usize;
                let mut items = Vec::with_capacity(count.min(self.remaining()));
                for _ in 0..count {
                    items.push(self.value(arena, depth + 1)?);
                }
                TaggedValue::Array(items)
            }
            PtrKind::Object => {
                let count = self.u32()? as usize;
                let mut entries: Vec<(String, Handle)> =
                    Vec::with_capacity(count.min(self.remaining()));
                for _ in 0..count {
                    let key = self.string()?;
                    let item = self.value(arena, depth + 1)?;
                    match entries.iter_mut().find(|(k, _)| *k == key) {
                        Some(slot) => slot.1 = item,
                        None => entries.push((key, item)),
                    }
                }
                TaggedValue::Object(entries)
            }
            PtrKind::Function => TaggedValue::Function(FunctionRef(self.u32()?)),
        };
        Ok(arena.insert(value))
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }
}

/// Insert host-native JSON into the arena.
pub fn insert_json(arena: &mut HostObjectArena, value: &Value) -> Handle {
    let tagged = match value {
        Value::Null => return Handle::NULL,
        Value::Bool(b) => TaggedValue::Bool(*b),
        Value::Number(n) => TaggedValue::Number(n.as_f64().unwrap_or(f64::NAN)),
        Value::String(s) => TaggedValue::String(s.clone()),
        Value::Array(items) => {
            TaggedValue::Array(items.iter().map(|item| insert_json(arena, item)).collect())
        }
        Value::Object(entries) => TaggedValue::Object(
            entries
                .iter()
                .map(|(key, item)| (key.clone(), insert_json(arena, item)))
                .collect(),
        ),
    };
    arena.insert(tagged)
}

/// Deep-copy an arena value into instance-independent JSON.
///
/// Functions follow `JSON.stringify`: dropped from objects, `null` in arrays
/// and at the root. Non-finite numbers become `null`.
pub fn materialize(arena: &HostObjectArena, handle: Handle) -> CoreResult<Value> {
    Ok(materialize_at(arena, handle, 0)?.unwrap_or(Value::Null))
}

fn materialize_at(
    arena: &HostObjectArena,
    handle: Handle,
    depth: usize,
) -> CoreResult<Option<Value>> {
    if depth > MAX_DEPTH {
        return Err(CoreError::Decode(format!(
            "value nesting exceeds {}",
            MAX_DEPTH
        )));
    }

    let value = match arena.resolve(handle)? {
        TaggedValue::Null => Value::Null,
        TaggedValue::Bool(b) => Value::Bool(*b),
        TaggedValue::Number(n) => number_to_json(*n),
        TaggedValue::String(s) => Value::String(s.clone()),
        TaggedValue::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(materialize_at(arena, *item, depth + 1)?.unwrap_or(Value::Null));
            }
            Value::Array(out)
        }
        TaggedValue::Object(entries) => {
            let mut out = Map::new();
            for (key, item) in entries {
                if let Some(v) = materialize_at(arena, *item, depth + 1)? {
                    out.insert(key.clone(), v);
                }
            }
            Value::Object(out)
        }
        TaggedValue::Function(_) => return Ok(None),
    };
    Ok(Some(value))
}

/// Integral values below 2^53 in magnitude come back as JSON integers,
/// including `-0.0`.
pub(crate) fn number_to_json(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        return Value::Number(Number::from(n as i64));
    }
    Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
}
