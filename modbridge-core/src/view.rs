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

//! Lazy traversal over arena values.
//!
//! The free functions are the semantics behind the traversal imports; both
//! guest backends and [`ValueView`] go through them.
//!
//! `get` and `at` follow optional chaining: a missing key, an out-of-range
//! index, or a receiver of the wrong kind yields the null handle. Accessors
//! that must produce a concrete scalar (`to_number`, `to_str`, `to_bool`)
//! fail with `TypeMismatch` instead of coercing.

use crate::arena::HostObjectArena;
use crate::codec;
use crate::error::{CoreError, CoreResult};
use crate::value::{Handle, PtrKind, TaggedValue};

pub fn kind_of(arena: &HostObjectArena, handle: Handle) -> CoreResult<PtrKind> {
    Ok(arena.resolve(handle)?.kind())
}

/// Member lookup; null handle for missing keys and non-objects.
pub fn get(arena: &HostObjectArena, handle: Handle, key: &str) -> CoreResult<Handle> {
    Ok(arena.resolve(handle)?.member(key).unwrap_or(Handle::NULL))
}

/// Element lookup; null handle for negative or out-of-range indices and
/// non-arrays.
pub fn at(arena: &HostObjectArena, handle: Handle, index: i64) -> CoreResult<Handle> {
    let value = arena.resolve(handle)?;
    let found = match (value, usize::try_from(index)) {
        (TaggedValue::Array(items), Ok(index)) => items.get(index).copied(),
        _ => None,
    };
    Ok(found.unwrap_or(Handle::NULL))
}

/// Element count of an array or object, byte length of a string.
pub fn length_of(arena: &HostObjectArena, handle: Handle) -> CoreResult<u32> {
    let len = match arena.resolve(handle)? {
        TaggedValue::Array(items) => items.len(),
        TaggedValue::Object(entries) => entries.len(),
        TaggedValue::String(s) => s.len(),
        other => return Err(CoreError::type_mismatch("array, object or string", other.kind())),
    };
    Ok(len as u32)
}

/// Insert an array of the object's keys, in insertion order.
pub fn keys_of(arena: &mut HostObjectArena, handle: Handle) -> CoreResult<Handle> {
    let keys: Vec<String> = match arena.resolve(handle)? {
        TaggedValue::Object(entries) => entries.iter().map(|(k, _)| k.clone()).collect(),
        other => return Err(CoreError::type_mismatch("object", other.kind())),
    };
    let items = keys
        .into_iter()
        .map(|key| arena.insert(TaggedValue::String(key)))
        .collect();
    Ok(arena.insert(TaggedValue::Array(items)))
}

pub fn to_str(arena: &HostObjectArena, handle: Handle) -> CoreResult<&str> {
    match arena.resolve(handle)? {
        TaggedValue::String(s) => Ok(s),
        other => Err(CoreError::type_mismatch("string", other.kind())),
    }
}

pub fn to_number(arena: &HostObjectArena, handle: Handle) -> CoreResult<f64> {
    match arena.resolve(handle)? {
        TaggedValue::Number(n) => Ok(*n),
        other => Err(CoreError::type_mismatch("number", other.kind())),
    }
}

pub fn to_bool(arena: &HostObjectArena, handle: Handle) -> CoreResult<bool> {
    match arena.resolve(handle)? {
        TaggedValue::Bool(b) => Ok(*b),
        other => Err(CoreError::type_mismatch("bool", other.kind())),
    }
}

/// Borrowed cursor over a value tree in the arena.
#[derive(Clone, Copy)]
pub struct ValueView<'a> {
    arena: &'a HostObjectArena,
    handle: Handle,
}

impl<'a> ValueView<'a> {
    pub fn new(arena: &'a HostObjectArena, handle: Handle) -> Self {
        Self { arena, handle }
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn kind(&self) -> CoreResult<PtrKind> {
        kind_of(self.arena, self.handle)
    }

    pub fn is_null(&self) -> bool {
        matches!(self.kind(), Ok(PtrKind::Null))
    }

    pub fn get(&self, key: &str) -> CoreResult<ValueView<'a>> {
        Ok(Self::new(self.arena, get(self.arena, self.handle, key)?))
    }

    pub fn at(&self, index: usize) -> CoreResult<ValueView<'a>> {
        let index = i64::try_from(index).unwrap_or(i64::MAX);
        Ok(Self::new(self.arena, at(self.arena, self.handle, index)?))
    }

    pub fn len(&self) -> CoreResult<usize> {
        length_of(self.arena, self.handle).map(|n| n as usize)
    }

    pub fn is_empty(&self) -> CoreResult<bool> {
        self.len().map(|n| n == 0)
    }

    /// Object keys in insertion order, without allocating arena slots.
    pub fn keys(&self) -> CoreResult<Vec<&'a str>> {
        match self.arena.resolve(self.handle)? {
            TaggedValue::Object(entries) => Ok(entries.iter().map(|(k, _)| k.as_str()).collect()),
            other => Err(CoreError::type_mismatch("object", other.kind())),
        }
    }

    /// Array elements.
    pub fn items(&self) -> CoreResult<Vec<ValueView<'a>>> {
        match self.arena.resolve(self.handle)? {
            TaggedValue::Array(items) => Ok(items
                .iter()
                .map(|handle| Self::new(self.arena, *handle))
                .collect()),
            other => Err(CoreError::type_mismatch("array", other.kind())),
        }
    }

    pub fn as_str(&self) -> CoreResult<&'a str> {
        to_str(self.arena, self.handle)
    }

    pub fn as_f64(&self) -> CoreResult<f64> {
        to_number(self.arena, self.handle)
    }

    pub fn as_bool(&self) -> CoreResult<bool> {
        to_bool(self.arena, self.handle)
    }

    /// Deep copy into host-native JSON.
    pub fn to_json(&self) -> CoreResult<serde_json::Value> {
        codec::materialize(self.arena, self.handle)
    }
}

impl std::fmt::Debug for ValueView<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueView")
            .field("handle", &self.handle)
            .field("kind", &self.kind().ok())
            .finish()
    }
}
