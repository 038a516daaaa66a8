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

//! Tagged values - the common currency between host and guest.
//!
//! Arrays and objects hold child [`Handle`]s rather than nested values, so a
//! value tree lives in the [`HostObjectArena`](crate::arena::HostObjectArena)
//! and can be walked lazily from either side of the boundary.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Generations wrap within 31 bits so a packed handle is never negative.
pub const GENERATION_MASK: u32 = 0x7FFF_FFFF;

/// Bit marking a packed entry result as a pending request id.
pub const PENDING_BIT: u64 = 1 << 63;

/// Runtime kind of a tagged value. The discriminant doubles as the wire tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum PtrKind {
    Null = 0,
    Bool = 1,
    Number = 2,
    String = 3,
    Array = 4,
    Object = 5,
    Function = 6,
}

impl PtrKind {
    /// All kinds, in tag order.
    pub const ALL: [PtrKind; 7] = [
        PtrKind::Null,
        PtrKind::Bool,
        PtrKind::Number,
        PtrKind::String,
        PtrKind::Array,
        PtrKind::Object,
        PtrKind::Function,
    ];

    /// Decode a wire tag.
    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.get(tag as usize).copied()
    }

    pub fn tag(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for PtrKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PtrKind::Null => "null",
            PtrKind::Bool => "bool",
            PtrKind::Number => "number",
            PtrKind::String => "string",
            PtrKind::Array => "array",
            PtrKind::Object => "object",
            PtrKind::Function => "function",
        };
        f.write_str(name)
    }
}

/// Generation-checked reference into the host object arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Handle {
    pub index: u32,
    pub generation: u32,
}

impl Handle {
    /// The permanent null handle (slot 0, generation 0).
    pub const NULL: Handle = Handle {
        index: 0,
        generation: 0,
    };

    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }

    /// Pack into the `i64` wire form: `(generation << 32) | index`.
    pub fn to_bits(self) -> u64 {
        (((self.generation & GENERATION_MASK) as u64) << 32) | self.index as u64
    }

    pub fn from_bits(bits: u64) -> Self {
        Self {
            index: bits as u32,
            generation: ((bits >> 32) as u32) & GENERATION_MASK,
        }
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}@{}", self.index, self.generation)
    }
}

/// Opaque call target carried by a `Function` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionRef(pub u32);

/// Value stored in an arena slot.
#[derive(Debug, Clone, PartialEq)]
pub enum TaggedValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<Handle>),
    /// Insertion-ordered entries.
    Object(Vec<(String, Handle)>),
    Function(FunctionRef),
}

impl TaggedValue {
    pub fn kind(&self) -> PtrKind {
        match self {
            TaggedValue::Null => PtrKind::Null,
            TaggedValue::Bool(_) => PtrKind::Bool,
            TaggedValue::Number(_) => PtrKind::Number,
            TaggedValue::String(_) => PtrKind::String,
            TaggedValue::Array(_) => PtrKind::Array,
            TaggedValue::Object(_) => PtrKind::Object,
            TaggedValue::Function(_) => PtrKind::Function,
        }
    }

    /// Child handles of a container value.
    pub fn children(&self) -> Vec<Handle> {
        match self {
            TaggedValue::Array(items) => items.clone(),
            TaggedValue::Object(entries) => entries.iter().map(|(_, h)| *h).collect(),
            _ => Vec::new(),
        }
    }

    /// Object member lookup. Returns `None` for missing keys and non-objects.
    pub fn member(&self, key: &str) -> Option<Handle> {
        match self {
            TaggedValue::Object(entries) => entries
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, handle)| *handle),
            _ => None,
        }
    }
}

/// What an entry point handed back: a value, or a pending network request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryReturn {
    Value(Handle),
    Pending(u64),
}

impl EntryReturn {
    pub fn from_bits(bits: i64) -> Self {
        let bits = bits as u64;
        if bits & PENDING_BIT != 0 {
            EntryReturn::Pending(bits & !PENDING_BIT)
        } else {
            EntryReturn::Value(Handle::from_bits(bits))
        }
    }

    pub fn to_bits(self) -> i64 {
        match self {
            EntryReturn::Value(handle) => handle.to_bits() as i64,
            EntryReturn::Pending(id) => (id | PENDING_BIT) as i64,
        }
    }
}
