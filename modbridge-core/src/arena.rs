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

//! Host Object Arena
//!
//! Append-only, generation-stamped slot table mapping [`Handle`]s to
//! [`TaggedValue`]s. Slots are only recycled when the call scope that
//! allocated them ends; recycling bumps the slot generation so every handle
//! issued for the old occupant resolves to `StaleHandle` afterwards.
//!
//! Values allocated outside any scope, and values promoted out of the
//! outermost scope, are retained until [`HostObjectArena::release`].

use crate::error::{CoreError, CoreResult};
use crate::value::{Handle, TaggedValue, GENERATION_MASK};

/// Token returned by [`HostObjectArena::begin_scope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeToken {
    depth: usize,
    serial: u64,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    value: Option<TaggedValue>,
    /// Scope depth that owns the slot; `None` means retained.
    owner: Option<usize>,
}

#[derive(Debug)]
struct Scope {
    serial: u64,
    allocated: Vec<u32>,
}

/// Arena of host-side values addressed by generation-checked handles
#[derive(Debug)]
pub struct HostObjectArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    scopes: Vec<Scope>,
    next_serial: u64,
}

impl Default for HostObjectArena {
    fn default() -> Self {
        Self::new()
    }
}

impl HostObjectArena {
    /// Create an arena holding only the permanent null slot.
    pub fn new() -> Self {
        Self {
            slots: vec![Slot {
                generation: 0,
                value: Some(TaggedValue::Null),
                owner: None,
            }],
            free: Vec::new(),
            scopes: Vec::new(),
            next_serial: 0,
        }
    }

    /// The designated null handle.
    pub fn null(&self) -> Handle {
        Handle::NULL
    }

    /// Insert a value into the innermost open scope (or retain it when no
    /// scope is open).
    pub fn insert(&mut self, value: TaggedValue) -> Handle {
        let owner = self.scopes.len().checked_sub(1);

        let index = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.value = Some(value);
                slot.owner = owner;
                index
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    value: Some(value),
                    owner,
                });
                (self.slots.len() - 1) as u32
            }
        };

        if let Some(scope) = self.scopes.last_mut() {
            scope.allocated.push(index);
        }

        Handle::new(index, self.slots[index as usize].generation)
    }

    /// Resolve a handle, failing with `StaleHandle` when its generation no
    /// longer matches the slot.
    pub fn resolve(&self, handle: Handle) -> CoreResult<&TaggedValue> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.as_ref())
            .ok_or(CoreError::StaleHandle(handle))
    }

    pub fn is_live(&self, handle: Handle) -> bool {
        self.resolve(handle).is_ok()
    }

    /// Open a call scope.
    pub fn begin_scope(&mut self) -> ScopeToken {
        let serial = self.next_serial;
        self.next_serial += 1;
        self.scopes.push(Scope {
            serial,
            allocated: Vec::new(),
        });
        ScopeToken {
            depth: self.scopes.len() - 1,
            serial,
        }
    }

    /// Close the innermost scope, invalidating every handle it allocated
    /// that was not promoted. Returns the number of slots recycled.
    pub fn end_scope(&mut self, token: ScopeToken) -> CoreResult<usize> {
        let Some(scope) = self.scopes.pop() else {
            return Err(CoreError::ScopeMismatch(
                "no call scope is open".to_string(),
            ));
        };
        if scope.serial != token.serial || self.scopes.len() != token.depth {
            self.scopes.push(scope);
            return Err(CoreError::ScopeMismatch(format!(
                "scope {} is not the innermost open scope",
                token.serial
            )));
        }

        let mut recycled = 0;
        for index in scope.allocated {
            if self.slots[index as usize].owner == Some(token.depth) {
                self.recycle(index);
                recycled += 1;
            }
        }
        Ok(recycled)
    }

    /// Close every open scope. Used when a call is abandoned mid-flight.
    pub fn unwind_scopes(&mut self) -> usize {
        let mut recycled = 0;
        while let Some(scope) = self.scopes.last() {
            let token = ScopeToken {
                depth: self.scopes.len() - 1,
                serial: scope.serial,
            };
            recycled += self.end_scope(token).unwrap_or(0);
        }
        recycled
    }

    pub fn scope_depth(&self) -> usize {
        self.scopes.len()
    }

    /// Move `handle` and everything reachable from it out of the innermost
    /// scope: into the enclosing scope, or into the retained set when the
    /// innermost scope is the outermost one.
    pub fn promote(&mut self, handle: Handle) -> CoreResult<()> {
        self.resolve(handle)?;
        let Some(depth) = self.scopes.len().checked_sub(1) else {
            return Ok(());
        };
        let target = depth.checked_sub(1);

        let mut stack = vec![handle];
        while let Some(current) = stack.pop() {
            let index = current.index as usize;
            let Some(slot) = self.slots.get_mut(index) else {
                continue;
            };
            if slot.generation != current.generation || slot.owner != Some(depth) {
                continue;
            }
            slot.owner = target;
            if let Some(value) = &slot.value {
                stack.extend(value.children());
            }
            if let Some(parent) = target {
                self.scopes[parent].allocated.push(current.index);
            }
        }
        Ok(())
    }

    /// Free a retained value and its retained children.
    pub fn release(&mut self, handle: Handle) -> CoreResult<()> {
        self.resolve(handle)?;
        if handle.is_null() {
            return Ok(());
        }

        let mut stack = vec![handle];
        while let Some(current) = stack.pop() {
            let index = current.index as usize;
            let retained = self
                .slots
                .get(index)
                .map(|slot| slot.generation == current.generation && slot.owner.is_none())
                .unwrap_or(false);
            if !retained || current.is_null() {
                continue;
            }
            if let Some(value) = &self.slots[index].value {
                stack.extend(value.children());
            }
            self.recycle(current.index);
        }
        Ok(())
    }

    /// Number of live values, including the null slot.
    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.value.is_some()).count()
    }

    /// Total slots ever allocated.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn recycle(&mut self, index: u32) {
        if index == 0 {
            return;
        }
        let slot = &mut self.slots[index as usize];
        slot.value = None;
        slot.owner = None;
        slot.generation = slot.generation.wrapping_add(1) & GENERATION_MASK;
        self.free.push(index);
    }
}
