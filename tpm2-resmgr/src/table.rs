// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! The entry table: one record per virtualized resource
//!
//! Entries are kept in insertion order, so "first match" lookups are stable.
//! Entries are addressed by an [`EntryId`] that is never reused.

use std::collections::BTreeMap;
use std::fmt;

use tpm2::TpmsContext;

use crate::allocator::{AllocError, VirtualHandleAllocator};
use crate::handle::{self, Handle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(u64);

/// Identity of a client connection, stable for the connection's lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceEntry {
    pub virtual_handle: Handle,
    /// Module handle while loaded; sessions keep theirs across evictions
    pub real_handle: Handle,
    pub parent_handle: Handle,
    pub hierarchy: Handle,
    /// Most recent saved context
    pub context: Option<TpmsContext>,
    pub connection: ConnectionId,
    pub loaded: bool,
    /// Invalidated by a TPM Restart (`stClear` object attribute)
    pub st_clear: bool,
}

impl ResourceEntry {
    pub fn is_session(&self) -> bool {
        handle::is_session(self.virtual_handle)
    }

    pub fn is_persistent(&self) -> bool {
        handle::is_persistent(self.virtual_handle)
    }

    /// Sequence number of the saved context, if any
    pub fn sequence(&self) -> Option<u64> {
        self.context.as_ref().map(|ctx| ctx.sequence)
    }
}

/// Fields of a new entry
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub virtual_handle: Handle,
    pub real_handle: Handle,
    pub parent_handle: Handle,
    pub hierarchy: Handle,
    pub connection: ConnectionId,
    pub loaded: bool,
    pub st_clear: bool,
    pub context: Option<TpmsContext>,
}

/// Lookup criterion for [`EntryTable::find`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Find {
    Virtual(Handle),
    Real(Handle),
    Parent(Handle),
    Hierarchy(Handle),
    /// Session whose saved context carries this sequence number
    SessionSequence(u64),
}

impl Find {
    fn matches(&self, entry: &ResourceEntry) -> bool {
        match *self {
            Find::Virtual(h) => entry.virtual_handle == h,
            // An evicted object has no real handle
            Find::Real(h) => (entry.loaded || entry.is_session()) && entry.real_handle == h,
            Find::Parent(h) => entry.parent_handle == h,
            Find::Hierarchy(h) => entry.hierarchy == h,
            Find::SessionSequence(seq) => entry.is_session() && entry.sequence() == Some(seq),
        }
    }
}

#[derive(Debug, Default)]
pub struct EntryTable {
    entries: BTreeMap<EntryId, ResourceEntry>,
    next_id: u64,
    allocator: VirtualHandleAllocator,
}

impl EntryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table whose handles come from `allocator`
    pub fn with_allocator(allocator: VirtualHandleAllocator) -> Self {
        Self {
            allocator,
            ..Self::default()
        }
    }

    /// Mint a virtual handle for `real_handle`
    pub fn allocate(&mut self, real_handle: Handle) -> Result<Handle, AllocError> {
        self.allocator.new_handle(real_handle)
    }

    pub fn allocator(&self) -> &VirtualHandleAllocator {
        &self.allocator
    }

    pub fn add(&mut self, entry: NewEntry) -> EntryId {
        let id = EntryId(self.next_id);
        self.next_id += 1;
        self.entries.insert(
            id,
            ResourceEntry {
                virtual_handle: entry.virtual_handle,
                real_handle: entry.real_handle,
                parent_handle: entry.parent_handle,
                hierarchy: entry.hierarchy,
                context: entry.context,
                connection: entry.connection,
                loaded: entry.loaded,
                st_clear: entry.st_clear,
            },
        );
        id
    }

    /// First entry in table order matching `criterion`
    pub fn find(&self, criterion: Find) -> Option<EntryId> {
        self.entries
            .iter()
            .find(|(_, entry)| criterion.matches(entry))
            .map(|(id, _)| *id)
    }

    pub fn get(&self, id: EntryId) -> Option<&ResourceEntry> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: EntryId) -> Option<&mut ResourceEntry> {
        self.entries.get_mut(&id)
    }

    /// Remove an entry and release its virtual handle
    pub fn remove(&mut self, id: EntryId) -> Option<ResourceEntry> {
        let entry = self.entries.remove(&id)?;
        self.allocator.release(entry.virtual_handle);
        Some(entry)
    }

    /// Ids of all entries matching `pred`, in table order
    pub fn select(&self, mut pred: impl FnMut(&ResourceEntry) -> bool) -> Vec<EntryId> {
        self.entries
            .iter()
            .filter(|(_, entry)| pred(entry))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Remove every entry matching `pred`, returning the removed entries
    pub fn purge(&mut self, pred: impl FnMut(&ResourceEntry) -> bool) -> Vec<ResourceEntry> {
        self.select(pred)
            .into_iter()
            .filter_map(|id| self.remove(id))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntryId, &ResourceEntry)> {
        self.entries.iter().map(|(id, entry)| (*id, entry))
    }

    /// Sequence numbers of every evicted session
    pub fn saved_session_sequences(&self) -> Vec<u64> {
        self.entries
            .values()
            .filter(|entry| entry.is_session() && !entry.loaded)
            .filter_map(ResourceEntry::sequence)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
