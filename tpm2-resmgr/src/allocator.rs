// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Virtual handle allocation
//!
//! A virtual handle keeps the handle-type octet of the real handle it stands
//! for, carries [`VIRTUAL_MARKER`] in bits 20..24 and a per-kind index in the
//! low 20 bits:
//!
//! ```text
//!  31      24 23  20 19                 0
//! +----------+------+--------------------+
//! | type     | 0xF  | index              |
//! +----------+------+--------------------+
//! ```
//!
//! Released indices go to a small LIFO recycle pool. When the pool is full a
//! released index is dropped and never reissued.

use thiserror::Error;
use tracing::warn;

use crate::handle::{Handle, HandleKind};

pub const RECYCLE_POOL_CAPACITY: usize = 32;
pub const VIRTUAL_MARKER: u32 = 0x00F0_0000;
pub const INDEX_MASK: u32 = 0x000F_FFFF;
pub const MAX_INDEX: u32 = INDEX_MASK;

const TYPE_MASK: u32 = 0xFF00_0000;
const MARKER_MASK: u32 = 0x00F0_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    #[error("virtual handle space exhausted for {0:?} handles")]
    Overflow(HandleKind),
    #[error("handle 0x{0:08x} is not of a virtualized kind")]
    Untracked(Handle),
}

/// Whether `handle` was minted by a [`VirtualHandleAllocator`]
pub fn is_virtual(handle: Handle) -> bool {
    HandleKind::of(handle).is_some() && handle & MARKER_MASK == VIRTUAL_MARKER
}

#[derive(Debug)]
struct Pool {
    next_index: u32,
    recycled: Vec<u32>,
}

impl Pool {
    fn new() -> Self {
        Self {
            next_index: 0,
            recycled: Vec::with_capacity(RECYCLE_POOL_CAPACITY),
        }
    }
}

#[derive(Debug)]
pub struct VirtualHandleAllocator {
    sessions: Pool,
    objects: Pool,
    /// Fresh indices issued per kind, at most `MAX_INDEX + 1`
    limit: u32,
}

impl Default for VirtualHandleAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualHandleAllocator {
    pub fn new() -> Self {
        Self::with_limit(MAX_INDEX + 1)
    }

    /// Allocator issuing at most `per_kind` fresh handles of each kind
    pub fn with_limit(per_kind: u32) -> Self {
        Self {
            sessions: Pool::new(),
            objects: Pool::new(),
            limit: per_kind.min(MAX_INDEX + 1),
        }
    }

    fn pool(&mut self, kind: HandleKind) -> &mut Pool {
        match kind {
            HandleKind::Session => &mut self.sessions,
            HandleKind::Object => &mut self.objects,
        }
    }

    /// Issue a virtual handle standing for `real_handle`
    pub fn new_handle(&mut self, real_handle: Handle) -> Result<Handle, AllocError> {
        let kind = HandleKind::of(real_handle).ok_or(AllocError::Untracked(real_handle))?;
        let limit = self.limit;
        let pool = self.pool(kind);
        let index = match pool.recycled.pop() {
            Some(index) => index,
            None => {
                if pool.next_index >= limit {
                    return Err(AllocError::Overflow(kind));
                }
                let index = pool.next_index;
                pool.next_index += 1;
                index
            }
        };
        Ok((real_handle & TYPE_MASK) | VIRTUAL_MARKER | index)
    }

    /// Return a virtual handle to its kind's recycle pool. Handles that were
    /// not minted here are ignored.
    pub fn release(&mut self, virtual_handle: Handle) {
        if !is_virtual(virtual_handle) {
            return;
        }
        let Some(kind) = HandleKind::of(virtual_handle) else {
            return;
        };
        let pool = self.pool(kind);
        if pool.recycled.len() < RECYCLE_POOL_CAPACITY {
            pool.recycled.push(virtual_handle & INDEX_MASK);
        } else {
            warn!(
                handle = format_args!("0x{virtual_handle:08x}"),
                "recycle pool full, dropping released handle"
            );
        }
    }

    /// Number of recycled indices waiting for reuse
    pub fn pooled(&self, kind: HandleKind) -> usize {
        match kind {
            HandleKind::Session => self.sessions.recycled.len(),
            HandleKind::Object => self.objects.recycled.len(),
        }
    }
}
