// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Handle classification

use tpm2::{tpm_rh, TpmHt};

pub type Handle = u32;

/// Allocation partition of a virtualized handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    /// HMAC and policy sessions
    Session,
    /// Transient objects and sequences
    Object,
}

impl HandleKind {
    /// Partition for a handle the manager virtualizes, `None` for anything else
    pub fn of(handle: Handle) -> Option<Self> {
        match TpmHt::of(handle)? {
            TpmHt::HmacSession | TpmHt::PolicySession => Some(HandleKind::Session),
            TpmHt::Transient => Some(HandleKind::Object),
            _ => None,
        }
    }
}

pub fn is_session(handle: Handle) -> bool {
    HandleKind::of(handle) == Some(HandleKind::Session)
}

pub fn is_transient(handle: Handle) -> bool {
    TpmHt::of(handle) == Some(TpmHt::Transient)
}

pub fn is_persistent(handle: Handle) -> bool {
    TpmHt::of(handle) == Some(TpmHt::Persistent)
}

pub fn is_permanent(handle: Handle) -> bool {
    TpmHt::of(handle) == Some(TpmHt::Permanent)
}

/// Whether commands referencing `handle` need translation
pub fn is_tracked(handle: Handle) -> bool {
    HandleKind::of(handle).is_some()
}

/// Hierarchy a persistent handle lives in when nothing better is known
pub fn persistent_hierarchy(handle: Handle) -> Handle {
    if handle >= tpm_rh::PLATFORM_PERSISTENT {
        tpm_rh::PLATFORM
    } else {
        tpm_rh::OWNER
    }
}
