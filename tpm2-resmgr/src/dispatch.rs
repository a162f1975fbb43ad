// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Per-command bookkeeping descriptors
//!
//! Commands not listed here are forwarded with handle translation only.

use tpm2::{tpm_rh, TpmCc};

use crate::handle::Handle;

/// Extra parameter parsing before the command is sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pre {
    None,
    /// `objectAttributes` of the TPM2B_PUBLIC that follows `skip` TPM2B
    /// parameters; LoadExternal additionally carries its hierarchy after it
    PublicArea { skip: usize },
    /// The whole TPMS_CONTEXT parameter
    ContextBlob,
    /// The TPMI_DH_PERSISTENT parameter
    PersistentHandle,
    /// The TPM_SU parameter
    StartupType,
    /// Free a session slot when the active-session budget is spent
    ReserveSession,
}

/// Where a new entry's provenance comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    /// Handle 0 is the hierarchy (and parent)
    HierarchyHandle,
    /// Handle 0 is the parent; the hierarchy is inherited from it
    ParentHandle,
    /// The hierarchy is a parameter after the public area
    HierarchyParameter,
    /// Handle 0 is the parent key; fixed hierarchy
    KeyWithHierarchy(Handle),
    /// No parent; fixed hierarchy
    Fixed(Handle),
}

/// Table update after a successful response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Post {
    None,
    /// Virtualize the response handle as a new object or sequence
    NewObject(Provenance),
    NewSession,
    ContextLoad,
    ContextSave,
    Flush,
    /// The sequence in handle slot `slot` was consumed by the module
    CompleteSequence { slot: usize },
    PurgeHierarchies(&'static [Handle]),
    Shutdown,
    Startup,
    EvictControl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    pub pre: Pre,
    pub post: Post,
}

impl Descriptor {
    pub const PASSTHROUGH: Descriptor = Descriptor {
        pre: Pre::None,
        post: Post::None,
    };

    const fn new(pre: Pre, post: Post) -> Self {
        Self { pre, post }
    }
}

static DESCRIPTORS: &[(TpmCc, Descriptor)] = &[
    (
        TpmCc::CreatePrimary,
        Descriptor::new(
            Pre::PublicArea { skip: 1 },
            Post::NewObject(Provenance::HierarchyHandle),
        ),
    ),
    (
        TpmCc::CreateLoaded,
        Descriptor::new(
            Pre::PublicArea { skip: 1 },
            Post::NewObject(Provenance::ParentHandle),
        ),
    ),
    (
        TpmCc::Load,
        Descriptor::new(
            Pre::PublicArea { skip: 1 },
            Post::NewObject(Provenance::ParentHandle),
        ),
    ),
    (
        TpmCc::LoadExternal,
        Descriptor::new(
            Pre::PublicArea { skip: 1 },
            Post::NewObject(Provenance::HierarchyParameter),
        ),
    ),
    (
        TpmCc::HmacStart,
        Descriptor::new(
            Pre::None,
            Post::NewObject(Provenance::KeyWithHierarchy(tpm_rh::NULL)),
        ),
    ),
    (
        TpmCc::HashSequenceStart,
        Descriptor::new(Pre::None, Post::NewObject(Provenance::Fixed(tpm_rh::NULL))),
    ),
    (
        TpmCc::SequenceComplete,
        Descriptor::new(Pre::None, Post::CompleteSequence { slot: 0 }),
    ),
    (
        TpmCc::EventSequenceComplete,
        Descriptor::new(Pre::None, Post::CompleteSequence { slot: 1 }),
    ),
    (
        TpmCc::StartAuthSession,
        Descriptor::new(Pre::ReserveSession, Post::NewSession),
    ),
    (
        TpmCc::ContextSave,
        Descriptor::new(Pre::None, Post::ContextSave),
    ),
    (
        TpmCc::ContextLoad,
        Descriptor::new(Pre::ContextBlob, Post::ContextLoad),
    ),
    (TpmCc::FlushContext, Descriptor::new(Pre::None, Post::Flush)),
    (
        TpmCc::Clear,
        Descriptor::new(
            Pre::None,
            Post::PurgeHierarchies(&[tpm_rh::OWNER, tpm_rh::ENDORSEMENT]),
        ),
    ),
    (
        TpmCc::ChangePps,
        Descriptor::new(Pre::None, Post::PurgeHierarchies(&[tpm_rh::PLATFORM])),
    ),
    (
        TpmCc::ChangeEps,
        Descriptor::new(Pre::None, Post::PurgeHierarchies(&[tpm_rh::ENDORSEMENT])),
    ),
    (
        TpmCc::Shutdown,
        Descriptor::new(Pre::StartupType, Post::Shutdown),
    ),
    (
        TpmCc::Startup,
        Descriptor::new(Pre::StartupType, Post::Startup),
    ),
    (
        TpmCc::EvictControl,
        Descriptor::new(Pre::PersistentHandle, Post::EvictControl),
    ),
];

/// Bookkeeping required for `command_code`
pub fn descriptor(command_code: u32) -> Descriptor {
    DESCRIPTORS
        .iter()
        .find(|(cc, _)| cc.to_u32() == command_code)
        .map(|(_, d)| *d)
        .unwrap_or(Descriptor::PASSTHROUGH)
}
