// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Resource manager errors and their response codes
//!
//! Every error is reported to the client as a header-only response whose
//! code names the layer that detected it.

use thiserror::Error;
use tpm2::{tss2_rc, CommandError, MarshalError};

use crate::allocator::AllocError;
use crate::gap::GapInvariantViolation;
use crate::handle::Handle;

/// Response codes produced by the resource manager itself
///
/// Manager-specific codes start at `0x100` inside the resource manager layer
/// so they never collide with the TSS2 base codes.
pub mod rc {
    use tpm2::tss2_rc::*;

    pub const BAD_SIZE: u32 = RESMGR_LAYER | BASE_BAD_SIZE;
    pub const MALFORMED_RESPONSE: u32 = RESMGR_LAYER | BASE_MALFORMED_RESPONSE;
    pub const UNOWNED_HANDLE: u32 = RESMGR_LAYER | 0x101;
    pub const HANDLE_SPACE_EXHAUSTED: u32 = RESMGR_LAYER | 0x102;
    pub const GAP_HANDLING_FAILED: u32 = RESMGR_LAYER | 0x103;
    pub const CONTINUATION_MISMATCH: u32 = RESMGR_LAYER | 0x104;
    pub const RESIDUAL_RESOURCES: u32 = RESMGR_LAYER | 0x105;
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed command: {0}")]
    Framing(#[from] MarshalError),
    #[error("handle 0x{handle:08x} is owned by another connection")]
    OwnershipViolation { handle: Handle },
    /// A handle or session the manager does not know; `rc` is TPM-shaped
    #[error("unknown handle 0x{handle:08x}")]
    UnknownHandle { handle: Handle, rc: u32 },
    #[error(transparent)]
    HandleSpaceExhausted(#[from] AllocError),
    #[error(transparent)]
    GapInvariantViolation(#[from] GapInvariantViolation),
    #[error("module transport failure")]
    Transport(#[source] anyhow::Error),
    #[error("malformed module response")]
    ModuleProtocol(#[source] MarshalError),
    /// A command the manager issued on its own behalf failed
    #[error(transparent)]
    Module(#[from] CommandError),
    #[error("session 0x{session:08x} continuation flag changed in the response")]
    ContinuationMismatch { session: Handle },
    #[error("{} transient handles left loaded after the command", handles.len())]
    ResidualResources { handles: Vec<Handle> },
}

impl Error {
    pub fn response_code(&self) -> u32 {
        match self {
            Error::Framing(_) => rc::BAD_SIZE,
            Error::OwnershipViolation { .. } => rc::UNOWNED_HANDLE,
            Error::UnknownHandle { rc, .. } => tss2_rc::with_layer(*rc, tss2_rc::RESMGR_TPM_LAYER),
            Error::HandleSpaceExhausted(_) => rc::HANDLE_SPACE_EXHAUSTED,
            Error::GapInvariantViolation(_) => rc::GAP_HANDLING_FAILED,
            Error::Transport(_) => tss2_rc::TCTI_IO_ERROR,
            Error::ModuleProtocol(_) => rc::MALFORMED_RESPONSE,
            Error::Module(err) => match err {
                CommandError::Tpm { rc, .. } => tss2_rc::with_layer(*rc, tss2_rc::RESMGR_TPM_LAYER),
                CommandError::Transport { .. } => tss2_rc::TCTI_IO_ERROR,
                CommandError::Malformed { .. } => rc::MALFORMED_RESPONSE,
            },
            Error::ContinuationMismatch { .. } => rc::CONTINUATION_MISMATCH,
            Error::ResidualResources { .. } => rc::RESIDUAL_RESOURCES,
        }
    }
}

/// First error wins; later ones are logged and dropped
#[derive(Debug, Default)]
pub struct FirstError(Option<Error>);

impl FirstError {
    pub fn record(&mut self, err: Error) {
        match self.0 {
            None => self.0 = Some(err),
            Some(ref first) => {
                tracing::debug!(error = %err, first = %first, "suppressing later error");
            }
        }
    }

    pub fn record_result<T>(&mut self, result: Result<T>) -> Option<T> {
        match result {
            Ok(v) => Some(v),
            Err(err) => {
                self.record(err);
                None
            }
        }
    }

    pub fn is_set(&self) -> bool {
        self.0.is_some()
    }

    pub fn into_inner(self) -> Option<Error> {
        self.0
    }
}
