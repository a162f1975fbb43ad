// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Pure Rust TPM 2.0 wire layer
//!
//! This crate speaks the TPM 2.0 command/response envelope directly, without
//! C library dependencies. It is the foundation of `tpm2-resmgr`.
//!
//! ## Features
//!
//! - **Bounds-checked codec**: big-endian integers and TPM2B blobs, never panicking on short input
//! - **Transports**: character devices (`/dev/tpm0`, `/dev/tpmrm0`) and the TCP reference simulator
//! - **Context management**: `ContextSave`, `ContextLoad`, `FlushContext`
//! - **Capabilities**: TPM properties, loaded handles and command attributes
//!
//! ## Example
//!
//! ```no_run
//! use tpm2::{tpm_rh, TpmContext};
//!
//! let mut ctx = TpmContext::new(None)?; // Auto-detect TPM device
//! let loaded = ctx.get_handles(tpm_rh::TRANSIENT_FIRST)?;
//! # Ok::<(), anyhow::Error>(())
//! ```

mod commands;
mod constants;
mod device;
mod marshal;
mod simulator;
mod types;

pub use commands::{CommandError, TpmContext};
pub use constants::*;
pub use types::*;

pub use device::{TpmCommand, TpmDevice, TpmResponse, TpmTransport, HEADER_SIZE};
pub use marshal::{
    read_u32_at, write_u32_at, CommandBuffer, Marshal, MarshalError, Unmarshal, WireReader,
};
pub use simulator::{sim_cmd, SimulatorTransport};
