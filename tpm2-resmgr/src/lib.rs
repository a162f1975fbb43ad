// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 resource manager
//!
//! Multiplexes one TPM among many client connections. Clients see virtual
//! handles for the transient objects, sequences and sessions they create;
//! between commands every such context is saved out of the module, and it is
//! reloaded on demand when a later command names it. Each connection can
//! only use the handles it created, and everything it owns is released when
//! it disconnects.
//!
//! ```no_run
//! use tpm2::TpmDevice;
//! use tpm2_resmgr::{ConnectionId, ResourceManager, ResourceManagerConfig};
//!
//! let device = TpmDevice::detect()?;
//! let mut manager = ResourceManager::initialize(device, ResourceManagerConfig::default())?;
//! let get_random = [0x80, 0x01, 0, 0, 0, 12, 0, 0, 0x01, 0x7B, 0, 16];
//! let response = manager.execute(ConnectionId(1), 0, &get_random);
//! # let _ = response;
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod allocator;
pub mod capability;
pub mod command;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod gap;
pub mod handle;
pub mod manager;
mod response;
pub mod server;
pub mod table;

pub use allocator::{AllocError, VirtualHandleAllocator};
pub use capability::{CapabilityTable, ModuleLimits};
pub use config::{Args, ResourceManagerConfig};
pub use error::{Error, Result};
pub use gap::{GapInvariantViolation, GapScheduler};
pub use handle::{Handle, HandleKind};
pub use manager::ResourceManager;
pub use server::{ConnectionSession, Server, SessionState, SharedManager};
pub use table::{ConnectionId, EntryId, EntryTable, Find, ResourceEntry};
