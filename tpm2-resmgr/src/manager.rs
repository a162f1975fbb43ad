// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! The resource manager: one instance owns the module and the entry table

use tpm2::{tpm_pt, tpm_rc, tpm_rh, TpmContext, TpmResponse, TpmSu, TpmTransport};
use tracing::{debug, info, trace, warn};

use crate::allocator::VirtualHandleAllocator;
use crate::capability::{CapabilityTable, ModuleLimits};
use crate::command::{self, Parsed, PendingCommand};
use crate::config::ResourceManagerConfig;
use crate::error::{Error, FirstError, Result};
use crate::gap::GapScheduler;
use crate::handle::Handle;
use crate::table::{ConnectionId, EntryId, EntryTable, Find};

pub struct ResourceManager<T: TpmTransport> {
    pub(crate) tpm: TpmContext<T>,
    pub(crate) table: EntryTable,
    pub(crate) gap: GapScheduler,
    pub(crate) capabilities: CapabilityTable,
    pub(crate) limits: ModuleLimits,
    pub(crate) active_sessions: u32,
    pub(crate) max_active_sessions: u32,
    /// A `TPM2_Shutdown(TPM_SU_STATE)` succeeded since the last Startup
    pub(crate) shutdown_state: bool,
    pub(crate) config: ResourceManagerConfig,
}

impl<T: TpmTransport> ResourceManager<T> {
    /// Start the module, learn its limits and clear out anything left loaded
    pub fn initialize(transport: T, config: ResourceManagerConfig) -> Result<Self> {
        let mut tpm = TpmContext::with_transport(transport);
        match tpm.startup(TpmSu::Clear) {
            Ok(()) => debug!("TPM started"),
            Err(err) if err.tpm_rc() == Some(tpm_rc::INITIALIZE) => {
                debug!("TPM already started")
            }
            Err(err) => return Err(err.into()),
        }

        let limits = ModuleLimits {
            max_command_size: tpm.get_tpm_property(tpm_pt::MAX_COMMAND_SIZE)?,
            max_response_size: tpm.get_tpm_property(tpm_pt::MAX_RESPONSE_SIZE)?,
            active_sessions_max: tpm.get_tpm_property(tpm_pt::ACTIVE_SESSIONS_MAX)?,
            hr_loaded: tpm.get_tpm_property(tpm_pt::HR_LOADED)?,
            context_gap_max: tpm.get_tpm_property(tpm_pt::CONTEXT_GAP_MAX)?,
        };
        let capabilities = CapabilityTable::from_attributes(tpm.get_commands()?);

        for first in [
            tpm_rh::TRANSIENT_FIRST,
            tpm_rh::LOADED_SESSION_FIRST,
            tpm_rh::ACTIVE_SESSION_FIRST,
        ] {
            for handle in tpm.get_handles(first)? {
                debug!(handle = format_args!("0x{handle:08x}"), "flushing stale handle");
                tpm.flush_context(handle)?;
            }
        }

        let max_active_sessions = config
            .max_active_sessions
            .unwrap_or_else(|| limits.max_active_sessions());
        let gap_max = config.gap_max.unwrap_or(limits.context_gap_max);
        let allocator = match config.virtual_handles {
            Some(per_kind) => VirtualHandleAllocator::with_limit(per_kind),
            None => VirtualHandleAllocator::new(),
        };
        info!(
            commands = capabilities.len(),
            max_command_size = limits.max_command_size,
            max_active_sessions,
            gap_max,
            "resource manager initialized"
        );

        Ok(Self {
            tpm,
            table: EntryTable::with_allocator(allocator),
            gap: GapScheduler::new(gap_max as u64),
            capabilities,
            limits,
            active_sessions: 0,
            max_active_sessions,
            shutdown_state: false,
            config,
        })
    }

    pub fn limits(&self) -> &ModuleLimits {
        &self.limits
    }

    pub fn capabilities(&self) -> &CapabilityTable {
        &self.capabilities
    }

    pub fn table(&self) -> &EntryTable {
        &self.table
    }

    pub fn gap(&self) -> &GapScheduler {
        &self.gap
    }

    pub fn active_sessions(&self) -> u32 {
        self.active_sessions
    }

    pub fn max_active_sessions(&self) -> u32 {
        self.max_active_sessions
    }

    pub fn transport(&self) -> &T {
        self.tpm.transport()
    }

    /// Run one command for `connection` and return the response to relay
    ///
    /// The returned buffer is always a well-formed TPM response. Failures of
    /// the manager itself become header-only responses carrying the code of
    /// the first error.
    pub fn execute(&mut self, connection: ConnectionId, locality: u8, command: &[u8]) -> Vec<u8> {
        trace!(%connection, locality, command = %hex::encode(command), "command");

        let response = match self.run_cycle(connection, locality, command) {
            Ok(response) => response,
            Err(err) => {
                warn!(
                    %connection,
                    error = %err,
                    rc = format_args!("0x{:08x}", err.response_code()),
                    "command failed"
                );
                TpmResponse::error_bytes(err.response_code())
            }
        };

        trace!(%connection, response = %hex::encode(&response), "response");
        if tracing::enabled!(tracing::Level::TRACE) {
            self.dump_table();
        }
        response
    }

    fn run_cycle(
        &mut self,
        connection: ConnectionId,
        locality: u8,
        command: &[u8],
    ) -> Result<Vec<u8>> {
        self.tpm.set_locality(locality).map_err(Error::Transport)?;

        let mut buf = command.to_vec();
        let parsed = match command::parse(&buf, &self.capabilities)? {
            Parsed::Passthrough => {
                debug!(%connection, "forwarding unknown command unmodified");
                return self.tpm.transmit_raw(&buf).map_err(Error::Transport);
            }
            Parsed::Command(parsed) => parsed,
        };

        let mut pending = PendingCommand::new(connection, parsed);
        let mut errors = FirstError::default();
        let mut response = None;
        if errors.record_result(self.intercept_command(&mut pending, &mut buf)).is_some() {
            trace!(%connection, command = %hex::encode(&buf), "virtualized command");
            match self.tpm.transmit_raw(&buf) {
                Ok(mut rsp) => {
                    self.intercept_response(&mut pending, &mut rsp, &mut errors);
                    response = Some(rsp);
                }
                Err(err) => errors.record(Error::Transport(err)),
            }
        }

        self.evict_touched(&pending.touched, &mut errors);
        if response.is_some() && self.config.residual_audit {
            errors.record_result(self.audit_residual());
        }

        match (errors.into_inner(), response) {
            (None, Some(response)) => Ok(response),
            (Some(err), _) => Err(err),
            (None, None) => Err(Error::Transport(anyhow::anyhow!("no response from the module"))),
        }
    }

    /// Bring the oldest saved sessions forward so the module can keep saving
    pub(crate) fn handle_gap(&mut self) -> Result<()> {
        let cycles = self.gap.sessions_to_cycle(&self.table.saved_session_sequences())?;
        if cycles > 0 {
            let last = self.gap.last_session_sequence();
            debug!(cycles, last, "refreshing old session contexts");
        }
        for _ in 0..cycles {
            let sequences = self.table.saved_session_sequences();
            let Some(oldest) = self.gap.find_oldest_session(&sequences) else {
                break;
            };
            let Some(id) = self.table.find(Find::SessionSequence(oldest)) else {
                break;
            };
            let Some(context) = self.table.get(id).and_then(|e| e.context.clone()) else {
                break;
            };

            let real = self.tpm.context_load(&context)?;
            self.gap.note_session_loaded();
            if let Some(entry) = self.table.get_mut(id) {
                entry.real_handle = real;
                entry.loaded = true;
            }

            let saved = self.tpm.context_save(real)?;
            self.gap.note_session_saved(saved.sequence);
            if let Some(entry) = self.table.get_mut(id) {
                trace!(
                    session = format_args!("0x{:08x}", entry.virtual_handle),
                    from = oldest,
                    to = saved.sequence,
                    "session context refreshed"
                );
                entry.context = Some(saved);
                entry.loaded = false;
            }
        }
        Ok(())
    }

    /// Drop the least recently used session to make room for a new one
    pub(crate) fn evict_oldest_session(&mut self) -> Result<()> {
        let sequences = self.table.saved_session_sequences();
        let Some(id) = self
            .gap
            .find_oldest_session(&sequences)
            .and_then(|seq| self.table.find(Find::SessionSequence(seq)))
        else {
            return Ok(());
        };
        let Some(entry) = self.table.get(id) else {
            return Ok(());
        };
        info!(
            session = format_args!("0x{:08x}", entry.virtual_handle),
            owner = %entry.connection,
            "active session limit reached, evicting the oldest session"
        );
        self.tpm.flush_context(entry.real_handle)?;
        self.table.remove(id);
        self.active_sessions = self.active_sessions.saturating_sub(1);
        Ok(())
    }

    /// Save every entry that was loaded for this cycle back out of the module
    fn evict_touched(&mut self, touched: &[EntryId], errors: &mut FirstError) {
        let mut seen = Vec::with_capacity(touched.len());
        for id in touched {
            if seen.contains(id) {
                continue;
            }
            seen.push(*id);
            let Some(entry) = self.table.get(*id) else {
                continue;
            };
            if !entry.loaded || entry.is_persistent() {
                continue;
            }
            errors.record_result(self.evict(*id));
        }
    }

    /// Save the context of a loaded entry; objects are flushed afterwards
    pub(crate) fn evict(&mut self, id: EntryId) -> Result<()> {
        let Some(entry) = self.table.get(id) else {
            return Ok(());
        };
        let real = entry.real_handle;
        let is_session = entry.is_session();

        let context = self.tpm.context_save(real)?;
        if is_session {
            self.gap.note_session_saved(context.sequence);
        } else {
            self.tpm.flush_context(real)?;
        }
        if let Some(entry) = self.table.get_mut(id) {
            trace!(
                virtual_handle = format_args!("0x{:08x}", entry.virtual_handle),
                sequence = context.sequence,
                "evicted"
            );
            if !is_session {
                entry.real_handle = 0;
            }
            entry.context = Some(context);
            entry.loaded = false;
        }
        Ok(())
    }

    /// No transient object may survive a command cycle in the module
    fn audit_residual(&mut self) -> Result<()> {
        let handles = self.tpm.get_handles(tpm_rh::TRANSIENT_FIRST)?;
        if handles.is_empty() {
            return Ok(());
        }
        warn!(?handles, "transient objects left loaded, flushing");
        for handle in &handles {
            if let Err(err) = self.tpm.flush_context(*handle) {
                debug!(handle = format_args!("0x{handle:08x}"), error = %err, "flush failed");
            }
        }
        Err(Error::ResidualResources { handles })
    }

    /// Release everything `connection` owns
    ///
    /// Persistent entries outlive their connection.
    pub fn close_connection(&mut self, connection: ConnectionId) -> Result<()> {
        let owned = self
            .table
            .select(|e| e.connection == connection && !e.is_persistent());
        let mut errors = FirstError::default();
        for id in owned {
            let Some(entry) = self.table.get(id) else {
                continue;
            };
            if entry.is_session() || entry.loaded {
                let real = entry.real_handle;
                if let Err(err) = self.tpm.flush_context(real) {
                    debug!(
                        %connection,
                        handle = format_args!("0x{real:08x}"),
                        error = %err,
                        "flush on close failed"
                    );
                    errors.record(err.into());
                }
            }
            if let Some(entry) = self.table.remove(id) {
                if entry.is_session() {
                    self.active_sessions = self.active_sessions.saturating_sub(1);
                }
            }
        }
        debug!(%connection, entries = self.table.len(), "connection closed");
        match errors.into_inner() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Virtualize a response handle as a new entry
    pub(crate) fn add_entry(
        &mut self,
        connection: ConnectionId,
        real_handle: Handle,
        parent_handle: Handle,
        hierarchy: Handle,
        st_clear: bool,
    ) -> Result<(EntryId, Handle)> {
        let virtual_handle = self.table.allocate(real_handle)?;
        let id = self.table.add(crate::table::NewEntry {
            virtual_handle,
            real_handle,
            parent_handle,
            hierarchy,
            connection,
            loaded: true,
            st_clear,
            context: None,
        });
        Ok((id, virtual_handle))
    }

    fn dump_table(&self) {
        for (_, entry) in self.table.iter() {
            trace!(
                virtual_handle = format_args!("0x{:08x}", entry.virtual_handle),
                real_handle = format_args!("0x{:08x}", entry.real_handle),
                parent = format_args!("0x{:08x}", entry.parent_handle),
                hierarchy = format_args!("0x{:08x}", entry.hierarchy),
                sequence = ?entry.sequence(),
                connection = %entry.connection,
                loaded = entry.loaded,
                st_clear = entry.st_clear,
                "entry"
            );
        }
        trace!(
            active_sessions = self.active_sessions,
            last_session_sequence = self.gap.last_session_sequence(),
            "table"
        );
    }
}
