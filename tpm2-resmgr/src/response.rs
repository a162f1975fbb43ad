// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Response interception
//!
//! Virtualizes handles the module returns, keeps the entry table in step
//! with what the command did and checks session continuation flags.

use tpm2::{
    read_u32_at, tpm_rh, write_u32_at, MarshalError, TpmResponse, TpmSt, TpmSu, TpmTransport,
    TpmaSa, TpmsContext, Unmarshal, WireReader, HEADER_SIZE,
};
use tracing::{debug, info, trace};

use crate::command::{Params, PendingCommand};
use crate::dispatch::Post;
use crate::error::{Error, FirstError, Result};
use crate::handle::{self, Handle};
use crate::manager::ResourceManager;
use crate::table::{EntryId, NewEntry};

impl<T: TpmTransport> ResourceManager<T> {
    /// Apply the response of a forwarded command
    ///
    /// Failing responses pass through untouched. Errors are recorded in
    /// `errors`; every step still runs.
    pub(crate) fn intercept_response(
        &mut self,
        pending: &mut PendingCommand,
        response: &mut [u8],
        errors: &mut FirstError,
    ) {
        let header = match TpmResponse::parse(response) {
            Ok(header) => header,
            Err(err) => {
                errors.record(Error::ModuleProtocol(err));
                return;
            }
        };
        if !header.is_success() {
            debug!(
                connection = %pending.connection,
                rc = format_args!("0x{:08x}", header.response_code),
                "module rejected the command"
            );
            return;
        }

        errors.record_result(self.apply_post(pending, &header, response));
        errors.record_result(self.check_continuation(pending, &header));
    }

    fn apply_post(
        &mut self,
        pending: &mut PendingCommand,
        header: &TpmResponse,
        response: &mut [u8],
    ) -> Result<()> {
        let connection = pending.connection;
        match pending.descriptor.post {
            Post::None => {}
            Post::NewObject(_) => {
                let real = response_handle(response)?;
                let st_clear = matches!(pending.params, Params::Public { st_clear: true, .. });
                let (parent, hierarchy) = (pending.parent, pending.hierarchy);
                let id = self.virtualize(pending, response, real, parent, hierarchy, st_clear)?;
                pending.touched.push(id);
            }
            Post::NewSession => {
                let real = response_handle(response)?;
                let (parent, hierarchy) = (pending.parent, pending.hierarchy);
                let id = self.virtualize(pending, response, real, parent, hierarchy, false)?;
                self.active_sessions += 1;
                pending.touched.push(id);
            }
            Post::ContextLoad => {
                let Params::Context(context) = &pending.params else {
                    return Ok(());
                };
                let context = context.clone();
                let real = response_handle(response)?;
                let id = self.context_loaded(pending, context, real, response)?;
                pending.touched.push(id);
            }
            Post::ContextSave => {
                let Some(id) = pending.handle_entry(0) else {
                    return Ok(());
                };
                if self.table.get(id).is_some_and(|e| e.is_session()) {
                    let context = TpmsContext::unmarshal(&mut header.data_buffer())
                        .map_err(Error::ModuleProtocol)?;
                    self.gap.note_session_saved(context.sequence);
                    if let Some(entry) = self.table.get_mut(id) {
                        entry.context = Some(context);
                        entry.loaded = false;
                    }
                }
            }
            Post::Flush => {
                if let Some(id) = pending.handle_entry(0) {
                    self.remove_entry(id);
                }
            }
            Post::CompleteSequence { slot } => {
                if let Some(id) = pending.handle_entry(slot) {
                    self.remove_entry(id);
                }
            }
            Post::PurgeHierarchies(hierarchies) => {
                let purged = self.table.purge(|e| hierarchies.contains(&e.hierarchy));
                debug!(?hierarchies, purged = purged.len(), "hierarchy entries purged");
            }
            Post::Shutdown => {
                self.shutdown_state = pending.params == Params::StartupType(TpmSu::State.to_u16());
            }
            Post::Startup => {
                let clear = pending.params == Params::StartupType(TpmSu::Clear.to_u16());
                self.apply_startup(clear);
            }
            Post::EvictControl => self.evict_control(pending)?,
        }
        Ok(())
    }

    /// Give a new module handle a virtual handle and rewrite it in place
    fn virtualize(
        &mut self,
        pending: &PendingCommand,
        response: &mut [u8],
        real: Handle,
        parent: Handle,
        hierarchy: Handle,
        st_clear: bool,
    ) -> Result<EntryId> {
        let added = self.add_entry(pending.connection, real, parent, hierarchy, st_clear);
        let (id, virtual_handle) = match added {
            Ok(added) => added,
            Err(err) => {
                // Nothing can refer to the handle without an entry
                if let Err(flush) = self.tpm.flush_context(real) {
                    debug!(error = %flush, "flush of unvirtualized handle failed");
                }
                return Err(err);
            }
        };
        write_u32_at(response, HEADER_SIZE, virtual_handle).map_err(Error::ModuleProtocol)?;
        trace!(
            connection = %pending.connection,
            real = format_args!("0x{real:08x}"),
            virtual_handle = format_args!("0x{virtual_handle:08x}"),
            "new handle"
        );
        Ok(id)
    }

    fn context_loaded(
        &mut self,
        pending: &PendingCommand,
        context: TpmsContext,
        real: Handle,
        response: &mut [u8],
    ) -> Result<EntryId> {
        if handle::is_session(context.saved_handle) {
            if let Some(id) = pending.loaded_session {
                self.gap.note_session_loaded();
                let virtual_handle = match self.table.get_mut(id) {
                    Some(entry) => {
                        entry.real_handle = real;
                        entry.loaded = true;
                        entry.virtual_handle
                    }
                    None => return Ok(id),
                };
                write_u32_at(response, HEADER_SIZE, virtual_handle).map_err(Error::ModuleProtocol)?;
                return Ok(id);
            }
            // A session saved before the manager knew about it
            self.gap.note_session_loaded();
            let (parent, hierarchy) = (pending.parent, pending.hierarchy);
            let id = self.virtualize(pending, response, real, parent, hierarchy, false)?;
            self.active_sessions += 1;
            return Ok(id);
        }

        // Hierarchy comes from the blob, once; later saves never change it
        let hierarchy = context.hierarchy;
        let id = self.virtualize(pending, response, real, tpm_rh::NULL, hierarchy, false)?;
        if let Some(entry) = self.table.get_mut(id) {
            entry.context = Some(context);
        }
        Ok(id)
    }

    fn remove_entry(&mut self, id: EntryId) {
        if let Some(entry) = self.table.remove(id) {
            if entry.is_session() {
                self.active_sessions = self.active_sessions.saturating_sub(1);
            }
            let virtual_handle = entry.virtual_handle;
            trace!(virtual_handle = format_args!("0x{virtual_handle:08x}"), "entry removed");
        }
    }

    /// Table update for a successful `TPM2_Startup`
    ///
    /// Without a preceding `Shutdown(STATE)` the module went through a reset
    /// and nothing but persistent objects survived. `Startup(CLEAR)` after
    /// `Shutdown(STATE)` is a restart that drops `stClear` objects; anything
    /// else is a resume.
    fn apply_startup(&mut self, clear: bool) {
        if !self.shutdown_state {
            let purged = self.table.purge(|e| !e.is_persistent());
            self.active_sessions = 0;
            self.gap.reset();
            info!(purged = purged.len(), "TPM reset, entry table cleared");
        } else if clear {
            let purged = self.table.purge(|e| e.st_clear);
            info!(purged = purged.len(), "TPM restart, stClear entries cleared");
        } else {
            info!("TPM resume");
        }
        self.shutdown_state = false;
    }

    fn evict_control(&mut self, pending: &PendingCommand) -> Result<()> {
        let Params::Persistent(persistent) = pending.params else {
            return Ok(());
        };
        let Some(object) = pending.command.handles.get(1).map(|slot| slot.handle) else {
            return Ok(());
        };

        if handle::is_persistent(object) {
            if let Some(id) = self.table.find(crate::table::Find::Virtual(object)) {
                self.table.remove(id);
            }
            debug!(handle = format_args!("0x{object:08x}"), "persistent object evicted");
            return Ok(());
        }

        let tracked = pending.handle_entry(1).and_then(|id| self.table.get(id));
        let (parent_handle, hierarchy) = match tracked {
            Some(entry) => (entry.parent_handle, entry.hierarchy),
            None => (tpm_rh::NULL, handle::persistent_hierarchy(persistent)),
        };
        self.table.add(NewEntry {
            virtual_handle: persistent,
            real_handle: persistent,
            parent_handle,
            hierarchy,
            connection: pending.connection,
            loaded: true,
            st_clear: false,
            context: None,
        });
        debug!(handle = format_args!("0x{persistent:08x}"), "object made persistent");
        Ok(())
    }

    /// Sessions must come back with the continuation flag they were sent
    /// with; sessions sent without it are gone from the module.
    fn check_continuation(&mut self, pending: &PendingCommand, header: &TpmResponse) -> Result<()> {
        if pending.command.sessions.is_empty() {
            return Ok(());
        }
        if header.tag != TpmSt::Sessions {
            return Err(Error::ModuleProtocol(MarshalError::BadTag(header.tag.to_u16())));
        }

        let mut reader = header.data_buffer();
        let parse = |reader: &mut WireReader| -> Result<Vec<TpmaSa>, MarshalError> {
            if pending.command.response_handle {
                reader.skip(4)?;
            }
            let parameter_size = reader.get_u32()? as usize;
            reader.skip(parameter_size)?;
            let mut attributes = Vec::with_capacity(pending.command.sessions.len());
            for _ in &pending.command.sessions {
                reader.skip_tpm2b()?;
                attributes.push(TpmaSa(reader.get_u8()?));
                reader.skip_tpm2b()?;
            }
            Ok(attributes)
        };
        let returned = parse(&mut reader).map_err(Error::ModuleProtocol)?;

        let mut result = Ok(());
        for ((slot, entry), attributes) in pending
            .command
            .sessions
            .iter()
            .zip(&pending.session_entries)
            .zip(returned)
        {
            let Some(id) = *entry else {
                continue;
            };
            let sent = slot.attributes.continue_session();
            if attributes.continue_session() != sent {
                if result.is_ok() {
                    result = Err(Error::ContinuationMismatch { session: slot.handle });
                }
                continue;
            }
            if !sent {
                let session = slot.handle;
                trace!(session = format_args!("0x{session:08x}"), "session ended by the command");
                self.remove_entry(id);
            }
        }
        result
    }
}

fn response_handle(response: &[u8]) -> Result<Handle> {
    read_u32_at(response, HEADER_SIZE).map_err(Error::ModuleProtocol)
}
