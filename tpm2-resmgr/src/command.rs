// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Command interception
//!
//! Locates the handle and authorization areas of a client command, swaps
//! virtual handles for real ones (reloading evicted contexts on the way) and
//! records what the response side has to do.

use tpm2::{
    public_object_attributes, tpm_rc, tpm_rh, write_u32_at, MarshalError, TpmCc, TpmSt,
    TpmTransport, TpmaSa, TpmsContext, Unmarshal, WireReader, HEADER_SIZE,
};
use tracing::{debug, trace};

use crate::capability::CapabilityTable;
use crate::dispatch::{descriptor, Descriptor, Post, Pre, Provenance};
use crate::error::{Error, Result};
use crate::handle::{self, Handle};
use crate::manager::ResourceManager;
use crate::table::{ConnectionId, EntryId, EntryTable, Find};

/// A handle in the handle area
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleSlot {
    pub handle: Handle,
    pub offset: usize,
}

/// A session block in the authorization area
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSlot {
    pub handle: Handle,
    /// Offset of the session handle
    pub offset: usize,
    pub attributes: TpmaSa,
}

/// Envelope of a command the module's capability table knows
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub tag: TpmSt,
    pub command_code: u32,
    pub handles: Vec<HandleSlot>,
    pub sessions: Vec<SessionSlot>,
    /// Offset of the parameter area
    pub parameters: usize,
    pub response_handle: bool,
}

impl ParsedCommand {
    pub fn is(&self, cc: TpmCc) -> bool {
        self.command_code == cc.to_u32()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed {
    /// Unknown command code; forward without bookkeeping
    Passthrough,
    Command(ParsedCommand),
}

/// Parse the command envelope
///
/// Buffers too short to carry a header are a framing error. Command codes
/// the module does not list are passed through for the module to reject.
pub fn parse(buf: &[u8], capabilities: &CapabilityTable) -> Result<Parsed, MarshalError> {
    if buf.len() < HEADER_SIZE {
        return Err(MarshalError::Underflow {
            offset: 0,
            needed: HEADER_SIZE,
            remaining: buf.len(),
        });
    }
    let mut reader = WireReader::new(buf);
    let tag_raw = reader.get_u16()?;
    let size = reader.get_u32()? as usize;
    let command_code = reader.get_u32()?;

    let (Some(handle_count), Some(response_handle)) = (
        capabilities.handle_count(command_code),
        capabilities.has_response_handle(command_code),
    ) else {
        return Ok(Parsed::Passthrough);
    };

    let tag = match TpmSt::from_u16(tag_raw) {
        Some(tag @ (TpmSt::NoSessions | TpmSt::Sessions)) => tag,
        _ => return Err(MarshalError::BadTag(tag_raw)),
    };
    if size != buf.len() {
        return Err(MarshalError::SizeMismatch {
            declared: size,
            actual: buf.len(),
        });
    }

    let mut handles = Vec::with_capacity(handle_count);
    for _ in 0..handle_count {
        let offset = reader.position();
        handles.push(HandleSlot {
            handle: reader.get_u32()?,
            offset,
        });
    }

    let mut sessions = Vec::new();
    if tag == TpmSt::Sessions {
        let auth_size = reader.get_u32()? as usize;
        let end = reader.position() + auth_size;
        if end > buf.len() {
            return Err(MarshalError::Underflow {
                offset: reader.position(),
                needed: auth_size,
                remaining: reader.remaining(),
            });
        }
        let mut area = WireReader::new(&buf[..end]);
        area.skip(reader.position())?;
        while area.remaining() > 0 {
            let offset = area.position();
            let handle = area.get_u32()?;
            area.skip_tpm2b()?;
            let attributes = TpmaSa(area.get_u8()?);
            area.skip_tpm2b()?;
            sessions.push(SessionSlot {
                handle,
                offset,
                attributes,
            });
        }
        reader.skip(auth_size)?;
    }

    Ok(Parsed::Command(ParsedCommand {
        tag,
        command_code,
        handles,
        sessions,
        parameters: reader.position(),
        response_handle,
    }))
}

/// Parameters some commands need read before sending
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Params {
    None,
    Public { st_clear: bool, hierarchy: Option<Handle> },
    Context(TpmsContext),
    Persistent(Handle),
    StartupType(u16),
}

pub fn parse_params(
    buf: &[u8],
    command: &ParsedCommand,
    descriptor: &Descriptor,
) -> Result<Params, MarshalError> {
    let mut reader = WireReader::at(buf, command.parameters)?;
    let params = match descriptor.pre {
        Pre::None | Pre::ReserveSession => Params::None,
        Pre::PublicArea { skip } => {
            for _ in 0..skip {
                reader.skip_tpm2b()?;
            }
            let attributes = public_object_attributes(&mut reader)?;
            let hierarchy = match descriptor.post {
                Post::NewObject(Provenance::HierarchyParameter) => Some(reader.get_u32()?),
                _ => None,
            };
            Params::Public {
                st_clear: attributes.st_clear(),
                hierarchy,
            }
        }
        Pre::ContextBlob => Params::Context(TpmsContext::unmarshal(&mut reader)?),
        Pre::PersistentHandle => Params::Persistent(reader.get_u32()?),
        Pre::StartupType => Params::StartupType(reader.get_u16()?),
    };
    Ok(params)
}

/// State carried from the command side to the response side of one cycle
#[derive(Debug)]
pub struct PendingCommand {
    pub connection: ConnectionId,
    pub command: ParsedCommand,
    pub descriptor: Descriptor,
    pub params: Params,
    /// Entry behind each handle slot, `None` for untracked handles
    pub handle_entries: Vec<Option<EntryId>>,
    /// Entry behind each session slot, `None` for untracked sessions
    pub session_entries: Vec<Option<EntryId>>,
    /// Session entry a ContextLoad names
    pub loaded_session: Option<EntryId>,
    /// Entries loaded into the module for this command, in load order
    pub touched: Vec<EntryId>,
    pub parent: Handle,
    pub hierarchy: Handle,
}

impl PendingCommand {
    pub fn new(connection: ConnectionId, command: ParsedCommand) -> Self {
        let descriptor = descriptor(command.command_code);
        Self {
            connection,
            command,
            descriptor,
            params: Params::None,
            handle_entries: Vec::new(),
            session_entries: Vec::new(),
            loaded_session: None,
            touched: Vec::new(),
            parent: 0,
            hierarchy: tpm_rh::NULL,
        }
    }

    pub fn handle_entry(&self, slot: usize) -> Option<EntryId> {
        self.handle_entries.get(slot).copied().flatten()
    }
}

impl<T: TpmTransport> ResourceManager<T> {
    /// Resolve, check, reload and rewrite every tracked handle in `buf`
    ///
    /// Entries reloaded before a failure stay in `pending.touched` so the
    /// caller can evict them again.
    pub(crate) fn intercept_command(
        &mut self,
        pending: &mut PendingCommand,
        buf: &mut [u8],
    ) -> Result<()> {
        pending.params = parse_params(buf, &pending.command, &pending.descriptor)?;
        let is_flush = pending.command.is(TpmCc::FlushContext);

        pending.session_entries = pending
            .command
            .sessions
            .iter()
            .enumerate()
            .map(|(i, slot)| {
                self.resolve(
                    pending.connection,
                    slot.handle,
                    tpm_rc::session_error(tpm_rc::VALUE, i as u32 + 1),
                )
            })
            .collect::<Result<_>>()?;

        pending.handle_entries = pending
            .command
            .handles
            .iter()
            .enumerate()
            .map(|(i, slot)| {
                let rc = if is_flush {
                    tpm_rc::parameter_error(tpm_rc::HANDLE, 1)
                } else {
                    tpm_rc::handle_error(tpm_rc::HANDLE, i as u32 + 1)
                };
                self.resolve(pending.connection, slot.handle, rc)
            })
            .collect::<Result<_>>()?;

        if let Params::Context(ctx) = &pending.params {
            if handle::is_session(ctx.saved_handle) {
                pending.loaded_session = self.table.find(Find::Real(ctx.saved_handle));
                if let Some(id) = pending.loaded_session {
                    self.check_owner(id, pending.connection)?;
                }
            }
        }

        self.resolve_provenance(pending)?;

        let reserve = pending.descriptor.pre == Pre::ReserveSession;
        if reserve && self.active_sessions >= self.max_active_sessions {
            self.evict_oldest_session()?;
        }

        // Flushing a session only needs its real handle
        let translate_only = |table: &EntryTable, id: EntryId| {
            is_flush && table.get(id).is_some_and(|e| e.is_session())
        };
        let needs_gap = reserve
            || pending
                .session_entries
                .iter()
                .chain(pending.handle_entries.iter())
                .flatten()
                .filter(|id| !translate_only(&self.table, **id))
                .any(|id| self.table.get(*id).is_some_and(|e| e.is_session() && !e.loaded));
        if needs_gap {
            self.handle_gap()?;
        }

        for (i, slot) in pending.command.sessions.iter().enumerate() {
            let Some(id) = pending.session_entries[i] else {
                continue;
            };
            let real = self.ensure_loaded(id, &mut pending.touched)?;
            write_u32_at(buf, slot.offset, real)?;
        }

        for (i, slot) in pending.command.handles.iter().enumerate() {
            let Some(id) = pending.handle_entries[i] else {
                continue;
            };
            let real = if translate_only(&self.table, id) {
                self.table.get(id).map_or(slot.handle, |e| e.real_handle)
            } else {
                self.ensure_loaded(id, &mut pending.touched)?
            };
            write_u32_at(buf, slot.offset, real)?;
        }
        Ok(())
    }

    /// Entry behind a client handle, `None` if the handle is not virtualized
    fn resolve(
        &self,
        connection: ConnectionId,
        handle: Handle,
        rc: u32,
    ) -> Result<Option<EntryId>> {
        if !handle::is_tracked(handle) {
            return Ok(None);
        }
        let id = self
            .table
            .find(Find::Virtual(handle))
            .ok_or(Error::UnknownHandle { handle, rc })?;
        self.check_owner(id, connection)?;
        Ok(Some(id))
    }

    pub(crate) fn check_owner(&self, id: EntryId, connection: ConnectionId) -> Result<()> {
        match self.table.get(id) {
            Some(entry) if entry.connection != connection => {
                debug!(
                    %connection,
                    owner = %entry.connection,
                    handle = format_args!("0x{:08x}", entry.virtual_handle),
                    "handle used by a connection that does not own it"
                );
                Err(Error::OwnershipViolation {
                    handle: entry.virtual_handle,
                })
            }
            _ => Ok(()),
        }
    }

    fn resolve_provenance(&self, pending: &mut PendingCommand) -> Result<()> {
        let Post::NewObject(provenance) = pending.descriptor.post else {
            return Ok(());
        };
        let first = pending.command.handles.first().map(|slot| slot.handle);
        let (parent, hierarchy) = match provenance {
            Provenance::HierarchyHandle => {
                let h = first.unwrap_or(tpm_rh::NULL);
                (h, h)
            }
            Provenance::ParentHandle => {
                let parent = first.unwrap_or(tpm_rh::NULL);
                (parent, self.hierarchy_of(parent))
            }
            Provenance::HierarchyParameter => {
                let h = match pending.params {
                    Params::Public {
                        hierarchy: Some(h), ..
                    } => h,
                    _ => tpm_rh::NULL,
                };
                (h, h)
            }
            Provenance::KeyWithHierarchy(h) => (first.unwrap_or(tpm_rh::NULL), h),
            Provenance::Fixed(h) => (tpm_rh::NULL, h),
        };
        pending.parent = parent;
        pending.hierarchy = hierarchy;
        Ok(())
    }

    /// Hierarchy an object created under `parent` belongs to
    fn hierarchy_of(&self, parent: Handle) -> Handle {
        if handle::is_permanent(parent) {
            return parent;
        }
        match self.table.find(Find::Virtual(parent)).and_then(|id| self.table.get(id)) {
            Some(entry) => entry.hierarchy,
            None if handle::is_persistent(parent) => handle::persistent_hierarchy(parent),
            None => tpm_rh::NULL,
        }
    }

    /// Make sure the entry is resident and return its real handle
    pub(crate) fn ensure_loaded(
        &mut self,
        id: EntryId,
        touched: &mut Vec<EntryId>,
    ) -> Result<Handle> {
        let entry = self.table.get(id).ok_or(Error::UnknownHandle {
            handle: 0,
            rc: tpm_rc::HANDLE,
        })?;
        if entry.loaded {
            return Ok(entry.real_handle);
        }
        let Some(context) = entry.context.clone() else {
            return Err(Error::UnknownHandle {
                handle: entry.virtual_handle,
                rc: tpm_rc::HANDLE,
            });
        };
        let virtual_handle = entry.virtual_handle;
        let is_session = entry.is_session();

        let real = self.tpm.context_load(&context)?;
        if is_session {
            self.gap.note_session_loaded();
        }
        if let Some(entry) = self.table.get_mut(id) {
            entry.real_handle = real;
            entry.loaded = true;
        }
        touched.push(id);
        trace!(
            virtual_handle = format_args!("0x{virtual_handle:08x}"),
            real = format_args!("0x{real:08x}"),
            "context loaded"
        );
        Ok(real)
    }
}
