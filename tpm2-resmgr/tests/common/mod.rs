// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! In-memory TPM with just enough behaviour to drive the resource manager:
//! bounded object and session slots, context save/load with a session
//! context gap, handle validation and session continuation.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::bail;
use tpm2::{
    public_object_attributes, tpm_pt, tpm_rc, tpm_rh, CapabilityData, CommandBuffer, Marshal,
    TaggedProperty, TpmCap, TpmCc, TpmCommand, TpmHt, TpmResponse, TpmSe, TpmSt, TpmSu,
    TpmTransport, TpmaCc, TpmaObject, TpmaSa, TpmsContext, Unmarshal, WireReader, HEADER_SIZE,
};
use tpm2_resmgr::{ConnectionId, ResourceManager, ResourceManagerConfig};

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone)]
pub struct MockConfig {
    /// Transient objects that fit in the module at once
    pub object_slots: usize,
    /// Sessions that can be loaded at once
    pub loaded_session_slots: usize,
    /// Sessions that can exist at once, loaded or saved
    pub active_sessions_max: u32,
    pub gap_max: u32,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            object_slots: 3,
            loaded_session_slots: 3,
            active_sessions_max: 8,
            gap_max: 255,
        }
    }
}

#[derive(Debug, Clone)]
struct Object {
    /// Identity that survives save and reload
    id: u64,
    hierarchy: u32,
    st_clear: bool,
    sequence: bool,
}

#[derive(Debug, Clone)]
struct Session {
    loaded: bool,
    /// Sequence number of the saved context that is currently valid
    saved: Option<u64>,
}

#[derive(Debug, Default)]
struct MockState {
    config: MockConfig,
    started: bool,
    shutdown: Option<TpmSu>,
    objects: BTreeMap<u32, Object>,
    saved_objects: HashMap<u64, Object>,
    persistent: BTreeMap<u32, Object>,
    sessions: BTreeMap<u32, Session>,
    next_object_id: u64,
    object_sequence: u64,
    session_sequence: u64,
    log: Vec<u32>,
    fail_transport: bool,
    flip_continuation: bool,
}

/// Shared handle to the mock; clones observe the same module
#[derive(Clone, Default)]
pub struct MockTpm {
    state: Arc<Mutex<MockState>>,
}

type Reply = Result<Vec<u8>, u32>;

impl MockTpm {
    pub fn new(config: MockConfig) -> Self {
        let state = MockState {
            config,
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Command codes received so far
    pub fn log(&self) -> Vec<u32> {
        self.state().log.clone()
    }

    pub fn clear_log(&self) {
        self.state().log.clear();
    }

    pub fn received(&self, cc: TpmCc) -> usize {
        self.state().log.iter().filter(|c| **c == cc.to_u32()).count()
    }

    pub fn loaded_objects(&self) -> Vec<u32> {
        self.state().objects.keys().copied().collect()
    }

    pub fn loaded_sessions(&self) -> Vec<u32> {
        self.state()
            .sessions
            .iter()
            .filter(|(_, s)| s.loaded)
            .map(|(h, _)| *h)
            .collect()
    }

    /// Sessions that exist in the module, loaded or saved
    pub fn sessions(&self) -> Vec<u32> {
        self.state().sessions.keys().copied().collect()
    }

    pub fn persistent(&self) -> Vec<u32> {
        self.state().persistent.keys().copied().collect()
    }

    /// Sequence numbers of every saved session context
    pub fn saved_session_sequences(&self) -> Vec<u64> {
        self.state().sessions.values().filter_map(|s| s.saved).collect()
    }

    pub fn next_session_sequence(&self) -> u64 {
        self.state().session_sequence
    }

    pub fn set_fail_transport(&self, fail: bool) {
        self.state().fail_transport = fail;
    }

    /// Report the opposite continuation flag for every session
    pub fn set_flip_continuation(&self, flip: bool) {
        self.state().flip_continuation = flip;
    }

    /// Leave a transient object loaded behind the manager's back
    pub fn inject_object(&self) -> u32 {
        let mut state = self.state();
        state.new_object(tpm_rh::OWNER, false, false).unwrap()
    }
}

impl TpmTransport for MockTpm {
    fn transmit(&mut self, command: &[u8]) -> anyhow::Result<Vec<u8>> {
        let mut state = self.state();
        if state.fail_transport {
            bail!("mock transport failure");
        }
        Ok(state.execute(command))
    }
}

const COMMANDS: &[(TpmCc, u32, bool)] = &[
    (TpmCc::EvictControl, 2, false),
    (TpmCc::ChangeEps, 1, false),
    (TpmCc::ChangePps, 1, false),
    (TpmCc::Clear, 1, false),
    (TpmCc::CreatePrimary, 1, true),
    (TpmCc::SequenceComplete, 1, false),
    (TpmCc::Startup, 0, false),
    (TpmCc::Shutdown, 0, false),
    (TpmCc::Create, 1, false),
    (TpmCc::Load, 1, true),
    (TpmCc::HmacStart, 1, true),
    (TpmCc::SequenceUpdate, 1, false),
    (TpmCc::ContextLoad, 0, true),
    (TpmCc::ContextSave, 1, false),
    (TpmCc::FlushContext, 0, false),
    (TpmCc::LoadExternal, 0, true),
    (TpmCc::ReadPublic, 1, false),
    (TpmCc::StartAuthSession, 2, true),
    (TpmCc::GetCapability, 0, false),
    (TpmCc::GetRandom, 0, false),
    (TpmCc::PolicyPcr, 1, false),
    (TpmCc::EventSequenceComplete, 2, false),
    (TpmCc::HashSequenceStart, 0, true),
    (TpmCc::CreateLoaded, 1, true),
];

fn command_attributes(cc: u32) -> Option<(u32, bool)> {
    COMMANDS
        .iter()
        .find(|(c, _, _)| c.to_u32() == cc)
        .map(|(_, handles, rh)| (*handles, *rh))
}

/// Parsed command as the mock sees it
struct Request<'a> {
    cc: TpmCc,
    handles: Vec<u32>,
    sessions: Vec<(u32, TpmaSa)>,
    params: WireReader<'a>,
}

fn parse_request(command: &[u8]) -> Result<Request<'_>, u32> {
    let mut reader = WireReader::new(command);
    let tag = reader.get_u16().map_err(|_| tpm_rc::SIZE)?;
    let size = reader.get_u32().map_err(|_| tpm_rc::SIZE)? as usize;
    let code = reader.get_u32().map_err(|_| tpm_rc::SIZE)?;
    if size != command.len() {
        return Err(tpm_rc::SIZE);
    }
    let cc = TpmCc::from_u32(code).ok_or(tpm_rc::COMMAND_CODE)?;
    let (handle_count, _) = command_attributes(code).ok_or(tpm_rc::COMMAND_CODE)?;

    let handles = (0..handle_count)
        .map(|_| reader.get_u32())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| tpm_rc::SIZE)?;

    let mut sessions = Vec::new();
    if tag == TpmSt::Sessions.to_u16() {
        let auth_size = reader.get_u32().map_err(|_| tpm_rc::SIZE)? as usize;
        let end = reader.position() + auth_size;
        while reader.position() < end {
            let handle = reader.get_u32().map_err(|_| tpm_rc::SIZE)?;
            reader.skip_tpm2b().map_err(|_| tpm_rc::SIZE)?;
            let attrs = TpmaSa(reader.get_u8().map_err(|_| tpm_rc::SIZE)?);
            reader.skip_tpm2b().map_err(|_| tpm_rc::SIZE)?;
            sessions.push((handle, attrs));
        }
    }
    Ok(Request {
        cc,
        handles,
        sessions,
        params: reader,
    })
}

fn response(handle: Option<u32>, params: &[u8], sessions: &[TpmaSa]) -> Vec<u8> {
    let mut buf = CommandBuffer::new();
    let tag = if sessions.is_empty() {
        TpmSt::NoSessions
    } else {
        TpmSt::Sessions
    };
    buf.put_u16(tag.to_u16());
    buf.put_u32(0);
    buf.put_u32(tpm_rc::SUCCESS);
    if let Some(handle) = handle {
        buf.put_u32(handle);
    }
    if !sessions.is_empty() {
        buf.put_u32(params.len() as u32);
    }
    buf.put_bytes(params);
    for attrs in sessions {
        buf.put_tpm2b_empty();
        buf.put_u8(attrs.0);
        buf.put_tpm2b_empty();
    }
    let len = buf.len() as u32;
    buf.update_u32(2, len).unwrap();
    buf.into_vec()
}

impl MockState {
    fn execute(&mut self, command: &[u8]) -> Vec<u8> {
        if command.len() >= HEADER_SIZE {
            self.log
                .push(u32::from_be_bytes([command[6], command[7], command[8], command[9]]));
        }
        match self.dispatch(command) {
            Ok(response) => response,
            Err(rc) => TpmResponse::error_bytes(rc),
        }
    }

    fn dispatch(&mut self, command: &[u8]) -> Reply {
        let mut request = parse_request(command)?;
        let cc = request.cc;
        if !self.started && cc != TpmCc::Startup {
            return Err(tpm_rc::INITIALIZE);
        }
        if cc != TpmCc::FlushContext && cc != TpmCc::ContextSave {
            self.check_handles(&request)?;
        }
        self.check_sessions(&request)?;

        let (handle, params) = match cc {
            TpmCc::Startup => {
                let su = request.params.get_u16().map_err(|_| tpm_rc::SIZE)?;
                let su = TpmSu::from_u16(su).ok_or(tpm_rc::parameter_error(tpm_rc::VALUE, 1))?;
                self.startup(su)?;
                (None, vec![])
            }
            TpmCc::Shutdown => {
                let su = request.params.get_u16().map_err(|_| tpm_rc::SIZE)?;
                let su = TpmSu::from_u16(su).ok_or(tpm_rc::parameter_error(tpm_rc::VALUE, 1))?;
                self.shutdown = Some(su);
                (None, vec![])
            }
            TpmCc::GetCapability => (None, self.get_capability(&mut request.params)?),
            TpmCc::GetRandom => {
                let n = request.params.get_u16().map_err(|_| tpm_rc::SIZE)?;
                let mut buf = CommandBuffer::new();
                buf.put_tpm2b(&vec![0x5A; n as usize]);
                (None, buf.into_vec())
            }
            TpmCc::CreatePrimary | TpmCc::CreateLoaded | TpmCc::Load | TpmCc::LoadExternal => {
                request.params.skip_tpm2b().map_err(|_| tpm_rc::SIZE)?;
                let attrs =
                    public_object_attributes(&mut request.params).map_err(|_| tpm_rc::SIZE)?;
                let hierarchy = match cc {
                    TpmCc::CreatePrimary => request.handles[0],
                    TpmCc::LoadExternal => request.params.get_u32().map_err(|_| tpm_rc::SIZE)?,
                    _ => self.hierarchy_of(request.handles[0]),
                };
                let handle = self.new_object(hierarchy, attrs.st_clear(), false)?;
                let mut buf = CommandBuffer::new();
                buf.put_tpm2b(&[1, 2, 3, 4]);
                (Some(handle), buf.into_vec())
            }
            TpmCc::Create => {
                let mut buf = CommandBuffer::new();
                buf.put_tpm2b(&[0xAA; 8]);
                buf.put_tpm2b(&[0xBB; 8]);
                (None, buf.into_vec())
            }
            TpmCc::HmacStart => {
                let hierarchy = self.hierarchy_of(request.handles[0]);
                (Some(self.new_object(hierarchy, false, true)?), vec![])
            }
            TpmCc::HashSequenceStart => (Some(self.new_object(tpm_rh::NULL, false, true)?), vec![]),
            TpmCc::SequenceUpdate => {
                self.expect_sequence(request.handles[0], 1)?;
                (None, vec![])
            }
            TpmCc::SequenceComplete | TpmCc::EventSequenceComplete => {
                let slot = if cc == TpmCc::SequenceComplete { 0 } else { 1 };
                let sequence = request.handles[slot];
                self.expect_sequence(sequence, slot as u32 + 1)?;
                self.objects.remove(&sequence);
                let mut buf = CommandBuffer::new();
                buf.put_tpm2b(&[0xCC; 32]);
                (None, buf.into_vec())
            }
            TpmCc::StartAuthSession => (Some(self.start_auth_session(&mut request.params)?), {
                let mut buf = CommandBuffer::new();
                buf.put_tpm2b(&[0x11; 16]);
                buf.into_vec()
            }),
            TpmCc::ContextSave => (None, self.context_save(request.handles[0])?.to_bytes()),
            TpmCc::ContextLoad => {
                let ctx = TpmsContext::unmarshal(&mut request.params).map_err(|_| tpm_rc::SIZE)?;
                (Some(self.context_load(&ctx)?), vec![])
            }
            TpmCc::FlushContext => {
                let handle = request.params.get_u32().map_err(|_| tpm_rc::SIZE)?;
                self.flush(handle)?;
                (None, vec![])
            }
            TpmCc::EvictControl => {
                let persistent = request.params.get_u32().map_err(|_| tpm_rc::SIZE)?;
                self.evict_control(request.handles[0], request.handles[1], persistent)?;
                (None, vec![])
            }
            TpmCc::Clear => {
                self.purge_hierarchies(&[tpm_rh::OWNER, tpm_rh::ENDORSEMENT]);
                (None, vec![])
            }
            TpmCc::ChangePps => {
                self.purge_hierarchies(&[tpm_rh::PLATFORM]);
                (None, vec![])
            }
            TpmCc::ChangeEps => {
                self.purge_hierarchies(&[tpm_rh::ENDORSEMENT]);
                (None, vec![])
            }
            TpmCc::ReadPublic => {
                let mut buf = CommandBuffer::new();
                buf.put_tpm2b(&[1, 2, 3, 4]);
                (None, buf.into_vec())
            }
            TpmCc::PolicyPcr => {
                if TpmHt::of(request.handles[0]) != Some(TpmHt::PolicySession) {
                    return Err(tpm_rc::handle_error(tpm_rc::HANDLE, 1));
                }
                (None, vec![])
            }
            _ => return Err(tpm_rc::COMMAND_CODE),
        };

        let mut returned = Vec::with_capacity(request.sessions.len());
        for (handle, attrs) in &request.sessions {
            if *handle != tpm_rh::PW && !attrs.continue_session() {
                self.sessions.remove(handle);
            }
            if *handle != tpm_rh::PW && self.flip_continuation {
                returned.push(TpmaSa(attrs.0 ^ TpmaSa::CONTINUE_SESSION));
            } else {
                returned.push(*attrs);
            }
        }
        Ok(response(handle, &params, &returned))
    }

    fn check_handles(&self, request: &Request) -> Result<(), u32> {
        for (i, handle) in request.handles.iter().enumerate() {
            let n = i as u32 + 1;
            let valid = match TpmHt::of(*handle) {
                Some(TpmHt::Transient) => self.objects.contains_key(handle),
                Some(TpmHt::Persistent) => self.persistent.contains_key(handle),
                Some(TpmHt::HmacSession | TpmHt::PolicySession) => {
                    self.sessions.get(handle).is_some_and(|s| s.loaded)
                }
                _ => true,
            };
            if !valid {
                return Err(tpm_rc::handle_error(tpm_rc::HANDLE, n));
            }
        }
        Ok(())
    }

    fn check_sessions(&self, request: &Request) -> Result<(), u32> {
        for (i, (handle, _)) in request.sessions.iter().enumerate() {
            if *handle == tpm_rh::PW {
                continue;
            }
            if !self.sessions.get(handle).is_some_and(|s| s.loaded) {
                return Err(tpm_rc::session_error(tpm_rc::HANDLE, i as u32 + 1));
            }
        }
        Ok(())
    }

    fn hierarchy_of(&self, parent: u32) -> u32 {
        match TpmHt::of(parent) {
            Some(TpmHt::Transient) => self.objects.get(&parent).map(|o| o.hierarchy),
            Some(TpmHt::Persistent) => self.persistent.get(&parent).map(|o| o.hierarchy),
            _ => Some(parent),
        }
        .unwrap_or(tpm_rh::NULL)
    }

    fn new_object(&mut self, hierarchy: u32, st_clear: bool, sequence: bool) -> Result<u32, u32> {
        let id = self.next_object_id;
        self.next_object_id += 1;
        self.insert_object(Object {
            id,
            hierarchy,
            st_clear,
            sequence,
        })
    }

    fn insert_object(&mut self, object: Object) -> Result<u32, u32> {
        let handle = (0..self.config.object_slots as u32)
            .map(|i| tpm_rh::TRANSIENT_FIRST + i)
            .find(|h| !self.objects.contains_key(h))
            .ok_or(tpm_rc::OBJECT_MEMORY)?;
        self.objects.insert(handle, object);
        Ok(handle)
    }

    fn expect_sequence(&self, handle: u32, n: u32) -> Result<(), u32> {
        match self.objects.get(&handle) {
            Some(o) if o.sequence => Ok(()),
            _ => Err(tpm_rc::handle_error(tpm_rc::HANDLE, n)),
        }
    }

    fn loaded_session_count(&self) -> usize {
        self.sessions.values().filter(|s| s.loaded).count()
    }

    fn start_auth_session(&mut self, params: &mut WireReader) -> Result<u32, u32> {
        params.skip_tpm2b().map_err(|_| tpm_rc::SIZE)?;
        params.skip_tpm2b().map_err(|_| tpm_rc::SIZE)?;
        let session_type = params.get_u8().map_err(|_| tpm_rc::SIZE)?;
        let base = match TpmSe::from_u8(session_type) {
            Some(TpmSe::Hmac) => tpm_rh::LOADED_SESSION_FIRST,
            Some(TpmSe::Policy | TpmSe::Trial) => tpm_rh::ACTIVE_SESSION_FIRST,
            None => return Err(tpm_rc::parameter_error(tpm_rc::VALUE, 3)),
        };
        if self.loaded_session_count() >= self.config.loaded_session_slots {
            return Err(tpm_rc::SESSION_MEMORY);
        }
        // Session handles share one index space across both session types
        let index = (0..self.config.active_sessions_max)
            .find(|i| {
                !self.sessions.contains_key(&(tpm_rh::LOADED_SESSION_FIRST + i))
                    && !self.sessions.contains_key(&(tpm_rh::ACTIVE_SESSION_FIRST + i))
            })
            .ok_or(tpm_rc::SESSION_HANDLES)?;
        let handle = base + index;
        self.sessions.insert(
            handle,
            Session {
                loaded: true,
                saved: None,
            },
        );
        Ok(handle)
    }

    fn context_save(&mut self, handle: u32) -> Result<TpmsContext, u32> {
        let invalid = tpm_rc::handle_error(tpm_rc::HANDLE, 1);
        match TpmHt::of(handle) {
            Some(TpmHt::Transient) => {
                let object = self.objects.get(&handle).ok_or(invalid)?.clone();
                let sequence = self.object_sequence;
                self.object_sequence += 1;
                let mut blob = vec![b'O'];
                blob.extend_from_slice(&object.id.to_be_bytes());
                let hierarchy = object.hierarchy;
                self.saved_objects.insert(object.id, object);
                Ok(TpmsContext {
                    sequence,
                    saved_handle: tpm_rh::TRANSIENT_FIRST,
                    hierarchy,
                    context_blob: blob,
                })
            }
            Some(TpmHt::HmacSession | TpmHt::PolicySession) => {
                if !self.sessions.get(&handle).is_some_and(|s| s.loaded) {
                    return Err(invalid);
                }
                let sequence = self.session_sequence;
                let gap_max = self.config.gap_max as u64;
                let too_old = self
                    .sessions
                    .iter()
                    .filter(|(h, _)| **h != handle)
                    .filter_map(|(_, s)| s.saved)
                    .any(|saved| sequence - saved > gap_max);
                if too_old {
                    return Err(tpm_rc::CONTEXT_GAP);
                }
                self.session_sequence += 1;
                if let Some(session) = self.sessions.get_mut(&handle) {
                    session.loaded = false;
                    session.saved = Some(sequence);
                }
                Ok(TpmsContext {
                    sequence,
                    saved_handle: handle,
                    hierarchy: tpm_rh::NULL,
                    context_blob: [&[b'S'][..], &handle.to_be_bytes()].concat(),
                })
            }
            _ => Err(invalid),
        }
    }

    fn context_load(&mut self, ctx: &TpmsContext) -> Result<u32, u32> {
        let integrity = tpm_rc::parameter_error(tpm_rc::VALUE, 1);
        match ctx.context_blob.first() {
            Some(b'O') if ctx.context_blob.len() == 9 => {
                let mut id = [0u8; 8];
                id.copy_from_slice(&ctx.context_blob[1..]);
                let object = self
                    .saved_objects
                    .get(&u64::from_be_bytes(id))
                    .ok_or(integrity)?
                    .clone();
                self.insert_object(object)
            }
            Some(b'S') => {
                let handle = ctx.saved_handle;
                let session = self.sessions.get(&handle).ok_or(integrity)?;
                if session.loaded || session.saved != Some(ctx.sequence) {
                    return Err(integrity);
                }
                if self.loaded_session_count() >= self.config.loaded_session_slots {
                    return Err(tpm_rc::SESSION_MEMORY);
                }
                if let Some(session) = self.sessions.get_mut(&handle) {
                    session.loaded = true;
                    session.saved = None;
                }
                Ok(handle)
            }
            _ => Err(integrity),
        }
    }

    fn flush(&mut self, handle: u32) -> Result<(), u32> {
        let removed = match TpmHt::of(handle) {
            Some(TpmHt::Transient) => self.objects.remove(&handle).is_some(),
            Some(TpmHt::HmacSession | TpmHt::PolicySession) => {
                self.sessions.remove(&handle).is_some()
            }
            _ => false,
        };
        if removed {
            Ok(())
        } else {
            Err(tpm_rc::parameter_error(tpm_rc::HANDLE, 1))
        }
    }

    fn evict_control(&mut self, auth: u32, object: u32, persistent: u32) -> Result<(), u32> {
        if auth != tpm_rh::OWNER && auth != tpm_rh::PLATFORM {
            return Err(tpm_rc::handle_error(tpm_rc::HANDLE, 1));
        }
        if TpmHt::of(object) == Some(TpmHt::Persistent) {
            self.persistent.remove(&object);
            return Ok(());
        }
        let source = self
            .objects
            .get(&object)
            .ok_or(tpm_rc::handle_error(tpm_rc::HANDLE, 2))?
            .clone();
        if self.persistent.contains_key(&persistent) {
            return Err(tpm_rc::parameter_error(tpm_rc::VALUE, 1));
        }
        self.persistent.insert(persistent, source);
        Ok(())
    }

    fn purge_hierarchies(&mut self, hierarchies: &[u32]) {
        self.objects.retain(|_, o| !hierarchies.contains(&o.hierarchy));
        self.saved_objects.retain(|_, o| !hierarchies.contains(&o.hierarchy));
        self.persistent.retain(|_, o| !hierarchies.contains(&o.hierarchy));
    }

    fn startup(&mut self, su: TpmSu) -> Result<(), u32> {
        if self.started && self.shutdown.is_none() {
            return Err(tpm_rc::INITIALIZE);
        }
        self.objects.clear();
        self.sessions.retain(|_, s| !s.loaded);
        match (self.shutdown.take(), su) {
            (Some(TpmSu::State), TpmSu::State) => {}
            (Some(TpmSu::State), TpmSu::Clear) => self.saved_objects.retain(|_, o| !o.st_clear),
            _ => {
                self.saved_objects.clear();
                self.sessions.clear();
            }
        }
        self.started = true;
        Ok(())
    }

    fn get_capability(&mut self, params: &mut WireReader) -> Result<Vec<u8>, u32> {
        let cap = params.get_u32().map_err(|_| tpm_rc::SIZE)?;
        let property = params.get_u32().map_err(|_| tpm_rc::SIZE)?;
        let count = params.get_u32().map_err(|_| tpm_rc::SIZE)? as usize;
        let (more, data) = match TpmCap::from_u32(cap) {
            Some(TpmCap::Handles) => {
                let handles: Vec<u32> = match TpmHt::of(property) {
                    Some(TpmHt::Transient) => self.objects.keys().copied().collect(),
                    Some(TpmHt::HmacSession) => self
                        .sessions
                        .iter()
                        .filter(|(_, s)| s.loaded)
                        .map(|(h, _)| *h)
                        .collect(),
                    Some(TpmHt::PolicySession) => self
                        .sessions
                        .iter()
                        .filter(|(_, s)| !s.loaded)
                        .map(|(h, _)| *h)
                        .collect(),
                    Some(TpmHt::Persistent) => self.persistent.keys().copied().collect(),
                    _ => vec![],
                };
                let handles: Vec<u32> = handles.into_iter().filter(|h| *h >= property).collect();
                let more = handles.len() > count;
                (more, CapabilityData::Handles(handles.into_iter().take(count).collect()))
            }
            Some(TpmCap::Commands) => {
                let mut commands: Vec<TpmaCc> = COMMANDS
                    .iter()
                    .map(|(cc, handles, rh)| TpmaCc::new(cc.to_u32(), *handles, *rh))
                    .filter(|attrs| attrs.command_code() >= property)
                    .collect();
                commands.sort_by_key(|attrs| attrs.command_code());
                let more = commands.len() > count;
                commands.truncate(count);
                (more, CapabilityData::Commands(commands))
            }
            Some(TpmCap::TpmProperties) => {
                let loaded = (self.objects.len() + self.loaded_session_count()) as u32;
                let mut properties = vec![
                    (tpm_pt::ACTIVE_SESSIONS_MAX, self.config.active_sessions_max),
                    (tpm_pt::CONTEXT_GAP_MAX, self.config.gap_max),
                    (tpm_pt::MAX_COMMAND_SIZE, 4096),
                    (tpm_pt::MAX_RESPONSE_SIZE, 4096),
                    (tpm_pt::HR_LOADED, loaded),
                ];
                properties.retain(|(p, _)| *p >= property);
                properties.sort();
                let more = properties.len() > count;
                properties.truncate(count);
                (
                    more,
                    CapabilityData::TpmProperties(
                        properties
                            .into_iter()
                            .map(|(property, value)| TaggedProperty { property, value })
                            .collect(),
                    ),
                )
            }
            None => return Err(tpm_rc::parameter_error(tpm_rc::VALUE, 1)),
        };
        let mut buf = vec![more as u8];
        buf.extend(data.to_bytes());
        Ok(buf)
    }
}

// ==================== Command builders ====================

fn public_area(st_clear: bool) -> Vec<u8> {
    let attrs = if st_clear {
        TpmaObject::new().with_st_clear()
    } else {
        TpmaObject::new()
    };
    let mut buf = CommandBuffer::new();
    buf.put_u16(0x0001); // RSA
    buf.put_u16(0x000B); // SHA256
    buf.put_u32(attrs.0);
    buf.put_tpm2b_empty();
    buf.into_vec()
}

fn with_password(cc: TpmCc, handles: &[u32]) -> TpmCommand {
    let mut cmd = TpmCommand::with_sessions(cc);
    for handle in handles {
        cmd.add_handle(*handle);
    }
    cmd.add_null_auth_area();
    cmd
}

pub fn create_primary(hierarchy: u32, st_clear: bool) -> Vec<u8> {
    let mut cmd = with_password(TpmCc::CreatePrimary, &[hierarchy]);
    cmd.add_tpm2b(&[0, 0, 0, 0]);
    cmd.add_tpm2b(&public_area(st_clear));
    cmd.add_tpm2b_empty();
    cmd.add_u32(0);
    cmd.finalize()
}

pub fn load(parent: u32) -> Vec<u8> {
    let mut cmd = with_password(TpmCc::Load, &[parent]);
    cmd.add_tpm2b(&[0xAA; 8]);
    cmd.add_tpm2b(&public_area(false));
    cmd.finalize()
}

pub fn create_loaded(parent: u32, st_clear: bool) -> Vec<u8> {
    let mut cmd = with_password(TpmCc::CreateLoaded, &[parent]);
    cmd.add_tpm2b(&[0, 0, 0, 0]);
    cmd.add_tpm2b(&public_area(st_clear));
    cmd.finalize()
}

pub fn load_external(hierarchy: u32) -> Vec<u8> {
    let mut cmd = TpmCommand::new(TpmCc::LoadExternal);
    cmd.add_tpm2b_empty();
    cmd.add_tpm2b(&public_area(false));
    cmd.add_u32(hierarchy);
    cmd.finalize()
}

pub fn read_public(handle: u32) -> Vec<u8> {
    let mut cmd = TpmCommand::new(TpmCc::ReadPublic);
    cmd.add_handle(handle);
    cmd.finalize()
}

pub fn read_public_with_session(handle: u32, session: u32, continue_session: bool) -> Vec<u8> {
    let attrs = if continue_session {
        TpmaSa::new().with_continue_session()
    } else {
        TpmaSa::new()
    };
    let mut cmd = TpmCommand::with_sessions(TpmCc::ReadPublic);
    cmd.add_handle(handle);
    cmd.add_auth_area(&[(session, attrs)]);
    cmd.finalize()
}

pub fn start_auth_session(session_type: TpmSe) -> Vec<u8> {
    let mut cmd = TpmCommand::new(TpmCc::StartAuthSession);
    cmd.add_handle(tpm_rh::NULL);
    cmd.add_handle(tpm_rh::NULL);
    cmd.add_tpm2b(&[0x22; 16]);
    cmd.add_tpm2b_empty();
    cmd.add_u8(session_type as u8);
    cmd.add_u16(0x0010); // TPM_ALG_NULL symmetric
    cmd.add_u16(0x000B);
    cmd.finalize()
}

pub fn policy_pcr(session: u32) -> Vec<u8> {
    let mut cmd = TpmCommand::new(TpmCc::PolicyPcr);
    cmd.add_handle(session);
    cmd.add_tpm2b_empty();
    cmd.add_u32(0);
    cmd.finalize()
}

pub fn context_save(handle: u32) -> Vec<u8> {
    let mut cmd = TpmCommand::new(TpmCc::ContextSave);
    cmd.add_handle(handle);
    cmd.finalize()
}

pub fn context_load(context: &TpmsContext) -> Vec<u8> {
    let mut cmd = TpmCommand::new(TpmCc::ContextLoad);
    cmd.add(context);
    cmd.finalize()
}

pub fn flush_context(handle: u32) -> Vec<u8> {
    let mut cmd = TpmCommand::new(TpmCc::FlushContext);
    cmd.add_handle(handle);
    cmd.finalize()
}

pub fn evict_control(auth: u32, object: u32, persistent: u32) -> Vec<u8> {
    let mut cmd = with_password(TpmCc::EvictControl, &[auth, object]);
    cmd.add_u32(persistent);
    cmd.finalize()
}

pub fn clear(auth: u32) -> Vec<u8> {
    with_password(TpmCc::Clear, &[auth]).finalize()
}

pub fn startup(su: TpmSu) -> Vec<u8> {
    let mut cmd = TpmCommand::new(TpmCc::Startup);
    cmd.add_u16(su.to_u16());
    cmd.finalize()
}

pub fn shutdown(su: TpmSu) -> Vec<u8> {
    let mut cmd = TpmCommand::new(TpmCc::Shutdown);
    cmd.add_u16(su.to_u16());
    cmd.finalize()
}

pub fn hash_sequence_start() -> Vec<u8> {
    let mut cmd = TpmCommand::new(TpmCc::HashSequenceStart);
    cmd.add_tpm2b_empty();
    cmd.add_u16(0x000B);
    cmd.finalize()
}

pub fn hmac_start(key: u32) -> Vec<u8> {
    let mut cmd = with_password(TpmCc::HmacStart, &[key]);
    cmd.add_tpm2b_empty();
    cmd.add_u16(0x000B);
    cmd.finalize()
}

pub fn sequence_update(sequence: u32) -> Vec<u8> {
    let mut cmd = with_password(TpmCc::SequenceUpdate, &[sequence]);
    cmd.add_tpm2b(b"data");
    cmd.finalize()
}

pub fn sequence_complete(sequence: u32) -> Vec<u8> {
    let mut cmd = with_password(TpmCc::SequenceComplete, &[sequence]);
    cmd.add_tpm2b(b"tail");
    cmd.add_u32(tpm_rh::NULL);
    cmd.finalize()
}

pub fn get_random(n: u16) -> Vec<u8> {
    let mut cmd = TpmCommand::new(TpmCc::GetRandom);
    cmd.add_u16(n);
    cmd.finalize()
}

// ==================== Response helpers ====================

pub fn rc(response: &[u8]) -> u32 {
    TpmResponse::parse(response).unwrap().response_code
}

#[track_caller]
pub fn expect_success(response: &[u8]) {
    assert_eq!(rc(response), tpm_rc::SUCCESS, "response 0x{:08x}", rc(response));
}

/// Handle returned by a successful command
#[track_caller]
pub fn returned_handle(response: &[u8]) -> u32 {
    expect_success(response);
    u32::from_be_bytes(response[HEADER_SIZE..HEADER_SIZE + 4].try_into().unwrap())
}

#[track_caller]
pub fn returned_context(response: &[u8]) -> TpmsContext {
    expect_success(response);
    TpmsContext::unmarshal(&mut WireReader::new(&response[HEADER_SIZE..])).unwrap()
}

pub fn manager(config: MockConfig) -> (MockTpm, ResourceManager<MockTpm>) {
    manager_with(config, ResourceManagerConfig::default())
}

pub fn manager_with(
    mock: MockConfig,
    config: ResourceManagerConfig,
) -> (MockTpm, ResourceManager<MockTpm>) {
    init_logging();
    let tpm = MockTpm::new(mock);
    let manager = ResourceManager::initialize(tpm.clone(), config).unwrap();
    (tpm, manager)
}

pub const A: ConnectionId = ConnectionId(1);
pub const B: ConnectionId = ConnectionId(2);
