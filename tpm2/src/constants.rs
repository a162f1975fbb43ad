// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! TPM 2.0 constants, command codes and response code layout

/// TPM 2.0 Command Codes (TPM_CC)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum TpmCc {
    EvictControl = 0x00000120,
    ChangeEps = 0x00000124,
    ChangePps = 0x00000125,
    Clear = 0x00000126,
    CreatePrimary = 0x00000131,
    SequenceComplete = 0x0000013E,
    Startup = 0x00000144,
    Shutdown = 0x00000145,
    Create = 0x00000153,
    Load = 0x00000157,
    HmacStart = 0x0000015B,
    SequenceUpdate = 0x0000015C,
    Sign = 0x0000015D,
    Unseal = 0x0000015E,
    ContextLoad = 0x00000161,
    ContextSave = 0x00000162,
    FlushContext = 0x00000165,
    LoadExternal = 0x00000167,
    ReadPublic = 0x00000173,
    StartAuthSession = 0x00000176,
    GetCapability = 0x0000017A,
    GetRandom = 0x0000017B,
    PolicyPcr = 0x0000017F,
    EventSequenceComplete = 0x00000185,
    HashSequenceStart = 0x00000186,
    PolicyGetDigest = 0x00000189,
    CreateLoaded = 0x00000191,
}

impl TpmCc {
    pub const ALL: [TpmCc; 27] = [
        TpmCc::EvictControl,
        TpmCc::ChangeEps,
        TpmCc::ChangePps,
        TpmCc::Clear,
        TpmCc::CreatePrimary,
        TpmCc::SequenceComplete,
        TpmCc::Startup,
        TpmCc::Shutdown,
        TpmCc::Create,
        TpmCc::Load,
        TpmCc::HmacStart,
        TpmCc::SequenceUpdate,
        TpmCc::Sign,
        TpmCc::Unseal,
        TpmCc::ContextLoad,
        TpmCc::ContextSave,
        TpmCc::FlushContext,
        TpmCc::LoadExternal,
        TpmCc::ReadPublic,
        TpmCc::StartAuthSession,
        TpmCc::GetCapability,
        TpmCc::GetRandom,
        TpmCc::PolicyPcr,
        TpmCc::EventSequenceComplete,
        TpmCc::HashSequenceStart,
        TpmCc::PolicyGetDigest,
        TpmCc::CreateLoaded,
    ];

    pub fn to_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|cc| cc.to_u32() == v)
    }
}

/// TPM 2.0 Response Codes (TPM_RC)
///
/// Format-one codes carry the handle, session or parameter number they refer
/// to; use [`tpm_rc::handle_error`] and friends to build those.
pub mod tpm_rc {
    pub const SUCCESS: u32 = 0x000;

    pub const RC_VER1: u32 = 0x100;
    pub const INITIALIZE: u32 = RC_VER1;
    pub const FAILURE: u32 = RC_VER1 + 0x001;
    pub const COMMAND_CODE: u32 = RC_VER1 + 0x043;

    pub const RC_FMT1: u32 = 0x080;
    pub const VALUE: u32 = RC_FMT1 + 0x004;
    pub const HANDLE: u32 = RC_FMT1 + 0x00B;
    pub const SIZE: u32 = RC_FMT1 + 0x015;

    pub const RC_WARN: u32 = 0x900;
    pub const CONTEXT_GAP: u32 = RC_WARN + 0x001;
    pub const OBJECT_MEMORY: u32 = RC_WARN + 0x002;
    pub const SESSION_MEMORY: u32 = RC_WARN + 0x003;
    pub const SESSION_HANDLES: u32 = RC_WARN + 0x005;
    pub const OBJECT_HANDLES: u32 = RC_WARN + 0x006;

    /// Format-one position bits
    pub const H: u32 = 0x000;
    pub const P: u32 = 0x040;
    pub const S: u32 = 0x800;
    pub const N_1: u32 = 0x100;

    /// Error on handle `n` (1-based) of the handle area
    pub fn handle_error(rc: u32, n: u32) -> u32 {
        rc + H + (n << 8)
    }

    /// Error on session `n` (1-based) of the authorization area
    pub fn session_error(rc: u32, n: u32) -> u32 {
        rc + S + (n << 8)
    }

    /// Error on parameter `n` (1-based)
    pub fn parameter_error(rc: u32, n: u32) -> u32 {
        rc + P + (n << 8)
    }
}

/// TSS2 layered response codes
///
/// The upper 16 bits name the layer that produced the code; the lower bits
/// are either a TPM response code or one of the TSS2 base codes.
pub mod tss2_rc {
    pub const LAYER_SHIFT: u32 = 16;
    pub const LAYER_MASK: u32 = 0xFFFF_0000;

    pub const TPM_LAYER: u32 = 0;
    pub const TCTI_LAYER: u32 = 10 << LAYER_SHIFT;
    pub const RESMGR_LAYER: u32 = 11 << LAYER_SHIFT;
    pub const RESMGR_TPM_LAYER: u32 = 12 << LAYER_SHIFT;

    pub const BASE_GENERAL_FAILURE: u32 = 1;
    pub const BASE_BAD_REFERENCE: u32 = 5;
    pub const BASE_INSUFFICIENT_BUFFER: u32 = 6;
    pub const BASE_BAD_SEQUENCE: u32 = 7;
    pub const BASE_IO_ERROR: u32 = 10;
    pub const BASE_BAD_VALUE: u32 = 11;
    pub const BASE_BAD_SIZE: u32 = 16;
    pub const BASE_MALFORMED_RESPONSE: u32 = 17;
    pub const BASE_INSUFFICIENT_RESPONSE: u32 = 19;
    pub const BASE_NOT_SUPPORTED: u32 = 21;

    pub const TCTI_IO_ERROR: u32 = TCTI_LAYER | BASE_IO_ERROR;
    pub const TCTI_INSUFFICIENT_BUFFER: u32 = TCTI_LAYER | BASE_INSUFFICIENT_BUFFER;

    /// Replace whatever layer `rc` carries with `layer`
    pub fn with_layer(rc: u32, layer: u32) -> u32 {
        (rc & !LAYER_MASK) | layer
    }
}

/// TPM 2.0 Handle Types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TpmHt {
    Pcr = 0x00,
    NvIndex = 0x01,
    HmacSession = 0x02,
    PolicySession = 0x03,
    Permanent = 0x40,
    Transient = 0x80,
    Persistent = 0x81,
}

impl TpmHt {
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Handle type of `handle`, taken from its most significant octet
    pub fn of(handle: u32) -> Option<Self> {
        match (handle >> 24) as u8 {
            0x00 => Some(TpmHt::Pcr),
            0x01 => Some(TpmHt::NvIndex),
            0x02 => Some(TpmHt::HmacSession),
            0x03 => Some(TpmHt::PolicySession),
            0x40 => Some(TpmHt::Permanent),
            0x80 => Some(TpmHt::Transient),
            0x81 => Some(TpmHt::Persistent),
            _ => None,
        }
    }
}

/// TPM 2.0 Permanent Handles
pub mod tpm_rh {
    pub const OWNER: u32 = 0x40000001;
    pub const NULL: u32 = 0x40000007;
    pub const PW: u32 = 0x40000009; // Password authorization
    pub const LOCKOUT: u32 = 0x4000000A;
    pub const ENDORSEMENT: u32 = 0x4000000B;
    pub const PLATFORM: u32 = 0x4000000C;

    pub const TRANSIENT_FIRST: u32 = 0x80000000;
    pub const LOADED_SESSION_FIRST: u32 = 0x02000000;
    pub const ACTIVE_SESSION_FIRST: u32 = 0x03000000;
    pub const PERSISTENT_FIRST: u32 = 0x81000000;
    /// First persistent handle in the platform-owned range
    pub const PLATFORM_PERSISTENT: u32 = 0x81800000;
}

/// TPM 2.0 Session Types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TpmSe {
    Hmac = 0x00,
    Policy = 0x01,
    Trial = 0x03,
}

impl TpmSe {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x00 => Some(TpmSe::Hmac),
            0x01 => Some(TpmSe::Policy),
            0x03 => Some(TpmSe::Trial),
            _ => None,
        }
    }
}

/// TPM 2.0 Startup Types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TpmSu {
    Clear = 0x0000,
    State = 0x0001,
}

impl TpmSu {
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x0000 => Some(TpmSu::Clear),
            0x0001 => Some(TpmSu::State),
            _ => None,
        }
    }
}

/// TPM 2.0 Capability Types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TpmCap {
    Handles = 0x00000001,
    Commands = 0x00000002,
    TpmProperties = 0x00000006,
}

impl TpmCap {
    pub fn to_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0x00000001 => Some(TpmCap::Handles),
            0x00000002 => Some(TpmCap::Commands),
            0x00000006 => Some(TpmCap::TpmProperties),
            _ => None,
        }
    }
}

/// TPM 2.0 property tags (TPM_PT)
pub mod tpm_pt {
    pub const PT_FIXED: u32 = 0x100;
    pub const HR_LOADED_MIN: u32 = PT_FIXED + 13;
    pub const ACTIVE_SESSIONS_MAX: u32 = PT_FIXED + 17;
    pub const CONTEXT_GAP_MAX: u32 = PT_FIXED + 20;
    pub const MAX_COMMAND_SIZE: u32 = PT_FIXED + 30;
    pub const MAX_RESPONSE_SIZE: u32 = PT_FIXED + 31;

    pub const PT_VAR: u32 = 0x200;
    pub const HR_LOADED: u32 = PT_VAR + 3;
    pub const HR_LOADED_AVAIL: u32 = PT_VAR + 4;
}

/// TPM 2.0 Object Attributes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TpmaObject(pub u32);

impl TpmaObject {
    pub const FIXED_TPM: u32 = 1 << 1;
    pub const ST_CLEAR: u32 = 1 << 2;
    pub const FIXED_PARENT: u32 = 1 << 4;
    pub const SENSITIVE_DATA_ORIGIN: u32 = 1 << 5;
    pub const USER_WITH_AUTH: u32 = 1 << 6;
    pub const RESTRICTED: u32 = 1 << 16;
    pub const DECRYPT: u32 = 1 << 17;
    pub const SIGN_ENCRYPT: u32 = 1 << 18;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_st_clear(mut self) -> Self {
        self.0 |= Self::ST_CLEAR;
        self
    }

    pub fn st_clear(self) -> bool {
        self.0 & Self::ST_CLEAR != 0
    }
}

/// TPM 2.0 Session Attributes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TpmaSa(pub u8);

impl TpmaSa {
    pub const CONTINUE_SESSION: u8 = 1 << 0;
    pub const AUDIT_EXCLUSIVE: u8 = 1 << 1;
    pub const AUDIT_RESET: u8 = 1 << 2;
    pub const DECRYPT: u8 = 1 << 5;
    pub const ENCRYPT: u8 = 1 << 6;
    pub const AUDIT: u8 = 1 << 7;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_continue_session(mut self) -> Self {
        self.0 |= Self::CONTINUE_SESSION;
        self
    }

    pub fn continue_session(self) -> bool {
        self.0 & Self::CONTINUE_SESSION != 0
    }
}

/// TPM command header tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TpmSt {
    NoSessions = 0x8001,
    Sessions = 0x8002,
    RspCommand = 0x00C4,
}

impl TpmSt {
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x8001 => Some(TpmSt::NoSessions),
            0x8002 => Some(TpmSt::Sessions),
            0x00C4 => Some(TpmSt::RspCommand),
            _ => None,
        }
    }
}
