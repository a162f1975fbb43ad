// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! TPM 2.0 data types

use super::constants::*;
use super::marshal::*;

/// TPMS_CONTEXT - saved object, sequence or session context
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TpmsContext {
    pub sequence: u64,
    pub saved_handle: u32,
    pub hierarchy: u32,
    pub context_blob: Vec<u8>,
}

impl Marshal for TpmsContext {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u64(self.sequence);
        buf.put_u32(self.saved_handle);
        buf.put_u32(self.hierarchy);
        buf.put_tpm2b(&self.context_blob);
    }
}

impl Unmarshal for TpmsContext {
    fn unmarshal(buf: &mut WireReader) -> Result<Self> {
        Ok(Self {
            sequence: buf.get_u64()?,
            saved_handle: buf.get_u32()?,
            hierarchy: buf.get_u32()?,
            context_blob: buf.get_tpm2b()?,
        })
    }
}

/// TPMA_CC - command attributes as reported by `TPM_CAP_COMMANDS`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TpmaCc(pub u32);

impl TpmaCc {
    pub const COMMAND_INDEX_MASK: u32 = 0x0000_FFFF;
    pub const NV: u32 = 1 << 22;
    pub const EXTENSIVE: u32 = 1 << 23;
    pub const FLUSHED: u32 = 1 << 24;
    pub const C_HANDLES_SHIFT: u32 = 25;
    pub const C_HANDLES_MASK: u32 = 0x7 << Self::C_HANDLES_SHIFT;
    pub const R_HANDLE: u32 = 1 << 28;
    pub const V: u32 = 1 << 29;

    /// Attributes for a library command with the given handle layout
    pub fn new(command_code: u32, c_handles: u32, r_handle: bool) -> Self {
        let mut v = command_code & Self::COMMAND_INDEX_MASK;
        v |= (c_handles << Self::C_HANDLES_SHIFT) & Self::C_HANDLES_MASK;
        if r_handle {
            v |= Self::R_HANDLE;
        }
        Self(v)
    }

    pub fn command_index(self) -> u16 {
        (self.0 & Self::COMMAND_INDEX_MASK) as u16
    }

    /// Full command code; vendor commands keep the `V` bit
    pub fn command_code(self) -> u32 {
        let mut cc = self.0 & Self::COMMAND_INDEX_MASK;
        if self.0 & Self::V != 0 {
            cc |= 1 << 29;
        }
        cc
    }

    /// Number of handles in the command's handle area
    pub fn c_handles(self) -> usize {
        ((self.0 & Self::C_HANDLES_MASK) >> Self::C_HANDLES_SHIFT) as usize
    }

    /// Whether the response carries a handle
    pub fn r_handle(self) -> bool {
        self.0 & Self::R_HANDLE != 0
    }
}

impl Unmarshal for TpmaCc {
    fn unmarshal(buf: &mut WireReader) -> Result<Self> {
        buf.get_u32().map(Self)
    }
}

impl Marshal for TpmaCc {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(self.0);
    }
}

/// TPMS_TAGGED_PROPERTY
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaggedProperty {
    pub property: u32,
    pub value: u32,
}

impl Unmarshal for TaggedProperty {
    fn unmarshal(buf: &mut WireReader) -> Result<Self> {
        Ok(Self {
            property: buf.get_u32()?,
            value: buf.get_u32()?,
        })
    }
}

impl Marshal for TaggedProperty {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(self.property);
        buf.put_u32(self.value);
    }
}

/// TPMS_CAPABILITY_DATA, restricted to the capabilities a resource manager reads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapabilityData {
    Handles(Vec<u32>),
    Commands(Vec<TpmaCc>),
    TpmProperties(Vec<TaggedProperty>),
}

impl CapabilityData {
    pub fn capability(&self) -> TpmCap {
        match self {
            CapabilityData::Handles(_) => TpmCap::Handles,
            CapabilityData::Commands(_) => TpmCap::Commands,
            CapabilityData::TpmProperties(_) => TpmCap::TpmProperties,
        }
    }
}

fn unmarshal_list<T: Unmarshal>(buf: &mut WireReader) -> Result<Vec<T>> {
    let count = buf.get_u32()? as usize;
    // Each element is at least four bytes; refuse counts the buffer cannot hold.
    if count.saturating_mul(4) > buf.remaining() {
        return Err(MarshalError::Underflow {
            offset: buf.position(),
            needed: count.saturating_mul(4),
            remaining: buf.remaining(),
        });
    }
    (0..count).map(|_| T::unmarshal(buf)).collect()
}

fn marshal_list<T: Marshal>(items: &[T], buf: &mut CommandBuffer) {
    buf.put_u32(items.len() as u32);
    for item in items {
        item.marshal(buf);
    }
}

impl Unmarshal for CapabilityData {
    fn unmarshal(buf: &mut WireReader) -> Result<Self> {
        let cap = buf.get_u32()?;
        match TpmCap::from_u32(cap) {
            Some(TpmCap::Handles) => unmarshal_list(buf).map(CapabilityData::Handles),
            Some(TpmCap::Commands) => unmarshal_list(buf).map(CapabilityData::Commands),
            Some(TpmCap::TpmProperties) => unmarshal_list(buf).map(CapabilityData::TpmProperties),
            None => Err(MarshalError::BadValue {
                field: "capability",
                value: cap,
            }),
        }
    }
}

impl Marshal for CapabilityData {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(self.capability().to_u32());
        match self {
            CapabilityData::Handles(v) => marshal_list(v, buf),
            CapabilityData::Commands(v) => marshal_list(v, buf),
            CapabilityData::TpmProperties(v) => marshal_list(v, buf),
        }
    }
}

/// Object attributes of a TPM2B_PUBLIC (or TPM2B_TEMPLATE) parameter
///
/// Only the fixed-position prefix is decoded: size, type, nameAlg,
/// objectAttributes.
pub fn public_object_attributes(buf: &mut WireReader) -> Result<TpmaObject> {
    let size = buf.get_u16()? as usize;
    let mut public = WireReader::new(buf.peek_bytes(size)?);
    buf.skip(size)?;
    let _object_type = public.get_u16()?;
    let _name_alg = public.get_u16()?;
    public.get_u32().map(TpmaObject)
}
