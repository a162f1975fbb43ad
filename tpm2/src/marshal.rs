// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! Wire codec for TPM 2.0 structures
//!
//! Everything on the wire is big-endian. Readers never panic on short input;
//! they return a [`MarshalError`] describing where the buffer ran out.

use thiserror::Error;

/// Decoding failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MarshalError {
    #[error("buffer underflow at offset {offset}: need {needed} bytes, {remaining} remaining")]
    Underflow {
        offset: usize,
        needed: usize,
        remaining: usize,
    },
    #[error("invalid tag 0x{0:04x}")]
    BadTag(u16),
    #[error("declared size {declared} does not match buffer length {actual}")]
    SizeMismatch { declared: usize, actual: usize },
    #[error("unexpected value 0x{value:x} for {field}")]
    BadValue { field: &'static str, value: u32 },
}

pub type Result<T, E = MarshalError> = std::result::Result<T, E>;

/// Growable big-endian writer
#[derive(Debug, Default)]
pub struct CommandBuffer {
    data: Vec<u8>,
}

impl CommandBuffer {
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
        }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.data.push(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// `u16` length followed by `data`
    pub fn put_tpm2b(&mut self, data: &[u8]) {
        self.put_u16(data.len() as u16);
        self.put_bytes(data);
    }

    pub fn put_tpm2b_empty(&mut self) {
        self.put_u16(0);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    /// Patch a size field written earlier
    pub fn update_u32(&mut self, pos: usize, v: u32) -> Result<()> {
        write_u32_at(&mut self.data, pos, v)
    }
}

/// Bounds-checked big-endian reader over a command or response buffer
#[derive(Debug, Clone)]
pub struct WireReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Reader positioned at `pos`
    pub fn at(data: &'a [u8], pos: usize) -> Result<Self> {
        if pos > data.len() {
            return Err(MarshalError::Underflow {
                offset: 0,
                needed: pos,
                remaining: data.len(),
            });
        }
        Ok(Self { data, pos })
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(MarshalError::Underflow {
                offset: self.pos,
                needed: len,
                remaining: self.remaining(),
            });
        }
        let v = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(v)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take_array::<1>()?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        self.take_array().map(u16::from_be_bytes)
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        self.take_array().map(u32::from_be_bytes)
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        self.take_array().map(u64::from_be_bytes)
    }

    pub fn get_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        self.take(len).map(<[u8]>::to_vec)
    }

    /// Length-prefixed blob, copied out
    pub fn get_tpm2b(&mut self) -> Result<Vec<u8>> {
        let size = self.get_u16()? as usize;
        self.get_bytes(size)
    }

    /// Length-prefixed blob, borrowed
    pub fn get_tpm2b_slice(&mut self) -> Result<&'a [u8]> {
        let size = self.get_u16()? as usize;
        self.take(size)
    }

    /// Take everything left
    pub fn get_remaining(&mut self) -> Vec<u8> {
        let v = self.data[self.pos..].to_vec();
        self.pos = self.data.len();
        v
    }

    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.take(len).map(|_| ())
    }

    pub fn skip_tpm2b(&mut self) -> Result<()> {
        self.get_tpm2b_slice().map(|_| ())
    }

    pub fn peek_bytes(&self, len: usize) -> Result<&'a [u8]> {
        self.clone().take(len)
    }
}

/// Read a big-endian u32 at `offset`
pub fn read_u32_at(buf: &[u8], offset: usize) -> Result<u32> {
    WireReader::at(buf, offset)?.get_u32()
}

/// Overwrite the big-endian u32 at `offset`
pub fn write_u32_at(buf: &mut [u8], offset: usize, v: u32) -> Result<()> {
    let end = offset.checked_add(4).filter(|end| *end <= buf.len());
    let Some(end) = end else {
        return Err(MarshalError::Underflow {
            offset,
            needed: 4,
            remaining: buf.len().saturating_sub(offset),
        });
    };
    buf[offset..end].copy_from_slice(&v.to_be_bytes());
    Ok(())
}

/// Encoding into a [`CommandBuffer`]
pub trait Marshal {
    fn marshal(&self, buf: &mut CommandBuffer);

    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = CommandBuffer::new();
        self.marshal(&mut buf);
        buf.into_vec()
    }
}

/// Decoding from a [`WireReader`]
pub trait Unmarshal: Sized {
    fn unmarshal(buf: &mut WireReader) -> Result<Self>;

    fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut buf = WireReader::new(data);
        Self::unmarshal(&mut buf)
    }
}

macro_rules! impl_primitive {
    ($($ty:ty => $put:ident, $get:ident;)*) => {$(
        impl Marshal for $ty {
            fn marshal(&self, buf: &mut CommandBuffer) {
                buf.$put(*self);
            }
        }

        impl Unmarshal for $ty {
            fn unmarshal(buf: &mut WireReader) -> Result<Self> {
                buf.$get()
            }
        }
    )*};
}

impl_primitive! {
    u8 => put_u8, get_u8;
    u16 => put_u16, get_u16;
    u32 => put_u32, get_u32;
    u64 => put_u64, get_u64;
}
