// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Module transports and command/response framing
//!
//! Provides the [`TpmTransport`] abstraction over a module plus the
//! character-device implementation (`/dev/tpm0`, `/dev/tpmrm0`).

use anyhow::{bail, Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

use super::constants::*;
use super::marshal::*;

/// Maximum TPM response size read from a character device
const TPM_MAX_RESPONSE_SIZE: usize = 4096;

/// Size of a command or response header: tag (2) + size (4) + code (4)
pub const HEADER_SIZE: usize = 10;

/// A byte-level channel to a TPM
///
/// `transmit` sends one complete command and blocks until the complete
/// response has been read.
pub trait TpmTransport {
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>>;

    /// Select the locality for subsequent commands. Transports that cannot
    /// change locality ignore the request.
    fn set_locality(&mut self, _locality: u8) -> Result<()> {
        Ok(())
    }
}

impl<T: TpmTransport + ?Sized> TpmTransport for Box<T> {
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        (**self).transmit(command)
    }

    fn set_locality(&mut self, locality: u8) -> Result<()> {
        (**self).set_locality(locality)
    }
}

/// Character device transport (`/dev/tpm0` or `/dev/tpmrm0`)
pub struct TpmDevice {
    file: File,
    path: String,
}

impl TpmDevice {
    /// `path` may carry a `device:` prefix, as TCTI strings do
    pub fn open(path: &str) -> Result<Self> {
        let path = path.strip_prefix("device:").unwrap_or(path);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("failed to open TPM device {path}"))?;
        Ok(Self {
            file,
            path: path.to_owned(),
        })
    }

    /// Open the first TPM character device present. The raw device comes
    /// first: a resource manager has to own the module exclusively.
    pub fn detect() -> Result<Self> {
        match ["/dev/tpm0", "/dev/tpmrm0"]
            .into_iter()
            .find(|path| Path::new(path).exists())
        {
            Some(path) => Self::open(path),
            None => bail!("no TPM character device found"),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl TpmTransport for TpmDevice {
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        self.file
            .write_all(command)
            .with_context(|| format!("failed to send command to {}", self.path))?;
        let mut response = vec![0u8; TPM_MAX_RESPONSE_SIZE];
        let len = self
            .file
            .read(&mut response)
            .with_context(|| format!("failed to read response from {}", self.path))?;
        response.truncate(len);
        Ok(response)
    }
}

/// Builds a command frame; the size field is filled in by [`finalize`]
///
/// [`finalize`]: TpmCommand::finalize
pub struct TpmCommand {
    buf: CommandBuffer,
}

impl TpmCommand {
    pub fn new(command_code: TpmCc) -> Self {
        Self::with_tag(TpmSt::NoSessions, command_code.to_u32())
    }

    /// A command carrying an authorization area
    pub fn with_sessions(command_code: TpmCc) -> Self {
        Self::with_tag(TpmSt::Sessions, command_code.to_u32())
    }

    /// Any tag and raw command code, including codes the module may not know
    pub fn with_tag(tag: TpmSt, command_code: u32) -> Self {
        let mut buf = CommandBuffer::with_capacity(256);
        buf.put_u16(tag.to_u16());
        buf.put_u32(0);
        buf.put_u32(command_code);
        Self { buf }
    }

    pub fn add_handle(&mut self, handle: u32) {
        self.buf.put_u32(handle);
    }

    pub fn add_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn add_u16(&mut self, v: u16) {
        self.buf.put_u16(v);
    }

    pub fn add_u32(&mut self, v: u32) {
        self.buf.put_u32(v);
    }

    pub fn add_tpm2b(&mut self, data: &[u8]) {
        self.buf.put_tpm2b(data);
    }

    pub fn add_tpm2b_empty(&mut self) {
        self.buf.put_tpm2b_empty();
    }

    pub fn add<M: Marshal>(&mut self, value: &M) {
        value.marshal(&mut self.buf);
    }

    /// Authorization area holding only the empty password session
    pub fn add_null_auth_area(&mut self) {
        self.add_auth_area(&[(tpm_rh::PW, TpmaSa::new())]);
    }

    /// Authorization area with an empty nonce and HMAC for each session
    pub fn add_auth_area(&mut self, sessions: &[(u32, TpmaSa)]) {
        // handle, nonce size, attributes, hmac size
        const BLOCK_SIZE: usize = 4 + 2 + 1 + 2;
        self.buf.put_u32((sessions.len() * BLOCK_SIZE) as u32);
        for (handle, attributes) in sessions {
            self.buf.put_u32(*handle);
            self.buf.put_tpm2b_empty();
            self.buf.put_u8(attributes.0);
            self.buf.put_tpm2b_empty();
        }
    }

    pub fn finalize(mut self) -> Vec<u8> {
        let size = self.buf.len() as u32;
        // Every constructor writes the header, so the size field exists
        let _ = self.buf.update_u32(2, size);
        self.buf.into_vec()
    }
}

/// A response split into its header fields and body
#[derive(Debug)]
pub struct TpmResponse {
    pub tag: TpmSt,
    pub response_code: u32,
    /// Everything after the header, up to the declared size
    pub data: Vec<u8>,
}

impl TpmResponse {
    pub fn parse(response: &[u8]) -> Result<Self, MarshalError> {
        let mut reader = WireReader::new(response);
        let raw_tag = reader.get_u16()?;
        let tag = TpmSt::from_u16(raw_tag).ok_or(MarshalError::BadTag(raw_tag))?;
        let size = reader.get_u32()? as usize;
        if size < HEADER_SIZE || size > response.len() {
            return Err(MarshalError::SizeMismatch {
                declared: size,
                actual: response.len(),
            });
        }
        let response_code = reader.get_u32()?;
        Ok(Self {
            tag,
            response_code,
            data: response[HEADER_SIZE..size].to_vec(),
        })
    }

    /// Header-only response carrying `response_code`
    pub fn error_bytes(response_code: u32) -> Vec<u8> {
        let mut buf = CommandBuffer::with_capacity(HEADER_SIZE);
        buf.put_u16(TpmSt::NoSessions.to_u16());
        buf.put_u32(HEADER_SIZE as u32);
        buf.put_u32(response_code);
        buf.into_vec()
    }

    pub fn is_success(&self) -> bool {
        self.response_code == tpm_rc::SUCCESS
    }

    pub fn data_buffer(&self) -> WireReader<'_> {
        WireReader::new(&self.data)
    }
}
