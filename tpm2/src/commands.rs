// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 command implementations
//!
//! This module provides the typed commands a resource manager issues on its
//! own behalf: startup, capability queries and context management.

use anyhow::Result;
use thiserror::Error;
use tracing::debug;

use super::constants::*;
use super::device::*;
use super::marshal::*;
use super::types::*;

/// Failure of a typed TPM command
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("{command:?}: transport failure")]
    Transport {
        command: TpmCc,
        #[source]
        source: anyhow::Error,
    },
    #[error("{command:?} failed: TPM rc 0x{rc:08x}")]
    Tpm { command: TpmCc, rc: u32 },
    #[error("{command:?}: malformed response")]
    Malformed {
        command: TpmCc,
        #[source]
        source: MarshalError,
    },
}

impl CommandError {
    /// TPM response code, if the module answered with one
    pub fn tpm_rc(&self) -> Option<u32> {
        match self {
            CommandError::Tpm { rc, .. } => Some(*rc),
            _ => None,
        }
    }
}

/// Pure Rust TPM context
pub struct TpmContext<T: TpmTransport = TpmDevice> {
    transport: T,
}

impl TpmContext<TpmDevice> {
    /// Create a new TPM context with the given device path
    pub fn new(tcti_path: Option<&str>) -> Result<Self> {
        let device = match tcti_path {
            Some(path) => TpmDevice::open(path)?,
            None => TpmDevice::detect()?,
        };

        Ok(Self::with_transport(device))
    }

    /// Get the device path
    pub fn device_path(&self) -> &str {
        self.transport.path()
    }
}

impl<T: TpmTransport> TpmContext<T> {
    pub fn with_transport(transport: T) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Send a client command verbatim
    pub fn transmit_raw(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        self.transport.transmit(command)
    }

    pub fn set_locality(&mut self, locality: u8) -> Result<()> {
        self.transport.set_locality(locality)
    }

    fn execute(&mut self, command: TpmCc, bytes: &[u8]) -> Result<TpmResponse, CommandError> {
        let raw = self
            .transport
            .transmit(bytes)
            .map_err(|source| CommandError::Transport { command, source })?;
        let response =
            TpmResponse::parse(&raw).map_err(|source| CommandError::Malformed { command, source })?;
        if !response.is_success() {
            debug!(
                ?command,
                rc = format_args!("0x{:08x}", response.response_code),
                "TPM command failed"
            );
            return Err(CommandError::Tpm {
                command,
                rc: response.response_code,
            });
        }
        Ok(response)
    }

    // ==================== Startup ====================

    /// TPM2_Startup
    pub fn startup(&mut self, startup_type: TpmSu) -> Result<(), CommandError> {
        let mut cmd = TpmCommand::new(TpmCc::Startup);
        cmd.add_u16(startup_type.to_u16());
        self.execute(TpmCc::Startup, &cmd.finalize())?;
        Ok(())
    }

    // ==================== Capabilities ====================

    /// TPM2_GetCapability, returning `moreData` and the decoded data
    pub fn get_capability(
        &mut self,
        capability: TpmCap,
        property: u32,
        count: u32,
    ) -> Result<(bool, CapabilityData), CommandError> {
        const COMMAND: TpmCc = TpmCc::GetCapability;

        let mut cmd = TpmCommand::new(COMMAND);
        cmd.add_u32(capability.to_u32());
        cmd.add_u32(property);
        cmd.add_u32(count);

        let response = self.execute(COMMAND, &cmd.finalize())?;
        let malformed = |source| CommandError::Malformed {
            command: COMMAND,
            source,
        };
        let mut buf = response.data_buffer();
        let more_data = buf.get_u8().map_err(malformed)? != 0;
        let data = CapabilityData::unmarshal(&mut buf).map_err(malformed)?;
        if data.capability() != capability {
            return Err(malformed(MarshalError::BadValue {
                field: "capability",
                value: data.capability().to_u32(),
            }));
        }
        Ok((more_data, data))
    }

    /// Read a single TPM property; the reply must carry exactly that property
    pub fn get_tpm_property(&mut self, property: u32) -> Result<u32, CommandError> {
        let (_, data) = self.get_capability(TpmCap::TpmProperties, property, 1)?;
        match data {
            CapabilityData::TpmProperties(props)
                if props.len() == 1 && props[0].property == property =>
            {
                Ok(props[0].value)
            }
            _ => Err(CommandError::Malformed {
                command: TpmCc::GetCapability,
                source: MarshalError::BadValue {
                    field: "tpm property",
                    value: property,
                },
            }),
        }
    }

    /// Every handle of the type that `first` belongs to
    pub fn get_handles(&mut self, first: u32) -> Result<Vec<u32>, CommandError> {
        let handle_type = first & 0xFF00_0000;
        let mut handles = Vec::new();
        let mut next = first;
        loop {
            let (more_data, data) = self.get_capability(TpmCap::Handles, next, 64)?;
            let CapabilityData::Handles(batch) = data else {
                break;
            };
            let batch: Vec<u32> = batch
                .into_iter()
                .filter(|h| h & 0xFF00_0000 == handle_type)
                .collect();
            let Some(last) = batch.last().copied() else {
                break;
            };
            handles.extend(batch);
            if !more_data {
                break;
            }
            next = last.wrapping_add(1);
        }
        Ok(handles)
    }

    /// Attributes of every command the module implements
    pub fn get_commands(&mut self) -> Result<Vec<TpmaCc>, CommandError> {
        let mut commands = Vec::new();
        let mut next = 0;
        loop {
            let (more_data, data) = self.get_capability(TpmCap::Commands, next, 128)?;
            let CapabilityData::Commands(batch) = data else {
                break;
            };
            let Some(last) = batch.last().copied() else {
                break;
            };
            commands.extend(batch);
            if !more_data {
                break;
            }
            next = last.command_code() + 1;
        }
        Ok(commands)
    }

    // ==================== Context Management ====================

    /// TPM2_ContextSave
    pub fn context_save(&mut self, handle: u32) -> Result<TpmsContext, CommandError> {
        let mut cmd = TpmCommand::new(TpmCc::ContextSave);
        cmd.add_handle(handle);

        let response = self.execute(TpmCc::ContextSave, &cmd.finalize())?;
        TpmsContext::unmarshal(&mut response.data_buffer()).map_err(|source| {
            CommandError::Malformed {
                command: TpmCc::ContextSave,
                source,
            }
        })
    }

    /// TPM2_ContextLoad, returning the handle the module assigned
    pub fn context_load(&mut self, context: &TpmsContext) -> Result<u32, CommandError> {
        let mut cmd = TpmCommand::new(TpmCc::ContextLoad);
        cmd.add(context);

        let response = self.execute(TpmCc::ContextLoad, &cmd.finalize())?;
        response
            .data_buffer()
            .get_u32()
            .map_err(|source| CommandError::Malformed {
                command: TpmCc::ContextLoad,
                source,
            })
    }

    /// Flush a context (handle)
    pub fn flush_context(&mut self, handle: u32) -> Result<(), CommandError> {
        let mut cmd = TpmCommand::new(TpmCc::FlushContext);
        cmd.add_handle(handle);

        self.execute(TpmCc::FlushContext, &cmd.finalize())?;
        Ok(())
    }
}
