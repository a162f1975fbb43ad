// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Module capabilities gathered once at startup

use std::collections::HashMap;

use tpm2::{TpmCc, TpmaCc};

/// Command attributes keyed by command code
#[derive(Debug, Clone, Default)]
pub struct CapabilityTable {
    commands: HashMap<u32, TpmaCc>,
}

impl CapabilityTable {
    pub fn from_attributes(attributes: impl IntoIterator<Item = TpmaCc>) -> Self {
        Self {
            commands: attributes
                .into_iter()
                .map(|attrs| (attrs.command_code(), attrs))
                .collect(),
        }
    }

    pub fn lookup(&self, command_code: u32) -> Option<TpmaCc> {
        self.commands.get(&command_code).copied()
    }

    /// Number of handles preceding the authorization area
    ///
    /// `TPM2_FlushContext` carries its handle as a parameter, but the handle
    /// still has to be translated, so it is counted here.
    pub fn handle_count(&self, command_code: u32) -> Option<usize> {
        let attrs = self.lookup(command_code)?;
        if command_code == TpmCc::FlushContext.to_u32() {
            return Some(1);
        }
        Some(attrs.c_handles())
    }

    pub fn has_response_handle(&self, command_code: u32) -> Option<bool> {
        self.lookup(command_code).map(TpmaCc::r_handle)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Fixed module limits read with `TPM2_GetCapability(TPM_CAP_TPM_PROPERTIES)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleLimits {
    pub max_command_size: u32,
    pub max_response_size: u32,
    pub active_sessions_max: u32,
    pub hr_loaded: u32,
    pub context_gap_max: u32,
}

impl ModuleLimits {
    /// Sessions the manager keeps alive before evicting the oldest
    pub fn max_active_sessions(&self) -> u32 {
        self.active_sessions_max.saturating_add(self.hr_loaded)
    }
}

impl Default for ModuleLimits {
    fn default() -> Self {
        Self {
            max_command_size: 4096,
            max_response_size: 4096,
            active_sessions_max: 64,
            hr_loaded: 0,
            context_gap_max: 0xFFFF,
        }
    }
}
