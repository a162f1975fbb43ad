// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Command line and environment configuration

use std::net::SocketAddr;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "TPM 2.0 resource manager daemon", long_about = None)]
pub struct Args {
    /// Address clients connect to
    #[arg(short, long, env = "TPM2_RESMGR_LISTEN", default_value = "127.0.0.1:2323")]
    pub listen: SocketAddr,

    /// TPM character device; /dev/tpm0 then /dev/tpmrm0 when not given
    #[arg(short, long, env = "TPM2_RESMGR_DEVICE")]
    pub device: Option<String>,

    /// TPM simulator command port as host:port; the platform port is the
    /// next one up
    #[arg(long, env = "TPM2_RESMGR_SIMULATOR", conflicts_with = "device")]
    pub simulator: Option<String>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, env = "TPM2_RESMGR_LOG", default_value = "info")]
    pub log_level: String,

    /// Skip the check for transient objects left loaded after each command
    #[arg(long)]
    pub no_residual_audit: bool,

    /// Override the active session limit reported by the module
    #[arg(long, env = "TPM2_RESMGR_MAX_ACTIVE_SESSIONS")]
    pub max_active_sessions: Option<u32>,

    /// Override the context gap limit reported by the module
    #[arg(long, env = "TPM2_RESMGR_GAP_MAX")]
    pub gap_max: Option<u32>,

    /// Cap on fresh virtual handles issued per kind (objects, sessions)
    #[arg(long, env = "TPM2_RESMGR_VIRTUAL_HANDLES")]
    pub virtual_handles: Option<u32>,
}

impl Args {
    pub fn resource_manager_config(&self) -> ResourceManagerConfig {
        ResourceManagerConfig {
            residual_audit: !self.no_residual_audit,
            max_active_sessions: self.max_active_sessions,
            gap_max: self.gap_max,
            virtual_handles: self.virtual_handles,
        }
    }

    /// Split the simulator address into host and command port
    pub fn simulator_endpoint(&self) -> anyhow::Result<Option<(String, u16)>> {
        let Some(addr) = &self.simulator else {
            return Ok(None);
        };
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| anyhow::anyhow!("simulator address must be host:port, got {addr}"))?;
        let port = port
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid simulator port in {addr}"))?;
        Ok(Some((host.to_string(), port)))
    }
}

/// Manager policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceManagerConfig {
    /// Query the module for leftover transient objects after every command
    pub residual_audit: bool,
    pub max_active_sessions: Option<u32>,
    pub gap_max: Option<u32>,
    /// Fresh virtual handles per kind; the full 20-bit index space when unset
    pub virtual_handles: Option<u32>,
}

impl Default for ResourceManagerConfig {
    fn default() -> Self {
        Self {
            residual_audit: true,
            max_active_sessions: None,
            gap_max: None,
            virtual_handles: None,
        }
    }
}
