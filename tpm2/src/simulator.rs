// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TCP transport for a TPM 2.0 reference simulator
//!
//! The simulator listens on two ports: the command port carries framed TPM
//! commands, the platform port (command port + 1) carries power and NV
//! signals.

use anyhow::{bail, Context, Result};
use std::io::{Read, Write};
use std::net::TcpStream;
use tracing::debug;

use super::device::TpmTransport;

/// Command-port request kinds
pub mod sim_cmd {
    pub const SIGNAL_POWER_ON: u32 = 1;
    pub const SIGNAL_NV_ON: u32 = 11;
    pub const SEND_COMMAND: u32 = 8;
    pub const SESSION_END: u32 = 20;
}

/// Upper bound accepted for a single simulator response
const MAX_RESPONSE_SIZE: u32 = 64 * 1024;

pub struct SimulatorTransport {
    command: TcpStream,
    locality: u8,
    addr: String,
}

impl SimulatorTransport {
    /// Connect to the simulator's command port at `host:port`, power it on
    /// and enable NV.
    pub fn connect(host: &str, port: u16) -> Result<Self> {
        let platform_port = port
            .checked_add(1)
            .context("simulator command port leaves no room for the platform port")?;
        let mut platform = TcpStream::connect((host, platform_port)).with_context(|| {
            format!("failed to connect to simulator platform port {host}:{platform_port}")
        })?;
        platform_signal(&mut platform, sim_cmd::SIGNAL_POWER_ON)?;
        platform_signal(&mut platform, sim_cmd::SIGNAL_NV_ON)?;

        let command = TcpStream::connect((host, port))
            .with_context(|| format!("failed to connect to simulator command port {host}:{port}"))?;
        command.set_nodelay(true)?;
        debug!(host, port, "connected to TPM simulator");

        Ok(Self {
            command,
            locality: 0,
            addr: format!("{host}:{port}"),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

fn read_u32(stream: &mut TcpStream) -> Result<u32> {
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

fn platform_signal(stream: &mut TcpStream, signal: u32) -> Result<()> {
    stream
        .write_all(&signal.to_be_bytes())
        .context("failed to send platform signal")?;
    let ack = read_u32(stream).context("failed to read platform acknowledgement")?;
    if ack != 0 {
        bail!("simulator rejected platform signal {signal}: {ack}");
    }
    Ok(())
}

impl TpmTransport for SimulatorTransport {
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        let mut frame = Vec::with_capacity(command.len() + 9);
        frame.extend_from_slice(&sim_cmd::SEND_COMMAND.to_be_bytes());
        frame.push(self.locality);
        frame.extend_from_slice(&(command.len() as u32).to_be_bytes());
        frame.extend_from_slice(command);
        self.command
            .write_all(&frame)
            .context("failed to write simulator command")?;

        let size = read_u32(&mut self.command).context("failed to read simulator response size")?;
        if size > MAX_RESPONSE_SIZE {
            bail!("simulator response too large: {size} bytes");
        }
        let mut response = vec![0u8; size as usize];
        self.command
            .read_exact(&mut response)
            .context("failed to read simulator response")?;
        let trailer = read_u32(&mut self.command).context("failed to read simulator trailer")?;
        if trailer != 0 {
            bail!("simulator reported transport status {trailer}");
        }
        Ok(response)
    }

    fn set_locality(&mut self, locality: u8) -> Result<()> {
        self.locality = locality;
        Ok(())
    }
}

impl Drop for SimulatorTransport {
    fn drop(&mut self) {
        let _ = self.command.write_all(&sim_cmd::SESSION_END.to_be_bytes());
    }
}
