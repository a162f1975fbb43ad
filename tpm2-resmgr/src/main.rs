// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tpm2::{SimulatorTransport, TpmDevice, TpmTransport};
use tpm2_resmgr::{Args, ResourceManager, Server};
use tracing::info;

fn open_transport(args: &Args) -> Result<Box<dyn TpmTransport + Send>> {
    if let Some((host, port)) = args.simulator_endpoint()? {
        let sim = SimulatorTransport::connect(&host, port)?;
        info!(addr = sim.addr(), "using TPM simulator");
        return Ok(Box::new(sim));
    }
    let device = match &args.device {
        Some(path) => TpmDevice::open(path)?,
        None => TpmDevice::detect()?,
    };
    info!(path = device.path(), "using TPM device");
    Ok(Box::new(device))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    {
        use tracing_subscriber::{fmt, EnvFilter};
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
        fmt().with_env_filter(filter).init();
    }

    let config = args.resource_manager_config();
    let transport = open_transport(&args)?;
    let manager =
        tokio::task::spawn_blocking(move || ResourceManager::initialize(transport, config))
            .await?
            .context("failed to initialize the resource manager")?;

    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    Server::new(manager).serve(listener).await
}
