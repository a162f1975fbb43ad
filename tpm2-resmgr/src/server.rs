// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Client connections
//!
//! Clients speak the simulator's command framing: a `u32` request kind,
//! then for a command the locality byte, a `u32` length and the command
//! bytes. Responses are a `u32` length, the response bytes and a `u32`
//! zero trailer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tpm2::{sim_cmd, tss2_rc, TpmResponse, TpmTransport};
use tracing::{debug, info, warn};

use crate::manager::ResourceManager;
use crate::table::ConnectionId;

/// The manager shared by every connection; commands run one at a time
pub type SharedManager<T> = Arc<Mutex<ResourceManager<T>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Receiving,
    Dispatching,
    Responding,
    Closed,
}

pub struct ConnectionSession<S, T: TpmTransport> {
    id: ConnectionId,
    stream: S,
    manager: SharedManager<T>,
    max_command_size: usize,
    state: SessionState,
}

impl<S, T> ConnectionSession<S, T>
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: TpmTransport + Send + 'static,
{
    pub fn new(
        id: ConnectionId,
        stream: S,
        manager: SharedManager<T>,
        max_command_size: usize,
    ) -> Self {
        Self {
            id,
            stream,
            manager,
            max_command_size,
            state: SessionState::Idle,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Serve the connection until the client leaves, then release
    /// everything it owns
    pub async fn run(mut self) -> Result<()> {
        let served = self.serve().await;
        self.state = SessionState::Closed;

        let id = self.id;
        let mut manager = self.manager.clone().lock_owned().await;
        let closed = tokio::task::spawn_blocking(move || manager.close_connection(id))
            .await
            .context("connection teardown panicked")?;
        if let Err(err) = closed {
            warn!(connection = %id, error = %err, "failed to release connection resources");
        }
        served
    }

    async fn serve(&mut self) -> Result<()> {
        loop {
            self.state = SessionState::Idle;
            let kind = match self.stream.read_u32().await {
                Ok(kind) => kind,
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                    debug!(connection = %self.id, "client disconnected");
                    return Ok(());
                }
                Err(err) => return Err(err).context("failed to read request kind"),
            };
            match kind {
                sim_cmd::SEND_COMMAND => self.command().await?,
                sim_cmd::SESSION_END => {
                    debug!(connection = %self.id, "session end");
                    return Ok(());
                }
                other => bail!("unsupported request kind {other}"),
            }
        }
    }

    async fn command(&mut self) -> Result<()> {
        self.state = SessionState::Receiving;
        let locality = self.stream.read_u8().await.context("failed to read locality")?;
        let len = self.stream.read_u32().await.context("failed to read command size")? as usize;

        let response = if len > self.max_command_size {
            warn!(connection = %self.id, len, max = self.max_command_size, "command too large");
            let mut oversized = (&mut self.stream).take(len as u64);
            let drained = tokio::io::copy(&mut oversized, &mut tokio::io::sink())
                .await
                .context("failed to drain oversized command")?;
            if drained != len as u64 {
                bail!("client disconnected in the middle of a command");
            }
            TpmResponse::error_bytes(tss2_rc::TCTI_INSUFFICIENT_BUFFER)
        } else {
            let mut command = vec![0u8; len];
            self.stream
                .read_exact(&mut command)
                .await
                .context("failed to read command")?;
            self.state = SessionState::Dispatching;
            self.dispatch(locality, command).await?
        };

        self.state = SessionState::Responding;
        self.stream.write_u32(response.len() as u32).await?;
        self.stream.write_all(&response).await?;
        self.stream.write_u32(0).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn dispatch(&self, locality: u8, command: Vec<u8>) -> Result<Vec<u8>> {
        let id = self.id;
        let mut manager = self.manager.clone().lock_owned().await;
        tokio::task::spawn_blocking(move || manager.execute(id, locality, &command))
            .await
            .context("command execution panicked")
    }
}

/// Accepts clients and hands each one a [`ConnectionSession`]
pub struct Server<T: TpmTransport> {
    manager: SharedManager<T>,
    max_command_size: usize,
    next_connection: AtomicU64,
}

impl<T: TpmTransport + Send + 'static> Server<T> {
    pub fn new(manager: ResourceManager<T>) -> Self {
        let max_command_size = manager.limits().max_command_size as usize;
        Self {
            manager: Arc::new(Mutex::new(manager)),
            max_command_size,
            next_connection: AtomicU64::new(1),
        }
    }

    pub fn manager(&self) -> &SharedManager<T> {
        &self.manager
    }

    pub fn session<S>(&self, stream: S) -> ConnectionSession<S, T>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let id = ConnectionId(self.next_connection.fetch_add(1, Ordering::Relaxed));
        ConnectionSession::new(id, stream, self.manager.clone(), self.max_command_size)
    }

    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        info!(addr = %listener.local_addr()?, "listening");
        loop {
            let (stream, peer) = listener.accept().await.context("accept failed")?;
            let session = self.session(stream);
            info!(connection = %session.id(), %peer, "client connected");
            tokio::spawn(async move {
                let id = session.id();
                if let Err(err) = session.run().await {
                    warn!(connection = %id, error = ?err, "connection failed");
                }
            });
        }
    }
}
