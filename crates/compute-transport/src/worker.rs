//! Worker handshake: let a spawned process open its own socket back to the
//! agent that launched it.
//!
//! The agent binds a loopback listener, hands the child its address in
//! [`WORKER_IPC_ENV_VAR`], and relays the single connection the child makes
//! over a channel of the agent's own socket.

use std::net::{Ipv4Addr, SocketAddr};

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::{
    channel::ComputeChannel,
    error::{SocketError, SocketResult},
    socket::{ComputeSocket, SocketConfig},
};

/// Environment variable carrying the worker bridge address.
pub const WORKER_IPC_ENV_VAR: &str = "COMPUTE_WORKER_IPC";

/// Agent side of the handshake.
#[derive(Debug)]
pub struct WorkerBridge {
    listener: TcpListener,
    address: SocketAddr,
}

impl WorkerBridge {
    /// Bind a listener on an ephemeral loopback port.
    ///
    /// # Errors
    /// Returns `Io` if the listener cannot be bound.
    pub async fn bind() -> SocketResult<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let address = listener.local_addr()?;
        Ok(Self { listener, address })
    }

    /// Address to export to the child.
    #[must_use]
    pub const fn address(&self) -> SocketAddr {
        self.address
    }

    /// Accept one worker connection and relay it over `channel` until both
    /// directions finish.
    ///
    /// If `cancel` fires before a worker connects, the channel is closed and
    /// the bridge returns. An established relay is not interrupted.
    ///
    /// # Errors
    /// Returns `Io` if accepting or relaying fails.
    pub async fn serve(self, mut channel: ComputeChannel, cancel: CancellationToken) -> SocketResult<()> {
        let channel_id = channel.id();
        let accepted = tokio::select! {
            () = cancel.cancelled() => None,
            accepted = self.listener.accept() => Some(accepted?),
        };
        let Some((mut stream, peer)) = accepted else {
            channel.close();
            tracing::debug!(channel_id, "No worker connected");
            return Ok(());
        };
        stream.set_nodelay(true)?;
        tracing::debug!(channel_id, %peer, "Worker connected");

        let mut relay = channel.into_stream();
        let (up, down) = tokio::io::copy_bidirectional(&mut stream, &mut relay).await?;
        tracing::debug!(channel_id, up, down, "Worker disconnected");
        Ok(())
    }
}

/// Connect to a worker bridge at `address`.
///
/// # Errors
/// Returns `Io` if the connection fails.
pub async fn connect(address: &str, config: SocketConfig) -> SocketResult<ComputeSocket> {
    let stream = TcpStream::connect(address).await?;
    stream.set_nodelay(true)?;
    Ok(ComputeSocket::with_config(stream, config))
}

/// Connect to the agent that launched this process.
///
/// # Errors
/// Returns `MissingWorkerAddress` if [`WORKER_IPC_ENV_VAR`] is unset, or `Io`
/// if the connection fails.
pub async fn connect_from_env(config: SocketConfig) -> SocketResult<ComputeSocket> {
    let address = std::env::var(WORKER_IPC_ENV_VAR)
        .map_err(|_| SocketError::MissingWorkerAddress(WORKER_IPC_ENV_VAR))?;
    connect(&address, config).await
}
