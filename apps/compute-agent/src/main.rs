//! Remote compute agent.
//!
//! Run with: cargo run -p compute-agent -- --sandbox ./sandbox
//!
//! Every accepted TCP connection becomes a socket whose root channel is
//! served by the dispatch handler.

mod config;

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::Parser;
use compute_buffer::BufferOptions;
use compute_core::{BlobStorage, ProcessLauncher};
use compute_exec::TokioLauncher;
use compute_protocol::{AgentConfig, ComputeHandler, ProtocolError};
use compute_storage::{FileStorage, MemoryStorage};
use compute_transport::{ComputeSocket, SocketConfig};
use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use crate::config::{Args, Settings};

/// State shared by every connection.
#[derive(Clone)]
struct AgentState {
    sandbox: PathBuf,
    storage: Arc<dyn BlobStorage>,
    launcher: Arc<dyn ProcessLauncher>,
    channel_options: BufferOptions,
    socket: SocketConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let settings = Settings::resolve(Args::parse())?;
    tokio::fs::create_dir_all(&settings.sandbox)
        .await
        .with_context(|| format!("creating sandbox {}", settings.sandbox.display()))?;
    let sandbox = tokio::fs::canonicalize(&settings.sandbox).await?;

    let storage: Arc<dyn BlobStorage> = match &settings.storage {
        Some(dir) => Arc::new(
            FileStorage::open(dir)
                .await
                .with_context(|| format!("opening blob store {}", dir.display()))?,
        ),
        None => Arc::new(MemoryStorage::new()),
    };
    let state = AgentState {
        launcher: Arc::new(TokioLauncher::new(&sandbox)),
        sandbox,
        storage,
        channel_options: settings.channel_options,
        socket: settings.socket,
    };

    let listener = TcpListener::bind(settings.listen)
        .await
        .with_context(|| format!("binding {}", settings.listen))?;
    tracing::info!(
        listen = %settings.listen,
        sandbox = %state.sandbox.display(),
        persistent = settings.storage.is_some(),
        "Agent listening"
    );

    let shutdown = CancellationToken::new();
    let mut connections = JoinSet::new();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                result.context("waiting for Ctrl-C")?;
                tracing::info!(live = connections.len(), "Shutting down");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    connections.spawn(serve_connection(
                        stream,
                        peer,
                        state.clone(),
                        shutdown.child_token(),
                    ));
                }
                Err(err) => tracing::warn!(%err, "Accept failed"),
            },
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(err) = joined {
                    tracing::error!(%err, "Connection task panicked");
                }
            }
        }
    }

    shutdown.cancel();
    while connections.join_next().await.is_some() {}
    Ok(())
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    state: AgentState,
    shutdown: CancellationToken,
) {
    let connection_id = Uuid::new_v4();
    if let Err(err) = stream.set_nodelay(true) {
        tracing::debug!(%connection_id, %err, "Failed to set TCP_NODELAY");
    }
    tracing::info!(%connection_id, %peer, "Connection opened");

    let socket = ComputeSocket::with_config(stream, state.socket);
    let config = AgentConfig {
        sandbox: state.sandbox,
        channel_options: state.channel_options,
        ..AgentConfig::default()
    };
    let handler = ComputeHandler::new(socket.clone(), state.storage, state.launcher, config)
        .with_cancellation(shutdown);

    let result = match handler.serve_root() {
        Ok(serving) => serving.await,
        Err(err) => Err(err),
    };
    socket.close().await;

    match result {
        Ok(()) => tracing::info!(%connection_id, "Connection closed"),
        Err(ProtocolError::Cancelled) => {
            tracing::info!(%connection_id, "Connection closed on shutdown");
        }
        Err(err) => tracing::warn!(%connection_id, %err, "Connection failed"),
    }
}
