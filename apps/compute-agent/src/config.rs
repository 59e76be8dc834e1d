//! Command line and configuration file.

use std::{
    net::{Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use clap::Parser;
use compute_buffer::BufferOptions;
use compute_transport::SocketConfig;
use serde::Deserialize;

/// Default listen address.
pub const DEFAULT_LISTEN: SocketAddr = SocketAddr::new(
    std::net::IpAddr::V4(Ipv4Addr::LOCALHOST),
    7000,
);

#[derive(Debug, Default, Parser)]
#[command(name = "compute-agent", version, about = "Serve remote compute sockets over TCP")]
pub struct Args {
    /// Address to accept connections on [default: 127.0.0.1:7000].
    #[arg(long)]
    pub listen: Option<SocketAddr>,

    /// Sandbox root for file operations and processes [default: ./sandbox].
    #[arg(long)]
    pub sandbox: Option<PathBuf>,

    /// Directory of the on-disk blob store. Blobs are kept in memory if unset.
    #[arg(long)]
    pub storage: Option<PathBuf>,

    /// TOML configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

/// Contents of the configuration file. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub listen: Option<SocketAddr>,
    pub sandbox: Option<PathBuf>,
    pub storage: Option<PathBuf>,
    pub num_chunks: Option<usize>,
    pub chunk_length: Option<usize>,
    pub close_timeout_ms: Option<u64>,
}

impl FileConfig {
    /// Read and parse a configuration file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or is not valid TOML.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

/// Effective agent settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub listen: SocketAddr,
    pub sandbox: PathBuf,
    pub storage: Option<PathBuf>,
    pub channel_options: BufferOptions,
    pub socket: SocketConfig,
}

impl Settings {
    /// Load the file named by `--config`, if any, and merge it under `args`.
    ///
    /// # Errors
    /// Returns error if the configuration file cannot be loaded.
    pub fn resolve(args: Args) -> anyhow::Result<Self> {
        let file = match &args.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Ok(Self::merge(args, file))
    }

    /// Command-line values win over file values.
    #[must_use]
    pub fn merge(args: Args, file: FileConfig) -> Self {
        let mut channel_options = BufferOptions::default();
        if let Some(num_chunks) = file.num_chunks {
            channel_options = channel_options.chunks(num_chunks);
        }
        if let Some(chunk_length) = file.chunk_length {
            channel_options = channel_options.chunk_length(chunk_length);
        }

        let mut socket = SocketConfig::default();
        if let Some(ms) = file.close_timeout_ms {
            socket.close_timeout = Duration::from_millis(ms);
        }

        Self {
            listen: args.listen.or(file.listen).unwrap_or(DEFAULT_LISTEN),
            sandbox: args
                .sandbox
                .or(file.sandbox)
                .unwrap_or_else(|| PathBuf::from("sandbox")),
            storage: args.storage.or(file.storage),
            channel_options,
            socket,
        }
    }
}
