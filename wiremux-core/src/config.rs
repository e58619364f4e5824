//! Configuration for the wiremux dispatcher.
//!
//! A config file describes one server block: the sockets to accept clients
//! on, the single upstream target to multiplex onto, and the admission and
//! framing limits. TOML and JSON are both accepted; the parser is selected
//! by file extension.

use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
};

#[cfg(unix)]
use std::os::unix::prelude::OsStrExt;

use anyhow::{bail, Context};
use bytes::{Bytes, BytesMut};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

// MAX configuration file size: 16 MB
const MAX_CONFIG_FILE_SIZE: usize = 16 * 1024 * 1024;
// Read buffer size: 8 KB
const READ_BUFFER_SIZE: usize = 8 * 1024;

const DEFAULT_MAX_CONNECTIONS: usize = 1024;
// Default frame size cap: 1 MB
const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listeners: Vec<ListenerSpec>,
    pub upstream: Endpoint,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ListenerSpec {
    SocketAddress(SocketAddress),
    Uds(Uds),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Endpoint {
    SocketAddress(SocketAddress),
    Uds(Uds),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SocketAddress {
    pub socket_addr: SocketAddr,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Uds {
    pub uds_path: PathBuf,
}

fn default_max_connections() -> usize {
    DEFAULT_MAX_CONNECTIONS
}

fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

impl Config {
    pub async fn load(path: impl AsRef<Path>) -> anyhow::Result<Config> {
        let config: Config = parse(parse_extension(&path), &read_file(path).await?)?;
        if config.server.listeners.is_empty() {
            bail!("Config: at least one listener is required");
        }
        if config.server.max_connections == 0 {
            bail!("Config: max_connections must be positive");
        }
        Ok(config)
    }
}

pub(crate) fn parse<T: DeserializeOwned>(extension: String, raw: &Bytes) -> anyhow::Result<T> {
    match extension.as_str() {
        "json" => serde_json::from_slice(raw).context("Config: invalid json"),
        "toml" => {
            let content = std::str::from_utf8(raw).context("Config: file is not utf-8")?;
            toml::from_str(content).context("Config: invalid toml")
        }
        other => bail!("Config: no parser available for config format {other}"),
    }
}

async fn read_file(path: impl AsRef<Path>) -> anyhow::Result<Bytes> {
    let mut data = BytesMut::new();

    let file = match monoio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) => bail!("Config: error open file: {:?}", e),
    };

    let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);
    let mut current: u64 = 0;

    loop {
        let (res, buf) = file.read_at(buffer, current).await;
        let n = res?;
        buffer = buf;

        if data.len() + n > MAX_CONFIG_FILE_SIZE {
            bail!("Config: max file size: {}", MAX_CONFIG_FILE_SIZE);
        }

        data.extend_from_slice(&buffer[..n]);

        if n < READ_BUFFER_SIZE {
            break;
        }

        current += n as u64;
        buffer.clear();
    }

    Ok(Bytes::from(data))
}

#[cfg(unix)]
fn parse_extension(path: &impl AsRef<Path>) -> String {
    let extension = path
        .as_ref()
        .extension()
        .unwrap_or_default()
        .as_bytes()
        .to_ascii_lowercase();
    String::from_utf8(extension).unwrap_or_default()
}

#[cfg(not(unix))]
fn parse_extension(path: &impl AsRef<Path>) -> String {
    path.as_ref()
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase()
}
