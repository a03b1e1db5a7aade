//! Network configuration, loaded from a JSON file and overridable from the command line.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::codec::Checksum256;
use crate::network::message::NET_VERSION_BASE;

pub const DEFAULT_SYNC_FETCH_SPAN: u32 = 300;
pub const DEFAULT_P2P_ADDRESS: &str = "127.0.0.1:9876";
pub const DEFAULT_AGENT: &str = "EOS Agent";

fn default_sync_fetch_span() -> u32 {
    DEFAULT_SYNC_FETCH_SPAN
}

fn default_p2p_address() -> String {
    DEFAULT_P2P_ADDRESS.to_string()
}

fn default_agent() -> String {
    DEFAULT_AGENT.to_string()
}

fn default_network_version() -> u16 {
    NET_VERSION_BASE + 7
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetConfig {
    /// Peers to dial, as `host:port`.
    #[serde(default)]
    pub peers: Vec<String>,
    /// SOCKS5 proxy for plain TCP peers, as `host:port`.
    #[serde(default)]
    pub socks5_proxy: Option<String>,
    /// Blocks asked for per ranged sync request.
    #[serde(default = "default_sync_fetch_span")]
    pub sync_fetch_span: u32,
    /// Address advertised in handshakes.
    #[serde(default = "default_p2p_address")]
    pub p2p_address: String,
    #[serde(default = "default_agent")]
    pub agent: String,
    #[serde(default = "default_network_version")]
    pub network_version: u16,
    /// Hex chain id for the in-memory chain engine.
    #[serde(default)]
    pub chain_id: Option<String>,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            peers: Vec::new(),
            socks5_proxy: None,
            sync_fetch_span: DEFAULT_SYNC_FETCH_SPAN,
            p2p_address: default_p2p_address(),
            agent: default_agent(),
            network_version: default_network_version(),
            chain_id: None,
        }
    }
}

impl NetConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let config: NetConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sync_fetch_span == 0 {
            return Err(anyhow!("sync_fetch_span must be at least 1"));
        }
        for peer in &self.peers {
            split_host_port(peer)?;
        }
        if let Some(proxy) = &self.socks5_proxy {
            split_host_port(proxy).context("invalid socks5_proxy")?;
        }
        self.chain_id()?;
        Ok(())
    }

    pub fn chain_id(&self) -> Result<Checksum256> {
        match &self.chain_id {
            Some(hex) => Checksum256::from_hex(hex).map_err(|e| anyhow!("invalid chain_id: {}", e)),
            None => Ok(Checksum256::empty()),
        }
    }
}

/// Splits `host:port`, accepting bracketed IPv6 hosts.
pub fn split_host_port(addr: &str) -> Result<(String, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("peer address {:?} is not host:port", addr))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(anyhow!("peer address {:?} has an empty host", addr));
    }
    let port = port
        .parse::<u16>()
        .with_context(|| format!("peer address {:?} has an invalid port", addr))?;
    Ok((host.to_string(), port))
}
