use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use futures::future::join_all;
use log::info;
use tokio_util::sync::CancellationToken;

use crate::blockchain::{ChainEngine, ChainLock, MemoryChain};
use crate::codec::Checksum256;
use crate::config::NetConfig;
use crate::network::{Network, OutConnection};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug, Clone, Default)]
pub struct NetArgs {
    /// JSON config file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Peer to dial as host:port (repeatable, replaces configured peers)
    #[arg(short, long = "peer")]
    pub peers: Vec<String>,

    /// SOCKS5 proxy as host:port
    #[arg(long)]
    pub socks5_proxy: Option<String>,

    /// Blocks per ranged sync request
    #[arg(long)]
    pub sync_fetch_span: Option<u32>,
}

impl NetArgs {
    /// Config file (or defaults) with command line overrides applied.
    pub fn load_config(&self) -> Result<NetConfig> {
        let mut config = match &self.config {
            Some(path) => NetConfig::load(path)?,
            None => NetConfig::default(),
        };
        if !self.peers.is_empty() {
            config.peers = self.peers.clone();
        }
        if let Some(proxy) = &self.socks5_proxy {
            config.socks5_proxy = Some(proxy.clone());
        }
        if let Some(span) = self.sync_fetch_span {
            config.sync_fetch_span = span;
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Sync blocks from the fastest peer until interrupted
    Run {
        #[command(flatten)]
        net: NetArgs,

        /// Start from a trusted head instead of genesis (needs --head-id)
        #[arg(long, requires = "head_id")]
        head_num: Option<u32>,

        /// Hex id of the trusted head
        #[arg(long)]
        head_id: Option<String>,
    },

    /// Dial every peer once and report its latency
    Probe {
        #[command(flatten)]
        net: NetArgs,
    },

    /// Print the effective configuration
    Config {
        #[command(flatten)]
        net: NetArgs,
    },
}

fn memory_chain(config: &NetConfig, head: Option<(u32, &str)>) -> Result<MemoryChain> {
    let chain_id = config.chain_id()?;
    match head {
        Some((num, id)) => {
            let id = Checksum256::from_hex(id).map_err(|e| anyhow!("invalid --head-id: {}", e))?;
            Ok(MemoryChain::from_snapshot(chain_id, num, id))
        }
        None => Ok(MemoryChain::new(chain_id)),
    }
}

pub async fn handle_command(cli: Cli, shutdown: CancellationToken) -> Result<()> {
    match cli.command {
        Commands::Run { net, head_num, head_id } => {
            let config = Arc::new(net.load_config()?);
            if config.peers.is_empty() {
                return Err(anyhow!("no peers configured"));
            }
            let head = head_num.zip(head_id.as_deref());
            let chain: Arc<dyn ChainEngine> = Arc::new(memory_chain(&config, head)?);
            let chain_lock: ChainLock = Arc::new(tokio::sync::RwLock::new(()));
            info!(
                "starting sync at block {} with {} peer(s)",
                chain.head_block_num(),
                config.peers.len()
            );

            let network = Arc::new(Network::new(chain.clone(), Some(chain_lock), config, shutdown));
            network.run().await;
            info!("stopped at block {}", chain.head_block_num());
            Ok(())
        }

        Commands::Probe { net } => {
            let config = Arc::new(net.load_config()?);
            let chain: Arc<dyn ChainEngine> = Arc::new(memory_chain(&config, None)?);
            let peers: Vec<OutConnection> = config
                .peers
                .iter()
                .map(|peer| OutConnection::new(peer, chain.clone(), None, config.clone(), shutdown.clone()))
                .collect::<Result<_, _>>()?;

            let results = join_all(peers.iter().map(|peer| peer.connect())).await;
            for (peer, ok) in peers.iter().zip(results) {
                if ok {
                    info!("{}: {:?}", peer.peer(), peer.connection().latency().await);
                } else {
                    info!("{}: unreachable", peer.peer());
                }
                peer.connection().close().await;
            }
            Ok(())
        }

        Commands::Config { net } => {
            let config = net.load_config()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
