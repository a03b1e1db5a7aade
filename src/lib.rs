/*!
Peersync - a peer-to-peer block synchronization client

This crate downloads blocks from a set of peers over a length-prefixed binary
protocol and feeds them, in order, into a chain engine. It keeps one
connection per configured peer, measures their latency, and syncs from the
fastest one while reconnecting the rest in the background.

# Main Components

- `codec`: binary packing primitives and fixed-size wire types
- `network`: wire messages, the per-peer protocol engine, dialing and peer supervision
- `blockchain`: the chain engine interface, block header decoding and an in-memory engine
- `config`: JSON configuration
- `cli`: command-line interface

# Example Usage

```no_run
use std::sync::Arc;
use peersync::{Checksum256, MemoryChain, NetConfig, Network};
use tokio_util::sync::CancellationToken;

# async fn example() {
let config = NetConfig {
    peers: vec!["127.0.0.1:9876".to_string()],
    ..NetConfig::default()
};
let chain = Arc::new(MemoryChain::new(Checksum256::empty()));
let network = Arc::new(Network::new(chain, None, Arc::new(config), CancellationToken::new()));
network.run().await;
# }
```
*/

/// Binary packing primitives shared by wire messages and block headers.
pub mod codec;

/// Error types for decoding, transport and the chain engine.
pub mod error;

/// Network configuration.
pub mod config;

/// Chain engine interface and block header decoding.
pub mod blockchain;

/// Wire protocol, connections and peer supervision.
pub mod network;

/// Command-line interface.
pub mod cli;

#[cfg(test)]
mod testing;

pub use blockchain::{BlockHeader, ChainEngine, ChainLock, MemoryChain};
pub use codec::Checksum256;
pub use config::NetConfig;
pub use error::{ChainError, CodecError, NetError};
pub use network::{Connection, GoAwayEvent, Message, Network, OutConnection};
