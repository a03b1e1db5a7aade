//! Peer set supervision: dialing, reconnecting, and driving the receive loop
//! of the lowest-latency connected peer.

pub mod connection;
pub mod message;
pub mod metrics;
pub mod out_connection;
pub mod peer;
pub mod socks5;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use log::{error, info, warn};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::blockchain::{ChainEngine, ChainLock};
use crate::config::NetConfig;

pub use connection::{Connection, GoAwayEvent};
pub use message::Message;
pub use out_connection::OutConnection;

pub const RETRY_INTERVAL: Duration = Duration::from_secs(30);
pub const INIT_BACKOFF: Duration = Duration::from_secs(10);
/// Pause before reselecting after a receive loop ends on an open connection.
pub const RESELECT_DELAY: Duration = Duration::from_secs(3);
/// Pause before reselecting after the active transport failed.
pub const FAILURE_DELAY: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct Network {
    chain: Arc<dyn ChainEngine>,
    chain_lock: Option<ChainLock>,
    config: Arc<NetConfig>,
    shutdown: CancellationToken,
    initialized: AtomicBool,
    connections: RwLock<Vec<Arc<OutConnection>>>,
    active: RwLock<Option<Arc<OutConnection>>>,
    goaway_tx: mpsc::UnboundedSender<GoAwayEvent>,
    goaway_rx: Mutex<mpsc::UnboundedReceiver<GoAwayEvent>>,
}

impl Network {
    pub fn new(
        chain: Arc<dyn ChainEngine>,
        chain_lock: Option<ChainLock>,
        config: Arc<NetConfig>,
        shutdown: CancellationToken,
    ) -> Self {
        let (goaway_tx, goaway_rx) = mpsc::unbounded_channel();
        Self {
            chain,
            chain_lock,
            config,
            shutdown,
            initialized: AtomicBool::new(false),
            connections: RwLock::new(Vec::new()),
            active: RwLock::new(None),
            goaway_tx,
            goaway_rx: Mutex::new(goaway_rx),
        }
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Sleeps unless shutdown fires first. Returns false on shutdown.
    async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.shutdown.cancelled() => false,
        }
    }

    pub async fn add_connection(&self, conn: Arc<OutConnection>) {
        conn.connection().add_goaway_listener(self.goaway_tx.clone());
        self.connections.write().await.push(conn);
    }

    pub async fn connections(&self) -> Vec<Arc<OutConnection>> {
        self.connections.read().await.clone()
    }

    /// Creates one connection per configured peer on first use.
    pub async fn ensure_connections(&self) {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return;
        }
        for peer in &self.config.peers {
            match OutConnection::new(
                peer,
                self.chain.clone(),
                self.chain_lock.clone(),
                self.config.clone(),
                self.shutdown.clone(),
            ) {
                Ok(conn) => self.add_connection(Arc::new(conn)).await,
                Err(e) => error!("skip peer {}: {}", peer, e),
            }
        }
    }

    async fn connect_disconnected(&self) {
        let pending: Vec<_> = self
            .connections()
            .await
            .into_iter()
            .filter(|conn| !conn.is_connected())
            .collect();
        join_all(pending.iter().map(|conn| conn.connect())).await;
    }

    /// Redials disconnected peers every [`RETRY_INTERVAL`] until shutdown.
    pub async fn retry_connection(self: Arc<Self>) {
        while self.sleep(RETRY_INTERVAL).await {
            self.drain_goaway().await;
            self.connect_disconnected().await;
        }
        info!("retry connection task exit");
    }

    /// Dials until at least one peer is connected. Returns false on shutdown.
    pub async fn init(&self) -> bool {
        self.ensure_connections().await;
        loop {
            if self.shutdown.is_cancelled() {
                return false;
            }
            self.drain_goaway().await;
            self.connect_disconnected().await;
            if self.connections.read().await.iter().any(|conn| conn.is_connected()) {
                return true;
            }
            warn!("no peer connected, retry in {:?}", INIT_BACKOFF);
            if !self.sleep(INIT_BACKOFF).await {
                return false;
            }
        }
    }

    async fn fastest_connected(&self) -> Option<Arc<OutConnection>> {
        let mut best: Option<(Duration, Arc<OutConnection>)> = None;
        for conn in self.connections().await {
            if !conn.is_connected() {
                continue;
            }
            let latency = conn.connection().latency().await;
            if best.as_ref().map_or(true, |(fastest, _)| latency < *fastest) {
                best = Some((latency, conn));
            }
        }
        best.map(|(_, conn)| conn)
    }

    /// The connected peer with the lowest measured latency, dialing again if
    /// none is connected. `None` only on shutdown.
    pub async fn get_fastest_connection(&self) -> Option<Arc<OutConnection>> {
        loop {
            self.drain_goaway().await;
            if let Some(conn) = self.fastest_connected().await {
                return Some(conn);
            }
            if !self.init().await {
                return None;
            }
        }
    }

    /// Waits up to `timeout` for an active connection.
    pub async fn get_connection(&self, timeout: Duration) -> Option<Arc<OutConnection>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(conn) = self.active.read().await.clone() {
                return Some(conn);
            }
            if Instant::now() >= deadline || !self.sleep(POLL_INTERVAL).await {
                return None;
            }
        }
    }

    /// Drops a peer that told us to go away.
    pub async fn on_goaway(&self, event: &GoAwayEvent) {
        warn!("peer {} sent go away: {:?}", event.peer, event.message.reason);
        let removed = {
            let mut connections = self.connections.write().await;
            let before = connections.len();
            connections.retain(|conn| conn.peer() != event.peer);
            before != connections.len()
        };
        let mut active = self.active.write().await;
        if active.as_ref().map_or(false, |conn| conn.peer() == event.peer) {
            *active = None;
        }
        if removed {
            info!("removed peer {}", event.peer);
        }
    }

    async fn drain_goaway(&self) {
        let events: Vec<GoAwayEvent> = {
            let mut rx = self.goaway_rx.lock().await;
            std::iter::from_fn(|| rx.try_recv().ok()).collect()
        };
        for event in &events {
            self.on_goaway(event).await;
        }
    }

    async fn main_loop(&self) {
        while !self.shutdown.is_cancelled() {
            let Some(conn) = self.get_fastest_connection().await else {
                break;
            };
            info!(
                "sync from {} (latency {:?})",
                conn.peer(),
                conn.connection().latency().await
            );
            *self.active.write().await = Some(conn.clone());
            conn.connection().handle_messages().await;
            *self.active.write().await = None;

            let pause = if conn.connection().is_closed() {
                FAILURE_DELAY
            } else {
                RESELECT_DELAY
            };
            if !self.sleep(pause).await {
                break;
            }
        }
    }

    /// Runs until shutdown, then closes every connection.
    pub async fn run(self: Arc<Self>) {
        self.ensure_connections().await;
        let retry = tokio::spawn(self.clone().retry_connection());

        self.main_loop().await;

        self.shutdown.cancel();
        if let Err(e) = retry.await {
            error!("retry connection task failed: {}", e);
        }
        for conn in self.connections().await {
            conn.connection().close().await;
        }
        info!("network exit");
    }
}
