//! Outbound dialing on top of [`Connection`].

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use openssl::ssl::{SslConnector, SslMethod};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_openssl::SslStream;
use tokio_util::sync::CancellationToken;

use crate::blockchain::{ChainEngine, ChainLock};
use crate::config::{split_host_port, NetConfig};
use crate::error::NetError;
use crate::network::connection::{BoxedReader, BoxedWriter, Connection};
use crate::network::socks5;

const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);
const TLS_PORT: u16 = 443;

pub struct OutConnection {
    conn: Arc<Connection>,
    host: String,
    port: u16,
    /// Held for the whole dial so attempts never overlap.
    dial_lock: Mutex<()>,
}

impl OutConnection {
    pub fn new(
        peer: &str,
        chain: Arc<dyn ChainEngine>,
        chain_lock: Option<ChainLock>,
        config: Arc<NetConfig>,
        shutdown: CancellationToken,
    ) -> Result<Self, NetError> {
        let (host, port) = split_host_port(peer).map_err(|e| NetError::InvalidPeerAddress(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Connection::new(peer, chain, chain_lock, config, shutdown)),
            host,
            port,
            dial_lock: Mutex::new(()),
        })
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn peer(&self) -> &str {
        self.conn.peer()
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    async fn open_tls(&self) -> Result<(BoxedReader, BoxedWriter), NetError> {
        let tls_err = |e: openssl::error::ErrorStack| NetError::Tls(e.to_string());
        let connector = SslConnector::builder(SslMethod::tls()).map_err(tls_err)?.build();
        let ssl = connector.configure().map_err(tls_err)?.into_ssl(&self.host).map_err(tls_err)?;
        let tcp = TcpStream::connect((self.host.as_str(), self.port)).await?;
        let mut stream = SslStream::new(ssl, tcp).map_err(tls_err)?;
        Pin::new(&mut stream)
            .connect()
            .await
            .map_err(|e| NetError::Tls(e.to_string()))?;
        let (reader, writer) = tokio::io::split(stream);
        Ok((Box::new(reader), Box::new(writer)))
    }

    async fn open_transport(&self) -> Result<(BoxedReader, BoxedWriter), NetError> {
        if self.port == TLS_PORT {
            return self.open_tls().await;
        }
        let stream = match &self.conn.config().socks5_proxy {
            Some(proxy) => {
                let (proxy_host, proxy_port) =
                    split_host_port(proxy).map_err(|e| NetError::InvalidPeerAddress(e.to_string()))?;
                socks5::connect(&proxy_host, proxy_port, &self.host, self.port).await?
            }
            None => TcpStream::connect((self.host.as_str(), self.port)).await?,
        };
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok((Box::new(reader), Box::new(writer)))
    }

    /// Dials the peer and probes its latency. Only a successful probe marks
    /// the connection connected and starts its heartbeat.
    pub async fn connect(&self) -> bool {
        let _dial = self.dial_lock.lock().await;
        // another caller may have finished dialing while we waited for the lock
        if self.conn.is_connected() {
            return true;
        }
        let shutdown = self.conn.shutdown_token().clone();

        self.conn.close().await;
        self.conn.reset().await;

        info!("[{}] connecting", self.peer());
        let dialed = tokio::select! {
            r = timeout(CONNECTION_TIMEOUT, self.open_transport()) => r,
            _ = shutdown.cancelled() => return false,
        };
        let (reader, writer) = match dialed {
            Ok(Ok(halves)) => halves,
            Ok(Err(e)) => {
                error!("[{}] failed to connect: {}", self.peer(), e);
                return false;
            }
            Err(_) => {
                error!("[{}] {}", self.peer(), NetError::Timeout("connection"));
                return false;
            }
        };
        self.conn.attach(reader, writer).await;

        if !self.conn.estimate_connection_latency().await {
            error!("[{}] latency probe failed", self.peer());
            self.conn.close().await;
            return false;
        }
        self.conn.set_connected(true);
        self.conn.start_heartbeat();
        info!("[{}] connected, latency {:?}", self.peer(), self.conn.latency().await);
        true
    }
}

impl std::fmt::Debug for OutConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutConnection")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("conn", &self.conn)
            .finish()
    }
}
