//! Per-peer protocol engine.
//!
//! A `Connection` owns one transport at a time and runs the sync protocol
//! over it: handshakes, time probes, ranged sync requests, inbound block
//! ingestion and outbound block serving. The transport is split so the
//! receive loop owns the read half while the heartbeat task and the sync
//! responder share the write half.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{debug, error, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::blockchain::{make_block_id, BlockHeader, ChainEngine, ChainLock};
use crate::codec::{Checksum256, Packable, PublicKey, Signature};
use crate::config::NetConfig;
use crate::error::{ChainError, CodecError, NetError};
use crate::network::message::{
    GoAwayMessage, GoAwayReason, HandshakeMessage, IdListMode, Message, NoticeMessage,
    OrderedIds, RequestMessage, SyncRequestMessage, TimeMessage, MAX_PACKAGE_SIZE,
    MIN_PACKAGE_SIZE,
};
use crate::network::metrics::SyncMetrics;
use crate::network::peer::PeerState;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Peers whose head is within this many blocks of ours are considered in step.
pub const DEFAULT_BLOCK_LATENCY: u32 = 1;
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const LATENCY_PROBE_TIMEOUT: Duration = Duration::from_secs(30);
/// Push statistics are only requested for blocks younger than this.
const STATISTICS_MAX_BLOCK_AGE_MS: i64 = 60_000;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

pub(crate) fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}

fn now_ms() -> i64 {
    now_ns() / 1_000_000
}

/// Published to listeners when a peer sends a go-away message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoAwayEvent {
    pub peer: String,
    pub message: GoAwayMessage,
}

/// Background block responder for the peer's current sync request.
struct SyncResponder {
    cancel: CancellationToken,
    _handle: JoinHandle<()>,
}

pub struct Connection {
    peer: String,
    chain: Arc<dyn ChainEngine>,
    chain_lock: Option<ChainLock>,
    config: Arc<NetConfig>,
    /// Process-wide exit signal.
    shutdown: CancellationToken,
    /// Cancelled when the current transport is closed; replaced on attach.
    transport_token: std::sync::Mutex<CancellationToken>,
    connected: AtomicBool,
    closed: AtomicBool,
    reader: Mutex<Option<BoxedReader>>,
    writer: Mutex<Option<BoxedWriter>>,
    state: Mutex<PeerState>,
    metrics: Mutex<SyncMetrics>,
    heartbeat_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    sync_responder: std::sync::Mutex<Option<SyncResponder>>,
    goaway_listeners: std::sync::Mutex<Vec<mpsc::UnboundedSender<GoAwayEvent>>>,
}

impl Connection {
    pub fn new(
        peer: impl Into<String>,
        chain: Arc<dyn ChainEngine>,
        chain_lock: Option<ChainLock>,
        config: Arc<NetConfig>,
        shutdown: CancellationToken,
    ) -> Self {
        let transport_token = shutdown.child_token();
        Self {
            peer: peer.into(),
            chain,
            chain_lock,
            config,
            shutdown,
            transport_token: std::sync::Mutex::new(transport_token),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(true),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            state: Mutex::new(PeerState::new()),
            metrics: Mutex::new(SyncMetrics::new()),
            heartbeat_task: std::sync::Mutex::new(None),
            sync_responder: std::sync::Mutex::new(None),
            goaway_listeners: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn chain(&self) -> &Arc<dyn ChainEngine> {
        &self.chain
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub async fn latency(&self) -> Duration {
        self.state.lock().await.latency
    }

    pub(crate) async fn set_latency(&self, latency: Duration) {
        self.state.lock().await.latency = latency;
    }

    pub async fn last_handshake(&self) -> Option<HandshakeMessage> {
        self.state.lock().await.last_handshake.clone()
    }

    pub async fn last_sync_request(&self) -> Option<SyncRequestMessage> {
        self.state.lock().await.last_sync_request
    }

    fn transport_token(&self) -> CancellationToken {
        self.transport_token
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn add_goaway_listener(&self, listener: mpsc::UnboundedSender<GoAwayEvent>) {
        self.goaway_listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    fn notify_goaway(&self, message: &GoAwayMessage) {
        let event = GoAwayEvent {
            peer: self.peer.clone(),
            message: message.clone(),
        };
        self.goaway_listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|listener| listener.send(event.clone()).is_ok());
    }

    /// Resets protocol state ahead of a new dial.
    pub(crate) async fn reset(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.state.lock().await.reset();
        self.metrics.lock().await.reset();
    }

    /// Installs a fresh transport. Any previous transport is dropped.
    pub async fn attach(&self, reader: BoxedReader, writer: BoxedWriter) {
        let token = self.shutdown.child_token();
        {
            let mut current = self.transport_token.lock().unwrap_or_else(|e| e.into_inner());
            current.cancel();
            *current = token;
        }
        *self.reader.lock().await = Some(reader);
        *self.writer.lock().await = Some(writer);
        self.closed.store(false, Ordering::SeqCst);
    }

    /// Stops background tasks, marks the connection closed and shuts the transport.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("[{}] already closed", self.peer);
            return;
        }
        self.connected.store(false, Ordering::SeqCst);
        self.transport_token().cancel();
        self.heartbeat_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(responder) = self.sync_responder.lock().unwrap_or_else(|e| e.into_inner()).take() {
            responder.cancel.cancel();
        }

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            let _ = tokio::time::timeout(CLOSE_TIMEOUT, writer.shutdown()).await;
        }
        // the receive loop may hold the reader; it sees the cancelled token and lets go
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }
        info!("[{}] connection closed", self.peer);
    }

    async fn read_exact(
        reader: &mut BoxedReader,
        buf: &mut [u8],
        token: &CancellationToken,
    ) -> Result<(), NetError> {
        tokio::select! {
            r = reader.read_exact(buf) => {
                r?;
                Ok(())
            }
            _ = token.cancelled() => Err(NetError::Closed),
        }
    }

    async fn read_frame(&self) -> Result<(u8, Vec<u8>), NetError> {
        let token = self.transport_token();
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(NetError::Closed)?;

        let mut len_buf = [0u8; 4];
        Self::read_exact(reader, &mut len_buf, &token).await?;
        let len = u32::from_le_bytes(len_buf);
        if !(MIN_PACKAGE_SIZE..MAX_PACKAGE_SIZE).contains(&len) {
            return Err(NetError::BadFrameLength(len));
        }

        let mut tag = [0u8; 1];
        Self::read_exact(reader, &mut tag, &token).await?;
        let mut payload = vec![0u8; len as usize - 1];
        Self::read_exact(reader, &mut payload, &token).await?;
        Ok((tag[0], payload))
    }

    /// Reads one frame. `None` means the frame was short or out of bounds and
    /// the connection has been closed.
    pub async fn read_message(&self) -> Option<(u8, Vec<u8>)> {
        if self.is_closed() {
            return None;
        }
        match self.read_frame().await {
            Ok(frame) => Some(frame),
            Err(NetError::Closed) => None,
            Err(e) => {
                error!("[{}] failed to read message: {}", self.peer, e);
                self.close().await;
                None
            }
        }
    }

    async fn write_frame(&self, frame: &[u8]) -> Result<(), NetError> {
        let token = self.transport_token();
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(NetError::Closed)?;
        tokio::select! {
            r = async {
                writer.write_all(frame).await?;
                writer.flush().await
            } => Ok(r?),
            _ = token.cancelled() => Err(NetError::Closed),
        }
    }

    /// Writes one message. On failure the connection is closed; the same
    /// transport is never retried.
    pub async fn send_message(&self, msg: &Message) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.write_frame(&msg.to_frame()).await {
            Ok(()) => true,
            Err(e) => {
                error!("[{}] connection error when sending message {}: {}", self.peer, msg, e);
                self.close().await;
                false
            }
        }
    }

    pub async fn build_handshake_message(&self) -> HandshakeMessage {
        let generation = self.state.lock().await.next_generation();
        HandshakeMessage {
            network_version: self.config.network_version,
            chain_id: self.chain.chain_id(),
            node_id: Checksum256::random(),
            key: PublicKey::empty(),
            time: now_ns(),
            token: Checksum256::empty(),
            sig: Signature::empty(),
            p2p_address: self.config.p2p_address.clone(),
            last_irreversible_block_num: self.chain.last_irreversible_block_num(),
            last_irreversible_block_id: self.chain.last_irreversible_block_id(),
            head_num: self.chain.head_block_num(),
            head_id: self.chain.head_block_id(),
            os: std::env::consts::OS.to_string(),
            agent: self.config.agent.clone(),
            generation,
        }
    }

    pub async fn send_handshake_message(&self) -> bool {
        let msg = Message::Handshake(self.build_handshake_message().await);
        info!("[{}] send handshake message: {}", self.peer, msg);
        self.send_message(&msg).await
    }

    pub async fn handle_time_message(&self, msg: &TimeMessage) -> bool {
        let now = now_ns();
        if !msg.is_valid() {
            info!("[{}] invalid time message", self.peer);
            return false;
        }
        if msg.org == 0 {
            let reply = TimeMessage {
                org: msg.xmt,
                rec: now,
                xmt: now,
                dst: 0,
            };
            return self.send_message(&Message::Time(reply)).await;
        }

        let mut state = self.state.lock().await;
        if state.last_time_message.map(|t| t.xmt) == Some(msg.org) {
            let latency = Duration::from_nanos(now.saturating_sub(msg.org).max(0) as u64);
            info!("[{}] latency: {:?}", self.peer, latency);
            state.latency = latency;
            state.last_time_message = None;
        }
        true
    }

    /// Sends a time probe and waits for its echo. Any other message, or no
    /// reply within [`LATENCY_PROBE_TIMEOUT`], fails the probe.
    pub async fn estimate_connection_latency(&self) -> bool {
        let probe = TimeMessage::probe(now_ns());
        if !self.send_message(&Message::Time(probe)).await {
            return false;
        }

        let (tag, payload) = match tokio::time::timeout(LATENCY_PROBE_TIMEOUT, self.read_message()).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return false,
            Err(_) => {
                error!("[{}] {}", self.peer, NetError::Timeout("time message reply"));
                return false;
            }
        };

        match Message::unpack(tag, &payload) {
            Ok(Message::Time(reply)) => {
                if !reply.is_valid() {
                    info!("[{}] invalid time message", self.peer);
                    return false;
                }
                if reply.org != probe.xmt {
                    warn!("[{}] time reply does not match probe", self.peer);
                    return false;
                }
                let latency = Duration::from_nanos(now_ns().saturating_sub(reply.org).max(0) as u64);
                info!("[{}] latency: {:?}", self.peer, latency);
                self.set_latency(latency).await;
                true
            }
            Ok(other) => {
                error!("[{}] received {} while waiting for latency probe", self.peer, other);
                false
            }
            Err(e) => {
                error!("[{}] undecodable message while waiting for latency probe: {}", self.peer, e);
                false
            }
        }
    }

    async fn heartbeat(self: Arc<Self>, token: CancellationToken) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {}
                _ = token.cancelled() => {
                    debug!("[{}] heartbeat stopped", self.peer);
                    return;
                }
            }
            if !self.is_connected() {
                return;
            }
            let probe = TimeMessage::probe(now_ns());
            self.state.lock().await.last_time_message = Some(probe);
            debug!("[{}] heartbeat: send time message {:?}", self.peer, probe);
            if !self.send_message(&Message::Time(probe)).await {
                error!("[{}] fail to send time message", self.peer);
                return;
            }
            if !self.send_handshake_message().await {
                error!("[{}] fail to send handshake message", self.peer);
                return;
            }
        }
    }

    /// Starts the periodic time probe + handshake task for the current transport.
    pub(crate) fn start_heartbeat(self: &Arc<Self>) {
        let token = self.transport_token();
        let handle = tokio::spawn(self.clone().heartbeat(token));
        let previous = self
            .heartbeat_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Requests `[start, end]`. `start` defaults to local head + 1; an unset
    /// `end` is bounded by the fetch span and the peer's advertised head.
    pub async fn send_sync_request_message(&self, start_block: Option<u32>, end_block: Option<u32>) -> bool {
        let start = start_block.unwrap_or_else(|| self.chain.head_block_num().saturating_add(1));
        let end = match end_block {
            Some(end) => end,
            None => {
                let Some(remote_head) = self.state.lock().await.remote_head() else {
                    info!("[{}] no handshake info, skip sync request", self.peer);
                    return true;
                };
                let end = start
                    .saturating_add(self.config.sync_fetch_span.saturating_sub(1))
                    .min(remote_head);
                if end < start {
                    info!("[{}] no blocks to sync", self.peer);
                    return self.send_handshake_message().await;
                }
                end
            }
        };

        let msg = match SyncRequestMessage::new(start, end) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("[{}] skip sync request: {}", self.peer, e);
                return true;
            }
        };
        self.state.lock().await.last_sync_request = Some(msg);
        info!("[{}] send sync request: [{}, {}]", self.peer, start, end);
        self.send_message(&Message::SyncRequest(msg)).await
    }

    /// Tells the peer to drop whatever range it is serving us.
    pub async fn send_reset_sync_request_message(&self) -> bool {
        info!("[{}] reset sync request", self.peer);
        self.send_message(&Message::SyncRequest(SyncRequestMessage::reset())).await
    }

    pub async fn resync_from_irreversible_block_num_plus_one(&self) -> bool {
        let start = self.chain.last_irreversible_block_num().saturating_add(1);
        let end = self.chain.head_block_num();
        self.send_sync_request_message(Some(start), Some(end)).await
    }

    async fn send_catch_up_request(&self) -> bool {
        let msg = Message::Request(RequestMessage::catch_up(self.chain.head_block_id()));
        info!("[{}] send request message: {}", self.peer, msg);
        self.send_message(&msg).await
    }

    async fn push_block(&self, raw_block: &[u8], want_statistics: bool) -> Result<Option<String>, ChainError> {
        match &self.chain_lock {
            Some(lock) => {
                let _guard = lock.write().await;
                self.chain.push_block(raw_block, want_statistics)
            }
            None => self.chain.push_block(raw_block, want_statistics),
        }
    }

    /// Ingests one block. Returns false when the receive loop should stop.
    pub async fn on_signed_block_message(&self, raw_block: &[u8]) -> bool {
        let header = match BlockHeader::from_bytes(raw_block) {
            Ok(header) => header,
            Err(e) => {
                error!("[{}] undecodable block header: {}", self.peer, e);
                return false;
            }
        };
        let received_num = header.block_num();
        let received_id = header.calculate_id();
        let head_num = self.chain.head_block_num();

        if head_num >= received_num {
            let local_id = self.chain.get_block_id_for_num(received_num);
            if local_id == Some(received_id) {
                info!(
                    "[{}] receive duplicated block: head_block_num: {}, received_block_num: {}, received block_id: {}",
                    self.peer, head_num, received_num, received_id
                );
                return true;
            }
            // a competing block at a known height goes to the fork database
            warn!(
                "[{}] receive block {} with id {} while local id is {:?}, maybe fork happened",
                self.peer, received_num, received_id, local_id
            );
        } else if head_num.saturating_add(1) < received_num {
            error!(
                "[{}] invalid incoming block number: expected: {}, received: {}",
                self.peer,
                head_num + 1,
                received_num
            );
            if !self.send_reset_sync_request_message().await {
                return false;
            }
            return self.send_catch_up_request().await;
        }

        let want_statistics = now_ms() - header.block_time_ms() < STATISTICS_MAX_BLOCK_AGE_MS;
        match self.push_block(raw_block, want_statistics).await {
            Ok(Some(statistics)) => info!("[{}] {}", self.peer, statistics),
            Ok(None) => {}
            Err(ChainError::UnlinkableBlock) => {
                warn!(
                    "[{}] receive unlinkable block: {}, received_block_id: {}",
                    self.peer, received_num, received_id
                );
                if !self.send_reset_sync_request_message().await {
                    return false;
                }
                return self.send_catch_up_request().await;
            }
            Err(e) if e.is_already_known() => {
                warn!("[{}] receive duplicated block: {}, block_id: {}", self.peer, received_num, received_id);
                return true;
            }
            Err(e) => {
                error!("[{}] fatal chain error on block {}: {}; shutting down", self.peer, received_num, e);
                self.shutdown.cancel();
                return false;
            }
        }
        tokio::task::yield_now().await;

        let (remote_head, remote_lib, last_sync_end) = {
            let state = self.state.lock().await;
            (
                state.remote_head(),
                state.last_handshake.as_ref().map(|h| h.last_irreversible_block_num),
                state.last_sync_request.map(|r| r.end_block()),
            )
        };

        {
            let mut metrics = self.metrics.lock().await;
            let now = Instant::now();
            metrics.record_block(raw_block.len(), now);
            if let Some(report) = metrics.report(now, received_num, remote_head) {
                info!("[{}] {}", self.peer, report);
            }
        }

        if remote_head == Some(received_num) && !self.send_handshake_message().await {
            return false;
        }

        if last_sync_end == Some(received_num) {
            if remote_lib.unwrap_or_default() > received_num {
                return self.send_sync_request_message(None, None).await;
            }
            if !self.send_handshake_message().await {
                return false;
            }
            // range finished, switch to block-by-block relay
            self.state.lock().await.last_sync_request = None;
            return self.send_catch_up_request().await;
        }
        true
    }

    async fn serve_blocks(self: Arc<Self>, request: SyncRequestMessage, cancel: CancellationToken) {
        for num in request.start_block()..=request.end_block() {
            if cancel.is_cancelled() {
                debug!("[{}] sync request [{}, {}] cancelled", self.peer, request.start_block(), request.end_block());
                return;
            }
            let Some(raw_block) = self.chain.fetch_block_by_number(num) else {
                info!("[{}] no block for num: {}", self.peer, num);
                return;
            };
            if !self.send_message(&Message::SignedBlock(raw_block)).await {
                return;
            }
        }
    }

    /// Starts serving `[start, end]` in the background, cancelling any range
    /// already being served to this peer.
    pub fn handle_sync_request_message(self: &Arc<Self>, request: SyncRequestMessage) {
        let mut responder = self.sync_responder.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = responder.take() {
            previous.cancel.cancel();
        }
        if request.is_reset() {
            return;
        }
        let cancel = self.transport_token().child_token();
        let handle = tokio::spawn(self.clone().serve_blocks(request, cancel.clone()));
        *responder = Some(SyncResponder { cancel, _handle: handle });
    }

    pub async fn on_handshake_message(&self, msg: HandshakeMessage) -> bool {
        info!("[{}] received handshake message: {}", self.peer, Message::Handshake(msg.clone()));
        let remote_head = msg.head_num;
        let remote_lib = msg.last_irreversible_block_num;
        let remote_head_id = msg.head_id;
        self.state.lock().await.last_handshake = Some(msg);

        let head_num = self.chain.head_block_num();
        let head_id = self.chain.head_block_id();
        let lib_num = self.chain.last_irreversible_block_num();

        if head_num < remote_lib {
            return self.send_sync_request_message(None, None).await;
        }
        if head_id == remote_head_id {
            return true;
        }
        if remote_head > head_num {
            return self.send_catch_up_request().await;
        }
        if lib_num > remote_head.saturating_add(DEFAULT_BLOCK_LATENCY) {
            let msg = Message::Notice(NoticeMessage {
                known_trx: OrderedIds::new(IdListMode::LastIrrCatchUp, lib_num, Vec::new()),
                known_blocks: OrderedIds::new(IdListMode::LastIrrCatchUp, head_num, vec![head_id]),
            });
            info!("[{}] send notice message: {}", self.peer, msg);
            return self.send_message(&msg).await;
        }
        if head_num > remote_head.saturating_add(DEFAULT_BLOCK_LATENCY) {
            info!("[{}] block num is ahead of peer by {}", self.peer, head_num - remote_head);
            let earliest = make_block_id(self.chain.earliest_available_block_num());
            let msg = Message::Notice(NoticeMessage {
                known_trx: OrderedIds::none(),
                known_blocks: OrderedIds::new(IdListMode::CatchUp, head_num, vec![head_id, earliest]),
            });
            info!("[{}] send notice message: {}", self.peer, msg);
            return self.send_message(&msg).await;
        }
        true
    }

    pub async fn on_notice_message(&self, msg: NoticeMessage) -> bool {
        match msg.known_blocks.mode {
            IdListMode::CatchUp => {
                if msg.known_blocks.ids.is_empty() {
                    let goaway = GoAwayMessage {
                        reason: GoAwayReason::NoReason,
                        node_id: Checksum256::empty(),
                    };
                    warn!("[{}] catch up notice without block ids", self.peer);
                    self.notify_goaway(&goaway);
                    self.send_message(&Message::GoAway(goaway)).await;
                    self.close().await;
                    return false;
                }
                self.send_catch_up_request().await
            }
            IdListMode::LastIrrCatchUp => {
                let pending = msg.known_blocks.pending;
                let start = self.chain.head_block_num().saturating_add(1);
                if start > pending {
                    info!("[{}] already in sync, start_block: {}, pending: {}", self.peer, start, pending);
                    return true;
                }
                if !self.send_reset_sync_request_message().await {
                    return false;
                }
                self.send_sync_request_message(Some(start), Some(pending)).await
            }
            IdListMode::None | IdListMode::Normal => true,
        }
    }

    /// This node does not relay blocks or transactions on request.
    pub async fn on_request_message(&self, msg: RequestMessage) -> bool {
        debug!("[{}] ignore request message: {:?}", self.peer, msg);
        true
    }

    /// Reads and dispatches one message. Returns false when the loop should stop.
    pub async fn handle_message(self: &Arc<Self>) -> bool {
        let Some((tag, payload)) = self.read_message().await else {
            return false;
        };
        if self.shutdown.is_cancelled() {
            return false;
        }

        let message = match Message::unpack(tag, &payload) {
            Ok(message) => message,
            Err(CodecError::UnknownTag(tag)) => {
                info!("[{}] skip unknown message type {} ({} bytes)", self.peer, tag, payload.len());
                return true;
            }
            Err(e) => {
                error!("[{}] failed to decode message type {}: {}", self.peer, tag, e);
                self.close().await;
                return false;
            }
        };

        match message {
            Message::Handshake(msg) => self.on_handshake_message(msg).await,
            Message::ChainSize(msg) => {
                info!("[{}] chain size: {:?}", self.peer, msg);
                true
            }
            Message::GoAway(msg) => {
                info!("[{}] go away: {:?}", self.peer, msg);
                self.notify_goaway(&msg);
                self.close().await;
                false
            }
            Message::Time(msg) => {
                self.handle_time_message(&msg).await;
                true
            }
            Message::Notice(msg) => {
                info!("[{}] receive notice message: {:?}", self.peer, msg);
                self.on_notice_message(msg).await
            }
            Message::Request(msg) => self.on_request_message(msg).await,
            Message::SyncRequest(msg) => {
                info!("[{}] receive sync request: [{}, {}]", self.peer, msg.start_block(), msg.end_block());
                self.handle_sync_request_message(msg);
                true
            }
            Message::SignedBlock(raw) => self.on_signed_block_message(&raw).await,
            Message::PackedTransaction(_) => true,
        }
    }

    /// Runs the receive loop on the current transport until it fails or the process exits.
    pub async fn handle_messages(self: &Arc<Self>) -> bool {
        self.state.lock().await.last_sync_request = None;
        // the peer may still be serving the range we asked for before a disconnect
        self.send_reset_sync_request_message().await;

        if !self.send_handshake_message().await {
            info!("[{}] send handshake message failed", self.peer);
            return false;
        }

        while !self.shutdown.is_cancelled() {
            if !self.handle_message().await {
                return false;
            }
        }
        false
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("connected", &self.is_connected())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::message::MessageType;
    use crate::testing::{block_at, block_id, build_chain, MockChain};
    use pretty_assertions::assert_eq;
    use tokio::io::DuplexStream;

    fn id(n: u8) -> Checksum256 {
        Checksum256([n; 32])
    }

    async fn connected(chain: Arc<MockChain>) -> (Arc<Connection>, DuplexStream) {
        let config = Arc::new(NetConfig::default());
        let conn = Arc::new(Connection::new("127.0.0.1:9876", chain, None, config, CancellationToken::new()));
        let (local, remote) = tokio::io::duplex(1 << 20);
        let (reader, writer) = tokio::io::split(local);
        conn.attach(Box::new(reader), Box::new(writer)).await;
        conn.set_connected(true);
        (conn, remote)
    }

    async fn next_message(remote: &mut DuplexStream) -> Message {
        let len = remote.read_u32_le().await.unwrap();
        let tag = remote.read_u8().await.unwrap();
        let mut payload = vec![0u8; len as usize - 1];
        remote.read_exact(&mut payload).await.unwrap();
        Message::unpack(tag, &payload).unwrap()
    }

    /// Closes the connection so the remote side reads EOF after pending frames.
    async fn drain(conn: &Connection, remote: &mut DuplexStream) -> Vec<Message> {
        conn.close().await;
        let mut out = Vec::new();
        while let Ok(len) = remote.read_u32_le().await {
            let tag = remote.read_u8().await.unwrap();
            let mut payload = vec![0u8; len as usize - 1];
            remote.read_exact(&mut payload).await.unwrap();
            out.push(Message::unpack(tag, &payload).unwrap());
        }
        out
    }

    fn handshake(head_num: u32, head_id: Checksum256, lib_num: u32) -> HandshakeMessage {
        HandshakeMessage {
            network_version: 0,
            chain_id: id(0xcc),
            node_id: id(1),
            key: PublicKey::empty(),
            time: 1,
            token: Checksum256::empty(),
            sig: Signature::empty(),
            p2p_address: String::new(),
            last_irreversible_block_num: lib_num,
            last_irreversible_block_id: Checksum256::empty(),
            head_num,
            head_id,
            os: String::new(),
            agent: String::new(),
            generation: 1,
        }
    }

    #[tokio::test]
    async fn test_bad_frame_lengths_close_connection() {
        for len in [0u32, 1, MAX_PACKAGE_SIZE, u32::MAX] {
            let (conn, mut remote) = connected(Arc::new(MockChain::with_head(1, id(1)))).await;
            remote.write_u32_le(len).await.unwrap();
            remote.write_all(&[MessageType::Handshake as u8, 0, 0]).await.unwrap();
            assert!(conn.read_message().await.is_none(), "length {} accepted", len);
            assert!(conn.is_closed());
            assert!(!conn.is_connected());
        }
    }

    #[tokio::test]
    async fn test_short_read_closes_connection() {
        let (conn, mut remote) = connected(Arc::new(MockChain::with_head(1, id(1)))).await;
        remote.write_u32_le(10).await.unwrap();
        remote.write_all(&[3, 1, 2]).await.unwrap();
        drop(remote);
        assert!(conn.read_message().await.is_none());
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (conn, _remote) = connected(Arc::new(MockChain::with_head(1, id(1)))).await;
        conn.close().await;
        assert!(!conn.send_message(&Message::Time(TimeMessage::probe(1))).await);
    }

    #[tokio::test]
    async fn test_handshake_generation_increments() {
        let (conn, _remote) = connected(Arc::new(MockChain::with_head(7, id(7)))).await;
        let first = conn.build_handshake_message().await;
        let second = conn.build_handshake_message().await;
        assert_eq!(first.generation, 1);
        assert_eq!(second.generation, 2);
        assert_ne!(first.node_id, second.node_id);
        assert_eq!(first.head_num, 7);
        assert!(first.time > 0);
    }

    #[tokio::test]
    async fn test_time_probe_is_echoed() {
        let (conn, mut remote) = connected(Arc::new(MockChain::with_head(1, id(1)))).await;
        assert!(conn.handle_time_message(&TimeMessage::probe(12345)).await);
        match next_message(&mut remote).await {
            Message::Time(reply) => {
                assert_eq!(reply.org, 12345);
                assert!(reply.xmt > 0);
                assert_eq!(reply.rec, reply.xmt);
            }
            other => panic!("unexpected {}", other),
        }
    }

    #[tokio::test]
    async fn test_time_reply_records_latency() {
        let (conn, _remote) = connected(Arc::new(MockChain::with_head(1, id(1)))).await;
        let sent = now_ns() - 5_000_000;
        conn.state.lock().await.last_time_message = Some(TimeMessage::probe(sent));
        assert!(conn.handle_time_message(&TimeMessage { org: sent, rec: 1, xmt: 1, dst: 0 }).await);
        assert!(conn.latency().await >= Duration::from_millis(5));
    }

    #[tokio::test]
    async fn test_latency_probe_success() {
        let (conn, mut remote) = connected(Arc::new(MockChain::with_head(1, id(1)))).await;
        let peer = tokio::spawn(async move {
            let Message::Time(probe) = next_message(&mut remote).await else {
                panic!("expected time probe");
            };
            assert_eq!(probe.org, 0);
            let reply = TimeMessage { org: probe.xmt, rec: 1, xmt: 1, dst: 0 };
            remote.write_all(&Message::Time(reply).to_frame()).await.unwrap();
            remote
        });
        assert!(conn.estimate_connection_latency().await);
        let _remote = peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_latency_probe_fails_on_other_message() {
        let (conn, mut remote) = connected(Arc::new(MockChain::with_head(1, id(1)))).await;
        let peer = tokio::spawn(async move {
            next_message(&mut remote).await;
            let frame = Message::Handshake(handshake(1, id(1), 1)).to_frame();
            remote.write_all(&frame).await.unwrap();
            remote
        });
        assert!(!conn.estimate_connection_latency().await);
        let _remote = peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_sync_request_bounded_by_span_and_remote_head() {
        let (conn, mut remote) = connected(Arc::new(MockChain::with_head(100, id(100)))).await;
        conn.state.lock().await.last_handshake = Some(handshake(1000, id(2), 900));
        assert!(conn.send_sync_request_message(None, None).await);
        assert_eq!(
            next_message(&mut remote).await,
            Message::SyncRequest(SyncRequestMessage::new(101, 400).unwrap())
        );

        conn.state.lock().await.last_handshake = Some(handshake(150, id(2), 140));
        assert!(conn.send_sync_request_message(None, None).await);
        assert_eq!(
            next_message(&mut remote).await,
            Message::SyncRequest(SyncRequestMessage::new(101, 150).unwrap())
        );
        assert_eq!(conn.last_sync_request().await, Some(SyncRequestMessage::new(101, 150).unwrap()));
    }

    #[tokio::test]
    async fn test_empty_sync_range_sends_handshake() {
        let (conn, mut remote) = connected(Arc::new(MockChain::with_head(100, id(100)))).await;
        conn.state.lock().await.last_handshake = Some(handshake(100, id(100), 90));
        assert!(conn.send_sync_request_message(None, None).await);
        assert!(matches!(next_message(&mut remote).await, Message::Handshake(_)));
        assert_eq!(conn.last_sync_request().await, None);
    }

    #[tokio::test]
    async fn test_gap_triggers_resync_without_push() {
        let chain = Arc::new(MockChain::with_head(50, id(50)));
        let (conn, mut remote) = connected(chain.clone()).await;

        assert!(conn.on_signed_block_message(&block_at(52)).await);
        let sent = drain(&conn, &mut remote).await;
        assert_eq!(
            sent,
            vec![
                Message::SyncRequest(SyncRequestMessage::reset()),
                Message::Request(RequestMessage::catch_up(id(50))),
            ]
        );
        assert_eq!(chain.push_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_block_is_not_pushed() {
        let chain = Arc::new(MockChain::with_head(50, id(50)));
        let raw = block_at(40);
        chain.set_block(40, raw.clone());
        let (conn, mut remote) = connected(chain.clone()).await;

        assert!(conn.on_signed_block_message(&raw).await);
        assert_eq!(chain.push_count(), 0);
        assert!(drain(&conn, &mut remote).await.is_empty());
    }

    #[tokio::test]
    async fn test_fork_block_is_handed_to_chain() {
        let chain = Arc::new(MockChain::with_head(50, id(50)));
        chain.set_block(40, block_at(40));
        let (conn, _remote) = connected(chain.clone()).await;

        let mut parent = make_block_id(39);
        parent.0[31] = 9;
        let competing = build_chain(parent, 39, 1).remove(0);
        assert_ne!(block_id(&competing), block_id(&block_at(40)));
        assert!(conn.on_signed_block_message(&competing).await);
        assert_eq!(chain.push_count(), 1);
    }

    #[tokio::test]
    async fn test_unlinkable_block_resyncs() {
        let chain = Arc::new(MockChain::with_head(50, id(50)));
        chain.fail_next_push(ChainError::UnlinkableBlock);
        let (conn, mut remote) = connected(chain.clone()).await;

        assert!(conn.on_signed_block_message(&block_at(51)).await);
        let sent = drain(&conn, &mut remote).await;
        assert_eq!(
            sent,
            vec![
                Message::SyncRequest(SyncRequestMessage::reset()),
                Message::Request(RequestMessage::catch_up(id(50))),
            ]
        );
    }

    #[tokio::test]
    async fn test_already_known_fork_error_is_benign() {
        let chain = Arc::new(MockChain::with_head(50, id(50)));
        chain.fail_next_push(ChainError::ForkDatabase(format!("{} 51", ChainError::ALREADY_KNOWN)));
        let (conn, _remote) = connected(chain).await;
        assert!(conn.on_signed_block_message(&block_at(51)).await);
        assert!(!conn.shutdown_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_fatal_chain_errors_request_shutdown() {
        for err in [
            ChainError::DatabaseGuard("out of memory".into()),
            ChainError::ForkDatabase("corrupted".into()),
            ChainError::Other("boom".into()),
        ] {
            let chain = Arc::new(MockChain::with_head(50, id(50)));
            chain.fail_next_push(err);
            let (conn, _remote) = connected(chain).await;
            assert!(!conn.on_signed_block_message(&block_at(51)).await);
            assert!(conn.shutdown_token().is_cancelled());
        }
    }

    #[tokio::test]
    async fn test_end_of_range_extends_sync() {
        let chain = Arc::new(MockChain::with_head(50, id(50)));
        let (conn, mut remote) = connected(chain.clone()).await;
        {
            let mut state = conn.state.lock().await;
            state.last_handshake = Some(handshake(1000, id(2), 900));
            state.last_sync_request = Some(SyncRequestMessage::new(51, 51).unwrap());
        }
        assert!(conn.on_signed_block_message(&block_at(51)).await);
        assert_eq!(chain.push_count(), 1);
        assert_eq!(
            next_message(&mut remote).await,
            Message::SyncRequest(SyncRequestMessage::new(52, 351).unwrap())
        );
    }

    #[tokio::test]
    async fn test_end_of_range_switches_to_relay() {
        let chain = Arc::new(MockChain::with_head(50, id(50)));
        let (conn, mut remote) = connected(chain.clone()).await;
        {
            let mut state = conn.state.lock().await;
            state.last_handshake = Some(handshake(60, id(2), 45));
            state.last_sync_request = Some(SyncRequestMessage::new(51, 51).unwrap());
        }
        let raw = block_at(51);
        assert!(conn.on_signed_block_message(&raw).await);

        assert!(matches!(next_message(&mut remote).await, Message::Handshake(_)));
        assert_eq!(
            next_message(&mut remote).await,
            Message::Request(RequestMessage::catch_up(block_id(&raw)))
        );
        assert_eq!(conn.last_sync_request().await, None);
    }

    #[tokio::test]
    async fn test_handshake_equal_heads_is_noop() {
        let chain = Arc::new(MockChain::with_head(100, id(100)));
        chain.set_lib(90, id(90));
        let (conn, mut remote) = connected(chain).await;
        assert!(conn.on_handshake_message(handshake(100, id(100), 90)).await);
        assert!(drain(&conn, &mut remote).await.is_empty());
        assert_eq!(conn.last_handshake().await.map(|h| h.head_num), Some(100));
    }

    #[tokio::test]
    async fn test_handshake_remote_slightly_ahead_requests_catch_up() {
        let chain = Arc::new(MockChain::with_head(100, id(100)));
        chain.set_lib(90, id(90));
        let (conn, mut remote) = connected(chain).await;
        assert!(conn.on_handshake_message(handshake(105, id(105), 95)).await);
        assert_eq!(
            drain(&conn, &mut remote).await,
            vec![Message::Request(RequestMessage::catch_up(id(100)))]
        );
    }

    #[tokio::test]
    async fn test_handshake_remote_lib_ahead_starts_ranged_sync() {
        let chain = Arc::new(MockChain::with_head(100, id(100)));
        let (conn, mut remote) = connected(chain).await;
        assert!(conn.on_handshake_message(handshake(5000, id(5), 4000)).await);
        assert_eq!(
            next_message(&mut remote).await,
            Message::SyncRequest(SyncRequestMessage::new(101, 400).unwrap())
        );
    }

    #[tokio::test]
    async fn test_handshake_local_far_ahead_sends_notices() {
        let chain = Arc::new(MockChain::with_head(100, id(100)));
        chain.set_lib(95, id(95));
        let (conn, mut remote) = connected(chain.clone()).await;
        assert!(conn.on_handshake_message(handshake(50, id(50), 40)).await);
        match next_message(&mut remote).await {
            Message::Notice(notice) => {
                assert_eq!(notice.known_trx.mode, IdListMode::LastIrrCatchUp);
                assert_eq!(notice.known_trx.pending, 95);
                assert_eq!(notice.known_blocks.pending, 100);
                assert_eq!(notice.known_blocks.ids, vec![id(100)]);
            }
            other => panic!("unexpected {}", other),
        }

        chain.set_lib(10, id(10));
        assert!(conn.on_handshake_message(handshake(50, id(50), 40)).await);
        match next_message(&mut remote).await {
            Message::Notice(notice) => {
                assert_eq!(notice.known_trx, OrderedIds::none());
                assert_eq!(notice.known_blocks.mode, IdListMode::CatchUp);
                assert_eq!(notice.known_blocks.ids, vec![id(100), make_block_id(1)]);
            }
            other => panic!("unexpected {}", other),
        }
    }

    #[tokio::test]
    async fn test_catch_up_notice() {
        let (conn, mut remote) = connected(Arc::new(MockChain::with_head(100, id(100)))).await;
        let notice = NoticeMessage {
            known_trx: OrderedIds::none(),
            known_blocks: OrderedIds::new(IdListMode::CatchUp, 120, vec![id(120)]),
        };
        assert!(conn.on_notice_message(notice).await);
        assert_eq!(next_message(&mut remote).await, Message::Request(RequestMessage::catch_up(id(100))));
    }

    #[tokio::test]
    async fn test_catch_up_notice_without_ids_goes_away() {
        let (conn, mut remote) = connected(Arc::new(MockChain::with_head(100, id(100)))).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        conn.add_goaway_listener(tx);
        let notice = NoticeMessage {
            known_trx: OrderedIds::none(),
            known_blocks: OrderedIds::new(IdListMode::CatchUp, 120, Vec::new()),
        };
        assert!(!conn.on_notice_message(notice).await);
        assert!(conn.is_closed());
        assert!(!conn.is_connected());
        assert!(matches!(next_message(&mut remote).await, Message::GoAway(_)));
        assert!(remote.read_u32_le().await.is_err());
        assert_eq!(rx.recv().await.unwrap().peer, "127.0.0.1:9876");
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_sends_time_then_handshake() {
        let (conn, mut remote) = connected(Arc::new(MockChain::with_head(1, id(1)))).await;
        conn.start_heartbeat();
        tokio::task::yield_now().await;
        tokio::time::advance(HEARTBEAT_INTERVAL).await;

        match next_message(&mut remote).await {
            Message::Time(time) => {
                assert_eq!(time.org, 0);
                assert_eq!(conn.state.lock().await.last_time_message, Some(time));
            }
            other => panic!("unexpected {}", other),
        }
        assert!(matches!(next_message(&mut remote).await, Message::Handshake(_)));

        let handle = conn.heartbeat_task.lock().unwrap().take().unwrap();
        conn.transport_token().cancel();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_last_irreversible_notice_requests_range() {
        let (conn, mut remote) = connected(Arc::new(MockChain::with_head(100, id(100)))).await;
        let notice = NoticeMessage {
            known_trx: OrderedIds::none(),
            known_blocks: OrderedIds::new(IdListMode::LastIrrCatchUp, 130, vec![id(130)]),
        };
        assert!(conn.on_notice_message(notice.clone()).await);
        assert_eq!(next_message(&mut remote).await, Message::SyncRequest(SyncRequestMessage::reset()));
        assert_eq!(
            next_message(&mut remote).await,
            Message::SyncRequest(SyncRequestMessage::new(101, 130).unwrap())
        );

        let behind = NoticeMessage {
            known_blocks: OrderedIds::new(IdListMode::LastIrrCatchUp, 100, Vec::new()),
            ..notice
        };
        assert!(conn.on_notice_message(behind).await);
        assert!(drain(&conn, &mut remote).await.is_empty());
    }

    #[tokio::test]
    async fn test_sync_request_serves_until_missing_block() {
        let chain = Arc::new(MockChain::with_head(3, id(3)));
        let blocks = build_chain(Checksum256::empty(), 0, 3);
        for (i, raw) in blocks.iter().enumerate() {
            chain.set_block(i as u32 + 1, raw.clone());
        }
        let (conn, mut remote) = connected(chain).await;
        conn.handle_sync_request_message(SyncRequestMessage::new(2, 10).unwrap());

        assert_eq!(next_message(&mut remote).await, Message::SignedBlock(blocks[1].clone()));
        assert_eq!(next_message(&mut remote).await, Message::SignedBlock(blocks[2].clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(drain(&conn, &mut remote).await.is_empty());
    }

    #[tokio::test]
    async fn test_go_away_notifies_and_closes() {
        let (conn, mut remote) = connected(Arc::new(MockChain::with_head(1, id(1)))).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        conn.add_goaway_listener(tx);
        let goaway = GoAwayMessage { reason: GoAwayReason::Duplicate, node_id: id(4) };
        remote.write_all(&Message::GoAway(goaway.clone()).to_frame()).await.unwrap();

        assert!(!conn.handle_message().await);
        assert!(conn.is_closed());
        assert_eq!(rx.recv().await.unwrap().message, goaway);
    }

    #[tokio::test]
    async fn test_unknown_tag_is_skipped() {
        let (conn, mut remote) = connected(Arc::new(MockChain::with_head(1, id(1)))).await;
        remote.write_u32_le(3).await.unwrap();
        remote.write_all(&[42, 1, 2]).await.unwrap();
        assert!(conn.handle_message().await);
        assert!(!conn.is_closed());
    }
}
