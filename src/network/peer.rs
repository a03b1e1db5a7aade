use std::fmt;
use std::time::Duration;

use crate::network::message::{HandshakeMessage, SyncRequestMessage, TimeMessage};

/// Handshake generations count up from 1 and wrap back to 1 here; 0 is never sent.
pub const GENERATION_WRAP: i16 = 0x7fff;

/// Protocol state kept per peer across reconnects.
#[derive(Clone, Default)]
pub struct PeerState {
    generation: i16,
    /// Most recently received handshake from the peer.
    pub last_handshake: Option<HandshakeMessage>,
    /// Most recently sent ranged sync request.
    pub last_sync_request: Option<SyncRequestMessage>,
    /// Outstanding heartbeat time probe.
    pub last_time_message: Option<TimeMessage>,
    /// Round-trip latency measured by the last successful probe.
    pub latency: Duration,
}

impl PeerState {
    pub fn new() -> Self {
        Self {
            generation: 1,
            ..Default::default()
        }
    }

    /// Clears per-transport state before a new dial. The last handshake is kept
    /// so sync decisions can still use the peer's advertised head.
    pub fn reset(&mut self) {
        self.generation = 1;
        self.latency = Duration::ZERO;
        self.last_time_message = None;
        self.last_sync_request = None;
    }

    pub fn generation(&self) -> i16 {
        self.generation
    }

    /// Returns the generation for the next handshake and advances the counter.
    pub fn next_generation(&mut self) -> i16 {
        let current = self.generation;
        self.generation += 1;
        if self.generation == GENERATION_WRAP {
            self.generation = 1;
        }
        current
    }

    /// Head number advertised by the peer, if it has handshaken.
    pub fn remote_head(&self) -> Option<u32> {
        self.last_handshake.as_ref().map(|h| h.head_num)
    }
}

impl fmt::Debug for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerState")
            .field("generation", &self.generation)
            .field("remote_head", &self.remote_head())
            .field("last_sync_request", &self.last_sync_request)
            .field("latency", &self.latency)
            .finish()
    }
}
