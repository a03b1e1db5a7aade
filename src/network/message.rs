//! Wire messages exchanged with peers.
//!
//! Every frame is `u32 length (LE) | u8 tag | payload`, where `length`
//! counts the tag byte plus the payload.

use std::fmt;

use crate::codec::{Checksum256, Decoder, Encoder, Packable, PublicKey, Signature};
use crate::error::CodecError;

/// Frames of this size or larger are rejected.
pub const MAX_PACKAGE_SIZE: u32 = 5 * 1024 * 1024;
/// Smallest valid frame length: a tag byte plus at least one payload byte.
pub const MIN_PACKAGE_SIZE: u32 = 2;

pub const NET_VERSION_BASE: u16 = 0x04b5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Handshake = 0,
    ChainSize = 1,
    GoAway = 2,
    Time = 3,
    Notice = 4,
    Request = 5,
    SyncRequest = 6,
    SignedBlock = 7,
    PackedTransaction = 8,
}

impl TryFrom<u8> for MessageType {
    type Error = CodecError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        Ok(match tag {
            0 => MessageType::Handshake,
            1 => MessageType::ChainSize,
            2 => MessageType::GoAway,
            3 => MessageType::Time,
            4 => MessageType::Notice,
            5 => MessageType::Request,
            6 => MessageType::SyncRequest,
            7 => MessageType::SignedBlock,
            8 => MessageType::PackedTransaction,
            other => return Err(CodecError::UnknownTag(other)),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeMessage {
    pub network_version: u16,
    pub chain_id: Checksum256,
    /// Used to identify peers and prevent self-connect.
    pub node_id: Checksum256,
    pub key: PublicKey,
    /// Creation time in nanoseconds since the unix epoch.
    pub time: i64,
    pub token: Checksum256,
    pub sig: Signature,
    pub p2p_address: String,
    pub last_irreversible_block_num: u32,
    pub last_irreversible_block_id: Checksum256,
    pub head_num: u32,
    pub head_id: Checksum256,
    pub os: String,
    pub agent: String,
    pub generation: i16,
}

impl Packable for HandshakeMessage {
    fn pack(&self, enc: &mut Encoder) {
        enc.pack_u16(self.network_version);
        enc.pack(&self.chain_id);
        enc.pack(&self.node_id);
        enc.pack(&self.key);
        enc.pack_i64(self.time);
        enc.pack(&self.token);
        enc.pack(&self.sig);
        enc.pack_string(&self.p2p_address);
        enc.pack_u32(self.last_irreversible_block_num);
        enc.pack(&self.last_irreversible_block_id);
        enc.pack_u32(self.head_num);
        enc.pack(&self.head_id);
        enc.pack_string(&self.os);
        enc.pack_string(&self.agent);
        enc.pack_i16(self.generation);
    }

    fn unpack(dec: &mut Decoder<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            network_version: dec.unpack_u16()?,
            chain_id: dec.unpack()?,
            node_id: dec.unpack()?,
            key: dec.unpack()?,
            time: dec.unpack_i64()?,
            token: dec.unpack()?,
            sig: dec.unpack()?,
            p2p_address: dec.unpack_string()?,
            last_irreversible_block_num: dec.unpack_u32()?,
            last_irreversible_block_id: dec.unpack()?,
            head_num: dec.unpack_u32()?,
            head_id: dec.unpack()?,
            os: dec.unpack_string()?,
            agent: dec.unpack_string()?,
            generation: dec.unpack_i16()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainSizeMessage {
    pub last_irreversible_block_num: u32,
    pub last_irreversible_block_id: Checksum256,
    pub head_num: u32,
    pub head_id: Checksum256,
}

impl Packable for ChainSizeMessage {
    fn pack(&self, enc: &mut Encoder) {
        enc.pack_u32(self.last_irreversible_block_num);
        enc.pack(&self.last_irreversible_block_id);
        enc.pack_u32(self.head_num);
        enc.pack(&self.head_id);
    }

    fn unpack(dec: &mut Decoder<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            last_irreversible_block_num: dec.unpack_u32()?,
            last_irreversible_block_id: dec.unpack()?,
            head_num: dec.unpack_u32()?,
            head_id: dec.unpack()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum GoAwayReason {
    NoReason = 0,
    /// The connection is to itself.
    SelfConnect = 1,
    Duplicate = 2,
    WrongChain = 3,
    WrongVersion = 4,
    /// The peer's irreversible blocks are different.
    Forked = 5,
    Unlinkable = 6,
    BadTransaction = 7,
    Validation = 8,
    /// Timeouts and similar; not fatal but warrant resetting.
    BenignOther = 9,
    FatalOther = 10,
    Authentication = 11,
}

impl TryFrom<u32> for GoAwayReason {
    type Error = CodecError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => GoAwayReason::NoReason,
            1 => GoAwayReason::SelfConnect,
            2 => GoAwayReason::Duplicate,
            3 => GoAwayReason::WrongChain,
            4 => GoAwayReason::WrongVersion,
            5 => GoAwayReason::Forked,
            6 => GoAwayReason::Unlinkable,
            7 => GoAwayReason::BadTransaction,
            8 => GoAwayReason::Validation,
            9 => GoAwayReason::BenignOther,
            10 => GoAwayReason::FatalOther,
            11 => GoAwayReason::Authentication,
            value => return Err(CodecError::UnknownEnumValue { kind: "go_away_reason", value }),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoAwayMessage {
    pub reason: GoAwayReason,
    pub node_id: Checksum256,
}

impl Packable for GoAwayMessage {
    fn pack(&self, enc: &mut Encoder) {
        enc.pack_u32(self.reason as u32);
        enc.pack(&self.node_id);
    }

    fn unpack(dec: &mut Decoder<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            reason: GoAwayReason::try_from(dec.unpack_u32()?)?,
            node_id: dec.unpack()?,
        })
    }
}

/// Timestamps are nanoseconds since the unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeMessage {
    /// origin
    pub org: i64,
    /// receive
    pub rec: i64,
    /// transmit
    pub xmt: i64,
    /// destination
    pub dst: i64,
}

impl TimeMessage {
    /// A fresh latency probe.
    pub fn probe(now: i64) -> Self {
        Self { org: 0, rec: 0, xmt: now, dst: 0 }
    }

    pub fn is_valid(&self) -> bool {
        self.xmt != 0
    }
}

impl Packable for TimeMessage {
    fn pack(&self, enc: &mut Encoder) {
        enc.pack_i64(self.org);
        enc.pack_i64(self.rec);
        enc.pack_i64(self.xmt);
        enc.pack_i64(self.dst);
    }

    fn unpack(dec: &mut Decoder<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            org: dec.unpack_i64()?,
            rec: dec.unpack_i64()?,
            xmt: dec.unpack_i64()?,
            dst: dec.unpack_i64()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum IdListMode {
    #[default]
    None = 0,
    CatchUp = 1,
    LastIrrCatchUp = 2,
    Normal = 3,
}

impl TryFrom<u32> for IdListMode {
    type Error = CodecError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => IdListMode::None,
            1 => IdListMode::CatchUp,
            2 => IdListMode::LastIrrCatchUp,
            3 => IdListMode::Normal,
            value => return Err(CodecError::UnknownEnumValue { kind: "id_list_mode", value }),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OrderedIds {
    pub mode: IdListMode,
    pub pending: u32,
    pub ids: Vec<Checksum256>,
}

impl OrderedIds {
    pub fn new(mode: IdListMode, pending: u32, ids: Vec<Checksum256>) -> Self {
        Self { mode, pending, ids }
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.mode == IdListMode::None || self.ids.is_empty()
    }
}

impl Packable for OrderedIds {
    fn pack(&self, enc: &mut Encoder) {
        enc.pack_u32(self.mode as u32);
        enc.pack_u32(self.pending);
        enc.pack_vec(&self.ids);
    }

    fn unpack(dec: &mut Decoder<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            mode: IdListMode::try_from(dec.unpack_u32()?)?,
            pending: dec.unpack_u32()?,
            ids: dec.unpack_vec()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NoticeMessage {
    pub known_trx: OrderedIds,
    pub known_blocks: OrderedIds,
}

impl Packable for NoticeMessage {
    fn pack(&self, enc: &mut Encoder) {
        enc.pack(&self.known_trx);
        enc.pack(&self.known_blocks);
    }

    fn unpack(dec: &mut Decoder<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            known_trx: dec.unpack()?,
            known_blocks: dec.unpack()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RequestMessage {
    pub req_trx: OrderedIds,
    pub req_blocks: OrderedIds,
}

impl RequestMessage {
    /// Asks the peer to relay every block after `anchor`, one by one.
    pub fn catch_up(anchor: Checksum256) -> Self {
        Self {
            req_trx: OrderedIds::none(),
            req_blocks: OrderedIds::new(IdListMode::CatchUp, 0, vec![anchor]),
        }
    }
}

impl Packable for RequestMessage {
    fn pack(&self, enc: &mut Encoder) {
        enc.pack(&self.req_trx);
        enc.pack(&self.req_blocks);
    }

    fn unpack(dec: &mut Decoder<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            req_trx: dec.unpack()?,
            req_blocks: dec.unpack()?,
        })
    }
}

/// Inclusive block range. `(0, 0)` cancels whatever range the peer is serving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncRequestMessage {
    start_block: u32,
    end_block: u32,
}

impl SyncRequestMessage {
    pub fn new(start_block: u32, end_block: u32) -> Result<Self, CodecError> {
        if start_block > end_block {
            return Err(CodecError::InvalidSyncRange { start: start_block, end: end_block });
        }
        Ok(Self { start_block, end_block })
    }

    pub fn reset() -> Self {
        Self { start_block: 0, end_block: 0 }
    }

    pub fn start_block(&self) -> u32 {
        self.start_block
    }

    pub fn end_block(&self) -> u32 {
        self.end_block
    }

    pub fn is_reset(&self) -> bool {
        self.start_block == 0 && self.end_block == 0
    }
}

impl Packable for SyncRequestMessage {
    fn pack(&self, enc: &mut Encoder) {
        enc.pack_u32(self.start_block);
        enc.pack_u32(self.end_block);
    }

    fn unpack(dec: &mut Decoder<'_>) -> Result<Self, CodecError> {
        let start = dec.unpack_u32()?;
        let end = dec.unpack_u32()?;
        Self::new(start, end)
    }
}

/// Network message types for block synchronization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Handshake(HandshakeMessage),
    ChainSize(ChainSizeMessage),
    GoAway(GoAwayMessage),
    Time(TimeMessage),
    Notice(NoticeMessage),
    Request(RequestMessage),
    SyncRequest(SyncRequestMessage),
    /// Packed signed block; only the chain engine decodes it fully.
    SignedBlock(Vec<u8>),
    /// Packed transaction, opaque to this crate.
    PackedTransaction(Vec<u8>),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Handshake(_) => MessageType::Handshake,
            Message::ChainSize(_) => MessageType::ChainSize,
            Message::GoAway(_) => MessageType::GoAway,
            Message::Time(_) => MessageType::Time,
            Message::Notice(_) => MessageType::Notice,
            Message::Request(_) => MessageType::Request,
            Message::SyncRequest(_) => MessageType::SyncRequest,
            Message::SignedBlock(_) => MessageType::SignedBlock,
            Message::PackedTransaction(_) => MessageType::PackedTransaction,
        }
    }

    pub fn pack_payload(&self, enc: &mut Encoder) {
        match self {
            Message::Handshake(m) => m.pack(enc),
            Message::ChainSize(m) => m.pack(enc),
            Message::GoAway(m) => m.pack(enc),
            Message::Time(m) => m.pack(enc),
            Message::Notice(m) => m.pack(enc),
            Message::Request(m) => m.pack(enc),
            Message::SyncRequest(m) => m.pack(enc),
            Message::SignedBlock(raw) | Message::PackedTransaction(raw) => enc.write_bytes(raw),
        }
    }

    /// Encodes the full frame: length prefix, tag and payload.
    pub fn to_frame(&self) -> Vec<u8> {
        let mut payload = Encoder::new();
        self.pack_payload(&mut payload);
        let payload = payload.into_bytes();

        let mut enc = Encoder::with_capacity(payload.len() + 5);
        enc.pack_u32(payload.len() as u32 + 1);
        enc.pack_u8(self.message_type() as u8);
        enc.write_bytes(&payload);
        enc.into_bytes()
    }

    /// Decodes the payload of a frame whose tag byte was `tag`.
    pub fn unpack(tag: u8, payload: &[u8]) -> Result<Self, CodecError> {
        let mut dec = Decoder::new(payload);
        Ok(match MessageType::try_from(tag)? {
            MessageType::Handshake => Message::Handshake(dec.unpack()?),
            MessageType::ChainSize => Message::ChainSize(dec.unpack()?),
            MessageType::GoAway => Message::GoAway(dec.unpack()?),
            MessageType::Time => Message::Time(dec.unpack()?),
            MessageType::Notice => Message::Notice(dec.unpack()?),
            MessageType::Request => Message::Request(dec.unpack()?),
            MessageType::SyncRequest => Message::SyncRequest(dec.unpack()?),
            MessageType::SignedBlock => Message::SignedBlock(dec.read_rest().to_vec()),
            MessageType::PackedTransaction => Message::PackedTransaction(dec.read_rest().to_vec()),
        })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Handshake(m) => write!(
                f,
                "Handshake(generation: {}, lib: {}, head: {}, head_id: {}, agent: {:?})",
                m.generation, m.last_irreversible_block_num, m.head_num, m.head_id, m.agent
            ),
            Message::SignedBlock(raw) => write!(f, "SignedBlock({} bytes)", raw.len()),
            Message::PackedTransaction(raw) => write!(f, "PackedTransaction({} bytes)", raw.len()),
            other => write!(f, "{:?}", other),
        }
    }
}
