//! Block header decoding.
//!
//! A signed block arrives as opaque bytes. Only its header prefix is decoded
//! here, which is enough to learn the block number, id and timestamp before
//! handing the full payload to the chain engine.

use sha2::{Digest, Sha256};

use crate::codec::{Checksum256, Decoder, Encoder, Packable, PublicKey};
use crate::error::CodecError;

/// Milliseconds between the unix epoch and 2000-01-01T00:00:00Z.
pub const BLOCK_TIMESTAMP_EPOCH_MS: i64 = 946_684_800_000;
pub const BLOCK_INTERVAL_MS: i64 = 500;

/// Builds the id a peer would use for block `num` when it only knows the number.
pub fn make_block_id(num: u32) -> Checksum256 {
    let mut raw = [0u8; 32];
    raw[..4].copy_from_slice(&num.to_be_bytes());
    Checksum256(raw)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProducerKey {
    pub producer_name: u64,
    pub block_signing_key: PublicKey,
}

impl Packable for ProducerKey {
    fn pack(&self, enc: &mut Encoder) {
        enc.pack_u64(self.producer_name);
        enc.pack(&self.block_signing_key);
    }

    fn unpack(dec: &mut Decoder<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            producer_name: dec.unpack_u64()?,
            block_signing_key: dec.unpack()?,
        })
    }
}

/// Legacy producer schedule carried by pre-wtmsig blocks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProducerSchedule {
    pub version: u32,
    pub producers: Vec<ProducerKey>,
}

impl Packable for ProducerSchedule {
    fn pack(&self, enc: &mut Encoder) {
        enc.pack_u32(self.version);
        enc.pack_vec(&self.producers);
    }

    fn unpack(dec: &mut Decoder<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            version: dec.unpack_u32()?,
            producers: dec.unpack_vec()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeaderExtension {
    pub id: u16,
    pub data: Vec<u8>,
}

impl Packable for HeaderExtension {
    fn pack(&self, enc: &mut Encoder) {
        enc.pack_u16(self.id);
        enc.pack_bytes(&self.data);
    }

    fn unpack(dec: &mut Decoder<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            id: dec.unpack_u16()?,
            data: dec.unpack_bytes()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    /// Half-second slots since [`BLOCK_TIMESTAMP_EPOCH_MS`].
    pub timestamp: u32,
    pub producer: u64,
    pub confirmed: u16,
    pub previous: Checksum256,
    pub transaction_mroot: Checksum256,
    pub action_mroot: Checksum256,
    pub schedule_version: u32,
    pub new_producers: Option<ProducerSchedule>,
    pub header_extensions: Vec<HeaderExtension>,
}

impl BlockHeader {
    /// Number of this block; the previous id carries the parent's number.
    pub fn block_num(&self) -> u32 {
        self.previous.block_num().wrapping_add(1)
    }

    pub fn block_time_ms(&self) -> i64 {
        i64::from(self.timestamp) * BLOCK_INTERVAL_MS + BLOCK_TIMESTAMP_EPOCH_MS
    }

    pub fn digest(&self) -> [u8; 32] {
        Sha256::digest(self.to_bytes()).into()
    }

    /// Block number in the first four bytes (big-endian), header digest in the rest.
    pub fn calculate_id(&self) -> Checksum256 {
        let mut id = self.digest();
        id[..4].copy_from_slice(&self.block_num().to_be_bytes());
        Checksum256(id)
    }
}

impl Packable for BlockHeader {
    fn pack(&self, enc: &mut Encoder) {
        enc.pack_u32(self.timestamp);
        enc.pack_u64(self.producer);
        enc.pack_u16(self.confirmed);
        enc.pack(&self.previous);
        enc.pack(&self.transaction_mroot);
        enc.pack(&self.action_mroot);
        enc.pack_u32(self.schedule_version);
        enc.pack_optional(self.new_producers.as_ref());
        enc.pack_vec(&self.header_extensions);
    }

    fn unpack(dec: &mut Decoder<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            timestamp: dec.unpack_u32()?,
            producer: dec.unpack_u64()?,
            confirmed: dec.unpack_u16()?,
            previous: dec.unpack()?,
            transaction_mroot: dec.unpack()?,
            action_mroot: dec.unpack()?,
            schedule_version: dec.unpack_u32()?,
            new_producers: dec.unpack_optional()?,
            header_extensions: dec.unpack_vec()?,
        })
    }
}
