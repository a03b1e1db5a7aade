use std::fmt;

use rand::RngCore;

use super::{Decoder, Encoder, Packable};
use crate::error::CodecError;

/// 32-byte digest used for chain ids, node ids and block ids.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Checksum256(pub [u8; 32]);

impl Checksum256 {
    pub const LEN: usize = 32;

    pub fn empty() -> Self {
        Self([0u8; 32])
    }

    pub fn random() -> Self {
        let mut raw = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut raw);
        Self(raw)
    }

    pub fn from_slice(raw: &[u8]) -> Result<Self, CodecError> {
        let arr: [u8; 32] = raw.try_into().map_err(|_| CodecError::InvalidLength {
            expected: Self::LEN,
            actual: raw.len(),
        })?;
        Ok(Self(arr))
    }

    pub fn from_hex(s: &str) -> Result<Self, CodecError> {
        let raw = hex::decode(s).map_err(|e| CodecError::InvalidHex(e.to_string()))?;
        Self::from_slice(&raw)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Block number embedded in the first four bytes of a block id.
    pub fn block_num(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }
}

impl fmt::Display for Checksum256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Checksum256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum256({})", self)
    }
}

impl Packable for Checksum256 {
    fn pack(&self, enc: &mut Encoder) {
        enc.write_bytes(&self.0);
    }

    fn unpack(dec: &mut Decoder<'_>) -> Result<Self, CodecError> {
        Self::from_slice(dec.read_bytes(Self::LEN)?)
    }
}

/// Key type byte followed by a 33-byte compressed point.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey(pub [u8; 34]);

impl PublicKey {
    pub const LEN: usize = 34;

    pub fn empty() -> Self {
        Self([0u8; 34])
    }
}

impl Default for PublicKey {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.0))
    }
}

impl Packable for PublicKey {
    fn pack(&self, enc: &mut Encoder) {
        enc.write_bytes(&self.0);
    }

    fn unpack(dec: &mut Decoder<'_>) -> Result<Self, CodecError> {
        let mut raw = [0u8; 34];
        raw.copy_from_slice(dec.read_bytes(Self::LEN)?);
        Ok(Self(raw))
    }
}

/// Key type byte followed by a 65-byte recoverable signature.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature(pub [u8; 66]);

impl Signature {
    pub const LEN: usize = 66;

    pub fn empty() -> Self {
        Self([0u8; 66])
    }
}

impl Default for Signature {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", hex::encode(self.0))
    }
}

impl Packable for Signature {
    fn pack(&self, enc: &mut Encoder) {
        enc.write_bytes(&self.0);
    }

    fn unpack(dec: &mut Decoder<'_>) -> Result<Self, CodecError> {
        let mut raw = [0u8; 66];
        raw.copy_from_slice(dec.read_bytes(Self::LEN)?);
        Ok(Self(raw))
    }
}
