//! Binary packing primitives shared by the wire protocol and block headers.
//!
//! All integers are little-endian. Lengths of strings, byte arrays and
//! vectors are written as variable-length unsigned integers: 7-bit groups,
//! least significant first, with bit 7 set on every byte but the last.

pub mod types;

pub use types::{Checksum256, PublicKey, Signature};

use crate::error::CodecError;

/// A value with a fixed binary encoding.
pub trait Packable: Sized {
    fn pack(&self, enc: &mut Encoder);
    fn unpack(dec: &mut Decoder<'_>) -> Result<Self, CodecError>;

    fn to_bytes(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        self.pack(&mut enc);
        enc.into_bytes()
    }

    /// Decodes a value from the start of `data`; trailing bytes are ignored.
    fn from_bytes(data: &[u8]) -> Result<Self, CodecError> {
        let mut dec = Decoder::new(data);
        Self::unpack(&mut dec)
    }
}

#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { buf: Vec::with_capacity(capacity) }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_bytes(&mut self, raw: &[u8]) {
        self.buf.extend_from_slice(raw);
    }

    pub fn pack<T: Packable>(&mut self, value: &T) {
        value.pack(self);
    }

    pub fn pack_u8(&mut self, n: u8) {
        self.buf.push(n);
    }

    pub fn pack_u16(&mut self, n: u16) {
        self.write_bytes(&n.to_le_bytes());
    }

    pub fn pack_i16(&mut self, n: i16) {
        self.write_bytes(&n.to_le_bytes());
    }

    pub fn pack_u32(&mut self, n: u32) {
        self.write_bytes(&n.to_le_bytes());
    }

    pub fn pack_u64(&mut self, n: u64) {
        self.write_bytes(&n.to_le_bytes());
    }

    pub fn pack_i64(&mut self, n: i64) {
        self.write_bytes(&n.to_le_bytes());
    }

    pub fn pack_length(&mut self, mut val: u32) {
        loop {
            let mut b = (val & 0x7f) as u8;
            val >>= 7;
            if val > 0 {
                b |= 0x80;
            }
            self.buf.push(b);
            if val == 0 {
                break;
            }
        }
    }

    pub fn pack_bytes(&mut self, data: &[u8]) {
        self.pack_length(data.len() as u32);
        self.write_bytes(data);
    }

    pub fn pack_string(&mut self, s: &str) {
        self.pack_bytes(s.as_bytes());
    }

    pub fn pack_vec<T: Packable>(&mut self, items: &[T]) {
        self.pack_length(items.len() as u32);
        for item in items {
            item.pack(self);
        }
    }

    pub fn pack_optional<T: Packable>(&mut self, value: Option<&T>) {
        match value {
            Some(v) => {
                self.pack_u8(1);
                v.pack(self);
            }
            None => self.pack_u8(0),
        }
    }
}

/// Cursor over a borrowed byte buffer.
#[derive(Debug)]
pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < len {
            return Err(CodecError::UnexpectedEof {
                needed: len,
                remaining: self.remaining(),
            });
        }
        let out = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    pub fn read_rest(&mut self) -> &'a [u8] {
        let out = &self.data[self.pos..];
        self.pos = self.data.len();
        out
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn unpack<T: Packable>(&mut self) -> Result<T, CodecError> {
        T::unpack(self)
    }

    pub fn unpack_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn unpack_u16(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    pub fn unpack_i16(&mut self) -> Result<i16, CodecError> {
        Ok(i16::from_le_bytes(self.read_array()?))
    }

    pub fn unpack_u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn unpack_u64(&mut self) -> Result<u64, CodecError> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    pub fn unpack_i64(&mut self) -> Result<i64, CodecError> {
        Ok(i64::from_le_bytes(self.read_array()?))
    }

    pub fn unpack_length(&mut self) -> Result<u32, CodecError> {
        let mut value: u64 = 0;
        let mut shift = 0u32;
        loop {
            let b = self.unpack_u8()?;
            value |= u64::from(b & 0x7f) << shift;
            if b & 0x80 == 0 {
                break;
            }
            shift += 7;
            if shift > 28 {
                return Err(CodecError::VarintOverflow);
            }
        }
        u32::try_from(value).map_err(|_| CodecError::VarintOverflow)
    }

    pub fn unpack_bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.unpack_length()? as usize;
        Ok(self.read_bytes(len)?.to_vec())
    }

    pub fn unpack_string(&mut self) -> Result<String, CodecError> {
        let raw = self.unpack_bytes()?;
        String::from_utf8(raw).map_err(CodecError::InvalidUtf8)
    }

    pub fn unpack_vec<T: Packable>(&mut self) -> Result<Vec<T>, CodecError> {
        let len = self.unpack_length()? as usize;
        // every element occupies at least one byte
        if len > self.remaining() {
            return Err(CodecError::UnexpectedEof {
                needed: len,
                remaining: self.remaining(),
            });
        }
        let mut out = Vec::with_capacity(len);
        for _ in 0..len {
            out.push(T::unpack(self)?);
        }
        Ok(out)
    }

    pub fn unpack_optional<T: Packable>(&mut self) -> Result<Option<T>, CodecError> {
        if self.unpack_u8()? == 0 {
            return Ok(None);
        }
        Ok(Some(T::unpack(self)?))
    }
}
