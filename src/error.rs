use thiserror::Error;

/// Failures while packing or unpacking binary data.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("unexpected end of buffer: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof { needed: usize, remaining: usize },
    #[error("variable-length integer exceeds 32 bits")]
    VarintOverflow,
    #[error("invalid utf-8 string: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    #[error("invalid length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("invalid hex: {0}")]
    InvalidHex(String),
    #[error("unknown {kind} value: {value}")]
    UnknownEnumValue { kind: &'static str, value: u32 },
    #[error("unknown message tag: {0}")]
    UnknownTag(u8),
    #[error("sync request start block {start} is greater than end block {end}")]
    InvalidSyncRange { start: u32, end: u32 },
}

/// Faults raised by the chain engine when a block is pushed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("unlinkable block")]
    UnlinkableBlock,
    #[error("fork database error: {0}")]
    ForkDatabase(String),
    #[error("database guard exception: {0}")]
    DatabaseGuard(String),
    #[error("chain error: {0}")]
    Other(String),
}

impl ChainError {
    pub const ALREADY_KNOWN: &'static str = "we already know about this block";

    /// A fork database fault reporting a block that is already stored.
    pub fn is_already_known(&self) -> bool {
        matches!(self, ChainError::ForkDatabase(msg) if msg.starts_with(Self::ALREADY_KNOWN))
    }
}

/// Transport and dialing failures.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad message length: {0}")]
    BadFrameLength(u32),
    #[error("invalid peer address: {0}")]
    InvalidPeerAddress(String),
    #[error("SOCKS5 error: {0}")]
    Socks5(String),
    #[error("TLS error: {0}")]
    Tls(String),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("connection closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_already_known_classification() {
        let known = ChainError::ForkDatabase(format!("{}: 00000005abcd", ChainError::ALREADY_KNOWN));
        assert!(known.is_already_known());
        assert!(!ChainError::ForkDatabase("block does not link".into()).is_already_known());
        assert!(!ChainError::DatabaseGuard(ChainError::ALREADY_KNOWN.into()).is_already_known());
    }
}
