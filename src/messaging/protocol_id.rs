use std::fmt::{Debug, Formatter};

/// Identifies the protocol layer a message belongs to. It is sent as part of every message's
///  envelope and used for dispatching on the receiving side.
///
/// An id is technically a u64, but it is intended to be a sequence of up to eight ASCII
///  characters, which keeps it human-readable both in code and on the wire.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ProtocolId(pub u64);

impl ProtocolId {
    pub const fn new(value: &[u8; 8]) -> ProtocolId {
        Self(u64::from_be_bytes(*value))
    }
}

impl Debug for ProtocolId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let bytes = self.0.to_be_bytes();
        let len = bytes.iter()
            .position(|&b| b == 0)
            .unwrap_or(bytes.len());

        match std::str::from_utf8(&bytes[..len]) {
            Ok(s) => write!(f, "{}", s),
            Err(_) => write!(f, "0x{:016X}", self.0),
        }
    }
}
