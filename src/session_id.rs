//! Session identifier (spec §3.2).
//!
//! Opaque, equality-comparable value pairing a logical prefix (the
//! session owner's configured logical address) with a physical
//! address (transport-assigned, e.g. a socket endpoint or process
//! tag). Has a compact textual form suitable as a store dictionary
//! key, built the same way `path_key` builds one: a deterministic
//! encoding run through a fixed-width text codec (here base64 rather
//! than hex, since the identifier carries two variable-length byte
//! strings that need to round-trip, not just a fixed digest).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Identity of a coordination session. Two identifiers are equal iff
/// both their prefix and physical address bytes are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId {
    prefix: Vec<u8>,
    physical_address: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionIdError {
    #[error("physical address must be non-empty")]
    EmptyPhysicalAddress,
    #[error("malformed compact session id: {0}")]
    Malformed(String),
}

impl SessionId {
    pub fn new(
        prefix: impl Into<Vec<u8>>,
        physical_address: impl Into<Vec<u8>>,
    ) -> Result<Self, SessionIdError> {
        let physical_address = physical_address.into();
        if physical_address.is_empty() {
            return Err(SessionIdError::EmptyPhysicalAddress);
        }
        Ok(Self {
            prefix: prefix.into(),
            physical_address,
        })
    }

    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    pub fn physical_address(&self) -> &[u8] {
        &self.physical_address
    }

    /// Compact textual form: base64 of `len(prefix) | prefix |
    /// physical_address`, usable directly as an external-store key.
    pub fn compact(&self) -> String {
        let mut buf = Vec::with_capacity(4 + self.prefix.len() + self.physical_address.len());
        buf.extend_from_slice(&(self.prefix.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.prefix);
        buf.extend_from_slice(&self.physical_address);
        BASE64.encode(buf)
    }

    pub fn from_compact(text: &str) -> Result<Self, SessionIdError> {
        let buf = BASE64
            .decode(text)
            .map_err(|e| SessionIdError::Malformed(e.to_string()))?;
        if buf.len() < 4 {
            return Err(SessionIdError::Malformed("truncated length prefix".into()));
        }
        let prefix_len = u32::from_be_bytes(buf[0..4].try_into().unwrap()) as usize;
        if buf.len() < 4 + prefix_len {
            return Err(SessionIdError::Malformed("truncated prefix".into()));
        }
        let prefix = buf[4..4 + prefix_len].to_vec();
        let physical_address = buf[4 + prefix_len..].to_vec();
        if physical_address.is_empty() {
            return Err(SessionIdError::EmptyPhysicalAddress);
        }
        Ok(Self {
            prefix,
            physical_address,
        })
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.compact())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_roundtrips() {
        let id = SessionId::new(b"node-a".to_vec(), b"10.0.0.1:4000".to_vec()).unwrap();
        let text = id.compact();
        let back = SessionId::from_compact(&text).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn empty_physical_address_rejected() {
        assert_eq!(
            SessionId::new(b"node-a".to_vec(), Vec::<u8>::new()),
            Err(SessionIdError::EmptyPhysicalAddress)
        );
    }

    #[test]
    fn distinct_addresses_are_not_equal() {
        let a = SessionId::new(b"p".to_vec(), b"addr-1".to_vec()).unwrap();
        let b = SessionId::new(b"p".to_vec(), b"addr-2".to_vec()).unwrap();
        assert_ne!(a, b);
    }
}
