//! Node key and wire handle codec
//!
//! A node's wire handle is its store key, copied verbatim. The server
//! persists these bytes and clients present them back after reconnects;
//! decode revalidates the key against the store before any handle is
//! reconstructed.

use crate::error::{FsalError, Result};

/// Size in bytes of a store node key, and therefore of a wire handle.
pub const NODE_KEY_SIZE: usize = 24;

/// Fixed-size binary key uniquely naming a store node.
///
/// Stable for the life of the object; renames do not change it. Produced
/// once at handle construction and immutable afterwards.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct NodeKey([u8; NODE_KEY_SIZE]);

impl NodeKey {
    /// Wraps raw key bytes.
    pub fn new(bytes: [u8; NODE_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// The raw key bytes.
    pub fn as_bytes(&self) -> &[u8; NODE_KEY_SIZE] {
        &self.0
    }

    /// Parses a client-presented wire handle.
    ///
    /// The length must match the key size exactly; anything else is an
    /// invalid argument regardless of content.
    pub fn from_wire(bytes: &[u8]) -> Result<NodeKey> {
        if bytes.len() != NODE_KEY_SIZE {
            return Err(FsalError::inval());
        }
        let mut key = [0u8; NODE_KEY_SIZE];
        key.copy_from_slice(bytes);
        Ok(NodeKey(key))
    }
}

/// Wire digest kinds the server may request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DigestKind {
    /// NFSv3 file handle.
    Nfsv3,
    /// NFSv4 file handle.
    Nfsv4,
    /// Host-endian file id digest; not produced by this FSAL.
    FileId,
}

/// Copies `key` into `out` for a digest request, returning the digest
/// length.
///
/// Only the NFSv3 and NFSv4 digests are supported; any other kind is a
/// server fault. An output buffer smaller than the key is reported as
/// too small.
pub fn digest_key(kind: DigestKind, key: &NodeKey, out: &mut [u8]) -> Result<usize> {
    match kind {
        DigestKind::Nfsv3 | DigestKind::Nfsv4 => {
            if out.len() < NODE_KEY_SIZE {
                return Err(FsalError::too_small());
            }
            out[..NODE_KEY_SIZE].copy_from_slice(key.as_bytes());
            Ok(NODE_KEY_SIZE)
        }
        DigestKind::FileId => Err(FsalError::server_fault()),
    }
}
