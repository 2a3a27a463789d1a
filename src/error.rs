//! Error kinds callers need to tell apart
//!
//! Most of the crate propagates `anyhow::Error`; the variants here cover the
//! conditions with distinct handling or operator-facing messages, and travel
//! inside `anyhow::Error` so call sites can downcast when they care.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("block size must be a positive multiple of 4096, got {0}")]
    InvalidBlockSize(u64),

    #[error("block size mismatch: local {local}, peer {peer}")]
    BlockSizeMismatch { local: u64, peer: u64 },

    #[error("unable to connect to {address} after {retries} retries")]
    Unreachable { address: String, retries: u32 },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("this filesystem does not support punching holes, use xfs, ext4, btrfs or similar")]
    HolePunchUnsupported,

    #[error("identifier must be {expected} bytes, got {actual}")]
    IdentifierLength { expected: usize, actual: usize },

    #[error("no file path mapped for identifier {0}")]
    UnknownIdentifier(String),
}
