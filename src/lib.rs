//! Blocksync Library
//!
//! Differential block-level synchronization of a large file (disk image or
//! block device) from a source host to a target host over a single TCP
//! stream. Only blocks whose BLAKE2b-512 digests differ are transferred, and
//! all-zero blocks travel as hole markers so sparse regions stay sparse.
//! The proxy module multiplexes several syncs over one listening port by
//! prefixing each connection with a session identifier.

pub mod block_stream;
pub mod client;
pub mod error;
pub mod hasher;
pub mod progress;
pub mod protocol;
pub mod proxy;
pub mod server;
pub mod sparse;

/// Options shared by the source and target roles.
#[derive(Clone, Debug)]
pub struct SyncOptions {
    /// Block size in bytes; must be a positive multiple of 4096 and equal on
    /// both peers.
    pub block_size: u64,
    /// Write zeros for incoming holes instead of punching them.
    pub preallocate: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        SyncOptions {
            block_size: protocol::DEFAULT_BLOCK_SIZE,
            preallocate: false,
        }
    }
}
