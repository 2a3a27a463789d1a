//! Shared protocol constants for the blocksync wire format

/// Record tag for an all-zero block: the payload is omitted and the target
/// punches (or zero-fills) the range instead.
pub const HOLE: u8 = 0;
/// Record tag for a literal block followed by its payload.
pub const BLOCK: u8 = 1;

/// Default block size. Both peers must agree on the block size out of band;
/// it must be a positive multiple of 4096.
pub const DEFAULT_BLOCK_SIZE: u64 = 64 * 1024;

/// BLAKE2b-512 digest length in bytes.
pub const HASH_LENGTH: usize = 64;

/// Length of the proxy session identifier (an md5 hex digest, used opaquely).
pub const IDENTIFIER_LENGTH: usize = 32;

/// Base port for proxied backend sync servers; worker `i` binds `base + i`.
pub const BACKEND_BASE_PORT: u16 = 3222;

// Dial retry budgets (attempts x interval)
pub mod retry {
    use std::time::Duration;

    /// Sync client -> sync server.
    pub const SYNC_ATTEMPTS: u32 = 30;
    pub const SYNC_INTERVAL: Duration = Duration::from_secs(10);

    /// Proxy client -> proxy server.
    pub const PROXY_ATTEMPTS: u32 = 30;
    pub const PROXY_INTERVAL: Duration = Duration::from_secs(1);

    /// Proxy server -> freshly launched backend; unbounded.
    pub const BACKEND_INTERVAL: Duration = Duration::from_secs(1);
}

/// Whether `block_size` is acceptable: positive and a multiple of 4096.
pub fn valid_block_size(block_size: u64) -> bool {
    block_size > 0 && block_size % 4096 == 0
}
