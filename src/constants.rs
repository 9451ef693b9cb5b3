//! Fixed bounds for the wire protocol and connection pool.
//!
//! Tiger Style: every buffer and table in the crate has an explicit bound
//! declared here; nothing grows without one.

use std::time::Duration;

/// Wire header length in bytes: `len` and `nonce` as little-endian u32s,
/// then `op` and `tag` as single bytes.
pub const HEADER_LEN: usize = 10;

/// Maximum body length of a single frame (1 MiB). Also the per-frame
/// allocation cap on the read path.
pub const MAX_FRAME_LEN: u32 = 1024 * 1024;

/// Number of slots in the in-flight RPC table. Power of two; a nonce maps
/// to slot `nonce & (RPC_TABLE_CAPACITY - 1)`.
pub const RPC_TABLE_CAPACITY: u32 = 65_536;

/// Soft cap on a connection's outbound buffer (64 KiB). Writers park once
/// the buffer holds more than this; a single append may still exceed it.
pub const OUTBOUND_SOFT_CAP: usize = 64 * 1024;

/// Default number of pooled connections a client grows toward.
pub const DEFAULT_POOL_CAPACITY: usize = 4;

/// Base delay of the reconnect backoff schedule (doubles per failure).
pub const BACKOFF_BASE_MS: u64 = 10;

/// Ceiling of the reconnect backoff schedule.
pub const BACKOFF_CAP_MS: u64 = 3_000;

/// Default bound on a single dial.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on the final flush a write loop performs after cancellation.
pub const WRITE_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Initial capacity of a connection's read FIFO.
pub const READ_BUFFER_SIZE: usize = 8 * 1024;
