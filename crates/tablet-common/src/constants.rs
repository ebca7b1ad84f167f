//! Protocol-wide constants for the tablet query service.

// =============================================================================
// Wire Protocol
// =============================================================================

/// Prefix every error carries when rendered for a caller.
pub const ERROR_PREFIX: &str = "error: ";

/// Prefix of the message attached to a fault caught by the panic guard.
pub const CAUGHT_PANIC_PREFIX: &str = "caught panic: ";

/// Default port the tablet server listens on.
pub const DEFAULT_PORT: u16 = 15991;

/// Maximum encoded size of a single frame payload (16 MB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

// =============================================================================
// Streaming
// =============================================================================

/// Default number of chunks a stream producer may run ahead of its consumer.
pub const DEFAULT_STREAM_BUFFER_SIZE: usize = 16;

/// Default number of rows coalesced into one streamed chunk.
pub const DEFAULT_STREAM_BATCH_ROWS: usize = 256;

// =============================================================================
// Query Splitting
// =============================================================================

/// Bind variable holding the inclusive lower bound of a split.
pub const SPLIT_START_BIND_VAR: &str = "_split_start";

/// Bind variable holding the exclusive upper bound of a split.
pub const SPLIT_END_BIND_VAR: &str = "_split_end";
