pub mod config;
pub mod err;
pub mod log;
pub mod structure;

/// Default write queue watermarks, in bytes. Crossing the high mark fires
/// backpressure callbacks once per crossing; draining below the low mark
/// releases them.
pub const DEFAULT_WRITEQ_HIGH_WATER: u64 = 16 * 1024 * 1024;
pub const DEFAULT_WRITEQ_LOW_WATER: u64 = 8 * 1024 * 1024;

/// Load averaging window of a worker, milliseconds.
pub const LOAD_GRANULARITY_MS: i64 = 1000;
