pub mod connection;

pub use connection::{CdcConnection, CdcConnectionOptions, CdcError, CdcRow};

/// Timeout constants
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;
