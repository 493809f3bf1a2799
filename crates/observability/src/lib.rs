//! Process logging for the `marketsync` binary.

/// Tracing configuration (filters, output format).
pub mod tracing;

pub use tracing::LogFormat;

/// Install the process-wide subscriber. Later calls are no-ops.
pub fn init(format: LogFormat) {
    tracing::init(format);
}
