//! Logging and tracing configuration
//!
//! The library only emits `tracing` events; applications embedding it
//! choose the subscriber. These helpers install a reasonable default.
//!
//! # Log Levels
//!
//! - `warn`  - tainted tables corrected, checksum mismatches, skipped sections
//! - `info`  - image opened, verification summary
//! - `debug` - segment walks, descriptor runs filled and evicted
//! - `trace` - per-entry and per-chunk detail
//!
//! # Environment Variable Control
//!
//! Set `RUST_LOG` to control log levels at runtime:
//! ```bash
//! RUST_LOG=ewf_chunk_table=trace                         # Everything from this crate
//! RUST_LOG=ewf_chunk_table::chunk_table=debug,warn       # Table layer only
//! ```

use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize the logging/tracing system
///
/// Call once at application startup; later calls are ignored.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        // Default: info in release, debug in debug builds
        if cfg!(debug_assertions) {
            EnvFilter::new("ewf_chunk_table=debug")
        } else {
            EnvFilter::new("ewf_chunk_table=info")
        }
    });

    let subscriber = tracing_subscriber::registry().with(filter).with(
        fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact(),
    );

    // Ignore error if a subscriber is already set
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Initialize logging with verbose output (file:line, thread IDs)
///
/// Useful when following a verification run across rayon worker threads.
pub fn init_verbose() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ewf_chunk_table=trace"));

    let subscriber = tracing_subscriber::registry().with(filter).with(
        fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .pretty(),
    );

    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Check if debug logging is enabled
/// Can be used to skip expensive debug computations
#[inline]
pub fn is_debug_enabled() -> bool {
    tracing::enabled!(Level::DEBUG)
}
