//! Tracing/logging bootstrap, grounded in the teacher's
//! `tasker_shared::logging::init_tracing` entry point used by its server
//! binary.

use tracing_subscriber::{fmt, EnvFilter};

/// Install a global `tracing` subscriber reading `RUST_LOG` (default
/// `info`), human-readable by default, JSON when `NODEGRID_LOG_JSON=1`.
///
/// Idempotent: a second call is a no-op rather than a panic, so embedding
/// code (and tests) can call it freely.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json = std::env::var("NODEGRID_LOG_JSON")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let result = if json {
        fmt().with_env_filter(filter).json().try_init()
    } else {
        fmt().with_env_filter(filter).try_init()
    };

    if let Err(e) = result {
        tracing::trace!("tracing subscriber already installed: {e}");
    }
}
