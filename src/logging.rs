// Minimal tracing-subscriber bootstrap.
//
// Rich per-module log-level configuration (the teacher's `LogConfig` /
// `LogValue` filter list in `forest/shared/src/cli/config.rs`) is explicitly
// out of scope here (spec §1); this is deliberately the thin remainder of
// that idea — one `EnvFilter` directive string, set once at startup.

use tracing_subscriber::{fmt, EnvFilter};

/// Installs a global `tracing` subscriber. `default_filter` is used when
/// `RUST_LOG` is unset.
pub fn init(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
