//! Tracing bootstrap for hosts embedding the engine.
//!
//! The engine crates only emit `tracing` events; installing a subscriber is
//! the host's call. This helper installs the same `fmt` + `EnvFilter`
//! subscriber the rest of the stack uses, defaulting to `info` when
//! `RUST_LOG` is unset.

use tracing_subscriber::EnvFilter;

/// Install a global fmt subscriber. Returns `false` if one was already set.
pub fn init_tracing(json: bool) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.is_ok()
}
