//! Process-wide tracing subscriber.
//!
//! The library only emits `tracing` events; binaries call [`init`] once at
//! startup. `RUST_LOG` takes precedence over the level passed in.

use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber filtered at `level` (e.g. "info", "debug").
///
/// Returns `false` when a global subscriber was already installed, in which
/// case nothing changes.
pub fn init(level: &str) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_a_no_op() {
        init("debug");
        assert!(!init("info"));
    }
}
