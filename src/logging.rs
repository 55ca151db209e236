//! Logging setup.
//!
//! Library code only emits `tracing` events. Test binaries and the CLI call
//! [`init`] once to install a subscriber. `RUST_LOG` takes precedence over the
//! default level.

use tracing_subscriber::EnvFilter;

/// Installs a global `tracing` subscriber writing to stderr.
///
/// The default level is `info`, or `debug` for this crate when `debug` is
/// set (`DEBUG_TESTDEPS`). Calling it again is a no-op.
pub fn init(debug: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug)));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn default_directive(debug: bool) -> &'static str {
    if debug { "info,testdeps=debug" } else { "info" }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init(false);
        init(true);
    }

    #[test]
    fn test_default_directive() {
        assert_eq!(default_directive(false), "info");
        assert!(default_directive(true).contains("testdeps=debug"));
    }
}
