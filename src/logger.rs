//! Logging setup for the `photoba` binary.
//!
//! The library only emits `tracing` events; installing a subscriber is left to the binary.

use tracing::Level;

/// Install a formatted subscriber. `RUST_LOG` overrides `default_level`.
pub fn init_logger(default_level: Level) {
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();
    // try_init so that repeated calls (tests, embedding applications) are harmless
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Map the `--verbose`/`--debug` switches onto a level.
pub fn level_from_flags(verbose: bool, debug: bool) -> Level {
    if debug {
        Level::TRACE
    } else if verbose {
        Level::DEBUG
    } else {
        Level::INFO
    }
}

#[test]
fn test_level_from_flags() {
    assert_eq!(level_from_flags(false, false), Level::INFO);
    assert_eq!(level_from_flags(true, false), Level::DEBUG);
    assert_eq!(level_from_flags(true, true), Level::TRACE);
}
