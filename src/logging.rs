use std::io;

use tracing::level_filters::LevelFilter;

/// Install the stderr subscriber. Debug builds log at `INFO`, release builds
/// at `WARN`; each `-v` raises one level and `quiet` keeps only errors.
pub fn init(verbose: u8, quiet: bool) {
    let level = if quiet {
        LevelFilter::ERROR
    } else {
        let base: u8 = if cfg!(debug_assertions) { 2 } else { 1 };
        match base.saturating_add(verbose) {
            0 => LevelFilter::ERROR,
            1 => LevelFilter::WARN,
            2 => LevelFilter::INFO,
            3 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    };

    // Stdout carries status lines and CSV, so logs stay on stderr.
    let _ = tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_max_level(level)
        .with_thread_names(true)
        .with_target(false)
        .try_init();
}
