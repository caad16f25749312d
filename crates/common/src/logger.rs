//! Process-wide tracing bootstrap.
//!
//! Every binary in the workspace funnels through this so that verbosity
//! flags behave identically across the CLIs.

use std::sync::Once;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

pub struct Logger;

impl Logger {
    pub fn init() {
        Self::init_with_level(LevelFilter::INFO)
    }

    /// Installs the global subscriber at the given level. The `RUST_LOG`
    /// environment variable still overrides per-module directives.
    pub fn init_with_level(level: LevelFilter) {
        INIT.call_once(|| {
            let filter = EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy();

            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_file(true)
                .with_line_number(true)
                .without_time()
                .init();
        });
    }

    /// Maps `-v` occurrence counts and `-q` onto a level filter.
    pub fn level_from_flags(quiet: bool, verbose: u8) -> LevelFilter {
        if quiet {
            return LevelFilter::ERROR;
        }
        match verbose {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    }
}
