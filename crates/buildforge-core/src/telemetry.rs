//! Log setup for `buildforge` and `buildforged`.
//!
//! The CLI prints its command result as JSON on stdout, so every log line,
//! plain or JSON, is written to stderr. The daemon uses the same setup with
//! `--json` when its output feeds a log collector.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the process-wide subscriber on stderr.
///
/// `level` is the fallback filter (`--log-level`, or `--verbose` for the CLI);
/// `RUST_LOG` overrides it, e.g. `RUST_LOG=buildforge_core::toolchain=debug`
/// to trace toolchain invocations only. A second call is a no-op, which lets
/// tests initialise logging freely.
pub fn init_tracing(json: bool, level: Level) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if json {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr).json())
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
    };
    result.ok();
}

/// Map a `--log-level` style string onto a [`Level`], defaulting to `INFO`.
pub fn parse_level(raw: &str) -> Level {
    raw.parse().unwrap_or(Level::INFO)
}
