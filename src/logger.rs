//! Log setup for the snapsync CLI.
//!
//! Transfer output from the rsync driver and decision logging from the
//! ops layer both go through `tracing`; this wires them to stderr. The
//! effective level is resolved from, in order, the `RUST_LOG`
//! environment variable, the `--log-level` flag and the configured
//! `log_level`.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber.
pub fn init(flag_level: Option<&str>, config_level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level_filter(flag_level, config_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// The flag wins over the config value; an unparsable level falls back
/// to `info` rather than failing the whole invocation.
fn level_filter(flag_level: Option<&str>, config_level: &str) -> EnvFilter {
    EnvFilter::try_new(flag_level.unwrap_or(config_level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
