//! `tracing` setup, grounded on the teacher workspace's own
//! `warpgate::logging::init_logging` (offset-aware timestamps, `RUST_LOG`
//! driven by a verbosity count when unset, `tracing_log::LogTracer` so any
//! crate still emitting through `log` is captured too).

use anyhow::{Context, Result};
use time::UtcOffset;
use tracing_log::LogTracer;
use tracing_subscriber::fmt::time::OffsetTime;
use tracing_subscriber::EnvFilter;

/// `-d`/`-i` map onto increasing verbosity the same way `warpgate`'s `-d`
/// flag count does; `0` is the default foreground level.
pub fn init_logging(verbosity: u8) -> Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        let directive = match verbosity {
            0 => "scagent=info",
            1 => "scagent=debug",
            _ => "debug",
        };
        std::env::set_var("RUST_LOG", directive);
    }

    LogTracer::init().context("failed to initialize log compatibility layer")?;

    let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
    let timer = OffsetTime::new(offset, time::format_description::well_known::Rfc3339);

    tracing_subscriber::fmt()
        .with_timer(timer)
        .with_env_filter(EnvFilter::from_default_env())
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))
}
