//! Logging initialisation shared by both daemon entry points.
//!
//! Level is controlled by `RUST_LOG` in the usual `tracing-subscriber`
//! way; `ExtendedLogging` in the configuration additionally unlocks
//! `debug`/`trace` output for the diff engine and sync loop without the
//! caller having to know the module paths to enable.

use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info";
const EXTENDED_FILTER: &str = "info,vaultsync::diff=debug,vaultsync::client::sync=debug";

/// `%Y-%m-%dT%H:%M:%S%.3f%:z`, close enough to RFC 3339 for log readers and
/// cheap enough to format once per line.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f%:z";

/// Installs the global `tracing` subscriber. Safe to call once per
/// process; a second call is a no-op (the underlying `set_global_default`
/// error is ignored since tests may initialise logging more than once).
pub fn init(extended: bool) {
    let filter = if extended { EXTENDED_FILTER } else { DEFAULT_FILTER };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_timer(ChronoLocal::new(TIMESTAMP_FORMAT.to_string()))
        .try_init();
}
