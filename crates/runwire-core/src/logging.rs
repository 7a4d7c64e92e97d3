//! Tracing subscriber setup for application shells.
//!
//! The library only emits `tracing` events; it never installs a subscriber on
//! its own. Shells that want output call [`init`] once at startup.

use tracing_subscriber::EnvFilter;

/// Environment variable consulted for the filter directive.
pub const LOG_ENV: &str = "RUNWIRE_LOG";

/// Installs a compact stderr subscriber.
///
/// The filter comes from `RUNWIRE_LOG` when set, otherwise `default_filter`
/// (e.g. `"runwire_core=info"`). Subsequent calls are no-ops.
pub fn init(default_filter: &str) {
    let filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_filter));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact();

    let _ = subscriber.try_init();
}
