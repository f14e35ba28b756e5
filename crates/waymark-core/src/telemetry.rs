//! Centralised tracing initialisation for waymark binaries.
//!
//! Call [`init_tracing`] once at program start to configure the global
//! subscriber with an `EnvFilter` and optional JSON formatting. Later calls
//! are ignored.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable holding an `EnvFilter` directive.
pub const LOG_ENV: &str = "WAYMARK_LOG";
/// Set to `json` to force JSON output.
pub const LOG_FORMAT_ENV: &str = "WAYMARK_LOG_FORMAT";

/// Initialise the global tracing subscriber.
///
/// * `json` — emit newline-delimited JSON. `WAYMARK_LOG_FORMAT=json` forces it.
/// * `level` — default verbosity when `WAYMARK_LOG` is not set.
///
/// Logs go to stderr so stdout stays clean for results.
pub fn init_tracing(json: bool, level: Level) {
    let env_filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    let json = json
        || std::env::var(LOG_FORMAT_ENV)
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr).json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
            .ok();
    }
}
