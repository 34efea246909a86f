//! Tracing setup for the `phasegate` binary.
//!
//! Logs always go to stderr so stdout stays reserved for command output
//! (plans, defect lists, gate verdicts). Filtering follows `PHASEGATE_LOG`,
//! then `RUST_LOG`, then the level passed by the caller.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable consulted before `RUST_LOG`.
pub const LOG_ENV: &str = "PHASEGATE_LOG";

fn filter(level: Level) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(level.as_str()))
}

/// Install the global subscriber. Later calls are no-ops.
///
/// With `json`, every line is a JSON object that includes the current span
/// (`run_id` while a pipeline executes, `pipeline` during repair).
pub fn init_tracing(json: bool, level: Level) {
    let layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
    let installed = if json {
        tracing_subscriber::registry()
            .with(filter(level))
            .with(layer.json().with_current_span(true).with_span_list(false))
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter(level))
            .with(layer.compact())
            .try_init()
    };
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_ignored() {
        init_tracing(false, Level::WARN);
        init_tracing(true, Level::DEBUG);
    }

    #[test]
    fn fallback_filter_uses_level() {
        if std::env::var_os(LOG_ENV).is_none() && std::env::var_os("RUST_LOG").is_none() {
            assert_eq!(filter(Level::DEBUG).to_string(), "debug");
        }
    }
}
