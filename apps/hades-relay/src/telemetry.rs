use std::io::IsTerminal;

use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::config::DEFAULT_LOG_FILTER;

/// Parses `filter`, falling back to the relay default when it is invalid.
/// The rejected directive's error is returned alongside.
pub fn relay_filter(filter: &str) -> (EnvFilter, Option<String>) {
    match EnvFilter::try_new(filter) {
        Ok(parsed) => (parsed, None),
        Err(err) => (EnvFilter::new(DEFAULT_LOG_FILTER), Some(err.to_string())),
    }
}

/// Installs the global subscriber. Logs go to stderr so stdout stays free for
/// probe output and command replies.
pub fn init_tracing(filter: &str) {
    let (env_filter, rejected) = relay_filter(filter);
    let stderr = std::io::stderr();
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_ansi(stderr.is_terminal())
        .with_writer(std::io::stderr);
    if Registry::default()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .is_err()
    {
        return;
    }
    if let Some(error) = rejected {
        warn!(target = "relay.app", filter, %error, "invalid log filter; using default");
    }
}
