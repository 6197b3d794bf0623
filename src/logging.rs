use std::io;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Installs the global tracing subscriber, writing to stderr.
///
/// `RUST_LOG` takes precedence when set. Otherwise `level` is used, which may be a plain level or
/// a full filter directive such as `relay_tunnel=debug,info`. An invalid directive falls back to
/// the default level.
pub fn init_tracing(level: Option<&str>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| build_filter(level));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr))
        .try_init();
}

fn build_filter(level: Option<&str>) -> EnvFilter {
    let directive = level.unwrap_or(DEFAULT_LOG_LEVEL);
    EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_LEVEL))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_level_falls_back_to_default() {
        assert_eq!(build_filter(Some("relay_tunnel=notalevel")).to_string(), DEFAULT_LOG_LEVEL);
        assert_eq!(build_filter(None).to_string(), DEFAULT_LOG_LEVEL);
        assert_eq!(build_filter(Some("debug")).to_string(), "debug");
    }
}
