//! Logger construction.
//!
//! Grounded on `server/lib/flux/src/logging.rs`'s `init()`: a `sloggers`
//! `LoggerConfig` parsed from TOML via `serdeconv`. The teacher's version
//! hardcodes a terminal/stderr config; this one reads the same shape out
//! of [`crate::config::Config`] so a deployment can switch to a file sink
//! or a different level without a rebuild.

use sloggers::Config as SloggersConfig;

/// Build the root logger described by `log_config`. `component` is
/// attached as a permanent key-value pair so log lines from different
/// selectors/services can be told apart once merged.
pub fn build(log_config: &crate::config::LoggingConfig, component: &'static str) -> slog::Logger {
    let config: sloggers::LoggerConfig = serdeconv::from_toml_str(&log_config.to_toml())
        .unwrap_or_else(|err| panic!("invalid logging config: {err}"));
    let logger = config
        .build_logger()
        .unwrap_or_else(|err| panic!("failed to build logger: {err}"));
    logger.new(slog::o!("component" => component))
}

/// A logger that discards everything, for tests and embedders that wire
/// up their own `slog::Logger` and pass it in directly instead.
pub fn discard() -> slog::Logger {
    slog::Logger::root(slog::Discard, slog::o!())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoggingConfig;

    #[test]
    fn builds_a_terminal_logger_from_defaults() {
        let config = LoggingConfig::default();
        let _logger = build(&config, "test");
    }
}
