pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Drain, Logger};

use sloggers::{Config, LoggerConfig};

const DEFAULT_CONFIG: &str = r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#;

/// Builds the root logger from the default terminal configuration.
pub fn init() -> Logger {
    from_toml(DEFAULT_CONFIG).expect("Default logging configuration must be valid")
}

/// Builds the root logger from the supplied sloggers TOML configuration.
pub fn from_toml(config: &str) -> Result<Logger, String> {
    let config: LoggerConfig = serdeconv::from_toml_str(config).map_err(|err| err.to_string())?;
    config.build_logger().map_err(|err| err.to_string())
}

/// Returns a logger that discards everything. Used as the fallback when a
/// component is constructed without a parent logger.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

/// Resolves the child logger for a component from an optional parent.
pub fn child<'a, L: Into<Option<&'a Logger>>>(parent: L) -> Logger {
    match parent.into() {
        Some(log) => log.new(o!()),
        None => discard(),
    }
}
