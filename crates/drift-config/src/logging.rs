//! Process-internal diagnostic logging.
//!
//! This wires `tracing` for the binaries. The operator-visible log
//! pipeline is a separate, data-plane concern.

/// Log levels for runtime configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Initialize logging with the given default level. `RUST_LOG` wins
/// when set. Call once at startup.
pub fn init_logging(level: LogLevel) {
    use tracing_subscriber::EnvFilter;

    let filter = match level {
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
        LogLevel::Trace => "trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_are_distinct() {
        assert_ne!(LogLevel::Error, LogLevel::Warn);
        assert_ne!(LogLevel::Debug, LogLevel::Trace);
    }
}
