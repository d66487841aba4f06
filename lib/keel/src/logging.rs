//! Structured logging for all three daemons. Everything goes through slog;
//! the macros are re-exported here so call sites can use `logging::info!`
//! with the crate-local logger idiom.

pub use slog::{b, crit, debug, error, info, kv, log, o, record, record_static, trace, warn};
pub use slog::{Discard, Drain, Logger};

use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::{Build, Config, LoggerConfig};

pub use sloggers::types::Severity;

/// Builds a terminal logger at the given severity. The severity is normally
/// derived from the command line via [`severity_from_flags`].
pub fn init(severity: Severity) -> Logger {
    let mut builder = TerminalLoggerBuilder::new();

    builder.level(severity);
    builder.destination(Destination::Stderr);

    builder.build().expect("Failed to construct the terminal logger")
}

/// Builds a logger from a TOML logging configuration, for installs that want
/// file output or different formats without a recompile.
pub fn init_from_toml(config: &str) -> Logger {
    let config: LoggerConfig =
        serdeconv::from_toml_str(config).expect("Invalid logging configuration");

    config
        .build_logger()
        .expect("Failed to construct the configured logger")
}

/// Maps the daemon verbosity flags onto a severity. The flags are checked in
/// order of decreasing verbosity so the last (quietest) one specified wins.
pub fn severity_from_flags(verbose: bool, quiet: bool, reallyquiet: bool) -> Severity {
    if reallyquiet {
        Severity::Error
    } else if quiet {
        Severity::Warning
    } else if verbose {
        Severity::Debug
    } else {
        Severity::Info
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_mapping() {
        assert_eq!(severity_from_flags(false, false, false), Severity::Info);
        assert_eq!(severity_from_flags(true, false, false), Severity::Debug);
        assert_eq!(severity_from_flags(false, true, false), Severity::Warning);
        assert_eq!(severity_from_flags(false, false, true), Severity::Error);
        // Quietest flag wins when several are given.
        assert_eq!(severity_from_flags(true, true, true), Severity::Error);
    }

    #[test]
    fn test_toml_config() {
        let _ = init_from_toml(
            r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#,
        );
    }
}
