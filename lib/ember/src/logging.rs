//! Logging facilities shared by every crate in the workspace. The engine
//! never owns a global logger; it receives a `Logger` and derives child
//! loggers from it.

pub use slog::{b, crit, debug, error, info, kv, log, o, record, record_static, trace, warn};
pub use slog::{Discard, Drain, Level, Logger};

use sloggers::{Config, LoggerConfig};

/// Builds a terminal logger writing to stderr at the supplied level
/// (one of "trace", "debug", "info", "warning", "error", "critical").
pub fn term_logger(level: &str) -> Logger {
    let config: LoggerConfig = serdeconv::from_toml_str(&format!(
        r#"
type = "terminal"
level = "{}"
destination = "stderr"
"#,
        level
    ))
    .expect("Unrecognized log level");

    config.build_logger().expect("Failed building terminal logger")
}
