//! Log setup for the factory and daemon binaries

use env_logger::{Builder, Env};
use log::LevelFilter;
use std::io::Write;

/// Map an engine log level name to a filter. Unknown names mean INFO.
pub fn level_filter(level: &str) -> LevelFilter {
    match level.to_uppercase().as_str() {
        "TRACE" => LevelFilter::Trace,
        "DEBUG" => LevelFilter::Debug,
        "INFO" => LevelFilter::Info,
        "WARN" | "WARNING" => LevelFilter::Warn,
        "ERROR" | "CRITICAL" => LevelFilter::Error,
        "OFF" => LevelFilter::Off,
        _ => LevelFilter::Info,
    }
}

/// Start logging to stderr with each line tagged by account. `RUST_LOG`
/// still wins over `level`.
pub fn init(level: &str, container_id: &str) {
    let default_filter = level_filter(level).to_string().to_lowercase();
    let container_id = container_id.to_string();
    Builder::from_env(Env::default().default_filter_or(default_filter))
        .format(move |buf, record| {
            writeln!(
                buf,
                "{} {} {}: {}",
                container_id,
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}
