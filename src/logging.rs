use log::LevelFilter;

use crate::error::DaemonError;

/// Noisy dependencies kept at Warn unless RUST_LOG says otherwise.
const QUIET_TARGETS: [&str; 3] = ["lwk_wollet", "electrum_client", "rustls"];

/// Installs env_logger at `level` (falling back to Info on an unknown
/// level). `RUST_LOG` directives take precedence.
pub fn init_logging(level: &str) -> Result<(), DaemonError> {
    builder(level)
        .try_init()
        .map_err(|e| DaemonError::Logger(e.to_string()))
}

fn builder(level: &str) -> env_logger::Builder {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level.parse().unwrap_or(LevelFilter::Info));
    for target in QUIET_TARGETS {
        builder.filter_module(target, LevelFilter::Warn);
    }
    if let Ok(directives) = std::env::var("RUST_LOG") {
        builder.parse_filters(&directives);
    }
    builder
}
