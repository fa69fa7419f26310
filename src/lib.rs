pub mod cipher;
pub mod config;
pub mod daemon;
pub mod error;
pub mod logging;

pub use cipher::AesGcmCipher;
pub use config::{Cli, DaemonConfig, DbType};
pub use daemon::Daemon;
pub use error::DaemonError;
pub use logging::init_logging;

/// Loads the config for `cli`, installs logging and starts the daemon.
pub fn run(cli: &Cli) -> Result<Daemon, DaemonError> {
    let config = DaemonConfig::load(&cli.datadir())?.apply_cli(cli);
    init_logging(&config.log_level)?;
    Daemon::start(config)
}
