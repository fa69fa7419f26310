use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use lagoon_sdk::{ChainWatcherConfig, Network, ServiceConfig};
use serde::{Deserialize, Serialize};

use crate::error::DaemonError;

pub const CONFIG_FILE: &str = "lagoon.json";
const DEFAULT_DATADIR: &str = ".lagoon";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbType {
    Sqlite,
    Inmemory,
}

impl std::str::FromStr for DbType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sqlite" => Ok(DbType::Sqlite),
            "inmemory" | "in-memory" => Ok(DbType::Inmemory),
            _ => Err(format!("Invalid db type: {}", s)),
        }
    }
}

// ============================================================================
// Persisted daemon config
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub network: Network,
    /// Falls back to the network's public server when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub electrum_url: Option<String>,
    pub datadir: PathBuf,
    pub db_type: DbType,
    pub utxo_expiry_secs: u64,
    pub poll_interval_secs: u64,
    pub log_level: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            network: Network::Liquid,
            electrum_url: None,
            datadir: PathBuf::from(DEFAULT_DATADIR),
            db_type: DbType::Sqlite,
            utxo_expiry_secs: 360,
            poll_interval_secs: 5,
            log_level: "info".to_string(),
        }
    }
}

impl DaemonConfig {
    /// Reads `lagoon.json` from `datadir`. A missing file yields the
    /// defaults rooted at `datadir`.
    pub fn load(datadir: &Path) -> Result<Self, DaemonError> {
        let path = datadir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self {
                datadir: datadir.to_path_buf(),
                ..Default::default()
            });
        }
        let contents = fs::read_to_string(&path)?;
        let mut config: DaemonConfig = serde_json::from_str(&contents)?;
        config.datadir = datadir.to_path_buf();
        Ok(config)
    }

    pub fn save(&self) -> Result<(), DaemonError> {
        fs::create_dir_all(&self.datadir)?;
        let json = serde_json::to_string_pretty(self)?;
        fs::write(self.datadir.join(CONFIG_FILE), json)?;
        Ok(())
    }

    /// Applies the flags given on the command line on top of the file values.
    pub fn apply_cli(mut self, cli: &Cli) -> Self {
        if let Some(network) = cli.network {
            self.network = network;
        }
        if let Some(url) = &cli.electrum_url {
            self.electrum_url = Some(url.clone());
        }
        if let Some(db_type) = cli.db_type {
            self.db_type = db_type;
        }
        if let Some(secs) = cli.utxo_expiry_secs {
            self.utxo_expiry_secs = secs;
        }
        if let Some(secs) = cli.poll_interval_secs {
            self.poll_interval_secs = secs;
        }
        if let Some(level) = &cli.log_level {
            self.log_level = level.clone();
        }
        self
    }

    pub fn electrum_url(&self) -> String {
        self.electrum_url
            .clone()
            .unwrap_or_else(|| self.network.default_electrum_url().to_string())
    }

    /// Network-specific directory holding the database.
    pub fn network_dir(&self) -> PathBuf {
        self.datadir.join(self.network.as_str())
    }

    pub fn db_path(&self) -> PathBuf {
        self.network_dir().join("lagoon.db")
    }

    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig::new(self.network).with_utxo_expiry(Duration::from_secs(self.utxo_expiry_secs))
    }

    pub fn watcher_config(&self) -> ChainWatcherConfig {
        let mut config = ChainWatcherConfig::new(&self.electrum_url());
        config.poll_interval = Duration::from_secs(self.poll_interval_secs.max(1));
        config
    }
}

// ============================================================================
// Command line
// ============================================================================

#[derive(Debug, Default, Parser)]
#[command(name = "lagoond", version, about = "Liquid confidential wallet daemon")]
pub struct Cli {
    /// Data directory holding lagoon.json and the databases
    #[arg(long)]
    pub datadir: Option<PathBuf>,

    /// liquid, testnet or regtest
    #[arg(long)]
    pub network: Option<Network>,

    #[arg(long)]
    pub electrum_url: Option<String>,

    /// sqlite or inmemory
    #[arg(long)]
    pub db_type: Option<DbType>,

    /// Seconds a coin selection keeps its coins locked
    #[arg(long)]
    pub utxo_expiry_secs: Option<u64>,

    /// Seconds between two polls of the watched scripts
    #[arg(long)]
    pub poll_interval_secs: Option<u64>,

    #[arg(long)]
    pub log_level: Option<String>,
}

impl Cli {
    pub fn datadir(&self) -> PathBuf {
        self.datadir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATADIR))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = DaemonConfig::load(dir.path()).unwrap();
        assert_eq!(config.network, Network::Liquid);
        assert_eq!(config.db_type, DbType::Sqlite);
        assert_eq!(config.utxo_expiry_secs, 360);
        assert_eq!(config.datadir, dir.path());
        assert_eq!(config.electrum_url(), "ssl://blockstream.info:995");
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{"network": "regtest", "utxo_expiry_secs": 60}"#,
        )
        .unwrap();

        let config = DaemonConfig::load(dir.path()).unwrap();
        assert_eq!(config.network, Network::LiquidRegtest);
        assert_eq!(config.utxo_expiry_secs, 60);
        assert_eq!(config.poll_interval_secs, 5);
        assert_eq!(config.electrum_url(), "tcp://localhost:50001");
        assert_eq!(
            config.service_config().utxo_expiry,
            Duration::from_secs(60)
        );
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let config = DaemonConfig {
            network: Network::LiquidTestnet,
            electrum_url: Some("tcp://127.0.0.1:60401".to_string()),
            datadir: dir.path().to_path_buf(),
            db_type: DbType::Inmemory,
            ..Default::default()
        };
        config.save().unwrap();
        assert_eq!(DaemonConfig::load(dir.path()).unwrap(), config);
    }

    #[test]
    fn invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "{ not json").unwrap();
        assert!(matches!(
            DaemonConfig::load(dir.path()),
            Err(DaemonError::Json(_))
        ));
    }

    #[test]
    fn cli_flags_override_file() {
        let cli = Cli::parse_from([
            "lagoond",
            "--network",
            "testnet",
            "--db-type",
            "inmemory",
            "--poll-interval-secs",
            "2",
        ]);
        let config = DaemonConfig::default().apply_cli(&cli);
        assert_eq!(config.network, Network::LiquidTestnet);
        assert_eq!(config.db_type, DbType::Inmemory);
        assert_eq!(config.poll_interval_secs, 2);
        assert_eq!(config.utxo_expiry_secs, 360);
        assert_eq!(config.watcher_config().poll_interval, Duration::from_secs(2));
        assert_eq!(config.network_dir(), PathBuf::from(".lagoon/testnet"));
    }
}
