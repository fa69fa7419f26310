use lagoon_lib::{Daemon, DaemonConfig, DbType};
use lagoon_sdk::testing::MNEMONIC;
use lagoon_sdk::Network;

// Nothing listens here, so every chain call fails fast.
const UNREACHABLE: &str = "tcp://127.0.0.1:1";

fn config(datadir: &std::path::Path, db_type: DbType) -> DaemonConfig {
    DaemonConfig {
        network: Network::LiquidRegtest,
        electrum_url: Some(UNREACHABLE.to_string()),
        datadir: datadir.to_path_buf(),
        db_type,
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn starts_without_a_reachable_electrum_server() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = Daemon::start(config(dir.path(), DbType::Inmemory)).unwrap();

    let status = daemon.wallet.status();
    assert!(!status.initialized);
    assert!(!status.unlocked);
    assert!(!dir.path().join("regtest").exists());

    daemon.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn wallet_creation_needs_the_chain_tip() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = Daemon::start(config(dir.path(), DbType::Inmemory)).unwrap();

    assert!(daemon.wallet.create_wallet(MNEMONIC, "password").is_err());
    assert!(!daemon.wallet.status().initialized);

    daemon.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn sqlite_database_lives_in_the_network_dir() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), DbType::Sqlite);
    let db_path = config.db_path();

    let daemon = Daemon::start(config.clone()).unwrap();
    assert!(db_path.exists());
    assert!(daemon.accounts.list_addresses("main").is_err());
    daemon.shutdown().await;

    // Reopening runs the migrations against the existing file.
    let daemon = Daemon::start(config).unwrap();
    assert!(!daemon.wallet.status().initialized);
    daemon.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn run_reads_the_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let mut file_config = config(dir.path(), DbType::Inmemory);
    file_config.utxo_expiry_secs = 30;
    file_config.save().unwrap();

    let loaded = DaemonConfig::load(dir.path()).unwrap();
    assert_eq!(loaded, file_config);

    let daemon = Daemon::start(loaded).unwrap();
    assert_eq!(daemon.config.utxo_expiry_secs, 30);
    assert_eq!(daemon.config.electrum_url(), UNREACHABLE);
    daemon.shutdown().await;
}
