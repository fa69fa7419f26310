mod common;

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use common::{
    ACCOUNT, FlakyUtxoRepository, PASSWORD, config, eventually, native, services, unlocked_wallet,
    unlocked_wallet_over,
};
use lagoon_sdk::testing::{FakeDeriver, MNEMONIC, XorCipher, confirmed_coin, in_memory_repo_manager};
use lagoon_sdk::{Network, RepoManager, UtxoKey, Wallet};

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

fn spendable_count(manager: &RepoManager) -> usize {
    manager
        .utxo_repository()
        .get_spendable_utxos_for_account(ACCOUNT)
        .unwrap()
        .len()
}

/// A manager holding a wallet with one account and a set of coins, as left
/// behind by a previous run.
fn previous_run(coins: Vec<lagoon_sdk::Utxo>) -> Arc<RepoManager> {
    let manager = in_memory_repo_manager();
    let mut wallet = Wallet::new(MNEMONIC, PASSWORD, Network::LiquidRegtest, 0, &XorCipher).unwrap();
    wallet
        .create_account(ACCOUNT, 0, MNEMONIC, &FakeDeriver)
        .unwrap();
    manager.wallet_repository().create_wallet(wallet).unwrap();
    manager.utxo_repository().add_utxos(coins).unwrap();
    manager
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn selected_coins_are_released_after_expiry() {
    let h = unlocked_wallet(config().with_utxo_expiry(Duration::from_secs(2)));
    h.manager
        .utxo_repository()
        .add_utxos(vec![confirmed_coin(ACCOUNT, 1, 0, 10_000, &native())])
        .unwrap();

    let (selected, _, expiry) = h.txs.select_utxos(ACCOUNT, &native(), 5_000).unwrap();
    assert_eq!(selected.len(), 1);
    assert!(expiry >= now() + 1);
    assert_eq!(spendable_count(&h.manager), 0);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(spendable_count(&h.manager), 0);

    assert!(eventually(|| spendable_count(&h.manager) == 1).await);
}

#[tokio::test(flavor = "multi_thread")]
async fn spent_coins_are_not_released() {
    let h = unlocked_wallet(config().with_utxo_expiry(Duration::from_secs(1)));
    let coin = confirmed_coin(ACCOUNT, 1, 0, 10_000, &native());
    let key = coin.key();
    h.manager.utxo_repository().add_utxos(vec![coin]).unwrap();

    h.txs.select_utxos(ACCOUNT, &native(), 5_000).unwrap();
    h.manager
        .utxo_repository()
        .spend_utxos(
            &[key.clone()],
            lagoon_sdk::domain::UtxoStatus::new("ee".repeat(32), 0, 0, ""),
        )
        .unwrap();

    tokio::time::sleep(Duration::from_secs(3)).await;
    let utxo = h
        .manager
        .utxo_repository()
        .get_utxos_by_key(&[key])
        .unwrap()
        .remove(0);
    assert!(utxo.is_spent());
    assert!(!utxo.is_locked());
    assert_eq!(spendable_count(&h.manager), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn expired_locks_are_released_at_startup() {
    let mut stale = confirmed_coin(ACCOUNT, 1, 0, 10_000, &native());
    stale.lock(now() - 1_000, now() - 640);
    let mut pending = confirmed_coin(ACCOUNT, 2, 0, 20_000, &native());
    pending.lock(now(), now() + 1);
    let manager = previous_run(vec![stale, pending]);
    assert_eq!(spendable_count(&manager), 0);

    let h = services(manager, config().with_utxo_expiry(Duration::from_secs(1)));

    // The stale lock is dropped synchronously while the service starts.
    let spendable = h
        .manager
        .utxo_repository()
        .get_spendable_utxos_for_account(ACCOUNT)
        .unwrap();
    assert_eq!(spendable.len(), 1);
    assert_eq!(spendable[0].key, UtxoKey::new(hex::encode([1u8; 32]), 0));

    // The other one gets an unlocker.
    assert!(eventually(|| spendable_count(&h.manager) == 2).await);
}

#[tokio::test(flavor = "multi_thread")]
async fn locked_coins_are_not_selected_twice() {
    let h = unlocked_wallet(config());
    h.manager
        .utxo_repository()
        .add_utxos(vec![confirmed_coin(ACCOUNT, 1, 0, 10_000, &native())])
        .unwrap();

    h.txs.select_utxos(ACCOUNT, &native(), 5_000).unwrap();
    let err = h.txs.select_utxos(ACCOUNT, &native(), 5_000).unwrap_err();
    assert!(matches!(err, lagoon_sdk::Error::TargetAmountNotReached));
}

#[tokio::test(flavor = "multi_thread")]
async fn coins_locked_by_a_concurrent_selection_are_not_handed_out() {
    let utxos = Arc::new(FlakyUtxoRepository::new());
    let h = unlocked_wallet_over(utxos.clone(), config());
    let small = confirmed_coin(ACCOUNT, 1, 0, 1_000, &native());
    let large = confirmed_coin(ACCOUNT, 2, 0, 5_000, &native());
    h.manager
        .utxo_repository()
        .add_utxos(vec![small.clone(), large.clone()])
        .unwrap();

    // Someone else locks the best candidate between our read and our lock.
    utxos.lock_after_next_read(vec![small.key()]);
    let (selected, change, _) = h.txs.select_utxos(ACCOUNT, &native(), 1_000).unwrap();

    assert_eq!(selected.len(), 1);
    assert_eq!(selected[0].key, large.key);
    assert_eq!(change, 4_000);

    let coins = h
        .manager
        .utxo_repository()
        .get_utxos_by_key(&[small.key(), large.key()])
        .unwrap();
    assert!(coins.iter().all(|u| u.is_locked()));
    assert_eq!(spendable_count(&h.manager), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn racing_selections_never_share_a_coin() {
    let h = unlocked_wallet(config());
    h.manager
        .utxo_repository()
        .add_utxos(vec![confirmed_coin(ACCOUNT, 1, 0, 10_000, &native())])
        .unwrap();

    let results: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| s.spawn(|| h.txs.select_utxos(ACCOUNT, &native(), 5_000)))
            .collect();
        handles.into_iter().map(|t| t.join().unwrap()).collect()
    });

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    for err in results.iter().filter_map(|r| r.as_ref().err()) {
        assert!(
            matches!(
                err,
                lagoon_sdk::Error::TargetAmountNotReached | lagoon_sdk::Error::LockConflict
            ),
            "unexpected error: {err}"
        );
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_unlocks_are_retried() {
    let utxos = Arc::new(FlakyUtxoRepository::new());
    let mut config = config().with_utxo_expiry(Duration::from_secs(1));
    config.unlock_retry = Duration::from_millis(100);
    let h = unlocked_wallet_over(utxos.clone(), config);
    h.manager
        .utxo_repository()
        .add_utxos(vec![confirmed_coin(ACCOUNT, 1, 0, 10_000, &native())])
        .unwrap();

    h.txs.select_utxos(ACCOUNT, &native(), 5_000).unwrap();
    utxos.fail_next_unlocks(3);
    assert_eq!(spendable_count(&h.manager), 0);

    assert!(eventually(|| spendable_count(&h.manager) == 1).await);
    assert_eq!(utxos.failing_unlocks_left(), 0);
}
