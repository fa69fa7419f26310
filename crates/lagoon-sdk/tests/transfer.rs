mod common;

use std::sync::Arc;

use common::{
    ACCOUNT, FlakyUtxoRepository, PASSWORD, config, eventually, native, p2wpkh, unlocked_wallet,
    unlocked_wallet_over,
};
use lagoon_sdk::testing::{FakeTx, confirmed_coin};
use lagoon_sdk::{Error, TxOutput};

fn payment(asset: &str, amount: u64) -> TxOutput {
    TxOutput {
        asset: asset.to_string(),
        amount,
        script: p2wpkh(0x22),
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn change_equal_to_the_fee_is_dropped() {
    let native = native();
    let amount = 1_000_000;

    // Sizes don't depend on amounts: learn the fee of a one-input transfer
    // with native change.
    let reference = unlocked_wallet(config());
    reference
        .manager
        .utxo_repository()
        .add_utxos(vec![confirmed_coin(ACCOUNT, 1, 0, 100_000_000, &native)])
        .unwrap();
    let tx_hex = reference
        .txs
        .transfer(ACCOUNT, &[payment(&native, amount)], 100)
        .unwrap();
    let fee = FakeTx::from_hex(&tx_hex).unwrap().fee().unwrap().amount;
    assert!(fee > 0);

    let h = unlocked_wallet(config());
    h.manager
        .utxo_repository()
        .add_utxos(vec![confirmed_coin(ACCOUNT, 1, 0, amount + fee, &native)])
        .unwrap();
    let tx_hex = h
        .txs
        .transfer(ACCOUNT, &[payment(&native, amount)], 100)
        .unwrap();
    let tx = FakeTx::from_hex(&tx_hex).unwrap();

    assert_eq!(tx.inputs.len(), 1);
    assert_eq!(tx.fee().unwrap().amount, fee);
    assert!(tx.outputs.iter().all(|o| !o.confidential));
    assert_eq!(tx.outputs.len(), 2);
    assert_eq!(tx.output_totals()[&native], amount + fee);
}

#[tokio::test(flavor = "multi_thread")]
async fn transfer_pays_fee_out_of_native_change() {
    let h = unlocked_wallet(config());
    let native = native();
    h.manager
        .utxo_repository()
        .add_utxos(vec![confirmed_coin(ACCOUNT, 1, 0, 100_000_000, &native)])
        .unwrap();

    let tx_hex = h
        .txs
        .transfer(ACCOUNT, &[payment(&native, 1_000_000)], 100)
        .unwrap();
    let tx = FakeTx::from_hex(&tx_hex).unwrap();

    assert!(tx.signed);
    assert_eq!(tx.inputs.len(), 1);
    assert_eq!(tx.blinded_inputs, vec![0]);

    let fee = tx.fee().unwrap().amount;
    assert!(fee > 0);
    assert_eq!(tx.output_totals()[&native], 100_000_000);

    let change = tx.outputs.iter().find(|o| o.confidential).unwrap();
    assert_eq!(change.amount, 100_000_000 - 1_000_000 - fee);

    // The spent coin stays locked until the lock expires.
    let (spendable, locked) = h.accounts.list_utxos(ACCOUNT).unwrap();
    assert!(spendable.is_empty());
    assert_eq!(locked.len(), 1);

    // The change address is handed to the chain observer.
    assert!(
        eventually(|| {
            h.chain
                .watched_addresses(ACCOUNT)
                .iter()
                .any(|a| a.derivation_path.ends_with("/1/0"))
        })
        .await
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn transfer_selects_more_coins_when_change_cannot_cover_fee() {
    let h = unlocked_wallet(config());
    let native = native();
    h.manager
        .utxo_repository()
        .add_utxos(vec![
            confirmed_coin(ACCOUNT, 1, 0, 5_000, &native),
            confirmed_coin(ACCOUNT, 2, 0, 2_000, &native),
        ])
        .unwrap();

    let tx_hex = h
        .txs
        .transfer(ACCOUNT, &[payment(&native, 4_500)], 1_000)
        .unwrap();
    let tx = FakeTx::from_hex(&tx_hex).unwrap();

    assert_eq!(tx.inputs.len(), 2);
    assert_eq!(tx.output_totals()[&native], 7_000);
    let fee = tx.fee().unwrap().amount;
    assert!(fee > 500);

    let (spendable, locked) = h.accounts.list_utxos(ACCOUNT).unwrap();
    assert!(spendable.is_empty());
    assert_eq!(locked.len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn transfer_of_other_asset_keeps_assets_balanced() {
    let h = unlocked_wallet(config());
    let native = native();
    let token = "ab".repeat(32);
    h.manager
        .utxo_repository()
        .add_utxos(vec![
            confirmed_coin(ACCOUNT, 1, 0, 1_000, &token),
            confirmed_coin(ACCOUNT, 2, 0, 100_000, &native),
        ])
        .unwrap();

    let tx_hex = h
        .txs
        .transfer(ACCOUNT, &[payment(&token, 600)], 100)
        .unwrap();
    let tx = FakeTx::from_hex(&tx_hex).unwrap();

    let totals = tx.output_totals();
    assert_eq!(totals[&token], 1_000);
    assert_eq!(totals[&native], 100_000);
    assert_eq!(tx.fee().unwrap().asset, native);
    assert_eq!(tx.inputs.len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn transfer_rejects_bad_requests() {
    let h = unlocked_wallet(config());
    let native = native();

    let err = h.txs.transfer(ACCOUNT, &[], 100).unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let err = h
        .txs
        .transfer(ACCOUNT, &[payment(&native, 1_000)], 100)
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)), "got {err}");

    h.manager
        .utxo_repository()
        .add_utxos(vec![confirmed_coin(ACCOUNT, 1, 0, 1_000, &native)])
        .unwrap();
    let err = h
        .txs
        .transfer(ACCOUNT, &[payment(&native, 5_000)], 100)
        .unwrap_err();
    assert!(matches!(err, Error::TargetAmountNotReached));

    let err = h
        .txs
        .transfer("missing", &[payment(&native, 500)], 100)
        .unwrap_err();
    assert!(matches!(err, Error::AccountNotFound));

    h.wallet.lock(PASSWORD).unwrap();
    let err = h
        .txs
        .transfer(ACCOUNT, &[payment(&native, 500)], 100)
        .unwrap_err();
    assert!(matches!(err, Error::WalletLocked));
}

// ---------------------------------------------------------------------------
// External construction
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn external_flow_requires_selected_coins() {
    let h = unlocked_wallet(config());
    let native = native();
    h.manager
        .utxo_repository()
        .add_utxos(vec![
            confirmed_coin(ACCOUNT, 1, 0, 10_000, &native),
            confirmed_coin(ACCOUNT, 2, 0, 50_000, &native),
        ])
        .unwrap();
    let (spendable, _) = h.accounts.list_utxos(ACCOUNT).unwrap();
    let unselected = spendable.iter().find(|u| u.value == 50_000).unwrap().key();

    let err = h
        .txs
        .create_pset(&[unselected], &[payment(&native, 1_000)])
        .unwrap_err();
    assert!(matches!(err, Error::ForbiddenUnlockedInputs));

    let (selected, change, expiry) = h.txs.select_utxos(ACCOUNT, &native, 8_000).unwrap();
    assert_eq!(selected.len(), 1);
    assert_eq!(selected[0].value, 10_000);
    assert_eq!(change, 2_000);
    assert!(expiry > 0);

    let keys: Vec<_> = selected.iter().map(|u| u.key()).collect();
    let pset = h
        .txs
        .create_pset(&keys, &[payment(&native, 8_000)])
        .unwrap();
    let pset = h
        .txs
        .update_pset(
            &pset,
            &[],
            &[TxOutput {
                asset: native.clone(),
                amount: 2_000,
                ..Default::default()
            }],
        )
        .unwrap();
    let blinded = h.txs.blind_pset(&pset, &[], true).unwrap();
    let signed = h.txs.sign_pset(&blinded).unwrap();
    let mut tx = FakeTx::from_pset(&signed).unwrap();
    assert!(tx.signed);
    assert_eq!(tx.blinded_inputs, vec![0]);

    let txid = h.txs.broadcast_transaction(&tx.to_hex().unwrap()).unwrap();
    assert_eq!(h.chain.broadcasted().len(), 1);
    assert_eq!(txid.len(), 64);

    // A transaction spending an unlocked wallet coin can't be broadcast.
    tx.inputs.push(spendable.iter().find(|u| u.value == 50_000).unwrap().key());
    let err = h
        .txs
        .broadcast_transaction(&tx.to_hex().unwrap())
        .unwrap_err();
    assert!(matches!(err, Error::UnlockedUtxosInBroadcast));
    assert_eq!(h.chain.broadcasted().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn select_utxos_validates_request() {
    let h = unlocked_wallet(config());

    let err = h.txs.select_utxos(ACCOUNT, "abcd", 10).unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let err = h.txs.select_utxos(ACCOUNT, &native(), 0).unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let err = h.txs.select_utxos(ACCOUNT, &native(), 10).unwrap_err();
    assert!(matches!(err, Error::TargetAmountNotReached));
}

#[tokio::test(flavor = "multi_thread")]
async fn estimate_fees_resolves_external_inputs_from_chain() {
    let h = unlocked_wallet(config());
    let native = native();
    let external = confirmed_coin("someone", 9, 1, 3_000, &native);
    h.chain.add_output(external.clone());

    let inputs = [lagoon_sdk::TxInput {
        txid: external.key.txid.clone(),
        vout: external.key.vout,
        ..Default::default()
    }];
    let low = h
        .txs
        .estimate_fees(&inputs, &[payment(&native, 1_000)], 100)
        .unwrap();
    let high = h
        .txs
        .estimate_fees(&inputs, &[payment(&native, 1_000)], 1_000)
        .unwrap();
    assert!(low > 0);
    assert!(high > low);

    let missing = [lagoon_sdk::TxInput {
        txid: "cd".repeat(32),
        vout: 0,
        ..Default::default()
    }];
    assert!(
        h.txs
            .estimate_fees(&missing, &[payment(&native, 1_000)], 100)
            .is_err()
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn transfer_does_not_spend_coins_locked_meanwhile() {
    let utxos = Arc::new(FlakyUtxoRepository::new());
    let h = unlocked_wallet_over(utxos.clone(), config());
    let native = native();
    let small = confirmed_coin(ACCOUNT, 1, 0, 2_000_000, &native);
    let large = confirmed_coin(ACCOUNT, 2, 0, 50_000_000, &native);
    h.manager
        .utxo_repository()
        .add_utxos(vec![small.clone(), large.clone()])
        .unwrap();

    utxos.lock_after_next_read(vec![small.key()]);
    let tx_hex = h
        .txs
        .transfer(ACCOUNT, &[payment(&native, 1_000_000)], 100)
        .unwrap();
    let tx = FakeTx::from_hex(&tx_hex).unwrap();

    assert_eq!(tx.inputs, vec![large.key()]);
    assert_eq!(tx.output_totals()[&native], 50_000_000);
}
