//! Application services built on top of the repositories and collaborators.

mod account_service;
mod notification_service;
mod transaction_service;
mod wallet_service;

pub use account_service::AccountService;
pub use notification_service::NotificationService;
pub use transaction_service::TransactionService;
pub use wallet_service::{WalletService, WalletStatus};

use std::time::{SystemTime, UNIX_EPOCH};

use crate::domain::{AddressChain, AddressInfo, MnemonicStore, Wallet};
use crate::error::{Error, Result};
use crate::events::{WalletEvent, WalletEventType};
use crate::keys::KeyDeriver;
use crate::repository::WalletRepository;

/// Seconds since the unix epoch.
pub(crate) fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

pub(crate) fn runtime_handle() -> Result<tokio::runtime::Handle> {
    tokio::runtime::Handle::try_current().map_err(|e| Error::Runtime(e.to_string()))
}

/// The wallet and its mnemonic, failing if the wallet is locked.
pub(crate) fn unlocked_wallet(
    wallet_repo: &dyn WalletRepository,
    mnemonic_store: &dyn MnemonicStore,
) -> Result<(Wallet, String)> {
    let wallet = wallet_repo.get_wallet()?;
    let mnemonic = wallet.mnemonic(mnemonic_store)?;
    Ok((wallet, mnemonic))
}

/// Derives `num` new addresses on `chain` and announces them with a
/// `WalletAccountAddressesDerived` event.
pub(crate) fn derive_addresses(
    wallet_repo: &dyn WalletRepository,
    account: &str,
    chain: AddressChain,
    num: u32,
    mnemonic: &str,
    deriver: &dyn KeyDeriver,
) -> Result<Vec<AddressInfo>> {
    if num == 0 {
        return Err(Error::Validation(
            "number of addresses must be greater than 0".to_string(),
        ));
    }

    let mut derived = Vec::new();
    let mut birthday = 0;
    wallet_repo.update_wallet(&mut |wallet: &mut Wallet| {
        derived.clear();
        for _ in 0..num {
            derived.push(wallet.derive_next_address(account, chain, mnemonic, deriver)?);
        }
        birthday = wallet.account(account)?.birthday_block;
        Ok(())
    })?;

    wallet_repo.events().publish(WalletEvent {
        account_addresses: derived.clone(),
        birthday,
        ..WalletEvent::for_account(WalletEventType::WalletAccountAddressesDerived, account)
    });
    Ok(derived)
}
