use std::sync::Arc;

use lwk_signer::SwSigner;
use serde::{Deserialize, Serialize};

use crate::chain::ChainObserver;
use crate::domain::{MnemonicCipher, MnemonicStore, Wallet};
use crate::error::{Error, Result};
use crate::events::{WalletEvent, WalletEventType};
use crate::network::Network;
use crate::repository::RepoManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletStatus {
    pub initialized: bool,
    pub unlocked: bool,
    pub birthday_block_height: u64,
}

/// Wallet lifecycle: seed generation, creation, unlocking and password
/// changes. The mnemonic store and cipher are injected by the caller.
pub struct WalletService {
    repo_manager: Arc<RepoManager>,
    chain: Arc<dyn ChainObserver>,
    mnemonic_store: Arc<dyn MnemonicStore>,
    cipher: Arc<dyn MnemonicCipher>,
    network: Network,
}

impl WalletService {
    pub fn new(
        repo_manager: Arc<RepoManager>,
        chain: Arc<dyn ChainObserver>,
        mnemonic_store: Arc<dyn MnemonicStore>,
        cipher: Arc<dyn MnemonicCipher>,
        network: Network,
    ) -> Self {
        Self {
            repo_manager,
            chain,
            mnemonic_store,
            cipher,
            network,
        }
    }

    fn publish(&self, event: WalletEvent) {
        self.repo_manager.wallet_repository().events().publish(event);
    }

    /// A fresh 12-word mnemonic.
    pub fn generate_seed(&self) -> Result<String> {
        let (_, mnemonic) =
            SwSigner::random(self.network.is_mainnet()).map_err(|e| Error::Signer(e.to_string()))?;
        Ok(mnemonic.to_string())
    }

    /// Creates the wallet, born at the current chain tip. The new wallet is
    /// locked.
    pub fn create_wallet(&self, mnemonic: &str, password: &str) -> Result<()> {
        let wallet_repo = self.repo_manager.wallet_repository();
        match wallet_repo.get_wallet() {
            Ok(_) => return Err(Error::WalletAlreadyInitialized),
            Err(Error::WalletNotInitialized) => {}
            Err(e) => return Err(e),
        }

        // Reject invalid mnemonics before touching the store.
        SwSigner::new(mnemonic.trim(), self.network.is_mainnet())
            .map_err(|e| Error::Validation(format!("invalid mnemonic: {e}")))?;

        let (_, birthday) = self.chain.get_latest_block()?;
        let wallet = Wallet::new(mnemonic, password, self.network, birthday, self.cipher.as_ref())?;
        wallet_repo.create_wallet(wallet)?;

        log::info!("wallet service: created wallet at block {birthday}");
        self.publish(WalletEvent {
            birthday,
            ..WalletEvent::new(WalletEventType::WalletCreated)
        });
        Ok(())
    }

    pub fn unlock(&self, password: &str) -> Result<()> {
        let wallet = self.repo_manager.wallet_repository().get_wallet()?;
        if !wallet.is_locked(self.mnemonic_store.as_ref()) {
            return Ok(());
        }
        wallet.unlock(password, self.mnemonic_store.as_ref(), self.cipher.as_ref())?;

        log::info!("wallet service: wallet unlocked");
        self.publish(WalletEvent::new(WalletEventType::WalletUnlocked));
        Ok(())
    }

    pub fn lock(&self, password: &str) -> Result<()> {
        let wallet = self.repo_manager.wallet_repository().get_wallet()?;
        wallet.lock(password, self.mnemonic_store.as_ref())?;
        log::info!("wallet service: wallet locked");
        Ok(())
    }

    /// Re-encrypts the mnemonic. The wallet must be locked.
    pub fn change_password(&self, current_password: &str, new_password: &str) -> Result<()> {
        self.repo_manager
            .wallet_repository()
            .update_wallet(&mut |wallet: &mut Wallet| {
                wallet.change_password(
                    current_password,
                    new_password,
                    self.mnemonic_store.as_ref(),
                    self.cipher.as_ref(),
                )
            })?;
        self.publish(WalletEvent::new(WalletEventType::WalletPasswordChanged));
        Ok(())
    }

    pub fn status(&self) -> WalletStatus {
        match self.repo_manager.wallet_repository().get_wallet() {
            Ok(wallet) => WalletStatus {
                initialized: wallet.is_initialized(),
                unlocked: !wallet.is_locked(self.mnemonic_store.as_ref()),
                birthday_block_height: wallet.birthday_block_height,
            },
            Err(_) => WalletStatus {
                initialized: false,
                unlocked: false,
                birthday_block_height: 0,
            },
        }
    }
}
