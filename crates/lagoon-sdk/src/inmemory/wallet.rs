use std::sync::RwLock;

use crate::domain::Wallet;
use crate::error::{Error, Result};
use crate::events::{EventBus, WalletEvent};
use crate::repository::WalletRepository;

#[derive(Default)]
pub struct InMemoryWalletRepository {
    wallet: RwLock<Option<Wallet>>,
    events: EventBus<WalletEvent>,
}

impl InMemoryWalletRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> Error {
    Error::Store("wallet lock poisoned".to_string())
}

impl WalletRepository for InMemoryWalletRepository {
    fn create_wallet(&self, wallet: Wallet) -> Result<()> {
        let mut current = self.wallet.write().map_err(poisoned)?;
        if current.is_some() {
            return Err(Error::WalletAlreadyInitialized);
        }
        *current = Some(wallet);
        Ok(())
    }

    fn get_wallet(&self) -> Result<Wallet> {
        self.wallet
            .read()
            .map_err(poisoned)?
            .clone()
            .ok_or(Error::WalletNotInitialized)
    }

    fn update_wallet(&self, update: &mut dyn FnMut(&mut Wallet) -> Result<()>) -> Result<()> {
        let mut current = self.wallet.write().map_err(poisoned)?;
        let wallet = current.as_mut().ok_or(Error::WalletNotInitialized)?;
        let mut updated = wallet.clone();
        update(&mut updated)?;
        *wallet = updated;
        Ok(())
    }

    fn events(&self) -> &EventBus<WalletEvent> {
        &self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MNEMONIC, XorCipher};
    use crate::network::Network;

    #[test]
    fn create_once_and_update() {
        let repo = InMemoryWalletRepository::new();
        assert!(matches!(repo.get_wallet(), Err(Error::WalletNotInitialized)));

        let wallet = Wallet::new(MNEMONIC, "pwd", Network::LiquidRegtest, 0, &XorCipher).unwrap();
        repo.create_wallet(wallet.clone()).unwrap();
        assert!(matches!(
            repo.create_wallet(wallet),
            Err(Error::WalletAlreadyInitialized)
        ));

        repo.update_wallet(&mut |w| {
            w.birthday_block_height = 42;
            Ok(())
        })
        .unwrap();
        assert_eq!(repo.get_wallet().unwrap().birthday_block_height, 42);
    }
}
