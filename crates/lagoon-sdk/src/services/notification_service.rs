use std::sync::Arc;

use tokio::sync::broadcast;

use crate::events::{TransactionEvent, UtxoEvent, WalletEvent};
use crate::repository::RepoManager;

/// Hands out subscriptions to the repositories' external event streams.
///
/// Subscribers that fall behind miss events; the writers never wait for them.
pub struct NotificationService {
    repo_manager: Arc<RepoManager>,
}

impl NotificationService {
    pub fn new(repo_manager: Arc<RepoManager>) -> Self {
        Self { repo_manager }
    }

    pub fn utxo_notifications(&self) -> broadcast::Receiver<UtxoEvent> {
        self.repo_manager.utxo_repository().events().subscribe()
    }

    pub fn tx_notifications(&self) -> broadcast::Receiver<TransactionEvent> {
        self.repo_manager.transaction_repository().events().subscribe()
    }

    pub fn wallet_notifications(&self) -> broadcast::Receiver<WalletEvent> {
        self.repo_manager.wallet_repository().events().subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Utxo, UtxoKey};
    use crate::events::UtxoEventType;
    use crate::inmemory::{
        InMemoryTransactionRepository, InMemoryUtxoRepository, InMemoryWalletRepository,
    };

    #[tokio::test]
    async fn relays_utxo_events_to_every_subscriber() {
        let manager = RepoManager::new(
            Arc::new(InMemoryUtxoRepository::new()),
            Arc::new(InMemoryTransactionRepository::new()),
            Arc::new(InMemoryWalletRepository::new()),
        );
        let notifications = NotificationService::new(manager.clone());
        let mut first = notifications.utxo_notifications();
        let mut second = notifications.utxo_notifications();

        manager
            .utxo_repository()
            .add_utxos(vec![Utxo {
                key: UtxoKey::new("aa".repeat(32), 0),
                value: 10,
                asset: "bb".repeat(32),
                account_name: "main".to_string(),
                ..Default::default()
            }])
            .unwrap();

        for rx in [&mut first, &mut second] {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.event_type, UtxoEventType::Added);
            assert_eq!(event.utxos.len(), 1);
        }
    }
}
