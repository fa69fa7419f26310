//! Event types and the publish/subscribe bus shared by every repository.
//!
//! Each bus has two kinds of subscribers with different delivery policies:
//!
//! - one **internal** subscriber (the [`RepoManager`](crate::repository::RepoManager)
//!   dispatcher) fed through an unbounded channel: it never misses an event;
//! - any number of **external** subscribers fed through a bounded broadcast
//!   channel: a send never blocks the writer, and a lagging or absent
//!   subscriber simply misses events.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use crate::domain::{AddressInfo, Transaction, UtxoInfo};

const EXTERNAL_CAPACITY: usize = 256;

// ── Event types ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UtxoEventType {
    Added,
    Confirmed,
    Locked,
    Unlocked,
    Spent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoEvent {
    pub event_type: UtxoEventType,
    pub utxos: Vec<UtxoInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionEventType {
    Added,
    Unconfirmed,
    Confirmed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionEvent {
    pub event_type: TransactionEventType,
    pub transaction: Transaction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WalletEventType {
    WalletCreated,
    WalletUnlocked,
    WalletPasswordChanged,
    WalletAccountCreated,
    WalletAccountAddressesDerived,
    WalletAccountDeleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletEvent {
    pub event_type: WalletEventType,
    pub account_name: String,
    pub account_addresses: Vec<AddressInfo>,
    pub birthday: u64,
}

impl WalletEvent {
    pub fn new(event_type: WalletEventType) -> Self {
        Self {
            event_type,
            account_name: String::new(),
            account_addresses: Vec::new(),
            birthday: 0,
        }
    }

    pub fn for_account(event_type: WalletEventType, account_name: &str) -> Self {
        Self {
            account_name: account_name.to_string(),
            ..Self::new(event_type)
        }
    }
}

// ── Bus ─────────────────────────────────────────────────────────────

pub struct EventBus<E> {
    internal_tx: Mutex<Option<mpsc::UnboundedSender<E>>>,
    internal_rx: Mutex<Option<mpsc::UnboundedReceiver<E>>>,
    external_tx: broadcast::Sender<E>,
}

impl<E: Clone + Send + 'static> EventBus<E> {
    pub fn new() -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (external_tx, _) = broadcast::channel(EXTERNAL_CAPACITY);
        Self {
            internal_tx: Mutex::new(Some(internal_tx)),
            internal_rx: Mutex::new(Some(internal_rx)),
            external_tx,
        }
    }

    /// Delivers `event` to the internal subscriber and, best effort, to every
    /// external one.
    pub fn publish(&self, event: E) {
        if let Ok(guard) = self.internal_tx.lock() {
            if let Some(tx) = guard.as_ref() {
                let _ = tx.send(event.clone());
            }
        }
        let _ = self.external_tx.send(event);
    }

    /// Hands out the internal stream. Only the first caller gets it; events
    /// published before that are buffered.
    pub fn take_internal(&self) -> Option<mpsc::UnboundedReceiver<E>> {
        self.internal_rx.lock().ok().and_then(|mut rx| rx.take())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.external_tx.subscribe()
    }

    /// Ends the internal stream. The dispatcher observes it as a closed
    /// channel once the buffered events are drained.
    pub fn close(&self) {
        if let Ok(mut guard) = self.internal_tx.lock() {
            guard.take();
        }
    }
}

impl<E: Clone + Send + 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}
