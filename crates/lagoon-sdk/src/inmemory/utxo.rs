use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::domain::{Balance, Utxo, UtxoKey, UtxoStatus, balance_by_asset};
use crate::error::{Error, Result};
use crate::events::{EventBus, UtxoEvent, UtxoEventType};
use crate::repository::{UtxoRepository, publish_utxo_event};

/// Coins keyed by [`UtxoKey::hash`]. Every mutating call holds the write lock
/// for its whole batch, which makes each per-key transition a check-and-set.
#[derive(Default)]
pub struct InMemoryUtxoRepository {
    utxos: RwLock<HashMap<String, Utxo>>,
    events: EventBus<UtxoEvent>,
}

impl InMemoryUtxoRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, Utxo>>> {
        self.utxos
            .read()
            .map_err(|_| Error::Store("utxo map poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, Utxo>>> {
        self.utxos
            .write()
            .map_err(|_| Error::Store("utxo map poisoned".to_string()))
    }

    fn filtered(&self, keep: impl Fn(&Utxo) -> bool) -> Result<Vec<Utxo>> {
        Ok(self.read()?.values().filter(|u| keep(u)).cloned().collect())
    }

    /// Applies `transition` to every known key and publishes one event for the
    /// coins that actually changed.
    fn update(
        &self,
        keys: &[UtxoKey],
        event_type: UtxoEventType,
        transition: impl Fn(&mut Utxo) -> bool,
    ) -> Result<usize> {
        let changed = {
            let mut utxos = self.write()?;
            let mut changed = Vec::new();
            for key in keys {
                if let Some(utxo) = utxos.get_mut(&key.hash()) {
                    if transition(utxo) {
                        changed.push(utxo.clone());
                    }
                }
            }
            changed
        };
        publish_utxo_event(&self.events, event_type, &changed);
        Ok(changed.len())
    }
}

fn is_selectable(u: &Utxo) -> bool {
    u.is_confirmed() && !u.is_locked() && !u.is_spent()
}

impl UtxoRepository for InMemoryUtxoRepository {
    fn add_utxos(&self, utxos: Vec<Utxo>) -> Result<usize> {
        let added = {
            let mut map = self.write()?;
            let mut added = Vec::new();
            for utxo in utxos {
                let hash = utxo.key.hash();
                if map.contains_key(&hash) {
                    continue;
                }
                map.insert(hash, utxo.clone());
                added.push(utxo);
            }
            added
        };
        publish_utxo_event(&self.events, UtxoEventType::Added, &added);
        Ok(added.len())
    }

    fn get_all_utxos(&self) -> Result<Vec<Utxo>> {
        self.filtered(|_| true)
    }

    fn get_spendable_utxos(&self) -> Result<Vec<Utxo>> {
        self.filtered(is_selectable)
    }

    fn get_all_utxos_for_account(&self, account: &str) -> Result<Vec<Utxo>> {
        self.filtered(|u| u.account_name == account)
    }

    fn get_spendable_utxos_for_account(&self, account: &str) -> Result<Vec<Utxo>> {
        self.filtered(|u| u.account_name == account && is_selectable(u))
    }

    fn get_locked_utxos_for_account(&self, account: &str) -> Result<Vec<Utxo>> {
        self.filtered(|u| u.account_name == account && u.is_locked())
    }

    fn get_utxos_by_key(&self, keys: &[UtxoKey]) -> Result<Vec<Utxo>> {
        let utxos = self.read()?;
        Ok(keys
            .iter()
            .filter_map(|k| utxos.get(&k.hash()).cloned())
            .collect())
    }

    fn get_balance_for_account(&self, account: &str) -> Result<HashMap<String, Balance>> {
        let utxos = self.read()?;
        Ok(balance_by_asset(
            utxos.values().filter(|u| u.account_name == account),
        ))
    }

    fn lock_utxos(
        &self,
        keys: &[UtxoKey],
        timestamp: i64,
        expiry_timestamp: i64,
    ) -> Result<usize> {
        self.update(keys, UtxoEventType::Locked, |u| {
            u.lock(timestamp, expiry_timestamp)
        })
    }

    fn unlock_utxos(&self, keys: &[UtxoKey]) -> Result<usize> {
        self.update(keys, UtxoEventType::Unlocked, Utxo::unlock)
    }

    fn spend_utxos(&self, keys: &[UtxoKey], status: UtxoStatus) -> Result<usize> {
        self.update(keys, UtxoEventType::Spent, |u| {
            if u.is_spent() {
                return false;
            }
            u.spend(status.clone());
            true
        })
    }

    fn confirm_utxos(&self, keys: &[UtxoKey], status: UtxoStatus) -> Result<usize> {
        self.update(keys, UtxoEventType::Confirmed, |u| {
            !u.is_confirmed() && u.confirm(status.clone()).is_ok()
        })
    }

    fn delete_utxos_for_account(&self, account: &str) -> Result<()> {
        self.write()?.retain(|_, u| u.account_name != account);
        Ok(())
    }

    fn events(&self) -> &EventBus<UtxoEvent> {
        &self.events
    }
}
