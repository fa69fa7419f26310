use std::sync::RwLock;

use crate::domain::MnemonicStore;

/// Keeps the plaintext mnemonic in process memory only.
#[derive(Default)]
pub struct InMemoryMnemonicStore {
    mnemonic: RwLock<Option<String>>,
}

impl InMemoryMnemonicStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MnemonicStore for InMemoryMnemonicStore {
    fn set(&self, mnemonic: String) {
        if let Ok(mut m) = self.mnemonic.write() {
            *m = Some(mnemonic);
        }
    }

    fn get(&self) -> Option<String> {
        self.mnemonic.read().ok().and_then(|m| m.clone())
    }

    fn unset(&self) {
        if let Ok(mut m) = self.mnemonic.write() {
            m.take();
        }
    }

    fn is_set(&self) -> bool {
        self.mnemonic.read().map(|m| m.is_some()).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_unset() {
        let store = InMemoryMnemonicStore::new();
        assert!(!store.is_set());
        store.set("words".to_string());
        assert_eq!(store.get().as_deref(), Some("words"));
        store.unset();
        assert!(store.get().is_none());
    }
}
