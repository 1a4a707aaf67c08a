use std::sync::{Mutex, MutexGuard};

use log::warn;

use crate::{
    error::Result,
    types::{Credential, CredentialList},
};

/// Persistent saved-network storage. Every mutation is durable on return.
pub trait CredentialStore: Send + Sync {
    fn get(&self) -> Result<CredentialList>;

    /// Returns false when the name is new and the list is full.
    fn upsert(&self, ssid: &str, pass: &str) -> Result<bool>;

    /// Returns whether an entry was removed.
    fn remove(&self, ssid: &str) -> Result<bool>;

    fn clear(&self) -> Result<()>;
}

/// Applies an upsert to a loaded list, warning when the cap drops it.
pub fn upsert_into(list: &mut CredentialList, ssid: &str, pass: &str) -> Result<bool> {
    let credential = Credential::new(ssid, pass)?;
    let stored = list.upsert(credential);
    if !stored {
        warn!("credential list full, dropping `{ssid}`");
    }
    Ok(stored)
}

#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    list: Mutex<CredentialList>,
}

impl MemoryCredentialStore {
    pub fn new(list: CredentialList) -> Self {
        Self {
            list: Mutex::new(list),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CredentialList> {
        self.list
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self) -> Result<CredentialList> {
        Ok(self.lock().clone())
    }

    fn upsert(&self, ssid: &str, pass: &str) -> Result<bool> {
        upsert_into(&mut self.lock(), ssid, pass)
    }

    fn remove(&self, ssid: &str) -> Result<bool> {
        Ok(self.lock().remove(ssid))
    }

    fn clear(&self) -> Result<()> {
        self.lock().clear();
        Ok(())
    }
}
