//! Account → manager registry.

use membase_core::error::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tracing::debug;

use crate::manager::{ManagerBuilder, MemoryManager};

type Slot = Arc<OnceCell<Arc<MemoryManager>>>;

/// Open managers keyed by account. Opening an account twice returns the
/// same manager until it is closed.
///
/// The map lock is only held to find an account's slot. Opening runs on
/// the slot, so a slow hub preload for one account holds up only other
/// callers of that account.
pub struct MemoryRegistry {
    builder: ManagerBuilder,
    managers: Mutex<HashMap<String, Slot>>,
}

impl MemoryRegistry {
    pub fn new(builder: ManagerBuilder) -> Self {
        Self {
            builder,
            managers: Mutex::new(HashMap::new()),
        }
    }

    pub async fn open(&self, account: &str) -> Result<Arc<MemoryManager>> {
        let slot = self
            .managers
            .lock()
            .await
            .entry(account.to_string())
            .or_default()
            .clone();

        // A failed open leaves the slot empty; the next caller retries it.
        let manager = slot
            .get_or_try_init(|| async {
                let manager = Arc::new(self.builder.open(account).await?);
                debug!(account, "Registered memory manager");
                Ok::<_, Error>(manager)
            })
            .await?;
        Ok(manager.clone())
    }

    pub async fn get(&self, account: &str) -> Option<Arc<MemoryManager>> {
        self.managers
            .lock()
            .await
            .get(account)
            .and_then(|slot| slot.get().cloned())
    }

    /// Accounts with an open manager, sorted.
    pub async fn accounts(&self) -> Vec<String> {
        let mut accounts: Vec<String> = self
            .managers
            .lock()
            .await
            .iter()
            .filter(|(_, slot)| slot.initialized())
            .map(|(account, _)| account.clone())
            .collect();
        accounts.sort();
        accounts
    }

    /// Close and forget one account. Returns false if it was not open.
    pub async fn close(&self, account: &str) -> bool {
        let slot = self.managers.lock().await.remove(account);
        match slot.and_then(|slot| slot.get().cloned()) {
            Some(manager) => {
                manager.close().await;
                true
            }
            None => false,
        }
    }

    pub async fn close_all(&self) {
        let slots: Vec<_> = self.managers.lock().await.drain().collect();
        for (_, slot) in slots {
            if let Some(manager) = slot.get() {
                manager.close().await;
            }
        }
    }
}
