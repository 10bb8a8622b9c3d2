use crate::channels::ChannelHandle;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Running channel adapters, keyed by account id. Cloned freely; the map is
/// shared.
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<dyn ChannelHandle>>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handle under its account id, stopping any handle that was
    /// already registered there.
    pub async fn register(&self, handle: Arc<dyn ChannelHandle>) {
        let id = handle.id().to_string();
        let previous = self.inner.write().await.insert(id.clone(), handle);
        if let Some(old) = previous {
            log::info!("replacing channel for account {}", id);
            if let Err(e) = old.stop().await {
                log::warn!("stopping replaced channel {}: {}", id, e);
            }
        }
    }

    pub async fn get(&self, account_id: &str) -> Option<Arc<dyn ChannelHandle>> {
        self.inner.read().await.get(account_id).cloned()
    }

    pub async fn remove(&self, account_id: &str) -> Option<Arc<dyn ChannelHandle>> {
        self.inner.write().await.remove(account_id)
    }

    pub async fn list(&self) -> Vec<Arc<dyn ChannelHandle>> {
        self.inner.read().await.values().cloned().collect()
    }

    /// Stop every registered adapter. Used during shutdown.
    pub async fn stop_all(&self) {
        let handles: Vec<_> = self.inner.write().await.drain().collect();
        for (id, handle) in handles {
            if let Err(e) = handle.stop().await {
                log::warn!("stopping channel {}: {}", id, e);
            }
        }
    }
}
