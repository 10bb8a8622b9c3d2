//! Per-account runtime state: readiness gating for the unread sweep and
//! tracking of in-flight reply tasks so teardown can cancel them.

use crate::channels::Platform;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

/// State for one connected account.
pub struct AccountState {
    pub id: String,
    pub platform: Platform,
    /// Set once initial sync (history backfill, contact load) has finished.
    /// The unread sweep skips accounts that are not ready.
    ready: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AccountState {
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn mark_ready(&self) {
        if !self.ready.swap(true, Ordering::SeqCst) {
            log::info!("account {} ready", self.id);
        }
    }

    /// Track an in-flight reply task so unregistering the account can cancel
    /// it. Finished tasks are pruned on the way in.
    pub async fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().await;
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    async fn abort_all(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
    }
}

/// All connected accounts, keyed by account id.
#[derive(Clone, Default)]
pub struct AccountRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<AccountState>>>>,
}

impl AccountRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, id: impl Into<String>, platform: Platform) -> Arc<AccountState> {
        let id = id.into();
        let state = Arc::new(AccountState {
            id: id.clone(),
            platform,
            ready: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });
        self.inner.write().await.insert(id, state.clone());
        state
    }

    pub async fn get(&self, id: &str) -> Option<Arc<AccountState>> {
        self.inner.read().await.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<Arc<AccountState>> {
        self.inner.read().await.values().cloned().collect()
    }

    /// Remove an account and cancel any reply task still running for it.
    pub async fn unregister(&self, id: &str) {
        if let Some(state) = self.inner.write().await.remove(id) {
            state.abort_all().await;
            log::info!("account {} unregistered", id);
        }
    }
}
