//! Answered-message bookkeeping shared by the live reply path and the
//! unread sweep. Whichever path claims a message id first owns it.

use std::collections::HashSet;
use tokio::sync::Mutex;

/// Set of message ids that have been answered or are being answered.
#[derive(Default)]
pub struct AnsweredSet {
    inner: Mutex<HashSet<String>>,
}

impl AnsweredSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a message id. Returns `true` exactly once per id; the claim is
    /// taken before any work starts so concurrent paths cannot both answer.
    pub async fn claim(&self, message_id: &str) -> bool {
        self.inner.lock().await.insert(message_id.to_string())
    }

    /// Release a claim after a failure that produced no reply, so a later
    /// sweep can retry the message.
    pub async fn release(&self, message_id: &str) {
        self.inner.lock().await.remove(message_id);
    }

    pub async fn contains(&self, message_id: &str) -> bool {
        self.inner.lock().await.contains(message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn claim_succeeds_exactly_once() {
        let set = AnsweredSet::new();
        assert!(set.claim("m1").await);
        assert!(!set.claim("m1").await);
        assert!(set.claim("m2").await);
    }

    #[tokio::test]
    async fn release_makes_the_id_claimable_again() {
        let set = AnsweredSet::new();
        assert!(set.claim("m1").await);
        set.release("m1").await;
        assert!(set.claim("m1").await);
    }
}
