//! Race-safe completion slots.
//!
//! A claim handler registers a slot for the new member before committing,
//! then blocks on it. The certificate reconciler's finalization may fire
//! `complete` before the handler installs its waiter; the slot stores the
//! result and hands it over the moment the waiter attaches.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use uuid::Uuid;

use vanfab_protocol::ClaimReply;

#[derive(Default)]
struct Slot {
    result: Option<ClaimReply>,
    waiter: Option<oneshot::Sender<ClaimReply>>,
}

/// Completion slots keyed by member-site id.
#[derive(Default)]
pub struct CompletionTable {
    slots: Mutex<HashMap<Uuid, Slot>>,
}

impl CompletionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a slot ahead of the wait.
    pub fn register(&self, member: Uuid) {
        self.slots.lock().entry(member).or_default();
    }

    /// Deliver the completion result. If a waiter is already blocked it is
    /// released immediately; otherwise the result is stored for the waiter
    /// to find.
    pub fn complete(&self, member: Uuid, reply: ClaimReply) {
        let mut slots = self.slots.lock();
        let slot = slots.entry(member).or_default();
        match slot.waiter.take() {
            Some(waiter) => {
                let _ = waiter.send(reply);
                slots.remove(&member);
            }
            None => {
                slot.result = Some(reply);
            }
        }
    }

    /// Block until the slot completes, or None after `timeout`. The slot is
    /// removed either way.
    pub async fn wait(&self, member: Uuid, timeout: Duration) -> Option<ClaimReply> {
        let rx = {
            let mut slots = self.slots.lock();
            let slot = slots.entry(member).or_default();
            if let Some(result) = slot.result.take() {
                slots.remove(&member);
                return Some(result);
            }
            let (tx, rx) = oneshot::channel();
            slot.waiter = Some(tx);
            rx
        };
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Some(reply),
            _ => {
                self.slots.lock().remove(&member);
                None
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(member: Uuid) -> ClaimReply {
        ClaimReply::success(member.to_string(), vec![], serde_json::json!({}))
    }

    #[tokio::test]
    async fn wait_then_complete() {
        let table = std::sync::Arc::new(CompletionTable::new());
        let member = Uuid::new_v4();
        table.register(member);

        let waiter = {
            let table = table.clone();
            tokio::spawn(async move { table.wait(member, Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        table.complete(member, reply(member));

        let result = waiter.await.unwrap().expect("completion expected");
        assert_eq!(result.site_id, Some(member.to_string()));
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn complete_before_wait_still_resolves() {
        let table = CompletionTable::new();
        let member = Uuid::new_v4();
        table.register(member);

        // Completion fires first; the result parks in the slot.
        table.complete(member, reply(member));

        let result = table
            .wait(member, Duration::from_millis(50))
            .await
            .expect("stored result expected");
        assert_eq!(result.site_id, Some(member.to_string()));
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn timeout_clears_the_slot() {
        let table = CompletionTable::new();
        let member = Uuid::new_v4();
        table.register(member);
        assert!(table.wait(member, Duration::from_millis(30)).await.is_none());
        assert_eq!(table.len(), 0);
    }
}
