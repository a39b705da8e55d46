//! One-shot notification slots keyed by log index.
//!
//! The gateway registers a slot after the consensus engine hands it an index,
//! then awaits the receiver with a timeout. The apply loop fills the slot when
//! that index commits. Each registration gets a token so that a gateway giving
//! up on a timeout cannot remove somebody else's slot for the same index.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::command::ClientId;
use crate::store::ShardConfig;

/// What the apply loop reports for a committed index.
#[derive(Debug, Clone)]
pub struct Applied {
    /// Term of the entry that actually committed at this index.
    pub term: u64,
    pub client_id: ClientId,
    pub sequence: u64,
    /// Answer to a Query, resolved at apply time.
    pub config: Option<Arc<ShardConfig>>,
}

struct Slot {
    token: u64,
    tx: oneshot::Sender<Applied>,
}

#[derive(Default)]
pub struct WaiterRegistry {
    slots: HashMap<u64, Slot>,
    next_token: u64,
}

impl WaiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a slot for `index`. A slot already registered for the same index
    /// is dropped, which wakes its owner with a closed channel.
    pub fn register(&mut self, index: u64) -> (u64, oneshot::Receiver<Applied>) {
        let (tx, rx) = oneshot::channel();
        self.next_token += 1;
        let token = self.next_token;
        self.slots.insert(index, Slot { token, tx });
        (token, rx)
    }

    /// Consumes the slot for `index`, if any. Returns whether someone was waiting.
    pub fn notify(&mut self, index: u64, applied: Applied) -> bool {
        match self.slots.remove(&index) {
            // The receiver may already be gone if its owner timed out just now.
            Some(slot) => slot.tx.send(applied).is_ok(),
            None => false,
        }
    }

    /// Removes the slot for `index` only if it still belongs to `token`.
    pub fn cancel(&mut self, index: u64, token: u64) -> bool {
        if self.slots.get(&index).is_some_and(|slot| slot.token == token) {
            self.slots.remove(&index);
            return true;
        }
        false
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn applied(term: u64) -> Applied {
        Applied {
            term,
            client_id: 1,
            sequence: 1,
            config: None,
        }
    }

    #[tokio::test]
    async fn notify_wakes_registered_waiter_once() {
        let mut registry = WaiterRegistry::new();
        let (_, rx) = registry.register(4);

        assert!(registry.notify(4, applied(2)));
        assert!(!registry.notify(4, applied(2)));
        assert!(registry.is_empty());

        let outcome = rx.await.expect("slot filled");
        assert_eq!(outcome.term, 2);
    }

    #[test]
    fn notify_without_waiter_is_a_no_op() {
        let mut registry = WaiterRegistry::new();
        assert!(!registry.notify(1, applied(1)));
    }

    #[tokio::test]
    async fn cancel_only_removes_own_slot() {
        let mut registry = WaiterRegistry::new();
        let (old_token, old_rx) = registry.register(9);
        let (new_token, _new_rx) = registry.register(9);
        assert_ne!(old_token, new_token);

        // The displaced waiter observes a closed slot.
        assert!(old_rx.await.is_err());

        assert!(!registry.cancel(9, old_token));
        assert_eq!(registry.len(), 1);
        assert!(registry.cancel(9, new_token));
        assert!(registry.is_empty());
    }
}
