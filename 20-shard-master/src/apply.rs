//! The apply loop: the single consumer of the commit stream.
//!
//! For every committed entry, in order:
//! 1. decide whether `(client_id, sequence)` was already applied,
//! 2. if not, apply the operation (new configuration for Join/Leave/Move),
//! 3. record the sequence in the dedup table regardless,
//! 4. wake the local waiter for that index, if one is registered.
//!
//! Steps 3 and 4 also run for duplicates. A client retrying after a lost reply
//! must get an answer, and every replica's dedup table must reflect the whole
//! committed history, not just the requests that replica happened to serve.

use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::command::Op;
use crate::consensus::{CommitStream, Committed};
use crate::controller::{lock, ControllerState};
use crate::rebalance::{rebalance, Change};
use crate::waiter::Applied;

pub(crate) async fn run(state: Arc<Mutex<ControllerState>>, mut commits: CommitStream) {
    while let Some(committed) = commits.recv().await {
        lock(&state).apply(committed);
    }
    debug!("commit stream closed, apply loop exiting");
}

impl ControllerState {
    /// Applies one committed entry. Returns whether it changed the configuration.
    pub(crate) fn apply(&mut self, committed: Committed) -> bool {
        let Committed {
            index,
            term,
            command,
        } = committed;
        let client_id = command.client_id;
        let sequence = command.sequence;
        let op = command.op.kind();

        if index <= self.last_applied {
            warn!(index, last_applied = self.last_applied, "ignoring entry at or below last applied index");
            return false;
        }

        let mut changed = false;
        if self.dedup.is_duplicate(client_id, sequence) {
            debug!(index, client_id, sequence, op, "duplicate command acknowledged without effect");
        } else if let Some(change) = Change::from_op(&command.op) {
            let installed = rebalance(self.configs.latest(), change)
                .and_then(|next| self.configs.append(next));
            match installed {
                Ok(config) => {
                    changed = true;
                    info!(index, client_id, sequence, op, version = config.version, "configuration installed");
                }
                // Deterministic on every replica, so skipping keeps them in step.
                Err(err) => warn!(index, client_id, sequence, op, error = %err, "command rejected"),
            }
        }

        let config = match command.op {
            Op::Query { version } => Some(Arc::clone(self.configs.at(version))),
            _ => None,
        };
        self.dedup.record(client_id, sequence);
        self.last_applied = index;

        let woke = self.waiters.notify(
            index,
            Applied {
                term,
                client_id,
                sequence,
                config,
            },
        );
        debug!(index, woke, "entry applied");
        changed
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::command::Command;

    fn committed(index: u64, client_id: i64, sequence: u64, op: Op) -> Committed {
        Committed {
            index,
            term: 1,
            command: Command::new(client_id, sequence, op),
        }
    }

    fn join(gid: u64) -> Op {
        let mut groups = BTreeMap::new();
        groups.insert(gid, vec![format!("g{gid}")]);
        Op::Join { groups }
    }

    #[test]
    fn duplicates_do_not_mutate_but_still_notify() {
        let mut state = ControllerState::new(10);
        assert!(state.apply(committed(1, 7, 5, join(100))));

        let (_, mut rx) = state.waiters.register(2);
        assert!(!state.apply(committed(2, 7, 5, join(100))));

        assert_eq!(state.configs.len(), 2);
        assert_eq!(state.last_applied, 2);
        let applied = rx.try_recv().expect("waiter notified for duplicate");
        assert_eq!(applied.sequence, 5);
        assert!(state.waiters.is_empty());
    }

    #[test]
    fn stale_sequence_after_newer_one_is_ignored() {
        let mut state = ControllerState::new(10);
        state.apply(committed(1, 7, 6, join(100)));
        assert!(!state.apply(committed(2, 7, 4, join(101))));
        assert_eq!(state.dedup.last_applied(7), Some(6));
        assert!(!state.configs.latest().groups.contains_key(&101));
    }

    #[test]
    fn query_resolves_at_apply_time() {
        let mut state = ControllerState::new(10);
        state.apply(committed(1, 1, 1, join(100)));

        let (_, mut rx) = state.waiters.register(2);
        assert!(!state.apply(committed(2, 2, 1, Op::Query { version: -1 })));
        state.apply(committed(3, 1, 2, join(101)));

        let config = rx.try_recv().unwrap().config.expect("query carries a config");
        assert_eq!(config.version, 1);
        assert_eq!(state.configs.latest().version, 2);
    }

    #[test]
    fn invalid_move_is_acknowledged_without_effect() {
        let mut state = ControllerState::new(4);
        let (_, mut rx) = state.waiters.register(1);
        assert!(!state.apply(committed(1, 3, 1, Op::Move { shard: 9, group: 1 })));
        assert_eq!(state.configs.len(), 1);
        assert!(rx.try_recv().is_ok());
        assert_eq!(state.dedup.last_applied(3), Some(1));
    }

    #[test]
    fn replayed_index_is_skipped() {
        let mut state = ControllerState::new(4);
        state.apply(committed(5, 1, 1, join(1)));
        assert!(!state.apply(committed(5, 2, 1, join(2))));
        assert!(!state.apply(committed(3, 2, 1, join(2))));
        assert_eq!(state.configs.len(), 2);
        assert_eq!(state.dedup.last_applied(2), None);
    }
}
