//! In-process consensus engine.
//!
//! Every replica shares one log. Leadership is assigned explicitly with
//! [`LocalLog::elect`] instead of through elections, which makes it handy for
//! standalone deployments and for tests that need precise control over when
//! entries commit.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::debug;

use crate::command::Command;
use crate::consensus::{CommitStream, Committed, Consensus, Proposal};
use crate::error::ControllerError;

struct LogState {
    term: u64,
    leader: Option<usize>,
    /// Entry `i` lives at log index `i + 1`.
    entries: Vec<Committed>,
    commit_index: u64,
    holding: bool,
    /// One commit stream per replica; `None` once the replica is killed.
    subscribers: Vec<Option<mpsc::UnboundedSender<Committed>>>,
}

impl LogState {
    fn commit_through(&mut self, index: u64) {
        let index = index.min(self.entries.len() as u64);
        while self.commit_index < index {
            let entry = self.entries[self.commit_index as usize].clone();
            self.commit_index += 1;
            for subscriber in self.subscribers.iter().flatten() {
                // A replica whose apply loop is gone just misses the entry.
                let _ = subscriber.send(entry.clone());
            }
        }
    }
}

fn lock(shared: &Mutex<LogState>) -> MutexGuard<'_, LogState> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Control surface for the shared log.
#[derive(Clone)]
pub struct LocalLog {
    shared: Arc<Mutex<LogState>>,
}

impl LocalLog {
    /// Creates a log with `replicas` members. Replica 0 leads in term 1.
    pub fn new(replicas: usize) -> (Self, Vec<(LocalReplica, CommitStream)>) {
        let mut senders = Vec::with_capacity(replicas);
        let mut streams = Vec::with_capacity(replicas);
        for _ in 0..replicas {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.push(Some(tx));
            streams.push(rx);
        }

        let shared = Arc::new(Mutex::new(LogState {
            term: 1,
            leader: (replicas > 0).then_some(0),
            entries: Vec::new(),
            commit_index: 0,
            holding: false,
            subscribers: senders,
        }));

        let members = streams
            .into_iter()
            .enumerate()
            .map(|(id, stream)| {
                let replica = LocalReplica {
                    id,
                    shared: Arc::clone(&shared),
                };
                (replica, stream)
            })
            .collect();

        (Self { shared }, members)
    }

    /// Hands leadership to `replica` in a new term. Entries that were accepted
    /// but never committed are discarded, as a new raft leader would overwrite them.
    pub fn elect(&self, replica: usize) {
        let mut state = lock(&self.shared);
        state.term += 1;
        state.leader = Some(replica);
        let commit_index = state.commit_index as usize;
        let dropped = state.entries.len() - commit_index;
        state.entries.truncate(commit_index);
        debug!(replica, term = state.term, dropped, "local log elected new leader");
    }

    /// Keeps accepting entries without committing them.
    pub fn hold_commits(&self) {
        lock(&self.shared).holding = true;
    }

    /// Commits everything accepted so far and resumes committing on accept.
    pub fn release_commits(&self) {
        let mut state = lock(&self.shared);
        state.holding = false;
        let last = state.entries.len() as u64;
        state.commit_through(last);
    }

    pub fn leader(&self) -> Option<usize> {
        lock(&self.shared).leader
    }

    pub fn term(&self) -> u64 {
        lock(&self.shared).term
    }

    pub fn commit_index(&self) -> u64 {
        lock(&self.shared).commit_index
    }
}

/// One member's view of the shared log.
pub struct LocalReplica {
    id: usize,
    shared: Arc<Mutex<LogState>>,
}

impl LocalReplica {
    pub fn id(&self) -> usize {
        self.id
    }
}

impl Consensus for LocalReplica {
    async fn start(&self, command: Command) -> Result<Proposal, ControllerError> {
        let mut state = lock(&self.shared);
        let alive = state
            .subscribers
            .get(self.id)
            .is_some_and(|subscriber| subscriber.is_some());
        if state.leader != Some(self.id) || !alive {
            return Err(ControllerError::NotLeader);
        }

        let index = state.entries.len() as u64 + 1;
        let term = state.term;
        state.entries.push(Committed {
            index,
            term,
            command,
        });
        if !state.holding {
            state.commit_through(index);
        }
        Ok(Proposal { index, term })
    }

    fn kill(&self) {
        let mut state = lock(&self.shared);
        if let Some(subscriber) = state.subscribers.get_mut(self.id) {
            subscriber.take();
        }
        if state.leader == Some(self.id) {
            state.leader = None;
        }
    }
}
