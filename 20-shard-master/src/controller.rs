//! The replicated shard controller.
//!
//! A [`ShardController`] couples a consensus engine with the state it
//! replicates. Requests go through [`ShardController::submit`]: the command is
//! handed to the engine, a waiter is registered for the log index it landed
//! at, and the caller blocks (bounded by `apply_timeout`) until the apply loop
//! reports that index as committed. The apply loop is the only writer of the
//! configuration history and the dedup table.
//!
//! All mutable state sits behind one `std::sync::Mutex`. Critical sections are
//! plain map and vector operations and never span an `.await`.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::apply;
use crate::command::{ClientId, Command, GroupId, Op, ShardId, UNASSIGNED};
use crate::consensus::{CommitStream, Consensus, Proposal};
use crate::error::ControllerError;
use crate::store::{ConfigStore, DedupTable, ShardConfig};
use crate::waiter::{Applied, WaiterRegistry};

pub const DEFAULT_NUM_SHARDS: usize = 10;
pub const DEFAULT_APPLY_TIMEOUT: Duration = Duration::from_millis(200);

/// Startup settings. Every replica of one deployment must agree on `num_shards`.
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub num_shards: usize,
    /// How long a request waits for its command to commit.
    pub apply_timeout: Duration,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            num_shards: DEFAULT_NUM_SHARDS,
            apply_timeout: DEFAULT_APPLY_TIMEOUT,
        }
    }
}

/// State shared between the gateway and the apply loop.
pub(crate) struct ControllerState {
    pub(crate) configs: ConfigStore,
    pub(crate) dedup: DedupTable,
    pub(crate) waiters: WaiterRegistry,
    /// Highest log index the apply loop has processed.
    pub(crate) last_applied: u64,
}

impl ControllerState {
    pub(crate) fn new(num_shards: usize) -> Self {
        Self {
            configs: ConfigStore::new(num_shards),
            dedup: DedupTable::new(),
            waiters: WaiterRegistry::new(),
            last_applied: 0,
        }
    }
}

pub(crate) fn lock(state: &Mutex<ControllerState>) -> MutexGuard<'_, ControllerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct ShardController<C> {
    consensus: C,
    state: Arc<Mutex<ControllerState>>,
    options: ControllerOptions,
    apply_task: JoinHandle<()>,
}

impl<C: Consensus> ShardController<C> {
    /// Builds the initial state and spawns the apply loop on the current Tokio runtime.
    pub fn start(consensus: C, commits: CommitStream, options: ControllerOptions) -> Self {
        let state = Arc::new(Mutex::new(ControllerState::new(options.num_shards)));
        let apply_task = tokio::spawn(apply::run(Arc::clone(&state), commits));
        Self {
            consensus,
            state,
            options,
            apply_task,
        }
    }

    pub fn consensus(&self) -> &C {
        &self.consensus
    }

    pub fn options(&self) -> &ControllerOptions {
        &self.options
    }

    pub async fn join(
        &self,
        client_id: ClientId,
        sequence: u64,
        groups: BTreeMap<GroupId, Vec<String>>,
    ) -> Result<(), ControllerError> {
        if let Some(gid) = groups.keys().copied().find(|gid| *gid == UNASSIGNED) {
            return Err(ControllerError::InvalidGroup(gid));
        }
        self.submit(Command::new(client_id, sequence, Op::Join { groups }))
            .await
            .map(|_| ())
    }

    pub async fn leave(
        &self,
        client_id: ClientId,
        sequence: u64,
        group_ids: impl IntoIterator<Item = GroupId>,
    ) -> Result<(), ControllerError> {
        let group_ids = group_ids.into_iter().collect();
        self.submit(Command::new(client_id, sequence, Op::Leave { group_ids }))
            .await
            .map(|_| ())
    }

    pub async fn move_shard(
        &self,
        client_id: ClientId,
        sequence: u64,
        shard: ShardId,
        group: GroupId,
    ) -> Result<(), ControllerError> {
        if shard >= self.options.num_shards {
            return Err(ControllerError::ShardOutOfRange {
                shard,
                num_shards: self.options.num_shards,
            });
        }
        if group == UNASSIGNED {
            return Err(ControllerError::InvalidGroup(group));
        }
        self.submit(Command::new(client_id, sequence, Op::Move { shard, group }))
            .await
            .map(|_| ())
    }

    /// Returns configuration `version`, or the latest one for a negative or
    /// unknown version. Goes through the log so the answer is never staler
    /// than the request.
    pub async fn query(
        &self,
        client_id: ClientId,
        sequence: u64,
        version: i64,
    ) -> Result<Arc<ShardConfig>, ControllerError> {
        let applied = self
            .submit(Command::new(client_id, sequence, Op::Query { version }))
            .await?;
        Ok(applied
            .config
            .unwrap_or_else(|| Arc::clone(lock(&self.state).configs.at(version))))
    }

    /// Submits `command` and waits for it to be applied.
    ///
    /// Fails with `NotLeader` when the engine refuses the command or when a
    /// different entry ended up committed at its index, and with `Timeout` when
    /// the commit was not observed within `apply_timeout`. Both are safe to
    /// retry with the same `(client_id, sequence)`.
    pub async fn submit(&self, command: Command) -> Result<Applied, ControllerError> {
        let client_id = command.client_id;
        let sequence = command.sequence;
        let query_version = match command.op {
            Op::Query { version } => Some(version),
            _ => None,
        };
        let op = command.op.kind();

        let proposal = self.consensus.start(command).await?;
        debug!(index = proposal.index, term = proposal.term, client_id, sequence, op, "command submitted");

        let (token, rx) = {
            let mut state = lock(&self.state);
            // The apply loop may have raced past our index before we got the lock.
            if proposal.index <= state.last_applied {
                return resolve_already_applied(&state, proposal, client_id, sequence, query_version);
            }
            state.waiters.register(proposal.index)
        };

        match timeout(self.options.apply_timeout, rx).await {
            Ok(Ok(applied)) => {
                if applied.term == proposal.term
                    && applied.client_id == client_id
                    && applied.sequence == sequence
                {
                    Ok(applied)
                } else {
                    warn!(
                        index = proposal.index,
                        submitted_term = proposal.term,
                        committed_term = applied.term,
                        "log entry was overwritten before it committed"
                    );
                    Err(ControllerError::NotLeader)
                }
            }
            // Displaced by a newer registration for the same index, or the apply loop stopped.
            Ok(Err(_)) => Err(ControllerError::NotLeader),
            Err(_) => {
                lock(&self.state).waiters.cancel(proposal.index, token);
                warn!(index = proposal.index, client_id, sequence, op, "timed out waiting for commit");
                Err(ControllerError::Timeout {
                    index: proposal.index,
                })
            }
        }
    }

    /// Latest configuration this replica has applied, without going through the log.
    pub fn latest(&self) -> Arc<ShardConfig> {
        Arc::clone(lock(&self.state).configs.latest())
    }

    /// Every configuration applied so far, oldest first.
    pub fn history(&self) -> Vec<Arc<ShardConfig>> {
        lock(&self.state).configs.iter().cloned().collect()
    }

    pub fn last_applied(&self) -> u64 {
        lock(&self.state).last_applied
    }

    /// Number of requests currently blocked on a commit.
    pub fn pending_requests(&self) -> usize {
        lock(&self.state).waiters.len()
    }

    /// Stops the consensus engine and the apply loop.
    pub fn kill(&self) {
        self.consensus.kill();
        self.apply_task.abort();
    }
}

impl<C> Drop for ShardController<C> {
    fn drop(&mut self) {
        self.apply_task.abort();
    }
}

/// Answers a request whose index was applied before its waiter could be
/// registered. The dedup table tells whether the client's command took effect;
/// if it did not, some other entry occupies that index.
fn resolve_already_applied(
    state: &ControllerState,
    proposal: Proposal,
    client_id: ClientId,
    sequence: u64,
    query_version: Option<i64>,
) -> Result<Applied, ControllerError> {
    if !state.dedup.is_duplicate(client_id, sequence) {
        return Err(ControllerError::NotLeader);
    }
    Ok(Applied {
        term: proposal.term,
        client_id,
        sequence,
        config: query_version.map(|version| Arc::clone(state.configs.at(version))),
    })
}
