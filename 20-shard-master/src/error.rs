//! Error taxonomy surfaced by the shard controller.
//!
//! Duplicates never show up here: a command whose `(client_id, sequence)` was
//! already applied is acknowledged like any other.

use thiserror::Error;

use crate::command::{GroupId, ShardId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControllerError {
    /// This replica cannot accept writes right now; try another one.
    #[error("wrong leader")]
    NotLeader,

    /// The command was submitted but its commit was not observed in time.
    /// Retrying with the same sequence number is safe.
    #[error("timed out waiting for log index {index} to commit")]
    Timeout { index: u64 },

    #[error("shard {shard} out of range (configured for {num_shards} shards)")]
    ShardOutOfRange { shard: ShardId, num_shards: usize },

    #[error("group id {0} is reserved")]
    InvalidGroup(GroupId),

    #[error("configuration version {actual} appended out of order, expected {expected}")]
    VersionOutOfOrder { expected: u64, actual: u64 },

    #[error("consensus engine unavailable: {0}")]
    Unavailable(String),
}

impl ControllerError {
    /// Whether a client should try its request against another replica.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ControllerError::NotLeader
                | ControllerError::Timeout { .. }
                | ControllerError::Unavailable(_)
        )
    }
}
