//! The narrow interface the controller needs from a consensus engine.
//!
//! Two engines implement it: [`crate::runtime::RaftHandle`] (tikv/raft over TCP)
//! and [`crate::local_log::LocalReplica`] (an in-process log for single-process
//! runs and tests).

use std::future::Future;

use tokio::sync::mpsc;

use crate::command::Command;
use crate::error::ControllerError;

/// Where the engine placed a submitted command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Proposal {
    pub index: u64,
    pub term: u64,
}

/// A command the cluster agreed on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed {
    pub index: u64,
    pub term: u64,
    pub command: Command,
}

/// Committed commands in strictly increasing index order, each delivered once.
/// Indices may skip entries that carry no command.
pub type CommitStream = mpsc::UnboundedReceiver<Committed>;

pub trait Consensus: Send + Sync + 'static {
    /// Appends `command` to the log if this replica leads.
    ///
    /// Returns [`ControllerError::NotLeader`] otherwise. Success only means the
    /// command was accepted; it may still be lost if leadership changes before
    /// it commits.
    fn start(
        &self,
        command: Command,
    ) -> impl Future<Output = Result<Proposal, ControllerError>> + Send;

    /// Stops the engine. Later calls to `start` fail.
    fn kill(&self);
}
