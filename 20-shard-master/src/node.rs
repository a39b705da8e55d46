//! A raft participant that replicates shard-controller commands.
//!
//! This module wraps the tikv/raft library behind a small interface: propose a
//! [`Command`], drive the node with ticks and peer messages, and collect the
//! commands that became committed. Applying those commands is not this
//! module's business; they are handed to the shard controller's apply loop.

use anyhow::{Context, Result};
use raft::prelude::{ConfState, Config, Entry, EntryType, Message, RawNode};
use raft::storage::MemStorage;
use raft::StateRole;
use slog::{o, Logger};

use crate::command::Command;
use crate::consensus::{Committed, Proposal};

/// raft insists on an slog logger; our own events go through `tracing`.
fn silent_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

/// One ready cycle's worth of work for the caller: peer traffic to send and
/// client commands that reached a quorum, in log order.
pub struct ReadyBundle {
    pub messages: Vec<Message>,
    pub committed: Vec<Committed>,
}

/// A single Raft participant.
pub struct RaftNode {
    id: u64,
    raw: RawNode<MemStorage>,
    storage: MemStorage,
}

impl RaftNode {
    /// Creates a node that starts out knowing the full voter set.
    pub fn new(id: u64, voters: &[u64]) -> Result<Self> {
        let cfg = Config {
            id,
            election_tick: 10,
            heartbeat_tick: 3,
            max_inflight_msgs: 256,
            ..Default::default()
        };
        let storage = MemStorage::new_with_conf_state(ConfState::from((voters.to_vec(), vec![])));
        let logger = silent_logger();
        let raw = RawNode::new(&cfg, storage.clone(), &logger)
            .with_context(|| format!("failed to construct RawNode {id}"))?;
        Ok(Self { id, raw, storage })
    }

    pub fn tick(&mut self) {
        self.raw.tick();
    }

    pub fn campaign(&mut self) -> Result<()> {
        self.raw.campaign().context("campaign failed")
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> StateRole {
        self.raw.raft.state
    }

    pub fn leader_id(&self) -> u64 {
        self.raw.raft.leader_id
    }

    pub fn term(&self) -> u64 {
        self.raw.raft.term
    }

    pub fn commit_index(&self) -> u64 {
        self.raw.raft.raft_log.committed
    }

    /// Appends a command to the local log if this node leads.
    ///
    /// Returns `Ok(None)` on followers and candidates, and when raft drops the
    /// proposal (for example during a leadership transfer). On success the
    /// returned index and term identify the slot the command occupies; it may
    /// still be overwritten if leadership changes before it commits.
    pub fn propose(&mut self, command: &Command) -> Result<Option<Proposal>> {
        if self.role() != StateRole::Leader {
            return Ok(None);
        }
        let data = command.encode().context("encode command failed")?;
        if self.raw.propose(vec![], data).is_err() {
            return Ok(None);
        }
        Ok(Some(Proposal {
            index: self.raw.raft.raft_log.last_index(),
            term: self.term(),
        }))
    }

    pub fn step(&mut self, msg: Message) -> Result<()> {
        self.raw.step(msg).context("step failed")
    }

    /// Processes one ready batch, if any.
    ///
    /// Persists entries and hard state to `MemStorage`, collects outbound
    /// messages, and decodes committed entries. Both the Ready and the
    /// LightReady phase can carry committed entries; they are returned in order.
    pub fn poll_ready(&mut self) -> Result<Option<ReadyBundle>> {
        if !self.raw.has_ready() {
            return Ok(None);
        }

        let mut ready = self.raw.ready();
        let mut committed = Vec::new();
        let mut outbound = Vec::new();

        if let Some(hard_state) = ready.hs() {
            self.storage.wl().set_hardstate(hard_state.clone());
        }

        if !ready.entries().is_empty() {
            self.storage
                .wl()
                .append(ready.entries())
                .context("append entries failed")?;
        }

        if !ready.snapshot().is_empty() {
            self.storage
                .wl()
                .apply_snapshot(ready.snapshot().clone())
                .context("apply snapshot failed")?;
        }

        committed.extend(decode_entries(ready.take_committed_entries())?);
        outbound.extend(ready.take_messages());
        outbound.extend(ready.take_persisted_messages());

        let mut light_ready = self.raw.advance(ready);

        if let Some(commit) = light_ready.commit_index() {
            self.storage.wl().mut_hard_state().set_commit(commit);
        }

        committed.extend(decode_entries(light_ready.take_committed_entries())?);
        outbound.extend(light_ready.take_messages());

        self.raw.advance_apply();

        Ok(Some(ReadyBundle {
            messages: outbound,
            committed,
        }))
    }
}

/// Turns committed raft entries into commands.
///
/// Empty entries (appended by every new leader) and configuration changes are
/// skipped; the commit stream only carries client commands.
fn decode_entries(entries: Vec<Entry>) -> Result<Vec<Committed>> {
    let mut committed = Vec::new();
    for entry in entries {
        if entry.data.is_empty() || entry.entry_type() != EntryType::EntryNormal {
            continue;
        }
        let command = Command::decode(&entry.data)
            .with_context(|| format!("decode command at index {} failed", entry.index))?;
        committed.push(Committed {
            index: entry.index,
            term: entry.term,
            command,
        });
    }
    Ok(committed)
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, VecDeque};

    use super::*;
    use crate::command::Op;

    /// Nodes wired together through an in-memory queue. Nothing ticks, so
    /// leadership only changes when a test asks for it.
    struct Mesh {
        nodes: BTreeMap<u64, RaftNode>,
        in_flight: VecDeque<Message>,
        applied: BTreeMap<u64, Vec<Committed>>,
    }

    impl Mesh {
        fn with_nodes(size: u64) -> Result<Self> {
            let voters: Vec<u64> = (1..=size).collect();
            let nodes = voters
                .iter()
                .map(|&id| Ok((id, RaftNode::new(id, &voters)?)))
                .collect::<Result<_>>()?;
            Ok(Self {
                nodes,
                in_flight: VecDeque::new(),
                applied: BTreeMap::new(),
            })
        }

        fn get(&mut self, id: u64) -> &mut RaftNode {
            self.nodes.get_mut(&id).unwrap()
        }

        /// Drains ready state and delivers messages until nothing moves.
        fn settle(&mut self) -> Result<()> {
            loop {
                for (id, node) in &mut self.nodes {
                    while let Some(bundle) = node.poll_ready()? {
                        self.in_flight.extend(bundle.messages);
                        self.applied.entry(*id).or_default().extend(bundle.committed);
                    }
                }
                if self.in_flight.is_empty() {
                    return Ok(());
                }
                while let Some(msg) = self.in_flight.pop_front() {
                    if let Some(target) = self.nodes.get_mut(&msg.to) {
                        target.step(msg)?;
                    }
                }
            }
        }

        fn elect(&mut self, id: u64) -> Result<()> {
            self.get(id).campaign()?;
            self.settle()
        }

        fn leader(&self) -> Option<u64> {
            let mut leaders = self
                .nodes
                .values()
                .filter(|node| node.role() == StateRole::Leader)
                .map(RaftNode::id);
            let leader = leaders.next();
            assert_eq!(leaders.next(), None, "two leaders at once");
            leader
        }

        fn applied_on(&self, id: u64) -> Vec<Committed> {
            self.applied.get(&id).cloned().unwrap_or_default()
        }
    }

    fn join(client_id: i64, gid: u64) -> Command {
        let mut groups = BTreeMap::new();
        groups.insert(gid, vec![format!("g{gid}")]);
        Command::new(client_id, 1, Op::Join { groups })
    }

    #[test]
    fn campaign_wins_election() -> Result<()> {
        let mut mesh = Mesh::with_nodes(3)?;
        assert_eq!(mesh.leader(), None);
        assert_eq!(mesh.get(2).leader_id(), 0);

        mesh.elect(1)?;
        assert_eq!(mesh.leader(), Some(1));
        for id in 2..=3 {
            assert_eq!(mesh.get(id).role(), StateRole::Follower);
            assert_eq!(mesh.get(id).leader_id(), 1);
        }
        Ok(())
    }

    #[test]
    fn only_the_leader_accepts_proposals() -> Result<()> {
        let mut mesh = Mesh::with_nodes(3)?;
        assert!(mesh.get(1).propose(&join(1, 100))?.is_none());

        mesh.elect(1)?;
        assert!(mesh.get(3).propose(&join(1, 100))?.is_none());
        let proposal = mesh.get(1).propose(&join(1, 100))?.expect("leader accepts");
        assert_eq!(proposal.term, mesh.get(1).term());
        Ok(())
    }

    #[test]
    fn commands_commit_everywhere_in_proposal_order() -> Result<()> {
        let mut mesh = Mesh::with_nodes(3)?;
        mesh.elect(1)?;

        let first = mesh.get(1).propose(&join(7, 100))?.expect("leader accepts");
        let second = mesh.get(1).propose(&join(8, 101))?.expect("leader accepts");
        assert_eq!(second.index, first.index + 1);
        mesh.settle()?;

        for id in 1..=3 {
            // The leader's empty entry is not forwarded.
            let applied = mesh.applied_on(id);
            let indices: Vec<u64> = applied.iter().map(|c| c.index).collect();
            assert_eq!(indices, vec![first.index, second.index], "node {id}");
            assert_eq!(applied[0].command, join(7, 100));
            assert_eq!(applied[1].command, join(8, 101));
            assert!(mesh.get(id).commit_index() >= second.index);
        }
        Ok(())
    }

    #[test]
    fn newer_campaign_takes_over() -> Result<()> {
        let mut mesh = Mesh::with_nodes(3)?;
        mesh.elect(1)?;
        let first_term = mesh.get(1).term();

        mesh.elect(2)?;
        assert_eq!(mesh.leader(), Some(2));
        assert_eq!(mesh.get(1).role(), StateRole::Follower);
        assert!(mesh.get(1).term() > first_term);

        // The old leader now refuses writes.
        assert!(mesh.get(1).propose(&join(1, 100))?.is_none());
        Ok(())
    }
}
