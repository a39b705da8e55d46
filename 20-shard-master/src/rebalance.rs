//! Computes the next configuration from the latest one and a membership change.
//!
//! Everything here is a pure function of its inputs. Replicas apply the same
//! committed commands in the same order, and they only stay identical if this
//! module gives the same answer on each of them, so groups are always visited
//! in ascending id order (the natural order of `BTreeMap`) and shards in
//! ascending index order.

use std::collections::{BTreeMap, BTreeSet};

use crate::command::{GroupId, Op, ShardId, UNASSIGNED};
use crate::error::ControllerError;
use crate::store::ShardConfig;

/// A configuration-changing operation, borrowed from a committed [`Op`].
#[derive(Debug, Clone, Copy)]
pub enum Change<'a> {
    Join(&'a BTreeMap<GroupId, Vec<String>>),
    Leave(&'a BTreeSet<GroupId>),
    Move { shard: ShardId, group: GroupId },
}

impl<'a> Change<'a> {
    /// `None` for read-only operations.
    pub fn from_op(op: &'a Op) -> Option<Self> {
        match op {
            Op::Join { groups } => Some(Change::Join(groups)),
            Op::Leave { group_ids } => Some(Change::Leave(group_ids)),
            Op::Move { shard, group } => Some(Change::Move {
                shard: *shard,
                group: *group,
            }),
            Op::Query { .. } => None,
        }
    }
}

/// Produces the successor of `latest` after applying `change`.
///
/// Join and Leave update the group table and then redistribute shards. Move is
/// an operator override: only the named shard changes owner and no balancing
/// happens.
pub fn rebalance(latest: &ShardConfig, change: Change<'_>) -> Result<ShardConfig, ControllerError> {
    let mut next = latest.successor();
    match change {
        Change::Join(groups) => {
            for (gid, servers) in groups {
                next.groups.insert(*gid, servers.clone());
            }
            redistribute(&mut next);
        }
        Change::Leave(group_ids) => {
            for gid in group_ids {
                next.groups.remove(gid);
            }
            redistribute(&mut next);
        }
        Change::Move { shard, group } => {
            let num_shards = next.num_shards();
            let slot = next
                .shards
                .get_mut(shard)
                .ok_or(ControllerError::ShardOutOfRange { shard, num_shards })?;
            *slot = group;
        }
    }
    Ok(next)
}

/// Reassigns shards so every joined group holds `floor(S/N)` or `ceil(S/N)`
/// of them, moving as few shards as possible.
fn redistribute(config: &mut ShardConfig) {
    let num_shards = config.num_shards();
    let num_groups = config.groups.len();
    if num_groups == 0 {
        config.shards.fill(UNASSIGNED);
        return;
    }

    // With more groups than shards some groups simply get nothing.
    let per_group = num_shards / num_groups;
    let (target, mut spare) = if per_group == 0 {
        (1, 0)
    } else {
        (per_group, num_shards % num_groups)
    };

    let mut owned: BTreeMap<GroupId, Vec<ShardId>> = config
        .groups
        .keys()
        .map(|gid| (*gid, Vec::new()))
        .collect();
    let mut pending = Vec::new();
    for (shard, owner) in config.shards.iter().enumerate() {
        match owned.get_mut(owner) {
            Some(shards) => shards.push(shard),
            None => pending.push(shard),
        }
    }

    // Overloaded groups give up their highest shards. While spare slots remain
    // they keep one above target, otherwise those shards would only move to
    // come straight back as leftovers.
    for shards in owned.values_mut() {
        let mut keep = target;
        if shards.len() > target && spare > 0 {
            keep += 1;
            spare -= 1;
        }
        if shards.len() > keep {
            pending.extend(shards.drain(keep..));
        }
    }
    pending.sort_unstable();

    let mut load: BTreeMap<GroupId, usize> = owned
        .iter()
        .map(|(gid, shards)| (*gid, shards.len()))
        .collect();
    let candidates: Vec<GroupId> = load
        .iter()
        .filter(|(_, count)| **count < target)
        .map(|(gid, _)| *gid)
        .collect();

    let mut pending = pending.into_iter();
    for gid in &candidates {
        let Some(count) = load.get_mut(gid) else {
            continue;
        };
        while *count < target {
            let Some(shard) = pending.next() else {
                break;
            };
            config.shards[shard] = *gid;
            *count += 1;
        }
    }

    // Whatever is left is the remainder of S / N: one more shard each for
    // groups still at target, former candidates first.
    let mut receivers: Vec<GroupId> = candidates
        .iter()
        .copied()
        .chain(load.keys().copied().filter(|gid| !candidates.contains(gid)))
        .filter(|gid| load.get(gid) == Some(&target))
        .collect();
    if receivers.is_empty() {
        receivers = load.keys().copied().collect();
    }
    for (shard, gid) in pending.zip(receivers.iter().cycle()) {
        config.shards[shard] = *gid;
    }
}
