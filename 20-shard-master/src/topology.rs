use std::collections::BTreeMap;

use anyhow::{anyhow, ensure, Context, Result};

/// The raft peers of one shard-master deployment, by node id.
///
/// Guarantees an odd, non-zero number of members so a majority is always
/// well defined.
#[derive(Debug, Clone)]
pub struct ReplicaTopology {
    peers: BTreeMap<u64, String>,
}

impl ReplicaTopology {
    pub fn new(peers: BTreeMap<u64, String>) -> Result<Self> {
        ensure!(!peers.is_empty(), "topology requires at least one node");
        ensure!(
            peers.len() % 2 == 1,
            "topology must have an odd number of nodes"
        );
        Ok(Self { peers })
    }

    /// Parses `id=addr` entries as given on the command line.
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Result<Self> {
        let mut peers = BTreeMap::new();
        for entry in entries {
            let entry = entry.as_ref();
            let Some((id_str, addr)) = entry.split_once('=') else {
                return Err(anyhow!("invalid peer entry '{entry}', expected id=addr"));
            };
            let id: u64 = id_str
                .trim()
                .parse()
                .with_context(|| format!("invalid peer id in '{entry}'"))?;
            ensure!(id != 0, "peer id 0 is reserved by raft");
            if peers.insert(id, addr.trim().to_string()).is_some() {
                return Err(anyhow!("peer id {id} listed twice"));
            }
        }
        Self::new(peers)
    }

    /// Node ids in ascending order.
    pub fn ids(&self) -> Vec<u64> {
        self.peers.keys().copied().collect()
    }

    pub fn address(&self, id: u64) -> Option<&str> {
        self.peers.get(&id).map(String::as_str)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.peers.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
