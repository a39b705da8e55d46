//! Replicated shard-configuration manager.
//!
//! A small cluster of controller replicas agrees, through a replicated log, on
//! a numbered history of configurations. Each configuration assigns every one
//! of a fixed number of shards to a replica group. Clients change the set of
//! groups with Join and Leave, pin a shard with Move, and read any past or the
//! latest configuration with Query.
//!
//! # Architecture
//!
//! - **Gateway** ([`controller`]): submits a command to the consensus engine and
//!   blocks on a waiter until the apply loop reports its log index
//! - **Apply loop**: single consumer of the commit stream, the only writer of
//!   the configuration history and the dedup table
//! - **Consensus** ([`consensus`]): either a raft node driven by a worker thread
//!   ([`runtime`]) or an in-process shared log ([`local_log`])
//! - **RPC** ([`rpc`]): JSON lines over TCP, served one task per connection
//!
//! Every replica applies the same entries in the same order and the rebalance
//! is a pure function of the previous configuration, so replicas converge on
//! identical histories.
//!
//! # Modules
//!
//! - [`command`]: Commands replicated through the log
//! - [`store`]: Configuration history and per-client dedup table
//! - [`rebalance`]: Deterministic shard reassignment for Join/Leave/Move
//! - [`waiter`]: Per-index wake-ups for blocked requests
//! - [`controller`]: The replicated controller and its request handlers
//! - [`node`]: Raft node wrapping tikv/raft
//! - [`runtime`]: Raft worker loop, peer networking, node spawning
//! - [`topology`]: Replica id to address map
//! - [`client`]: Retrying client
//! - [`protocol`]: Client REPL command parsing

mod apply;

pub mod cli;
pub mod client;
pub mod command;
pub mod consensus;
pub mod controller;
pub mod error;
pub mod local_log;
pub mod node;
pub mod protocol;
pub mod rebalance;
pub mod rpc;
pub mod runtime;
pub mod store;
pub mod topology;
pub mod waiter;
