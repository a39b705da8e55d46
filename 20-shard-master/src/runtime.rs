//! Threads and sockets around a [`RaftNode`].
//!
//! - **Worker thread**: owns the node, serves proposals and status queries, ticks
//! - **Listener thread**: accepts peer connections
//! - **Per-connection threads**: read one framed message and hand it to the worker
//!
//! The worker stays single-threaded and owns the `RaftNode`. The async side
//! reaches it through a crossbeam channel and gets answers back on Tokio
//! oneshots; committed commands leave through an unbounded Tokio channel that
//! the controller's apply loop consumes.

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{ensure, Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use prost::Message as ProstMessage;
use raft::prelude::Message;
use raft::StateRole;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::command::Command;
use crate::consensus::{CommitStream, Committed, Consensus, Proposal};
use crate::error::ControllerError;
use crate::node::RaftNode;
use crate::topology::ReplicaTopology;

/// One raft tick. With the node's settings a heartbeat goes out every 300ms
/// and an election starts after 1s of silence.
const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Largest peer frame accepted. Entries are small commands, so anything near
/// this is a corrupt or hostile header.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

pub struct NodeConfig {
    /// Must appear in `topology`.
    pub id: u64,
    /// Where peers reach this node, e.g. `127.0.0.1:7101`.
    pub listen_addr: String,
    /// Every cluster member, including this one
    pub topology: ReplicaTopology,
}

/// Snapshot of a node's Raft state.
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub node_id: u64,
    pub role: StateRole,
    pub leader_id: u64,
    pub term: u64,
    pub commit_index: u64,
}

/// The async side's way into a raft worker thread. Clones share the worker.
#[derive(Clone)]
pub struct RaftHandle {
    id: u64,
    request_tx: Sender<WorkerRequest>,
}

impl RaftHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Retrieves the node's current role, leader and term.
    pub async fn status(&self) -> Result<NodeStatus> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.request_tx
            .send(WorkerRequest::Status {
                respond_to: resp_tx,
            })
            .context("raft worker is gone")?;
        resp_rx.await.context("status response channel closed")
    }

    /// Starts an election now instead of waiting for the timeout.
    pub async fn campaign(&self) -> Result<()> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.request_tx
            .send(WorkerRequest::Campaign {
                respond_to: resp_tx,
            })
            .context("raft worker is gone")?;
        resp_rx.await.context("campaign response channel closed")?
    }

    /// Signals the worker to shut down.
    pub fn shutdown(&self) -> Result<()> {
        self.request_tx
            .send(WorkerRequest::Shutdown)
            .context("raft worker already stopped")?;
        Ok(())
    }
}

impl Consensus for RaftHandle {
    async fn start(&self, command: Command) -> Result<Proposal, ControllerError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.request_tx
            .send(WorkerRequest::Propose {
                command,
                respond_to: resp_tx,
            })
            .map_err(|_| ControllerError::NotLeader)?;
        resp_rx.await.map_err(|_| ControllerError::NotLeader)?
    }

    fn kill(&self) {
        if let Err(err) = self.shutdown() {
            debug!(node = self.id, error = ?err, "raft worker already stopped");
        }
    }
}

/// Requests sent from the async side to the worker thread.
enum WorkerRequest {
    Propose {
        command: Command,
        respond_to: oneshot::Sender<Result<Proposal, ControllerError>>,
    },
    Status {
        respond_to: oneshot::Sender<NodeStatus>,
    },
    Campaign {
        respond_to: oneshot::Sender<Result<()>>,
    },
    Shutdown,
}

/// Starts a raft node: binds its peer listener, then launches the worker.
///
/// Returns the handle the controller proposes through and the stream of
/// committed commands in log order. Fails when `config.id` is not a member of
/// `config.topology` or the listen address cannot be bound.
pub fn spawn_node(config: NodeConfig) -> Result<(RaftHandle, CommitStream)> {
    ensure!(
        config.topology.contains(config.id),
        "node id {} missing from peers map",
        config.id
    );

    let node = RaftNode::new(config.id, &config.topology.ids())?;
    let (request_tx, request_rx) = unbounded();
    let (network_tx, network_rx) = unbounded();
    let (commit_tx, commit_rx) = mpsc::unbounded_channel();

    spawn_network_listener(&config.listen_addr, network_tx)?;

    let id = config.id;
    let topology = config.topology;
    thread::Builder::new()
        .name(format!("raft-worker-{id}"))
        .spawn(move || {
            if let Err(err) = Worker::new(node, topology, request_rx, network_rx, commit_tx).run() {
                error!(node = id, error = ?err, "raft worker crashed");
            }
        })
        .context("failed to spawn raft worker")?;

    Ok((RaftHandle { id, request_tx }, commit_rx))
}

/// Single owner of the [`RaftNode`]. Serves handle requests and peer messages
/// as they arrive and ticks on a fixed cadence in between.
struct Worker {
    node: RaftNode,
    topology: ReplicaTopology,
    request_rx: Receiver<WorkerRequest>,
    network_rx: Receiver<Message>,
    commit_tx: mpsc::UnboundedSender<Committed>,
    last_role: StateRole,
}

impl Worker {
    fn new(
        node: RaftNode,
        topology: ReplicaTopology,
        request_rx: Receiver<WorkerRequest>,
        network_rx: Receiver<Message>,
        commit_tx: mpsc::UnboundedSender<Committed>,
    ) -> Self {
        let last_role = node.role();
        Self {
            node,
            topology,
            request_rx,
            network_rx,
            commit_tx,
            last_role,
        }
    }

    /// Loops until shutdown is requested or every handle is dropped.
    fn run(&mut self) -> Result<()> {
        let mut next_tick = Instant::now() + TICK_INTERVAL;
        loop {
            let wait = next_tick.saturating_duration_since(Instant::now());

            crossbeam_channel::select! {
                recv(self.request_rx) -> req => {
                    // No handles left.
                    let Ok(req) = req else { break };
                    if !self.handle_request(req)? {
                        break;
                    }
                }
                recv(self.network_rx) -> msg => match msg {
                    Ok(msg) => {
                        let from = msg.from;
                        if let Err(err) = self.node.step(msg) {
                            warn!(node = self.node.id(), peer = from, error = %err, "dropping peer message");
                        }
                    }
                    Err(_) => break,
                },
                default(wait) => {}
            }

            if Instant::now() >= next_tick {
                self.node.tick();
                next_tick = Instant::now() + TICK_INTERVAL;
            }

            self.process_ready()?;
            self.log_role_change();
        }

        info!(node = self.node.id(), "raft worker stopped");
        Ok(())
    }

    /// Returns `false` once shutdown is requested.
    fn handle_request(&mut self, req: WorkerRequest) -> Result<bool> {
        match req {
            WorkerRequest::Propose {
                command,
                respond_to,
            } => {
                let outcome = match self.node.propose(&command) {
                    Ok(Some(proposal)) => Ok(proposal),
                    Ok(None) => Err(ControllerError::NotLeader),
                    Err(err) => Err(ControllerError::Unavailable(err.to_string())),
                };
                let _ = respond_to.send(outcome);
            }
            WorkerRequest::Status { respond_to } => {
                let _ = respond_to.send(self.status());
            }
            WorkerRequest::Campaign { respond_to } => {
                let previous = self.node.role();
                let outcome = self.node.campaign();
                if outcome.is_ok() {
                    info!(node = self.node.id(), ?previous, "campaign initiated");
                }
                let _ = respond_to.send(outcome);
            }
            WorkerRequest::Shutdown => return Ok(false),
        }
        Ok(true)
    }

    fn status(&self) -> NodeStatus {
        NodeStatus {
            node_id: self.node.id(),
            role: self.node.role(),
            leader_id: self.node.leader_id(),
            term: self.node.term(),
            commit_index: self.node.commit_index(),
        }
    }

    /// Sends peer traffic first, then forwards committed commands.
    fn process_ready(&mut self) -> Result<()> {
        while let Some(bundle) = self.node.poll_ready()? {
            for msg in bundle.messages {
                self.route(msg)?;
            }
            for committed in bundle.committed {
                debug!(
                    node = self.node.id(),
                    index = committed.index,
                    term = committed.term,
                    "entry committed"
                );
                if self.commit_tx.send(committed).is_err() {
                    debug!(node = self.node.id(), "commit stream closed, dropping entry");
                }
            }
        }
        Ok(())
    }

    /// Loops messages for this node back into it and ships the rest to peers.
    fn route(&mut self, msg: Message) -> Result<()> {
        let to = msg.to;
        if to == self.node.id() {
            return self.node.step(msg);
        }
        match self.topology.address(to) {
            Some(addr) => send_message(addr, &msg),
            None => warn!(peer = to, "no address for peer, dropping message"),
        }
        Ok(())
    }

    fn log_role_change(&mut self) {
        let role = self.node.role();
        if role == self.last_role {
            return;
        }
        info!(
            node = self.node.id(),
            from = ?self.last_role,
            to = ?role,
            leader = self.node.leader_id(),
            term = self.node.term(),
            "role changed"
        );
        self.last_role = role;
    }
}

/// Binds the peer listener on the caller's thread, so a taken port is an
/// error from [`spawn_node`], then accepts connections in the background.
fn spawn_network_listener(addr: &str, tx: Sender<Message>) -> Result<()> {
    let listener = TcpListener::bind(addr).with_context(|| format!("failed to bind {addr}"))?;
    thread::Builder::new()
        .name(format!("raft-listener-{addr}"))
        .spawn(move || accept_peers(listener, tx))
        .context("failed to spawn network listener")?;
    Ok(())
}

fn accept_peers(listener: TcpListener, tx: Sender<Message>) {
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(err) => {
                warn!(error = %err, "accept error");
                continue;
            }
        };
        let tx = tx.clone();
        thread::spawn(move || {
            let forwarded = read_frame(stream).and_then(|msg| {
                tx.send(msg)
                    .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "worker gone"))
            });
            if let Err(err) = forwarded {
                debug!(error = %err, "dropped inbound raft message");
            }
        });
    }
}

/// Peer frames are a big-endian `u32` length followed by the protobuf message.
fn read_frame(mut stream: TcpStream) -> io::Result<Message> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header)?;
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit of {MAX_FRAME_LEN}"),
        ));
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body)?;
    Message::decode(body.as_slice()).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

fn write_frame(addr: &str, msg: &Message) -> io::Result<()> {
    let body = msg.encode_to_vec();
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    TcpStream::connect(addr)?.write_all(&frame)
}

/// One connection per message. Peers that are down just miss it; raft resends.
fn send_message(addr: &str, msg: &Message) {
    if let Err(err) = write_frame(addr, msg) {
        debug!(peer = addr, error = %err, "failed to send raft message");
    }
}
