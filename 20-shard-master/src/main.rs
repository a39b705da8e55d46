//! Entry point for running a controller replica or the interactive client.
//!
//! Start a 3-replica cluster:
//! ```bash
//! cargo run --bin shard-master -- serve --id 1 --raft-listen 127.0.0.1:7101 \
//!   --listen 127.0.0.1:6101 --peer 1=127.0.0.1:7101,2=127.0.0.1:7102,3=127.0.0.1:7103
//! # ... same for ids 2 and 3 ...
//! cargo run --bin shard-master -- client --server 127.0.0.1:6101,127.0.0.1:6102,127.0.0.1:6103
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use shard_master::{
    cli::{Cli, Command, ServeArgs},
    client,
    consensus::{CommitStream, Consensus},
    controller::{ControllerOptions, ShardController},
    local_log::LocalLog,
    rpc::RpcServer,
    runtime::{spawn_node, NodeConfig},
    topology::ReplicaTopology,
};

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => serve(args).await?,
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}

async fn serve(args: ServeArgs) -> Result<()> {
    let options = ControllerOptions {
        num_shards: args.shards,
        apply_timeout: Duration::from_millis(args.apply_timeout_ms),
    };
    let listener = TcpListener::bind(args.listen).await?;

    if args.peer.is_empty() {
        info!("no peers given, running standalone on an in-process log");
        let (_log, members) = LocalLog::new(1);
        let (replica, commits) = members
            .into_iter()
            .next()
            .context("local log created without replicas")?;
        return run_replica(replica, commits, options, listener).await;
    }

    let topology = ReplicaTopology::parse(&args.peer)?;
    info!(id = args.id, peers = topology.len(), raft_listen = %args.raft_listen, "starting raft node");
    let (handle, commits) = spawn_node(NodeConfig {
        id: args.id,
        listen_addr: args.raft_listen,
        topology,
    })?;
    run_replica(handle, commits, options, listener).await
}

async fn run_replica<C: Consensus>(
    consensus: C,
    commits: CommitStream,
    options: ControllerOptions,
    listener: TcpListener,
) -> Result<()> {
    info!(num_shards = options.num_shards, apply_timeout = ?options.apply_timeout, "controller starting");
    let controller = Arc::new(ShardController::start(consensus, commits, options));
    let server = RpcServer::new(listener, Arc::clone(&controller));
    info!("serving clients on {}", server.local_addr()?);

    let result = server.run_until_ctrl_c().await;
    controller.kill();
    if let Err(err) = &result {
        warn!("rpc server exited with error: {err:?}");
    }
    result
}
