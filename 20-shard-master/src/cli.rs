use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand, ValueHint};

use crate::controller::{DEFAULT_APPLY_TIMEOUT, DEFAULT_NUM_SHARDS};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one controller replica and serve client requests.
    Serve(ServeArgs),
    /// Connect to the controller cluster and issue commands interactively.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Numeric replica id (must match one entry in --peer)
    #[arg(long, default_value_t = 1)]
    pub id: u64,

    /// Address this replica listens on for raft messages
    #[arg(long, default_value = "127.0.0.1:7101", value_hint = ValueHint::Hostname)]
    pub raft_listen: String,

    /// Address this replica listens on for client requests. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:6101")]
    pub listen: SocketAddr,

    /// Comma-separated peer map: id=addr,id=addr,... (must include self).
    /// Without peers the replica runs standalone on an in-process log.
    #[arg(long, value_delimiter = ',', value_hint = ValueHint::Other)]
    pub peer: Vec<String>,

    /// Number of shards; every replica must use the same value
    #[arg(long, default_value_t = DEFAULT_NUM_SHARDS)]
    pub shards: usize,

    /// How long a request waits for its command to commit, in milliseconds
    #[arg(long, default_value_t = DEFAULT_APPLY_TIMEOUT.as_millis() as u64)]
    pub apply_timeout_ms: u64,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Comma-separated client addresses of the controller replicas
    #[arg(long, value_delimiter = ',', default_value = "127.0.0.1:6101")]
    pub server: Vec<SocketAddr>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_defaults_to_standalone() {
        let cli = Cli::parse_from(["shard-master", "serve"]);
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert!(args.peer.is_empty());
        assert_eq!(args.shards, DEFAULT_NUM_SHARDS);
        assert_eq!(args.apply_timeout_ms, 200);
    }

    #[test]
    fn peers_and_servers_are_comma_delimited() {
        let cli = Cli::parse_from([
            "shard-master",
            "serve",
            "--id",
            "2",
            "--peer",
            "1=127.0.0.1:7101,2=127.0.0.1:7102,3=127.0.0.1:7103",
        ]);
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(args.id, 2);
        assert_eq!(args.peer.len(), 3);

        let cli = Cli::parse_from([
            "shard-master",
            "client",
            "--server",
            "127.0.0.1:6101,127.0.0.1:6102",
        ]);
        let Command::Client(args) = cli.command else {
            panic!("expected client");
        };
        assert_eq!(args.server.len(), 2);
    }
}
