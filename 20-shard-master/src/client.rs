//! Client for the shard-master RPC surface.
//!
//! A [`Clerk`] picks a random client id once and numbers its operations. A
//! retried operation keeps its sequence number, so however many replicas see
//! it, the configuration changes at most once.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{anyhow, bail, ensure, Result};
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::select;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::cli::ClientArgs;
use crate::command::{ClientId, GroupId, ShardId};
use crate::protocol::{ConsoleCommand, USAGE};
use crate::rpc::{read_message, write_message, Reply, Request};
use crate::store::ShardConfig;

const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(1);
const RETRY_PAUSE: Duration = Duration::from_millis(100);

pub struct Clerk {
    servers: Vec<SocketAddr>,
    client_id: ClientId,
    sequence: u64,
    /// Index into `servers` of the replica that answered last.
    leader: usize,
    attempt_timeout: Duration,
    max_rounds: Option<usize>,
}

impl Clerk {
    pub fn new(servers: Vec<SocketAddr>) -> Result<Self> {
        Self::with_client_id(servers, rand::random())
    }

    pub fn with_client_id(servers: Vec<SocketAddr>, client_id: ClientId) -> Result<Self> {
        ensure!(!servers.is_empty(), "clerk needs at least one server");
        Ok(Self {
            servers,
            client_id,
            sequence: 0,
            leader: 0,
            attempt_timeout: ATTEMPT_TIMEOUT,
            max_rounds: None,
        })
    }

    /// Gives up after `rounds` passes over every server instead of retrying forever.
    pub fn max_rounds(mut self, rounds: usize) -> Self {
        self.max_rounds = Some(rounds);
        self
    }

    pub fn attempt_timeout(mut self, attempt_timeout: Duration) -> Self {
        self.attempt_timeout = attempt_timeout;
        self
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub async fn join(&mut self, servers: BTreeMap<GroupId, Vec<String>>) -> Result<()> {
        self.call(|client_id, sequence| Request::Join {
            client_id,
            sequence,
            servers: servers.clone(),
        })
        .await
        .map(|_| ())
    }

    pub async fn leave(&mut self, group_ids: Vec<GroupId>) -> Result<()> {
        self.call(|client_id, sequence| Request::Leave {
            client_id,
            sequence,
            group_ids: group_ids.clone(),
        })
        .await
        .map(|_| ())
    }

    pub async fn move_shard(&mut self, shard: ShardId, group: GroupId) -> Result<()> {
        self.call(|client_id, sequence| Request::Move {
            client_id,
            sequence,
            shard,
            group,
        })
        .await
        .map(|_| ())
    }

    /// Fetches configuration `version`; `-1` asks for the latest.
    pub async fn query(&mut self, version: i64) -> Result<ShardConfig> {
        let reply = self
            .call(|client_id, sequence| Request::Query {
                client_id,
                sequence,
                version,
            })
            .await?;
        reply
            .config
            .ok_or_else(|| anyhow!("query reply carried no configuration"))
    }

    async fn call<F>(&mut self, build: F) -> Result<Reply>
    where
        F: Fn(ClientId, u64) -> Request,
    {
        self.sequence += 1;
        let request = build(self.client_id, self.sequence);
        let count = self.servers.len();

        let mut round = 0;
        loop {
            for offset in 0..count {
                let target = (self.leader + offset) % count;
                let addr = self.servers[target];
                match timeout(self.attempt_timeout, send_request(addr, &request)).await {
                    Ok(Ok(reply)) if reply.is_ok() => {
                        self.leader = target;
                        return Ok(reply);
                    }
                    Ok(Ok(reply)) if !reply.wrong_leader => bail!("{addr} rejected request: {}", reply.err),
                    Ok(Ok(reply)) => debug!(%addr, err = %reply.err, "replica cannot serve request"),
                    Ok(Err(err)) => debug!(%addr, error = %err, "request failed"),
                    Err(_) => debug!(%addr, "request timed out"),
                }
            }

            round += 1;
            if self.max_rounds.is_some_and(|max| round >= max) {
                bail!(
                    "no replica accepted request (client {}, sequence {}) after {round} rounds",
                    self.client_id,
                    self.sequence
                );
            }
            sleep(RETRY_PAUSE).await;
        }
    }
}

async fn send_request(addr: SocketAddr, request: &Request) -> Result<Reply> {
    let stream = TcpStream::connect(addr).await?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    write_message(&mut writer, request).await?;
    read_message::<_, Reply>(&mut reader)
        .await?
        .ok_or_else(|| anyhow!("{addr} closed the connection without replying"))
}

/// Runs the interactive client: one command per stdin line until EXIT, EOF or ctrl-c.
pub async fn run(args: ClientArgs) -> Result<()> {
    let mut clerk = Clerk::new(args.server)?;
    info!(client_id = clerk.client_id(), "client ready");
    write_stdout(USAGE).await?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();
    loop {
        input.clear();
        select! {
            bytes_read = stdin.read_line(&mut input) => {
                if bytes_read? == 0 {
                    break;
                }
                if !handle_line(&mut clerk, input.trim()).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }
    Ok(())
}

async fn handle_line(clerk: &mut Clerk, line: &str) -> Result<bool> {
    if line.is_empty() {
        return Ok(true);
    }

    let command = match ConsoleCommand::parse(line) {
        Ok(command) => command,
        Err(err) => {
            write_stderr(&format!("!!! {err}")).await?;
            return Ok(true);
        }
    };

    let outcome = match command {
        ConsoleCommand::Exit => return Ok(false),
        ConsoleCommand::Help => Ok(USAGE.to_string()),
        ConsoleCommand::Join { groups } => clerk.join(groups).await.map(|_| "ok".to_string()),
        ConsoleCommand::Leave { group_ids } => {
            clerk.leave(group_ids).await.map(|_| "ok".to_string())
        }
        ConsoleCommand::Move { shard, group } => clerk
            .move_shard(shard, group)
            .await
            .map(|_| "ok".to_string()),
        ConsoleCommand::Query { version } => clerk.query(version).await.map(|config| render(&config)),
    };

    match outcome {
        Ok(text) => write_stdout(&text).await?,
        Err(err) => write_stderr(&format!("!!! {err}")).await?,
    }
    Ok(true)
}

fn render(config: &ShardConfig) -> String {
    let mut text = format!("version {}\nshards  {:?}", config.version, config.shards);
    for (gid, servers) in &config.groups {
        text.push_str(&format!("\ngroup {gid}: {}", servers.join(", ")));
    }
    text
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clerk_requires_servers() {
        assert!(Clerk::new(Vec::new()).is_err());
    }

    #[tokio::test]
    async fn unreachable_servers_exhaust_rounds() {
        // Port 9 (discard) on localhost is closed in test environments.
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let mut clerk = Clerk::with_client_id(vec![addr], 11)
            .unwrap()
            .max_rounds(2)
            .attempt_timeout(Duration::from_millis(200));

        let err = clerk.query(-1).await.unwrap_err();
        assert!(err.to_string().contains("after 2 rounds"), "{err}");
        assert_eq!(clerk.client_id(), 11);
    }

    #[test]
    fn render_lists_shards_and_groups() {
        let mut config = ShardConfig::initial(3);
        config.version = 1;
        config.shards = vec![100, 100, 100];
        config.groups.insert(100, vec!["a:1".to_string(), "b:2".to_string()]);

        let text = render(&config);
        assert!(text.starts_with("version 1"));
        assert!(text.contains("[100, 100, 100]"));
        assert!(text.contains("group 100: a:1, b:2"));
    }
}
