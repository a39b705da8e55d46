//! Client-facing RPC surface.
//!
//! Requests and replies are JSON objects, one per line, over TCP. A connection
//! may carry any number of requests; each gets exactly one reply, in order.
//! The handlers here are thin: they turn a [`Request`] into a controller call
//! and the outcome into a [`Reply`].

use std::collections::BTreeMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use serde::de::{self, DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tracing::{debug, info, warn};

use crate::command::{ClientId, GroupId, ShardId};
use crate::consensus::Consensus;
use crate::controller::ShardController;
use crate::error::ControllerError;
use crate::store::ShardConfig;

const LINE_ENDINGS: &[char] = &['\n', '\r'];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Join {
        client_id: ClientId,
        sequence: u64,
        #[serde(deserialize_with = "group_servers")]
        servers: BTreeMap<GroupId, Vec<String>>,
    },
    Leave {
        client_id: ClientId,
        sequence: u64,
        group_ids: Vec<GroupId>,
    },
    Move {
        client_id: ClientId,
        sequence: u64,
        shard: ShardId,
        group: GroupId,
    },
    Query {
        client_id: ClientId,
        sequence: u64,
        version: i64,
    },
}

/// JSON object keys are strings, and the tagged enum hands them over as such,
/// so group ids are parsed here.
fn group_servers<'de, D>(deserializer: D) -> Result<BTreeMap<GroupId, Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    BTreeMap::<String, Vec<String>>::deserialize(deserializer)?
        .into_iter()
        .map(|(gid, servers)| {
            gid.parse()
                .map(|gid| (gid, servers))
                .map_err(|_| <D::Error as de::Error>::custom(format!("invalid group id '{gid}'")))
        })
        .collect()
}

/// `err` is empty on success. `wrong_leader` tells the client to try another
/// replica; it is also set on timeouts since the leader may have moved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Reply {
    pub wrong_leader: bool,
    #[serde(default)]
    pub err: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ShardConfig>,
}

impl Reply {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn with_config(config: ShardConfig) -> Self {
        Self {
            config: Some(config),
            ..Self::default()
        }
    }

    pub fn from_error(err: &ControllerError) -> Self {
        Self {
            wrong_leader: err.is_retryable(),
            err: err.to_string(),
            config: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        !self.wrong_leader && self.err.is_empty()
    }
}

pub async fn read_message<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = reader.read_line(&mut line).await?;
        if bytes == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.is_empty() {
            continue;
        }

        let parsed = serde_json::from_str(trimmed).map_err(to_io_error)?;
        return Ok(Some(parsed));
    }
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut encoded = serde_json::to_vec(message).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

/// Runs one request against the controller.
pub async fn dispatch<C: Consensus>(controller: &ShardController<C>, request: Request) -> Reply {
    let outcome = match request {
        Request::Join {
            client_id,
            sequence,
            servers,
        } => controller.join(client_id, sequence, servers).await.map(|_| None),
        Request::Leave {
            client_id,
            sequence,
            group_ids,
        } => controller
            .leave(client_id, sequence, group_ids)
            .await
            .map(|_| None),
        Request::Move {
            client_id,
            sequence,
            shard,
            group,
        } => controller
            .move_shard(client_id, sequence, shard, group)
            .await
            .map(|_| None),
        Request::Query {
            client_id,
            sequence,
            version,
        } => controller
            .query(client_id, sequence, version)
            .await
            .map(Some),
    };

    match outcome {
        Ok(None) => Reply::ok(),
        Ok(Some(config)) => Reply::with_config(ShardConfig::clone(&config)),
        Err(err) => Reply::from_error(&err),
    }
}

pub struct RpcServer<C> {
    listener: TcpListener,
    controller: Arc<ShardController<C>>,
}

impl<C: Consensus> RpcServer<C> {
    pub fn new(listener: TcpListener, controller: Arc<ShardController<C>>) -> Self {
        Self {
            listener,
            controller,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `shutdown` resolves, one task per connection.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let RpcServer {
            listener,
            controller,
        } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("rpc server shutting down");
                    break;
                }
                accept_result = listener.accept() => match accept_result {
                    Ok((stream, peer)) => spawn_connection_handler(stream, peer, &controller),
                    Err(err) => warn!(error = ?err, "failed to accept connection"),
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn spawn_connection_handler<C: Consensus>(
    stream: TcpStream,
    peer: SocketAddr,
    controller: &Arc<ShardController<C>>,
) {
    let controller = Arc::clone(controller);
    tokio::spawn(async move {
        if let Err(err) = handle_connection(stream, controller).await {
            warn!(peer = %peer, error = ?err, "rpc connection closed with error");
        }
    });
}

async fn handle_connection<C: Consensus>(
    stream: TcpStream,
    controller: Arc<ShardController<C>>,
) -> Result<()> {
    let peer = stream.peer_addr().ok();
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    loop {
        let reply = match read_message::<_, Request>(&mut reader).await {
            Ok(Some(request)) => {
                debug!(?peer, ?request, "rpc request");
                dispatch(&controller, request).await
            }
            Ok(None) => break,
            // The bad line is consumed; answer it and keep reading.
            Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                warn!(?peer, error = %err, "malformed rpc request");
                Reply {
                    err: format!("malformed request: {err}"),
                    ..Reply::default()
                }
            }
            Err(err) => return Err(err.into()),
        };
        write_message(&mut writer, &reply).await?;
    }

    debug!(?peer, "rpc connection closed");
    Ok(())
}
