//! Typed client for the hierarchical configuration tree.
//!
//! The tree itself lives in a separate daemon; this module only speaks its
//! wire protocol (newline-framed JSON over a Unix stream socket, the same
//! shape used throughout this codebase) and exposes typed read/write/watch
//! operations to the rest of the control plane.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, Mutex};

pub const DEFAULT_PATH: &str = "/var/run/apctld-config.sock";
pub const ENV_VAR: &str = "APCTLD_CONFIG_SOCKET";

#[derive(Debug, Error)]
pub enum Error {
    #[error("config service not running at {0}")]
    ServiceNotRunning(PathBuf),
    #[error("error connecting to config socket at {socket_path}: {error}")]
    Connect { socket_path: PathBuf, error: std::io::Error },
    #[error("error writing to config socket: {0}")]
    Write(std::io::Error),
    #[error("error reading from config socket: {0}")]
    Read(std::io::Error),
    #[error("failed (de)serializing config message: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid watch pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
    #[error("config connection closed")]
    ConnectionClosed,
    #[error("no such property: {0}")]
    NoSuchProperty(String),
}

/// Path within the tree, rooted at `@/`; components never contain `/`.
pub type ConfigPath = Vec<String>;

pub fn path_to_string(path: &[String]) -> String {
    format!("@/{}", path.join("/"))
}

/// A single write in a transactional [`ConfigClient::execute`] batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Op {
    Create { path: ConfigPath, value: Value },
    Set { path: ConfigPath, value: Value },
    Delete { path: ConfigPath },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Request {
    Read { id: u64, path: ConfigPath },
    Create { id: u64, path: ConfigPath, value: Value },
    Set { id: u64, path: ConfigPath, value: Value },
    Delete { id: u64, path: ConfigPath },
    Execute { id: u64, ops: Vec<Op> },
    Watch { id: u64, kind: WatchKind, pattern: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchKind {
    Changed,
    Deleted,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Response {
    Read { id: u64, result: PropertyResult },
    Ack { id: u64 },
    Err { id: u64, message: String },
    Notify(WatchEvent),
}

/// A property read result; tree properties may legitimately be absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PropertyResult {
    Present(Value),
    Missing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchEvent {
    pub kind: WatchKind,
    pub path: ConfigPath,
    pub value: Option<Value>,
    pub expiration: Option<u64>,
}

#[async_trait::async_trait]
pub trait ConfigClient: Send + Sync {
    async fn read(&self, path: &[String]) -> Result<PropertyResult, Error>;
    async fn create(&self, path: &[String], value: Value) -> Result<(), Error>;
    async fn set(&self, path: &[String], value: Value) -> Result<(), Error>;
    async fn delete(&self, path: &[String]) -> Result<(), Error>;
    async fn execute(&self, ops: Vec<Op>) -> Result<(), Error>;
    async fn watch(&self, kind: WatchKind, pattern: &str) -> Result<mpsc::Receiver<WatchEvent>, Error>;
}

struct Watcher {
    regex: Regex,
    kind: WatchKind,
    sender: mpsc::Sender<WatchEvent>,
}

struct Shared {
    writer: Mutex<tokio::net::unix::OwnedWriteHalf>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Response>>>,
    watchers: Mutex<Vec<Watcher>>,
    next_id: AtomicU64,
}

/// Production [`ConfigClient`] backed by a single persistent connection to
/// the config daemon. A background task demultiplexes request/response pairs
/// (matched by id, via a pending table) from unsolicited watch notifications
/// (matched by regex against each registered watcher).
pub struct RemoteConfigClient {
    shared: Arc<Shared>,
}

impl RemoteConfigClient {
    pub async fn connect(socket_path: &Path) -> Result<Self, Error> {
        match socket_path.try_exists() {
            Ok(true) => {}
            Ok(false) => return Err(Error::ServiceNotRunning(socket_path.to_path_buf())),
            Err(error) => {
                return Err(Error::Connect {
                    socket_path: socket_path.to_path_buf(),
                    error,
                });
            }
        }
        let stream = Self::connect_with_retry(socket_path).await?;
        let (read_half, write_half) = stream.into_split();
        let shared = Arc::new(Shared {
            writer: Mutex::new(write_half),
            pending: Mutex::new(HashMap::new()),
            watchers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        });

        let reader_shared = shared.clone();
        tokio::spawn(async move {
            reader_loop(reader_shared, read_half).await;
        });

        Ok(Self { shared })
    }

    /// Connects with a short exponential backoff: the config daemon may
    /// still be finishing its own startup (socket created, not yet
    /// accepting) right as this process comes up.
    async fn connect_with_retry(socket_path: &Path) -> Result<UnixStream, Error> {
        let policy = backoff::ExponentialBackoffBuilder::new()
            .with_max_elapsed_time(Some(std::time::Duration::from_secs(5)))
            .build();
        backoff::future::retry(policy, || async {
            UnixStream::connect(socket_path).await.map_err(|error| {
                let err = Error::Connect {
                    socket_path: socket_path.to_path_buf(),
                    error,
                };
                if matches!(err, Error::Connect { ref error, .. } if error.kind() == std::io::ErrorKind::ConnectionRefused) {
                    backoff::Error::transient(err)
                } else {
                    backoff::Error::permanent(err)
                }
            })
        })
        .await
    }

    fn next_id(&self) -> u64 {
        self.shared.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn send_request(&self, req: Request, id: u64) -> Result<Response, Error> {
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().await.insert(id, tx);

        let mut json = serde_json::to_string(&req)?;
        json.push('\n');
        {
            let mut writer = self.shared.writer.lock().await;
            writer.write_all(json.as_bytes()).await.map_err(Error::Write)?;
        }

        rx.await.map_err(|_| Error::ConnectionClosed)
    }
}

async fn reader_loop(shared: Arc<Shared>, read_half: tokio::net::unix::OwnedReadHalf) {
    let mut lines = BufReader::new(read_half).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let resp: Response = match serde_json::from_str(&line) {
                    Ok(r) => r,
                    Err(error) => {
                        tracing::warn!(%error, "malformed config daemon message");
                        continue;
                    }
                };
                dispatch(&shared, resp).await;
            }
            Ok(None) => break,
            Err(error) => {
                tracing::warn!(%error, "config socket read error");
                break;
            }
        }
    }
    fail_all_pending(&shared).await;
}

async fn dispatch(shared: &Arc<Shared>, resp: Response) {
    match &resp {
        Response::Notify(event) => {
            let watchers = shared.watchers.lock().await;
            for w in watchers.iter() {
                if w.kind == event.kind && w.regex.is_match(&path_to_string(&event.path)) {
                    let _ = w.sender.try_send(event.clone());
                }
            }
        }
        Response::Read { id, .. } | Response::Ack { id } | Response::Err { id, .. } => {
            if let Some(tx) = shared.pending.lock().await.remove(id) {
                let _ = tx.send(resp);
            }
        }
    }
}

async fn fail_all_pending(shared: &Arc<Shared>) {
    let mut pending = shared.pending.lock().await;
    for (_, tx) in pending.drain() {
        let _ = tx.send(Response::Err {
            id: 0,
            message: "connection closed".to_string(),
        });
    }
}

fn ack_or_err(resp: Response) -> Result<(), Error> {
    match resp {
        Response::Ack { .. } => Ok(()),
        Response::Err { message, .. } => Err(Error::NoSuchProperty(message)),
        _ => Err(Error::ConnectionClosed),
    }
}

#[async_trait::async_trait]
impl ConfigClient for RemoteConfigClient {
    async fn read(&self, path: &[String]) -> Result<PropertyResult, Error> {
        let id = self.next_id();
        let resp = self.send_request(Request::Read { id, path: path.to_vec() }, id).await?;
        match resp {
            Response::Read { result, .. } => Ok(result),
            Response::Err { message, .. } => Err(Error::NoSuchProperty(message)),
            _ => Err(Error::ConnectionClosed),
        }
    }

    async fn create(&self, path: &[String], value: Value) -> Result<(), Error> {
        let id = self.next_id();
        let resp = self
            .send_request(Request::Create { id, path: path.to_vec(), value }, id)
            .await?;
        ack_or_err(resp)
    }

    async fn set(&self, path: &[String], value: Value) -> Result<(), Error> {
        let id = self.next_id();
        let resp = self
            .send_request(Request::Set { id, path: path.to_vec(), value }, id)
            .await?;
        ack_or_err(resp)
    }

    async fn delete(&self, path: &[String]) -> Result<(), Error> {
        let id = self.next_id();
        let resp = self.send_request(Request::Delete { id, path: path.to_vec() }, id).await?;
        ack_or_err(resp)
    }

    async fn execute(&self, ops: Vec<Op>) -> Result<(), Error> {
        let id = self.next_id();
        let resp = self.send_request(Request::Execute { id, ops }, id).await?;
        ack_or_err(resp)
    }

    async fn watch(&self, kind: WatchKind, pattern: &str) -> Result<mpsc::Receiver<WatchEvent>, Error> {
        let regex = Regex::new(pattern)?;
        let (tx, rx) = mpsc::channel(64);
        self.shared.watchers.lock().await.push(Watcher {
            regex,
            kind,
            sender: tx,
        });

        let id = self.next_id();
        let resp = self
            .send_request(
                Request::Watch {
                    id,
                    kind,
                    pattern: pattern.to_string(),
                },
                id,
            )
            .await?;
        ack_or_err(resp)?;
        Ok(rx)
    }
}
