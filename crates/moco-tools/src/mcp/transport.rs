//! Transports carrying JSON-RPC between the client and an MCP server.
//!
//! The stdio transport owns two background tasks. A writer task drains an
//! outbound queue so every request line is written whole even if the caller
//! gives up midway. A reader task parses stdout line by line and hands each
//! response to whichever caller is waiting on its id; replies nobody waits
//! for any more (for example after a timeout) are dropped there.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Result, ToolError};
use crate::mcp::protocol::{JsonRpcRequest, JsonRpcResponse};

/// Environment variables passed through to stdio servers.
const INHERITED_ENV: &[&str] = &["PATH", "HOME", "USER", "LANG", "TERM"];

const OUTBOUND_QUEUE: usize = 64;

/// A bidirectional JSON-RPC channel to one MCP server.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request carrying an id and wait for the matching response.
    async fn request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse>;

    /// Send a notification; no response is expected.
    async fn notify(&self, notification: JsonRpcRequest) -> Result<()>;

    /// Tear the channel down. Calling it twice is harmless.
    async fn close(&self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// stdio
// ---------------------------------------------------------------------------

type Pending = Arc<DashMap<u64, oneshot::Sender<JsonRpcResponse>>>;

/// Subprocess transport speaking newline-delimited JSON on stdin/stdout.
pub struct StdioTransport {
    server: String,
    outbound: mpsc::Sender<String>,
    pending: Pending,
    /// Set by the reader task once stdout has closed.
    eof: Arc<AtomicBool>,
    child: Mutex<Option<Child>>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl StdioTransport {
    /// Launch `command args...` with a scrubbed environment plus `env`.
    pub fn spawn(
        server: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<Self> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .env_clear();
        for key in INHERITED_ENV {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }
        cmd.envs(env);

        let mut child = cmd.spawn().map_err(|e| ToolError::Connection {
            server: server.to_owned(),
            reason: format!("failed to spawn `{command}`: {e}"),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| ToolError::Connection {
            server: server.to_owned(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| ToolError::Connection {
            server: server.to_owned(),
            reason: "failed to capture stdout".into(),
        })?;

        let pending: Pending = Arc::new(DashMap::new());
        let (outbound, rx) = mpsc::channel(OUTBOUND_QUEUE);

        let eof = Arc::new(AtomicBool::new(false));
        let writer = tokio::spawn(write_loop(server.to_owned(), stdin, rx));
        let reader = tokio::spawn(read_loop(
            server.to_owned(),
            stdout,
            Arc::clone(&pending),
            Arc::clone(&eof),
        ));

        debug!(server = %server, command, "mcp stdio server spawned");

        Ok(Self {
            server: server.to_owned(),
            outbound,
            pending,
            eof,
            child: Mutex::new(Some(child)),
            tasks: std::sync::Mutex::new(vec![writer, reader]),
            closed: AtomicBool::new(false),
        })
    }

    async fn send_line(&self, message: &JsonRpcRequest) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(self.transport_error("transport is closed"));
        }
        let line = serde_json::to_string(message)?;
        self.outbound
            .send(line)
            .await
            .map_err(|_| self.transport_error("writer task has stopped"))
    }

    fn transport_error(&self, reason: &str) -> ToolError {
        ToolError::Transport {
            server: self.server.clone(),
            reason: reason.to_owned(),
        }
    }
}

/// Removes a pending slot when the waiting call completes or is dropped.
struct PendingGuard<'a> {
    pending: &'a Pending,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse> {
        let id = request
            .id
            .ok_or_else(|| self.transport_error("request without id"))?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };
        if self.eof.load(Ordering::Acquire) {
            return Err(self.transport_error("server has exited"));
        }

        self.send_line(&request).await?;
        rx.await
            .map_err(|_| self.transport_error("server closed stdout before responding"))
    }

    async fn notify(&self, notification: JsonRpcRequest) -> Result<()> {
        self.send_line(&notification).await
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        self.pending.clear();

        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                warn!(server = %self.server, error = %e, "failed to kill mcp server");
            }
        }
        debug!(server = %self.server, "mcp stdio transport closed");
        Ok(())
    }
}

async fn write_loop(
    server: String,
    mut stdin: tokio::process::ChildStdin,
    mut rx: mpsc::Receiver<String>,
) {
    while let Some(mut line) = rx.recv().await {
        line.push('\n');
        let written = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        }
        .await;
        if let Err(e) = written {
            warn!(server = %server, error = %e, "mcp stdin write failed");
            break;
        }
    }
}

async fn read_loop(
    server: String,
    stdout: tokio::process::ChildStdout,
    pending: Pending,
    eof: Arc<AtomicBool>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<JsonRpcResponse>(trimmed) {
                    Ok(response) => match response.numeric_id() {
                        Some(id) => match pending.remove(&id) {
                            Some((_, waiter)) => {
                                let _ = waiter.send(response);
                            }
                            None => debug!(server = %server, id, "dropping unclaimed mcp response"),
                        },
                        None => debug!(server = %server, "ignoring mcp message without numeric id"),
                    },
                    Err(e) => debug!(server = %server, error = %e, "ignoring non-json-rpc line"),
                }
            }
            Ok(None) => {
                debug!(server = %server, "mcp server closed stdout");
                break;
            }
            Err(e) => {
                warn!(server = %server, error = %e, "mcp stdout read failed");
                break;
            }
        }
    }
    eof.store(true, Ordering::Release);
    // Dropping the senders wakes every waiter with an error.
    pending.clear();
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

/// Network transport that POSTs each JSON-RPC message to a fixed URL.
pub struct HttpTransport {
    server: String,
    url: url::Url,
    http: reqwest::Client,
}

impl HttpTransport {
    pub fn new(server: &str, url: &str) -> Result<Self> {
        let url = url::Url::parse(url).map_err(|e| ToolError::Connection {
            server: server.to_owned(),
            reason: format!("invalid url `{url}`: {e}"),
        })?;
        Ok(Self {
            server: server.to_owned(),
            url,
            http: reqwest::Client::new(),
        })
    }

    fn transport_error(&self, err: impl std::fmt::Display) -> ToolError {
        ToolError::Transport {
            server: self.server.clone(),
            reason: err.to_string(),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse> {
        let response = self
            .http
            .post(self.url.clone())
            .json(&request)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| self.transport_error(e))?;

        response
            .json::<JsonRpcResponse>()
            .await
            .map_err(|e| ToolError::Protocol {
                server: self.server.clone(),
                reason: format!("invalid json-rpc response: {e}"),
            })
    }

    async fn notify(&self, notification: JsonRpcRequest) -> Result<()> {
        self.http
            .post(self.url.clone())
            .json(&notification)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| self.transport_error(e))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
