//! Session manager
//!
//! One live MCP client session per connected external server:
//! - STDIO spawns a child process and speaks newline-delimited JSON-RPC over
//!   its pipes (one server, one subprocess)
//! - SSE/HTTP open a streaming connection and POST JSON-RPC requests
//!
//! Each session owns a driver task fed by a bounded request channel; a full
//! channel surfaces as `Busy` without blocking peers. Disconnect drains
//! in-flight requests up to the drain timeout, after which the remaining ones
//! fail as `Drained`. Handshake failures run the compensating teardown so a
//! dead child process never outlives its session.

use crate::config::AggregatorSection;
use crate::core::{ExternalServer, TransportKind};
use crate::protocol::{
    parse_prompt_listing, parse_resource_listing, parse_tool_listing, RemoteListing, RpcRequest,
    RpcResponse, PROTOCOL_VERSION,
};
use parking_lot::RwLock;
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session request queue is full")]
    Busy,

    #[error("Session is draining; request aborted")]
    Drained,

    #[error("No live session for server {0}")]
    NotConnected(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Backend error: {0}")]
    Backend(JsonValue),
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Lifecycle of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionState {
    Initializing,
    Ready,
    Draining,
    Closed,
    Failed,
}

struct SessionRequest {
    request: RpcRequest,
    /// None for notifications.
    respond: Option<oneshot::Sender<Result<JsonValue>>>,
}

/// Handle to one live session
pub struct SessionHandle {
    pub server_id: Uuid,
    pub server_name: String,
    state: RwLock<SessionState>,
    tx: mpsc::Sender<SessionRequest>,
    cancel: CancellationToken,
    inflight: AtomicUsize,
    next_id: AtomicU64,
}

impl SessionHandle {
    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }

    fn set_state(&self, state: SessionState) {
        *self.state.write() = state;
    }

    /// Send one JSON-RPC request and await its response.
    pub async fn request(
        &self,
        method: &str,
        params: Option<JsonValue>,
        timeout: Duration,
    ) -> Result<JsonValue> {
        match self.state() {
            SessionState::Initializing | SessionState::Ready => {}
            SessionState::Draining => return Err(SessionError::Drained),
            SessionState::Closed | SessionState::Failed => {
                return Err(SessionError::NotConnected(self.server_name.clone()))
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest::new(id, method, params);
        let (respond_tx, respond_rx) = oneshot::channel();

        // Bounded queue: a full channel rejects immediately, peers unaffected.
        match self.tx.try_send(SessionRequest {
            request,
            respond: Some(respond_tx),
        }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => return Err(SessionError::Busy),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                return Err(SessionError::NotConnected(self.server_name.clone()))
            }
        }

        self.inflight.fetch_add(1, Ordering::AcqRel);
        let outcome = tokio::time::timeout(timeout, respond_rx).await;
        self.inflight.fetch_sub(1, Ordering::AcqRel);

        match outcome {
            Err(_) => Err(SessionError::Timeout(timeout)),
            // Driver dropped the pending response: the session went away
            // underneath us.
            Ok(Err(_)) => Err(SessionError::Drained),
            Ok(Ok(result)) => result,
        }
    }

    /// Fire-and-forget notification.
    pub fn notify(&self, method: &str, params: Option<JsonValue>) {
        let _ = self.tx.try_send(SessionRequest {
            request: RpcRequest::notification(method, params),
            respond: None,
        });
    }

    /// Stop accepting new requests; in-flight ones may still finish.
    pub fn begin_drain(&self) {
        self.set_state(SessionState::Draining);
    }

    /// Wait until in-flight requests finish or the timeout passes.
    pub async fn await_drained(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.inflight() > 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        true
    }

    /// Tear down the driver and release the transport.
    pub fn close(&self, failed: bool) {
        self.set_state(if failed {
            SessionState::Failed
        } else {
            SessionState::Closed
        });
        self.cancel.cancel();
    }
}

/// Owns every live session
pub struct SessionManager {
    sessions: RwLock<HashMap<Uuid, Arc<SessionHandle>>>,
    http: reqwest::Client,
    config: AggregatorSection,
}

impl SessionManager {
    pub fn new(config: AggregatorSection) -> Self {
        SessionManager {
            sessions: RwLock::new(HashMap::new()),
            http: reqwest::Client::new(),
            config,
        }
    }

    pub fn get(&self, server_id: Uuid) -> Option<Arc<SessionHandle>> {
        self.sessions.read().get(&server_id).cloned()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.config.request_timeout_s)
    }

    pub fn degraded_timeout(&self) -> Duration {
        Duration::from_secs(self.config.degraded_timeout_s)
    }

    /// Connect to a server: build the transport, run the MCP handshake and
    /// discovery inside the connection timeout. On any failure the
    /// compensating teardown releases transport resources before returning.
    pub async fn connect(
        &self,
        server: &ExternalServer,
    ) -> Result<(Arc<SessionHandle>, RemoteListing)> {
        info!(server = %server.name, transport = %server.transport, "connecting session");

        // Reconnecting replaces any previous session for this server.
        if self.get(server.id).is_some() {
            let _ = self.disconnect(server.id).await;
        }

        let handle = self.spawn_driver(server).await?;

        let connect_timeout = Duration::from_secs(self.config.connection_timeout_s);
        let handshake = tokio::time::timeout(connect_timeout, self.handshake(&handle)).await;

        let listing = match handshake {
            Ok(Ok(listing)) => listing,
            Ok(Err(e)) => {
                // Compensating exit: the transport (child process included)
                // must not outlive a failed handshake.
                handle.close(true);
                return Err(e);
            }
            Err(_) => {
                handle.close(true);
                return Err(SessionError::Handshake(format!(
                    "handshake timed out after {connect_timeout:?}"
                )));
            }
        };

        handle.set_state(SessionState::Ready);
        self.sessions
            .write()
            .insert(server.id, Arc::clone(&handle));

        info!(
            server = %server.name,
            tools = listing.tools.len(),
            prompts = listing.prompts.len(),
            resources = listing.resources.len(),
            "session ready"
        );
        Ok((handle, listing))
    }

    /// Drain and close a live session. In-flight requests get the drain
    /// window; whatever is still pending afterwards fails as drained.
    pub async fn disconnect(&self, server_id: Uuid) -> Result<()> {
        let handle = self
            .sessions
            .write()
            .remove(&server_id)
            .ok_or_else(|| SessionError::NotConnected(server_id.to_string()))?;

        handle.begin_drain();
        let drain_timeout = Duration::from_secs(self.config.drain_timeout_s);
        if !handle.await_drained(drain_timeout).await {
            warn!(
                server = %handle.server_name,
                inflight = handle.inflight(),
                "drain timeout; aborting in-flight requests"
            );
        }
        handle.close(false);
        info!(server = %handle.server_name, "session closed");
        Ok(())
    }

    /// Close everything (shutdown path).
    pub async fn disconnect_all(&self) {
        let ids: Vec<Uuid> = self.sessions.read().keys().copied().collect();
        for id in ids {
            let _ = self.disconnect(id).await;
        }
    }

    /// Lightweight liveness probe on the session.
    pub async fn ping(&self, server_id: Uuid, timeout: Duration) -> Result<()> {
        let handle = self
            .get(server_id)
            .ok_or_else(|| SessionError::NotConnected(server_id.to_string()))?;
        handle.request("ping", None, timeout).await.map(|_| ())
    }

    async fn handshake(&self, handle: &SessionHandle) -> Result<RemoteListing> {
        let init = handle
            .request(
                "initialize",
                Some(json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {"tools": {}, "prompts": {}, "resources": {}},
                    "clientInfo": {
                        "name": "mcphub",
                        "version": env!("CARGO_PKG_VERSION"),
                    }
                })),
                Duration::from_secs(self.config.connection_timeout_s),
            )
            .await?;
        debug!(server = %handle.server_name, result = %init, "initialize succeeded");

        handle.notify("notifications/initialized", None);

        // Discovery: a backend without prompts/resources is not an error.
        let timeout = self.request_timeout();
        let tools = match handle.request("tools/list", None, timeout).await {
            Ok(result) => parse_tool_listing(&result),
            Err(e) => return Err(SessionError::Handshake(format!("tools/list failed: {e}"))),
        };
        let prompts = match handle.request("prompts/list", None, timeout).await {
            Ok(result) => parse_prompt_listing(&result),
            Err(_) => Vec::new(),
        };
        let resources = match handle.request("resources/list", None, timeout).await {
            Ok(result) => parse_resource_listing(&result),
            Err(_) => Vec::new(),
        };

        Ok(RemoteListing {
            tools,
            prompts,
            resources,
        })
    }

    async fn spawn_driver(&self, server: &ExternalServer) -> Result<Arc<SessionHandle>> {
        let (tx, rx) = mpsc::channel(self.config.session_queue_depth);
        let cancel = CancellationToken::new();

        let handle = Arc::new(SessionHandle {
            server_id: server.id,
            server_name: server.name.clone(),
            state: RwLock::new(SessionState::Initializing),
            tx,
            cancel: cancel.clone(),
            inflight: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
        });

        match server.transport {
            TransportKind::Stdio => {
                spawn_stdio_driver(server, rx, cancel)?;
            }
            TransportKind::Sse | TransportKind::Http => {
                let url = server
                    .config
                    .url
                    .clone()
                    .ok_or_else(|| SessionError::Transport("missing url".to_string()))?;
                spawn_http_driver(
                    self.http.clone(),
                    server.name.clone(),
                    url,
                    server.config.headers.clone(),
                    server.transport,
                    rx,
                    cancel,
                );
            }
        }

        Ok(handle)
    }

    /// States of every live session, for the aggregator REST surface.
    pub fn snapshot(&self) -> HashMap<Uuid, (SessionState, usize)> {
        self.sessions
            .read()
            .iter()
            .map(|(id, handle)| (*id, (handle.state(), handle.inflight())))
            .collect()
    }
}

// ----------------------------------------------------------------------
// STDIO driver
// ----------------------------------------------------------------------

fn spawn_stdio_driver(
    server: &ExternalServer,
    mut rx: mpsc::Receiver<SessionRequest>,
    cancel: CancellationToken,
) -> Result<()> {
    let command = server
        .config
        .command
        .clone()
        .ok_or_else(|| SessionError::Transport("missing command".to_string()))?;

    debug!(server = %server.name, command = %command, "spawning stdio child");

    let mut child = Command::new(&command)
        .args(&server.config.args)
        .envs(&server.config.env)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| SessionError::Transport(format!("failed to spawn: {e}")))?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| SessionError::Transport("failed to open stdin".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| SessionError::Transport("failed to open stdout".to_string()))?;

    let (response_tx, mut response_rx) = mpsc::unbounded_channel::<RpcResponse>();

    // Reader task: one JSON-RPC message per line.
    let reader_name = server.name.clone();
    tokio::spawn(async move {
        let reader = BufReader::new(stdout);
        let mut lines = reader.lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RpcResponse>(&line) {
                Ok(response) => {
                    if response_tx.send(response).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(server = %reader_name, error = %e, "unparseable line from backend");
                }
            }
        }
        debug!(server = %reader_name, "stdout reader finished");
    });

    // Driver task: writes requests, correlates responses, honors cancel.
    let driver_name = server.name.clone();
    tokio::spawn(async move {
        let mut pending: HashMap<u64, oneshot::Sender<Result<JsonValue>>> = HashMap::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                message = rx.recv() => {
                    let Some(message) = message else { break };
                    let line = match serde_json::to_string(&message.request) {
                        Ok(json) => json,
                        Err(e) => {
                            if let Some(respond) = message.respond {
                                let _ = respond.send(Err(SessionError::Transport(
                                    format!("serialize failed: {e}"),
                                )));
                            }
                            continue;
                        }
                    };

                    if let Err(e) = write_line(&mut stdin, &line).await {
                        if let Some(respond) = message.respond {
                            let _ = respond.send(Err(SessionError::Transport(e)));
                        }
                        break;
                    }

                    if let (Some(respond), Some(id)) = (
                        message.respond,
                        message.request.id.as_ref().and_then(request_id_as_u64),
                    ) {
                        pending.insert(id, respond);
                    }
                }
                response = response_rx.recv() => {
                    let Some(response) = response else { break };
                    let Some(id) = request_id_as_u64(&response.id) else {
                        debug!(server = %driver_name, "notification from backend ignored");
                        continue;
                    };
                    if let Some(respond) = pending.remove(&id) {
                        let _ = respond.send(response_to_result(response));
                    }
                }
            }
        }

        // Dropping `pending` fails every in-flight request as drained.
        drop(pending);
        if let Err(e) = child.kill().await {
            debug!(server = %driver_name, error = %e, "child already gone");
        }
        debug!(server = %driver_name, "stdio driver finished");
    });

    Ok(())
}

async fn write_line(
    stdin: &mut tokio::process::ChildStdin,
    line: &str,
) -> std::result::Result<(), String> {
    stdin
        .write_all(line.as_bytes())
        .await
        .map_err(|e| format!("stdin write failed: {e}"))?;
    stdin
        .write_all(b"\n")
        .await
        .map_err(|e| format!("stdin write failed: {e}"))?;
    stdin
        .flush()
        .await
        .map_err(|e| format!("stdin flush failed: {e}"))?;
    Ok(())
}

// ----------------------------------------------------------------------
// HTTP / SSE driver
// ----------------------------------------------------------------------

/// Driver for streamable HTTP and SSE backends. Requests are POSTed in
/// submission order; SSE additionally validates the event stream on connect.
fn spawn_http_driver(
    client: reqwest::Client,
    server_name: String,
    url: String,
    headers: HashMap<String, String>,
    transport: TransportKind,
    mut rx: mpsc::Receiver<SessionRequest>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        if transport == TransportKind::Sse {
            // Open the event stream once to validate connectivity; the
            // request path below stays POST-based.
            let mut probe = client.get(&url).header("Accept", "text/event-stream");
            for (k, v) in &headers {
                probe = probe.header(k.as_str(), v.as_str());
            }
            match probe.send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(server = %server_name, "sse stream opened");
                }
                Ok(response) => {
                    warn!(server = %server_name, status = %response.status(),
                        "sse stream rejected");
                }
                Err(e) => {
                    warn!(server = %server_name, error = %e, "sse stream failed");
                }
            }
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                message = rx.recv() => {
                    let Some(message) = message else { break };

                    let mut request = client
                        .post(&url)
                        .header("Accept", "application/json, text/event-stream")
                        .json(&message.request);
                    for (k, v) in &headers {
                        request = request.header(k.as_str(), v.as_str());
                    }

                    let outcome = match request.send().await {
                        Ok(response) if response.status().is_success() => {
                            match response.json::<RpcResponse>().await {
                                Ok(rpc) => response_to_result(rpc),
                                Err(e) => Err(SessionError::Transport(format!(
                                    "malformed response: {e}"
                                ))),
                            }
                        }
                        Ok(response) => Err(SessionError::Transport(format!(
                            "HTTP {} from backend",
                            response.status()
                        ))),
                        Err(e) => Err(SessionError::Transport(e.to_string())),
                    };

                    if let Some(respond) = message.respond {
                        let _ = respond.send(outcome);
                    }
                }
            }
        }
        debug!(server = %server_name, "http driver finished");
    });
}

fn request_id_as_u64(id: &JsonValue) -> Option<u64> {
    id.as_u64().or_else(|| id.as_str()?.parse().ok())
}

fn response_to_result(response: RpcResponse) -> Result<JsonValue> {
    if let Some(err) = response.error {
        return Err(SessionError::Backend(
            serde_json::to_value(err).unwrap_or(JsonValue::Null),
        ));
    }
    match response.result {
        Some(result) => Ok(result),
        None => {
            error!("response carried neither result nor error");
            Err(SessionError::Transport(
                "response carried neither result nor error".to_string(),
            ))
        }
    }
}
