//! Health monitoring for external servers
//!
//! One loop per server. Each tick either pings the live MCP session or GETs
//! the configured health-check URL. A single failure from a healthy state
//! degrades the server; hitting the failure threshold marks it ERROR; any
//! success resets to CONNECTED. Every transition is persisted and emitted to
//! observers.

use crate::config::AggregatorSection;
use crate::core::{ExternalServer, ServerStatus};
use crate::store::relational::RegistryStore;
use super::session::SessionManager;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Observer notification for a status transition
#[derive(Debug, Clone, Serialize)]
pub struct HealthEvent {
    pub server_id: Uuid,
    pub server_name: String,
    pub status: ServerStatus,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Everything one health loop needs, detached from the monitor itself.
#[derive(Clone)]
struct LoopContext {
    db: Arc<RegistryStore>,
    sessions: Arc<SessionManager>,
    http: reqwest::Client,
    config: AggregatorSection,
    events: broadcast::Sender<HealthEvent>,
}

/// Per-server health loops
pub struct HealthMonitor {
    context: LoopContext,
    loops: RwLock<HashMap<Uuid, CancellationToken>>,
}

impl HealthMonitor {
    pub fn new(
        db: Arc<RegistryStore>,
        sessions: Arc<SessionManager>,
        config: AggregatorSection,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        HealthMonitor {
            context: LoopContext {
                db,
                sessions,
                http: reqwest::Client::new(),
                config,
                events,
            },
            loops: RwLock::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.context.events.subscribe()
    }

    /// Start (or restart) the health loop for a server.
    pub fn start(&self, server: &ExternalServer, parent: &CancellationToken) {
        self.stop(server.id);

        let cancel = parent.child_token();
        self.loops.write().insert(server.id, cancel.clone());

        let context = self.context.clone();
        let server = server.clone();
        tokio::spawn(async move {
            context.run_loop(server, cancel).await;
        });
    }

    pub fn stop(&self, server_id: Uuid) {
        if let Some(token) = self.loops.write().remove(&server_id) {
            token.cancel();
        }
    }
}

impl LoopContext {
    async fn run_loop(&self, server: ExternalServer, cancel: CancellationToken) {
        let period = Duration::from_secs(self.config.health_interval_s);
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so a fresh connection is
        // not probed at once.
        interval.tick().await;

        let mut consecutive_failures: u32 = 0;
        let mut status = ServerStatus::Connected;

        info!(server = %server.name, period_s = period.as_secs(), "health loop started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let outcome = self.probe(&server).await;
            let previous = status;
            let mut last_error = None;
            match outcome {
                Ok(()) => {
                    consecutive_failures = 0;
                    status = ServerStatus::Connected;
                }
                Err(error) => {
                    consecutive_failures += 1;
                    status = if consecutive_failures >= self.config.health_failure_threshold {
                        ServerStatus::Error
                    } else {
                        ServerStatus::Degraded
                    };
                    warn!(
                        server = %server.name,
                        failures = consecutive_failures,
                        error = %error,
                        "health probe failed"
                    );
                    last_error = Some(error);
                }
            }

            if let Err(e) = self.db.touch_server_health(server.id, status).await {
                warn!(server = %server.name, error = %e, "failed to persist health state");
            }

            if status != previous {
                info!(server = %server.name, from = %previous, to = %status,
                    "server health transition");
                let _ = self.events.send(HealthEvent {
                    server_id: server.id,
                    server_name: server.name.clone(),
                    status,
                    consecutive_failures,
                    error: last_error,
                });
            } else {
                debug!(server = %server.name, status = %status, "health probe done");
            }
        }
        info!(server = %server.name, "health loop stopped");
    }

    async fn probe(&self, server: &ExternalServer) -> std::result::Result<(), String> {
        let timeout = Duration::from_secs(self.config.health_timeout_s);

        if let Some(url) = &server.health_check_url {
            let response = tokio::time::timeout(timeout, self.http.get(url).send())
                .await
                .map_err(|_| format!("health check timed out after {timeout:?}"))?
                .map_err(|e| e.to_string())?;
            if response.status().is_success() {
                Ok(())
            } else {
                Err(format!("health check returned HTTP {}", response.status()))
            }
        } else {
            self.sessions
                .ping(server.id, timeout)
                .await
                .map_err(|e| e.to_string())
        }
    }
}
