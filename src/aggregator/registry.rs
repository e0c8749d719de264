//! External server registry
//!
//! Persists server records and orchestrates their lifecycle:
//! register -> connect (handshake + discovery + health loop) ->
//! disconnect (drain) -> remove (atomic cascade).
//!
//! Removal order guarantees no orphans: live session torn down first, then
//! owned records deleted with exact counts, then vector points, then caches,
//! then the server row itself.

use crate::core::{ExternalServer, ServerSpec, ServerStatus};
use crate::progress::ProgressService;
use crate::protocol::RemoteListing;
use crate::store::cache::LayerCache;
use crate::store::relational::{RegistryStore, StoreError};
use crate::store::vector::VectorIndex;
use crate::sync::{SyncError, SyncPipeline};
use super::health::HealthMonitor;
use super::session::{SessionError, SessionManager, SessionState};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum AggregatorError {
    #[error("Server not found: {0}")]
    NotFound(String),

    #[error("Server already registered: {0}")]
    AlreadyRegistered(String),

    #[error("Invalid server spec: {0}")]
    Invalid(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Sync(#[from] SyncError),
}

pub type Result<T> = std::result::Result<T, AggregatorError>;

/// Persisted record plus live session state
#[derive(Debug, Clone, Serialize)]
pub struct ServerView {
    #[serde(flatten)]
    pub server: ExternalServer,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_state: Option<SessionState>,
    pub inflight_requests: usize,
}

/// Counts returned by an atomic removal
#[derive(Debug, Clone, Serialize)]
pub struct RemovalReport {
    pub removed_tools: usize,
    pub removed_prompts: usize,
    pub removed_resources: usize,
    pub removed_vector_points: u64,
}

/// Server lifecycle orchestrator
pub struct ServerRegistry {
    db: Arc<RegistryStore>,
    vectors: VectorIndex,
    cache: Arc<LayerCache>,
    sessions: Arc<SessionManager>,
    sync: Arc<SyncPipeline>,
    health: Arc<HealthMonitor>,
    progress: Arc<ProgressService>,
    shutdown: CancellationToken,
}

impl ServerRegistry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<RegistryStore>,
        vectors: VectorIndex,
        cache: Arc<LayerCache>,
        sessions: Arc<SessionManager>,
        sync: Arc<SyncPipeline>,
        health: Arc<HealthMonitor>,
        progress: Arc<ProgressService>,
        shutdown: CancellationToken,
    ) -> Self {
        ServerRegistry {
            db,
            vectors,
            cache,
            sessions,
            sync,
            health,
            progress,
            shutdown,
        }
    }

    /// Persist a new server record (status REGISTERED, not yet connected).
    pub async fn register(&self, spec: ServerSpec) -> Result<ExternalServer> {
        spec.validate()
            .map_err(|e| AggregatorError::Invalid(e.to_string()))?;

        let scope = spec.scope.normalized();
        let server = ExternalServer {
            id: Uuid::new_v4(),
            name: spec.name,
            transport: spec.transport,
            config: spec.config,
            health_check_url: spec.health_check_url,
            status: ServerStatus::Registered,
            last_error: None,
            tool_count: 0,
            registered_at: Utc::now(),
            connected_at: None,
            last_health_check: None,
            org_id: scope.org_id,
            is_global: scope.is_global,
        };

        self.db.insert_server(&server).await.map_err(|e| match e {
            StoreError::Conflict(_) => AggregatorError::AlreadyRegistered(server.name.clone()),
            other => AggregatorError::Store(other),
        })?;

        info!(server = %server.name, id = %server.id, "server registered");
        Ok(server)
    }

    /// Connect: handshake, discovery sync, health loop. Failures persist the
    /// ERROR status with the cause.
    pub async fn connect(&self, id: Uuid) -> Result<ExternalServer> {
        let server = self.require(id).await?;
        let operation = self.progress.start("server_connect", None);

        self.db
            .update_server_status(id, ServerStatus::Connecting, None)
            .await?;
        let _ = self
            .progress
            .update(operation.id, 10.0, &format!("connecting to {}", server.name));

        let listing: RemoteListing = match self.sessions.connect(&server).await {
            Ok((_, listing)) => listing,
            Err(e) => {
                let message = e.to_string();
                self.db
                    .update_server_status(id, ServerStatus::Error, Some(&message))
                    .await?;
                let _ = self.progress.fail(operation.id, &message);
                return Err(AggregatorError::Session(e));
            }
        };

        self.db
            .update_server_status(id, ServerStatus::Connected, None)
            .await?;
        let _ = self
            .progress
            .update(operation.id, 60.0, "handshake complete, syncing capabilities");

        // Discovery feeds the shared catalog.
        let report = self.sync.sync_external(&server, &listing).await?;

        self.health.start(&server, &self.shutdown);
        let _ = self.progress.complete(
            operation.id,
            serde_json::to_value(&report).ok(),
        );

        self.require(id).await
    }

    /// Drain and close the session. Records stay; the server is just flagged
    /// unavailable for routing.
    pub async fn disconnect(&self, id: Uuid) -> Result<ExternalServer> {
        let server = self.require(id).await?;

        self.health.stop(id);
        if let Err(e) = self.sessions.disconnect(id).await {
            warn!(server = %server.name, error = %e, "no live session to close");
        }
        self.db
            .update_server_status(id, ServerStatus::Disconnected, None)
            .await?;

        self.require(id).await
    }

    /// Hard removal cascading to everything the server owns.
    pub async fn remove(&self, id: Uuid) -> Result<RemovalReport> {
        let server = self.require(id).await?;

        // 1. Live session goes first.
        self.health.stop(id);
        if self.sessions.get(id).is_some() {
            let _ = self.sessions.disconnect(id).await;
        }

        // 2. Owned records, atomically counted.
        let tool_ids = self.db.delete_tools_by_server(id).await?;
        let prompt_ids = self.db.delete_prompts_by_server(id).await?;
        let resource_ids = self.db.delete_resources_by_server(id).await?;

        // 3. Vector points by payload filter.
        let removed_points = match self.vectors.delete_server_points(&id.to_string()).await {
            Ok(n) => n,
            Err(e) => {
                warn!(server = %server.name, error = %e,
                    "vector cleanup failed; scheduled for reconciliation");
                0
            }
        };

        // 4. Caches.
        self.cache.invalidate_pattern("tool_list:*");
        self.cache.invalidate_pattern("tool:*");
        self.cache.invalidate_pattern("prompt:*");
        self.cache.invalidate_pattern("resource:*");
        self.cache.invalidate_pattern("search:*");

        // 5. The server row itself.
        self.db.delete_server(id).await?;

        info!(
            server = %server.name,
            tools = tool_ids.len(),
            prompts = prompt_ids.len(),
            resources = resource_ids.len(),
            "server removed"
        );

        Ok(RemovalReport {
            removed_tools: tool_ids.len(),
            removed_prompts: prompt_ids.len(),
            removed_resources: resource_ids.len(),
            removed_vector_points: removed_points,
        })
    }

    pub async fn get(&self, id: Uuid) -> Result<ServerView> {
        let server = self.require(id).await?;
        Ok(self.view(server))
    }

    pub async fn list(&self, org: Option<&str>) -> Result<Vec<ServerView>> {
        let servers = self.db.list_servers(org).await?;
        Ok(servers.into_iter().map(|s| self.view(s)).collect())
    }

    fn view(&self, server: ExternalServer) -> ServerView {
        let session = self.sessions.get(server.id);
        ServerView {
            session_state: session.as_ref().map(|s| s.state()),
            inflight_requests: session.map(|s| s.inflight()).unwrap_or(0),
            server,
        }
    }

    async fn require(&self, id: Uuid) -> Result<ExternalServer> {
        self.db
            .get_server(id)
            .await?
            .ok_or_else(|| AggregatorError::NotFound(id.to_string()))
    }
}
