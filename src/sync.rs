//! Auto-discovery & sync pipeline
//!
//! Brings the registry into agreement with its two authorities:
//! - the in-process module registrations scanned at startup
//! - each connected external server's capability listing
//!
//! Registry writes land first; embedding and classification follow through a
//! bounded job queue with bounded retries, and cache invalidations propagate
//! every delta. The pipeline is idempotent: a failed run can be retried
//! safely.

use crate::core::{namespaced, ExternalServer, ItemKind, PromptSpec, ResourceSpec, Scope, ToolSpec};
use crate::internal::LocalRegistry;
use crate::protocol::RemoteListing;
use crate::skills::classifier::ClassificationService;
use crate::store::cache::LayerCache;
use crate::store::object::{resource_body_key, ObjectStore};
use crate::store::relational::{RegistryStore, StoreError};
use crate::store::vector::{PointPayload, VectorIndex};
use crate::embed::Embedder;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const JOB_QUEUE_DEPTH: usize = 256;
const JOB_RETRY_ATTEMPTS: u32 = 3;
const JOB_RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Job queue closed")]
    QueueClosed,
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Deferred work scheduled after registry commits
#[derive(Debug, Clone)]
pub enum SyncJob {
    Embed { kind: ItemKind, id: i64 },
    Classify { tool_id: i64 },
}

/// Outcome summary of one sync run
#[derive(Debug, Default, Clone, Serialize)]
pub struct SyncReport {
    pub tools_upserted: usize,
    pub prompts_upserted: usize,
    pub resources_upserted: usize,
    pub deleted: usize,
    pub deactivated: u64,
    pub jobs_scheduled: usize,
}

/// Reconciliation pipeline
pub struct SyncPipeline {
    db: Arc<RegistryStore>,
    vectors: VectorIndex,
    cache: Arc<LayerCache>,
    embedder: Arc<dyn Embedder>,
    classifier: Arc<ClassificationService>,
    objects: Arc<dyn ObjectStore>,
    jobs_tx: mpsc::Sender<SyncJob>,
}

impl SyncPipeline {
    /// Build the pipeline and hand back the receiving end of the job queue;
    /// pass it to [`SyncPipeline::run_worker`] on a background task.
    pub fn new(
        db: Arc<RegistryStore>,
        vectors: VectorIndex,
        cache: Arc<LayerCache>,
        embedder: Arc<dyn Embedder>,
        classifier: Arc<ClassificationService>,
        objects: Arc<dyn ObjectStore>,
    ) -> (Arc<Self>, mpsc::Receiver<SyncJob>) {
        let (jobs_tx, jobs_rx) = mpsc::channel(JOB_QUEUE_DEPTH);
        let pipeline = Arc::new(SyncPipeline {
            db,
            vectors,
            cache,
            embedder,
            classifier,
            objects,
            jobs_tx,
        });
        (pipeline, jobs_rx)
    }

    /// Reconcile the in-process module registrations. Internal records not
    /// seen in this scan are marked inactive.
    pub async fn sync_internal(&self, local: &LocalRegistry) -> Result<SyncReport> {
        let mut report = SyncReport::default();

        let mut tool_names = Vec::new();
        for spec in local.tool_specs() {
            let (record, changed) = self.db.upsert_tool(&spec).await?;
            tool_names.push(record.name.clone());
            report.tools_upserted += 1;
            if changed {
                self.enqueue(SyncJob::Embed {
                    kind: ItemKind::Tool,
                    id: record.id,
                })
                .await?;
                self.enqueue(SyncJob::Classify { tool_id: record.id }).await?;
                report.jobs_scheduled += 2;
            }
        }

        let mut prompt_names = Vec::new();
        for spec in local.prompt_specs() {
            let (record, changed) = self.db.upsert_prompt(&spec).await?;
            prompt_names.push(record.name.clone());
            report.prompts_upserted += 1;
            if changed {
                self.enqueue(SyncJob::Embed {
                    kind: ItemKind::Prompt,
                    id: record.id,
                })
                .await?;
                report.jobs_scheduled += 1;
            }
        }

        let mut resource_names = Vec::new();
        for spec in local.resource_specs() {
            let (record, changed) = self.db.upsert_resource(&spec).await?;
            resource_names.push(record.name.clone());
            report.resources_upserted += 1;
            if changed {
                self.enqueue(SyncJob::Embed {
                    kind: ItemKind::Resource,
                    id: record.id,
                })
                .await?;
                report.jobs_scheduled += 1;
            }

            // Staged bodies move into the object store, which is what
            // resources/read serves from.
            if let Some(body) = local.resource_body(&spec.uri) {
                if let Err(e) = self
                    .objects
                    .put(&resource_body_key(&spec.uri), body.into_bytes())
                    .await
                {
                    warn!(uri = %spec.uri, error = %e, "resource body upload failed");
                }
            }
        }

        report.deactivated += self.db.deactivate_internal_tools_except(&tool_names).await?;
        report.deactivated += self
            .db
            .deactivate_internal_prompts_except(&prompt_names)
            .await?;
        report.deactivated += self
            .db
            .deactivate_internal_resources_except(&resource_names)
            .await?;

        self.invalidate_listings();

        info!(
            tools = report.tools_upserted,
            prompts = report.prompts_upserted,
            resources = report.resources_upserted,
            deactivated = report.deactivated,
            "internal sync complete"
        );
        Ok(report)
    }

    /// Reconcile one server's remote listing: namespaced upserts, atomic
    /// deletes for capabilities the server no longer advertises, deferred
    /// embedding/classification, cache invalidation.
    pub async fn sync_external(
        &self,
        server: &ExternalServer,
        listing: &RemoteListing,
    ) -> Result<SyncReport> {
        let scope = Scope {
            org_id: server.org_id.clone(),
            is_global: server.is_global,
        };

        let tools: Vec<ToolSpec> = listing
            .tools
            .iter()
            .map(|t| ToolSpec {
                name: namespaced(&server.name, &t.name),
                description: t.description.clone().unwrap_or_default(),
                input_schema: t.input_schema.clone(),
                annotations: t.annotations.clone().unwrap_or(serde_json::json!({})),
                category: None,
                security_level: Default::default(),
                scope: scope.clone(),
                source_server_id: Some(server.id),
                original_name: Some(t.name.clone()),
            })
            .collect();

        let prompts: Vec<PromptSpec> = listing
            .prompts
            .iter()
            .map(|p| PromptSpec {
                name: namespaced(&server.name, &p.name),
                description: p.description.clone().unwrap_or_default(),
                arguments: p.arguments.clone(),
                template: None,
                scope: scope.clone(),
                source_server_id: Some(server.id),
                original_name: Some(p.name.clone()),
            })
            .collect();

        let resources: Vec<ResourceSpec> = listing
            .resources
            .iter()
            .map(|r| ResourceSpec {
                name: namespaced(&server.name, &r.name),
                uri: r.uri.clone(),
                description: r.description.clone().unwrap_or_default(),
                mime_type: r.mime_type.clone(),
                owner: None,
                allowed_users: Vec::new(),
                scope: scope.clone(),
                source_server_id: Some(server.id),
                original_name: Some(r.name.clone()),
            })
            .collect();

        let delta = self
            .db
            .apply_remote_listing(server.id, &tools, &prompts, &resources)
            .await?;

        let mut report = SyncReport {
            tools_upserted: delta.tools.upserted.len(),
            prompts_upserted: delta.prompts.upserted.len(),
            resources_upserted: delta.resources.upserted.len(),
            deleted: delta.tools.deleted_ids.len()
                + delta.prompts.deleted_ids.len()
                + delta.resources.deleted_ids.len(),
            ..Default::default()
        };

        // Vector points of removed records go away too.
        for (kind, ids) in [
            (ItemKind::Tool, &delta.tools.deleted_ids),
            (ItemKind::Prompt, &delta.prompts.deleted_ids),
            (ItemKind::Resource, &delta.resources.deleted_ids),
        ] {
            if !ids.is_empty() {
                if let Err(e) = self.vectors.delete_items(kind, ids).await {
                    warn!(kind = %kind, error = %e, "failed to delete stale vector points");
                }
            }
        }

        for (id, text_changed) in &delta.tools.upserted {
            if *text_changed {
                self.enqueue(SyncJob::Embed {
                    kind: ItemKind::Tool,
                    id: *id,
                })
                .await?;
                report.jobs_scheduled += 1;
            }
            self.enqueue(SyncJob::Classify { tool_id: *id }).await?;
            report.jobs_scheduled += 1;
        }
        for (id, text_changed) in &delta.prompts.upserted {
            if *text_changed {
                self.enqueue(SyncJob::Embed {
                    kind: ItemKind::Prompt,
                    id: *id,
                })
                .await?;
                report.jobs_scheduled += 1;
            }
        }
        for (id, text_changed) in &delta.resources.upserted {
            if *text_changed {
                self.enqueue(SyncJob::Embed {
                    kind: ItemKind::Resource,
                    id: *id,
                })
                .await?;
                report.jobs_scheduled += 1;
            }
        }

        self.db
            .set_server_tool_count(server.id, listing.tools.len() as i64)
            .await?;

        self.invalidate_listings();

        info!(
            server = %server.name,
            tools = listing.tools.len(),
            deleted = report.deleted,
            "external sync complete"
        );
        Ok(report)
    }

    fn invalidate_listings(&self) {
        self.cache.invalidate_pattern("tool_list:*");
        self.cache.invalidate_pattern("tool:*");
        self.cache.invalidate_pattern("prompt:*");
        self.cache.invalidate_pattern("resource:*");
        self.cache.invalidate_pattern("search:*");
    }

    async fn enqueue(&self, job: SyncJob) -> Result<()> {
        self.jobs_tx
            .send(job)
            .await
            .map_err(|_| SyncError::QueueClosed)
    }

    /// Drain the job queue until cancelled. Each job retries with backoff;
    /// persistent classification failures leave the tool unclassified (still
    /// reachable through direct search).
    pub async fn run_worker(
        self: Arc<Self>,
        mut jobs_rx: mpsc::Receiver<SyncJob>,
        cancel: CancellationToken,
    ) {
        info!("sync worker started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                job = jobs_rx.recv() => {
                    let Some(job) = job else { break };
                    self.process_with_retry(job).await;
                }
            }
        }
        info!("sync worker stopped");
    }

    async fn process_with_retry(&self, job: SyncJob) {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.process(&job).await {
                Ok(()) => return,
                Err(e) if attempt < JOB_RETRY_ATTEMPTS => {
                    let delay = JOB_RETRY_BASE_DELAY * 2u32.pow(attempt - 1);
                    warn!(job = ?job, attempt, error = %e, "sync job failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!(job = ?job, attempts = attempt, error = %e,
                        "sync job failed, giving up");
                    return;
                }
            }
        }
    }

    async fn process(&self, job: &SyncJob) -> std::result::Result<(), String> {
        match job {
            SyncJob::Embed { kind, id } => self.embed_item(*kind, *id).await,
            SyncJob::Classify { tool_id } => self
                .classifier
                .classify_tool(*tool_id)
                .await
                .map(|_| ())
                .map_err(|e| e.to_string()),
        }
    }

    async fn embed_item(&self, kind: ItemKind, id: i64) -> std::result::Result<(), String> {
        let (text, payload) = match kind {
            ItemKind::Tool => {
                let Some(tool) = self.db.get_tool(id).await.map_err(|e| e.to_string())? else {
                    debug!(kind = %kind, id, "record gone before embedding, skipping");
                    return Ok(());
                };
                (
                    tool.embedding_text(),
                    PointPayload {
                        name: tool.name.clone(),
                        org_id: tool.org_id.clone(),
                        is_global: tool.is_global,
                        skill_ids: tool.skill_ids.clone(),
                        primary_skill_id: tool.primary_skill_id.clone(),
                        source_server_id: tool.source_server_id.map(|u| u.to_string()),
                    },
                )
            }
            ItemKind::Prompt => {
                let Some(prompt) = self.db.get_prompt(id).await.map_err(|e| e.to_string())?
                else {
                    return Ok(());
                };
                (
                    prompt.embedding_text(),
                    PointPayload {
                        name: prompt.name.clone(),
                        org_id: prompt.org_id.clone(),
                        is_global: prompt.is_global,
                        skill_ids: prompt.skill_ids.clone(),
                        primary_skill_id: None,
                        source_server_id: prompt.source_server_id.map(|u| u.to_string()),
                    },
                )
            }
            ItemKind::Resource => {
                let Some(resource) = self.db.get_resource(id).await.map_err(|e| e.to_string())?
                else {
                    return Ok(());
                };
                (
                    resource.embedding_text(),
                    PointPayload {
                        name: resource.name.clone(),
                        org_id: resource.org_id.clone(),
                        is_global: resource.is_global,
                        skill_ids: Vec::new(),
                        primary_skill_id: None,
                        source_server_id: resource.source_server_id.map(|u| u.to_string()),
                    },
                )
            }
        };

        let vector = self.embedder.embed(&text).await.map_err(|e| e.to_string())?;
        self.vectors
            .upsert_item(kind, id, vector, payload)
            .await
            .map_err(|e| e.to_string())
    }

    /// Process every queued job inline. Test and CLI helper for when no
    /// worker task is running.
    pub async fn drain_jobs(&self, jobs_rx: &mut mpsc::Receiver<SyncJob>) {
        while let Ok(job) = jobs_rx.try_recv() {
            self.process_with_retry(job).await;
        }
    }
}
