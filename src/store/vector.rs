//! Vector store adapter
//!
//! Named collections of embedding points with payload filters. Point ids are
//! deterministic: relational primary key plus a per-kind offset, so the
//! relational store and the index stay joinable without a mapping table.
//!
//! - `tools`:     offset 0
//! - `prompts`:   offset 1_000_000
//! - `resources`: offset 2_000_000
//! - `skills`:    keyed by a hash of the skill id
//!
//! All writes go through [`VectorIndex`], which enforces the capacity
//! invariant and retries transient failures with exponential backoff.

use crate::config::VectorSection;
use crate::core::ItemKind;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

pub const TOOLS_COLLECTION: &str = "mcp_tool_embeddings";
pub const PROMPTS_COLLECTION: &str = "mcp_prompt_embeddings";
pub const RESOURCES_COLLECTION: &str = "mcp_resource_embeddings";
pub const SKILLS_COLLECTION: &str = "mcp_skills";

/// Per-kind id space within the item collections.
pub const POINT_CAPACITY: u64 = 1_000_000;

#[derive(Error, Debug)]
pub enum VectorError {
    #[error("Point id overflow: {kind} id {db_id} exceeds capacity {capacity}")]
    Overflow {
        kind: ItemKind,
        db_id: i64,
        capacity: u64,
    },

    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid point: {0}")]
    InvalidPoint(String),
}

pub type Result<T> = std::result::Result<T, VectorError>;

/// Offset of a kind inside the shared point-id space.
pub const fn kind_offset(kind: ItemKind) -> u64 {
    match kind {
        ItemKind::Tool => 0,
        ItemKind::Prompt => 1_000_000,
        ItemKind::Resource => 2_000_000,
    }
}

/// Collection name for a kind.
pub const fn kind_collection(kind: ItemKind) -> &'static str {
    match kind {
        ItemKind::Tool => TOOLS_COLLECTION,
        ItemKind::Prompt => PROMPTS_COLLECTION,
        ItemKind::Resource => RESOURCES_COLLECTION,
    }
}

/// Compute the deterministic point id for a relational row.
///
/// Invariant: `offset <= point_id < offset + capacity`.
pub fn point_id(kind: ItemKind, db_id: i64) -> Result<u64> {
    if db_id < 0 || db_id as u64 >= POINT_CAPACITY {
        return Err(VectorError::Overflow {
            kind,
            db_id,
            capacity: POINT_CAPACITY,
        });
    }
    Ok(kind_offset(kind) + db_id as u64)
}

/// Point id for a skill category (hash of the id, separate collection).
pub fn skill_point_id(skill_id: &str) -> u64 {
    let hash = blake3::hash(skill_id.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_le_bytes(bytes)
}

/// Payload stored alongside every point; drives filtered search.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PointPayload {
    pub name: String,
    #[serde(default)]
    pub org_id: Option<String>,
    #[serde(default)]
    pub is_global: bool,
    #[serde(default)]
    pub skill_ids: Vec<String>,
    #[serde(default)]
    pub primary_skill_id: Option<String>,
    #[serde(default)]
    pub source_server_id: Option<String>,
}

/// Filter applied during search and bulk deletes.
#[derive(Debug, Clone, Default)]
pub struct PointFilter {
    /// Tenant filter: match global points, or points owned by this org.
    pub org: Option<String>,
    /// Only points carrying at least one of these skills.
    pub any_skill: Option<Vec<String>>,
    /// Only points owned by this server.
    pub source_server_id: Option<String>,
}

impl PointFilter {
    pub fn tenant(org: Option<&str>) -> Self {
        PointFilter {
            org: org.map(|s| s.to_string()),
            ..Default::default()
        }
    }

    pub fn with_any_skill(mut self, skills: Vec<String>) -> Self {
        self.any_skill = Some(skills);
        self
    }

    pub fn for_server(server_id: &str) -> Self {
        PointFilter {
            source_server_id: Some(server_id.to_string()),
            ..Default::default()
        }
    }

    pub fn matches(&self, payload: &PointPayload) -> bool {
        // Tenant rule: global points pass, org points need the same org.
        let tenant_ok = payload.is_global || payload.org_id.as_deref() == self.org.as_deref();
        if !tenant_ok {
            return false;
        }
        if let Some(server) = &self.source_server_id {
            if payload.source_server_id.as_deref() != Some(server.as_str()) {
                return false;
            }
        }
        if let Some(skills) = &self.any_skill {
            if !skills.iter().any(|s| payload.skill_ids.contains(s)) {
                return false;
            }
        }
        true
    }
}

/// Search hit
#[derive(Debug, Clone)]
pub struct ScoredPoint {
    pub id: u64,
    pub score: f32,
    pub payload: PointPayload,
}

/// Narrow interface over a vector database.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn ensure_collection(&self, name: &str, dim: usize) -> Result<()>;

    async fn upsert(
        &self,
        collection: &str,
        id: u64,
        vector: Vec<f32>,
        payload: PointPayload,
    ) -> Result<()>;

    /// Update a point's payload without touching its vector.
    async fn set_payload(&self, collection: &str, id: u64, payload: PointPayload) -> Result<()>;

    async fn delete(&self, collection: &str, ids: &[u64]) -> Result<u64>;

    async fn delete_by_filter(&self, collection: &str, filter: &PointFilter) -> Result<u64>;

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        filter: &PointFilter,
        limit: usize,
    ) -> Result<Vec<ScoredPoint>>;

    async fn count(&self, collection: &str) -> Result<u64>;
}

struct Collection {
    dim: usize,
    points: HashMap<u64, (Vec<f32>, PointPayload)>,
}

/// In-memory vector store (cosine similarity). The default backend; a remote
/// vector database plugs in behind the same trait.
#[derive(Default)]
pub struct MemoryVectorStore {
    collections: RwLock<HashMap<String, Collection>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn ensure_collection(&self, name: &str, dim: usize) -> Result<()> {
        let mut collections = self.collections.write();
        collections.entry(name.to_string()).or_insert(Collection {
            dim,
            points: HashMap::new(),
        });
        Ok(())
    }

    async fn upsert(
        &self,
        collection: &str,
        id: u64,
        vector: Vec<f32>,
        payload: PointPayload,
    ) -> Result<()> {
        let mut collections = self.collections.write();
        let coll = collections
            .get_mut(collection)
            .ok_or_else(|| VectorError::CollectionNotFound(collection.to_string()))?;
        if vector.len() != coll.dim {
            return Err(VectorError::DimensionMismatch {
                expected: coll.dim,
                got: vector.len(),
            });
        }
        coll.points.insert(id, (vector, payload));
        Ok(())
    }

    async fn set_payload(&self, collection: &str, id: u64, payload: PointPayload) -> Result<()> {
        let mut collections = self.collections.write();
        let coll = collections
            .get_mut(collection)
            .ok_or_else(|| VectorError::CollectionNotFound(collection.to_string()))?;
        match coll.points.get_mut(&id) {
            Some(entry) => {
                entry.1 = payload;
                Ok(())
            }
            None => Err(VectorError::InvalidPoint(format!(
                "point {id} not found in {collection}"
            ))),
        }
    }

    async fn delete(&self, collection: &str, ids: &[u64]) -> Result<u64> {
        let mut collections = self.collections.write();
        let coll = collections
            .get_mut(collection)
            .ok_or_else(|| VectorError::CollectionNotFound(collection.to_string()))?;
        let mut removed = 0;
        for id in ids {
            if coll.points.remove(id).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn delete_by_filter(&self, collection: &str, filter: &PointFilter) -> Result<u64> {
        let mut collections = self.collections.write();
        let coll = collections
            .get_mut(collection)
            .ok_or_else(|| VectorError::CollectionNotFound(collection.to_string()))?;
        let before = coll.points.len();
        coll.points.retain(|_, (_, payload)| !filter.matches(payload));
        Ok((before - coll.points.len()) as u64)
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        filter: &PointFilter,
        limit: usize,
    ) -> Result<Vec<ScoredPoint>> {
        let collections = self.collections.read();
        let coll = collections
            .get(collection)
            .ok_or_else(|| VectorError::CollectionNotFound(collection.to_string()))?;

        let mut hits: Vec<ScoredPoint> = coll
            .points
            .iter()
            .filter(|(_, (_, payload))| filter.matches(payload))
            .map(|(id, (v, payload))| ScoredPoint {
                id: *id,
                score: cosine(vector, v),
                payload: payload.clone(),
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.id.cmp(&b.id))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    async fn count(&self, collection: &str) -> Result<u64> {
        let collections = self.collections.read();
        let coll = collections
            .get(collection)
            .ok_or_else(|| VectorError::CollectionNotFound(collection.to_string()))?;
        Ok(coll.points.len() as u64)
    }
}

/// Write wrapper enforcing the point-id invariant and retrying transient
/// failures (delays 0.5s, 1.0s by default; last error re-raised).
#[derive(Clone)]
pub struct VectorIndex {
    store: Arc<dyn VectorStore>,
    retry_attempts: u32,
    retry_base_delay: Duration,
    warn_pct: f64,
}

impl VectorIndex {
    pub fn new(store: Arc<dyn VectorStore>, config: &VectorSection) -> Self {
        VectorIndex {
            store,
            retry_attempts: config.retry_attempts.max(1),
            retry_base_delay: Duration::from_secs_f64(config.retry_base_delay_s),
            warn_pct: config.overflow_warn_pct,
        }
    }

    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    /// Create all four collections.
    pub async fn ensure_collections(&self, dim: usize) -> Result<()> {
        for name in [
            TOOLS_COLLECTION,
            PROMPTS_COLLECTION,
            RESOURCES_COLLECTION,
            SKILLS_COLLECTION,
        ] {
            self.store.ensure_collection(name, dim).await?;
        }
        Ok(())
    }

    async fn with_retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                // Capacity, schema, and addressing errors are not transient.
                Err(e @ VectorError::Overflow { .. })
                | Err(e @ VectorError::DimensionMismatch { .. })
                | Err(e @ VectorError::InvalidPoint(_))
                | Err(e @ VectorError::CollectionNotFound(_)) => return Err(e),
                Err(e) if attempt < self.retry_attempts => {
                    let delay = self.retry_base_delay * 2u32.pow(attempt - 1);
                    warn!(
                        operation = what,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "vector operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!(operation = what, attempts = attempt, error = %e,
                        "vector operation failed, retries exhausted");
                    return Err(e);
                }
            }
        }
    }

    /// Upsert an item point. Refuses ids at capacity and warns at 90%.
    pub async fn upsert_item(
        &self,
        kind: ItemKind,
        db_id: i64,
        vector: Vec<f32>,
        payload: PointPayload,
    ) -> Result<()> {
        let id = point_id(kind, db_id)?;

        let warn_floor = (POINT_CAPACITY as f64 * self.warn_pct) as i64;
        if db_id >= warn_floor {
            warn!(
                kind = %kind,
                db_id,
                capacity = POINT_CAPACITY,
                "point id space above {}% occupancy",
                (self.warn_pct * 100.0) as u64
            );
        }

        let collection = kind_collection(kind);
        self.with_retry("upsert", || {
            let vector = vector.clone();
            let payload = payload.clone();
            async move { self.store.upsert(collection, id, vector, payload).await }
        })
        .await
    }

    /// Update an item's payload in place (no re-embed).
    pub async fn update_item_payload(
        &self,
        kind: ItemKind,
        db_id: i64,
        payload: PointPayload,
    ) -> Result<()> {
        let id = point_id(kind, db_id)?;
        let collection = kind_collection(kind);
        self.with_retry("set_payload", || {
            let payload = payload.clone();
            async move { self.store.set_payload(collection, id, payload).await }
        })
        .await
    }

    pub async fn delete_items(&self, kind: ItemKind, db_ids: &[i64]) -> Result<u64> {
        let ids: Vec<u64> = db_ids
            .iter()
            .filter_map(|&db_id| point_id(kind, db_id).ok())
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }
        let collection = kind_collection(kind);
        self.with_retry("delete", || {
            let ids = ids.clone();
            async move { self.store.delete(collection, &ids).await }
        })
        .await
    }

    /// Delete every item point owned by a server, across all item kinds.
    pub async fn delete_server_points(&self, server_id: &str) -> Result<u64> {
        let filter = PointFilter::for_server(server_id);
        let mut total = 0;
        for kind in [ItemKind::Tool, ItemKind::Prompt, ItemKind::Resource] {
            let collection = kind_collection(kind);
            total += self
                .with_retry("delete_by_filter", || {
                    let filter = filter.clone();
                    async move { self.store.delete_by_filter(collection, &filter).await }
                })
                .await?;
        }
        debug!(server_id, removed = total, "deleted server vector points");
        Ok(total)
    }

    pub async fn upsert_skill(
        &self,
        skill_id: &str,
        vector: Vec<f32>,
        payload: PointPayload,
    ) -> Result<()> {
        let id = skill_point_id(skill_id);
        self.with_retry("upsert_skill", || {
            let vector = vector.clone();
            let payload = payload.clone();
            async move { self.store.upsert(SKILLS_COLLECTION, id, vector, payload).await }
        })
        .await
    }

    pub async fn delete_skill(&self, skill_id: &str) -> Result<u64> {
        let id = skill_point_id(skill_id);
        self.with_retry("delete_skill", || async move {
            self.store.delete(SKILLS_COLLECTION, &[id]).await
        })
        .await
    }

    pub async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        filter: &PointFilter,
        limit: usize,
    ) -> Result<Vec<ScoredPoint>> {
        self.with_retry("search", || {
            let filter = filter.clone();
            async move { self.store.search(collection, vector, &filter, limit).await }
        })
        .await
    }
}
