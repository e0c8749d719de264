//! Hierarchical search engine
//!
//! Two-stage retrieval over the vector index:
//! 1. match the query against the skills collection (tenant-filtered),
//!    keeping skills at or above the skill threshold
//! 2. search the item collection filtered to the matched skills; when no
//!    skill qualifies, fall back to a direct search with the skill filter
//!    removed and flag it
//! 3. enrich the returned hits with input schemas from the registry
//!
//! Scores are cosine similarity clamped to [0, 1]. Ties break by score
//! descending, then primary-assignment preference, then id ascending.

use crate::config::SearchSection;
use crate::core::ItemKind;
use crate::embed::{EmbedError, Embedder};
use crate::store::cache::LayerCache;
use crate::store::relational::{RegistryStore, StoreError};
use crate::store::vector::{
    kind_collection, kind_offset, PointFilter, ScoredPoint, VectorError, VectorIndex,
    SKILLS_COLLECTION,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum SearchError {
    #[error("Query cannot be empty")]
    EmptyQuery,

    #[error(transparent)]
    Embed(#[from] EmbedError),

    #[error(transparent)]
    Vector(#[from] VectorError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, SearchError>;

/// Retrieval strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchStrategy {
    #[default]
    Hierarchical,
    Direct,
}

/// Search request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,

    /// Restrict to one item kind; all kinds when unset.
    #[serde(default, rename = "type")]
    pub item_type: Option<ItemKind>,

    /// Restrict to items owned by one external server (by id).
    #[serde(default)]
    pub server_id: Option<String>,

    #[serde(default)]
    pub org_id: Option<String>,

    #[serde(default)]
    pub limit: Option<usize>,

    #[serde(default)]
    pub score_threshold: Option<f32>,

    #[serde(default)]
    pub strategy: SearchStrategy,
}

/// One search hit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: i64,
    pub name: String,
    pub item_type: ItemKind,
    pub score: f32,
    pub skill_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_skill_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<serde_json::Value>,
}

/// Skill matched during stage one
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillMatch {
    pub skill_id: String,
    pub score: f32,
}

/// Metadata emitted with every response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchMetadata {
    pub strategy: SearchStrategy,
    pub skills_matched: Vec<SkillMatch>,
    pub fallback_used: bool,
    pub latency_ms: u64,
}

/// Full search response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<SearchHit>,
    pub metadata: SearchMetadata,
}

/// Two-stage skill -> item search service
pub struct SearchService {
    db: Arc<RegistryStore>,
    vectors: VectorIndex,
    embedder: Arc<dyn Embedder>,
    cache: Arc<LayerCache>,
    config: SearchSection,
}

impl SearchService {
    pub fn new(
        db: Arc<RegistryStore>,
        vectors: VectorIndex,
        embedder: Arc<dyn Embedder>,
        cache: Arc<LayerCache>,
        config: SearchSection,
    ) -> Self {
        SearchService {
            db,
            vectors,
            embedder,
            cache,
            config,
        }
    }

    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        if request.query.trim().is_empty() {
            return Err(SearchError::EmptyQuery);
        }

        let started = Instant::now();
        let cache_key = cache_key(request);
        if let Some(cached) = self.cache.get("search", &cache_key) {
            if let Ok(mut response) = serde_json::from_value::<SearchResponse>(cached) {
                response.metadata.latency_ms = started.elapsed().as_millis() as u64;
                return Ok(response);
            }
        }

        let query_vector = self.embedder.embed(&request.query).await?;
        let limit = request.limit.unwrap_or(self.config.default_limit).max(1);
        let score_threshold = request
            .score_threshold
            .unwrap_or(self.config.tool_score_threshold);

        // Stage 1: skill matching (skipped for direct strategy).
        let skills_matched = match request.strategy {
            SearchStrategy::Direct => Vec::new(),
            SearchStrategy::Hierarchical => {
                self.match_skills(&query_vector, request.org_id.as_deref())
                    .await?
            }
        };

        // Stage 2: item search, with fallback when no skill qualified.
        let fallback_used =
            request.strategy == SearchStrategy::Hierarchical && skills_matched.is_empty();
        let skill_filter = if request.strategy == SearchStrategy::Hierarchical && !fallback_used {
            Some(
                skills_matched
                    .iter()
                    .map(|m| m.skill_id.clone())
                    .collect::<Vec<_>>(),
            )
        } else {
            None
        };

        let points = self
            .search_items(&query_vector, request, skill_filter, limit)
            .await?;

        // Stage 3: normalize, threshold, tie-break, enrich.
        let matched_ids: Vec<String> = skills_matched.iter().map(|m| m.skill_id.clone()).collect();
        let mut hits = Vec::new();
        for (kind, point) in points {
            let score = point.score.clamp(0.0, 1.0);
            if score < score_threshold {
                continue;
            }
            let db_id = (point.id - kind_offset(kind)) as i64;
            hits.push(SearchHit {
                id: db_id,
                name: point.payload.name.clone(),
                item_type: kind,
                score,
                skill_ids: point.payload.skill_ids.clone(),
                primary_skill_id: point.payload.primary_skill_id.clone(),
                server_id: point.payload.source_server_id.clone(),
                description: None,
                input_schema: None,
            });
        }

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    // Among equal scores, primary assignment into a matched
                    // skill wins.
                    let a_primary = hit_has_matched_primary(a, &matched_ids);
                    let b_primary = hit_has_matched_primary(b, &matched_ids);
                    b_primary.cmp(&a_primary)
                })
                .then(a.id.cmp(&b.id))
        });
        hits.truncate(limit);

        let hits = self.enrich(hits).await?;

        let response = SearchResponse {
            results: hits,
            metadata: SearchMetadata {
                strategy: request.strategy,
                skills_matched,
                fallback_used,
                latency_ms: started.elapsed().as_millis() as u64,
            },
        };

        if let Ok(value) = serde_json::to_value(&response) {
            self.cache.set("search", &cache_key, value);
        }

        debug!(
            query = %request.query,
            results = response.results.len(),
            fallback = response.metadata.fallback_used,
            latency_ms = response.metadata.latency_ms,
            "search complete"
        );
        Ok(response)
    }

    /// Stage 1: skills at or above the threshold, tenant-filtered.
    /// Ties break by score descending then skill id ascending.
    async fn match_skills(&self, query: &[f32], org: Option<&str>) -> Result<Vec<SkillMatch>> {
        let filter = PointFilter::tenant(org);
        let points = self
            .vectors
            .search(SKILLS_COLLECTION, query, &filter, 16)
            .await?;

        let mut matches: Vec<SkillMatch> = points
            .into_iter()
            .map(|p| SkillMatch {
                skill_id: p.payload.name,
                score: p.score.clamp(0.0, 1.0),
            })
            .filter(|m| m.score >= self.config.skill_threshold)
            .collect();

        matches.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.skill_id.cmp(&b.skill_id))
        });
        Ok(matches)
    }

    async fn search_items(
        &self,
        query: &[f32],
        request: &SearchRequest,
        skill_filter: Option<Vec<String>>,
        limit: usize,
    ) -> Result<Vec<(ItemKind, ScoredPoint)>> {
        let kinds: Vec<ItemKind> = match request.item_type {
            Some(kind) => vec![kind],
            None => vec![ItemKind::Tool, ItemKind::Prompt, ItemKind::Resource],
        };

        let mut filter = PointFilter::tenant(request.org_id.as_deref());
        filter.source_server_id = request.server_id.clone();
        if let Some(skills) = skill_filter {
            filter = filter.with_any_skill(skills);
        }

        // Over-fetch per collection; the caller thresholds and truncates.
        let mut all = Vec::new();
        for kind in kinds {
            let points = self
                .vectors
                .search(kind_collection(kind), query, &filter, limit * 2)
                .await?;
            all.extend(points.into_iter().map(|p| (kind, p)));
        }
        Ok(all)
    }

    /// Stage 3: load schemas and descriptions only for returned hits. Hits
    /// whose records are gone or inactive are dropped; the index may lag the
    /// registry.
    async fn enrich(&self, hits: Vec<SearchHit>) -> Result<Vec<SearchHit>> {
        let mut enriched = Vec::with_capacity(hits.len());
        for mut hit in hits {
            match hit.item_type {
                ItemKind::Tool => match self.db.get_tool(hit.id).await? {
                    Some(tool) if tool.is_active => {
                        hit.description = Some(tool.description);
                        hit.input_schema = Some(tool.input_schema);
                        enriched.push(hit);
                    }
                    _ => continue,
                },
                ItemKind::Prompt => match self.db.get_prompt(hit.id).await? {
                    Some(prompt) if prompt.is_active => {
                        hit.description = Some(prompt.description);
                        enriched.push(hit);
                    }
                    _ => continue,
                },
                ItemKind::Resource => match self.db.get_resource(hit.id).await? {
                    Some(resource) if resource.is_active => {
                        hit.description = Some(resource.description);
                        enriched.push(hit);
                    }
                    _ => continue,
                },
            }
        }
        Ok(enriched)
    }
}

fn hit_has_matched_primary(hit: &SearchHit, matched: &[String]) -> bool {
    hit.primary_skill_id
        .as_ref()
        .map(|p| matched.iter().any(|m| m == p))
        .unwrap_or(false)
}

fn cache_key(request: &SearchRequest) -> String {
    let raw = format!(
        "{}|{:?}|{:?}|{:?}|{:?}|{:?}|{:?}",
        request.query,
        request.item_type,
        request.server_id,
        request.org_id,
        request.limit,
        request.score_threshold,
        request.strategy
    );
    blake3::hash(raw.as_bytes()).to_hex().to_string()
}
