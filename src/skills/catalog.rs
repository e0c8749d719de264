//! Skill catalog
//!
//! Maintains the skill taxonomy. Owns the invariants of category ids
//! (`^[a-z][a-z0-9_-]*$`), keyword normalization (lowercased, deduplicated),
//! and the minimum description length. Creating or updating a skill refreshes
//! its point in the skills vector collection; deactivation is soft and only
//! removes the skill from search candidacy.

use crate::core::{is_valid_ident, Scope, SkillCategory, ToolRecord};
use crate::embed::{EmbedError, Embedder};
use crate::store::cache::LayerCache;
use crate::store::relational::{RegistryStore, StoreError};
use crate::store::vector::{PointPayload, VectorError, VectorIndex};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

const MIN_DESCRIPTION_LEN: usize = 10;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Invalid skill id: {0} (expected ^[a-z][a-z0-9_-]*$)")]
    InvalidId(String),

    #[error("Description too short: {0} chars (minimum {MIN_DESCRIPTION_LEN})")]
    DescriptionTooShort(usize),

    #[error("Skill not found: {0}")]
    NotFound(String),

    #[error("Skill already exists: {0}")]
    AlreadyExists(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Vector(#[from] VectorError),

    #[error(transparent)]
    Embed(#[from] EmbedError),
}

pub type Result<T> = std::result::Result<T, CatalogError>;

/// Create request for a skill category
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSkillRequest {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub examples: Vec<String>,
    #[serde(default)]
    pub parent_domain: Option<String>,
    #[serde(default)]
    pub scope: Scope,
}

/// Partial update for a skill category
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateSkillRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub keywords: Option<Vec<String>>,
    pub examples: Option<Vec<String>>,
    pub parent_domain: Option<String>,
}

/// Lowercase and deduplicate keywords, preserving first-seen order.
fn normalize_keywords(keywords: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    keywords
        .iter()
        .map(|k| k.trim().to_lowercase())
        .filter(|k| !k.is_empty() && seen.insert(k.clone()))
        .collect()
}

/// Skill taxonomy service
pub struct SkillCatalog {
    db: Arc<RegistryStore>,
    vectors: VectorIndex,
    embedder: Arc<dyn Embedder>,
    cache: Arc<LayerCache>,
}

impl SkillCatalog {
    pub fn new(
        db: Arc<RegistryStore>,
        vectors: VectorIndex,
        embedder: Arc<dyn Embedder>,
        cache: Arc<LayerCache>,
    ) -> Self {
        SkillCatalog {
            db,
            vectors,
            embedder,
            cache,
        }
    }

    pub async fn create(&self, request: CreateSkillRequest) -> Result<SkillCategory> {
        if !is_valid_ident(&request.id) {
            return Err(CatalogError::InvalidId(request.id));
        }
        if request.description.chars().count() < MIN_DESCRIPTION_LEN {
            return Err(CatalogError::DescriptionTooShort(
                request.description.chars().count(),
            ));
        }

        let now = Utc::now();
        let scope = request.scope.normalized();
        let skill = SkillCategory {
            id: request.id,
            name: request.name,
            description: request.description,
            keywords: normalize_keywords(&request.keywords),
            examples: request.examples,
            parent_domain: request.parent_domain,
            tool_count: 0,
            org_id: scope.org_id,
            is_global: scope.is_global,
            is_active: true,
            created_at: now,
            updated_at: now,
        };

        self.db.insert_skill(&skill).await.map_err(|e| match e {
            StoreError::Conflict(_) => CatalogError::AlreadyExists(skill.id.clone()),
            other => CatalogError::Store(other),
        })?;

        self.index_skill(&skill).await;
        self.cache.invalidate_pattern("skill:*");

        info!(skill = %skill.id, "skill category created");
        Ok(skill)
    }

    pub async fn update(
        &self,
        id: &str,
        org: Option<&str>,
        request: UpdateSkillRequest,
    ) -> Result<SkillCategory> {
        let mut skill = self
            .db
            .get_skill(id, org)
            .await?
            .ok_or_else(|| CatalogError::NotFound(id.to_string()))?;

        if let Some(name) = request.name {
            skill.name = name;
        }
        if let Some(description) = request.description {
            if description.chars().count() < MIN_DESCRIPTION_LEN {
                return Err(CatalogError::DescriptionTooShort(
                    description.chars().count(),
                ));
            }
            skill.description = description;
        }
        if let Some(keywords) = request.keywords {
            skill.keywords = normalize_keywords(&keywords);
        }
        if let Some(examples) = request.examples {
            skill.examples = examples;
        }
        if let Some(parent) = request.parent_domain {
            skill.parent_domain = Some(parent);
        }
        skill.updated_at = Utc::now();

        self.db.update_skill(&skill).await?;
        self.index_skill(&skill).await;
        self.cache.invalidate_pattern("skill:*");
        self.cache.invalidate_pattern("search:*");

        Ok(skill)
    }

    pub async fn get(&self, id: &str, org: Option<&str>) -> Result<SkillCategory> {
        self.db
            .get_skill(id, org)
            .await?
            .ok_or_else(|| CatalogError::NotFound(id.to_string()))
    }

    pub async fn list(&self, org: Option<&str>, include_inactive: bool) -> Result<Vec<SkillCategory>> {
        Ok(self.db.list_skills(org, include_inactive).await?)
    }

    /// Soft-deactivate: the skill leaves search candidacy but historical
    /// assignments remain.
    pub async fn deactivate(&self, id: &str, org: Option<&str>) -> Result<SkillCategory> {
        let mut skill = self
            .db
            .get_skill(id, org)
            .await?
            .ok_or_else(|| CatalogError::NotFound(id.to_string()))?;
        skill.is_active = false;
        skill.updated_at = Utc::now();

        self.db.update_skill(&skill).await?;
        if let Err(e) = self.vectors.delete_skill(&skill.id).await {
            warn!(skill = %skill.id, error = %e, "failed to remove skill point");
        }
        self.cache.invalidate_pattern("skill:*");
        self.cache.invalidate_pattern("search:*");

        info!(skill = %skill.id, "skill category deactivated");
        Ok(skill)
    }

    /// Active tools assigned to a skill, tenant-filtered.
    pub async fn tools_for_skill(
        &self,
        id: &str,
        org: Option<&str>,
    ) -> Result<Vec<ToolRecord>> {
        // Resolve first so unknown skills surface as NotFound.
        let skill = self.get(id, org).await?;
        Ok(self.db.tools_for_skill(&skill.id, org).await?)
    }

    /// Embed and upsert the skill point. Vector writes are best-effort
    /// secondaries; failures are logged, not propagated.
    async fn index_skill(&self, skill: &SkillCategory) {
        let text = skill.embedding_text();
        let vector = match self.embedder.embed(&text).await {
            Ok(v) => v,
            Err(e) => {
                warn!(skill = %skill.id, error = %e, "skill embedding failed");
                return;
            }
        };

        let payload = PointPayload {
            name: skill.id.clone(),
            org_id: skill.org_id.clone(),
            is_global: skill.is_global,
            skill_ids: vec![skill.id.clone()],
            primary_skill_id: None,
            source_server_id: None,
        };

        if let Err(e) = self.vectors.upsert_skill(&skill.id, vector, payload).await {
            warn!(skill = %skill.id, error = %e, "skill point upsert failed");
        }
    }
}
