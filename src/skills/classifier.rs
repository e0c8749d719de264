//! Tool classification service
//!
//! Feeds a tool descriptor to the classification capability and writes the
//! surviving assignments:
//! - only skills active in the tool's scope are accepted
//! - assignments below the confidence floor are dropped
//! - the top assignment becomes primary only at or above its own threshold
//! - at most three skills per tool
//!
//! The write is transactional and replaces prior rows from the same source.
//! The tool's vector point gets a payload update (not a re-embed: the tool
//! text did not change) so skill filters reflect the new classification
//! immediately.

use crate::config::ClassifierSection;
use crate::core::{AssignmentSource, ItemKind, SkillAssignment, ToolRecord};
use crate::embed::{ClassifierClient, EmbedError, SkillPrediction, SkillSummary, ToolDescriptor};
use crate::store::relational::{RegistryStore, StoreError};
use crate::store::vector::{PointPayload, VectorIndex};
use chrono::Utc;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum ClassifyError {
    #[error("Tool not found: {0}")]
    ToolNotFound(i64),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Client(#[from] EmbedError),
}

pub type Result<T> = std::result::Result<T, ClassifyError>;

/// What a classification run decided
#[derive(Debug, Clone, Serialize)]
pub struct ClassificationOutcome {
    pub tool_id: i64,
    pub skill_ids: Vec<String>,
    pub primary_skill_id: Option<String>,
    pub dropped: usize,
}

/// Classification orchestrator
pub struct ClassificationService {
    db: Arc<RegistryStore>,
    vectors: VectorIndex,
    client: Arc<dyn ClassifierClient>,
    source: AssignmentSource,
    config: ClassifierSection,
}

impl ClassificationService {
    pub fn new(
        db: Arc<RegistryStore>,
        vectors: VectorIndex,
        client: Arc<dyn ClassifierClient>,
        source: AssignmentSource,
        config: ClassifierSection,
    ) -> Self {
        ClassificationService {
            db,
            vectors,
            client,
            source,
            config,
        }
    }

    /// Classify one tool and persist the outcome.
    pub async fn classify_tool(&self, tool_id: i64) -> Result<ClassificationOutcome> {
        let tool = self
            .db
            .get_tool(tool_id)
            .await?
            .ok_or(ClassifyError::ToolNotFound(tool_id))?;

        // Candidates: skills active in the tool's scope (global or same org).
        let candidates = self.db.list_skills(tool.org_id.as_deref(), false).await?;
        let candidate_ids: HashSet<&str> = candidates.iter().map(|s| s.id.as_str()).collect();

        let summaries: Vec<SkillSummary> = candidates
            .iter()
            .map(|s| SkillSummary {
                id: s.id.clone(),
                name: s.name.clone(),
                description: s.description.clone(),
                keywords: s.keywords.clone(),
            })
            .collect();

        let descriptor = build_descriptor(&tool);
        let predictions = self.client.classify(&descriptor, &summaries).await?;
        let total = predictions.len();

        let kept = self.filter_predictions(predictions, &candidate_ids);
        let dropped = total - kept.len();

        let primary_skill_id = kept
            .first()
            .filter(|p| p.confidence >= self.config.primary_confidence_threshold)
            .map(|p| p.skill_id.clone());

        let skill_ids: Vec<String> = kept.iter().map(|p| p.skill_id.clone()).collect();

        let now = Utc::now();
        let assignments: Vec<SkillAssignment> = kept
            .iter()
            .map(|p| SkillAssignment {
                tool_id,
                skill_id: p.skill_id.clone(),
                confidence: p.confidence,
                is_primary: primary_skill_id.as_deref() == Some(p.skill_id.as_str()),
                source: self.source,
                created_at: now,
            })
            .collect();

        // Prior assignments feed the tool-count refresh below.
        let previous: HashSet<String> = self
            .db
            .assignments_for_tool(tool_id)
            .await?
            .into_iter()
            .map(|a| a.skill_id)
            .collect();

        self.db
            .set_tool_classification(
                tool_id,
                &skill_ids,
                primary_skill_id.as_deref(),
                &assignments,
                self.source,
            )
            .await?;

        // Payload update only; queries filtering by skill see the new
        // classification immediately.
        let payload = PointPayload {
            name: tool.name.clone(),
            org_id: tool.org_id.clone(),
            is_global: tool.is_global,
            skill_ids: skill_ids.clone(),
            primary_skill_id: primary_skill_id.clone(),
            source_server_id: tool.source_server_id.map(|u| u.to_string()),
        };
        if let Err(e) = self
            .vectors
            .update_item_payload(ItemKind::Tool, tool_id, payload)
            .await
        {
            warn!(tool_id, error = %e, "tool point payload update failed");
        }

        // Refresh denormalized counts for every skill touched.
        let mut touched: HashSet<String> = previous;
        touched.extend(skill_ids.iter().cloned());
        for skill_id in &touched {
            if let Err(e) = self.db.refresh_skill_tool_count(skill_id).await {
                warn!(skill = %skill_id, error = %e, "tool count refresh failed");
            }
        }

        info!(
            tool = %tool.name,
            skills = ?skill_ids,
            primary = ?primary_skill_id,
            "tool classified"
        );

        Ok(ClassificationOutcome {
            tool_id,
            skill_ids,
            primary_skill_id,
            dropped,
        })
    }

    /// Drop unknown skills and low-confidence assignments, dedup by skill,
    /// rank by confidence, and cap the assignment count.
    fn filter_predictions(
        &self,
        predictions: Vec<SkillPrediction>,
        candidate_ids: &HashSet<&str>,
    ) -> Vec<SkillPrediction> {
        let mut best: HashMap<String, f64> = HashMap::new();
        for p in predictions {
            let confidence = p.confidence.clamp(0.0, 1.0);
            if confidence < self.config.min_confidence {
                continue;
            }
            if !candidate_ids.contains(p.skill_id.as_str()) {
                debug!(skill = %p.skill_id, "prediction for unknown or out-of-scope skill dropped");
                continue;
            }
            let entry = best.entry(p.skill_id).or_insert(confidence);
            if confidence > *entry {
                *entry = confidence;
            }
        }

        let mut kept: Vec<SkillPrediction> = best
            .into_iter()
            .map(|(skill_id, confidence)| SkillPrediction {
                skill_id,
                confidence,
            })
            .collect();
        kept.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.skill_id.cmp(&b.skill_id))
        });
        kept.truncate(self.config.max_skills_per_tool);
        kept
    }
}

/// Build the descriptor handed to the classification capability.
fn build_descriptor(tool: &ToolRecord) -> ToolDescriptor {
    let schema_summary = tool
        .input_schema
        .get("properties")
        .and_then(|p| p.as_object())
        .map(|props| props.keys().cloned().collect::<Vec<_>>().join(", "));

    ToolDescriptor {
        name: tool.name.clone(),
        description: tool.description.clone(),
        schema_summary,
    }
}
