//! Tests for the classification service: confidence bounds, primary rules,
//! scope filtering, assignment caps

use async_trait::async_trait;
use mcphub::config::{ClassifierSection, VectorSection};
use mcphub::core::{AssignmentSource, Scope, ToolSpec};
use mcphub::embed::{
    ClassifierClient, EmbedError, Embedder, HashEmbedder, SkillPrediction, SkillSummary,
    ToolDescriptor,
};
use mcphub::skills::{ClassificationService, CreateSkillRequest, SkillCatalog};
use mcphub::store::cache::LayerCache;
use mcphub::store::relational::RegistryStore;
use mcphub::store::vector::{MemoryVectorStore, VectorIndex};
use std::sync::Arc;
use std::time::Duration;

const DIM: usize = 64;

/// Classifier returning a canned prediction list.
struct FixedClassifier(Vec<SkillPrediction>);

#[async_trait]
impl ClassifierClient for FixedClassifier {
    async fn classify(
        &self,
        _tool: &ToolDescriptor,
        _candidates: &[SkillSummary],
    ) -> Result<Vec<SkillPrediction>, EmbedError> {
        Ok(self.0.clone())
    }
}

fn prediction(skill_id: &str, confidence: f64) -> SkillPrediction {
    SkillPrediction {
        skill_id: skill_id.to_string(),
        confidence,
    }
}

struct Stack {
    db: Arc<RegistryStore>,
    vectors: VectorIndex,
    catalog: SkillCatalog,
}

async fn stack() -> Stack {
    let db = Arc::new(RegistryStore::in_memory().await.unwrap());
    let vectors = VectorIndex::new(Arc::new(MemoryVectorStore::new()), &VectorSection::default());
    vectors.ensure_collections(DIM).await.unwrap();
    let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(DIM));
    let cache = Arc::new(LayerCache::new(1, Duration::from_secs(300)));
    let catalog = SkillCatalog::new(Arc::clone(&db), vectors.clone(), embedder, cache);
    Stack {
        db,
        vectors,
        catalog,
    }
}

impl Stack {
    fn service(&self, predictions: Vec<SkillPrediction>) -> ClassificationService {
        ClassificationService::new(
            Arc::clone(&self.db),
            self.vectors.clone(),
            Arc::new(FixedClassifier(predictions)),
            AssignmentSource::Llm,
            ClassifierSection::default(),
        )
    }

    async fn skill(&self, id: &str, scope: Scope) {
        self.catalog
            .create(CreateSkillRequest {
                id: id.to_string(),
                name: id.to_string(),
                description: format!("Capability domain covering {id} operations"),
                keywords: vec![id.to_string()],
                examples: vec![],
                parent_domain: None,
                scope,
            })
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_classification_caps_and_primary() {
    let stack = stack().await;
    for id in ["s1", "s2", "s3", "s4", "s5"] {
        stack.skill(id, Scope::global()).await;
    }
    let tool = stack
        .db
        .insert_tool(&ToolSpec::new("deploy", "Ship a release to production"))
        .await
        .unwrap();

    let service = stack.service(vec![
        prediction("s1", 0.9),
        prediction("s2", 0.8),
        prediction("s3", 0.7),
        prediction("s4", 0.6),
        prediction("s5", 0.2),
        prediction("never-heard-of-it", 0.95),
    ]);

    let outcome = service.classify_tool(tool.id).await.unwrap();

    // At most three, ranked by confidence, unknown and sub-floor dropped.
    assert_eq!(outcome.skill_ids, vec!["s1", "s2", "s3"]);
    assert_eq!(outcome.primary_skill_id.as_deref(), Some("s1"));

    let record = stack.db.get_tool(tool.id).await.unwrap().unwrap();
    assert!(record.is_classified);
    assert!(record.skill_ids.len() <= 3);
    let primary = record.primary_skill_id.clone().unwrap();
    assert!(record.skill_ids.contains(&primary));

    // Every assigned skill exists and is active.
    for skill_id in &record.skill_ids {
        let skill = stack.db.get_skill(skill_id, None).await.unwrap().unwrap();
        assert!(skill.is_active);
    }
}

#[tokio::test]
async fn test_no_primary_below_threshold() {
    let stack = stack().await;
    stack.skill("s1", Scope::global()).await;
    stack.skill("s2", Scope::global()).await;
    let tool = stack
        .db
        .insert_tool(&ToolSpec::new("vague", "Does something loosely defined"))
        .await
        .unwrap();

    let service = stack.service(vec![prediction("s1", 0.45), prediction("s2", 0.35)]);
    let outcome = service.classify_tool(tool.id).await.unwrap();

    assert_eq!(outcome.skill_ids, vec!["s1", "s2"]);
    assert!(outcome.primary_skill_id.is_none());

    let record = stack.db.get_tool(tool.id).await.unwrap().unwrap();
    assert!(record.primary_skill_id.is_none());
    assert!(record.is_classified);
}

#[tokio::test]
async fn test_out_of_scope_skills_dropped() {
    let stack = stack().await;
    stack.skill("shared", Scope::global()).await;
    stack.skill("mine", Scope::org("org-a")).await;
    stack.skill("theirs", Scope::org("org-b")).await;

    let tool = stack
        .db
        .insert_tool(
            &ToolSpec::new("org_tool", "A tool owned by org-a").with_scope(Scope::org("org-a")),
        )
        .await
        .unwrap();

    let service = stack.service(vec![
        prediction("shared", 0.9),
        prediction("mine", 0.8),
        prediction("theirs", 0.85),
    ]);
    let outcome = service.classify_tool(tool.id).await.unwrap();

    // Another org's skill never attaches, whatever the confidence.
    assert_eq!(outcome.skill_ids, vec!["shared", "mine"]);
}

#[tokio::test]
async fn test_inactive_skills_not_assignable() {
    let stack = stack().await;
    stack.skill("alive", Scope::global()).await;
    stack.skill("retired", Scope::global()).await;
    stack.catalog.deactivate("retired", None).await.unwrap();

    let tool = stack
        .db
        .insert_tool(&ToolSpec::new("thing", "Operates on things"))
        .await
        .unwrap();

    let service = stack.service(vec![
        prediction("alive", 0.7),
        prediction("retired", 0.9),
    ]);
    let outcome = service.classify_tool(tool.id).await.unwrap();
    assert_eq!(outcome.skill_ids, vec!["alive"]);
}

#[tokio::test]
async fn test_reclassification_updates_tool_counts() {
    let stack = stack().await;
    stack.skill("s1", Scope::global()).await;
    stack.skill("s2", Scope::global()).await;
    let tool = stack
        .db
        .insert_tool(&ToolSpec::new("mover", "Moves data between systems"))
        .await
        .unwrap();

    let service = stack.service(vec![prediction("s1", 0.9)]);
    service.classify_tool(tool.id).await.unwrap();
    assert_eq!(stack.db.get_skill("s1", None).await.unwrap().unwrap().tool_count, 1);

    // Reclassify onto s2: s1's count returns to zero.
    let service = stack.service(vec![prediction("s2", 0.9)]);
    service.classify_tool(tool.id).await.unwrap();
    assert_eq!(stack.db.get_skill("s1", None).await.unwrap().unwrap().tool_count, 0);
    assert_eq!(stack.db.get_skill("s2", None).await.unwrap().unwrap().tool_count, 1);
}

#[tokio::test]
async fn test_catalog_invariants() {
    let stack = stack().await;

    // Uppercase ids are rejected.
    let result = stack
        .catalog
        .create(CreateSkillRequest {
            id: "Calendar".to_string(),
            name: "Calendar".to_string(),
            description: "A long enough description".to_string(),
            keywords: vec![],
            examples: vec![],
            parent_domain: None,
            scope: Scope::global(),
        })
        .await;
    assert!(result.is_err());

    // Short descriptions are rejected.
    let result = stack
        .catalog
        .create(CreateSkillRequest {
            id: "calendar".to_string(),
            name: "Calendar".to_string(),
            description: "short".to_string(),
            keywords: vec![],
            examples: vec![],
            parent_domain: None,
            scope: Scope::global(),
        })
        .await;
    assert!(result.is_err());

    // Keywords are lowercased and deduplicated.
    let skill = stack
        .catalog
        .create(CreateSkillRequest {
            id: "calendar".to_string(),
            name: "Calendar".to_string(),
            description: "Scheduling and calendar management".to_string(),
            keywords: vec![
                "Calendar".to_string(),
                "calendar".to_string(),
                "  MEETING ".to_string(),
            ],
            examples: vec![],
            parent_domain: None,
            scope: Scope::global(),
        })
        .await
        .unwrap();
    assert_eq!(skill.keywords, vec!["calendar", "meeting"]);
}
