//! Tests for hierarchical search: skill matching, fallback equivalence,
//! tenant isolation, schema enrichment

use async_trait::async_trait;
use mcphub::config::{ClassifierSection, SearchSection, VectorSection};
use mcphub::core::{AssignmentSource, ItemKind, Scope, ToolSpec};
use mcphub::embed::{Embedder, HashEmbedder, KeywordClassifier};
use mcphub::internal::{LocalRegistry, LocalTool, ToolError};
use mcphub::protocol::ToolCallResult;
use mcphub::search::{SearchRequest, SearchService, SearchStrategy};
use mcphub::skills::{ClassificationService, CreateSkillRequest, SkillCatalog};
use mcphub::store::cache::LayerCache;
use mcphub::store::relational::RegistryStore;
use mcphub::store::vector::{MemoryVectorStore, VectorIndex};
use mcphub::store::MemoryObjectStore;
use mcphub::sync::{SyncJob, SyncPipeline};
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const DIM: usize = 256;

struct StaticTool(ToolSpec);

#[async_trait]
impl LocalTool for StaticTool {
    fn spec(&self) -> ToolSpec {
        self.0.clone()
    }

    async fn call(&self, _arguments: JsonValue) -> Result<ToolCallResult, ToolError> {
        Ok(ToolCallResult::text("ok"))
    }
}

struct Stack {
    db: Arc<RegistryStore>,
    catalog: SkillCatalog,
    pipeline: Arc<SyncPipeline>,
    jobs: mpsc::Receiver<SyncJob>,
    search: SearchService,
}

async fn stack() -> Stack {
    let db = Arc::new(RegistryStore::in_memory().await.unwrap());
    let store = Arc::new(MemoryVectorStore::new());
    let vectors = VectorIndex::new(store, &VectorSection::default());
    vectors.ensure_collections(DIM).await.unwrap();

    let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(DIM));
    let cache = Arc::new(LayerCache::new(1, Duration::from_secs(300)));

    let classifier = Arc::new(ClassificationService::new(
        Arc::clone(&db),
        vectors.clone(),
        Arc::new(KeywordClassifier),
        AssignmentSource::Heuristic,
        ClassifierSection::default(),
    ));

    let (pipeline, jobs) = SyncPipeline::new(
        Arc::clone(&db),
        vectors.clone(),
        Arc::clone(&cache),
        Arc::clone(&embedder),
        classifier,
        Arc::new(MemoryObjectStore::new()),
    );

    let catalog = SkillCatalog::new(
        Arc::clone(&db),
        vectors.clone(),
        Arc::clone(&embedder),
        Arc::clone(&cache),
    );

    let search = SearchService::new(
        Arc::clone(&db),
        vectors,
        embedder,
        cache,
        SearchSection::default(),
    );

    Stack {
        db,
        catalog,
        pipeline,
        jobs,
        search,
    }
}

async fn seed_calendar_catalog(stack: &mut Stack) {
    stack
        .catalog
        .create(CreateSkillRequest {
            id: "calendar-events".to_string(),
            name: "Calendar Events".to_string(),
            description: "Schedule a meeting, a calendar event, or a meeting invitation with attendees"
                .to_string(),
            keywords: vec!["calendar".to_string(), "meeting".to_string()],
            examples: vec![],
            parent_domain: None,
            scope: Scope::global(),
        })
        .await
        .unwrap();

    let local = LocalRegistry::new();
    local.register_tool(Arc::new(StaticTool(
        ToolSpec::new("create_event", "Create a calendar event and schedule a meeting")
            .with_schema(json!({
                "type": "object",
                "properties": {"title": {"type": "string"}},
            })),
    )));
    local.register_tool(Arc::new(StaticTool(ToolSpec::new(
        "send_meeting_invite",
        "Send a meeting invitation to schedule time with attendees",
    ))));
    local.register_tool(Arc::new(StaticTool(ToolSpec::new(
        "file_read",
        "Read the contents of a file from disk",
    ))));

    stack.pipeline.sync_internal(&local).await.unwrap();
    stack.pipeline.drain_jobs(&mut stack.jobs).await;
}

#[tokio::test]
async fn test_hierarchical_search_over_skilled_catalog() {
    let mut stack = stack().await;
    seed_calendar_catalog(&mut stack).await;

    let response = stack
        .search
        .search(&SearchRequest {
            query: "schedule a meeting".to_string(),
            item_type: Some(ItemKind::Tool),
            server_id: None,
            org_id: None,
            limit: Some(10),
            score_threshold: None,
            strategy: SearchStrategy::Hierarchical,
        })
        .await
        .unwrap();

    assert!(!response.metadata.fallback_used);
    let matched: Vec<&str> = response
        .metadata
        .skills_matched
        .iter()
        .map(|m| m.skill_id.as_str())
        .collect();
    assert_eq!(matched, vec!["calendar-events"]);

    let names: Vec<&str> = response.results.iter().map(|r| r.name.as_str()).collect();
    assert!(names.contains(&"create_event"), "got {names:?}");
    assert!(names.contains(&"send_meeting_invite"), "got {names:?}");
    assert!(!names.contains(&"file_read"));

    // Scores are normalized cosine similarity.
    for hit in &response.results {
        assert!((0.0..=1.0).contains(&hit.score));
    }

    // Stage three loaded schemas for the returned tools.
    let create_event = response
        .results
        .iter()
        .find(|r| r.name == "create_event")
        .unwrap();
    assert!(create_event.input_schema.is_some());
    assert_eq!(
        create_event.primary_skill_id.as_deref(),
        Some("calendar-events")
    );
}

#[tokio::test]
async fn test_fallback_matches_direct_search() {
    let mut stack = stack().await;
    seed_calendar_catalog(&mut stack).await;

    let base = SearchRequest {
        query: "quantum flux capacitor diagnostics".to_string(),
        item_type: Some(ItemKind::Tool),
        server_id: None,
        org_id: None,
        limit: Some(10),
        // No skill shares vocabulary with this query; accept anything stage
        // two returns so the comparison below is meaningful.
        score_threshold: Some(0.0),
        strategy: SearchStrategy::Hierarchical,
    };

    let hierarchical = stack.search.search(&base).await.unwrap();
    assert!(hierarchical.metadata.fallback_used);
    assert!(hierarchical.metadata.skills_matched.is_empty());

    let direct = stack
        .search
        .search(&SearchRequest {
            strategy: SearchStrategy::Direct,
            ..base
        })
        .await
        .unwrap();
    assert!(!direct.metadata.fallback_used);

    let fallback_names: Vec<&str> =
        hierarchical.results.iter().map(|r| r.name.as_str()).collect();
    let direct_names: Vec<&str> = direct.results.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(fallback_names, direct_names);
}

#[tokio::test]
async fn test_search_tenant_isolation() {
    let mut stack = stack().await;

    let local = LocalRegistry::new();
    local.register_tool(Arc::new(StaticTool(
        ToolSpec::new("report_a", "Generate the quarterly report")
            .with_scope(Scope::org("org-a")),
    )));
    local.register_tool(Arc::new(StaticTool(
        ToolSpec::new("report_b", "Generate the quarterly report")
            .with_scope(Scope::org("org-b")),
    )));
    local.register_tool(Arc::new(StaticTool(ToolSpec::new(
        "report_global",
        "Generate the quarterly report",
    ))));

    stack.pipeline.sync_internal(&local).await.unwrap();
    stack.pipeline.drain_jobs(&mut stack.jobs).await;

    let response = stack
        .search
        .search(&SearchRequest {
            query: "generate quarterly report".to_string(),
            item_type: Some(ItemKind::Tool),
            server_id: None,
            org_id: Some("org-a".to_string()),
            limit: Some(10),
            score_threshold: Some(0.0),
            strategy: SearchStrategy::Direct,
        })
        .await
        .unwrap();

    let names: Vec<&str> = response.results.iter().map(|r| r.name.as_str()).collect();
    assert!(names.contains(&"report_a"));
    assert!(names.contains(&"report_global"));
    assert!(!names.contains(&"report_b"), "org-b record leaked: {names:?}");
}

#[tokio::test]
async fn test_empty_query_rejected() {
    let stack = stack().await;
    let result = stack
        .search
        .search(&SearchRequest {
            query: "   ".to_string(),
            item_type: None,
            server_id: None,
            org_id: None,
            limit: None,
            score_threshold: None,
            strategy: SearchStrategy::Hierarchical,
        })
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_deactivated_skill_leaves_search_candidacy() {
    let mut stack = stack().await;
    seed_calendar_catalog(&mut stack).await;

    stack.catalog.deactivate("calendar-events", None).await.unwrap();

    let response = stack
        .search
        .search(&SearchRequest {
            query: "schedule a meeting".to_string(),
            item_type: Some(ItemKind::Tool),
            server_id: None,
            org_id: None,
            limit: Some(10),
            score_threshold: Some(0.0),
            strategy: SearchStrategy::Hierarchical,
        })
        .await
        .unwrap();

    // Stage one finds nothing, so the fallback path serves the query.
    assert!(response.metadata.fallback_used);
    assert!(response.metadata.skills_matched.is_empty());
    assert!(!response.results.is_empty());

    // Historical assignments survive deactivation.
    let tool = stack
        .db
        .get_tool_by_name("create_event", None)
        .await
        .unwrap()
        .unwrap();
    assert!(tool.skill_ids.contains(&"calendar-events".to_string()));
}
