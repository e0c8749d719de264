//! Tests for the sync pipeline: external reconciliation, idempotency,
//! internal deactivation, vector upkeep

use async_trait::async_trait;
use chrono::Utc;
use mcphub::config::{ClassifierSection, VectorSection};
use mcphub::core::{
    AssignmentSource, ExternalServer, ItemKind, ServerStatus, ToolSpec, TransportConfig,
    TransportKind,
};
use mcphub::embed::{Embedder, HashEmbedder, KeywordClassifier};
use mcphub::internal::{LocalRegistry, LocalTool, ToolError};
use mcphub::protocol::{RemoteListing, ToolCallResult, WirePrompt, WireTool};
use mcphub::skills::ClassificationService;
use mcphub::store::cache::LayerCache;
use mcphub::store::relational::RegistryStore;
use mcphub::store::vector::{kind_collection, MemoryVectorStore, VectorIndex};
use mcphub::store::MemoryObjectStore;
use mcphub::store::VectorStore;
use mcphub::sync::{SyncJob, SyncPipeline};
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

const DIM: usize = 64;

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
    store: Arc<MemoryVectorStore>,
    pipeline: Arc<SyncPipeline>,
    jobs: mpsc::Receiver<SyncJob>,
}

async fn stack() -> Stack {
    let db = Arc::new(RegistryStore::in_memory().await.unwrap());
    let store = Arc::new(MemoryVectorStore::new());
    let vectors = VectorIndex::new(store.clone(), &VectorSection::default());
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
        vectors,
        cache,
        embedder,
        classifier,
        Arc::new(MemoryObjectStore::new()),
    );

    Stack {
        db,
        store,
        pipeline,
        jobs,
    }
}

async fn demo_server(db: &RegistryStore) -> ExternalServer {
    let server = ExternalServer {
        id: Uuid::new_v4(),
        name: "demo".to_string(),
        transport: TransportKind::Sse,
        config: TransportConfig {
            url: Some("http://demo/sse".to_string()),
            ..Default::default()
        },
        health_check_url: None,
        status: ServerStatus::Connected,
        last_error: None,
        tool_count: 0,
        registered_at: Utc::now(),
        connected_at: Some(Utc::now()),
        last_health_check: None,
        org_id: None,
        is_global: true,
    };
    db.insert_server(&server).await.unwrap();
    server
}

fn wire_tool(name: &str, description: &str) -> WireTool {
    WireTool {
        name: name.to_string(),
        description: Some(description.to_string()),
        input_schema: json!({"type": "object"}),
        annotations: None,
    }
}

fn demo_listing() -> RemoteListing {
    RemoteListing {
        tools: vec![
            wire_tool("alpha", "The alpha capability"),
            wire_tool("beta", "The beta capability"),
            wire_tool("gamma", "The gamma capability"),
        ],
        prompts: vec![WirePrompt {
            name: "briefing".to_string(),
            description: Some("Daily briefing prompt".to_string()),
            arguments: json!([]),
        }],
        resources: vec![],
    }
}

#[tokio::test]
async fn test_external_sync_namespaces_and_counts() {
    let mut stack = stack().await;
    let server = demo_server(&stack.db).await;

    let report = stack
        .pipeline
        .sync_external(&server, &demo_listing())
        .await
        .unwrap();
    assert_eq!(report.tools_upserted, 3);
    assert_eq!(report.prompts_upserted, 1);
    assert_eq!(report.deleted, 0);

    let tools = stack.db.list_tools_by_server(server.id).await.unwrap();
    let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["demo.alpha", "demo.beta", "demo.gamma"]);
    for tool in &tools {
        assert_eq!(tool.source_server_id, Some(server.id));
        assert!(tool.original_name.is_some());
    }

    // Denormalized counter reflects the listing.
    let loaded = stack.db.get_server(server.id).await.unwrap().unwrap();
    assert_eq!(loaded.tool_count, 3);

    // Deferred jobs materialize vector points.
    stack.pipeline.drain_jobs(&mut stack.jobs).await;
    assert_eq!(
        stack
            .store
            .count(kind_collection(ItemKind::Tool))
            .await
            .unwrap(),
        3
    );
}

#[tokio::test]
async fn test_external_sync_is_idempotent() {
    let mut stack = stack().await;
    let server = demo_server(&stack.db).await;

    stack
        .pipeline
        .sync_external(&server, &demo_listing())
        .await
        .unwrap();
    stack.pipeline.drain_jobs(&mut stack.jobs).await;

    // The same listing again changes nothing.
    let report = stack
        .pipeline
        .sync_external(&server, &demo_listing())
        .await
        .unwrap();
    assert_eq!(report.tools_upserted, 0);
    assert_eq!(report.deleted, 0);

    let tools = stack.db.list_tools_by_server(server.id).await.unwrap();
    assert_eq!(tools.len(), 3);
}

#[tokio::test]
async fn test_external_sync_propagates_deletions() {
    let mut stack = stack().await;
    let server = demo_server(&stack.db).await;

    stack
        .pipeline
        .sync_external(&server, &demo_listing())
        .await
        .unwrap();
    stack.pipeline.drain_jobs(&mut stack.jobs).await;

    // gamma disappears upstream, beta changes description.
    let next = RemoteListing {
        tools: vec![
            wire_tool("alpha", "The alpha capability"),
            wire_tool("beta", "The beta capability, reworked"),
        ],
        prompts: vec![],
        resources: vec![],
    };
    let report = stack.pipeline.sync_external(&server, &next).await.unwrap();
    assert_eq!(report.deleted, 2); // gamma tool + briefing prompt
    assert_eq!(report.tools_upserted, 1); // beta update

    stack.pipeline.drain_jobs(&mut stack.jobs).await;

    let tools = stack.db.list_tools_by_server(server.id).await.unwrap();
    let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["demo.alpha", "demo.beta"]);

    // Stale vector points went away with the rows.
    assert_eq!(
        stack
            .store
            .count(kind_collection(ItemKind::Tool))
            .await
            .unwrap(),
        2
    );
}

#[tokio::test]
async fn test_internal_sync_deactivates_unseen() {
    let mut stack = stack().await;

    let local = LocalRegistry::new();
    local.register_tool(Arc::new(StaticTool(ToolSpec::new("one", "First tool"))));
    local.register_tool(Arc::new(StaticTool(ToolSpec::new("two", "Second tool"))));
    stack.pipeline.sync_internal(&local).await.unwrap();
    stack.pipeline.drain_jobs(&mut stack.jobs).await;

    assert_eq!(stack.db.list_tools(None, false).await.unwrap().len(), 2);

    // A later scan without "two" retires it without deleting history.
    let local = LocalRegistry::new();
    local.register_tool(Arc::new(StaticTool(ToolSpec::new("one", "First tool"))));
    let report = stack.pipeline.sync_internal(&local).await.unwrap();
    assert_eq!(report.deactivated, 1);

    let active = stack.db.list_tools(None, false).await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].name, "one");
    assert_eq!(stack.db.list_tools(None, true).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_internal_sync_rerun_is_stable() {
    let mut stack = stack().await;

    let local = LocalRegistry::new();
    local.register_tool(Arc::new(StaticTool(ToolSpec::new("one", "First tool"))));
    stack.pipeline.sync_internal(&local).await.unwrap();
    stack.pipeline.drain_jobs(&mut stack.jobs).await;

    // Re-running the same scan schedules no further work.
    let report = stack.pipeline.sync_internal(&local).await.unwrap();
    assert_eq!(report.jobs_scheduled, 0);
    assert_eq!(report.deactivated, 0);
}
