//! End-to-end tests over the HTTP surface: MCP endpoint, search, aggregator
//! REST, authorization gating, progress streaming

use mcphub::aggregator::{HealthMonitor, RequestRouter, ServerRegistry, SessionManager};
use mcphub::auth::Authenticator;
use mcphub::config::AppConfig;
use mcphub::core::AssignmentSource;
use mcphub::embed::{Embedder, HashEmbedder, KeywordClassifier};
use mcphub::hil::HilService;
use mcphub::http::{build_router, AppState};
use mcphub::internal::{register_builtin_modules, LocalRegistry};
use mcphub::progress::ProgressService;
use mcphub::search::SearchService;
use mcphub::skills::{ClassificationService, SkillCatalog};
use mcphub::store::{
    LayerCache, MemoryObjectStore, MemoryVectorStore, ObjectStore, RegistryStore, VectorIndex,
};
use mcphub::sync::SyncPipeline;
use serde_json::{json, Value as JsonValue};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const DIM: usize = 64;

async fn spawn_server() -> (SocketAddr, AppState) {
    let mut config = AppConfig::default();
    config.embedding.dim = DIM;

    let db = Arc::new(RegistryStore::in_memory().await.unwrap());
    let cache = Arc::new(LayerCache::new(1, Duration::from_secs(300)));
    let vectors = VectorIndex::new(Arc::new(MemoryVectorStore::new()), &config.vector);
    vectors.ensure_collections(DIM).await.unwrap();
    let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(DIM));

    let objects: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new());
    let classifier = Arc::new(ClassificationService::new(
        Arc::clone(&db),
        vectors.clone(),
        Arc::new(KeywordClassifier),
        AssignmentSource::Heuristic,
        config.classifier.clone(),
    ));
    let (sync, mut jobs_rx) = SyncPipeline::new(
        Arc::clone(&db),
        vectors.clone(),
        Arc::clone(&cache),
        Arc::clone(&embedder),
        classifier,
        Arc::clone(&objects),
    );

    let local = Arc::new(LocalRegistry::new());
    register_builtin_modules(&local, &config.internal_modules);
    sync.sync_internal(&local).await.unwrap();
    sync.drain_jobs(&mut jobs_rx).await;

    let shutdown = CancellationToken::new();
    let sessions = Arc::new(SessionManager::new(config.aggregator.clone()));
    let health = Arc::new(HealthMonitor::new(
        Arc::clone(&db),
        Arc::clone(&sessions),
        config.aggregator.clone(),
    ));
    let progress = Arc::new(ProgressService::new());
    let servers = Arc::new(ServerRegistry::new(
        Arc::clone(&db),
        vectors.clone(),
        Arc::clone(&cache),
        Arc::clone(&sessions),
        Arc::clone(&sync),
        health,
        Arc::clone(&progress),
        shutdown,
    ));

    let hil = Arc::new(HilService::new(Duration::from_secs(600)));
    let router = Arc::new(RequestRouter::new(
        Arc::clone(&db),
        Arc::clone(&local),
        Arc::clone(&sessions),
        Arc::clone(&hil),
        Arc::clone(&objects),
        config.aggregator.clone(),
    ));
    let catalog = Arc::new(SkillCatalog::new(
        Arc::clone(&db),
        vectors.clone(),
        Arc::clone(&embedder),
        Arc::clone(&cache),
    ));
    let search = Arc::new(SearchService::new(
        Arc::clone(&db),
        vectors,
        embedder,
        Arc::clone(&cache),
        config.search.clone(),
    ));

    let state = AppState {
        config: Arc::new(config),
        db,
        cache,
        search,
        catalog,
        servers,
        router,
        hil,
        progress,
        auth: Arc::new(Authenticator::from_config(&Default::default())),
    };

    let app = build_router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, state)
}

async fn rpc(client: &reqwest::Client, addr: SocketAddr, method: &str, params: JsonValue) -> JsonValue {
    client
        .post(format!("http://{addr}/mcp"))
        .json(&json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_health_reports_capabilities() {
    let (addr, _state) = spawn_server().await;
    let client = reqwest::Client::new();

    let body: JsonValue = client
        .get(format!("http://{addr}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["status"], "healthy");
    assert!(body["capabilities"]["tools"].as_i64().unwrap() >= 3);
    assert!(body["capabilities"]["resources"].as_i64().unwrap() >= 1);
}

#[tokio::test]
async fn test_mcp_list_and_call() {
    let (addr, _state) = spawn_server().await;
    let client = reqwest::Client::new();

    let response = rpc(&client, addr, "tools/list", json!({})).await;
    let tools = response["result"]["tools"].as_array().unwrap();
    let names: Vec<&str> = tools.iter().map(|t| t["name"].as_str().unwrap()).collect();
    assert!(names.contains(&"echo"));
    assert!(names.contains(&"bash_execute"));

    let response = rpc(
        &client,
        addr,
        "tools/call",
        json!({"name": "echo", "arguments": {"message": "over http"}}),
    )
    .await;
    let content = response["result"]["content"][0]["text"].as_str().unwrap();
    assert_eq!(content, "over http");

    // Internal resource bodies come back from the object store.
    let response = rpc(
        &client,
        addr,
        "resources/read",
        json!({"uri": "mcphub://docs/guide"}),
    )
    .await;
    let text = response["result"]["contents"][0]["text"].as_str().unwrap();
    assert!(text.contains("mcphub"));

    // Unknown methods get the standard code.
    let response = rpc(&client, addr, "wat/now", json!({})).await;
    assert_eq!(response["error"]["code"], -32601);

    // Malformed params get invalid-params.
    let response = rpc(&client, addr, "tools/call", json!({})).await;
    assert_eq!(response["error"]["code"], -32602);
}

#[tokio::test]
async fn test_high_security_flow_over_http() {
    let (addr, _state) = spawn_server().await;
    let client = reqwest::Client::new();
    let call = json!({"name": "bash_execute", "arguments": {"command": "echo from-http"}});

    // Gated: AUTHORIZATION_REQUIRED with a request id.
    let response = rpc(&client, addr, "tools/call", call.clone()).await;
    assert_eq!(response["error"]["code"], -32002);
    let request_id = response["error"]["data"]["request_id"].as_str().unwrap().to_string();

    // Approve through the REST surface.
    let approved: JsonValue = client
        .post(format!("http://{addr}/api/v1/hil/{request_id}/approve"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(approved["request"]["state"], "approved");

    // The identical retry now executes.
    let response = rpc(&client, addr, "tools/call", call).await;
    let text = response["result"]["content"][0]["text"].as_str().unwrap();
    assert!(text.contains("from-http"));
}

#[tokio::test]
async fn test_search_endpoint() {
    let (addr, _state) = spawn_server().await;
    let client = reqwest::Client::new();

    let body: JsonValue = client
        .post(format!("http://{addr}/search"))
        .json(&json!({
            "query": "execute a shell command",
            "type": "tool",
            "score_threshold": 0.0,
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert!(body["results"].is_array());
    assert!(body["metadata"]["latency_ms"].is_number());
    // No skills exist yet, so the direct fallback serves the query.
    assert_eq!(body["metadata"]["fallback_used"], true);
}

#[tokio::test]
async fn test_aggregator_rest_register_and_list() {
    let (addr, _state) = spawn_server().await;
    let client = reqwest::Client::new();

    let created: JsonValue = client
        .post(format!("http://{addr}/api/v1/aggregator/servers"))
        .json(&json!({
            "name": "demo",
            "transport": "sse",
            "url": "http://demo/sse",
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(created["name"], "demo");
    assert_eq!(created["status"], "REGISTERED");

    // Duplicate names conflict.
    let status = client
        .post(format!("http://{addr}/api/v1/aggregator/servers"))
        .json(&json!({
            "name": "demo",
            "transport": "sse",
            "url": "http://demo/sse",
        }))
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, reqwest::StatusCode::CONFLICT);

    let listed: JsonValue = client
        .get(format!("http://{addr}/api/v1/aggregator/servers"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed["servers"].as_array().unwrap().len(), 1);

    // Invalid specs are rejected up front.
    let status = client
        .post(format!("http://{addr}/api/v1/aggregator/servers"))
        .json(&json!({"name": "Bad Name", "transport": "sse", "url": "http://x/sse"}))
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_server_removal_cascades() {
    use mcphub::core::ToolSpec;

    let (addr, state) = spawn_server().await;
    let client = reqwest::Client::new();

    let created: JsonValue = client
        .post(format!("http://{addr}/api/v1/aggregator/servers"))
        .json(&json!({
            "name": "demo",
            "transport": "sse",
            "url": "http://demo/sse",
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let server_id: uuid::Uuid = created["id"].as_str().unwrap().parse().unwrap();

    // Seed what a completed discovery would have left behind.
    for original in ["alpha", "beta", "gamma"] {
        let mut spec = ToolSpec::new(format!("demo.{original}"), format!("{original} tool"));
        spec.source_server_id = Some(server_id);
        spec.original_name = Some(original.to_string());
        state.db.insert_tool(&spec).await.unwrap();
    }

    let removed: JsonValue = client
        .delete(format!("http://{addr}/api/v1/aggregator/servers/{server_id}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(removed["removed_tools"], 3);

    // Listings show none of the server's tools afterwards.
    let response = rpc(&client, addr, "tools/list", json!({})).await;
    let tools = response["result"]["tools"].as_array().unwrap();
    assert!(tools
        .iter()
        .all(|t| !t["name"].as_str().unwrap().starts_with("demo.")));

    // The record itself is gone too.
    let status = client
        .get(format!("http://{addr}/api/v1/aggregator/servers/{server_id}"))
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_skills_rest_roundtrip() {
    let (addr, _state) = spawn_server().await;
    let client = reqwest::Client::new();

    let created: JsonValue = client
        .post(format!("http://{addr}/api/v1/skills"))
        .json(&json!({
            "id": "calendar-events",
            "name": "Calendar Events",
            "description": "Scheduling and calendar management",
            "keywords": ["Calendar", "meeting"],
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(created["id"], "calendar-events");
    assert_eq!(created["keywords"], json!(["calendar", "meeting"]));

    let fetched: JsonValue = client
        .get(format!("http://{addr}/api/v1/skills/calendar-events"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(fetched["name"], "Calendar Events");

    let disabled: JsonValue = client
        .post(format!("http://{addr}/api/v1/skills/calendar-events/disable"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(disabled["is_active"], false);
}

#[tokio::test]
async fn test_progress_stream_emits_done() {
    let (addr, state) = spawn_server().await;
    let client = reqwest::Client::new();

    let operation = state.progress.start("reindex", None);
    let id = operation.id;

    let progress = Arc::clone(&state.progress);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        progress.update(id, 50.0, "halfway").unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        progress.complete(id, None).unwrap();
    });

    // The response body ends when the channel closes after the terminal
    // event.
    let body = client
        .get(format!("http://{addr}/progress/{id}/stream"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    assert!(body.contains("event: progress"));
    assert!(body.contains("event: done"));
    assert!(body.contains("completed"));

    // Unknown operations 404.
    let status = client
        .get(format!(
            "http://{addr}/progress/{}/stream",
            uuid::Uuid::new_v4()
        ))
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, reqwest::StatusCode::NOT_FOUND);
}
