//! Tests for the request router: local dispatch, argument validation,
//! security gating, unavailable backends

use mcphub::aggregator::router::{RequestRouter, RouteError};
use mcphub::aggregator::session::SessionManager;
use mcphub::auth::AuthContext;
use mcphub::config::AggregatorSection;
use mcphub::core::ToolSpec;
use mcphub::hil::HilService;
use mcphub::internal::{register_builtin_modules, LocalRegistry};
use mcphub::protocol::ContentItem;
use mcphub::store::relational::RegistryStore;
use mcphub::store::{resource_body_key, MemoryObjectStore, ObjectStore};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

struct Stack {
    db: Arc<RegistryStore>,
    hil: Arc<HilService>,
    router: RequestRouter,
    local: Arc<LocalRegistry>,
}

async fn stack() -> Stack {
    let db = Arc::new(RegistryStore::in_memory().await.unwrap());
    let local = Arc::new(LocalRegistry::new());
    register_builtin_modules(
        &local,
        &["echo".to_string(), "shell".to_string(), "docs".to_string()],
    );

    // Mirror the local registry into the stores the way startup does.
    let objects: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new());
    for spec in local.tool_specs() {
        db.upsert_tool(&spec).await.unwrap();
    }
    for spec in local.prompt_specs() {
        db.upsert_prompt(&spec).await.unwrap();
    }
    for spec in local.resource_specs() {
        db.upsert_resource(&spec).await.unwrap();
        if let Some(body) = local.resource_body(&spec.uri) {
            objects
                .put(&resource_body_key(&spec.uri), body.into_bytes())
                .await
                .unwrap();
        }
    }

    let sessions = Arc::new(SessionManager::new(AggregatorSection::default()));
    let hil = Arc::new(HilService::new(Duration::from_secs(600)));
    let router = RequestRouter::new(
        Arc::clone(&db),
        Arc::clone(&local),
        sessions,
        Arc::clone(&hil),
        objects,
        AggregatorSection::default(),
    );

    Stack {
        db,
        hil,
        router,
        local,
    }
}

fn caller() -> AuthContext {
    AuthContext {
        user_id: "tester".to_string(),
        authorized_orgs: vec![],
        active_org: None,
        is_anonymous: false,
    }
}

fn text_of(result: &mcphub::protocol::ToolCallResult) -> String {
    result
        .content
        .iter()
        .map(|c| match c {
            ContentItem::Text { text } => text.clone(),
            _ => String::new(),
        })
        .collect()
}

#[tokio::test]
async fn test_local_dispatch_with_routing_metadata() {
    let stack = stack().await;

    let result = stack
        .router
        .call_tool(&caller(), "echo", json!({"message": "hello"}))
        .await
        .unwrap();

    assert!(!result.is_error);
    assert_eq!(text_of(&result), "hello");

    let routing = result
        .structured_content
        .as_ref()
        .and_then(|v| v.get("routing"))
        .expect("routing metadata attached");
    assert_eq!(routing.get("routed_to").unwrap(), "internal");
    assert!(routing.get("routing_time_ms").is_some());
    assert!(routing.get("execution_time_ms").is_some());
}

#[tokio::test]
async fn test_unknown_tool() {
    let stack = stack().await;
    let result = stack.router.call_tool(&caller(), "nope", json!({})).await;
    assert!(matches!(result, Err(RouteError::ToolNotFound(_))));
}

#[tokio::test]
async fn test_schema_validation_rejects_bad_arguments() {
    let stack = stack().await;

    // "message" is required by the echo schema.
    let result = stack.router.call_tool(&caller(), "echo", json!({})).await;
    assert!(matches!(result, Err(RouteError::InvalidParams(_))));
}

#[tokio::test]
async fn test_dotted_name_without_live_server_is_unavailable() {
    let stack = stack().await;

    // A record owned by a server that no longer exists.
    let mut spec = ToolSpec::new("ghost.probe", "Probe from a vanished backend");
    spec.source_server_id = Some(Uuid::new_v4());
    spec.original_name = Some("probe".to_string());
    stack.db.insert_tool(&spec).await.unwrap();

    let result = stack
        .router
        .call_tool(&caller(), "ghost.probe", json!({}))
        .await;
    assert!(matches!(result, Err(RouteError::ServerUnavailable(_))));
}

#[tokio::test]
async fn test_high_security_tool_requires_grant() {
    let stack = stack().await;
    let args = json!({"command": "echo gated"});

    // First call parks an authorization request.
    let request = match stack
        .router
        .call_tool(&caller(), "bash_execute", args.clone())
        .await
    {
        Err(RouteError::AuthorizationRequired(request)) => request,
        other => panic!("expected authorization gate, got {other:?}"),
    };
    assert_eq!(request.tool_name, "bash_execute");

    // Retrying before the decision returns the same request.
    match stack
        .router
        .call_tool(&caller(), "bash_execute", args.clone())
        .await
    {
        Err(RouteError::AuthorizationRequired(again)) => assert_eq!(again.id, request.id),
        other => panic!("expected authorization gate, got {other:?}"),
    }

    // Approval lets the identical call through.
    stack.hil.decide(&request.id, "approve", None).unwrap();
    let result = stack
        .router
        .call_tool(&caller(), "bash_execute", args)
        .await
        .unwrap();
    assert!(!result.is_error);
    assert!(text_of(&result).contains("gated"));
}

#[tokio::test]
async fn test_rejected_grant_surfaces_then_reissues() {
    let stack = stack().await;
    let args = json!({"command": "echo denied"});

    let request = match stack
        .router
        .call_tool(&caller(), "bash_execute", args.clone())
        .await
    {
        Err(RouteError::AuthorizationRequired(request)) => request,
        other => panic!("expected authorization gate, got {other:?}"),
    };
    stack.hil.decide(&request.id, "reject", None).unwrap();

    match stack
        .router
        .call_tool(&caller(), "bash_execute", args.clone())
        .await
    {
        Err(RouteError::AuthorizationRejected(rejected)) => assert_eq!(rejected.id, request.id),
        other => panic!("expected rejection, got {other:?}"),
    }

    // The next attempt opens a fresh request.
    match stack.router.call_tool(&caller(), "bash_execute", args).await {
        Err(RouteError::AuthorizationRequired(fresh)) => assert_ne!(fresh.id, request.id),
        other => panic!("expected authorization gate, got {other:?}"),
    }
}

#[tokio::test]
async fn test_prompt_render_and_resource_read() {
    let stack = stack().await;

    let prompt = stack
        .router
        .get_prompt(&caller(), "summarize", json!({"text": "four score and seven"}))
        .await
        .unwrap();
    let rendered = prompt["messages"][0]["content"]["text"].as_str().unwrap();
    assert!(rendered.contains("four score and seven"));

    let unknown = stack.router.get_prompt(&caller(), "nope", json!({})).await;
    assert!(matches!(unknown, Err(RouteError::PromptNotFound(_))));

    let uri = stack.local.resource_specs()[0].uri.clone();
    let read = stack.router.read_resource(&caller(), &uri).await.unwrap();
    assert!(read["contents"][0]["text"].as_str().unwrap().contains("mcphub"));

    let unknown = stack.router.read_resource(&caller(), "mcphub://nope").await;
    assert!(matches!(unknown, Err(RouteError::ResourceNotFound(_))));
}
