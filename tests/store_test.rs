//! Tests for the relational registry store: scoped uniqueness, tenant
//! filtering, atomic deletes with counts, listing reconciliation

use chrono::Utc;
use mcphub::core::{
    AssignmentSource, ExternalServer, Scope, ServerStatus, SkillAssignment, SkillCategory,
    ToolSpec, TransportConfig, TransportKind,
};
use mcphub::store::relational::{RegistryStore, StoreError};
use serde_json::json;
use uuid::Uuid;

fn global_tool(name: &str) -> ToolSpec {
    ToolSpec::new(name, format!("{name} description"))
}

fn org_tool(name: &str, org: &str) -> ToolSpec {
    ToolSpec::new(name, format!("{name} description")).with_scope(Scope::org(org))
}

fn external_tool(server_id: Uuid, server_name: &str, original: &str) -> ToolSpec {
    let mut spec = ToolSpec::new(
        format!("{server_name}.{original}"),
        format!("{original} from {server_name}"),
    );
    spec.source_server_id = Some(server_id);
    spec.original_name = Some(original.to_string());
    spec
}

fn test_server(name: &str) -> ExternalServer {
    ExternalServer {
        id: Uuid::new_v4(),
        name: name.to_string(),
        transport: TransportKind::Sse,
        config: TransportConfig {
            url: Some("http://demo/sse".to_string()),
            ..Default::default()
        },
        health_check_url: None,
        status: ServerStatus::Registered,
        last_error: None,
        tool_count: 0,
        registered_at: Utc::now(),
        connected_at: None,
        last_health_check: None,
        org_id: None,
        is_global: true,
    }
}

#[tokio::test]
async fn test_global_name_uniqueness() {
    let db = RegistryStore::in_memory().await.unwrap();

    db.insert_tool(&global_tool("weather")).await.unwrap();
    let duplicate = db.insert_tool(&global_tool("weather")).await;
    assert!(matches!(duplicate, Err(StoreError::Conflict(_))));
}

#[tokio::test]
async fn test_global_and_org_names_coexist() {
    let db = RegistryStore::in_memory().await.unwrap();

    db.insert_tool(&global_tool("weather")).await.unwrap();
    db.insert_tool(&org_tool("weather", "org-a")).await.unwrap();
    db.insert_tool(&org_tool("weather", "org-b")).await.unwrap();

    // Same org twice conflicts.
    let duplicate = db.insert_tool(&org_tool("weather", "org-a")).await;
    assert!(matches!(duplicate, Err(StoreError::Conflict(_))));

    // Org record wins resolution for its own org.
    let resolved = db.get_tool_by_name("weather", Some("org-a")).await.unwrap().unwrap();
    assert_eq!(resolved.org_id.as_deref(), Some("org-a"));

    // Anonymous callers resolve the global one.
    let resolved = db.get_tool_by_name("weather", None).await.unwrap().unwrap();
    assert!(resolved.is_global);
}

#[tokio::test]
async fn test_tenant_isolation_in_listings() {
    let db = RegistryStore::in_memory().await.unwrap();

    db.insert_tool(&global_tool("shared")).await.unwrap();
    db.insert_tool(&org_tool("private-a", "org-a")).await.unwrap();
    db.insert_tool(&org_tool("private-b", "org-b")).await.unwrap();

    let for_a = db.list_tools(Some("org-a"), false).await.unwrap();
    let names: Vec<&str> = for_a.iter().map(|t| t.name.as_str()).collect();
    assert!(names.contains(&"shared"));
    assert!(names.contains(&"private-a"));
    assert!(!names.contains(&"private-b"));

    // No record from another org may leak, ever.
    assert!(for_a
        .iter()
        .all(|t| t.is_global || t.org_id.as_deref() == Some("org-a")));
}

#[tokio::test]
async fn test_upsert_reports_text_changes() {
    let db = RegistryStore::in_memory().await.unwrap();

    let (first, changed) = db.upsert_tool(&global_tool("echo")).await.unwrap();
    assert!(changed);

    // Same spec again: no change.
    let (second, changed) = db.upsert_tool(&global_tool("echo")).await.unwrap();
    assert!(!changed);
    assert_eq!(first.id, second.id);

    // New description: text changed.
    let mut spec = global_tool("echo");
    spec.description = "echo with a new description".to_string();
    let (third, changed) = db.upsert_tool(&spec).await.unwrap();
    assert!(changed);
    assert_eq!(first.id, third.id);
}

#[tokio::test]
async fn test_delete_tools_by_server_counts() {
    let db = RegistryStore::in_memory().await.unwrap();
    let server = test_server("demo");
    db.insert_server(&server).await.unwrap();

    for original in ["alpha", "beta", "gamma"] {
        db.insert_tool(&external_tool(server.id, "demo", original))
            .await
            .unwrap();
    }
    db.insert_tool(&global_tool("internal")).await.unwrap();

    let deleted = db.delete_tools_by_server(server.id).await.unwrap();
    assert_eq!(deleted.len(), 3);

    let remaining = db.list_tools(None, true).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].name, "internal");

    // Second delete finds nothing.
    let deleted = db.delete_tools_by_server(server.id).await.unwrap();
    assert!(deleted.is_empty());
}

#[tokio::test]
async fn test_classification_write_is_consistent() {
    let db = RegistryStore::in_memory().await.unwrap();
    let tool = db.insert_tool(&global_tool("create_event")).await.unwrap();

    let now = Utc::now();
    let assignments = vec![
        SkillAssignment {
            tool_id: tool.id,
            skill_id: "calendar-events".to_string(),
            confidence: 0.9,
            is_primary: true,
            source: AssignmentSource::Llm,
            created_at: now,
        },
        SkillAssignment {
            tool_id: tool.id,
            skill_id: "scheduling".to_string(),
            confidence: 0.6,
            is_primary: false,
            source: AssignmentSource::Llm,
            created_at: now,
        },
    ];
    db.set_tool_classification(
        tool.id,
        &["calendar-events".to_string(), "scheduling".to_string()],
        Some("calendar-events"),
        &assignments,
        AssignmentSource::Llm,
    )
    .await
    .unwrap();

    let updated = db.get_tool(tool.id).await.unwrap().unwrap();
    assert!(updated.is_classified);
    assert_eq!(updated.primary_skill_id.as_deref(), Some("calendar-events"));
    assert!(updated
        .skill_ids
        .contains(&updated.primary_skill_id.clone().unwrap()));

    let rows = db.assignments_for_tool(tool.id).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows.iter().filter(|a| a.is_primary).count(), 1);

    // Reclassification replaces the llm rows instead of accumulating.
    let assignments = vec![SkillAssignment {
        tool_id: tool.id,
        skill_id: "scheduling".to_string(),
        confidence: 0.7,
        is_primary: true,
        source: AssignmentSource::Llm,
        created_at: now,
    }];
    db.set_tool_classification(
        tool.id,
        &["scheduling".to_string()],
        Some("scheduling"),
        &assignments,
        AssignmentSource::Llm,
    )
    .await
    .unwrap();

    let rows = db.assignments_for_tool(tool.id).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].skill_id, "scheduling");
}

#[tokio::test]
async fn test_skill_scoped_uniqueness() {
    let db = RegistryStore::in_memory().await.unwrap();
    let now = Utc::now();

    let skill = SkillCategory {
        id: "calendar-events".to_string(),
        name: "Calendar Events".to_string(),
        description: "Scheduling and calendar management".to_string(),
        keywords: vec!["calendar".to_string(), "meeting".to_string()],
        examples: vec![],
        parent_domain: None,
        tool_count: 0,
        org_id: None,
        is_global: true,
        is_active: true,
        created_at: now,
        updated_at: now,
    };
    db.insert_skill(&skill).await.unwrap();
    assert!(matches!(
        db.insert_skill(&skill).await,
        Err(StoreError::Conflict(_))
    ));

    // Org-scoped skill with the same id coexists with the global one.
    let org_skill = SkillCategory {
        org_id: Some("org-a".to_string()),
        is_global: false,
        ..skill.clone()
    };
    db.insert_skill(&org_skill).await.unwrap();

    let resolved = db.get_skill("calendar-events", Some("org-a")).await.unwrap().unwrap();
    assert_eq!(resolved.org_id.as_deref(), Some("org-a"));
}

#[tokio::test]
async fn test_apply_remote_listing_reconciles() {
    let db = RegistryStore::in_memory().await.unwrap();
    let server = test_server("demo");
    db.insert_server(&server).await.unwrap();

    let specs: Vec<ToolSpec> = ["alpha", "beta", "gamma"]
        .iter()
        .map(|o| external_tool(server.id, "demo", o))
        .collect();

    let delta = db
        .apply_remote_listing(server.id, &specs, &[], &[])
        .await
        .unwrap();
    assert_eq!(delta.tools.upserted.len(), 3);
    assert!(delta.tools.deleted_ids.is_empty());

    // Idempotent: same listing again is a no-op.
    let delta = db
        .apply_remote_listing(server.id, &specs, &[], &[])
        .await
        .unwrap();
    assert!(delta.tools.upserted.is_empty());
    assert!(delta.tools.deleted_ids.is_empty());

    // Drop gamma, change beta, add delta.
    let mut next: Vec<ToolSpec> = vec![
        external_tool(server.id, "demo", "alpha"),
        external_tool(server.id, "demo", "beta"),
        external_tool(server.id, "demo", "delta"),
    ];
    next[1].description = "beta reworked".to_string();

    let delta = db
        .apply_remote_listing(server.id, &next, &[], &[])
        .await
        .unwrap();
    assert_eq!(delta.tools.upserted.len(), 2);
    assert_eq!(delta.tools.deleted_ids.len(), 1);

    let tools = db.list_tools_by_server(server.id).await.unwrap();
    let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["demo.alpha", "demo.beta", "demo.delta"]);
}

#[tokio::test]
async fn test_server_crud_and_status() {
    let db = RegistryStore::in_memory().await.unwrap();
    let server = test_server("demo");
    db.insert_server(&server).await.unwrap();

    // Names are unique.
    let mut other = test_server("demo");
    other.id = Uuid::new_v4();
    assert!(matches!(
        db.insert_server(&other).await,
        Err(StoreError::Conflict(_))
    ));

    db.update_server_status(server.id, ServerStatus::Connected, None)
        .await
        .unwrap();
    let loaded = db.get_server(server.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, ServerStatus::Connected);
    assert!(loaded.connected_at.is_some());

    db.update_server_status(server.id, ServerStatus::Error, Some("boom"))
        .await
        .unwrap();
    let loaded = db.get_server(server.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, ServerStatus::Error);
    assert_eq!(loaded.last_error.as_deref(), Some("boom"));

    assert!(db.delete_server(server.id).await.unwrap());
    assert!(db.get_server(server.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_deactivate_internal_tools_except() {
    let db = RegistryStore::in_memory().await.unwrap();

    db.insert_tool(&global_tool("keep")).await.unwrap();
    db.insert_tool(&global_tool("drop")).await.unwrap();

    let deactivated = db
        .deactivate_internal_tools_except(&["keep".to_string()])
        .await
        .unwrap();
    assert_eq!(deactivated, 1);

    let active = db.list_tools(None, false).await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].name, "keep");

    // Annotations survive; the record is only inactive, not gone.
    let all = db.list_tools(None, true).await.unwrap();
    assert_eq!(all.len(), 2);
}

#[test]
fn test_resource_body_keys_are_flat() {
    use mcphub::store::resource_body_key;

    let key = resource_body_key("mcphub://docs/guide");
    assert!(!key.contains('/'));
    assert!(!key.contains(':'));
    // Distinct uris never collapse onto the same key by accident.
    assert_ne!(key, resource_body_key("mcphub://docs/faq"));
    // Deterministic, so writer and reader agree.
    assert_eq!(key, resource_body_key("mcphub://docs/guide"));
}

#[tokio::test]
async fn test_object_store_roundtrip() {
    use mcphub::store::{FsObjectStore, ObjectStore};

    let temp = tempfile::TempDir::new().unwrap();
    let store = FsObjectStore::new(temp.path()).unwrap();

    store.put("guide.md", b"# hello".to_vec()).await.unwrap();
    assert_eq!(store.get("guide.md").await.unwrap(), b"# hello");

    store.put("guide.html", b"<h1>hello</h1>".to_vec()).await.unwrap();
    let keys = store.list("guide").await.unwrap();
    assert_eq!(keys, vec!["guide.html", "guide.md"]);

    assert!(store.delete("guide.md").await.unwrap());
    assert!(!store.delete("guide.md").await.unwrap());
    assert!(store.get("guide.md").await.is_err());

    // Path traversal is rejected outright.
    assert!(store.get("../escape").await.is_err());
}

#[tokio::test]
async fn test_input_schema_roundtrip() {
    let db = RegistryStore::in_memory().await.unwrap();

    let schema = json!({
        "type": "object",
        "properties": {"message": {"type": "string"}},
        "required": ["message"]
    });
    let spec = global_tool("echo").with_schema(schema.clone());
    let record = db.insert_tool(&spec).await.unwrap();
    assert_eq!(record.input_schema, schema);
}
