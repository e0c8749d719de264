//! HTTP surface
//!
//! - `POST /mcp`: MCP JSON-RPC 2.0 with `Accept` negotiation (plain JSON or
//!   an SSE-framed response)
//! - `GET /health`: capability counts
//! - `POST /search`: hierarchical discovery
//! - `GET /progress/{id}/stream`: SSE progress events
//! - `/api/v1/aggregator/*`: external server lifecycle
//! - `/api/v1/skills/*`: skill taxonomy CRUD
//! - `/api/v1/hil/*`: human-in-the-loop decisions

use crate::auth::{AuthContext, AuthError, Authenticator};
use crate::config::AppConfig;
use crate::core::ServerSpec;
use crate::hil::{gated_response, HilError, HilService};
use crate::progress::{ProgressEvent, ProgressService};
use crate::protocol::{
    self, RpcError, RpcRequest, RpcResponse, WirePrompt, WireResource, WireTool,
};
use crate::search::{SearchError, SearchRequest, SearchService};
use crate::skills::catalog::{CatalogError, CreateSkillRequest, SkillCatalog, UpdateSkillRequest};
use crate::aggregator::registry::{AggregatorError, ServerRegistry};
use crate::aggregator::router::RequestRouter;
use crate::store::cache::LayerCache;
use crate::store::relational::RegistryStore;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use futures::stream::Stream;
use serde_json::{json, Value as JsonValue};
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::debug;
use uuid::Uuid;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: Arc<RegistryStore>,
    pub cache: Arc<LayerCache>,
    pub search: Arc<SearchService>,
    pub catalog: Arc<SkillCatalog>,
    pub servers: Arc<ServerRegistry>,
    pub router: Arc<RequestRouter>,
    pub hil: Arc<HilService>,
    pub progress: Arc<ProgressService>,
    pub auth: Arc<Authenticator>,
}

/// REST error envelope
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        ApiError {
            status,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        ApiError::new(StatusCode::NOT_FOUND, message)
    }

    fn bad_request(message: impl Into<String>) -> Self {
        ApiError::new(StatusCode::BAD_REQUEST, message)
    }

    fn internal(message: impl Into<String>) -> Self {
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({"error": self.message}))).into_response()
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::MissingCredentials => ApiError::new(StatusCode::UNAUTHORIZED, e.to_string()),
            AuthError::InvalidCredential => ApiError::new(StatusCode::UNAUTHORIZED, e.to_string()),
            AuthError::OrgDenied(_) => ApiError::new(StatusCode::FORBIDDEN, e.to_string()),
            AuthError::Unavailable(_) => ApiError::new(StatusCode::BAD_GATEWAY, e.to_string()),
        }
    }
}

impl From<AggregatorError> for ApiError {
    fn from(e: AggregatorError) -> Self {
        match e {
            AggregatorError::NotFound(_) => ApiError::not_found(e.to_string()),
            AggregatorError::AlreadyRegistered(_) => {
                ApiError::new(StatusCode::CONFLICT, e.to_string())
            }
            AggregatorError::Invalid(_) => ApiError::bad_request(e.to_string()),
            AggregatorError::Session(_) => ApiError::new(StatusCode::BAD_GATEWAY, e.to_string()),
            other => ApiError::internal(other.to_string()),
        }
    }
}

impl From<CatalogError> for ApiError {
    fn from(e: CatalogError) -> Self {
        match e {
            CatalogError::NotFound(_) => ApiError::not_found(e.to_string()),
            CatalogError::AlreadyExists(_) => ApiError::new(StatusCode::CONFLICT, e.to_string()),
            CatalogError::InvalidId(_) | CatalogError::DescriptionTooShort(_) => {
                ApiError::bad_request(e.to_string())
            }
            other => ApiError::internal(other.to_string()),
        }
    }
}

impl From<HilError> for ApiError {
    fn from(e: HilError) -> Self {
        match e {
            HilError::NotFound(_) => ApiError::not_found(e.to_string()),
            HilError::AlreadyDecided { .. } | HilError::InvalidDecision { .. } => {
                ApiError::new(StatusCode::CONFLICT, e.to_string())
            }
        }
    }
}

impl From<SearchError> for ApiError {
    fn from(e: SearchError) -> Self {
        match e {
            SearchError::EmptyQuery => ApiError::bad_request(e.to_string()),
            other => ApiError::internal(other.to_string()),
        }
    }
}

/// Build the full application router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/mcp", post(mcp_endpoint))
        .route("/health", get(health))
        .route("/search", post(search))
        .route("/progress/{id}/stream", get(progress_stream))
        .route("/api/v1/aggregator/servers", post(register_server))
        .route("/api/v1/aggregator/servers", get(list_servers))
        .route("/api/v1/aggregator/servers/{id}", get(get_server))
        .route("/api/v1/aggregator/servers/{id}", delete(remove_server))
        .route("/api/v1/aggregator/servers/{id}/connect", post(connect_server))
        .route(
            "/api/v1/aggregator/servers/{id}/disconnect",
            post(disconnect_server),
        )
        .route("/api/v1/skills", get(list_skills))
        .route("/api/v1/skills", post(create_skill))
        .route("/api/v1/skills/{id}", get(get_skill))
        .route("/api/v1/skills/{id}", put(update_skill))
        .route("/api/v1/skills/{id}/disable", post(disable_skill))
        .route("/api/v1/skills/{id}/tools", get(skill_tools))
        .route("/api/v1/hil/{id}", get(get_hil))
        .route("/api/v1/hil/{id}/{decision}", post(decide_hil))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<AuthContext, ApiError> {
    Ok(state.auth.authenticate(headers).await?)
}

// ----------------------------------------------------------------------
// MCP endpoint
// ----------------------------------------------------------------------

async fn mcp_endpoint(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<Response, ApiError> {
    let caller = authenticate(&state, &headers).await?;

    let request: RpcRequest = match serde_json::from_str(&body) {
        Ok(request) => request,
        Err(e) => {
            let response = RpcResponse::failure(
                JsonValue::Null,
                RpcError::new(protocol::PARSE_ERROR, format!("parse error: {e}")),
            );
            return Ok(Json(response).into_response());
        }
    };

    // Notifications get acknowledged without a body.
    let Some(id) = request.id.clone() else {
        debug!(method = %request.method, "notification received");
        return Ok(StatusCode::ACCEPTED.into_response());
    };

    let response = match dispatch(&state, &caller, &request).await {
        Ok(result) => RpcResponse::success(id, result),
        Err(error) => RpcResponse::failure(id, error),
    };

    if wants_event_stream(&headers) {
        let stream = async_stream::stream! {
            let data = serde_json::to_string(&response).unwrap_or_default();
            yield Ok::<Event, Infallible>(Event::default().event("message").data(data));
        };
        Ok(Sse::new(stream).into_response())
    } else {
        Ok(Json(response).into_response())
    }
}

fn wants_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|accept| {
            accept.contains("text/event-stream") && !accept.contains("application/json")
        })
        .unwrap_or(false)
}

async fn dispatch(
    state: &AppState,
    caller: &AuthContext,
    request: &RpcRequest,
) -> Result<JsonValue, RpcError> {
    let params = request.params.clone().unwrap_or(JsonValue::Null);
    match request.method.as_str() {
        "initialize" => Ok(json!({
            "protocolVersion": protocol::PROTOCOL_VERSION,
            "capabilities": {"tools": {}, "prompts": {}, "resources": {}},
            "serverInfo": {
                "name": "mcphub",
                "version": env!("CARGO_PKG_VERSION"),
            }
        })),
        "ping" => Ok(json!({})),
        "tools/list" => tools_list(state, caller).await,
        "tools/call" => {
            let name = params
                .get("name")
                .and_then(|v| v.as_str())
                .ok_or_else(|| RpcError::invalid_params("missing tool name"))?;
            let arguments = params.get("arguments").cloned().unwrap_or(json!({}));
            let result = state
                .router
                .call_tool(caller, name, arguments)
                .await
                .map_err(|e| e.to_rpc_error())?;
            serde_json::to_value(result).map_err(|e| RpcError::internal(e.to_string()))
        }
        "prompts/list" => prompts_list(state, caller).await,
        "prompts/get" => {
            let name = params
                .get("name")
                .and_then(|v| v.as_str())
                .ok_or_else(|| RpcError::invalid_params("missing prompt name"))?;
            let arguments = params.get("arguments").cloned().unwrap_or(json!({}));
            state
                .router
                .get_prompt(caller, name, arguments)
                .await
                .map_err(|e| e.to_rpc_error())
        }
        "resources/list" => resources_list(state, caller).await,
        "resources/read" => {
            let uri = params
                .get("uri")
                .and_then(|v| v.as_str())
                .ok_or_else(|| RpcError::invalid_params("missing resource uri"))?;
            state
                .router
                .read_resource(caller, uri)
                .await
                .map_err(|e| e.to_rpc_error())
        }
        method => Err(RpcError::method_not_found(method)),
    }
}

async fn tools_list(state: &AppState, caller: &AuthContext) -> Result<JsonValue, RpcError> {
    let cache_key = caller.active_org.clone().unwrap_or_else(|| "_".to_string());
    if let Some(cached) = state.cache.get("tool_list", &cache_key) {
        return Ok(cached);
    }

    let tools = state
        .db
        .list_tools(caller.active_org.as_deref(), false)
        .await
        .map_err(|e| RpcError::internal(e.to_string()))?;

    let wire: Vec<WireTool> = tools
        .into_iter()
        .map(|t| WireTool {
            name: t.name,
            description: Some(t.description),
            input_schema: t.input_schema,
            annotations: Some(t.annotations),
        })
        .collect();

    let result = json!({"tools": wire});
    state.cache.set("tool_list", &cache_key, result.clone());
    Ok(result)
}

async fn prompts_list(state: &AppState, caller: &AuthContext) -> Result<JsonValue, RpcError> {
    let prompts = state
        .db
        .list_prompts(caller.active_org.as_deref(), false)
        .await
        .map_err(|e| RpcError::internal(e.to_string()))?;

    let wire: Vec<WirePrompt> = prompts
        .into_iter()
        .map(|p| WirePrompt {
            name: p.name,
            description: Some(p.description),
            arguments: p.arguments,
        })
        .collect();
    Ok(json!({"prompts": wire}))
}

async fn resources_list(state: &AppState, caller: &AuthContext) -> Result<JsonValue, RpcError> {
    let resources = state
        .db
        .list_resources(caller.active_org.as_deref(), false)
        .await
        .map_err(|e| RpcError::internal(e.to_string()))?;

    let wire: Vec<WireResource> = resources
        .into_iter()
        .filter(|r| r.readable_by(&caller.user_id))
        .map(|r| WireResource {
            name: r.name,
            uri: r.uri,
            description: Some(r.description),
            mime_type: r.mime_type,
        })
        .collect();
    Ok(json!({"resources": wire}))
}

// ----------------------------------------------------------------------
// Auxiliary REST
// ----------------------------------------------------------------------

async fn health(State(state): State<AppState>) -> Result<Json<JsonValue>, ApiError> {
    let (tools, prompts, resources) = state
        .db
        .capability_counts()
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;

    Ok(Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "capabilities": {
            "tools": tools,
            "prompts": prompts,
            "resources": resources,
        }
    })))
}

async fn search(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(mut request): Json<SearchRequest>,
) -> Result<Json<JsonValue>, ApiError> {
    let caller = authenticate(&state, &headers).await?;
    // The caller's tenant wins over whatever the body claims.
    request.org_id = caller.active_org.clone();

    let response = state.search.search(&request).await?;
    Ok(Json(serde_json::to_value(response).map_err(|e| {
        ApiError::internal(e.to_string())
    })?))
}

async fn progress_stream(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let (snapshot, receiver) = state
        .progress
        .subscribe(id)
        .ok_or_else(|| ApiError::not_found(format!("operation {id}")))?;

    let stream = async_stream::stream! {
        yield Ok(progress_sse_event(&ProgressEvent::Progress(snapshot.clone())));

        match receiver {
            None => {
                // Already finished: emit the terminal event and end.
                yield Ok(progress_sse_event(&ProgressEvent::Done {
                    status: snapshot.status,
                }));
            }
            Some(mut rx) => {
                loop {
                    match rx.recv().await {
                        Ok(event) => {
                            let done = matches!(event, ProgressEvent::Done { .. });
                            yield Ok(progress_sse_event(&event));
                            if done {
                                break;
                            }
                        }
                        // Buffered events are drained before Closed arrives.
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    }
                }
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn progress_sse_event(event: &ProgressEvent) -> Event {
    let (name, data) = match event {
        ProgressEvent::Progress(op) => ("progress", serde_json::to_value(op).unwrap_or_default()),
        ProgressEvent::Done { status } => ("done", json!({"status": status})),
        ProgressEvent::Error { message } => ("error", json!({"message": message})),
    };
    Event::default()
        .event(name)
        .data(serde_json::to_string(&data).unwrap_or_default())
}

// ----------------------------------------------------------------------
// Aggregator REST
// ----------------------------------------------------------------------

async fn register_server(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(spec): Json<ServerSpec>,
) -> Result<(StatusCode, Json<JsonValue>), ApiError> {
    let _caller = authenticate(&state, &headers).await?;
    let server = state.servers.register(spec).await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::to_value(server).map_err(|e| ApiError::internal(e.to_string()))?),
    ))
}

async fn list_servers(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<JsonValue>, ApiError> {
    let caller = authenticate(&state, &headers).await?;
    let servers = state.servers.list(caller.active_org.as_deref()).await?;
    Ok(Json(json!({"servers": servers})))
}

async fn get_server(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<JsonValue>, ApiError> {
    let _caller = authenticate(&state, &headers).await?;
    let view = state.servers.get(id).await?;
    Ok(Json(serde_json::to_value(view).map_err(|e| {
        ApiError::internal(e.to_string())
    })?))
}

async fn connect_server(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<JsonValue>, ApiError> {
    let _caller = authenticate(&state, &headers).await?;
    let server = state.servers.connect(id).await?;
    Ok(Json(serde_json::to_value(server).map_err(|e| {
        ApiError::internal(e.to_string())
    })?))
}

async fn disconnect_server(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<JsonValue>, ApiError> {
    let _caller = authenticate(&state, &headers).await?;
    let server = state.servers.disconnect(id).await?;
    Ok(Json(serde_json::to_value(server).map_err(|e| {
        ApiError::internal(e.to_string())
    })?))
}

async fn remove_server(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<JsonValue>, ApiError> {
    let _caller = authenticate(&state, &headers).await?;
    let report = state.servers.remove(id).await?;
    Ok(Json(serde_json::to_value(report).map_err(|e| {
        ApiError::internal(e.to_string())
    })?))
}

// ----------------------------------------------------------------------
// Skills REST
// ----------------------------------------------------------------------

async fn list_skills(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<JsonValue>, ApiError> {
    let caller = authenticate(&state, &headers).await?;
    let skills = state
        .catalog
        .list(caller.active_org.as_deref(), false)
        .await?;
    Ok(Json(json!({"skills": skills})))
}

async fn create_skill(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(mut request): Json<CreateSkillRequest>,
) -> Result<(StatusCode, Json<JsonValue>), ApiError> {
    let caller = authenticate(&state, &headers).await?;
    // Org-scoped callers create org-scoped skills.
    if let Some(org) = &caller.active_org {
        request.scope = crate::core::Scope::org(org.clone());
    }
    let skill = state.catalog.create(request).await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::to_value(skill).map_err(|e| ApiError::internal(e.to_string()))?),
    ))
}

async fn get_skill(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<JsonValue>, ApiError> {
    let caller = authenticate(&state, &headers).await?;
    let skill = state.catalog.get(&id, caller.active_org.as_deref()).await?;
    Ok(Json(serde_json::to_value(skill).map_err(|e| {
        ApiError::internal(e.to_string())
    })?))
}

async fn update_skill(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(request): Json<UpdateSkillRequest>,
) -> Result<Json<JsonValue>, ApiError> {
    let caller = authenticate(&state, &headers).await?;
    let skill = state
        .catalog
        .update(&id, caller.active_org.as_deref(), request)
        .await?;
    Ok(Json(serde_json::to_value(skill).map_err(|e| {
        ApiError::internal(e.to_string())
    })?))
}

async fn disable_skill(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<JsonValue>, ApiError> {
    let caller = authenticate(&state, &headers).await?;
    let skill = state
        .catalog
        .deactivate(&id, caller.active_org.as_deref())
        .await?;
    Ok(Json(serde_json::to_value(skill).map_err(|e| {
        ApiError::internal(e.to_string())
    })?))
}

async fn skill_tools(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<JsonValue>, ApiError> {
    let caller = authenticate(&state, &headers).await?;
    let tools = state
        .catalog
        .tools_for_skill(&id, caller.active_org.as_deref())
        .await?;
    Ok(Json(json!({"tools": tools})))
}

// ----------------------------------------------------------------------
// HIL REST
// ----------------------------------------------------------------------

async fn get_hil(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<JsonValue>, ApiError> {
    let _caller = authenticate(&state, &headers).await?;
    let request = state.hil.get(&id)?;
    Ok(Json(serde_json::to_value(&request).map_err(|e| {
        ApiError::internal(e.to_string())
    })?))
}

async fn decide_hil(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((id, decision)): Path<(String, String)>,
    body: String,
) -> Result<Json<JsonValue>, ApiError> {
    let _caller = authenticate(&state, &headers).await?;
    // The body is optional: approvals carry nothing, submissions carry JSON.
    let submission = if body.trim().is_empty() {
        None
    } else {
        Some(
            serde_json::from_str(&body)
                .map_err(|e| ApiError::bad_request(format!("invalid submission body: {e}")))?,
        )
    };
    let request = state.hil.decide(&id, &decision, submission)?;
    Ok(Json(json!({
        "request": request,
        "response": gated_response(&request),
    })))
}
