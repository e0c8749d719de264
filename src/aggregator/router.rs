//! Request router
//!
//! Resolves incoming MCP calls against the unified catalog:
//! - namespaced names (`<server>.<original>`) forward to the owning session
//!   with the original arguments; DEGRADED servers get a shortened timeout
//! - plain names dispatch to the internal handler
//!
//! Responses carry routing metadata (`routed_to`, `routing_time_ms`,
//! `execution_time_ms`). HIGH-security tools are gated on an approval grant
//! matching the caller's `(user, tool, arguments)` fingerprint; missing
//! grants start the human-in-the-loop flow.

use crate::auth::AuthContext;
use crate::config::AggregatorSection;
use crate::core::{ExternalServer, ServerStatus, ToolRecord};
use crate::hil::{GateDecision, HilRequest, HilService};
use crate::internal::{LocalRegistry, ToolError};
use crate::protocol::{self, RpcError, ToolCallResult};
use crate::store::object::{resource_body_key, ObjectError, ObjectStore};
use crate::store::relational::{RegistryStore, StoreError};
use super::session::{SessionError, SessionManager};
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum RouteError {
    #[error("Unknown tool: {0}")]
    ToolNotFound(String),

    #[error("Unknown prompt: {0}")]
    PromptNotFound(String),

    #[error("Unknown resource: {0}")]
    ResourceNotFound(String),

    #[error("Invalid arguments: {0}")]
    InvalidParams(String),

    #[error("Server unavailable: {0}")]
    ServerUnavailable(String),

    #[error("Server busy")]
    Busy,

    #[error("Request drained during disconnect")]
    Drained,

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Authorization required")]
    AuthorizationRequired(HilRequest),

    #[error("Authorization rejected")]
    AuthorizationRejected(HilRequest),

    #[error("Resource access denied: {0}")]
    AccessDenied(String),

    #[error("Backend returned an error")]
    Backend(JsonValue),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for RouteError {
    fn from(e: StoreError) -> Self {
        RouteError::Internal(e.to_string())
    }
}

impl RouteError {
    /// Map onto the wire error shape.
    pub fn to_rpc_error(&self) -> RpcError {
        match self {
            RouteError::ToolNotFound(_)
            | RouteError::PromptNotFound(_)
            | RouteError::ResourceNotFound(_) => {
                RpcError::new(protocol::INVALID_PARAMS, self.to_string())
            }
            RouteError::InvalidParams(_) => RpcError::invalid_params(self.to_string()),
            RouteError::ServerUnavailable(_) => {
                RpcError::new(protocol::SERVER_UNAVAILABLE, self.to_string())
            }
            RouteError::Busy => RpcError::new(protocol::SERVER_BUSY, self.to_string()),
            RouteError::Drained => RpcError::new(protocol::SERVER_DRAINED, self.to_string()),
            RouteError::Timeout(_) => {
                RpcError::new(protocol::SERVER_UNAVAILABLE, self.to_string())
            }
            RouteError::AuthorizationRequired(request) => {
                RpcError::new(protocol::AUTHORIZATION_REQUIRED, "AUTHORIZATION_REQUIRED")
                    .with_data(json!({
                        "request_id": request.id,
                        "hil_type": request.kind,
                        "options": request.options,
                        "expires_at": request.expires_at,
                    }))
            }
            RouteError::AuthorizationRejected(request) => {
                RpcError::new(protocol::AUTHORIZATION_REQUIRED, "AUTHORIZATION_REJECTED")
                    .with_data(json!({"request_id": request.id}))
            }
            RouteError::AccessDenied(_) => {
                RpcError::new(protocol::INVALID_PARAMS, self.to_string())
            }
            RouteError::Backend(data) => {
                RpcError::internal("backend error").with_data(data.clone())
            }
            RouteError::Internal(_) => RpcError::internal(self.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, RouteError>;

/// Unified dispatch over internal handlers and backend sessions
pub struct RequestRouter {
    db: Arc<RegistryStore>,
    local: Arc<LocalRegistry>,
    sessions: Arc<SessionManager>,
    hil: Arc<HilService>,
    objects: Arc<dyn ObjectStore>,
    config: AggregatorSection,
}

impl RequestRouter {
    pub fn new(
        db: Arc<RegistryStore>,
        local: Arc<LocalRegistry>,
        sessions: Arc<SessionManager>,
        hil: Arc<HilService>,
        objects: Arc<dyn ObjectStore>,
        config: AggregatorSection,
    ) -> Self {
        RequestRouter {
            db,
            local,
            sessions,
            hil,
            objects,
            config,
        }
    }

    /// Execute `tools/call` for the caller.
    pub async fn call_tool(
        &self,
        caller: &AuthContext,
        name: &str,
        arguments: JsonValue,
    ) -> Result<ToolCallResult> {
        let routing_started = Instant::now();

        let tool = self
            .db
            .get_tool_by_name(name, caller.active_org.as_deref())
            .await?
            .ok_or_else(|| RouteError::ToolNotFound(name.to_string()))?;

        validate_arguments(&tool.input_schema, &arguments)?;

        if tool.security_level.requires_authorization() {
            match self.hil.authorize(
                &caller.user_id,
                name,
                &arguments,
                &format!("Execute high-security tool {name}"),
                "high",
            ) {
                GateDecision::Granted => {
                    debug!(tool = name, user = %caller.user_id, "authorization grant observed");
                }
                GateDecision::PendingRequest(request) => {
                    return Err(RouteError::AuthorizationRequired(request));
                }
                GateDecision::Rejected(request) => {
                    return Err(RouteError::AuthorizationRejected(request));
                }
            }
        }

        let routing_ms = routing_started.elapsed().as_millis() as u64;
        let execution_started = Instant::now();

        let (mut result, routed_to) = match tool.source_server_id {
            Some(server_id) => {
                let server = self
                    .db
                    .get_server(server_id)
                    .await?
                    .ok_or_else(|| RouteError::ServerUnavailable(name.to_string()))?;
                let result = self.forward_tool_call(&server, &tool, arguments).await?;
                (result, server.name)
            }
            None => {
                let result = self.call_local_tool(&tool, arguments).await?;
                (result, "internal".to_string())
            }
        };

        let execution_ms = execution_started.elapsed().as_millis() as u64;
        attach_routing(&mut result, &routed_to, routing_ms, execution_ms);
        Ok(result)
    }

    async fn forward_tool_call(
        &self,
        server: &ExternalServer,
        tool: &ToolRecord,
        arguments: JsonValue,
    ) -> Result<ToolCallResult> {
        // DEGRADED still gets a try, just with less patience.
        let timeout = match server.status {
            ServerStatus::Connected => self.sessions.request_timeout(),
            ServerStatus::Degraded => self.sessions.degraded_timeout(),
            other => {
                return Err(RouteError::ServerUnavailable(format!(
                    "{} is {other}",
                    server.name
                )))
            }
        };

        let session = self
            .sessions
            .get(server.id)
            .ok_or_else(|| RouteError::ServerUnavailable(server.name.clone()))?;

        let original = tool.original_name.as_deref().unwrap_or(&tool.name);
        let outcome = session
            .request(
                "tools/call",
                Some(json!({"name": original, "arguments": arguments})),
                timeout,
            )
            .await;

        match outcome {
            Ok(value) => Ok(ToolCallResult::from_value(value)),
            Err(SessionError::Busy) => Err(RouteError::Busy),
            Err(SessionError::Drained) => Err(RouteError::Drained),
            Err(SessionError::Timeout(t)) => Err(RouteError::Timeout(t)),
            Err(SessionError::Backend(data)) => Err(RouteError::Backend(json!({
                "routed_to": server.name,
                "error": data,
            }))),
            Err(e) => Err(RouteError::ServerUnavailable(e.to_string())),
        }
    }

    async fn call_local_tool(
        &self,
        tool: &ToolRecord,
        arguments: JsonValue,
    ) -> Result<ToolCallResult> {
        let handler = self
            .local
            .tool(&tool.name)
            .ok_or_else(|| RouteError::ToolNotFound(tool.name.clone()))?;

        let timeout = self.sessions.request_timeout();
        let outcome = tokio::time::timeout(timeout, handler.call(arguments)).await;

        match outcome {
            Err(_) => Err(RouteError::Timeout(timeout)),
            Ok(Err(ToolError::InvalidArguments(message))) => {
                Err(RouteError::InvalidParams(message))
            }
            Ok(Err(ToolError::Timeout(t))) => Err(RouteError::Timeout(t)),
            Ok(Err(ToolError::ExecutionFailed(message))) => {
                warn!(tool = %tool.name, error = %message, "internal tool failed");
                Ok(ToolCallResult::error(message))
            }
            Ok(Ok(result)) => Ok(result),
        }
    }

    /// Execute `prompts/get` for the caller.
    pub async fn get_prompt(
        &self,
        caller: &AuthContext,
        name: &str,
        arguments: JsonValue,
    ) -> Result<JsonValue> {
        let prompt = self
            .db
            .get_prompt_by_name(name, caller.active_org.as_deref())
            .await?
            .ok_or_else(|| RouteError::PromptNotFound(name.to_string()))?;

        match prompt.source_server_id {
            Some(server_id) => {
                let session = self
                    .sessions
                    .get(server_id)
                    .ok_or_else(|| RouteError::ServerUnavailable(name.to_string()))?;
                let original = prompt.original_name.as_deref().unwrap_or(&prompt.name);
                session
                    .request(
                        "prompts/get",
                        Some(json!({"name": original, "arguments": arguments})),
                        self.sessions.request_timeout(),
                    )
                    .await
                    .map_err(map_session_error)
            }
            None => {
                let rendered = self
                    .local
                    .render_prompt(&prompt.name, &arguments)
                    .ok_or_else(|| RouteError::PromptNotFound(name.to_string()))?;
                Ok(json!({
                    "description": prompt.description,
                    "messages": [{
                        "role": "user",
                        "content": {"type": "text", "text": rendered},
                    }]
                }))
            }
        }
    }

    /// Execute `resources/read` for the caller.
    pub async fn read_resource(&self, caller: &AuthContext, uri: &str) -> Result<JsonValue> {
        let resource = self
            .db
            .get_resource_by_uri(uri, caller.active_org.as_deref())
            .await?
            .ok_or_else(|| RouteError::ResourceNotFound(uri.to_string()))?;

        if !resource.readable_by(&caller.user_id) {
            warn!(user = %caller.user_id, uri, "resource access denied");
            return Err(RouteError::AccessDenied(uri.to_string()));
        }

        match resource.source_server_id {
            Some(server_id) => {
                let session = self
                    .sessions
                    .get(server_id)
                    .ok_or_else(|| RouteError::ServerUnavailable(uri.to_string()))?;
                session
                    .request(
                        "resources/read",
                        Some(json!({"uri": uri})),
                        self.sessions.request_timeout(),
                    )
                    .await
                    .map_err(map_session_error)
            }
            None => {
                // Internal bodies live in the object store; sync put them
                // there when the module registered.
                let body = match self.objects.get(&resource_body_key(uri)).await {
                    Ok(bytes) => String::from_utf8_lossy(&bytes).to_string(),
                    Err(ObjectError::NotFound(_)) => {
                        return Err(RouteError::ResourceNotFound(uri.to_string()))
                    }
                    Err(e) => return Err(RouteError::Internal(e.to_string())),
                };
                Ok(json!({
                    "contents": [{
                        "uri": uri,
                        "mimeType": resource.mime_type,
                        "text": body,
                    }]
                }))
            }
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.config.request_timeout_s)
    }
}

fn map_session_error(e: SessionError) -> RouteError {
    match e {
        SessionError::Busy => RouteError::Busy,
        SessionError::Drained => RouteError::Drained,
        SessionError::Timeout(t) => RouteError::Timeout(t),
        SessionError::Backend(data) => RouteError::Backend(data),
        other => RouteError::ServerUnavailable(other.to_string()),
    }
}

/// Validate tool arguments against the stored input schema.
fn validate_arguments(schema: &JsonValue, arguments: &JsonValue) -> Result<()> {
    let compiled = jsonschema::JSONSchema::compile(schema)
        .map_err(|e| RouteError::Internal(format!("stored schema invalid: {e}")))?;

    let outcome = compiled.validate(arguments);
    if let Err(errors) = outcome {
        let messages: Vec<String> = errors.map(|e| e.to_string()).collect();
        return Err(RouteError::InvalidParams(messages.join("; ")));
    }
    Ok(())
}

/// Fold routing metadata into the structured content.
fn attach_routing(result: &mut ToolCallResult, routed_to: &str, routing_ms: u64, execution_ms: u64) {
    let routing = json!({
        "routed_to": routed_to,
        "routing_time_ms": routing_ms,
        "execution_time_ms": execution_ms,
    });
    match result.structured_content.as_mut() {
        Some(JsonValue::Object(map)) => {
            map.insert("routing".to_string(), routing);
        }
        _ => {
            result.structured_content = Some(json!({"routing": routing}));
        }
    }
}
