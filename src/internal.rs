//! Internal capability modules
//!
//! In-process tools, prompts, and resources registered at startup through
//! module callbacks (`register_<module>`). The sync pipeline scans this
//! registry and reconciles it into the relational store, so internal and
//! external capabilities share one catalog.

use crate::core::{PromptSpec, ResourceSpec, Scope, SecurityLevel, ToolSpec};
use crate::protocol::ToolCallResult;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Execution timed out after {0:?}")]
    Timeout(Duration),
}

pub type Result<T> = std::result::Result<T, ToolError>;

/// One executable internal tool
#[async_trait]
pub trait LocalTool: Send + Sync {
    fn spec(&self) -> ToolSpec;
    async fn call(&self, arguments: JsonValue) -> Result<ToolCallResult>;
}

/// Registry of in-process capabilities, populated by module callbacks.
///
/// Resource bodies registered here are staged only; the sync pipeline uploads
/// them to the object store, which is where `resources/read` serves from.
#[derive(Default)]
pub struct LocalRegistry {
    tools: RwLock<HashMap<String, Arc<dyn LocalTool>>>,
    prompts: RwLock<HashMap<String, PromptSpec>>,
    resources: RwLock<HashMap<String, ResourceSpec>>,
    resource_bodies: RwLock<HashMap<String, String>>,
}

impl LocalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_tool(&self, tool: Arc<dyn LocalTool>) {
        let name = tool.spec().name;
        self.tools.write().insert(name, tool);
    }

    pub fn register_prompt(&self, prompt: PromptSpec) {
        self.prompts.write().insert(prompt.name.clone(), prompt);
    }

    pub fn register_resource(&self, resource: ResourceSpec, body: impl Into<String>) {
        self.resource_bodies
            .write()
            .insert(resource.uri.clone(), body.into());
        self.resources
            .write()
            .insert(resource.name.clone(), resource);
    }

    pub fn tool(&self, name: &str) -> Option<Arc<dyn LocalTool>> {
        self.tools.read().get(name).cloned()
    }

    pub fn tool_specs(&self) -> Vec<ToolSpec> {
        self.tools.read().values().map(|t| t.spec()).collect()
    }

    pub fn prompt_specs(&self) -> Vec<PromptSpec> {
        self.prompts.read().values().cloned().collect()
    }

    pub fn resource_specs(&self) -> Vec<ResourceSpec> {
        self.resources.read().values().cloned().collect()
    }

    /// Staged body for a registered resource, pending object-store upload.
    pub fn resource_body(&self, uri: &str) -> Option<String> {
        self.resource_bodies.read().get(uri).cloned()
    }

    /// Render a prompt template with `{{name}}` substitutions.
    pub fn render_prompt(&self, name: &str, arguments: &JsonValue) -> Option<String> {
        let prompt = self.prompts.read().get(name).cloned()?;
        let template = prompt.template.unwrap_or_default();
        let mut rendered = template;
        if let Some(map) = arguments.as_object() {
            for (key, value) in map {
                let needle = format!("{{{{{key}}}}}");
                let replacement = match value {
                    JsonValue::String(s) => s.clone(),
                    other => other.to_string(),
                };
                rendered = rendered.replace(&needle, &replacement);
            }
        }
        Some(rendered)
    }
}

/// Enable the named built-in modules.
pub fn register_builtin_modules(registry: &LocalRegistry, modules: &[String]) {
    for module in modules {
        match module.as_str() {
            "echo" => register_echo_tools(registry),
            "shell" => register_shell_tools(registry),
            "docs" => register_docs_resources(registry),
            other => info!(module = other, "unknown internal module, skipping"),
        }
    }
}

// ----------------------------------------------------------------------
// echo module
// ----------------------------------------------------------------------

struct EchoTool;

#[async_trait]
impl LocalTool for EchoTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new("echo", "Echo the given message back to the caller")
            .with_schema(json!({
                "type": "object",
                "properties": {
                    "message": {"type": "string", "description": "Text to echo"}
                },
                "required": ["message"]
            }))
            .with_scope(Scope::global())
    }

    async fn call(&self, arguments: JsonValue) -> Result<ToolCallResult> {
        let message = arguments
            .get("message")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidArguments("message is required".to_string()))?;
        Ok(ToolCallResult::text(message.to_string()))
    }
}

struct CurrentTimeTool;

#[async_trait]
impl LocalTool for CurrentTimeTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new("current_time", "Return the current UTC time in RFC 3339 format")
            .with_schema(json!({"type": "object", "properties": {}}))
    }

    async fn call(&self, _arguments: JsonValue) -> Result<ToolCallResult> {
        Ok(ToolCallResult::text(chrono::Utc::now().to_rfc3339()))
    }
}

pub fn register_echo_tools(registry: &LocalRegistry) {
    registry.register_tool(Arc::new(EchoTool));
    registry.register_tool(Arc::new(CurrentTimeTool));
    registry.register_prompt(PromptSpec {
        name: "summarize".to_string(),
        description: "Summarize the provided text in a few sentences".to_string(),
        arguments: json!([
            {"name": "text", "description": "Text to summarize", "required": true}
        ]),
        template: Some(
            "Summarize the following text in at most three sentences:\n\n{{text}}".to_string(),
        ),
        scope: Scope::global(),
        source_server_id: None,
        original_name: None,
    });
}

// ----------------------------------------------------------------------
// shell module
// ----------------------------------------------------------------------

const SHELL_TIMEOUT: Duration = Duration::from_secs(30);

struct ShellExecuteTool;

#[async_trait]
impl LocalTool for ShellExecuteTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            "bash_execute",
            "Execute a shell command on the host and return its output",
        )
        .with_schema(json!({
            "type": "object",
            "properties": {
                "command": {"type": "string", "description": "Command line to run"}
            },
            "required": ["command"]
        }))
        .with_security(SecurityLevel::High)
    }

    async fn call(&self, arguments: JsonValue) -> Result<ToolCallResult> {
        let command = arguments
            .get("command")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidArguments("command is required".to_string()))?;

        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(SHELL_TIMEOUT, child)
            .await
            .map_err(|_| ToolError::Timeout(SHELL_TIMEOUT))?
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        let mut result = ToolCallResult::text(stdout.clone());
        result.is_error = !output.status.success();
        Ok(result.with_structured(json!({
            "exit_code": output.status.code(),
            "stdout": stdout,
            "stderr": stderr,
        })))
    }
}

pub fn register_shell_tools(registry: &LocalRegistry) {
    registry.register_tool(Arc::new(ShellExecuteTool));
}

// ----------------------------------------------------------------------
// docs module
// ----------------------------------------------------------------------

const GUIDE_URI: &str = "mcphub://docs/guide";

pub fn register_docs_resources(registry: &LocalRegistry) {
    registry.register_resource(
        ResourceSpec {
            name: "guide".to_string(),
            uri: GUIDE_URI.to_string(),
            description: "Getting-started guide for the aggregation server".to_string(),
            mime_type: Some("text/markdown".to_string()),
            owner: None,
            allowed_users: Vec::new(),
            scope: Scope::global(),
            source_server_id: None,
            original_name: None,
        },
        "# mcphub\n\nRegister external MCP servers, then discover their tools \
         through `/search` or the standard `tools/list` method. External tools \
         are namespaced as `<server>.<tool>`.\n",
    );
}
