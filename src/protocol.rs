//! MCP JSON-RPC 2.0 framing
//!
//! Wire types for requests, responses, and tool-call results, plus the error
//! codes this server emits. Standard codes follow JSON-RPC; application codes
//! live in the -32000..-32099 range.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const JSONRPC_VERSION: &str = "2.0";
pub const PROTOCOL_VERSION: &str = "2024-11-05";

// Standard JSON-RPC codes
pub const PARSE_ERROR: i64 = -32700;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

// Application codes
pub const SERVER_UNAVAILABLE: i64 = -32000;
pub const SERVER_BUSY: i64 = -32001;
pub const AUTHORIZATION_REQUIRED: i64 = -32002;
pub const SERVER_DRAINED: i64 = -32003;
pub const VECTOR_OVERFLOW: i64 = -32004;

/// JSON-RPC request envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<JsonValue>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<JsonValue>,
}

impl RpcRequest {
    pub fn new(id: impl Into<JsonValue>, method: impl Into<String>, params: Option<JsonValue>) -> Self {
        RpcRequest {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id.into()),
            method: method.into(),
            params,
        }
    }

    /// Notifications carry no id and expect no response.
    pub fn notification(method: impl Into<String>, params: Option<JsonValue>) -> Self {
        RpcRequest {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC response envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: JsonValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn success(id: JsonValue, result: JsonValue) -> Self {
        RpcResponse {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: JsonValue, error: RpcError) -> Self {
        RpcResponse {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// JSON-RPC error object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        RpcError {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: JsonValue) -> Self {
        self.data = Some(data);
        self
    }

    pub fn method_not_found(method: &str) -> Self {
        RpcError::new(METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        RpcError::new(INVALID_PARAMS, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        RpcError::new(INTERNAL_ERROR, message)
    }
}

/// Content part of a tool-call result
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentItem {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
}

/// MCP tool-call result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub content: Vec<ContentItem>,

    #[serde(rename = "structuredContent", skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<JsonValue>,

    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

impl ToolCallResult {
    pub fn text(text: impl Into<String>) -> Self {
        ToolCallResult {
            content: vec![ContentItem::Text { text: text.into() }],
            structured_content: None,
            is_error: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ToolCallResult {
            content: vec![ContentItem::Text {
                text: message.into(),
            }],
            structured_content: None,
            is_error: true,
        }
    }

    pub fn with_structured(mut self, data: JsonValue) -> Self {
        self.structured_content = Some(data);
        self
    }

    /// Parse from a raw `tools/call` result value returned by a backend.
    pub fn from_value(value: JsonValue) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_else(|_| {
            // Backends returning a bare value get wrapped as text content.
            ToolCallResult::text(value.to_string())
        })
    }
}

/// Tool shape emitted by `tools/list`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireTool {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "inputSchema")]
    pub input_schema: JsonValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<JsonValue>,
}

/// Prompt shape emitted by `prompts/list`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WirePrompt {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "JsonValue::is_null")]
    pub arguments: JsonValue,
}

/// Resource shape emitted by `resources/list`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireResource {
    pub name: String,
    pub uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "mimeType", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Everything a backend advertises, fetched during discovery.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteListing {
    pub tools: Vec<WireTool>,
    pub prompts: Vec<WirePrompt>,
    pub resources: Vec<WireResource>,
}

impl RemoteListing {
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty() && self.prompts.is_empty() && self.resources.is_empty()
    }
}

/// Parse a `tools/list` result into wire tools.
pub fn parse_tool_listing(result: &JsonValue) -> Vec<WireTool> {
    result
        .get("tools")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| serde_json::from_value(v.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

/// Parse a `prompts/list` result into wire prompts.
pub fn parse_prompt_listing(result: &JsonValue) -> Vec<WirePrompt> {
    result
        .get("prompts")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| serde_json::from_value(v.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

/// Parse a `resources/list` result into wire resources.
pub fn parse_resource_listing(result: &JsonValue) -> Vec<WireResource> {
    result
        .get("resources")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| serde_json::from_value(v.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}
