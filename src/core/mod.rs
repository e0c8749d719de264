//! Core types and data structures for mcphub
//!
//! This module defines the canonical records shared across the system:
//! - Tool, prompt, and resource registry records
//! - Skill categories and tool-skill assignments
//! - External server records, transports, and statuses
//! - Namespacing helpers for aggregated capability names

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use thiserror::Error;
use uuid::Uuid;

/// Error types for core validation
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid server name: {0} (expected ^[a-z][a-z0-9_-]*$)")]
    InvalidServerName(String),

    #[error("Invalid skill id: {0} (expected ^[a-z][a-z0-9_-]*$)")]
    InvalidSkillId(String),

    #[error("Invalid security level: {0}")]
    InvalidSecurityLevel(String),

    #[error("Invalid transport config: {0}")]
    InvalidTransport(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;

fn ident_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new("^[a-z][a-z0-9_-]*$").expect("static regex"))
}

/// Validate a short lowercase identifier (server names, skill ids)
pub fn is_valid_ident(s: &str) -> bool {
    ident_regex().is_match(s)
}

/// Kind of registry item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Tool,
    Prompt,
    Resource,
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemKind::Tool => write!(f, "tool"),
            ItemKind::Prompt => write!(f, "prompt"),
            ItemKind::Resource => write!(f, "resource"),
        }
    }
}

impl FromStr for ItemKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "tool" | "tools" => Ok(ItemKind::Tool),
            "prompt" | "prompts" => Ok(ItemKind::Prompt),
            "resource" | "resources" => Ok(ItemKind::Resource),
            other => Err(CoreError::InvalidValue(format!(
                "unknown item kind: {other}"
            ))),
        }
    }
}

/// Security classification for tool execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    #[default]
    Low,
    Medium,
    High,
}

impl SecurityLevel {
    /// HIGH tools are executable only behind an approval grant.
    pub fn requires_authorization(&self) -> bool {
        matches!(self, SecurityLevel::High)
    }
}

impl FromStr for SecurityLevel {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "low" => Ok(SecurityLevel::Low),
            "medium" => Ok(SecurityLevel::Medium),
            "high" => Ok(SecurityLevel::High),
            other => Err(CoreError::InvalidSecurityLevel(other.to_string())),
        }
    }
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecurityLevel::Low => write!(f, "low"),
            SecurityLevel::Medium => write!(f, "medium"),
            SecurityLevel::High => write!(f, "high"),
        }
    }
}

/// Tenant scope attached to every registry record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    #[serde(default)]
    pub org_id: Option<String>,
    #[serde(default)]
    pub is_global: bool,
}

impl Scope {
    pub fn global() -> Self {
        Scope {
            org_id: None,
            is_global: true,
        }
    }

    pub fn org(org_id: impl Into<String>) -> Self {
        Scope {
            org_id: Some(org_id.into()),
            is_global: false,
        }
    }

    /// Global records are visible to everyone, org records only to their org.
    pub fn visible_to(&self, org: Option<&str>) -> bool {
        self.is_global || self.org_id.as_deref() == org
    }

    /// Enforce the invariant that a record is either global or bound to
    /// exactly one tenant: no org means global.
    pub fn normalized(mut self) -> Self {
        self.is_global = self.org_id.is_none();
        self
    }
}

/// Canonical tool record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRecord {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
    pub annotations: serde_json::Value,
    pub category: Option<String>,
    pub security_level: SecurityLevel,
    pub org_id: Option<String>,
    pub is_global: bool,
    pub source_server_id: Option<Uuid>,
    pub original_name: Option<String>,
    pub skill_ids: Vec<String>,
    pub primary_skill_id: Option<String>,
    pub is_classified: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ToolRecord {
    pub fn scope(&self) -> Scope {
        Scope {
            org_id: self.org_id.clone(),
            is_global: self.is_global,
        }
    }

    /// Text used for embedding this tool.
    pub fn embedding_text(&self) -> String {
        format!("{}. {}", self.name, self.description)
    }
}

/// Insert/upsert shape for tools (no id, no timestamps)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
    #[serde(default)]
    pub annotations: serde_json::Value,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub security_level: SecurityLevel,
    #[serde(default)]
    pub scope: Scope,
    #[serde(default)]
    pub source_server_id: Option<Uuid>,
    #[serde(default)]
    pub original_name: Option<String>,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        ToolSpec {
            name: name.into(),
            description: description.into(),
            input_schema: serde_json::json!({"type": "object"}),
            annotations: serde_json::json!({}),
            category: None,
            security_level: SecurityLevel::Low,
            scope: Scope::global(),
            source_server_id: None,
            original_name: None,
        }
    }

    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.input_schema = schema;
        self
    }

    pub fn with_security(mut self, level: SecurityLevel) -> Self {
        self.security_level = level;
        self
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }
}

/// Canonical prompt record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptRecord {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub arguments: serde_json::Value,
    pub template: Option<String>,
    pub org_id: Option<String>,
    pub is_global: bool,
    pub source_server_id: Option<Uuid>,
    pub original_name: Option<String>,
    pub skill_ids: Vec<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PromptRecord {
    pub fn embedding_text(&self) -> String {
        format!("{}. {}", self.name, self.description)
    }
}

/// Insert/upsert shape for prompts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptSpec {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub scope: Scope,
    #[serde(default)]
    pub source_server_id: Option<Uuid>,
    #[serde(default)]
    pub original_name: Option<String>,
}

/// Canonical resource record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub id: i64,
    pub name: String,
    pub uri: String,
    pub description: String,
    pub mime_type: Option<String>,
    pub owner: Option<String>,
    pub allowed_users: Vec<String>,
    pub org_id: Option<String>,
    pub is_global: bool,
    pub source_server_id: Option<Uuid>,
    pub original_name: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ResourceRecord {
    pub fn embedding_text(&self) -> String {
        format!("{}. {}", self.name, self.description)
    }

    /// Empty allowed set means readable by anyone who can see the record.
    pub fn readable_by(&self, user: &str) -> bool {
        self.allowed_users.is_empty()
            || self.owner.as_deref() == Some(user)
            || self.allowed_users.iter().any(|u| u == user)
    }
}

/// Insert/upsert shape for resources
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub name: String,
    pub uri: String,
    pub description: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub allowed_users: Vec<String>,
    #[serde(default)]
    pub scope: Scope,
    #[serde(default)]
    pub source_server_id: Option<Uuid>,
    #[serde(default)]
    pub original_name: Option<String>,
}

/// Skill category record (the taxonomy node)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillCategory {
    pub id: String,
    pub name: String,
    pub description: String,
    pub keywords: Vec<String>,
    pub examples: Vec<String>,
    pub parent_domain: Option<String>,
    pub tool_count: i64,
    pub org_id: Option<String>,
    pub is_global: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SkillCategory {
    pub fn scope(&self) -> Scope {
        Scope {
            org_id: self.org_id.clone(),
            is_global: self.is_global,
        }
    }

    /// Text embedded into the skills collection.
    pub fn embedding_text(&self) -> String {
        format!(
            "{}. {}. {}",
            self.name,
            self.description,
            self.keywords.join(", ")
        )
    }
}

/// Where a tool-skill assignment came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentSource {
    Llm,
    Manual,
    Heuristic,
}

impl fmt::Display for AssignmentSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssignmentSource::Llm => write!(f, "llm"),
            AssignmentSource::Manual => write!(f, "manual"),
            AssignmentSource::Heuristic => write!(f, "heuristic"),
        }
    }
}

impl FromStr for AssignmentSource {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "llm" => Ok(AssignmentSource::Llm),
            "manual" => Ok(AssignmentSource::Manual),
            "heuristic" => Ok(AssignmentSource::Heuristic),
            other => Err(CoreError::InvalidValue(format!(
                "unknown assignment source: {other}"
            ))),
        }
    }
}

/// Join row between a tool and a skill category
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillAssignment {
    pub tool_id: i64,
    pub skill_id: String,
    pub confidence: f64,
    pub is_primary: bool,
    pub source: AssignmentSource,
    pub created_at: DateTime<Utc>,
}

/// Transport used to reach an external MCP server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Stdio,
    Sse,
    Http,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Stdio => write!(f, "stdio"),
            TransportKind::Sse => write!(f, "sse"),
            TransportKind::Http => write!(f, "http"),
        }
    }
}

impl FromStr for TransportKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "stdio" => Ok(TransportKind::Stdio),
            "sse" => Ok(TransportKind::Sse),
            "http" | "streamable_http" | "streamable-http" => Ok(TransportKind::Http),
            other => Err(CoreError::InvalidTransport(other.to_string())),
        }
    }
}

/// Transport-specific connection settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportConfig {
    // For stdio
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,

    // For sse / http
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
}

impl TransportConfig {
    /// Check the config carries what the transport needs.
    pub fn validate(&self, kind: TransportKind) -> Result<()> {
        match kind {
            TransportKind::Stdio => {
                if self.command.as_deref().unwrap_or("").is_empty() {
                    return Err(CoreError::InvalidTransport(
                        "stdio transport requires a command".to_string(),
                    ));
                }
            }
            TransportKind::Sse | TransportKind::Http => {
                let url = self.url.as_deref().unwrap_or("");
                if url.is_empty() {
                    return Err(CoreError::InvalidTransport(format!(
                        "{kind} transport requires a url"
                    )));
                }
                if !url.starts_with("http://") && !url.starts_with("https://") {
                    return Err(CoreError::InvalidTransport(format!("invalid url: {url}")));
                }
            }
        }
        Ok(())
    }
}

/// External server lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServerStatus {
    Registered,
    Connecting,
    Connected,
    Degraded,
    Disconnected,
    Error,
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerStatus::Registered => write!(f, "REGISTERED"),
            ServerStatus::Connecting => write!(f, "CONNECTING"),
            ServerStatus::Connected => write!(f, "CONNECTED"),
            ServerStatus::Degraded => write!(f, "DEGRADED"),
            ServerStatus::Disconnected => write!(f, "DISCONNECTED"),
            ServerStatus::Error => write!(f, "ERROR"),
        }
    }
}

impl FromStr for ServerStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "REGISTERED" => Ok(ServerStatus::Registered),
            "CONNECTING" => Ok(ServerStatus::Connecting),
            "CONNECTED" => Ok(ServerStatus::Connected),
            "DEGRADED" => Ok(ServerStatus::Degraded),
            "DISCONNECTED" => Ok(ServerStatus::Disconnected),
            "ERROR" => Ok(ServerStatus::Error),
            other => Err(CoreError::InvalidValue(format!(
                "unknown server status: {other}"
            ))),
        }
    }
}

/// Registered external MCP server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalServer {
    pub id: Uuid,
    pub name: String,
    pub transport: TransportKind,
    pub config: TransportConfig,
    pub health_check_url: Option<String>,
    pub status: ServerStatus,
    pub last_error: Option<String>,
    pub tool_count: i64,
    pub registered_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub org_id: Option<String>,
    pub is_global: bool,
}

impl ExternalServer {
    pub fn scope(&self) -> Scope {
        Scope {
            org_id: self.org_id.clone(),
            is_global: self.is_global,
        }
    }
}

/// Registration request for an external server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSpec {
    pub name: String,
    pub transport: TransportKind,
    #[serde(flatten)]
    pub config: TransportConfig,
    #[serde(default)]
    pub health_check_url: Option<String>,
    #[serde(default)]
    pub scope: Scope,
}

impl ServerSpec {
    pub fn validate(&self) -> Result<()> {
        if !is_valid_ident(&self.name) {
            return Err(CoreError::InvalidServerName(self.name.clone()));
        }
        self.config.validate(self.transport)
    }
}

/// Join `<server>.<original_name>` into the aggregated namespace.
pub fn namespaced(server: &str, original: &str) -> String {
    format!("{server}.{original}")
}

/// Split a namespaced name into `(server, original_name)`.
///
/// Returns None for plain (internal) names.
pub fn split_namespaced(name: &str) -> Option<(&str, &str)> {
    let (server, rest) = name.split_once('.')?;
    if server.is_empty() || rest.is_empty() {
        return None;
    }
    Some((server, rest))
}

