//! Server configuration
//!
//! Loaded from a YAML file, then overridden by environment variables, then by
//! CLI flags. Every tunable has a serde default so a missing file still yields
//! a runnable configuration.

use crate::core::ServerSpec;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Top-level application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerSection,

    #[serde(default)]
    pub database: DatabaseSection,

    #[serde(default)]
    pub objects: ObjectsSection,

    #[serde(default)]
    pub embedding: EmbeddingSection,

    #[serde(default)]
    pub classifier: ClassifierSection,

    #[serde(default)]
    pub search: SearchSection,

    #[serde(default)]
    pub vector: VectorSection,

    #[serde(default)]
    pub cache: CacheSection,

    #[serde(default)]
    pub aggregator: AggregatorSection,

    #[serde(default)]
    pub hil: HilSection,

    #[serde(default)]
    pub auth: AuthSection,

    /// External MCP servers registered and connected at startup.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub servers: Vec<ServerSpec>,

    /// Internal capability modules enabled at startup.
    #[serde(default = "default_internal_modules")]
    pub internal_modules: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            server: ServerSection::default(),
            database: DatabaseSection::default(),
            objects: ObjectsSection::default(),
            embedding: EmbeddingSection::default(),
            classifier: ClassifierSection::default(),
            search: SearchSection::default(),
            vector: VectorSection::default(),
            cache: CacheSection::default(),
            aggregator: AggregatorSection::default(),
            hil: HilSection::default(),
            auth: AuthSection::default(),
            servers: Vec::new(),
            internal_modules: default_internal_modules(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        ServerSection {
            bind: default_bind(),
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSection {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        DatabaseSection {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectsSection {
    /// Root directory of the filesystem object store.
    #[serde(default = "default_objects_path")]
    pub path: String,
}

impl Default for ObjectsSection {
    fn default() -> Self {
        ObjectsSection {
            path: default_objects_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingSection {
    /// Remote embedding endpoint. When unset, the deterministic local
    /// embedder is used instead.
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default = "default_embedding_model")]
    pub model: String,

    #[serde(default = "default_embedding_dim")]
    pub dim: usize,
}

impl Default for EmbeddingSection {
    fn default() -> Self {
        EmbeddingSection {
            endpoint: None,
            model: default_embedding_model(),
            dim: default_embedding_dim(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierSection {
    /// Remote classification endpoint. When unset, the keyword heuristic
    /// classifier is used instead.
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default = "default_classifier_model")]
    pub model: String,

    /// Assignments below this confidence are dropped.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,

    /// Top assignment becomes primary only at or above this confidence.
    #[serde(default = "default_primary_confidence_threshold")]
    pub primary_confidence_threshold: f64,

    /// Maximum skill assignments kept per tool.
    #[serde(default = "default_max_skills_per_tool")]
    pub max_skills_per_tool: usize,
}

impl Default for ClassifierSection {
    fn default() -> Self {
        ClassifierSection {
            endpoint: None,
            model: default_classifier_model(),
            min_confidence: default_min_confidence(),
            primary_confidence_threshold: default_primary_confidence_threshold(),
            max_skills_per_tool: default_max_skills_per_tool(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchSection {
    /// Minimum skill similarity to enter stage two with a skill filter.
    #[serde(default = "default_skill_threshold")]
    pub skill_threshold: f32,

    /// Minimum tool similarity for a hit to be returned.
    #[serde(default = "default_tool_score_threshold")]
    pub tool_score_threshold: f32,

    #[serde(default = "default_search_limit")]
    pub default_limit: usize,
}

impl Default for SearchSection {
    fn default() -> Self {
        SearchSection {
            skill_threshold: default_skill_threshold(),
            tool_score_threshold: default_tool_score_threshold(),
            default_limit: default_search_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorSection {
    #[serde(default = "default_vector_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default = "default_vector_retry_base_delay_s")]
    pub retry_base_delay_s: f64,

    /// Occupancy fraction at which collection capacity warnings start.
    #[serde(default = "default_overflow_warn_pct")]
    pub overflow_warn_pct: f64,
}

impl Default for VectorSection {
    fn default() -> Self {
        VectorSection {
            retry_attempts: default_vector_retry_attempts(),
            retry_base_delay_s: default_vector_retry_base_delay_s(),
            overflow_warn_pct: default_overflow_warn_pct(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSection {
    /// Bumped on schema changes; invalidates every key of prior versions.
    #[serde(default = "default_cache_version")]
    pub version: u64,

    #[serde(default = "default_cache_ttl_s")]
    pub ttl_s: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        CacheSection {
            version: default_cache_version(),
            ttl_s: default_cache_ttl_s(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorSection {
    #[serde(default = "default_connection_timeout_s")]
    pub connection_timeout_s: u64,

    #[serde(default = "default_request_timeout_s")]
    pub request_timeout_s: u64,

    /// Shortened timeout used when forwarding to a DEGRADED server.
    #[serde(default = "default_degraded_timeout_s")]
    pub degraded_timeout_s: u64,

    #[serde(default = "default_health_interval_s")]
    pub health_interval_s: u64,

    #[serde(default = "default_health_timeout_s")]
    pub health_timeout_s: u64,

    #[serde(default = "default_health_failure_threshold")]
    pub health_failure_threshold: u32,

    #[serde(default = "default_drain_timeout_s")]
    pub drain_timeout_s: u64,

    /// Depth of each session's bounded request channel.
    #[serde(default = "default_session_queue_depth")]
    pub session_queue_depth: usize,
}

impl Default for AggregatorSection {
    fn default() -> Self {
        AggregatorSection {
            connection_timeout_s: default_connection_timeout_s(),
            request_timeout_s: default_request_timeout_s(),
            degraded_timeout_s: default_degraded_timeout_s(),
            health_interval_s: default_health_interval_s(),
            health_timeout_s: default_health_timeout_s(),
            health_failure_threshold: default_health_failure_threshold(),
            drain_timeout_s: default_drain_timeout_s(),
            session_queue_depth: default_session_queue_depth(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HilSection {
    #[serde(default = "default_hil_expiry_s")]
    pub expiry_s: u64,
}

impl Default for HilSection {
    fn default() -> Self {
        HilSection {
            expiry_s: default_hil_expiry_s(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSection {
    /// Remote token verification endpoint. When unset, only statically
    /// configured tokens (and anonymous access, if allowed) authenticate.
    #[serde(default)]
    pub verify_url: Option<String>,

    /// Allow unauthenticated requests, scoped to global records only.
    #[serde(default = "default_true")]
    pub allow_anonymous: bool,

    /// Static bearer tokens for local development and tests.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub static_tokens: Vec<StaticToken>,
}

impl Default for AuthSection {
    fn default() -> Self {
        AuthSection {
            verify_url: None,
            allow_anonymous: default_true(),
            static_tokens: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticToken {
    pub token: String,
    pub user_id: String,
    #[serde(default)]
    pub authorized_orgs: Vec<String>,
    /// Treat as an API key instead of a bearer token.
    #[serde(default)]
    pub api_key: bool,
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_db_path() -> String {
    "mcphub.db".to_string()
}

fn default_objects_path() -> String {
    "mcphub_objects".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_embedding_dim() -> usize {
    1536
}

fn default_classifier_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_min_confidence() -> f64 {
    0.30
}

fn default_primary_confidence_threshold() -> f64 {
    0.50
}

fn default_max_skills_per_tool() -> usize {
    3
}

fn default_skill_threshold() -> f32 {
    0.40
}

fn default_tool_score_threshold() -> f32 {
    0.30
}

fn default_search_limit() -> usize {
    10
}

fn default_vector_retry_attempts() -> u32 {
    3
}

fn default_vector_retry_base_delay_s() -> f64 {
    0.5
}

fn default_overflow_warn_pct() -> f64 {
    0.90
}

fn default_cache_version() -> u64 {
    1
}

fn default_cache_ttl_s() -> u64 {
    300
}

fn default_connection_timeout_s() -> u64 {
    30
}

fn default_request_timeout_s() -> u64 {
    60
}

fn default_degraded_timeout_s() -> u64 {
    15
}

fn default_health_interval_s() -> u64 {
    30
}

fn default_health_timeout_s() -> u64 {
    5
}

fn default_health_failure_threshold() -> u32 {
    3
}

fn default_drain_timeout_s() -> u64 {
    30
}

fn default_session_queue_depth() -> usize {
    32
}

fn default_hil_expiry_s() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_internal_modules() -> Vec<String> {
    vec!["echo".to_string(), "shell".to_string(), "docs".to_string()]
}

impl AppConfig {
    /// Load configuration from a YAML file, falling back to defaults when the
    /// file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!("Config file not found: {}, using defaults", path.display());
            return Ok(AppConfig::default());
        }

        tracing::info!("Loading config from: {}", path.display());
        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Apply environment variable overrides. Env wins over file values.
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("MCPHUB_BIND") {
            self.server.bind = v;
        }
        if let Ok(v) = std::env::var("MCPHUB_LOG_LEVEL") {
            self.server.log_level = v;
        }
        if let Ok(v) = std::env::var("MCPHUB_DATABASE_PATH") {
            self.database.path = v;
        }
        if let Ok(v) = std::env::var("MCPHUB_OBJECTS_PATH") {
            self.objects.path = v;
        }
        if let Ok(v) = std::env::var("MCPHUB_EMBEDDING_ENDPOINT") {
            self.embedding.endpoint = Some(v);
        }
        if let Ok(v) = std::env::var("MCPHUB_CLASSIFIER_ENDPOINT") {
            self.classifier.endpoint = Some(v);
        }
        if let Ok(v) = std::env::var("MCPHUB_AUTH_VERIFY_URL") {
            self.auth.verify_url = Some(v);
        }
        if let Ok(v) = std::env::var("MCPHUB_CACHE_VERSION") {
            if let Ok(n) = v.parse() {
                self.cache.version = n;
            }
        }
        if let Ok(v) = std::env::var("MCPHUB_CONNECTION_TIMEOUT_S") {
            if let Ok(n) = v.parse() {
                self.aggregator.connection_timeout_s = n;
            }
        }
        if let Ok(v) = std::env::var("MCPHUB_REQUEST_TIMEOUT_S") {
            if let Ok(n) = v.parse() {
                self.aggregator.request_timeout_s = n;
            }
        }
        if let Ok(v) = std::env::var("MCPHUB_SKILL_THRESHOLD") {
            if let Ok(n) = v.parse() {
                self.search.skill_threshold = n;
            }
        }
    }

    /// Validate ranges and cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.embedding.dim == 0 {
            return Err(ConfigError::Invalid("embedding.dim must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.search.skill_threshold) {
            return Err(ConfigError::Invalid(
                "search.skill_threshold must be within [0, 1]".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.search.tool_score_threshold) {
            return Err(ConfigError::Invalid(
                "search.tool_score_threshold must be within [0, 1]".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.classifier.min_confidence) {
            return Err(ConfigError::Invalid(
                "classifier.min_confidence must be within [0, 1]".into(),
            ));
        }
        if self.vector.retry_attempts == 0 {
            return Err(ConfigError::Invalid(
                "vector.retry_attempts must be >= 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.vector.overflow_warn_pct) {
            return Err(ConfigError::Invalid(
                "vector.overflow_warn_pct must be within [0, 1]".into(),
            ));
        }
        if self.aggregator.session_queue_depth == 0 {
            return Err(ConfigError::Invalid(
                "aggregator.session_queue_depth must be >= 1".into(),
            ));
        }
        for spec in &self.servers {
            spec.validate()
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        }
        Ok(())
    }
}
