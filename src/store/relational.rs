//! Relational registry store
//!
//! SQLite-backed system of record for:
//! - Tools, prompts, and resources (tenant-scoped, optionally server-owned)
//! - Skill categories and tool-skill assignments
//! - External server records
//!
//! Scoped name uniqueness is enforced by partial unique indexes. Deletes that
//! need accurate counts run as a single DELETE .. RETURNING statement so the
//! count and the removal commit together.

use crate::core::{
    AssignmentSource, ExternalServer, PromptRecord, PromptSpec, ResourceRecord, ResourceSpec,
    SecurityLevel, ServerStatus, SkillAssignment, SkillCategory, ToolRecord, ToolSpec,
    TransportKind,
};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    Conflict(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

fn now_ts() -> i64 {
    Utc::now().timestamp()
}

fn ts_to_datetime(ts: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(ts, 0)
        .ok_or_else(|| StoreError::InvalidData(format!("invalid timestamp: {ts}")))
}

fn map_unique(err: sqlx::Error, what: &str) -> StoreError {
    if let Some(db_err) = err.as_database_error() {
        if db_err.is_unique_violation() {
            return StoreError::Conflict(what.to_string());
        }
    }
    StoreError::Database(err)
}

/// SQLite-backed registry store
pub struct RegistryStore {
    pool: SqlitePool,
}

impl RegistryStore {
    /// Open (or create) the registry database at the given path.
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::InvalidData(format!("failed to create directory: {e}"))
                })?;
            }
        }

        let options =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))
                .map_err(|e| StoreError::InvalidData(format!("invalid database path: {e}")))?
                .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = RegistryStore { pool };
        store.init_schema().await?;

        info!("Registry store initialized at: {:?}", db_path);
        Ok(store)
    }

    /// In-memory store for tests and ephemeral runs.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StoreError::InvalidData(e.to_string()))?;

        // A single connection keeps the in-memory database shared.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = RegistryStore { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS mcp_tools (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                input_schema TEXT NOT NULL,
                annotations TEXT NOT NULL DEFAULT '{}',
                category TEXT,
                security_level TEXT NOT NULL DEFAULT 'low',
                org_id TEXT,
                is_global INTEGER NOT NULL DEFAULT 0,
                source_server_id TEXT,
                original_name TEXT,
                skill_ids TEXT NOT NULL DEFAULT '[]',
                primary_skill_id TEXT,
                is_classified INTEGER NOT NULL DEFAULT 0,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_tools_name_global
                ON mcp_tools(name) WHERE is_global = 1
            "#,
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_tools_name_org
                ON mcp_tools(name, COALESCE(org_id, '')) WHERE is_global = 0
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_tools_server ON mcp_tools(source_server_id)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS mcp_prompts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                arguments TEXT NOT NULL DEFAULT '[]',
                template TEXT,
                org_id TEXT,
                is_global INTEGER NOT NULL DEFAULT 0,
                source_server_id TEXT,
                original_name TEXT,
                skill_ids TEXT NOT NULL DEFAULT '[]',
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_prompts_name_global
                ON mcp_prompts(name) WHERE is_global = 1
            "#,
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_prompts_name_org
                ON mcp_prompts(name, COALESCE(org_id, '')) WHERE is_global = 0
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_prompts_server ON mcp_prompts(source_server_id)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS mcp_resources (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                uri TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                mime_type TEXT,
                owner TEXT,
                allowed_users TEXT NOT NULL DEFAULT '[]',
                org_id TEXT,
                is_global INTEGER NOT NULL DEFAULT 0,
                source_server_id TEXT,
                original_name TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_resources_name_global
                ON mcp_resources(name) WHERE is_global = 1
            "#,
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_resources_name_org
                ON mcp_resources(name, COALESCE(org_id, '')) WHERE is_global = 0
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_resources_server ON mcp_resources(source_server_id)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS mcp_skill_categories (
                id TEXT NOT NULL,
                name TEXT NOT NULL,
                description TEXT NOT NULL,
                keywords TEXT NOT NULL DEFAULT '[]',
                examples TEXT NOT NULL DEFAULT '[]',
                parent_domain TEXT,
                tool_count INTEGER NOT NULL DEFAULT 0,
                org_id TEXT,
                is_global INTEGER NOT NULL DEFAULT 0,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_skills_id_global
                ON mcp_skill_categories(id) WHERE is_global = 1
            "#,
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_skills_id_org
                ON mcp_skill_categories(id, COALESCE(org_id, '')) WHERE is_global = 0
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS mcp_tool_skill_assignments (
                tool_id INTEGER NOT NULL,
                skill_id TEXT NOT NULL,
                confidence REAL NOT NULL,
                is_primary INTEGER NOT NULL DEFAULT 0,
                source TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (tool_id, skill_id)
            )
            "#,
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_assignments_primary
                ON mcp_tool_skill_assignments(tool_id) WHERE is_primary = 1
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS mcp_external_servers (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                transport TEXT NOT NULL,
                config TEXT NOT NULL,
                health_check_url TEXT,
                status TEXT NOT NULL,
                last_error TEXT,
                tool_count INTEGER NOT NULL DEFAULT 0,
                registered_at INTEGER NOT NULL,
                connected_at INTEGER,
                last_health_check INTEGER,
                org_id TEXT,
                is_global INTEGER NOT NULL DEFAULT 1
            )
            "#,
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        debug!("Registry schema initialized");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ------------------------------------------------------------------
    // Tools
    // ------------------------------------------------------------------

    /// Insert a new tool. Fails with Conflict on scoped-name collisions.
    pub async fn insert_tool(&self, spec: &ToolSpec) -> Result<ToolRecord> {
        let now = now_ts();
        let result = sqlx::query(
            r#"
            INSERT INTO mcp_tools (
                name, description, input_schema, annotations, category,
                security_level, org_id, is_global, source_server_id,
                original_name, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
            "#,
        )
        .bind(&spec.name)
        .bind(&spec.description)
        .bind(serde_json::to_string(&spec.input_schema)?)
        .bind(serde_json::to_string(&spec.annotations)?)
        .bind(&spec.category)
        .bind(spec.security_level.to_string())
        .bind(&spec.scope.org_id)
        .bind(spec.scope.is_global as i32)
        .bind(spec.source_server_id.map(|u| u.to_string()))
        .bind(&spec.original_name)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique(e, &format!("tool {}", spec.name)))?;

        let id = result.last_insert_rowid();
        self.get_tool(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("tool {id}")))
    }

    /// Upsert a tool by its identity: `(source_server_id, original_name)` for
    /// external tools, `(name, scope)` for internal ones.
    ///
    /// Returns the record plus whether the descriptive text changed (which
    /// means the embedding is stale).
    pub async fn upsert_tool(&self, spec: &ToolSpec) -> Result<(ToolRecord, bool)> {
        let existing = match (spec.source_server_id, spec.original_name.as_deref()) {
            (Some(server_id), Some(original)) => {
                self.get_tool_by_origin(server_id, original).await?
            }
            _ => {
                self.find_tool_scoped(&spec.name, spec.scope.org_id.as_deref(), spec.scope.is_global)
                    .await?
            }
        };

        match existing {
            None => {
                let record = self.insert_tool(spec).await?;
                Ok((record, true))
            }
            Some(current) => {
                let text_changed = current.name != spec.name
                    || current.description != spec.description;
                let schema_changed = current.input_schema != spec.input_schema;
                if !text_changed
                    && !schema_changed
                    && current.annotations == spec.annotations
                    && current.is_active
                {
                    return Ok((current, false));
                }

                sqlx::query(
                    r#"
                    UPDATE mcp_tools
                    SET name = ?1, description = ?2, input_schema = ?3,
                        annotations = ?4, category = ?5, security_level = ?6,
                        is_active = 1, updated_at = ?7
                    WHERE id = ?8
                    "#,
                )
                .bind(&spec.name)
                .bind(&spec.description)
                .bind(serde_json::to_string(&spec.input_schema)?)
                .bind(serde_json::to_string(&spec.annotations)?)
                .bind(&spec.category)
                .bind(spec.security_level.to_string())
                .bind(now_ts())
                .bind(current.id)
                .execute(&self.pool)
                .await
                .map_err(|e| map_unique(e, &format!("tool {}", spec.name)))?;

                let record = self
                    .get_tool(current.id)
                    .await?
                    .ok_or_else(|| StoreError::NotFound(format!("tool {}", current.id)))?;
                Ok((record, text_changed))
            }
        }
    }

    pub async fn get_tool(&self, id: i64) -> Result<Option<ToolRecord>> {
        let row = sqlx::query("SELECT * FROM mcp_tools WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_tool).transpose()
    }

    async fn get_tool_by_origin(
        &self,
        server_id: Uuid,
        original_name: &str,
    ) -> Result<Option<ToolRecord>> {
        let row = sqlx::query(
            "SELECT * FROM mcp_tools WHERE source_server_id = ?1 AND original_name = ?2",
        )
        .bind(server_id.to_string())
        .bind(original_name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_tool).transpose()
    }

    async fn find_tool_scoped(
        &self,
        name: &str,
        org_id: Option<&str>,
        is_global: bool,
    ) -> Result<Option<ToolRecord>> {
        let row = if is_global {
            sqlx::query("SELECT * FROM mcp_tools WHERE name = ?1 AND is_global = 1")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?
        } else {
            sqlx::query(
                "SELECT * FROM mcp_tools WHERE name = ?1 AND is_global = 0 AND COALESCE(org_id, '') = ?2",
            )
            .bind(name)
            .bind(org_id.unwrap_or(""))
            .fetch_optional(&self.pool)
            .await?
        };
        row.map(row_to_tool).transpose()
    }

    /// Resolve a tool name from a caller's point of view: the caller's org
    /// record wins over the global one.
    pub async fn get_tool_by_name(
        &self,
        name: &str,
        org: Option<&str>,
    ) -> Result<Option<ToolRecord>> {
        if let Some(org) = org {
            if let Some(record) = self.find_tool_scoped(name, Some(org), false).await? {
                if record.is_active {
                    return Ok(Some(record));
                }
            }
        }
        let global = self.find_tool_scoped(name, None, true).await?;
        Ok(global.filter(|t| t.is_active))
    }

    /// List tools visible to the given org (global plus org-owned).
    pub async fn list_tools(
        &self,
        org: Option<&str>,
        include_inactive: bool,
    ) -> Result<Vec<ToolRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM mcp_tools
            WHERE (is_global = 1 OR (?1 IS NOT NULL AND org_id = ?1))
              AND (is_active = 1 OR ?2)
            ORDER BY name
            "#,
        )
        .bind(org)
        .bind(include_inactive as i32)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_tool).collect()
    }

    pub async fn list_tools_by_server(&self, server_id: Uuid) -> Result<Vec<ToolRecord>> {
        let rows = sqlx::query("SELECT * FROM mcp_tools WHERE source_server_id = ?1 ORDER BY name")
            .bind(server_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_tool).collect()
    }

    /// Deactivate internal tools whose names are not in the seen set.
    pub async fn deactivate_internal_tools_except(&self, seen: &[String]) -> Result<u64> {
        let placeholders = (0..seen.len())
            .map(|i| format!("?{}", i + 2))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = if seen.is_empty() {
            "UPDATE mcp_tools SET is_active = 0, updated_at = ?1 \
             WHERE source_server_id IS NULL AND is_active = 1"
                .to_string()
        } else {
            format!(
                "UPDATE mcp_tools SET is_active = 0, updated_at = ?1 \
                 WHERE source_server_id IS NULL AND is_active = 1 AND name NOT IN ({placeholders})"
            )
        };

        let mut query = sqlx::query(&sql).bind(now_ts());
        for name in seen {
            query = query.bind(name);
        }
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// Delete every tool owned by a server in one atomic statement.
    ///
    /// Returns the deleted ids; the count is exact at commit time.
    pub async fn delete_tools_by_server(&self, server_id: Uuid) -> Result<Vec<i64>> {
        let rows = sqlx::query("DELETE FROM mcp_tools WHERE source_server_id = ?1 RETURNING id")
            .bind(server_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        let ids: Vec<i64> = rows.iter().map(|r| r.get::<i64, _>("id")).collect();

        if !ids.is_empty() {
            let placeholders = (0..ids.len())
                .map(|i| format!("?{}", i + 1))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "DELETE FROM mcp_tool_skill_assignments WHERE tool_id IN ({placeholders})"
            );
            let mut query = sqlx::query(&sql);
            for id in &ids {
                query = query.bind(id);
            }
            query.execute(&self.pool).await?;
        }

        Ok(ids)
    }

    /// Write a tool's classification outcome transactionally: replaces prior
    /// assignment rows of the classifier's source and updates the
    /// denormalized columns.
    pub async fn set_tool_classification(
        &self,
        tool_id: i64,
        skill_ids: &[String],
        primary_skill_id: Option<&str>,
        assignments: &[SkillAssignment],
        reset_source: AssignmentSource,
    ) -> Result<()> {
        let now = now_ts();
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM mcp_tool_skill_assignments WHERE tool_id = ?1 AND source = ?2")
            .bind(tool_id)
            .bind(reset_source.to_string())
            .execute(&mut *tx)
            .await?;

        for assignment in assignments {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO mcp_tool_skill_assignments
                    (tool_id, skill_id, confidence, is_primary, source, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
            )
            .bind(assignment.tool_id)
            .bind(&assignment.skill_id)
            .bind(assignment.confidence)
            .bind(assignment.is_primary as i32)
            .bind(assignment.source.to_string())
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            UPDATE mcp_tools
            SET skill_ids = ?1, primary_skill_id = ?2, is_classified = 1, updated_at = ?3
            WHERE id = ?4
            "#,
        )
        .bind(serde_json::to_string(skill_ids)?)
        .bind(primary_skill_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn assignments_for_tool(&self, tool_id: i64) -> Result<Vec<SkillAssignment>> {
        let rows = sqlx::query(
            "SELECT * FROM mcp_tool_skill_assignments WHERE tool_id = ?1 ORDER BY confidence DESC",
        )
        .bind(tool_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_assignment).collect()
    }

    /// Active tools assigned to a skill, visible to the given org.
    pub async fn tools_for_skill(
        &self,
        skill_id: &str,
        org: Option<&str>,
    ) -> Result<Vec<ToolRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT t.* FROM mcp_tools t
            JOIN mcp_tool_skill_assignments a ON a.tool_id = t.id
            WHERE a.skill_id = ?1
              AND t.is_active = 1
              AND (t.is_global = 1 OR (?2 IS NOT NULL AND t.org_id = ?2))
            ORDER BY a.confidence DESC, t.id
            "#,
        )
        .bind(skill_id)
        .bind(org)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_tool).collect()
    }

    // ------------------------------------------------------------------
    // Prompts
    // ------------------------------------------------------------------

    pub async fn upsert_prompt(&self, spec: &PromptSpec) -> Result<(PromptRecord, bool)> {
        let existing = match (spec.source_server_id, spec.original_name.as_deref()) {
            (Some(server_id), Some(original)) => {
                let row = sqlx::query(
                    "SELECT * FROM mcp_prompts WHERE source_server_id = ?1 AND original_name = ?2",
                )
                .bind(server_id.to_string())
                .bind(original)
                .fetch_optional(&self.pool)
                .await?;
                row.map(row_to_prompt).transpose()?
            }
            _ => {
                let row = if spec.scope.is_global {
                    sqlx::query("SELECT * FROM mcp_prompts WHERE name = ?1 AND is_global = 1")
                        .bind(&spec.name)
                        .fetch_optional(&self.pool)
                        .await?
                } else {
                    sqlx::query(
                        "SELECT * FROM mcp_prompts WHERE name = ?1 AND is_global = 0 AND COALESCE(org_id, '') = ?2",
                    )
                    .bind(&spec.name)
                    .bind(spec.scope.org_id.as_deref().unwrap_or(""))
                    .fetch_optional(&self.pool)
                    .await?
                };
                row.map(row_to_prompt).transpose()?
            }
        };

        let now = now_ts();
        match existing {
            None => {
                let result = sqlx::query(
                    r#"
                    INSERT INTO mcp_prompts (
                        name, description, arguments, template, org_id, is_global,
                        source_server_id, original_name, created_at, updated_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
                    "#,
                )
                .bind(&spec.name)
                .bind(&spec.description)
                .bind(serde_json::to_string(&spec.arguments)?)
                .bind(&spec.template)
                .bind(&spec.scope.org_id)
                .bind(spec.scope.is_global as i32)
                .bind(spec.source_server_id.map(|u| u.to_string()))
                .bind(&spec.original_name)
                .bind(now)
                .execute(&self.pool)
                .await
                .map_err(|e| map_unique(e, &format!("prompt {}", spec.name)))?;

                let id = result.last_insert_rowid();
                let record = self
                    .get_prompt(id)
                    .await?
                    .ok_or_else(|| StoreError::NotFound(format!("prompt {id}")))?;
                Ok((record, true))
            }
            Some(current) => {
                let text_changed = current.name != spec.name
                    || current.description != spec.description;
                if !text_changed
                    && current.arguments == spec.arguments
                    && current.template == spec.template
                    && current.is_active
                {
                    return Ok((current, false));
                }

                sqlx::query(
                    r#"
                    UPDATE mcp_prompts
                    SET name = ?1, description = ?2, arguments = ?3, template = ?4,
                        is_active = 1, updated_at = ?5
                    WHERE id = ?6
                    "#,
                )
                .bind(&spec.name)
                .bind(&spec.description)
                .bind(serde_json::to_string(&spec.arguments)?)
                .bind(&spec.template)
                .bind(now)
                .bind(current.id)
                .execute(&self.pool)
                .await
                .map_err(|e| map_unique(e, &format!("prompt {}", spec.name)))?;

                let record = self
                    .get_prompt(current.id)
                    .await?
                    .ok_or_else(|| StoreError::NotFound(format!("prompt {}", current.id)))?;
                Ok((record, text_changed))
            }
        }
    }

    pub async fn get_prompt(&self, id: i64) -> Result<Option<PromptRecord>> {
        let row = sqlx::query("SELECT * FROM mcp_prompts WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_prompt).transpose()
    }

    pub async fn get_prompt_by_name(
        &self,
        name: &str,
        org: Option<&str>,
    ) -> Result<Option<PromptRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM mcp_prompts
            WHERE name = ?1 AND is_active = 1
              AND (is_global = 1 OR (?2 IS NOT NULL AND org_id = ?2))
            ORDER BY is_global ASC
            "#,
        )
        .bind(name)
        .bind(org)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().next().map(row_to_prompt).transpose()
    }

    pub async fn list_prompts(
        &self,
        org: Option<&str>,
        include_inactive: bool,
    ) -> Result<Vec<PromptRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM mcp_prompts
            WHERE (is_global = 1 OR (?1 IS NOT NULL AND org_id = ?1))
              AND (is_active = 1 OR ?2)
            ORDER BY name
            "#,
        )
        .bind(org)
        .bind(include_inactive as i32)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_prompt).collect()
    }

    pub async fn deactivate_internal_prompts_except(&self, seen: &[String]) -> Result<u64> {
        let placeholders = (0..seen.len())
            .map(|i| format!("?{}", i + 2))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = if seen.is_empty() {
            "UPDATE mcp_prompts SET is_active = 0, updated_at = ?1 \
             WHERE source_server_id IS NULL AND is_active = 1"
                .to_string()
        } else {
            format!(
                "UPDATE mcp_prompts SET is_active = 0, updated_at = ?1 \
                 WHERE source_server_id IS NULL AND is_active = 1 AND name NOT IN ({placeholders})"
            )
        };
        let mut query = sqlx::query(&sql).bind(now_ts());
        for name in seen {
            query = query.bind(name);
        }
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    pub async fn delete_prompts_by_server(&self, server_id: Uuid) -> Result<Vec<i64>> {
        let rows = sqlx::query("DELETE FROM mcp_prompts WHERE source_server_id = ?1 RETURNING id")
            .bind(server_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get::<i64, _>("id")).collect())
    }

    // ------------------------------------------------------------------
    // Resources
    // ------------------------------------------------------------------

    pub async fn upsert_resource(&self, spec: &ResourceSpec) -> Result<(ResourceRecord, bool)> {
        let existing = match (spec.source_server_id, spec.original_name.as_deref()) {
            (Some(server_id), Some(original)) => {
                let row = sqlx::query(
                    "SELECT * FROM mcp_resources WHERE source_server_id = ?1 AND original_name = ?2",
                )
                .bind(server_id.to_string())
                .bind(original)
                .fetch_optional(&self.pool)
                .await?;
                row.map(row_to_resource).transpose()?
            }
            _ => {
                let row = if spec.scope.is_global {
                    sqlx::query("SELECT * FROM mcp_resources WHERE name = ?1 AND is_global = 1")
                        .bind(&spec.name)
                        .fetch_optional(&self.pool)
                        .await?
                } else {
                    sqlx::query(
                        "SELECT * FROM mcp_resources WHERE name = ?1 AND is_global = 0 AND COALESCE(org_id, '') = ?2",
                    )
                    .bind(&spec.name)
                    .bind(spec.scope.org_id.as_deref().unwrap_or(""))
                    .fetch_optional(&self.pool)
                    .await?
                };
                row.map(row_to_resource).transpose()?
            }
        };

        let now = now_ts();
        match existing {
            None => {
                let result = sqlx::query(
                    r#"
                    INSERT INTO mcp_resources (
                        name, uri, description, mime_type, owner, allowed_users,
                        org_id, is_global, source_server_id, original_name,
                        created_at, updated_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
                    "#,
                )
                .bind(&spec.name)
                .bind(&spec.uri)
                .bind(&spec.description)
                .bind(&spec.mime_type)
                .bind(&spec.owner)
                .bind(serde_json::to_string(&spec.allowed_users)?)
                .bind(&spec.scope.org_id)
                .bind(spec.scope.is_global as i32)
                .bind(spec.source_server_id.map(|u| u.to_string()))
                .bind(&spec.original_name)
                .bind(now)
                .execute(&self.pool)
                .await
                .map_err(|e| map_unique(e, &format!("resource {}", spec.name)))?;

                let id = result.last_insert_rowid();
                let record = self
                    .get_resource(id)
                    .await?
                    .ok_or_else(|| StoreError::NotFound(format!("resource {id}")))?;
                Ok((record, true))
            }
            Some(current) => {
                let text_changed = current.name != spec.name
                    || current.description != spec.description;
                if !text_changed && current.uri == spec.uri && current.is_active {
                    return Ok((current, false));
                }

                sqlx::query(
                    r#"
                    UPDATE mcp_resources
                    SET name = ?1, uri = ?2, description = ?3, mime_type = ?4,
                        is_active = 1, updated_at = ?5
                    WHERE id = ?6
                    "#,
                )
                .bind(&spec.name)
                .bind(&spec.uri)
                .bind(&spec.description)
                .bind(&spec.mime_type)
                .bind(now)
                .bind(current.id)
                .execute(&self.pool)
                .await
                .map_err(|e| map_unique(e, &format!("resource {}", spec.name)))?;

                let record = self
                    .get_resource(current.id)
                    .await?
                    .ok_or_else(|| StoreError::NotFound(format!("resource {}", current.id)))?;
                Ok((record, text_changed))
            }
        }
    }

    pub async fn get_resource(&self, id: i64) -> Result<Option<ResourceRecord>> {
        let row = sqlx::query("SELECT * FROM mcp_resources WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_resource).transpose()
    }

    pub async fn get_resource_by_uri(
        &self,
        uri: &str,
        org: Option<&str>,
    ) -> Result<Option<ResourceRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM mcp_resources
            WHERE uri = ?1 AND is_active = 1
              AND (is_global = 1 OR (?2 IS NOT NULL AND org_id = ?2))
            ORDER BY is_global ASC
            "#,
        )
        .bind(uri)
        .bind(org)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().next().map(row_to_resource).transpose()
    }

    pub async fn list_resources(
        &self,
        org: Option<&str>,
        include_inactive: bool,
    ) -> Result<Vec<ResourceRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM mcp_resources
            WHERE (is_global = 1 OR (?1 IS NOT NULL AND org_id = ?1))
              AND (is_active = 1 OR ?2)
            ORDER BY name
            "#,
        )
        .bind(org)
        .bind(include_inactive as i32)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_resource).collect()
    }

    pub async fn deactivate_internal_resources_except(&self, seen: &[String]) -> Result<u64> {
        let placeholders = (0..seen.len())
            .map(|i| format!("?{}", i + 2))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = if seen.is_empty() {
            "UPDATE mcp_resources SET is_active = 0, updated_at = ?1 \
             WHERE source_server_id IS NULL AND is_active = 1"
                .to_string()
        } else {
            format!(
                "UPDATE mcp_resources SET is_active = 0, updated_at = ?1 \
                 WHERE source_server_id IS NULL AND is_active = 1 AND name NOT IN ({placeholders})"
            )
        };
        let mut query = sqlx::query(&sql).bind(now_ts());
        for name in seen {
            query = query.bind(name);
        }
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    pub async fn delete_resources_by_server(&self, server_id: Uuid) -> Result<Vec<i64>> {
        let rows =
            sqlx::query("DELETE FROM mcp_resources WHERE source_server_id = ?1 RETURNING id")
                .bind(server_id.to_string())
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.iter().map(|r| r.get::<i64, _>("id")).collect())
    }

    // ------------------------------------------------------------------
    // Skill categories
    // ------------------------------------------------------------------

    pub async fn insert_skill(&self, skill: &SkillCategory) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO mcp_skill_categories (
                id, name, description, keywords, examples, parent_domain,
                tool_count, org_id, is_global, is_active, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(&skill.id)
        .bind(&skill.name)
        .bind(&skill.description)
        .bind(serde_json::to_string(&skill.keywords)?)
        .bind(serde_json::to_string(&skill.examples)?)
        .bind(&skill.parent_domain)
        .bind(skill.tool_count)
        .bind(&skill.org_id)
        .bind(skill.is_global as i32)
        .bind(skill.is_active as i32)
        .bind(skill.created_at.timestamp())
        .bind(skill.updated_at.timestamp())
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique(e, &format!("skill {}", skill.id)))?;
        Ok(())
    }

    pub async fn update_skill(&self, skill: &SkillCategory) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE mcp_skill_categories
            SET name = ?1, description = ?2, keywords = ?3, examples = ?4,
                parent_domain = ?5, is_active = ?6, updated_at = ?7
            WHERE id = ?8
              AND ((is_global = 1 AND ?9 = 1)
                   OR (is_global = 0 AND COALESCE(org_id, '') = ?10))
            "#,
        )
        .bind(&skill.name)
        .bind(&skill.description)
        .bind(serde_json::to_string(&skill.keywords)?)
        .bind(serde_json::to_string(&skill.examples)?)
        .bind(&skill.parent_domain)
        .bind(skill.is_active as i32)
        .bind(now_ts())
        .bind(&skill.id)
        .bind(skill.is_global as i32)
        .bind(skill.org_id.as_deref().unwrap_or(""))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("skill {}", skill.id)));
        }
        Ok(())
    }

    /// Resolve a skill id from a caller's point of view (org wins over global).
    pub async fn get_skill(&self, id: &str, org: Option<&str>) -> Result<Option<SkillCategory>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM mcp_skill_categories
            WHERE id = ?1
              AND (is_global = 1 OR (?2 IS NOT NULL AND org_id = ?2))
            ORDER BY is_global ASC
            "#,
        )
        .bind(id)
        .bind(org)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().next().map(row_to_skill).transpose()
    }

    pub async fn list_skills(
        &self,
        org: Option<&str>,
        include_inactive: bool,
    ) -> Result<Vec<SkillCategory>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM mcp_skill_categories
            WHERE (is_global = 1 OR (?1 IS NOT NULL AND org_id = ?1))
              AND (is_active = 1 OR ?2)
            ORDER BY id
            "#,
        )
        .bind(org)
        .bind(include_inactive as i32)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_skill).collect()
    }

    /// Recompute the denormalized tool count for one skill.
    pub async fn refresh_skill_tool_count(&self, skill_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM mcp_tool_skill_assignments a
            JOIN mcp_tools t ON t.id = a.tool_id
            WHERE a.skill_id = ?1 AND t.is_active = 1
            "#,
        )
        .bind(skill_id)
        .fetch_one(&self.pool)
        .await?;

        sqlx::query("UPDATE mcp_skill_categories SET tool_count = ?1 WHERE id = ?2")
            .bind(count)
            .bind(skill_id)
            .execute(&self.pool)
            .await?;
        Ok(count)
    }

    // ------------------------------------------------------------------
    // External servers
    // ------------------------------------------------------------------

    pub async fn insert_server(&self, server: &ExternalServer) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO mcp_external_servers (
                id, name, transport, config, health_check_url, status,
                last_error, tool_count, registered_at, connected_at,
                last_health_check, org_id, is_global
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
        )
        .bind(server.id.to_string())
        .bind(&server.name)
        .bind(server.transport.to_string())
        .bind(serde_json::to_string(&server.config)?)
        .bind(&server.health_check_url)
        .bind(server.status.to_string())
        .bind(&server.last_error)
        .bind(server.tool_count)
        .bind(server.registered_at.timestamp())
        .bind(server.connected_at.map(|t| t.timestamp()))
        .bind(server.last_health_check.map(|t| t.timestamp()))
        .bind(&server.org_id)
        .bind(server.is_global as i32)
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique(e, &format!("server {}", server.name)))?;
        Ok(())
    }

    pub async fn get_server(&self, id: Uuid) -> Result<Option<ExternalServer>> {
        let row = sqlx::query("SELECT * FROM mcp_external_servers WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_server).transpose()
    }

    pub async fn get_server_by_name(&self, name: &str) -> Result<Option<ExternalServer>> {
        let row = sqlx::query("SELECT * FROM mcp_external_servers WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_server).transpose()
    }

    pub async fn list_servers(&self, org: Option<&str>) -> Result<Vec<ExternalServer>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM mcp_external_servers
            WHERE (is_global = 1 OR (?1 IS NOT NULL AND org_id = ?1))
            ORDER BY name
            "#,
        )
        .bind(org)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_server).collect()
    }

    pub async fn update_server_status(
        &self,
        id: Uuid,
        status: ServerStatus,
        last_error: Option<&str>,
    ) -> Result<()> {
        let connected_at = if status == ServerStatus::Connected {
            Some(now_ts())
        } else {
            None
        };
        sqlx::query(
            r#"
            UPDATE mcp_external_servers
            SET status = ?1, last_error = ?2,
                connected_at = COALESCE(?3, connected_at)
            WHERE id = ?4
            "#,
        )
        .bind(status.to_string())
        .bind(last_error)
        .bind(connected_at)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn touch_server_health(&self, id: Uuid, status: ServerStatus) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE mcp_external_servers
            SET status = ?1, last_health_check = ?2
            WHERE id = ?3
            "#,
        )
        .bind(status.to_string())
        .bind(now_ts())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_server_tool_count(&self, id: Uuid, count: i64) -> Result<()> {
        sqlx::query("UPDATE mcp_external_servers SET tool_count = ?1 WHERE id = ?2")
            .bind(count)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_server(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM mcp_external_servers WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Capability counts for the health endpoint.
    pub async fn capability_counts(&self) -> Result<(i64, i64, i64)> {
        let tools: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM mcp_tools WHERE is_active = 1")
            .fetch_one(&self.pool)
            .await?;
        let prompts: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM mcp_prompts WHERE is_active = 1")
                .fetch_one(&self.pool)
                .await?;
        let resources: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM mcp_resources WHERE is_active = 1")
                .fetch_one(&self.pool)
                .await?;
        Ok((tools, prompts, resources))
    }
}

/// Per-kind outcome of a listing reconciliation
#[derive(Debug, Default, Clone)]
pub struct KindDelta {
    /// `(row id, descriptive text changed)` for every inserted/updated row.
    pub upserted: Vec<(i64, bool)>,
    pub deleted_ids: Vec<i64>,
}

/// Outcome of reconciling one server's remote listing
#[derive(Debug, Default, Clone)]
pub struct ListingDelta {
    pub tools: KindDelta,
    pub prompts: KindDelta,
    pub resources: KindDelta,
}

impl RegistryStore {
    /// Reconcile a server's capability listing in one transaction: insert new
    /// records, update drifted ones, and delete records the server no longer
    /// advertises (single DELETE .. RETURNING per table, so counts are exact
    /// at commit time).
    pub async fn apply_remote_listing(
        &self,
        server_id: Uuid,
        tools: &[ToolSpec],
        prompts: &[PromptSpec],
        resources: &[ResourceSpec],
    ) -> Result<ListingDelta> {
        let now = now_ts();
        let server = server_id.to_string();
        let mut tx = self.pool.begin().await?;
        let mut delta = ListingDelta::default();

        // --- tools ---
        let existing = sqlx::query("SELECT * FROM mcp_tools WHERE source_server_id = ?1")
            .bind(&server)
            .fetch_all(&mut *tx)
            .await?;
        let mut by_original: std::collections::HashMap<String, ToolRecord> = existing
            .into_iter()
            .map(row_to_tool)
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .filter_map(|t| t.original_name.clone().map(|o| (o, t)))
            .collect();

        for spec in tools {
            let original = spec
                .original_name
                .clone()
                .ok_or_else(|| StoreError::InvalidData("external tool without original_name".into()))?;
            match by_original.remove(&original) {
                None => {
                    let result = sqlx::query(
                        r#"
                        INSERT INTO mcp_tools (
                            name, description, input_schema, annotations, category,
                            security_level, org_id, is_global, source_server_id,
                            original_name, created_at, updated_at
                        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
                        "#,
                    )
                    .bind(&spec.name)
                    .bind(&spec.description)
                    .bind(serde_json::to_string(&spec.input_schema)?)
                    .bind(serde_json::to_string(&spec.annotations)?)
                    .bind(&spec.category)
                    .bind(spec.security_level.to_string())
                    .bind(&spec.scope.org_id)
                    .bind(spec.scope.is_global as i32)
                    .bind(&server)
                    .bind(&original)
                    .bind(now)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| map_unique(e, &format!("tool {}", spec.name)))?;
                    delta.tools.upserted.push((result.last_insert_rowid(), true));
                }
                Some(current) => {
                    let text_changed =
                        current.name != spec.name || current.description != spec.description;
                    let changed = text_changed
                        || current.input_schema != spec.input_schema
                        || !current.is_active;
                    if changed {
                        sqlx::query(
                            r#"
                            UPDATE mcp_tools
                            SET name = ?1, description = ?2, input_schema = ?3,
                                is_active = 1, updated_at = ?4
                            WHERE id = ?5
                            "#,
                        )
                        .bind(&spec.name)
                        .bind(&spec.description)
                        .bind(serde_json::to_string(&spec.input_schema)?)
                        .bind(now)
                        .bind(current.id)
                        .execute(&mut *tx)
                        .await?;
                        delta.tools.upserted.push((current.id, text_changed));
                    }
                }
            }
        }

        let stale_tool_ids: Vec<i64> = by_original.values().map(|t| t.id).collect();
        if !stale_tool_ids.is_empty() {
            let placeholders = (0..stale_tool_ids.len())
                .map(|i| format!("?{}", i + 1))
                .collect::<Vec<_>>()
                .join(", ");
            let sql =
                format!("DELETE FROM mcp_tools WHERE id IN ({placeholders}) RETURNING id");
            let mut query = sqlx::query(&sql);
            for id in &stale_tool_ids {
                query = query.bind(id);
            }
            let rows = query.fetch_all(&mut *tx).await?;
            delta.tools.deleted_ids = rows.iter().map(|r| r.get::<i64, _>("id")).collect();

            let sql = format!(
                "DELETE FROM mcp_tool_skill_assignments WHERE tool_id IN ({placeholders})"
            );
            let mut query = sqlx::query(&sql);
            for id in &stale_tool_ids {
                query = query.bind(id);
            }
            query.execute(&mut *tx).await?;
        }

        // --- prompts ---
        let existing = sqlx::query("SELECT * FROM mcp_prompts WHERE source_server_id = ?1")
            .bind(&server)
            .fetch_all(&mut *tx)
            .await?;
        let mut by_original: std::collections::HashMap<String, PromptRecord> = existing
            .into_iter()
            .map(row_to_prompt)
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .filter_map(|p| p.original_name.clone().map(|o| (o, p)))
            .collect();

        for spec in prompts {
            let original = spec.original_name.clone().ok_or_else(|| {
                StoreError::InvalidData("external prompt without original_name".into())
            })?;
            match by_original.remove(&original) {
                None => {
                    let result = sqlx::query(
                        r#"
                        INSERT INTO mcp_prompts (
                            name, description, arguments, template, org_id, is_global,
                            source_server_id, original_name, created_at, updated_at
                        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
                        "#,
                    )
                    .bind(&spec.name)
                    .bind(&spec.description)
                    .bind(serde_json::to_string(&spec.arguments)?)
                    .bind(&spec.template)
                    .bind(&spec.scope.org_id)
                    .bind(spec.scope.is_global as i32)
                    .bind(&server)
                    .bind(&original)
                    .bind(now)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| map_unique(e, &format!("prompt {}", spec.name)))?;
                    delta
                        .prompts
                        .upserted
                        .push((result.last_insert_rowid(), true));
                }
                Some(current) => {
                    let text_changed =
                        current.name != spec.name || current.description != spec.description;
                    if text_changed || current.arguments != spec.arguments || !current.is_active {
                        sqlx::query(
                            r#"
                            UPDATE mcp_prompts
                            SET name = ?1, description = ?2, arguments = ?3,
                                is_active = 1, updated_at = ?4
                            WHERE id = ?5
                            "#,
                        )
                        .bind(&spec.name)
                        .bind(&spec.description)
                        .bind(serde_json::to_string(&spec.arguments)?)
                        .bind(now)
                        .bind(current.id)
                        .execute(&mut *tx)
                        .await?;
                        delta.prompts.upserted.push((current.id, text_changed));
                    }
                }
            }
        }

        let stale_prompt_ids: Vec<i64> = by_original.values().map(|p| p.id).collect();
        if !stale_prompt_ids.is_empty() {
            let placeholders = (0..stale_prompt_ids.len())
                .map(|i| format!("?{}", i + 1))
                .collect::<Vec<_>>()
                .join(", ");
            let sql =
                format!("DELETE FROM mcp_prompts WHERE id IN ({placeholders}) RETURNING id");
            let mut query = sqlx::query(&sql);
            for id in &stale_prompt_ids {
                query = query.bind(id);
            }
            let rows = query.fetch_all(&mut *tx).await?;
            delta.prompts.deleted_ids = rows.iter().map(|r| r.get::<i64, _>("id")).collect();
        }

        // --- resources ---
        let existing = sqlx::query("SELECT * FROM mcp_resources WHERE source_server_id = ?1")
            .bind(&server)
            .fetch_all(&mut *tx)
            .await?;
        let mut by_original: std::collections::HashMap<String, ResourceRecord> = existing
            .into_iter()
            .map(row_to_resource)
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .filter_map(|r| r.original_name.clone().map(|o| (o, r)))
            .collect();

        for spec in resources {
            let original = spec.original_name.clone().ok_or_else(|| {
                StoreError::InvalidData("external resource without original_name".into())
            })?;
            match by_original.remove(&original) {
                None => {
                    let result = sqlx::query(
                        r#"
                        INSERT INTO mcp_resources (
                            name, uri, description, mime_type, owner, allowed_users,
                            org_id, is_global, source_server_id, original_name,
                            created_at, updated_at
                        ) VALUES (?1, ?2, ?3, ?4, NULL, '[]', ?5, ?6, ?7, ?8, ?9, ?9)
                        "#,
                    )
                    .bind(&spec.name)
                    .bind(&spec.uri)
                    .bind(&spec.description)
                    .bind(&spec.mime_type)
                    .bind(&spec.scope.org_id)
                    .bind(spec.scope.is_global as i32)
                    .bind(&server)
                    .bind(&original)
                    .bind(now)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| map_unique(e, &format!("resource {}", spec.name)))?;
                    delta
                        .resources
                        .upserted
                        .push((result.last_insert_rowid(), true));
                }
                Some(current) => {
                    let text_changed =
                        current.name != spec.name || current.description != spec.description;
                    if text_changed || current.uri != spec.uri || !current.is_active {
                        sqlx::query(
                            r#"
                            UPDATE mcp_resources
                            SET name = ?1, uri = ?2, description = ?3,
                                is_active = 1, updated_at = ?4
                            WHERE id = ?5
                            "#,
                        )
                        .bind(&spec.name)
                        .bind(&spec.uri)
                        .bind(&spec.description)
                        .bind(now)
                        .bind(current.id)
                        .execute(&mut *tx)
                        .await?;
                        delta.resources.upserted.push((current.id, text_changed));
                    }
                }
            }
        }

        let stale_resource_ids: Vec<i64> = by_original.values().map(|r| r.id).collect();
        if !stale_resource_ids.is_empty() {
            let placeholders = (0..stale_resource_ids.len())
                .map(|i| format!("?{}", i + 1))
                .collect::<Vec<_>>()
                .join(", ");
            let sql =
                format!("DELETE FROM mcp_resources WHERE id IN ({placeholders}) RETURNING id");
            let mut query = sqlx::query(&sql);
            for id in &stale_resource_ids {
                query = query.bind(id);
            }
            let rows = query.fetch_all(&mut *tx).await?;
            delta.resources.deleted_ids = rows.iter().map(|r| r.get::<i64, _>("id")).collect();
        }

        tx.commit().await?;
        Ok(delta)
    }
}

// ----------------------------------------------------------------------
// Row conversion
// ----------------------------------------------------------------------

fn parse_uuid(s: Option<String>) -> Result<Option<Uuid>> {
    s.map(|v| {
        Uuid::parse_str(&v).map_err(|e| StoreError::InvalidData(format!("invalid uuid: {e}")))
    })
    .transpose()
}

fn row_to_tool(row: SqliteRow) -> Result<ToolRecord> {
    let input_schema: String = row.get("input_schema");
    let annotations: String = row.get("annotations");
    let skill_ids: String = row.get("skill_ids");
    let security_level: String = row.get("security_level");
    let source_server_id: Option<String> = row.get("source_server_id");

    Ok(ToolRecord {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        input_schema: serde_json::from_str(&input_schema)?,
        annotations: serde_json::from_str(&annotations)?,
        category: row.get("category"),
        security_level: SecurityLevel::from_str(&security_level)
            .map_err(|e| StoreError::InvalidData(e.to_string()))?,
        org_id: row.get("org_id"),
        is_global: row.get::<i32, _>("is_global") != 0,
        source_server_id: parse_uuid(source_server_id)?,
        original_name: row.get("original_name"),
        skill_ids: serde_json::from_str(&skill_ids)?,
        primary_skill_id: row.get("primary_skill_id"),
        is_classified: row.get::<i32, _>("is_classified") != 0,
        is_active: row.get::<i32, _>("is_active") != 0,
        created_at: ts_to_datetime(row.get("created_at"))?,
        updated_at: ts_to_datetime(row.get("updated_at"))?,
    })
}

fn row_to_prompt(row: SqliteRow) -> Result<PromptRecord> {
    let arguments: String = row.get("arguments");
    let skill_ids: String = row.get("skill_ids");
    let source_server_id: Option<String> = row.get("source_server_id");

    Ok(PromptRecord {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        arguments: serde_json::from_str(&arguments)?,
        template: row.get("template"),
        org_id: row.get("org_id"),
        is_global: row.get::<i32, _>("is_global") != 0,
        source_server_id: parse_uuid(source_server_id)?,
        original_name: row.get("original_name"),
        skill_ids: serde_json::from_str(&skill_ids)?,
        is_active: row.get::<i32, _>("is_active") != 0,
        created_at: ts_to_datetime(row.get("created_at"))?,
        updated_at: ts_to_datetime(row.get("updated_at"))?,
    })
}

fn row_to_resource(row: SqliteRow) -> Result<ResourceRecord> {
    let allowed_users: String = row.get("allowed_users");
    let source_server_id: Option<String> = row.get("source_server_id");

    Ok(ResourceRecord {
        id: row.get("id"),
        name: row.get("name"),
        uri: row.get("uri"),
        description: row.get("description"),
        mime_type: row.get("mime_type"),
        owner: row.get("owner"),
        allowed_users: serde_json::from_str(&allowed_users)?,
        org_id: row.get("org_id"),
        is_global: row.get::<i32, _>("is_global") != 0,
        source_server_id: parse_uuid(source_server_id)?,
        original_name: row.get("original_name"),
        is_active: row.get::<i32, _>("is_active") != 0,
        created_at: ts_to_datetime(row.get("created_at"))?,
        updated_at: ts_to_datetime(row.get("updated_at"))?,
    })
}

fn row_to_skill(row: SqliteRow) -> Result<SkillCategory> {
    let keywords: String = row.get("keywords");
    let examples: String = row.get("examples");

    Ok(SkillCategory {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        keywords: serde_json::from_str(&keywords)?,
        examples: serde_json::from_str(&examples)?,
        parent_domain: row.get("parent_domain"),
        tool_count: row.get("tool_count"),
        org_id: row.get("org_id"),
        is_global: row.get::<i32, _>("is_global") != 0,
        is_active: row.get::<i32, _>("is_active") != 0,
        created_at: ts_to_datetime(row.get("created_at"))?,
        updated_at: ts_to_datetime(row.get("updated_at"))?,
    })
}

fn row_to_assignment(row: SqliteRow) -> Result<SkillAssignment> {
    let source: String = row.get("source");
    Ok(SkillAssignment {
        tool_id: row.get("tool_id"),
        skill_id: row.get("skill_id"),
        confidence: row.get("confidence"),
        is_primary: row.get::<i32, _>("is_primary") != 0,
        source: AssignmentSource::from_str(&source)
            .map_err(|e| StoreError::InvalidData(e.to_string()))?,
        created_at: ts_to_datetime(row.get("created_at"))?,
    })
}

fn row_to_server(row: SqliteRow) -> Result<ExternalServer> {
    let id: String = row.get("id");
    let transport: String = row.get("transport");
    let config: String = row.get("config");
    let status: String = row.get("status");
    let connected_at: Option<i64> = row.get("connected_at");
    let last_health_check: Option<i64> = row.get("last_health_check");

    Ok(ExternalServer {
        id: Uuid::parse_str(&id).map_err(|e| StoreError::InvalidData(e.to_string()))?,
        name: row.get("name"),
        transport: TransportKind::from_str(&transport)
            .map_err(|e| StoreError::InvalidData(e.to_string()))?,
        config: serde_json::from_str(&config)?,
        health_check_url: row.get("health_check_url"),
        status: ServerStatus::from_str(&status)
            .map_err(|e| StoreError::InvalidData(e.to_string()))?,
        last_error: row.get("last_error"),
        tool_count: row.get("tool_count"),
        registered_at: ts_to_datetime(row.get("registered_at"))?,
        connected_at: connected_at.map(ts_to_datetime).transpose()?,
        last_health_check: last_health_check.map(ts_to_datetime).transpose()?,
        org_id: row.get("org_id"),
        is_global: row.get::<i32, _>("is_global") != 0,
    })
}
