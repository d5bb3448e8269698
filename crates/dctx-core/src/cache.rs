//! Session & Context Store (§4.3): the durable, per-workspace SQLite
//! database backing decisions, progress entries, system patterns,
//! custom data, links, and the Active Context singleton.

use chrono::Utc;
use tokio_rusqlite::Connection;

use crate::error::{CoreError, CoreResult};
use crate::types::{
    ActiveContext, CustomData, Decision, EnergyRequired, ItemType, Link, ProgressEntry,
    ProgressStatus, Relationship, RecentActivitySummary, SystemPattern,
};

/// Async SQLite-backed store for a single workspace's durable context.
pub struct Store {
    conn: Connection,
}

// ---------------------------------------------------------------------------
// helpers — enum <-> SQLite string
// ---------------------------------------------------------------------------

fn enum_to_sql<T: serde::Serialize>(val: &T) -> String {
    let s = serde_json::to_string(val).expect("serialize enum");
    s.trim_matches('"').to_string()
}

fn enum_from_sql<T: serde::de::DeserializeOwned>(raw: &str) -> T {
    let quoted = format!("\"{}\"", raw);
    serde_json::from_str(&quoted).expect("deserialize enum")
}

fn parse_ts(raw: &str) -> chrono::DateTime<Utc> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .expect("valid date")
        .with_timezone(&Utc)
}

impl Store {
    /// Open (or create) a database at the given file path.
    pub async fn new(path: impl AsRef<std::path::Path>) -> Result<Self, tokio_rusqlite::Error> {
        let conn = Connection::open(path.as_ref()).await?;
        let db = Self { conn };
        db.init_schema().await?;
        Ok(db)
    }

    /// Create a purely in-memory database (used by tests).
    pub async fn new_in_memory() -> Result<Self, tokio_rusqlite::Error> {
        let conn = Connection::open_in_memory().await?;
        let db = Self { conn };
        db.init_schema().await?;
        Ok(db)
    }

    // -----------------------------------------------------------------------
    // Schema
    // -----------------------------------------------------------------------

    async fn init_schema(&self) -> Result<(), tokio_rusqlite::Error> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA cache_size=-64000;
                    PRAGMA mmap_size=268435456;
                    PRAGMA temp_store=MEMORY;
                    PRAGMA busy_timeout=5000;

                    CREATE TABLE IF NOT EXISTS counters (
                        workspace_id TEXT NOT NULL,
                        name         TEXT NOT NULL,
                        value        INTEGER NOT NULL DEFAULT 0,
                        PRIMARY KEY (workspace_id, name)
                    );

                    CREATE TABLE IF NOT EXISTS decisions (
                        decision_id             INTEGER NOT NULL,
                        workspace_id            TEXT NOT NULL,
                        summary                 TEXT NOT NULL,
                        rationale               TEXT NOT NULL,
                        implementation_details  TEXT,
                        tags                    TEXT NOT NULL,
                        timestamp               TEXT NOT NULL,
                        PRIMARY KEY (workspace_id, decision_id)
                    );

                    CREATE INDEX IF NOT EXISTS idx_decisions_ws_ts
                        ON decisions(workspace_id, timestamp);

                    CREATE TABLE IF NOT EXISTS progress (
                        progress_id       INTEGER NOT NULL,
                        workspace_id      TEXT NOT NULL,
                        status            TEXT NOT NULL,
                        description       TEXT NOT NULL,
                        parent_id         INTEGER,
                        created_at        TEXT NOT NULL,
                        updated_at        TEXT NOT NULL,
                        completed_at      TEXT,
                        complexity_score  REAL,
                        estimated_minutes INTEGER,
                        energy_required   TEXT,
                        cognitive_load    REAL,
                        break_points      TEXT NOT NULL DEFAULT '[]',
                        PRIMARY KEY (workspace_id, progress_id)
                    );

                    CREATE INDEX IF NOT EXISTS idx_progress_ws_status
                        ON progress(workspace_id, status);

                    CREATE TABLE IF NOT EXISTS patterns (
                        workspace_id TEXT NOT NULL,
                        name         TEXT NOT NULL,
                        description  TEXT NOT NULL,
                        tags         TEXT NOT NULL,
                        created_at   TEXT NOT NULL,
                        PRIMARY KEY (workspace_id, name)
                    );

                    CREATE TABLE IF NOT EXISTS custom_data (
                        workspace_id TEXT NOT NULL,
                        category     TEXT NOT NULL,
                        key          TEXT NOT NULL,
                        value        TEXT NOT NULL,
                        updated_at   TEXT NOT NULL,
                        PRIMARY KEY (workspace_id, category, key)
                    );

                    CREATE TABLE IF NOT EXISTS links (
                        workspace_id TEXT NOT NULL,
                        source_type  TEXT NOT NULL,
                        source_id    TEXT NOT NULL,
                        target_type  TEXT NOT NULL,
                        target_id    TEXT NOT NULL,
                        relationship TEXT NOT NULL,
                        description  TEXT,
                        created_at   TEXT NOT NULL,
                        PRIMARY KEY (workspace_id, source_type, source_id, target_type, target_id, relationship)
                    );

                    CREATE TABLE IF NOT EXISTS active_context (
                        workspace_id TEXT PRIMARY KEY,
                        document     TEXT NOT NULL
                    );
                    ",
                )?;
                Ok(())
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Counters
    // -----------------------------------------------------------------------

    async fn next_id(&self, workspace_id: &str, name: &str) -> Result<i64, tokio_rusqlite::Error> {
        let workspace_id = workspace_id.to_string();
        let name = name.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO counters (workspace_id, name, value) VALUES (?1, ?2, 1)
                     ON CONFLICT(workspace_id, name) DO UPDATE SET value = value + 1",
                    rusqlite::params![workspace_id, name],
                )?;
                let value: i64 = conn.query_row(
                    "SELECT value FROM counters WHERE workspace_id = ?1 AND name = ?2",
                    rusqlite::params![workspace_id, name],
                    |r| r.get(0),
                )?;
                Ok(value)
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Decisions (append-only)
    // -----------------------------------------------------------------------

    pub async fn log_decision(
        &self,
        workspace_id: &str,
        summary: String,
        rationale: String,
        implementation_details: Option<String>,
        tags: Vec<String>,
    ) -> CoreResult<Decision> {
        let decision_id = self
            .next_id(workspace_id, "decision")
            .await
            .map_err(|e| CoreError::StorageUnavailable(e.to_string()))?;
        let decision = Decision {
            decision_id,
            workspace_id: workspace_id.to_string(),
            summary,
            rationale,
            implementation_details,
            tags,
            timestamp: Utc::now(),
        };
        let d = decision.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO decisions (decision_id, workspace_id, summary, rationale,
                        implementation_details, tags, timestamp)
                     VALUES (?1,?2,?3,?4,?5,?6,?7)",
                    rusqlite::params![
                        d.decision_id,
                        d.workspace_id,
                        d.summary,
                        d.rationale,
                        d.implementation_details,
                        serde_json::to_string(&d.tags).expect("serialize tags"),
                        d.timestamp.to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(|e| CoreError::StorageUnavailable(e.to_string()))?;
        Ok(decision)
    }

    pub async fn search_decisions_fts(
        &self,
        workspace_id: &str,
        query: &str,
        limit: u32,
    ) -> CoreResult<Vec<Decision>> {
        let workspace_id = workspace_id.to_string();
        let pattern = format!("%{}%", query);
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT decision_id, workspace_id, summary, rationale,
                            implementation_details, tags, timestamp
                     FROM decisions
                     WHERE workspace_id = ?1 AND (summary LIKE ?2 OR rationale LIKE ?2)
                     ORDER BY timestamp DESC LIMIT ?3",
                )?;
                let mut rows = stmt.query(rusqlite::params![workspace_id, pattern, limit])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_decision(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(|e| CoreError::StorageUnavailable(e.to_string()))
    }

    // -----------------------------------------------------------------------
    // Progress entries
    // -----------------------------------------------------------------------

    pub async fn log_progress(
        &self,
        workspace_id: &str,
        description: String,
        parent_id: Option<i64>,
    ) -> CoreResult<ProgressEntry> {
        let progress_id = self
            .next_id(workspace_id, "progress")
            .await
            .map_err(|e| CoreError::StorageUnavailable(e.to_string()))?;
        let now = Utc::now();
        let entry = ProgressEntry {
            progress_id,
            workspace_id: workspace_id.to_string(),
            status: ProgressStatus::Todo,
            description,
            parent_id,
            created_at: now,
            updated_at: now,
            completed_at: None,
            complexity_score: None,
            estimated_minutes: None,
            energy_required: None,
            cognitive_load: None,
            break_points: Vec::new(),
        };
        self.insert_progress(&entry).await?;
        Ok(entry)
    }

    async fn insert_progress(&self, entry: &ProgressEntry) -> CoreResult<()> {
        let e = entry.clone_for_write();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO progress (progress_id, workspace_id, status, description,
                        parent_id, created_at, updated_at, completed_at, complexity_score,
                        estimated_minutes, energy_required, cognitive_load, break_points)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)
                     ON CONFLICT(workspace_id, progress_id) DO UPDATE SET
                        status=excluded.status, description=excluded.description,
                        updated_at=excluded.updated_at, completed_at=excluded.completed_at,
                        complexity_score=excluded.complexity_score,
                        estimated_minutes=excluded.estimated_minutes,
                        energy_required=excluded.energy_required,
                        cognitive_load=excluded.cognitive_load,
                        break_points=excluded.break_points",
                    rusqlite::params![
                        e.0, e.1, e.2, e.3, e.4, e.5, e.6, e.7, e.8, e.9, e.10, e.11, e.12,
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(|err| CoreError::StorageUnavailable(err.to_string()))
    }

    /// Fetch a progress entry, apply a validated status transition, persist.
    pub async fn update_progress(
        &self,
        workspace_id: &str,
        progress_id: i64,
        next: ProgressStatus,
        description: Option<String>,
    ) -> CoreResult<ProgressEntry> {
        let mut entry = self
            .get_progress(workspace_id, progress_id)
            .await?
            .ok_or_else(|| CoreError::Validation(format!("no progress entry {progress_id}")))?;
        entry.apply_transition(next, description)?;
        self.insert_progress(&entry).await?;
        Ok(entry)
    }

    /// Patch a progress entry's attention-scoring attributes (§4.4):
    /// `complexity_score`, `estimated_minutes`, `energy_required`. Leaves
    /// `status`/`description` untouched; `None` fields are left as-is.
    pub async fn set_task_attributes(
        &self,
        workspace_id: &str,
        progress_id: i64,
        complexity_score: Option<f64>,
        estimated_minutes: Option<u32>,
        energy_required: Option<EnergyRequired>,
    ) -> CoreResult<ProgressEntry> {
        let mut entry = self
            .get_progress(workspace_id, progress_id)
            .await?
            .ok_or_else(|| CoreError::Validation(format!("no progress entry {progress_id}")))?;
        if complexity_score.is_some() {
            entry.complexity_score = complexity_score;
        }
        if estimated_minutes.is_some() {
            entry.estimated_minutes = estimated_minutes;
        }
        if energy_required.is_some() {
            entry.energy_required = energy_required;
        }
        entry.updated_at = Utc::now();
        self.insert_progress(&entry).await?;
        Ok(entry)
    }

    pub async fn get_progress(
        &self,
        workspace_id: &str,
        progress_id: i64,
    ) -> CoreResult<Option<ProgressEntry>> {
        let workspace_id = workspace_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT progress_id, workspace_id, status, description, parent_id,
                            created_at, updated_at, completed_at, complexity_score,
                            estimated_minutes, energy_required, cognitive_load, break_points
                     FROM progress WHERE workspace_id = ?1 AND progress_id = ?2",
                )?;
                let mut rows = stmt.query(rusqlite::params![workspace_id, progress_id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_progress(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(|e| CoreError::StorageUnavailable(e.to_string()))
    }

    // -----------------------------------------------------------------------
    // System patterns
    // -----------------------------------------------------------------------

    pub async fn log_system_pattern(
        &self,
        workspace_id: &str,
        name: String,
        description: String,
        tags: Vec<String>,
    ) -> CoreResult<SystemPattern> {
        let pattern = SystemPattern {
            workspace_id: workspace_id.to_string(),
            name,
            description,
            tags,
            created_at: Utc::now(),
        };
        let p = pattern.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO patterns (workspace_id, name, description, tags, created_at)
                     VALUES (?1,?2,?3,?4,?5)
                     ON CONFLICT(workspace_id, name) DO UPDATE SET
                        description=excluded.description, tags=excluded.tags",
                    rusqlite::params![
                        p.workspace_id,
                        p.name,
                        p.description,
                        serde_json::to_string(&p.tags).expect("serialize tags"),
                        p.created_at.to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(|e| CoreError::StorageUnavailable(e.to_string()))?;
        Ok(pattern)
    }

    // -----------------------------------------------------------------------
    // Custom data (upsert on category+key)
    // -----------------------------------------------------------------------

    pub async fn log_custom_data(
        &self,
        workspace_id: &str,
        category: String,
        key: String,
        value: serde_json::Value,
    ) -> CoreResult<CustomData> {
        let data = CustomData {
            workspace_id: workspace_id.to_string(),
            category,
            key,
            value,
            updated_at: Utc::now(),
        };
        let d = data.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO custom_data (workspace_id, category, key, value, updated_at)
                     VALUES (?1,?2,?3,?4,?5)
                     ON CONFLICT(workspace_id, category, key) DO UPDATE SET
                        value=excluded.value, updated_at=excluded.updated_at",
                    rusqlite::params![
                        d.workspace_id,
                        d.category,
                        d.key,
                        d.value.to_string(),
                        d.updated_at.to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(|e| CoreError::StorageUnavailable(e.to_string()))?;
        Ok(data)
    }

    pub async fn search_custom_data_fts(
        &self,
        workspace_id: &str,
        category: &str,
        query: &str,
    ) -> CoreResult<Vec<CustomData>> {
        let workspace_id = workspace_id.to_string();
        let category = category.to_string();
        let pattern = format!("%{}%", query);
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT workspace_id, category, key, value, updated_at
                     FROM custom_data
                     WHERE workspace_id = ?1 AND category = ?2 AND (key LIKE ?3 OR value LIKE ?3)
                     ORDER BY updated_at DESC",
                )?;
                let mut rows = stmt.query(rusqlite::params![workspace_id, category, pattern])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_custom_data(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(|e| CoreError::StorageUnavailable(e.to_string()))
    }

    // -----------------------------------------------------------------------
    // Links (both sides must already exist)
    // -----------------------------------------------------------------------

    pub async fn link_items(
        &self,
        workspace_id: &str,
        source_type: ItemType,
        source_id: String,
        target_type: ItemType,
        target_id: String,
        relationship: Relationship,
        description: Option<String>,
    ) -> CoreResult<Link> {
        self.assert_item_exists(workspace_id, source_type, &source_id)
            .await?;
        self.assert_item_exists(workspace_id, target_type, &target_id)
            .await?;

        let link = Link {
            workspace_id: workspace_id.to_string(),
            source_type,
            source_id,
            target_type,
            target_id,
            relationship,
            description,
            created_at: Utc::now(),
        };
        let l = link.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO links (workspace_id, source_type, source_id, target_type,
                        target_id, relationship, description, created_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8)
                     ON CONFLICT DO NOTHING",
                    rusqlite::params![
                        l.workspace_id,
                        enum_to_sql(&l.source_type),
                        l.source_id,
                        enum_to_sql(&l.target_type),
                        l.target_id,
                        enum_to_sql(&l.relationship),
                        l.description,
                        l.created_at.to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(|e| CoreError::StorageUnavailable(e.to_string()))?;
        Ok(link)
    }

    async fn assert_item_exists(
        &self,
        workspace_id: &str,
        item_type: ItemType,
        id: &str,
    ) -> CoreResult<()> {
        let exists = match item_type {
            ItemType::Decision => {
                let id: i64 = id
                    .parse()
                    .map_err(|_| CoreError::Validation("decision id must be numeric".into()))?;
                self.get_decision(workspace_id, id).await?.is_some()
            }
            ItemType::Progress => {
                let id: i64 = id
                    .parse()
                    .map_err(|_| CoreError::Validation("progress id must be numeric".into()))?;
                self.get_progress(workspace_id, id).await?.is_some()
            }
            ItemType::Pattern | ItemType::CustomData | ItemType::Glossary => true,
        };
        if exists {
            Ok(())
        } else {
            Err(CoreError::Validation(format!(
                "link target does not exist: {item_type:?}/{id}"
            )))
        }
    }

    async fn get_decision(&self, workspace_id: &str, decision_id: i64) -> CoreResult<Option<Decision>> {
        let workspace_id = workspace_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT decision_id, workspace_id, summary, rationale,
                            implementation_details, tags, timestamp
                     FROM decisions WHERE workspace_id = ?1 AND decision_id = ?2",
                )?;
                let mut rows = stmt.query(rusqlite::params![workspace_id, decision_id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_decision(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(|e| CoreError::StorageUnavailable(e.to_string()))
    }

    // -----------------------------------------------------------------------
    // Recent activity summary
    // -----------------------------------------------------------------------

    pub async fn get_recent_activity_summary(
        &self,
        workspace_id: &str,
        limit: u32,
    ) -> CoreResult<RecentActivitySummary> {
        let decisions = self.search_decisions_fts(workspace_id, "", limit).await?;
        let workspace_id_owned = workspace_id.to_string();
        let progress = self
            .conn
            .call({
                let workspace_id = workspace_id_owned.clone();
                move |conn| {
                    let mut stmt = conn.prepare(
                        "SELECT progress_id, workspace_id, status, description, parent_id,
                                created_at, updated_at, completed_at, complexity_score,
                                estimated_minutes, energy_required, cognitive_load, break_points
                         FROM progress WHERE workspace_id = ?1
                         ORDER BY updated_at DESC LIMIT ?2",
                    )?;
                    let mut rows = stmt.query(rusqlite::params![workspace_id, limit])?;
                    let mut out = Vec::new();
                    while let Some(row) = rows.next()? {
                        out.push(row_to_progress(row)?);
                    }
                    Ok(out)
                }
            })
            .await
            .map_err(|e| CoreError::StorageUnavailable(e.to_string()))?;
        let patterns = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT workspace_id, name, description, tags, created_at
                     FROM patterns WHERE workspace_id = ?1
                     ORDER BY created_at DESC LIMIT ?2",
                )?;
                let mut rows = stmt.query(rusqlite::params![workspace_id_owned, limit])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_pattern(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(|e| CoreError::StorageUnavailable(e.to_string()))?;

        Ok(RecentActivitySummary {
            decisions,
            progress,
            patterns,
        })
    }

    // -----------------------------------------------------------------------
    // Active Context (one row per workspace, deep-merge-one-level patch)
    // -----------------------------------------------------------------------

    pub async fn get_active_context(&self, workspace_id: &str) -> CoreResult<ActiveContext> {
        let workspace_id = workspace_id.to_string();
        let doc: Option<String> = self
            .conn
            .call({
                let workspace_id = workspace_id.clone();
                move |conn| {
                    conn.query_row(
                        "SELECT document FROM active_context WHERE workspace_id = ?1",
                        rusqlite::params![workspace_id],
                        |r| r.get(0),
                    )
                    .optional()
                }
            })
            .await
            .map_err(|e| CoreError::StorageUnavailable(e.to_string()))?;

        match doc {
            Some(json) => {
                serde_json::from_str(&json).map_err(|e| CoreError::Internal {
                    event_id: uuid::Uuid::new_v4(),
                    message: format!("corrupt active context: {e}"),
                })
            }
            None => Ok(ActiveContext::new(workspace_id)),
        }
    }

    /// Apply a one-level-deep patch: each top-level field present in
    /// `patch` overwrites the corresponding field on the stored document;
    /// absent fields are left untouched.
    pub async fn update_active_context(
        &self,
        workspace_id: &str,
        patch: serde_json::Value,
    ) -> CoreResult<ActiveContext> {
        let mut current = self.get_active_context(workspace_id).await?;
        let mut current_value = serde_json::to_value(&current).map_err(|e| CoreError::Internal {
            event_id: uuid::Uuid::new_v4(),
            message: e.to_string(),
        })?;
        if let (Some(current_obj), Some(patch_obj)) = (current_value.as_object_mut(), patch.as_object())
        {
            for (k, v) in patch_obj {
                current_obj.insert(k.clone(), v.clone());
            }
        }
        current = serde_json::from_value(current_value).map_err(|e| CoreError::Internal {
            event_id: uuid::Uuid::new_v4(),
            message: e.to_string(),
        })?;
        let json = serde_json::to_string(&current).expect("serialize active context");
        let workspace_id_owned = workspace_id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO active_context (workspace_id, document) VALUES (?1, ?2)
                     ON CONFLICT(workspace_id) DO UPDATE SET document = excluded.document",
                    rusqlite::params![workspace_id_owned, json],
                )?;
                Ok(())
            })
            .await
            .map_err(|e| CoreError::StorageUnavailable(e.to_string()))?;
        Ok(current)
    }
}

use rusqlite::OptionalExtension;

// ---------------------------------------------------------------------------
// Row mapping helpers
// ---------------------------------------------------------------------------

fn row_to_decision(row: &rusqlite::Row<'_>) -> rusqlite::Result<Decision> {
    let tags_str: String = row.get(5)?;
    let ts_str: String = row.get(6)?;
    Ok(Decision {
        decision_id: row.get(0)?,
        workspace_id: row.get(1)?,
        summary: row.get(2)?,
        rationale: row.get(3)?,
        implementation_details: row.get(4)?,
        tags: serde_json::from_str(&tags_str).unwrap_or_default(),
        timestamp: parse_ts(&ts_str),
    })
}

fn row_to_progress(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProgressEntry> {
    let status_str: String = row.get(2)?;
    let created_at_str: String = row.get(5)?;
    let updated_at_str: String = row.get(6)?;
    let completed_at_str: Option<String> = row.get(7)?;
    let energy_required_str: Option<String> = row.get(10)?;
    let break_points_str: String = row.get(12)?;
    Ok(ProgressEntry {
        progress_id: row.get(0)?,
        workspace_id: row.get(1)?,
        status: enum_from_sql(&status_str),
        description: row.get(3)?,
        parent_id: row.get(4)?,
        created_at: parse_ts(&created_at_str),
        updated_at: parse_ts(&updated_at_str),
        completed_at: completed_at_str.map(|s| parse_ts(&s)),
        complexity_score: row.get(8)?,
        estimated_minutes: row.get(9)?,
        energy_required: energy_required_str.map(|s| enum_from_sql(&s)),
        cognitive_load: row.get(11)?,
        break_points: serde_json::from_str(&break_points_str).unwrap_or_default(),
    })
}

fn row_to_pattern(row: &rusqlite::Row<'_>) -> rusqlite::Result<SystemPattern> {
    let tags_str: String = row.get(3)?;
    let created_at_str: String = row.get(4)?;
    Ok(SystemPattern {
        workspace_id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        tags: serde_json::from_str(&tags_str).unwrap_or_default(),
        created_at: parse_ts(&created_at_str),
    })
}

fn row_to_custom_data(row: &rusqlite::Row<'_>) -> rusqlite::Result<CustomData> {
    let value_str: String = row.get(3)?;
    let updated_at_str: String = row.get(4)?;
    Ok(CustomData {
        workspace_id: row.get(0)?,
        category: row.get(1)?,
        key: row.get(2)?,
        value: serde_json::from_str(&value_str).unwrap_or(serde_json::Value::Null),
        updated_at: parse_ts(&updated_at_str),
    })
}

impl ProgressEntry {
    /// Flattened tuple form used for the parameterized upsert above.
    fn clone_for_write(
        &self,
    ) -> (
        i64,
        String,
        String,
        String,
        Option<i64>,
        String,
        String,
        Option<String>,
        Option<f64>,
        Option<u32>,
        Option<String>,
        Option<f64>,
        String,
    ) {
        (
            self.progress_id,
            self.workspace_id.clone(),
            enum_to_sql(&self.status),
            self.description.clone(),
            self.parent_id,
            self.created_at.to_rfc3339(),
            self.updated_at.to_rfc3339(),
            self.completed_at.map(|d| d.to_rfc3339()),
            self.complexity_score,
            self.estimated_minutes,
            self.energy_required.as_ref().map(enum_to_sql),
            self.cognitive_load,
            serde_json::to_string(&self.break_points).expect("serialize break points"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ProgressStatus;

    #[tokio::test]
    async fn decision_ids_are_monotonic_per_workspace() {
        let store = Store::new_in_memory().await.unwrap();
        let d1 = store
            .log_decision("/tmp/a", "use sqlite".into(), "durable".into(), None, vec![])
            .await
            .unwrap();
        let d2 = store
            .log_decision("/tmp/a", "use tokio".into(), "async".into(), None, vec![])
            .await
            .unwrap();
        assert_eq!(d1.decision_id, 1);
        assert_eq!(d2.decision_id, 2);
    }

    #[tokio::test]
    async fn progress_update_enforces_dag() {
        let store = Store::new_in_memory().await.unwrap();
        let entry = store.log_progress("/tmp/a", "write parser".into(), None).await.unwrap();
        let updated = store
            .update_progress("/tmp/a", entry.progress_id, ProgressStatus::InProgress, None)
            .await
            .unwrap();
        assert_eq!(updated.status, ProgressStatus::InProgress);
        let done = store
            .update_progress("/tmp/a", entry.progress_id, ProgressStatus::Done, None)
            .await
            .unwrap();
        assert!(done.completed_at.is_some());
        let err = store
            .update_progress("/tmp/a", entry.progress_id, ProgressStatus::InProgress, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::IllegalTransition { .. }));
    }

    #[tokio::test]
    async fn link_items_rejects_missing_target() {
        let store = Store::new_in_memory().await.unwrap();
        let d = store
            .log_decision("/tmp/a", "x".into(), "y".into(), None, vec![])
            .await
            .unwrap();
        let err = store
            .link_items(
                "/tmp/a",
                ItemType::Decision,
                d.decision_id.to_string(),
                ItemType::Progress,
                "999".into(),
                Relationship::Implements,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[tokio::test]
    async fn active_context_patch_is_one_level_deep_merge() {
        let store = Store::new_in_memory().await.unwrap();
        store
            .update_active_context(
                "/tmp/a",
                serde_json::json!({ "current_focus": "parser", "on_break": false }),
            )
            .await
            .unwrap();
        let ctx = store
            .update_active_context("/tmp/a", serde_json::json!({ "on_break": true }))
            .await
            .unwrap();
        assert_eq!(ctx.current_focus.as_deref(), Some("parser"));
        assert!(ctx.on_break);
    }
}
