//! SQLite-backed persistent store.
//!
//! Single file at `<storeDir>/messages.db`, WAL mode, schema created
//! idempotently at open. All timestamps are stored as UTC RFC 3339 strings
//! with millisecond precision and a `Z` suffix, which keeps lexicographic
//! and chronological order identical.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;

use crate::group::{GroupContainerConfig, RegisteredGroup};

/// A stored scheduled prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTask {
    pub id: String,
    pub group_folder: String,
    pub chat_jid: String,
    pub prompt: String,
    pub schedule_type: String,
    pub schedule_value: String,
    #[serde(default = "default_context_mode")]
    pub context_mode: String,
    pub next_run: Option<String>,
    pub last_run: Option<String>,
    pub last_result: Option<String>,
    #[serde(default = "default_status")]
    pub status: String,
    pub created_at: String,
}

fn default_context_mode() -> String {
    "isolated".to_string()
}

fn default_status() -> String {
    "active".to_string()
}

/// Current instant in store timestamp format.
pub fn now_iso() -> String {
    to_store_ts(Utc::now())
}

/// Canonical store formatting for any UTC instant.
pub fn to_store_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Handle to the SQLite store. Cheap to clone; access is serialized behind
/// a single connection lock.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create store dir {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open store at {}", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .context("failed to set store pragmas")?;
        ensure_schema(&conn)?;

        info!(path = %path.display(), "store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory store")?;
        ensure_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ── Registered groups ──────────────────────────────────────────────

    pub async fn set_registered_group(&self, group: &RegisteredGroup) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        let config_json = group
            .container_config
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("failed to serialize container config")?;
        conn.execute(
            "INSERT INTO registered_groups
               (group_id, name, folder, trigger_pattern, added_at, container_config)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (group_id) DO UPDATE SET
               name = excluded.name,
               folder = excluded.folder,
               trigger_pattern = excluded.trigger_pattern,
               container_config = excluded.container_config",
            params![
                group.id,
                group.name,
                group.folder,
                group.trigger,
                group.added_at,
                config_json
            ],
        )
        .context("set_registered_group")?;
        Ok(())
    }

    pub async fn get_registered_group(&self, id: &str) -> anyhow::Result<Option<RegisteredGroup>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT group_id, name, folder, trigger_pattern, added_at, container_config
             FROM registered_groups WHERE group_id = ?1",
            params![id],
            row_to_group,
        )
        .optional()
        .context("get_registered_group")
    }

    pub async fn all_registered_groups(&self) -> anyhow::Result<Vec<RegisteredGroup>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT group_id, name, folder, trigger_pattern, added_at, container_config
                 FROM registered_groups ORDER BY added_at",
            )
            .context("all_registered_groups prepare")?;
        let rows = stmt
            .query_map([], row_to_group)
            .context("all_registered_groups query")?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("all_registered_groups collect")
    }

    // ── Sessions ───────────────────────────────────────────────────────

    pub async fn get_session(&self, group_folder: &str) -> anyhow::Result<Option<String>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT session_id FROM sessions WHERE group_folder = ?1",
            params![group_folder],
            |row| row.get(0),
        )
        .optional()
        .context("get_session")
    }

    pub async fn set_session(&self, group_folder: &str, session_id: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO sessions (group_folder, session_id) VALUES (?1, ?2)
             ON CONFLICT (group_folder) DO UPDATE SET session_id = excluded.session_id",
            params![group_folder, session_id],
        )
        .context("set_session")?;
        Ok(())
    }

    pub async fn all_sessions(&self) -> anyhow::Result<HashMap<String, String>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT group_folder, session_id FROM sessions")
            .context("all_sessions prepare")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .context("all_sessions query")?;
        let mut out = HashMap::new();
        for row in rows {
            let (folder, sid) = row.context("all_sessions row")?;
            out.insert(folder, sid);
        }
        Ok(out)
    }

    pub async fn delete_session(&self, group_folder: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM sessions WHERE group_folder = ?1",
            params![group_folder],
        )
        .context("delete_session")?;
        Ok(())
    }

    // ── Scheduled tasks ────────────────────────────────────────────────

    pub async fn create_task(&self, task: &ScheduledTask) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO scheduled_tasks
               (id, group_folder, chat_jid, prompt, schedule_type, schedule_value,
                context_mode, next_run, last_run, last_result, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                task.id,
                task.group_folder,
                task.chat_jid,
                task.prompt,
                task.schedule_type,
                task.schedule_value,
                task.context_mode,
                task.next_run,
                task.last_run,
                task.last_result,
                task.status,
                task.created_at
            ],
        )
        .context("create_task")?;
        Ok(())
    }

    pub async fn get_task(&self, id: &str) -> anyhow::Result<Option<ScheduledTask>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT * FROM scheduled_tasks WHERE id = ?1",
            params![id],
            row_to_task,
        )
        .optional()
        .context("get_task")
    }

    pub async fn tasks_for_group(&self, group_folder: &str) -> anyhow::Result<Vec<ScheduledTask>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT * FROM scheduled_tasks WHERE group_folder = ?1 ORDER BY created_at DESC",
            )
            .context("tasks_for_group prepare")?;
        let rows = stmt
            .query_map(params![group_folder], row_to_task)
            .context("tasks_for_group query")?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("tasks_for_group collect")
    }

    pub async fn all_tasks(&self) -> anyhow::Result<Vec<ScheduledTask>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT * FROM scheduled_tasks ORDER BY created_at DESC")
            .context("all_tasks prepare")?;
        let rows = stmt.query_map([], row_to_task).context("all_tasks query")?;
        rows.collect::<Result<Vec<_>, _>>().context("all_tasks collect")
    }

    /// Active tasks whose next_run is at or before `now`, in firing order
    /// (ties broken by task id).
    pub async fn due_tasks(&self, now: &str) -> anyhow::Result<Vec<ScheduledTask>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT * FROM scheduled_tasks
                 WHERE status = 'active' AND next_run IS NOT NULL AND next_run <= ?1
                 ORDER BY next_run, id",
            )
            .context("due_tasks prepare")?;
        let rows = stmt
            .query_map(params![now], row_to_task)
            .context("due_tasks query")?;
        rows.collect::<Result<Vec<_>, _>>().context("due_tasks collect")
    }

    pub async fn set_task_status(
        &self,
        id: &str,
        status: &str,
        next_run: Option<&str>,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE scheduled_tasks SET status = ?1, next_run = ?2 WHERE id = ?3",
            params![status, next_run, id],
        )
        .context("set_task_status")?;
        Ok(())
    }

    /// Advance next_run without touching anything else. Called before the
    /// fire is submitted so a crash mid-fire cannot replay it.
    pub async fn advance_task(&self, id: &str, next_run: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE scheduled_tasks SET next_run = ?1 WHERE id = ?2",
            params![next_run, id],
        )
        .context("advance_task")?;
        Ok(())
    }

    pub async fn record_task_run(&self, id: &str, last_result: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE scheduled_tasks SET last_run = ?1, last_result = ?2 WHERE id = ?3",
            params![now_iso(), last_result, id],
        )
        .context("record_task_run")?;
        Ok(())
    }

    pub async fn delete_task(&self, id: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM scheduled_tasks WHERE id = ?1", params![id])
            .context("delete_task")?;
        Ok(())
    }

    // ── Router state ───────────────────────────────────────────────────

    pub async fn get_router_state(&self, key: &str) -> anyhow::Result<Option<String>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT value FROM router_state WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .context("get_router_state")
    }

    pub async fn set_router_state(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO router_state (key, value) VALUES (?1, ?2)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )
        .context("set_router_state")?;
        Ok(())
    }
}

fn ensure_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS registered_groups (
           group_id TEXT PRIMARY KEY,
           name TEXT NOT NULL,
           folder TEXT NOT NULL UNIQUE,
           trigger_pattern TEXT NOT NULL DEFAULT '',
           added_at TEXT NOT NULL,
           container_config TEXT
         );

         CREATE TABLE IF NOT EXISTS sessions (
           group_folder TEXT PRIMARY KEY,
           session_id TEXT NOT NULL
         );

         CREATE TABLE IF NOT EXISTS scheduled_tasks (
           id TEXT PRIMARY KEY,
           group_folder TEXT NOT NULL,
           chat_jid TEXT NOT NULL,
           prompt TEXT NOT NULL,
           schedule_type TEXT NOT NULL,
           schedule_value TEXT NOT NULL,
           context_mode TEXT NOT NULL DEFAULT 'isolated',
           next_run TEXT,
           last_run TEXT,
           last_result TEXT,
           status TEXT NOT NULL DEFAULT 'active',
           created_at TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_tasks_next_run ON scheduled_tasks(next_run);
         CREATE INDEX IF NOT EXISTS idx_tasks_status ON scheduled_tasks(status);

         CREATE TABLE IF NOT EXISTS router_state (
           key TEXT PRIMARY KEY,
           value TEXT NOT NULL
         );",
    )
    .context("failed to create store schema")
}

fn row_to_group(row: &rusqlite::Row<'_>) -> rusqlite::Result<RegisteredGroup> {
    let config_json: Option<String> = row.get("container_config")?;
    let container_config: Option<GroupContainerConfig> =
        config_json.and_then(|raw| serde_json::from_str(&raw).ok());
    Ok(RegisteredGroup {
        id: row.get("group_id")?,
        name: row.get("name")?,
        folder: row.get("folder")?,
        trigger: row.get("trigger_pattern")?,
        added_at: row.get("added_at")?,
        container_config,
    })
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduledTask> {
    Ok(ScheduledTask {
        id: row.get("id")?,
        group_folder: row.get("group_folder")?,
        chat_jid: row.get("chat_jid")?,
        prompt: row.get("prompt")?,
        schedule_type: row.get("schedule_type")?,
        schedule_value: row.get("schedule_value")?,
        context_mode: row.get("context_mode")?,
        next_run: row.get("next_run")?,
        last_run: row.get("last_run")?,
        last_result: row.get("last_result")?,
        status: row.get("status")?,
        created_at: row.get("created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task(id: &str, next_run: &str) -> ScheduledTask {
        ScheduledTask {
            id: id.to_string(),
            group_folder: "team-a".to_string(),
            chat_jid: "team-a".to_string(),
            prompt: "report".to_string(),
            schedule_type: "interval".to_string(),
            schedule_value: "60000".to_string(),
            context_mode: "isolated".to_string(),
            next_run: Some(next_run.to_string()),
            last_run: None,
            last_result: None,
            status: "active".to_string(),
            created_at: now_iso(),
        }
    }

    #[test]
    fn now_iso_format() {
        let ts = now_iso();
        assert!(ts.ends_with('Z'), "timestamp should end with Z: {ts}");
        assert!(ts.contains('T'));
        assert_eq!(ts.len(), 24, "expected YYYY-MM-DDTHH:MM:SS.mmmZ: {ts}");
    }

    #[tokio::test]
    async fn group_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let group = RegisteredGroup {
            id: "team-a".to_string(),
            name: "Team A".to_string(),
            folder: "team-a".to_string(),
            trigger: "@Hearth".to_string(),
            added_at: now_iso(),
            container_config: Some(GroupContainerConfig {
                image: Some("custom:1".to_string()),
                additional_mounts: vec![],
                env: vec!["TOKEN".to_string()],
            }),
        };
        store.set_registered_group(&group).await.unwrap();

        let loaded = store.get_registered_group("team-a").await.unwrap().unwrap();
        assert_eq!(loaded.name, "Team A");
        assert_eq!(
            loaded.container_config.unwrap().image.as_deref(),
            Some("custom:1")
        );

        // Re-registering is an upsert, not an error.
        store.set_registered_group(&group).await.unwrap();
        assert_eq!(store.all_registered_groups().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn session_round_trip() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.get_session("main").await.unwrap().is_none());

        store.set_session("main", "sess-1").await.unwrap();
        store.set_session("main", "sess-2").await.unwrap();
        assert_eq!(store.get_session("main").await.unwrap().unwrap(), "sess-2");

        store.delete_session("main").await.unwrap();
        assert!(store.get_session("main").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn due_tasks_ordered_by_next_run_then_id() {
        let store = Store::open_in_memory().unwrap();
        store
            .create_task(&sample_task("b", "2020-01-01T00:00:00.000Z"))
            .await
            .unwrap();
        store
            .create_task(&sample_task("a", "2020-01-01T00:00:00.000Z"))
            .await
            .unwrap();
        store
            .create_task(&sample_task("c", "2019-01-01T00:00:00.000Z"))
            .await
            .unwrap();
        store
            .create_task(&sample_task("future", "2999-01-01T00:00:00.000Z"))
            .await
            .unwrap();

        let due = store.due_tasks(&now_iso()).await.unwrap();
        let ids: Vec<&str> = due.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn paused_tasks_are_not_due() {
        let store = Store::open_in_memory().unwrap();
        store
            .create_task(&sample_task("t1", "2020-01-01T00:00:00.000Z"))
            .await
            .unwrap();
        store.set_task_status("t1", "paused", None).await.unwrap();
        assert!(store.due_tasks(&now_iso()).await.unwrap().is_empty());

        let task = store.get_task("t1").await.unwrap().unwrap();
        assert_eq!(task.status, "paused");
        assert!(task.next_run.is_none());
    }

    #[tokio::test]
    async fn advance_and_record_run() {
        let store = Store::open_in_memory().unwrap();
        store
            .create_task(&sample_task("t1", "2020-01-01T00:00:00.000Z"))
            .await
            .unwrap();

        store
            .advance_task("t1", "2999-01-01T00:00:00.000Z")
            .await
            .unwrap();
        store.record_task_run("t1", "submitted: queued").await.unwrap();

        let task = store.get_task("t1").await.unwrap().unwrap();
        assert_eq!(task.next_run.as_deref(), Some("2999-01-01T00:00:00.000Z"));
        assert_eq!(task.last_result.as_deref(), Some("submitted: queued"));
        assert!(task.last_run.is_some());
    }

    #[tokio::test]
    async fn router_state_round_trip() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.get_router_state("k").await.unwrap().is_none());
        store.set_router_state("k", "v1").await.unwrap();
        store.set_router_state("k", "v2").await.unwrap();
        assert_eq!(store.get_router_state("k").await.unwrap().unwrap(), "v2");
    }

    #[tokio::test]
    async fn durability_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("messages.db");

        {
            let store = Store::open(&path).unwrap();
            store
                .set_registered_group(&RegisteredGroup {
                    id: "main".to_string(),
                    name: "Main".to_string(),
                    folder: "main".to_string(),
                    trigger: String::new(),
                    added_at: now_iso(),
                    container_config: None,
                })
                .await
                .unwrap();
            store.set_session("main", "sess-9").await.unwrap();
            store
                .create_task(&sample_task("t1", "2020-01-01T00:00:00.000Z"))
                .await
                .unwrap();
        }

        let store = Store::open(&path).unwrap();
        assert!(store.get_registered_group("main").await.unwrap().is_some());
        assert_eq!(store.get_session("main").await.unwrap().unwrap(), "sess-9");
        assert_eq!(store.all_tasks().await.unwrap().len(), 1);
    }
}
