use std::path::Path;
use std::sync::Mutex;

use anyhow::Result;
use chrono::Utc;
use rusqlite::Connection;
use serde::Serialize;

use crate::task::{Task, TaskStatus};

/// Ephemeral task-scoped note, one per tool result, ordered by insertion.
#[derive(Debug, Clone, Serialize)]
pub struct SessionItem {
    pub id: i64,
    pub task_id: String,
    pub step: u32,
    pub content: String,
    pub created_at: String,
}

/// Durable keyword-tagged fact, retrievable across tasks. Never expires;
/// only explicit deletion removes it.
#[derive(Debug, Clone, Serialize)]
pub struct LongTermItem {
    pub id: String,
    pub content: String,
    pub tags: Vec<String>,
    pub origin: String,
    pub created_at: String,
}

impl LongTermItem {
    pub fn new(content: &str, tags: Vec<String>, origin: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string()[..8].to_string(),
            content: content.to_string(),
            tags,
            origin: origin.to_string(),
            created_at: Utc::now().to_rfc3339(),
        }
    }
}

/// Persisted task row for audit/history.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub id: String,
    pub origin: String,
    pub description: String,
    pub status: String,
    pub tier: Option<String>,
    pub steps: u32,
    pub cost_usd: f64,
    pub outcome: Option<String>,
    pub created_at: String,
    pub completed_at: Option<String>,
}

/// SQLite-backed record store for session memory, long-term memory, and
/// task audit rows. Append-mostly; long-term promotion is last-write-wins.
pub struct MemoryStore {
    conn: Mutex<Connection>,
}

impl MemoryStore {
    pub fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                origin TEXT NOT NULL,
                description TEXT NOT NULL,
                status TEXT NOT NULL,
                tier TEXT,
                steps INTEGER NOT NULL DEFAULT 0,
                cost_usd REAL NOT NULL DEFAULT 0.0,
                outcome TEXT,
                created_at TEXT NOT NULL,
                completed_at TEXT
            );

            CREATE TABLE IF NOT EXISTS memory_session (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL,
                step INTEGER NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_session_task ON memory_session(task_id);

            CREATE TABLE IF NOT EXISTS memory_long_term (
                id TEXT PRIMARY KEY,
                content TEXT NOT NULL,
                tags TEXT NOT NULL,
                origin TEXT NOT NULL,
                created_at TEXT NOT NULL
            );",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("memory store lock poisoned: {e}"))
    }

    // === Session memory ===

    /// Append one note for a tool result. The autoincrement id preserves
    /// request order within and across steps.
    pub fn append_session(&self, task_id: &str, step: u32, content: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO memory_session (task_id, step, content, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![task_id, step as i64, content, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Session items for a task in insertion order.
    pub fn session_items(&self, task_id: &str) -> Result<Vec<SessionItem>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, task_id, step, content, created_at
             FROM memory_session WHERE task_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map([task_id], |row| {
                Ok(SessionItem {
                    id: row.get(0)?,
                    task_id: row.get(1)?,
                    step: row.get::<_, i64>(2)? as u32,
                    content: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn clear_session(&self, task_id: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute("DELETE FROM memory_session WHERE task_id = ?1", [task_id])?;
        Ok(())
    }

    // === Long-term memory ===

    /// Insert or overwrite a long-term item. Concurrent writers on the same
    /// id resolve last-write-wins.
    pub fn promote_long_term(&self, item: &LongTermItem) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO memory_long_term (id, content, tags, origin, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                item.id,
                item.content,
                item.tags.join(","),
                item.origin,
                item.created_at,
            ],
        )?;
        Ok(())
    }

    /// Keyword search over tags, ranked by number of matching keywords then
    /// recency.
    pub fn search_long_term(&self, keywords: &[String], limit: usize) -> Result<Vec<LongTermItem>> {
        if keywords.is_empty() {
            return Ok(Vec::new());
        }

        let conditions = vec!["tags LIKE ?"; keywords.len()].join(" OR ");
        let params: Vec<String> = keywords.iter().map(|k| format!("%{k}%")).collect();

        let conn = self.lock_conn()?;
        let sql = format!(
            "SELECT id, content, tags, origin, created_at FROM memory_long_term WHERE {conditions}"
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows: Vec<LongTermItem> = stmt
            .query_map(rusqlite::params_from_iter(params.iter()), |row| {
                Ok(LongTermItem {
                    id: row.get(0)?,
                    content: row.get(1)?,
                    tags: row
                        .get::<_, String>(2)?
                        .split(',')
                        .filter(|t| !t.is_empty())
                        .map(str::to_string)
                        .collect(),
                    origin: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();

        let match_count = |item: &LongTermItem| {
            keywords
                .iter()
                .filter(|k| item.tags.iter().any(|t| t.contains(k.as_str())))
                .count()
        };
        rows.sort_by(|a, b| {
            match_count(b)
                .cmp(&match_count(a))
                .then(b.created_at.cmp(&a.created_at))
        });
        rows.truncate(limit);
        Ok(rows)
    }

    /// Most recent long-term items written from a given origin.
    pub fn pinned_for(&self, origin: &str, limit: usize) -> Result<Vec<LongTermItem>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, content, tags, origin, created_at FROM memory_long_term
             WHERE origin = ?1 ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(rusqlite::params![origin, limit as i64], |row| {
                Ok(LongTermItem {
                    id: row.get(0)?,
                    content: row.get(1)?,
                    tags: row
                        .get::<_, String>(2)?
                        .split(',')
                        .filter(|t| !t.is_empty())
                        .map(str::to_string)
                        .collect(),
                    origin: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Returns true when a row was actually removed.
    pub fn delete_long_term(&self, id: &str) -> Result<bool> {
        let conn = self.lock_conn()?;
        let changed = conn.execute("DELETE FROM memory_long_term WHERE id = ?1", [id])?;
        Ok(changed > 0)
    }

    pub fn list_long_term(&self, limit: usize) -> Result<Vec<LongTermItem>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, content, tags, origin, created_at FROM memory_long_term
             ORDER BY created_at DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([limit as i64], |row| {
                Ok(LongTermItem {
                    id: row.get(0)?,
                    content: row.get(1)?,
                    tags: row
                        .get::<_, String>(2)?
                        .split(',')
                        .filter(|t| !t.is_empty())
                        .map(str::to_string)
                        .collect(),
                    origin: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    // === Task audit rows ===

    pub fn insert_task(&self, task: &Task) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO tasks (id, origin, description, status, tier, steps, cost_usd, outcome, created_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            rusqlite::params![
                task.id,
                task.origin,
                task.description,
                task.status.as_str(),
                task.tier.map(|t| t.as_str()),
                task.step as i64,
                task.cost_usd,
                task.outcome,
                task.created_at,
                task.completed_at,
            ],
        )?;
        Ok(())
    }

    pub fn update_task(&self, task: &Task) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE tasks SET status = ?2, tier = ?3, steps = ?4, cost_usd = ?5, outcome = ?6, completed_at = ?7
             WHERE id = ?1",
            rusqlite::params![
                task.id,
                task.status.as_str(),
                task.tier.map(|t| t.as_str()),
                task.step as i64,
                task.cost_usd,
                task.outcome,
                task.completed_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, origin, description, status, tier, steps, cost_usd, outcome, created_at, completed_at
             FROM tasks WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map([task_id], row_to_task_record)?;
        Ok(rows.next().transpose()?)
    }

    /// Non-terminal tasks, oldest first.
    pub fn active_tasks(&self) -> Result<Vec<TaskRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, origin, description, status, tier, steps, cost_usd, outcome, created_at, completed_at
             FROM tasks WHERE status IN ('pending', 'running', 'checkpoint_wait')
             ORDER BY created_at ASC",
        )?;
        let rows = stmt
            .query_map([], row_to_task_record)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Mark tasks left non-terminal by a previous process as failed.
    /// Returns the ids that were recovered.
    pub fn recover_stale_tasks(&self, note: &str) -> Result<Vec<String>> {
        let stale = self.active_tasks()?;
        let conn = self.lock_conn()?;
        let now = Utc::now().to_rfc3339();
        let mut recovered = Vec::new();
        for task in stale {
            conn.execute(
                "UPDATE tasks SET status = ?2, outcome = ?3, completed_at = ?4 WHERE id = ?1",
                rusqlite::params![task.id, TaskStatus::Failed.as_str(), note, now],
            )?;
            recovered.push(task.id);
        }
        Ok(recovered)
    }
}

fn row_to_task_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRecord> {
    Ok(TaskRecord {
        id: row.get(0)?,
        origin: row.get(1)?,
        description: row.get(2)?,
        status: row.get(3)?,
        tier: row.get(4)?,
        steps: row.get::<_, i64>(5)? as u32,
        cost_usd: row.get(6)?,
        outcome: row.get(7)?,
        created_at: row.get(8)?,
        completed_at: row.get(9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Tier;

    fn store_in_tempdir() -> (tempfile::TempDir, MemoryStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(&dir.path().join("memory.sqlite")).unwrap();
        (dir, store)
    }

    #[test]
    fn session_items_keep_insertion_order() {
        let (_dir, store) = store_in_tempdir();
        store.append_session("t_a", 1, "first").unwrap();
        store.append_session("t_a", 1, "second").unwrap();
        store.append_session("t_a", 2, "third").unwrap();
        store.append_session("t_other", 1, "elsewhere").unwrap();

        let items = store.session_items("t_a").unwrap();
        let contents: Vec<&str> = items.iter().map(|i| i.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "second", "third"]);
        assert_eq!(items[2].step, 2);
    }

    #[test]
    fn clear_session_removes_only_that_task() {
        let (_dir, store) = store_in_tempdir();
        store.append_session("t_a", 1, "a").unwrap();
        store.append_session("t_b", 1, "b").unwrap();

        store.clear_session("t_a").unwrap();
        assert!(store.session_items("t_a").unwrap().is_empty());
        assert_eq!(store.session_items("t_b").unwrap().len(), 1);
    }

    #[test]
    fn promotion_round_trip_by_any_tag() {
        let (_dir, store) = store_in_tempdir();
        let item = LongTermItem::new(
            "preprocessing uses z-score normalization",
            vec!["preprocessing".into(), "normalization".into()],
            "user:42",
        );
        store.promote_long_term(&item).unwrap();

        for tag in ["preprocessing", "normalization"] {
            let found = store.search_long_term(&[tag.to_string()], 5).unwrap();
            assert_eq!(found.len(), 1, "tag {tag} should match");
            assert_eq!(found[0].id, item.id);
        }

        // Only explicit deletion removes it
        assert!(store.delete_long_term(&item.id).unwrap());
        assert!(store
            .search_long_term(&["preprocessing".to_string()], 5)
            .unwrap()
            .is_empty());
        assert!(!store.delete_long_term(&item.id).unwrap());
    }

    #[test]
    fn search_ranks_by_match_count() {
        let (_dir, store) = store_in_tempdir();
        let one = LongTermItem::new("single", vec!["alpha".into()], "u");
        let two = LongTermItem::new("double", vec!["alpha".into(), "beta".into()], "u");
        store.promote_long_term(&one).unwrap();
        store.promote_long_term(&two).unwrap();

        let found = store
            .search_long_term(&["alpha".to_string(), "beta".to_string()], 5)
            .unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].id, two.id);
    }

    #[test]
    fn promote_same_id_is_last_write_wins() {
        let (_dir, store) = store_in_tempdir();
        let mut item = LongTermItem::new("old", vec!["k".into()], "u");
        store.promote_long_term(&item).unwrap();
        item.content = "new".into();
        store.promote_long_term(&item).unwrap();

        let found = store.search_long_term(&["k".to_string()], 5).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].content, "new");
    }

    #[test]
    fn pinned_for_filters_by_origin() {
        let (_dir, store) = store_in_tempdir();
        store
            .promote_long_term(&LongTermItem::new("mine", vec!["a".into()], "user:1"))
            .unwrap();
        store
            .promote_long_term(&LongTermItem::new("theirs", vec!["a".into()], "user:2"))
            .unwrap();

        let pinned = store.pinned_for("user:1", 5).unwrap();
        assert_eq!(pinned.len(), 1);
        assert_eq!(pinned[0].content, "mine");
    }

    #[test]
    fn task_rows_update_and_fetch() {
        let (_dir, store) = store_in_tempdir();
        let mut task = Task::new("run the numbers", "user:1");
        store.insert_task(&task).unwrap();

        task.advance(TaskStatus::Running).unwrap();
        task.tier = Some(Tier::Deep);
        task.step = 3;
        task.cost_usd = 0.12;
        store.update_task(&task).unwrap();

        let rec = store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(rec.status, "running");
        assert_eq!(rec.tier.as_deref(), Some("deep"));
        assert_eq!(rec.steps, 3);
        assert!(store.get_task("t_missing").unwrap().is_none());
    }

    #[test]
    fn stale_recovery_fails_non_terminal_tasks() {
        let (_dir, store) = store_in_tempdir();
        let pending = Task::new("never started", "u");
        let mut done = Task::new("finished", "u");
        store.insert_task(&pending).unwrap();
        done.advance(TaskStatus::Running).unwrap();
        done.advance(TaskStatus::Completed).unwrap();
        store.insert_task(&done).unwrap();

        let recovered = store.recover_stale_tasks("recovered after restart").unwrap();
        assert_eq!(recovered, vec![pending.id.clone()]);

        let rec = store.get_task(&pending.id).unwrap().unwrap();
        assert_eq!(rec.status, "failed");
        assert_eq!(rec.outcome.as_deref(), Some("recovered after restart"));

        let done_rec = store.get_task(&done.id).unwrap().unwrap();
        assert_eq!(done_rec.status, "completed");
    }
}
