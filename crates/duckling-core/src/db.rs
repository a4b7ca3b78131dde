//! The durable store: CRUD over Task, TaskLog, Repository, PrecommitCheck,
//! Setting, plus the supplemental TaskOutput table, over a single SQLite
//! connection in WAL mode.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Mutex;

use crate::types::{
    CodingTool, LogLevel, PrecommitCheck, Repository, Task, TaskLog, TaskOutput, TaskStage, TaskStatus,
};

const SCHEMA_SQL: &str = include_str!("../../../schema.sql");

pub struct Db {
    conn: Mutex<Connection>,
}

// ── Timestamp helpers ───────────────────────────────────────────────────────

fn parse_ts(s: &str) -> DateTime<Utc> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .map(|ndt| ndt.and_utc())
        .unwrap_or_else(|_| Utc::now())
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn now_str() -> String {
    fmt_ts(Utc::now())
}

// ── Row mappers ──────────────────────────────────────────────────────────

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let status_str: String = row.get(4)?;
    let coding_tool_str: String = row.get(5)?;
    let current_stage_str: Option<String> = row.get(7)?;
    let created_at_str: String = row.get(12)?;
    let updated_at_str: String = row.get(13)?;
    let completed_at_str: Option<String> = row.get(14)?;
    Ok(Task {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        summary: row.get(3)?,
        status: TaskStatus::parse(&status_str).unwrap_or(TaskStatus::Failed),
        coding_tool: CodingTool::parse(&coding_tool_str).unwrap_or(CodingTool::Amp),
        repository_path: row.get(6)?,
        current_stage: current_stage_str.as_deref().and_then(TaskStage::parse),
        branch_name: row.get(8)?,
        pr_number: row.get(9)?,
        pr_url: row.get(10)?,
        last_error: row.get(11)?,
        created_at: parse_ts(&created_at_str),
        updated_at: parse_ts(&updated_at_str),
        completed_at: completed_at_str.as_deref().map(parse_ts),
    })
}

const TASK_COLUMNS: &str = "id, title, description, summary, status, coding_tool, repository_path, \
     current_stage, branch_name, pr_number, pr_url, last_error, created_at, updated_at, completed_at";

fn row_to_task_log(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskLog> {
    let level_str: String = row.get(2)?;
    let ts_str: String = row.get(3)?;
    Ok(TaskLog {
        id: row.get(0)?,
        task_id: row.get(1)?,
        level: LogLevel::parse(&level_str).unwrap_or(LogLevel::Info),
        message: row.get(4)?,
        timestamp: parse_ts(&ts_str),
    })
}

fn row_to_repository(row: &rusqlite::Row<'_>) -> rusqlite::Result<Repository> {
    Ok(Repository {
        path: row.get(0)?,
        name: row.get(1)?,
        owner: row.get(2)?,
    })
}

fn row_to_precommit_check(row: &rusqlite::Row<'_>) -> rusqlite::Result<PrecommitCheck> {
    Ok(PrecommitCheck {
        id: row.get(0)?,
        name: row.get(1)?,
        command: row.get(2)?,
        order_index: row.get(3)?,
    })
}

fn row_to_task_output(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskOutput> {
    let created_at_str: String = row.get(6)?;
    Ok(TaskOutput {
        id: row.get(0)?,
        task_id: row.get(1)?,
        stage: row.get(2)?,
        stdout: row.get(3)?,
        stderr: row.get(4)?,
        exit_code: row.get(5)?,
        created_at: parse_ts(&created_at_str),
    })
}

/// Options narrowing a `task_logs` read.
#[derive(Debug, Clone, Default)]
pub struct TaskLogQuery {
    pub level: Option<LogLevel>,
    pub after_id: Option<i64>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl Db {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).with_context(|| format!("failed to open SQLite database at {path:?}"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .context("failed to set PRAGMAs")?;
        let db = Self { conn: Mutex::new(conn) };
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory SQLite database")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;").context("failed to set PRAGMAs")?;
        let db = Self { conn: Mutex::new(conn) };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute_batch(SCHEMA_SQL).context("failed to apply schema")?;
        // Idempotent column additions for stores created before these columns existed.
        let alters = ["ALTER TABLE tasks ADD COLUMN summary TEXT"];
        for sql in alters {
            let _ = conn.execute(sql, []);
        }
        Ok(())
    }

    // ── Repositories (C14) ──────────────────────────────────────────────

    pub fn register_repository(&self, path: &str, name: &str, owner: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO repositories (path, name, owner) VALUES (?1, ?2, ?3) \
             ON CONFLICT(path) DO UPDATE SET name = excluded.name, owner = excluded.owner",
            params![path, name, owner],
        )
        .context("register_repository")?;
        Ok(())
    }

    pub fn get_repository(&self, path: &str) -> Result<Option<Repository>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row("SELECT path, name, owner FROM repositories WHERE path = ?1", params![path], row_to_repository)
            .optional()
            .context("get_repository")
    }

    pub fn list_repositories(&self) -> Result<Vec<Repository>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare("SELECT path, name, owner FROM repositories ORDER BY path ASC")?;
        let rows = stmt.query_map([], row_to_repository)?.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ── Tasks ─────────────────────────────────────────────────────────────

    pub fn create_task(&self, title: &str, description: &str, coding_tool: CodingTool, repository_path: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let now = now_str();
        conn.execute(
            "INSERT INTO tasks (title, description, summary, status, coding_tool, repository_path, \
             current_stage, branch_name, pr_number, pr_url, last_error, created_at, updated_at, completed_at) \
             VALUES (?1, ?2, NULL, ?3, ?4, ?5, NULL, NULL, NULL, NULL, NULL, ?6, ?6, NULL)",
            params![title, description, TaskStatus::Pending.as_str(), coding_tool.as_str(), repository_path, now],
        )
        .context("create_task")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_task(&self, id: i64) -> Result<Option<Task>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"), params![id], row_to_task)
            .optional()
            .context("get_task")
    }

    pub fn tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE status = ?1 ORDER BY id ASC"))?;
        let rows = stmt.query_map(params![status.as_str()], row_to_task)?.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn list_tasks(&self) -> Result<Vec<Task>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY id ASC"))?;
        let rows = stmt.query_map([], row_to_task)?.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn set_summary(&self, task_id: i64, summary: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute("UPDATE tasks SET summary = ?1, updated_at = ?2 WHERE id = ?3", params![summary, now_str(), task_id])
            .context("set_summary")?;
        Ok(())
    }

    /// Sets `status` and `current_stage` in a single update; the two are
    /// always written atomically together.
    pub fn transition(&self, task_id: i64, status: TaskStatus, stage: Option<TaskStage>) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE tasks SET status = ?1, current_stage = ?2, updated_at = ?3 WHERE id = ?4",
            params![status.as_str(), stage.map(TaskStage::as_str), now_str(), task_id],
        )
        .context("transition")?;
        Ok(())
    }

    pub fn complete_task(&self, task_id: i64, stage: TaskStage) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let now = now_str();
        conn.execute(
            "UPDATE tasks SET status = ?1, current_stage = ?2, completed_at = ?3, updated_at = ?3 WHERE id = ?4",
            params![TaskStatus::Completed.as_str(), stage.as_str(), now, task_id],
        )
        .context("complete_task")?;
        Ok(())
    }

    pub fn cancel_task_row(&self, task_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let now = now_str();
        conn.execute(
            "UPDATE tasks SET status = ?1, current_stage = ?2, completed_at = ?3, updated_at = ?3 WHERE id = ?4",
            params![TaskStatus::Cancelled.as_str(), TaskStage::Cancelled.as_str(), now, task_id],
        )
        .context("cancel_task_row")?;
        Ok(())
    }

    pub fn fail_task(&self, task_id: i64, error: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE tasks SET status = ?1, current_stage = ?2, last_error = ?3, updated_at = ?4 WHERE id = ?5",
            params![TaskStatus::Failed.as_str(), TaskStage::Failed.as_str(), error, now_str(), task_id],
        )
        .context("fail_task")?;
        Ok(())
    }

    pub fn set_branch_name(&self, task_id: i64, branch_name: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute("UPDATE tasks SET branch_name = ?1, updated_at = ?2 WHERE id = ?3", params![branch_name, now_str(), task_id])
            .context("set_branch_name")?;
        Ok(())
    }

    pub fn set_pr(&self, task_id: i64, pr_number: i64, pr_url: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE tasks SET pr_number = ?1, pr_url = ?2, updated_at = ?3 WHERE id = ?4",
            params![pr_number, pr_url, now_str(), task_id],
        )
        .context("set_pr")?;
        Ok(())
    }

    // ── Task logs (append-only) ───────────────────────────────────────────

    pub fn append_task_log(&self, task_id: i64, level: LogLevel, message: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO task_logs (task_id, level, message, timestamp) VALUES (?1, ?2, ?3, ?4)",
            params![task_id, level.as_str(), message, now_str()],
        )
        .context("append_task_log")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn task_logs(
        &self,
        task_id: i64,
        level: Option<LogLevel>,
        after_id: Option<i64>,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> Result<Vec<TaskLog>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut sql = "SELECT id, task_id, level, message, timestamp FROM task_logs \
                       WHERE task_id = ?1 AND (?2 IS NULL OR level = ?2) AND (?3 IS NULL OR id > ?3) \
                       ORDER BY id ASC"
            .to_string();
        if let Some(l) = limit {
            sql.push_str(&format!(" LIMIT {l}"));
        }
        if let Some(o) = offset {
            sql.push_str(&format!(" OFFSET {o}"));
        }
        let mut stmt = conn.prepare(&sql)?;
        let level_str: Option<&str> = level.map(LogLevel::as_str);
        let rows = stmt
            .query_map(params![task_id, level_str, after_id], row_to_task_log)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("task_logs")?;
        Ok(rows)
    }

    // ── Precommit checks ──────────────────────────────────────────────────

    pub fn add_precommit_check(&self, name: &str, command: &str, order_index: i64) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO precommit_checks (name, command, order_index) VALUES (?1, ?2, ?3)",
            params![name, command, order_index],
        )
        .context("add_precommit_check")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_precommit_checks(&self) -> Result<Vec<PrecommitCheck>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare("SELECT id, name, command, order_index FROM precommit_checks ORDER BY order_index ASC, id ASC")?;
        let rows = stmt.query_map([], row_to_precommit_check)?.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ── Settings ───────────────────────────────────────────────────────────

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row("SELECT value FROM settings WHERE key = ?1", params![key], |row| row.get(0))
            .optional()
            .context("get_setting")
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, now_str()],
        )
        .context("set_setting")?;
        Ok(())
    }

    // ── Task outputs (supplemental) ───────────────────────────────────────

    pub fn insert_task_output(&self, task_id: i64, stage: &str, stdout: &str, stderr: &str, exit_code: Option<i32>) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO task_outputs (task_id, stage, stdout, stderr, exit_code, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![task_id, stage, stdout, stderr, exit_code, now_str()],
        )
        .context("insert_task_output")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn task_outputs(&self, task_id: i64) -> Result<Vec<TaskOutput>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare("SELECT id, task_id, stage, stdout, stderr, exit_code, created_at FROM task_outputs WHERE task_id = ?1 ORDER BY id ASC")?;
        let rows = stmt.query_map(params![task_id], row_to_task_output)?.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_task_defaults_to_pending_with_no_stage() {
        let db = Db::open_in_memory().unwrap();
        db.register_repository("/r", "n", "o").unwrap();
        let id = db.create_task("t", "d", CodingTool::Amp, "/r").unwrap();
        let task = db.get_task(id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.current_stage.is_none());
        assert!(task.branch_name.is_none());
    }

    #[test]
    fn tasks_by_status_filters_and_orders_by_id() {
        let db = Db::open_in_memory().unwrap();
        db.register_repository("/r", "n", "o").unwrap();
        let a = db.create_task("a", "d", CodingTool::Amp, "/r").unwrap();
        let b = db.create_task("b", "d", CodingTool::Amp, "/r").unwrap();
        db.transition(b, TaskStatus::InProgress, Some(TaskStage::CreatingBranch)).unwrap();
        let pending = db.tasks_by_status(TaskStatus::Pending).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, a);
    }

    #[test]
    fn task_log_ids_strictly_increase_per_task() {
        let db = Db::open_in_memory().unwrap();
        db.register_repository("/r", "n", "o").unwrap();
        let id = db.create_task("t", "d", CodingTool::Amp, "/r").unwrap();
        let l1 = db.append_task_log(id, LogLevel::Info, "one").unwrap();
        let l2 = db.append_task_log(id, LogLevel::Info, "two").unwrap();
        assert!(l2 > l1);
    }

    #[test]
    fn setting_roundtrips_and_upserts() {
        let db = Db::open_in_memory().unwrap();
        assert_eq!(db.get_setting("branchPrefix").unwrap(), None);
        db.set_setting("branchPrefix", "foo-").unwrap();
        assert_eq!(db.get_setting("branchPrefix").unwrap(), Some("foo-".to_string()));
        db.set_setting("branchPrefix", "bar-").unwrap();
        assert_eq!(db.get_setting("branchPrefix").unwrap(), Some("bar-".to_string()));
    }

    #[test]
    fn precommit_checks_ordered_by_order_index_then_id() {
        let db = Db::open_in_memory().unwrap();
        db.add_precommit_check("b", "true", 1).unwrap();
        db.add_precommit_check("a", "true", 0).unwrap();
        let checks = db.list_precommit_checks().unwrap();
        assert_eq!(checks[0].name, "a");
        assert_eq!(checks[1].name, "b");
    }
}
