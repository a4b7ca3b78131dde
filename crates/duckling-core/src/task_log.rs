//! Task-log wrapper (C13): emits standardized start/success/failure messages
//! around an action, re-raising on exception.

use std::future::Future;

use anyhow::Result;

use crate::db::Db;
use crate::types::LogLevel;

pub struct TaskLogWrapper<'a> {
    pub db: &'a Db,
    pub task_id: i64,
    pub start_message: &'a str,
    pub complete_message: &'a str,
    pub failure_message: &'a str,
}

impl<'a> TaskLogWrapper<'a> {
    pub async fn run<T, F, Fut>(&self, action: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.db.append_task_log(self.task_id, LogLevel::Info, self.start_message)?;
        match action().await {
            Ok(v) => {
                self.db.append_task_log(self.task_id, LogLevel::Info, self.complete_message)?;
                Ok(v)
            }
            Err(e) => {
                self.db
                    .append_task_log(self.task_id, LogLevel::Error, &format!("{}: {}", self.failure_message, e))?;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;

    fn test_db() -> Db {
        let db = Db::open_in_memory().unwrap();
        db.register_repository("/r", "n", "o").unwrap();
        db.create_task("t", "d", crate::types::CodingTool::Amp, "/r").unwrap();
        db
    }

    #[tokio::test]
    async fn success_emits_start_and_complete_logs() {
        let db = test_db();
        let wrapper = TaskLogWrapper { db: &db, task_id: 1, start_message: "starting", complete_message: "done", failure_message: "failed" };
        wrapper.run(|| async { Ok::<_, anyhow::Error>(()) }).await.unwrap();
        let logs = db.task_logs(1, None, None, None, None).unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].message, "starting");
        assert_eq!(logs[1].message, "done");
    }

    #[tokio::test]
    async fn failure_emits_start_and_error_log_then_reraises() {
        let db = test_db();
        let wrapper = TaskLogWrapper { db: &db, task_id: 1, start_message: "starting", complete_message: "done", failure_message: "failed" };
        let result = wrapper.run(|| async { Err::<(), _>(anyhow::anyhow!("boom")) }).await;
        assert!(result.is_err());
        let logs = db.task_logs(1, None, None, None, None).unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[1].level, LogLevel::Error);
        assert!(logs[1].message.contains("boom"));
    }
}
