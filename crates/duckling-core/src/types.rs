use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A task's position in the fixed state machine.
///
/// `failed -> pending` via explicit retry is the only reverse transition;
/// `completed`, `cancelled` and `failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    AwaitingReview,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in-progress",
            Self::AwaitingReview => "awaiting-review",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => Self::Pending,
            "in-progress" => Self::InProgress,
            "awaiting-review" => Self::AwaitingReview,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            _ => return None,
        })
    }
}

/// Informational label mirroring the current pipeline step. May lag `status`
/// by one log entry but must equal the terminal name (or its predecessor) by
/// the time `status` is observed terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStage {
    CreatingBranch,
    GeneratingCode,
    RunningPrecommitChecks,
    CommittingChanges,
    CreatingPr,
    AwaitingReview,
    Completed,
    Cancelled,
    Failed,
}

impl TaskStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CreatingBranch => "creating_branch",
            Self::GeneratingCode => "generating_code",
            Self::RunningPrecommitChecks => "running_precommit_checks",
            Self::CommittingChanges => "committing_changes",
            Self::CreatingPr => "creating_pr",
            Self::AwaitingReview => "awaiting_review",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "creating_branch" => Self::CreatingBranch,
            "generating_code" => Self::GeneratingCode,
            "running_precommit_checks" => Self::RunningPrecommitChecks,
            "committing_changes" => Self::CommittingChanges,
            "creating_pr" => Self::CreatingPr,
            "awaiting_review" => Self::AwaitingReview,
            "completed" => Self::Completed,
            "cancelled" => Self::Cancelled,
            "failed" => Self::Failed,
            _ => return None,
        })
    }
}

/// Named external coding assistants the bridge (C7) can invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodingTool {
    Amp,
    Openai,
}

impl CodingTool {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Amp => "amp",
            Self::Openai => "openai",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "amp" => Self::Amp,
            "openai" => Self::Openai,
            _ => return None,
        })
    }
}

/// Primary entity: one user-submitted instruction carried from submission to
/// PR close.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub summary: Option<String>,
    pub status: TaskStatus,
    pub coding_tool: CodingTool,
    pub repository_path: String,
    pub current_stage: Option<TaskStage>,
    pub branch_name: Option<String>,
    pub pr_number: Option<i64>,
    pub pr_url: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Append-only log line against a task. Never mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLog {
    pub id: i64,
    pub task_id: i64,
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Registry row mapping a working-copy path to a hosted (owner, name) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub path: String,
    pub name: String,
    pub owner: String,
}

/// One step of the pre-commit runner's ordered shell-check list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrecommitCheck {
    pub id: i64,
    pub name: String,
    pub command: String,
    pub order_index: i64,
}

/// One raw process-output row captured for a pipeline step invocation.
/// Backs "the tail of its task logs" with the actual stdout/stderr a step
/// produced, distinct from the human-readable TaskLog narrative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutput {
    pub id: i64,
    pub task_id: i64,
    pub stage: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub created_at: DateTime<Utc>,
}

/// Transient event published on every status transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskUpdateEvent {
    pub task_id: i64,
    pub status: TaskStatus,
    pub task: Task,
}
