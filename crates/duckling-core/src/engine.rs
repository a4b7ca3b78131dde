//! The task lifecycle engine (C11): fixed state machine, scheduler tick,
//! pipeline, and review ingestion. Everything else in this crate exists to
//! be called from here.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::agent::{AssistantBridge, AssistantContext};
use crate::db::Db;
use crate::events::EventBus;
use crate::executor::TaskExecutor;
use crate::git::Git;
use crate::hosted_vcs::{render_review, HostedVcsClient, Review, ReviewComment};
use crate::llm::{fallback_commit_message, fallback_summary, LlmUtility};
use crate::precommit;
use crate::repository_registry::RepositoryRegistry;
use crate::retry::{retry_async, RetryConfig};
use crate::settings::Settings;
use crate::task_log::TaskLogWrapper;
use crate::types::{LogLevel, Task, TaskStage, TaskStatus, TaskUpdateEvent};

const FEEDBACK_COMMIT_MESSAGE: &str = "apply review feedback";

#[derive(Clone)]
struct Deps {
    db: Arc<Db>,
    events: Arc<EventBus>,
    hosted_vcs: Arc<dyn HostedVcsClient>,
    assistant: Arc<AssistantBridge>,
    llm: Arc<dyn LlmUtility>,
    executor: TaskExecutor,
}

pub struct Engine {
    deps: Deps,
    ticking: AtomicBool,
}

impl Engine {
    pub fn new(
        db: Arc<Db>,
        executor: TaskExecutor,
        events: Arc<EventBus>,
        hosted_vcs: Arc<dyn HostedVcsClient>,
        assistant: Arc<AssistantBridge>,
        llm: Arc<dyn LlmUtility>,
    ) -> Self {
        Self {
            deps: Deps { db, events, hosted_vcs, assistant, llm, executor },
            ticking: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskUpdateEvent> {
        self.deps.events.subscribe()
    }

    /// How many task-bound operations (pipeline runs, review-feedback
    /// applications) are in flight right now.
    pub fn active_task_count(&self) -> usize {
        self.deps.executor.active_count()
    }

    fn publish(&self, task_id: i64) -> Result<()> {
        if let Some(task) = self.deps.db.get_task(task_id)? {
            self.deps.events.publish(TaskUpdateEvent { task_id, status: task.status, task });
        }
        Ok(())
    }

    // ── Public contract ───────────────────────────────────────────────────

    pub async fn create_task(&self, title: &str, description: &str, coding_tool: crate::types::CodingTool, repository_path: &str) -> Result<i64> {
        if description.trim().is_empty() {
            return Err(anyhow!("task description must not be empty"));
        }
        RepositoryRegistry::new(&self.deps.db)
            .lookup(repository_path)
            .context("repository must be registered before it can receive tasks")?;

        let retry_cfg = RetryConfig::new(Settings::new(&self.deps.db).max_retries());
        let summary = retry_async(&retry_cfg, "llm:generate_task_summary", || async {
            let text = self.deps.llm.generate_task_summary(description).await;
            if text.trim().is_empty() { Err(anyhow!("llm returned an empty task summary")) } else { Ok(text) }
        })
        .await
        .unwrap_or_else(|_| fallback_summary(description));

        let task_id = self.deps.db.create_task(title, description, coding_tool, repository_path)?;
        if !summary.trim().is_empty() {
            self.deps.db.set_summary(task_id, summary.trim())?;
        }
        self.deps.db.append_task_log(task_id, LogLevel::Info, &format!("task created: {title}"))?;
        self.publish(task_id)?;
        Ok(task_id)
    }

    pub fn cancel_task(&self, task_id: i64) -> Result<()> {
        let task = self.deps.db.get_task(task_id)?.ok_or_else(|| anyhow!("task not found: {task_id}"))?;
        if task.status.is_terminal() {
            return Ok(());
        }
        self.deps.db.cancel_task_row(task_id)?;
        self.deps.db.append_task_log(task_id, LogLevel::Info, "task cancelled")?;
        self.publish(task_id)
    }

    pub fn retry_task(&self, task_id: i64) -> Result<()> {
        let task = self.deps.db.get_task(task_id)?.ok_or_else(|| anyhow!("task not found: {task_id}"))?;
        if task.status != TaskStatus::Failed {
            return Err(anyhow!("task #{task_id} is not failed, cannot retry"));
        }
        self.deps.db.transition(task_id, TaskStatus::Pending, None)?;
        self.deps.db.append_task_log(task_id, LogLevel::Info, "task retried")?;
        self.publish(task_id)
    }

    pub fn mark_complete(&self, task_id: i64) -> Result<()> {
        let task = self.deps.db.get_task(task_id)?.ok_or_else(|| anyhow!("task not found: {task_id}"))?;
        if task.status.is_terminal() {
            return Ok(());
        }
        self.deps.db.complete_task(task_id, TaskStage::Completed)?;
        self.deps.db.append_task_log(task_id, LogLevel::Info, "task marked complete by user")?;
        self.publish(task_id)
    }

    // ── Scheduler ──────────────────────────────────────────────────────────

    /// One scheduler tick: review phase, then pending phase, both by
    /// ascending task id. Skipped (with a log line) if the previous tick is
    /// still running.
    pub async fn tick(&self) -> Result<()> {
        if self.ticking.swap(true, Ordering::AcqRel) {
            info!("scheduler tick already in progress, skipping this firing");
            return Ok(());
        }
        let result = self.run_tick().await;
        self.ticking.store(false, Ordering::Release);
        result
    }

    async fn run_tick(&self) -> Result<()> {
        let awaiting = self.deps.db.tasks_by_status(TaskStatus::AwaitingReview).context("list awaiting-review tasks")?;
        for task in awaiting {
            if let Err(e) = ingest_reviews(&self.deps, task.id).await {
                warn!(task_id = task.id, error = %e, "review ingestion failed this tick, task remains awaiting-review");
            }
        }

        let pending = self.deps.db.tasks_by_status(TaskStatus::Pending).context("list pending tasks")?;
        for task in pending {
            let deps = self.deps.clone();
            let task_id = task.id;
            let result = self
                .deps
                .executor
                .submit(task_id, "pipeline", move || async move { run_pipeline(&deps, task_id).await })
                .await;
            if let Err(e) = result {
                warn!(task_id, error = %e, "pipeline operation failed");
            }
        }
        Ok(())
    }
}

// ── Cooperative cancellation ────────────────────────────────────────────────

/// Re-reads the task; returns `None` if it has reached a terminal state,
/// meaning the caller must abort without writing anything further.
fn reload_if_live(db: &Db, task_id: i64) -> Result<Option<Task>> {
    let task = db.get_task(task_id)?.ok_or_else(|| anyhow!("task not found: {task_id}"))?;
    if task.status.is_terminal() {
        return Ok(None);
    }
    Ok(Some(task))
}

async fn step<T, F, Fut>(db: &Db, task_id: i64, start: &str, complete: &str, failure: &str, action: F) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    TaskLogWrapper { db, task_id, start_message: start, complete_message: complete, failure_message: failure }
        .run(action)
        .await
}

// ── Branch slug derivation ──────────────────────────────────────────────────

fn sanitize_slug(raw: &str, max_len: usize) -> String {
    let mut out = String::new();
    let mut last_dash = false;
    for ch in raw.to_lowercase().chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch);
            last_dash = false;
        } else if !last_dash && !out.is_empty() {
            out.push('-');
            last_dash = true;
        }
    }
    let out = out.trim_end_matches('-').to_string();
    if out.chars().count() > max_len {
        out.chars().take(max_len).collect::<String>().trim_end_matches('-').to_string()
    } else {
        out
    }
}

fn fallback_slug_from_description(description: &str, max_len: usize) -> String {
    let words: Vec<&str> = description.split_whitespace().take(4).collect();
    let joined = words.join("-");
    let slug = sanitize_slug(&joined, max_len);
    if slug.is_empty() { "task".to_string() } else { slug }
}

// ── Pipeline (pending task advance) ─────────────────────────────────────────

async fn run_pipeline(deps: &Deps, task_id: i64) -> Result<()> {
    match run_pipeline_inner(deps, task_id).await {
        Ok(()) => Ok(()),
        Err(e) => {
            deps.db.fail_task(task_id, &e.to_string()).ok();
            deps.db.append_task_log(task_id, LogLevel::Error, &format!("pipeline failed: {e}")).ok();
            let _ = publish_from(deps, task_id);
            Err(e)
        }
    }
}

/// Logs `result`'s error against the task (best-effort) before returning it
/// unchanged, so a caller that propagates with `?` still leaves a visible
/// log trail on the task.
fn log_and_propagate<T>(db: &Db, task_id: i64, label: &str, result: Result<T>) -> Result<T> {
    if let Err(e) = &result {
        db.append_task_log(task_id, LogLevel::Error, &format!("{label}: {e}")).ok();
    }
    result
}

fn publish_from(deps: &Deps, task_id: i64) -> Result<()> {
    if let Some(task) = deps.db.get_task(task_id)? {
        deps.events.publish(TaskUpdateEvent { task_id, status: task.status, task });
    }
    Ok(())
}

async fn run_pipeline_inner(deps: &Deps, task_id: i64) -> Result<()> {
    let Some(task) = reload_if_live(&deps.db, task_id)? else { return Ok(()) };
    let repo = RepositoryRegistry::new(&deps.db).lookup(&task.repository_path)?;
    let settings = Settings::new(&deps.db);
    let retry_cfg = RetryConfig::new(settings.max_retries());
    let branch_prefix = settings.branch_prefix();

    // Step 1: pending -> in-progress, creating_branch.
    deps.db.transition(task_id, TaskStatus::InProgress, Some(TaskStage::CreatingBranch))?;
    publish_from(deps, task_id)?;

    let Some(task) = reload_if_live(&deps.db, task_id)? else { return Ok(()) };
    let description = task.description.clone();
    let git = Git::new(task.repository_path.clone());

    // Step 2: branch-name generation + creation.
    let branch_name = step(
        &deps.db,
        task_id,
        "generating branch name",
        "branch created",
        "branch creation failed",
        || async {
            let max_slug_len = 30usize.saturating_sub(branch_prefix.chars().count());
            let slug_raw = retry_async(&retry_cfg, "llm:generate_branch_slug", || async {
                let text = deps.llm.generate_branch_slug(&description).await;
                if text.trim().is_empty() { Err(anyhow!("llm returned an empty branch slug")) } else { Ok(text) }
            })
            .await
            .unwrap_or_default();
            let slug = if slug_raw.trim().is_empty() {
                fallback_slug_from_description(&description, max_slug_len)
            } else {
                let sanitized = sanitize_slug(slug_raw.trim(), max_slug_len);
                if sanitized.is_empty() { fallback_slug_from_description(&description, max_slug_len) } else { sanitized }
            };

            let default_branch = deps.hosted_vcs.get_default_branch(&repo.owner, &repo.name).await.unwrap_or_else(|_| "main".to_string());

            retry_async(&retry_cfg, "git:hard_reset", || async { git.hard_reset() }).await?;
            retry_async(&retry_cfg, "git:clean_fd", || async { git.clean_fd() }).await?;
            retry_async(&retry_cfg, "git:checkout_base", || async { git.checkout(&default_branch) }).await?;
            retry_async(&retry_cfg, "git:pull_base", || async { git.pull("origin", &default_branch) }).await?;

            let existing = git.list_local_branches().unwrap_or_default();
            let mut candidate = format!("{branch_prefix}{slug}");
            let mut n = 1u32;
            while existing.contains(&candidate) {
                candidate = format!("{branch_prefix}{slug}-{n}");
                n += 1;
            }
            retry_async(&retry_cfg, "git:create_local_branch", || async { git.create_local_branch(&candidate) }).await?;
            Ok(candidate)
        },
    )
    .await?;

    deps.db.set_branch_name(task_id, &branch_name)?;
    publish_from(deps, task_id)?;

    let Some(task) = reload_if_live(&deps.db, task_id)? else { return Ok(()) };

    // Step 3: generate code.
    deps.db.transition(task_id, TaskStatus::InProgress, Some(TaskStage::GeneratingCode))?;
    publish_from(deps, task_id)?;

    let assistant_ctx = AssistantContext { task_id, repository_path: task.repository_path.clone() };
    step(&deps.db, task_id, "invoking assistant", "assistant finished", "assistant invocation failed", || async {
        let output = retry_async(&retry_cfg, "assistant:generate", || async {
            deps.assistant.generate(task.coding_tool, &description, &assistant_ctx).await
        })
        .await?;
        deps.db.insert_task_output(task_id, "generating_code", &output, "", None).ok();
        Ok(())
    })
    .await?;

    if reload_if_live(&deps.db, task_id)?.is_none() {
        return Ok(());
    }

    // Step 4: pre-commit checks, two-round fix policy.
    deps.db.transition(task_id, TaskStatus::InProgress, Some(TaskStage::RunningPrecommitChecks))?;
    publish_from(deps, task_id)?;

    step(&deps.db, task_id, "running pre-commit checks", "pre-commit checks settled", "pre-commit checks errored", || async {
        let checks = deps.db.list_precommit_checks()?;
        let failures = precommit::run_checks(&task.repository_path, &checks).await?;
        let rendered = failures.iter().map(|f| f.rendered()).collect::<Vec<_>>().join("\n");
        deps.db.insert_task_output(task_id, "precommit_checks", &rendered, "", Some(if failures.is_empty() { 0 } else { 1 })).ok();
        if !failures.is_empty() {
            let fix_prompt = format!("{description}\n\nThe following pre-commit checks failed:\n{rendered}\n\nPlease fix these issues.");
            retry_async(&retry_cfg, "assistant:generate_fix", || async { deps.assistant.generate(task.coding_tool, &fix_prompt, &assistant_ctx).await }).await?;
            let second_failures = precommit::run_checks(&task.repository_path, &checks).await?;
            let second_rendered = second_failures.iter().map(|f| f.rendered()).collect::<Vec<_>>().join("; ");
            deps.db
                .insert_task_output(task_id, "precommit_checks_retry", &second_rendered, "", Some(if second_failures.is_empty() { 0 } else { 1 }))
                .ok();
            if !second_failures.is_empty() {
                warn!(task_id, "pre-commit checks still failing after fix round, continuing anyway");
                deps.db.append_task_log(task_id, LogLevel::Warn, &format!("pre-commit checks still failing after fix round: {second_rendered}"))?;
            }
        }
        Ok(())
    })
    .await?;

    if reload_if_live(&deps.db, task_id)?.is_none() {
        return Ok(());
    }

    // Step 5: commit and push.
    deps.db.transition(task_id, TaskStatus::InProgress, Some(TaskStage::CommittingChanges))?;
    publish_from(deps, task_id)?;

    step(&deps.db, task_id, "committing changes", "changes pushed", "commit/push failed", || async {
        retry_async(&retry_cfg, "git:add", || async { git.add(".") }).await?;
        let status = retry_async(&retry_cfg, "git:status", || async { git.status() }).await?;
        if status.files.is_empty() {
            return Err(anyhow!("nothing staged to commit"));
        }

        let generated = retry_async(&retry_cfg, "llm:generate_commit_message", || async {
            let text = deps.llm.generate_commit_message(&description, &status.files).await;
            if text.trim().is_empty() { Err(anyhow!("llm returned an empty commit message")) } else { Ok(text) }
        })
        .await
        .unwrap_or_default();
        let mut message = if generated.trim().is_empty() { fallback_summary(&description) } else { generated.trim().to_string() };
        if message.is_empty() {
            message = fallback_commit_message(&description, &status.files);
        }
        if message.chars().count() > 50 {
            message = message.chars().take(50).collect();
        }
        let suffix = settings.commit_suffix();
        if !message.ends_with(suffix.as_str()) {
            message.push_str(&suffix);
        }

        retry_async(&retry_cfg, "git:commit", || async { git.commit(&message) }).await?;
        retry_async(&retry_cfg, "git:push", || async { git.push("origin", &branch_name) }).await?;
        Ok(())
    })
    .await?;

    if reload_if_live(&deps.db, task_id)?.is_none() {
        return Ok(());
    }

    // Step 6: open or reuse PR.
    deps.db.transition(task_id, TaskStatus::InProgress, Some(TaskStage::CreatingPr))?;
    publish_from(deps, task_id)?;

    step(&deps.db, task_id, "creating pull request", "pull request ready", "pull request creation failed", || async {
        let default_branch = deps.hosted_vcs.get_default_branch(&repo.owner, &repo.name).await.unwrap_or_else(|_| "main".to_string());
        let title_raw = retry_async(&retry_cfg, "llm:generate_pr_title", || async {
            let text = deps.llm.generate_pr_title(&description).await;
            if text.trim().is_empty() { Err(anyhow!("llm returned an empty pr title")) } else { Ok(text) }
        })
        .await
        .unwrap_or_default();
        let title = if title_raw.trim().is_empty() {
            format!("{} {}", settings.pr_title_prefix(), fallback_summary(&description))
        } else {
            format!("{} {}", settings.pr_title_prefix(), title_raw.trim())
        };
        let body_raw = retry_async(&retry_cfg, "llm:generate_pr_body", || async {
            let text = deps.llm.generate_pr_body(&description, &branch_name).await;
            if text.trim().is_empty() { Err(anyhow!("llm returned an empty pr body")) } else { Ok(text) }
        })
        .await
        .unwrap_or_default();
        let body = if body_raw.trim().is_empty() { description.clone() } else { body_raw };

        let pr = retry_async(&retry_cfg, "hosted_vcs:create_pr", || async {
            deps.hosted_vcs.create_pr(&repo.owner, &repo.name, &branch_name, &default_branch, &title, &body).await
        })
        .await?;

        deps.db.set_pr(task_id, pr.number, &pr.url)?;
        deps.db.transition(task_id, TaskStatus::AwaitingReview, Some(TaskStage::AwaitingReview))?;
        Ok(())
    })
    .await?;

    publish_from(deps, task_id)?;
    Ok(())
}

// ── Review ingestion ─────────────────────────────────────────────────────────

async fn ingest_reviews(deps: &Deps, task_id: i64) -> Result<()> {
    let Some(task) = deps.db.get_task(task_id)? else { return Ok(()) };
    let (Some(pr_number), Some(branch_name)) = (task.pr_number, task.branch_name.clone()) else {
        return Ok(());
    };
    let repo = RepositoryRegistry::new(&deps.db).lookup(&task.repository_path)?;
    let settings = Settings::new(&deps.db);
    let retry_cfg = RetryConfig::new(settings.max_retries());
    let github_username = settings.github_username();

    let git = Git::new(task.repository_path.clone());
    if let Err(e) = retry_async(&retry_cfg, "git:fetch", || async { git.fetch("origin", &branch_name) }).await {
        deps.db.append_task_log(task_id, LogLevel::Warn, &format!("git fetch failed during review ingestion: {e}")).ok();
    }
    if let Err(e) = git.hard_reset() {
        deps.db.append_task_log(task_id, LogLevel::Warn, &format!("git hard reset failed during review ingestion: {e}")).ok();
    }
    if let Err(e) = git.clean_fd() {
        deps.db.append_task_log(task_id, LogLevel::Warn, &format!("git clean failed during review ingestion: {e}")).ok();
    }
    if let Err(e) = git.checkout(&branch_name) {
        deps.db.append_task_log(task_id, LogLevel::Warn, &format!("git checkout failed during review ingestion: {e}")).ok();
    }
    if let Err(e) = git.pull("origin", &branch_name) {
        deps.db.append_task_log(task_id, LogLevel::Warn, &format!("git pull failed during review ingestion: {e}")).ok();
    }

    let last_commit_ts: Option<DateTime<Utc>> = git
        .log_last_commit_timestamp()
        .ok()
        .and_then(|ts| DateTime::parse_from_rfc3339(&ts).ok())
        .map(|d| d.with_timezone(&Utc));

    let reviews = log_and_propagate(
        &deps.db,
        task_id,
        "listing reviews failed",
        retry_async(&retry_cfg, "hosted_vcs:list_reviews", || async { deps.hosted_vcs.list_reviews(&repo.owner, &repo.name, pr_number).await }).await,
    )?;

    let qualifying: Vec<Review> = reviews
        .into_iter()
        .filter(|r| r.author_login.eq_ignore_ascii_case(&github_username))
        .filter(|r| match (r.submitted_at, last_commit_ts) {
            (Some(submitted), Some(last)) => submitted > last,
            (Some(_), None) => true,
            (None, _) => false,
        })
        .filter(|r| !r.state.eq_ignore_ascii_case("PENDING"))
        .collect();

    let mut rendered_blobs = Vec::new();
    let mut newest_review_id: Option<i64> = None;
    if !qualifying.is_empty() {
        let mut per_review_comments: Vec<(Review, Vec<ReviewComment>)> = Vec::new();
        for review in &qualifying {
            let comments = log_and_propagate(
                &deps.db,
                task_id,
                "listing review comments failed",
                retry_async(&retry_cfg, "hosted_vcs:list_review_comments", || async {
                    deps.hosted_vcs.list_review_comments(&repo.owner, &repo.name, pr_number, review.id).await
                })
                .await,
            )?;
            per_review_comments.push((review.clone(), comments));
        }
        let all_ids: std::collections::HashSet<i64> = per_review_comments.iter().flat_map(|(_, cs)| cs.iter().map(|c| c.id)).collect();
        for (review, comments) in &per_review_comments {
            let kept: Vec<ReviewComment> = comments
                .iter()
                .filter(|c| match c.in_reply_to_id {
                    Some(parent) => all_ids.contains(&parent),
                    None => true,
                })
                .cloned()
                .collect();
            rendered_blobs.push(render_review(review, &kept));
            newest_review_id = Some(newest_review_id.map_or(review.id, |n| n.max(review.id)));
        }
    }

    let pr_status = log_and_propagate(
        &deps.db,
        task_id,
        "checking pr status failed",
        retry_async(&retry_cfg, "hosted_vcs:get_pr", || async { deps.hosted_vcs.get_pr(&repo.owner, &repo.name, pr_number).await }).await,
    )?;
    if pr_status.merged {
        deps.db.complete_task(task_id, TaskStage::Completed)?;
        publish_from(deps, task_id)?;
        return Ok(());
    }
    if pr_status.state.eq_ignore_ascii_case("closed") {
        deps.db.cancel_task_row(task_id)?;
        publish_from(deps, task_id)?;
        return Ok(());
    }

    if rendered_blobs.is_empty() {
        return Ok(());
    }

    let combined_feedback = rendered_blobs.join("\n---\n");
    let settings_suffix = settings.commit_suffix();
    let deps_for_op = deps.clone();
    let task_for_op = task.clone();
    let branch_for_op = branch_name.clone();

    deps.db.append_task_log(task_id, LogLevel::Info, "applying review feedback")?;

    // A single task-bound operation submitted to the executor, so it never
    // races an in-flight pipeline run for this same task.
    let result = deps
        .executor
        .submit(task_id, "review-feedback", move || async move {
            let assistant_ctx = AssistantContext { task_id, repository_path: task_for_op.repository_path.clone() };
            let prompt = format!("{}\n\n{}", task_for_op.description, combined_feedback);
            let retry_cfg_op = RetryConfig::new(Settings::new(&deps_for_op.db).max_retries());
            retry_async(&retry_cfg_op, "assistant:generate_review_feedback", || async {
                deps_for_op.assistant.generate(task_for_op.coding_tool, &prompt, &assistant_ctx).await
            })
            .await?;

            let checks = deps_for_op.db.list_precommit_checks()?;
            let failures = precommit::run_checks(&task_for_op.repository_path, &checks).await?;
            let rendered = failures.iter().map(|f| f.rendered()).collect::<Vec<_>>().join("\n");
            deps_for_op
                .db
                .insert_task_output(task_id, "review_feedback_precommit", &rendered, "", Some(if failures.is_empty() { 0 } else { 1 }))
                .ok();
            if !failures.is_empty() {
                let fix_prompt = format!("{}\n\nThe following pre-commit checks failed:\n{rendered}\n\nPlease fix these issues.", task_for_op.description);
                retry_async(&retry_cfg_op, "assistant:generate_review_feedback_fix", || async {
                    deps_for_op.assistant.generate(task_for_op.coding_tool, &fix_prompt, &assistant_ctx).await
                })
                .await?;
                let second_failures = precommit::run_checks(&task_for_op.repository_path, &checks).await?;
                if !second_failures.is_empty() {
                    warn!(task_id, "pre-commit checks still failing after feedback fix round, continuing anyway");
                }
            }

            let git = Git::new(task_for_op.repository_path.clone());
            git.add(".")?;
            let status = git.status()?;
            if !status.files.is_empty() {
                let mut message = FEEDBACK_COMMIT_MESSAGE.to_string();
                if !message.ends_with(settings_suffix.as_str()) {
                    message.push_str(&settings_suffix);
                }
                git.commit(&message)?;
                git.push("origin", &branch_for_op)?;
            }
            Ok(())
        })
        .await;

    match result {
        Ok(()) => {
            if let Some(review_id) = newest_review_id {
                deps.db.set_setting(&format!("last_comment_{task_id}"), &review_id.to_string())?;
            }
            deps.db.append_task_log(task_id, LogLevel::Info, "review feedback applied")?;
            Ok(())
        }
        Err(e) => {
            deps.db.append_task_log(task_id, LogLevel::Error, &format!("review feedback application failed: {e}"))?;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hosted_vcs::{PrHandle, PrStatus};
    use crate::types::CodingTool;
    use async_trait::async_trait;
    use std::process::Command as StdCommand;
    use std::sync::Mutex as StdMutex;

    struct FakeHostedVcs {
        pr_counter: StdMutex<i64>,
        prs: StdMutex<std::collections::HashMap<String, PrHandle>>,
        reviews: StdMutex<Vec<Review>>,
        pr_status: StdMutex<PrStatus>,
    }

    impl FakeHostedVcs {
        fn new() -> Self {
            Self {
                pr_counter: StdMutex::new(0),
                prs: StdMutex::new(std::collections::HashMap::new()),
                reviews: StdMutex::new(Vec::new()),
                pr_status: StdMutex::new(PrStatus { state: "open".into(), mergeable: Some(true), merged: false }),
            }
        }
    }

    #[async_trait]
    impl HostedVcsClient for FakeHostedVcs {
        async fn get_default_branch(&self, _owner: &str, _name: &str) -> Result<String> {
            Ok("main".to_string())
        }

        async fn create_pr(&self, _owner: &str, _name: &str, head_branch: &str, _base_branch: &str, _title: &str, _body: &str) -> Result<PrHandle> {
            if let Some(existing) = self.prs.lock().unwrap().get(head_branch) {
                return Ok(existing.clone());
            }
            let mut counter = self.pr_counter.lock().unwrap();
            *counter += 1;
            let handle = PrHandle { number: *counter, url: format!("https://example.invalid/pr/{counter}") };
            self.prs.lock().unwrap().insert(head_branch.to_string(), handle.clone());
            Ok(handle)
        }

        async fn find_pr_by_branch(&self, _owner: &str, _name: &str, branch: &str) -> Result<Option<PrHandle>> {
            Ok(self.prs.lock().unwrap().get(branch).cloned())
        }

        async fn list_reviews(&self, _owner: &str, _name: &str, _pr_number: i64) -> Result<Vec<Review>> {
            Ok(self.reviews.lock().unwrap().clone())
        }

        async fn list_review_comments(&self, _owner: &str, _name: &str, _pr_number: i64, _review_id: i64) -> Result<Vec<ReviewComment>> {
            Ok(Vec::new())
        }

        async fn get_pr(&self, _owner: &str, _name: &str, _pr_number: i64) -> Result<PrStatus> {
            Ok(self.pr_status.lock().unwrap().clone())
        }
    }

    struct FakeAssistant;

    #[async_trait]
    impl crate::agent::AssistantBackend for FakeAssistant {
        async fn generate(&self, _prompt: &str, ctx: &AssistantContext) -> Result<String> {
            std::fs::write(format!("{}/generated.txt", ctx.repository_path), "generated content").ok();
            Ok("ok".to_string())
        }
    }

    struct FakeLlm;

    #[async_trait]
    impl LlmUtility for FakeLlm {
        async fn generate_branch_slug(&self, _description: &str) -> String {
            "fix".to_string()
        }
        async fn generate_pr_title(&self, _description: &str) -> String {
            "Fix the thing".to_string()
        }
        async fn generate_pr_body(&self, _description: &str, _branch_name: &str) -> String {
            "body".to_string()
        }
        async fn generate_task_summary(&self, description: &str) -> String {
            description.chars().take(10).collect()
        }
        async fn generate_commit_message(&self, _description: &str, _changed_files: &[String]) -> String {
            "fix the thing".to_string()
        }
    }

    fn init_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let run = |args: &[&str]| {
            let status = StdCommand::new("git").arg("-C").arg(dir.path()).args(args).status().unwrap();
            assert!(status.success());
        };
        run(&["init", "-q", "-b", "main"]);
        run(&["config", "user.email", "t@example.com"]);
        run(&["config", "user.name", "t"]);
        std::fs::write(dir.path().join("a.txt"), "hello").unwrap();
        run(&["add", "a.txt"]);
        run(&["commit", "-q", "-m", "init"]);
        // origin points at itself; `git push origin <branch>` then just creates
        // the branch ref in the same repo, which is all the pipeline needs.
        run(&["remote", "add", "origin", dir.path().to_str().unwrap()]);
        dir
    }

    fn test_engine(repo_path: &str) -> (Engine, Arc<Db>) {
        let db = Arc::new(Db::open_in_memory().unwrap());
        db.register_repository(repo_path, "n", "o").unwrap();
        let events = Arc::new(EventBus::new());
        let executor = TaskExecutor::spawn();
        let hosted_vcs: Arc<dyn HostedVcsClient> = Arc::new(FakeHostedVcs::new());
        let mut bridge = AssistantBridge::new();
        bridge.register(CodingTool::Amp, Arc::new(FakeAssistant));
        let llm: Arc<dyn LlmUtility> = Arc::new(FakeLlm);
        let engine = Engine::new(db.clone(), executor, events, hosted_vcs, Arc::new(bridge), llm);
        (engine, db)
    }

    #[tokio::test]
    async fn happy_path_reaches_awaiting_review_with_branch_and_pr() {
        let dir = init_repo();
        let repo_path = dir.path().to_str().unwrap().to_string();
        let (engine, db) = test_engine(&repo_path);

        let task_id = engine.create_task("t", "fix the login bug", CodingTool::Amp, &repo_path).await.unwrap();
        engine.tick().await.unwrap();

        let task = db.get_task(task_id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::AwaitingReview);
        assert!(task.branch_name.as_deref().unwrap().starts_with("duckling-fix"));
        assert_eq!(task.pr_number, Some(1));
        assert!(task.pr_url.is_some());
    }

    #[tokio::test]
    async fn branch_collision_gets_suffixed() {
        let dir = init_repo();
        let repo_path = dir.path().to_str().unwrap().to_string();
        let git = Git::new(repo_path.clone());
        git.create_local_branch("duckling-fix").unwrap();
        git.checkout("main").unwrap();

        let (engine, db) = test_engine(&repo_path);
        let task_id = engine.create_task("t", "fix the login bug", CodingTool::Amp, &repo_path).await.unwrap();
        engine.tick().await.unwrap();

        let task = db.get_task(task_id).unwrap().unwrap();
        assert_eq!(task.branch_name.as_deref(), Some("duckling-fix-1"));
    }

    #[tokio::test]
    async fn cancel_then_cancel_again_is_a_noop() {
        let (engine, db) = test_engine("/r");
        let task_id = engine.create_task("t", "d", CodingTool::Amp, "/r").await.unwrap();
        engine.cancel_task(task_id).unwrap();
        engine.cancel_task(task_id).unwrap();
        assert_eq!(db.get_task(task_id).unwrap().unwrap().status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn retry_only_allowed_from_failed() {
        let (engine, _db) = test_engine("/r");
        let task_id = engine.create_task("t", "d", CodingTool::Amp, "/r").await.unwrap();
        assert!(engine.retry_task(task_id).is_err());
    }

    #[tokio::test]
    async fn mark_complete_sets_completed_at() {
        let (engine, db) = test_engine("/r");
        let task_id = engine.create_task("t", "d", CodingTool::Amp, "/r").await.unwrap();
        engine.mark_complete(task_id).unwrap();
        let task = db.get_task(task_id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.completed_at.is_some());
    }

    #[tokio::test]
    async fn pr_merged_during_review_completes_the_task() {
        let dir = init_repo();
        let repo_path = dir.path().to_str().unwrap().to_string();
        let (engine, db) = test_engine(&repo_path);
        let task_id = engine.create_task("t", "fix", CodingTool::Amp, &repo_path).await.unwrap();
        db.set_branch_name(task_id, "duckling-fix").unwrap();
        db.set_pr(task_id, 7, "https://example.invalid/pr/7").unwrap();
        db.transition(task_id, TaskStatus::AwaitingReview, Some(TaskStage::AwaitingReview)).unwrap();

        let deps = Deps {
            db: db.clone(),
            events: Arc::new(EventBus::new()),
            hosted_vcs: Arc::new({
                let fake = FakeHostedVcs::new();
                *fake.pr_status.lock().unwrap() = PrStatus { state: "open".into(), mergeable: Some(true), merged: true };
                fake
            }),
            assistant: Arc::new({
                let mut bridge = AssistantBridge::new();
                bridge.register(CodingTool::Amp, Arc::new(FakeAssistant));
                bridge
            }),
            llm: Arc::new(FakeLlm),
        };
        ingest_reviews(&deps, task_id).await.unwrap();

        let task = db.get_task(task_id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.completed_at.is_some());
        let _ = engine;
    }
}
