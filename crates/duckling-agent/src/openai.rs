//! Runs the `openai` (Codex) CLI as an assistant backend, in full-auto mode.

use std::time::Duration;

use anyhow::{ensure, Result};
use async_trait::async_trait;
use duckling_core::agent::{AssistantBackend, AssistantContext, ASSISTANT_TIMEOUT_SECS};
use duckling_core::process::{exec, ExecOptions};
use tracing::{info, warn};

pub struct OpenaiBackend {
    pub bin: String,
    pub api_key: String,
}

impl OpenaiBackend {
    pub fn new(bin: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self { bin: bin.into(), api_key: api_key.into() }
    }
}

#[async_trait]
impl AssistantBackend for OpenaiBackend {
    async fn generate(&self, prompt: &str, ctx: &AssistantContext) -> Result<String> {
        info!(task_id = ctx.task_id, "spawning openai subprocess");

        let output = exec(
            &self.bin,
            &["--approval-mode", "full-auto", "exec"],
            ExecOptions {
                cwd: Some(&ctx.repository_path),
                env: &[("OPENAI_API_KEY", &self.api_key)],
                timeout: Some(Duration::from_secs(ASSISTANT_TIMEOUT_SECS)),
                stdin: Some(prompt),
            },
        )
        .await?;

        if output.timed_out {
            warn!(task_id = ctx.task_id, "openai subprocess timed out");
        }
        ensure!(output.success(), "openai exited with a failure: {}", output.combined_output());

        info!(task_id = ctx.task_id, output_len = output.stdout.len(), "openai subprocess finished");
        Ok(output.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn fake_bin(dir: &std::path::Path, body: &str) -> String {
        let path = dir.join("fake-openai");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().to_string()
    }

    #[tokio::test]
    async fn captures_stdout_from_a_successful_run() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_bin(dir.path(), "cat; exit 0");
        let backend = OpenaiBackend::new(bin, "key");
        let ctx = AssistantContext { task_id: 1, repository_path: dir.path().to_string_lossy().to_string() };
        let output = backend.generate("do the thing", &ctx).await.unwrap();
        assert_eq!(output.trim(), "do the thing");
    }

    #[tokio::test]
    async fn nonzero_exit_surfaces_as_error() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_bin(dir.path(), "exit 1");
        let backend = OpenaiBackend::new(bin, "key");
        let ctx = AssistantContext { task_id: 1, repository_path: dir.path().to_string_lossy().to_string() };
        let result = backend.generate("do the thing", &ctx).await;
        assert!(result.is_err());
    }
}
