//! Runs the `amp` CLI as an assistant backend: a single non-interactive
//! invocation per call, editing the working tree in place.

use std::time::Duration;

use anyhow::{ensure, Result};
use async_trait::async_trait;
use duckling_core::agent::{AssistantBackend, AssistantContext, ASSISTANT_TIMEOUT_SECS};
use duckling_core::process::{exec, ExecOptions};
use tracing::{info, warn};

pub struct AmpBackend {
    pub bin: String,
    pub api_key: String,
}

impl AmpBackend {
    pub fn new(bin: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self { bin: bin.into(), api_key: api_key.into() }
    }
}

#[async_trait]
impl AssistantBackend for AmpBackend {
    async fn generate(&self, prompt: &str, ctx: &AssistantContext) -> Result<String> {
        info!(task_id = ctx.task_id, "spawning amp subprocess");

        let output = exec(
            &self.bin,
            &["-x", "--dangerously-allow-all"],
            ExecOptions {
                cwd: Some(&ctx.repository_path),
                env: &[("AMP_API_KEY", &self.api_key)],
                timeout: Some(Duration::from_secs(ASSISTANT_TIMEOUT_SECS)),
                stdin: Some(prompt),
            },
        )
        .await?;

        if output.timed_out {
            warn!(task_id = ctx.task_id, "amp subprocess timed out");
        }
        ensure!(output.success(), "amp exited with a failure: {}", output.combined_output());

        info!(task_id = ctx.task_id, output_len = output.stdout.len(), "amp subprocess finished");
        Ok(output.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tracing_test::logs_contain;

    fn fake_bin(dir: &std::path::Path, body: &str) -> String {
        let path = dir.join("fake-amp");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().to_string()
    }

    #[tokio::test]
    async fn captures_stdout_from_a_successful_run() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_bin(dir.path(), "cat; exit 0");
        let backend = AmpBackend::new(bin, "key");
        let ctx = AssistantContext { task_id: 1, repository_path: dir.path().to_string_lossy().to_string() };
        let output = backend.generate("do the thing", &ctx).await.unwrap();
        assert_eq!(output.trim(), "do the thing");
    }

    #[tokio::test]
    async fn nonzero_exit_surfaces_as_error() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_bin(dir.path(), "echo boom >&2; exit 1");
        let backend = AmpBackend::new(bin, "key");
        let ctx = AssistantContext { task_id: 1, repository_path: dir.path().to_string_lossy().to_string() };
        let result = backend.generate("do the thing", &ctx).await;
        assert!(result.is_err());
    }

    #[tracing_test::traced_test]
    #[tokio::test]
    async fn successful_run_logs_completion() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_bin(dir.path(), "cat; exit 0");
        let backend = AmpBackend::new(bin, "key");
        let ctx = AssistantContext { task_id: 7, repository_path: dir.path().to_string_lossy().to_string() };
        backend.generate("do the thing", &ctx).await.unwrap();
        assert!(logs_contain("amp subprocess finished"));
    }
}
