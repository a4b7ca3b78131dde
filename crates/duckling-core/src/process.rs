//! Process runner (C4): spawn child processes with stdin/stdout capture,
//! timeout, env injection, working directory. Used by the assistant bridge
//! and the pre-commit runner. Never throws on non-zero exit.

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub timed_out: bool,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }

    pub fn combined_output(&self) -> String {
        if self.stderr.trim().is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecOptions<'a> {
    pub cwd: Option<&'a str>,
    pub env: &'a [(&'a str, &'a str)],
    pub timeout: Option<Duration>,
    pub stdin: Option<&'a str>,
}

/// Run `cmd args...` to completion (or until `opts.timeout` elapses), never
/// returning `Err` for a non-zero exit — only for failure to spawn/wait.
pub async fn exec(cmd: &str, args: &[&str], opts: ExecOptions<'_>) -> Result<ExecOutput> {
    let mut command = Command::new(cmd);
    command.args(args).kill_on_drop(true);
    if let Some(cwd) = opts.cwd {
        command.current_dir(cwd);
    }
    for (k, v) in opts.env {
        command.env(k, v);
    }
    command.stdin(std::process::Stdio::piped());
    command.stdout(std::process::Stdio::piped());
    command.stderr(std::process::Stdio::piped());

    let mut child = command
        .spawn()
        .with_context(|| format!("failed to spawn {cmd} {}", args.join(" ")))?;

    if let Some(input) = opts.stdin {
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input.as_bytes()).await.context("failed to write stdin")?;
        }
    } else {
        drop(child.stdin.take());
    }

    let stdout = child.stdout.take().context("failed to take stdout")?;
    let stderr = child.stderr.take().context("failed to take stderr")?;

    let io_future = async move {
        let mut out = String::new();
        let mut err = String::new();
        let mut out_reader = BufReader::new(stdout).lines();
        let mut err_reader = BufReader::new(stderr).lines();
        loop {
            tokio::select! {
                line = out_reader.next_line() => match line? {
                    Some(l) => { out.push_str(&l); out.push('\n'); }
                    None => break,
                },
                line = err_reader.next_line() => {
                    if let Ok(Some(l)) = line {
                        err.push_str(&l);
                        err.push('\n');
                    }
                }
            }
        }
        while let Ok(Some(l)) = err_reader.next_line().await {
            err.push_str(&l);
            err.push('\n');
        }
        let status = child.wait().await.context("failed to wait for child process")?;
        anyhow::Ok((out, err, status.code().unwrap_or(1)))
    };

    match opts.timeout {
        Some(timeout) => match tokio::time::timeout(timeout, io_future).await {
            Ok(Ok((stdout, stderr, exit_code))) => Ok(ExecOutput { stdout, stderr, exit_code, timed_out: false }),
            Ok(Err(e)) => Err(e),
            Err(_elapsed) => Ok(ExecOutput {
                stdout: String::new(),
                stderr: format!("process timed out after {timeout:?}"),
                exit_code: -1,
                timed_out: true,
            }),
        },
        None => {
            let (stdout, stderr, exit_code) = io_future.await?;
            Ok(ExecOutput { stdout, stderr, exit_code, timed_out: false })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_nonzero_exit_without_erroring() {
        let out = exec("sh", &["-c", "echo hi; exit 3"], ExecOptions::default()).await.unwrap();
        assert_eq!(out.stdout.trim(), "hi");
        assert_eq!(out.exit_code, 3);
        assert!(!out.success());
    }

    #[tokio::test]
    async fn timeout_marks_timed_out() {
        let opts = ExecOptions { timeout: Some(Duration::from_millis(50)), ..Default::default() };
        let out = exec("sh", &["-c", "sleep 5"], opts).await.unwrap();
        assert!(out.timed_out);
        assert!(!out.success());
    }

    #[tokio::test]
    async fn env_vars_are_visible_to_child() {
        let out = exec("sh", &["-c", "echo $FOO"], ExecOptions { env: &[("FOO", "bar")], ..Default::default() }).await.unwrap();
        assert_eq!(out.stdout.trim(), "bar");
    }
}
