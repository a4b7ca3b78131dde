//! VCS driver (C5): per-repository branch/commit/push/fetch/reset operations
//! against the local working copy, by shelling out to the `git` binary.

use std::process::Command;

use anyhow::{anyhow, Context, Result};
use serde::Serialize;

pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Working-tree file status, as reported by `git status --porcelain`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusResult {
    pub current: String,
    pub modified: Vec<String>,
    pub created: Vec<String>,
    pub deleted: Vec<String>,
    pub renamed: Vec<String>,
    pub files: Vec<String>,
}

pub struct Git {
    pub repo_path: String,
}

impl Git {
    pub fn new(repo_path: impl Into<String>) -> Self {
        Self {
            repo_path: repo_path.into(),
        }
    }

    fn exec(&self, args: &[&str]) -> Result<ExecResult> {
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(&self.repo_path);
        cmd.args(args);

        let output = cmd
            .output()
            .with_context(|| format!("failed to spawn git -C {} {}", self.repo_path, args.join(" ")))?;

        Ok(ExecResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(1),
        })
    }

    pub fn fetch(&self, remote: &str, branch: &str) -> Result<()> {
        let result = self.exec(&["fetch", remote, branch])?;
        if !result.success() {
            return Err(anyhow!("git fetch {remote} {branch} failed: {}", result.combined_output()));
        }
        Ok(())
    }

    pub fn checkout(&self, branch: &str) -> Result<()> {
        let result = self.exec(&["checkout", branch])?;
        if !result.success() {
            return Err(anyhow!("git checkout {branch} failed: {}", result.combined_output()));
        }
        Ok(())
    }

    pub fn pull(&self, remote: &str, branch: &str) -> Result<()> {
        let result = self.exec(&["pull", remote, branch])?;
        if !result.success() {
            return Err(anyhow!("git pull {remote} {branch} failed: {}", result.combined_output()));
        }
        Ok(())
    }

    pub fn hard_reset(&self) -> Result<()> {
        let result = self.exec(&["reset", "--hard"])?;
        if !result.success() {
            return Err(anyhow!("git reset --hard failed: {}", result.combined_output()));
        }
        Ok(())
    }

    pub fn clean_fd(&self) -> Result<()> {
        let result = self.exec(&["clean", "-fd"])?;
        if !result.success() {
            return Err(anyhow!("git clean -fd failed: {}", result.combined_output()));
        }
        Ok(())
    }

    pub fn create_local_branch(&self, name: &str) -> Result<()> {
        let result = self.exec(&["checkout", "-b", name])?;
        if !result.success() {
            return Err(anyhow!("git checkout -b {name} failed: {}", result.combined_output()));
        }
        Ok(())
    }

    pub fn list_local_branches(&self) -> Result<Vec<String>> {
        let result = self.exec(&["branch", "--format=%(refname:short)"])?;
        if !result.success() {
            return Err(anyhow!("git branch --list failed: {}", result.combined_output()));
        }
        Ok(result
            .stdout
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    pub fn status(&self) -> Result<StatusResult> {
        let result = self.exec(&["status", "--porcelain"])?;
        if !result.success() {
            return Err(anyhow!("git status --porcelain failed: {}", result.combined_output()));
        }
        let mut out = StatusResult::default();
        for line in result.stdout.lines() {
            if line.len() < 3 {
                continue;
            }
            let code = &line[0..2];
            let path = line[3..].to_string();
            out.files.push(path.clone());
            match code.trim() {
                "M" | "MM" | "AM" => out.modified.push(path),
                "A" | "??" => out.created.push(path),
                "D" => out.deleted.push(path),
                "R" => out.renamed.push(path),
                _ => out.modified.push(path),
            }
        }
        let branch = self.exec(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        out.current = branch.stdout.trim().to_string();
        Ok(out)
    }

    pub fn add(&self, path: &str) -> Result<()> {
        let result = self.exec(&["add", path])?;
        if !result.success() {
            return Err(anyhow!("git add {path} failed: {}", result.combined_output()));
        }
        Ok(())
    }

    pub fn commit(&self, message: &str) -> Result<()> {
        let result = self.exec(&["commit", "-m", message])?;
        if !result.success() {
            return Err(anyhow!("git commit failed: {}", result.combined_output()));
        }
        Ok(())
    }

    pub fn push(&self, remote: &str, branch: &str) -> Result<()> {
        let result = self.exec(&["push", remote, branch])?;
        if !result.success() {
            return Err(anyhow!("git push {remote} {branch} failed: {}", result.combined_output()));
        }
        Ok(())
    }

    /// Returns the commit's ISO-8601 timestamp, never its hash.
    pub fn log_last_commit_timestamp(&self) -> Result<String> {
        let result = self.exec(&["log", "-1", "--format=%cI"])?;
        if !result.success() {
            return Err(anyhow!("git log -1 --format=%cI failed: {}", result.combined_output()));
        }
        let ts = result.stdout.trim().to_string();
        if ts.is_empty() {
            return Err(anyhow!("git log -1 --format=%cI returned no output"));
        }
        Ok(ts)
    }

    pub fn diff(&self, rev_range: Option<&str>) -> Result<String> {
        let mut args = vec!["diff"];
        if let Some(range) = rev_range {
            args.push(range);
        }
        let result = self.exec(&args)?;
        if !result.success() {
            return Err(anyhow!("git diff failed: {}", result.combined_output()));
        }
        Ok(result.stdout)
    }

    pub fn ls_files(&self) -> Result<String> {
        let result = self.exec(&["ls-files"])?;
        if !result.success() {
            return Err(anyhow!("git ls-files failed: {}", result.combined_output()));
        }
        Ok(result.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;

    fn init_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let run = |args: &[&str]| {
            let status = StdCommand::new("git")
                .arg("-C")
                .arg(dir.path())
                .args(args)
                .status()
                .unwrap();
            assert!(status.success());
        };
        run(&["init", "-q"]);
        run(&["config", "user.email", "t@example.com"]);
        run(&["config", "user.name", "t"]);
        std::fs::write(dir.path().join("a.txt"), "hello").unwrap();
        run(&["add", "a.txt"]);
        run(&["commit", "-q", "-m", "init"]);
        dir
    }

    #[test]
    fn status_reports_created_file() {
        let dir = init_repo();
        std::fs::write(dir.path().join("b.txt"), "new").unwrap();
        let git = Git::new(dir.path().to_string_lossy().to_string());
        let status = git.status().unwrap();
        assert!(status.created.contains(&"b.txt".to_string()));
    }

    #[test]
    fn last_commit_timestamp_is_iso8601() {
        let dir = init_repo();
        let git = Git::new(dir.path().to_string_lossy().to_string());
        let ts = git.log_last_commit_timestamp().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(&ts).is_ok());
    }

    #[test]
    fn create_local_branch_then_list_contains_it() {
        let dir = init_repo();
        let git = Git::new(dir.path().to_string_lossy().to_string());
        git.create_local_branch("duckling-foo").unwrap();
        let branches = git.list_local_branches().unwrap();
        assert!(branches.iter().any(|b| b == "duckling-foo"));
    }
}
