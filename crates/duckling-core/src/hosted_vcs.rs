//! Hosted-VCS client (C6): open PR, list reviews and review comments, read
//! PR status. `(owner, name)` are passed as call parameters on every
//! method — never cached on the client, since one process serves many
//! registered repositories.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::retry::{retry_async, RetryConfig};

#[derive(Debug, Clone)]
pub struct PrHandle {
    pub number: i64,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct PrStatus {
    pub state: String,
    pub mergeable: Option<bool>,
    pub merged: bool,
}

#[derive(Debug, Clone)]
pub struct Review {
    pub id: i64,
    pub author_login: String,
    pub submitted_at: Option<DateTime<Utc>>,
    pub state: String,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct ReviewComment {
    pub id: i64,
    pub in_reply_to_id: Option<i64>,
    pub path: String,
    pub line: Option<i64>,
    pub diff_hunk: String,
    pub body: String,
}

#[async_trait]
pub trait HostedVcsClient: Send + Sync {
    async fn get_default_branch(&self, owner: &str, name: &str) -> Result<String>;
    async fn create_pr(&self, owner: &str, name: &str, head_branch: &str, base_branch: &str, title: &str, body: &str) -> Result<PrHandle>;
    async fn find_pr_by_branch(&self, owner: &str, name: &str, branch: &str) -> Result<Option<PrHandle>>;
    async fn list_reviews(&self, owner: &str, name: &str, pr_number: i64) -> Result<Vec<Review>>;
    async fn list_review_comments(&self, owner: &str, name: &str, pr_number: i64, review_id: i64) -> Result<Vec<ReviewComment>>;
    async fn get_pr(&self, owner: &str, name: &str, pr_number: i64) -> Result<PrStatus>;
}

/// GitHub REST API v3 implementation.
pub struct GitHubClient {
    client: reqwest::Client,
    token: String,
    retry: RetryConfig,
}

impl GitHubClient {
    pub fn new(token: String, max_retries: u32) -> Self {
        Self {
            client: reqwest::Client::new(),
            token,
            retry: RetryConfig::new(max_retries),
        }
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "duckling")
    }
}

#[derive(Deserialize)]
struct RepoInfo {
    default_branch: String,
}

#[derive(Deserialize)]
struct PrInfo {
    number: i64,
    html_url: String,
    state: String,
    merged: Option<bool>,
    mergeable: Option<bool>,
}

#[derive(Deserialize)]
struct ReviewInfo {
    id: i64,
    user: Option<UserInfo>,
    submitted_at: Option<String>,
    state: String,
    body: Option<String>,
}

#[derive(Deserialize)]
struct UserInfo {
    login: String,
}

#[derive(Deserialize)]
struct ReviewCommentInfo {
    id: i64,
    pull_request_review_id: Option<i64>,
    in_reply_to_id: Option<i64>,
    path: String,
    line: Option<i64>,
    diff_hunk: Option<String>,
    body: Option<String>,
}

#[async_trait]
impl HostedVcsClient for GitHubClient {
    async fn get_default_branch(&self, owner: &str, name: &str) -> Result<String> {
        let url = format!("https://api.github.com/repos/{owner}/{name}");
        let result = retry_async(&self.retry, "get_default_branch", || async {
            let resp = self.request(reqwest::Method::GET, &url).send().await.context("request failed")?;
            if !resp.status().is_success() {
                return Err(anyhow!("GET {url} returned {}", resp.status()));
            }
            resp.json::<RepoInfo>().await.context("invalid repo response")
        })
        .await;
        match result {
            Ok(info) => Ok(info.default_branch),
            Err(_) => Ok("main".to_string()),
        }
    }

    async fn create_pr(&self, owner: &str, name: &str, head_branch: &str, base_branch: &str, title: &str, body: &str) -> Result<PrHandle> {
        if let Some(existing) = self.find_pr_by_branch(owner, name, head_branch).await? {
            return Ok(existing);
        }
        let url = format!("https://api.github.com/repos/{owner}/{name}/pulls");
        let payload = serde_json::json!({ "title": title, "body": body, "head": head_branch, "base": base_branch });
        let info: PrInfo = retry_async(&self.retry, "create_pr", || async {
            let resp = self.request(reqwest::Method::POST, &url).json(&payload).send().await.context("request failed")?;
            if !resp.status().is_success() {
                return Err(anyhow!("POST {url} returned {}", resp.status()));
            }
            resp.json::<PrInfo>().await.context("invalid PR response")
        })
        .await?;
        Ok(PrHandle { number: info.number, url: info.html_url })
    }

    async fn find_pr_by_branch(&self, owner: &str, name: &str, branch: &str) -> Result<Option<PrHandle>> {
        let url = format!("https://api.github.com/repos/{owner}/{name}/pulls?head={owner}:{branch}&state=open");
        let results: Vec<PrInfo> = retry_async(&self.retry, "find_pr_by_branch", || async {
            let resp = self.request(reqwest::Method::GET, &url).send().await.context("request failed")?;
            if !resp.status().is_success() {
                return Err(anyhow!("GET {url} returned {}", resp.status()));
            }
            resp.json::<Vec<PrInfo>>().await.context("invalid PR list response")
        })
        .await?;
        Ok(results.into_iter().next().map(|p| PrHandle { number: p.number, url: p.html_url }))
    }

    async fn list_reviews(&self, owner: &str, name: &str, pr_number: i64) -> Result<Vec<Review>> {
        let url = format!("https://api.github.com/repos/{owner}/{name}/pulls/{pr_number}/reviews");
        let results: Vec<ReviewInfo> = retry_async(&self.retry, "list_reviews", || async {
            let resp = self.request(reqwest::Method::GET, &url).send().await.context("request failed")?;
            if !resp.status().is_success() {
                return Err(anyhow!("GET {url} returned {}", resp.status()));
            }
            resp.json::<Vec<ReviewInfo>>().await.context("invalid reviews response")
        })
        .await?;
        Ok(results
            .into_iter()
            .map(|r| Review {
                id: r.id,
                author_login: r.user.map(|u| u.login).unwrap_or_default(),
                submitted_at: r.submitted_at.as_deref().and_then(|s| DateTime::parse_from_rfc3339(s).ok()).map(|d| d.with_timezone(&Utc)),
                state: r.state,
                body: r.body.unwrap_or_default(),
            })
            .collect())
    }

    async fn list_review_comments(&self, owner: &str, name: &str, pr_number: i64, review_id: i64) -> Result<Vec<ReviewComment>> {
        let url = format!("https://api.github.com/repos/{owner}/{name}/pulls/{pr_number}/comments");
        let results: Vec<ReviewCommentInfo> = retry_async(&self.retry, "list_review_comments", || async {
            let resp = self.request(reqwest::Method::GET, &url).send().await.context("request failed")?;
            if !resp.status().is_success() {
                return Err(anyhow!("GET {url} returned {}", resp.status()));
            }
            resp.json::<Vec<ReviewCommentInfo>>().await.context("invalid review comments response")
        })
        .await?;
        Ok(results
            .into_iter()
            .filter(|c| c.pull_request_review_id == Some(review_id))
            .map(|c| ReviewComment {
                id: c.id,
                in_reply_to_id: c.in_reply_to_id,
                path: c.path,
                line: c.line,
                diff_hunk: c.diff_hunk.unwrap_or_default(),
                body: c.body.unwrap_or_default(),
            })
            .collect())
    }

    async fn get_pr(&self, owner: &str, name: &str, pr_number: i64) -> Result<PrStatus> {
        let url = format!("https://api.github.com/repos/{owner}/{name}/pulls/{pr_number}");
        let info: PrInfo = retry_async(&self.retry, "get_pr", || async {
            let resp = self.request(reqwest::Method::GET, &url).send().await.context("request failed")?;
            if !resp.status().is_success() {
                return Err(anyhow!("GET {url} returned {}", resp.status()));
            }
            resp.json::<PrInfo>().await.context("invalid PR response")
        })
        .await?;
        Ok(PrStatus { state: info.state, mergeable: info.mergeable, merged: info.merged.unwrap_or(false) })
    }
}

/// Renders a qualifying review (body + remaining line comments) into the
/// single formatted string the pipeline feeds to the assistant bridge.
pub fn render_review(review: &Review, comments: &[ReviewComment]) -> String {
    let mut out = String::new();
    if !review.body.trim().is_empty() {
        out.push_str(review.body.trim());
        out.push('\n');
    }
    for c in comments {
        out.push_str(&format!("\n{}:{} — {}\n", c.path, c.line.map(|l| l.to_string()).unwrap_or_default(), c.body.trim()));
        if !c.diff_hunk.trim().is_empty() {
            out.push_str(&format!("```\n{}\n```\n", c.diff_hunk.trim()));
        }
    }
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_review_includes_body_and_comments() {
        let review = Review { id: 1, author_login: "u".into(), submitted_at: None, state: "COMMENTED".into(), body: "rename X".into() };
        let comments = vec![ReviewComment { id: 1, in_reply_to_id: None, path: "src/a.ts".into(), line: Some(10), diff_hunk: "".into(), body: "here".into() }];
        let rendered = render_review(&review, &comments);
        assert!(rendered.contains("rename X"));
        assert!(rendered.contains("src/a.ts:10"));
    }
}
