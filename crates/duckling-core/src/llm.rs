//! LLM utility (C8): small natural-language helpers the pipeline leans on
//! for branch/PR/commit text. The trait lives in `duckling-core`; the
//! concrete LLM-backed implementation lives in `duckling-agent`. Every
//! method has a deterministic, dependency-free fallback so the pipeline
//! never blocks on an LLM outage for bookkeeping text.

use async_trait::async_trait;

#[async_trait]
pub trait LlmUtility: Send + Sync {
    async fn generate_branch_slug(&self, description: &str) -> String;
    async fn generate_pr_title(&self, description: &str) -> String;
    async fn generate_pr_body(&self, description: &str, branch_name: &str) -> String;
    async fn generate_task_summary(&self, description: &str) -> String;
    async fn generate_commit_message(&self, description: &str, changed_files: &[String]) -> String;
}

/// Lowercases, strips non `[a-z0-9-]` characters, collapses runs of `-`,
/// and guarantees the result starts with a letter — matches the branch
/// sanitization rule the pipeline applies before collision-suffixing.
pub fn slugify(text: &str) -> String {
    let mut slug = String::new();
    let mut last_was_dash = false;
    for ch in text.to_lowercase().chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch);
            last_was_dash = false;
        } else if !last_was_dash && !slug.is_empty() {
            slug.push('-');
            last_was_dash = true;
        }
    }
    let slug = slug.trim_end_matches('-').to_string();
    let slug = if slug.len() > 40 { slug[..40].trim_end_matches('-').to_string() } else { slug };
    if slug.is_empty() {
        "task".to_string()
    } else if !slug.chars().next().unwrap().is_ascii_alphabetic() {
        format!("t-{slug}")
    } else {
        slug
    }
}

/// Fallback used when no LLM-backed `LlmUtility` is configured: truncates
/// the description to a single line.
pub fn fallback_summary(description: &str) -> String {
    let first_line = description.lines().next().unwrap_or("").trim();
    if first_line.chars().count() > 120 {
        format!("{}…", first_line.chars().take(120).collect::<String>())
    } else {
        first_line.to_string()
    }
}

pub fn fallback_commit_message(description: &str, changed_files: &[String]) -> String {
    let summary = fallback_summary(description);
    if changed_files.is_empty() {
        summary
    } else if changed_files.len() == 1 {
        format!("{summary} ({})", changed_files[0])
    } else {
        format!("{summary} ({} files)", changed_files.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_collapses_and_strips() {
        assert_eq!(slugify("Fix the  Login Bug!!"), "fix-the-login-bug");
    }

    #[test]
    fn slugify_prefixes_when_leading_char_not_alpha() {
        assert_eq!(slugify("123 numeric start"), "t-123-numeric-start");
    }

    #[test]
    fn slugify_never_empty() {
        assert_eq!(slugify("!!!"), "task");
    }

    #[test]
    fn fallback_summary_truncates_long_lines() {
        let long = "a".repeat(200);
        let summary = fallback_summary(&long);
        assert!(summary.ends_with('…'));
        assert!(summary.chars().count() <= 121);
    }
}
