//! Settings view (C1): typed read/write over the store for engine
//! configuration. DB rows always win over compiled-in defaults; a missing
//! row falls back to the default.

use anyhow::Result;

use crate::db::Db;

pub const BRANCH_PREFIX: &str = "branchPrefix";
pub const PR_TITLE_PREFIX: &str = "prTitlePrefix";
pub const COMMIT_SUFFIX: &str = "commitSuffix";
pub const MAX_RETRIES: &str = "maxRetries";
pub const BASE_BRANCH: &str = "baseBranch";
pub const DEFAULT_CODING_TOOL: &str = "defaultCodingTool";
pub const GITHUB_TOKEN: &str = "githubToken";
pub const GITHUB_USERNAME: &str = "githubUsername";
pub const AMP_API_KEY: &str = "ampApiKey";
pub const OPENAI_API_KEY: &str = "openaiApiKey";

const DEFAULT_BRANCH_PREFIX: &str = "duckling-";
const DEFAULT_PR_TITLE_PREFIX: &str = "[DUCKLING]";
const DEFAULT_COMMIT_SUFFIX: &str = " [quack]";
const DEFAULT_MAX_RETRIES: i64 = 3;
const DEFAULT_BASE_BRANCH: &str = "main";
const DEFAULT_CODING_TOOL_VALUE: &str = "amp";

pub struct Settings<'a> {
    db: &'a Db,
}

impl<'a> Settings<'a> {
    pub fn new(db: &'a Db) -> Self {
        Self { db }
    }

    fn get_or(&self, key: &str, default: &str) -> String {
        self.db
            .get_setting(key)
            .ok()
            .flatten()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| default.to_string())
    }

    pub fn branch_prefix(&self) -> String {
        self.get_or(BRANCH_PREFIX, DEFAULT_BRANCH_PREFIX)
    }

    pub fn pr_title_prefix(&self) -> String {
        self.get_or(PR_TITLE_PREFIX, DEFAULT_PR_TITLE_PREFIX)
    }

    pub fn commit_suffix(&self) -> String {
        self.get_or(COMMIT_SUFFIX, DEFAULT_COMMIT_SUFFIX)
    }

    pub fn max_retries(&self) -> u32 {
        self.get_or(MAX_RETRIES, &DEFAULT_MAX_RETRIES.to_string())
            .parse()
            .unwrap_or(DEFAULT_MAX_RETRIES as u32)
    }

    pub fn base_branch(&self) -> String {
        self.get_or(BASE_BRANCH, DEFAULT_BASE_BRANCH)
    }

    pub fn default_coding_tool(&self) -> String {
        self.get_or(DEFAULT_CODING_TOOL, DEFAULT_CODING_TOOL_VALUE)
    }

    pub fn github_token(&self) -> String {
        self.get_or(GITHUB_TOKEN, "")
    }

    pub fn github_username(&self) -> String {
        self.get_or(GITHUB_USERNAME, "")
    }

    pub fn amp_api_key(&self) -> String {
        self.get_or(AMP_API_KEY, "")
    }

    pub fn openai_api_key(&self) -> String {
        self.get_or(OPENAI_API_KEY, "")
    }

    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        self.db.set_setting(key, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_row_absent() {
        let db = Db::open_in_memory().unwrap();
        let settings = Settings::new(&db);
        assert_eq!(settings.branch_prefix(), "duckling-");
        assert_eq!(settings.max_retries(), 3);
        assert_eq!(settings.base_branch(), "main");
    }

    #[test]
    fn stored_value_wins_over_default() {
        let db = Db::open_in_memory().unwrap();
        let settings = Settings::new(&db);
        settings.set(BRANCH_PREFIX, "custom-").unwrap();
        assert_eq!(settings.branch_prefix(), "custom-");
    }
}
