//! Process-level bootstrap configuration, read once from the environment (or
//! a `.env` file) at startup. Distinct from `duckling_core::settings::Settings`,
//! which is the durable, store-backed view the engine consults on every
//! tick — DB settings always win over anything read here once the store is
//! open.

use std::collections::HashMap;

use duckling_core::db::Db;
use duckling_core::settings;

/// Everything the process needs before it can open the store.
#[derive(Debug, Clone)]
pub struct Config {
    pub store_path: String,
    pub bind_addr: String,
    pub bind_port: u16,
    pub tick_interval_secs: u64,
    pub github_token: String,
    pub github_username: String,
    pub amp_api_key: String,
    pub openai_api_key: String,
    pub amp_bin: String,
    pub openai_bin: String,
    pub llm_model: String,
}

fn parse_dotenv() -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(".env") else {
        return map;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            map.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    map
}

fn get(key: &str, dotenv: &HashMap<String, String>) -> Option<String> {
    std::env::var(key).ok().or_else(|| dotenv.get(key).cloned())
}

fn get_str(key: &str, dotenv: &HashMap<String, String>, default: &str) -> String {
    get(key, dotenv).unwrap_or_else(|| default.to_string())
}

fn get_u16(key: &str, dotenv: &HashMap<String, String>, default: u16) -> u16 {
    get(key, dotenv).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn get_u64(key: &str, dotenv: &HashMap<String, String>, default: u64) -> u64 {
    get(key, dotenv).and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        let dotenv = parse_dotenv();
        Self {
            store_path: get_str("DUCKLING_STORE_PATH", &dotenv, "duckling.sqlite3"),
            bind_addr: get_str("DUCKLING_BIND_ADDR", &dotenv, "127.0.0.1"),
            bind_port: get_u16("DUCKLING_BIND_PORT", &dotenv, 4848),
            tick_interval_secs: get_u64("DUCKLING_TICK_INTERVAL_S", &dotenv, 60),
            github_token: get_str("GITHUB_TOKEN", &dotenv, ""),
            github_username: get_str("GITHUB_USERNAME", &dotenv, ""),
            amp_api_key: get_str("AMP_API_KEY", &dotenv, ""),
            openai_api_key: get_str("OPENAI_API_KEY", &dotenv, ""),
            amp_bin: get_str("AMP_BIN", &dotenv, "amp"),
            openai_bin: get_str("OPENAI_BIN", &dotenv, "openai"),
            llm_model: get_str("DUCKLING_LLM_MODEL", &dotenv, "gpt-4o-mini"),
        }
    }

    /// Writes the secrets this process was started with into the store, but
    /// only for keys that have no row yet — an operator's prior edit via the
    /// settings API always wins over the environment on the next restart.
    pub fn seed_settings(&self, db: &Db) -> anyhow::Result<()> {
        let seeds = [
            (settings::GITHUB_TOKEN, &self.github_token),
            (settings::GITHUB_USERNAME, &self.github_username),
            (settings::AMP_API_KEY, &self.amp_api_key),
            (settings::OPENAI_API_KEY, &self.openai_api_key),
        ];
        for (key, value) in seeds {
            if value.is_empty() {
                continue;
            }
            if db.get_setting(key)?.is_none() {
                db.set_setting(key, value)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_with_no_env_or_dotenv() {
        let dotenv = HashMap::new();
        assert_eq!(get_str("NOPE_KEY_XYZ", &dotenv, "fallback"), "fallback");
        assert_eq!(get_u16("NOPE_PORT_XYZ", &dotenv, 4848), 4848);
    }
}
