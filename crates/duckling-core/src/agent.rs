//! Assistant bridge (C7): invokes a named external coding assistant with a
//! prompt in a given working tree.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::types::CodingTool;

pub const ASSISTANT_TIMEOUT_SECS: u64 = 30 * 60;

/// Everything a backend needs besides the prompt text.
#[derive(Debug, Clone)]
pub struct AssistantContext {
    pub task_id: i64,
    pub repository_path: String,
}

/// One named external coding assistant (`amp`, `openai`, ...).
#[async_trait]
pub trait AssistantBackend: Send + Sync {
    /// Run the assistant against `prompt` in `ctx.repository_path`, expecting
    /// it to modify files in place and exit zero. Returns captured stdout.
    async fn generate(&self, prompt: &str, ctx: &AssistantContext) -> Result<String>;
}

/// Dispatches to the backend registered for a task's `coding_tool`.
pub struct AssistantBridge {
    backends: HashMap<CodingTool, Arc<dyn AssistantBackend>>,
}

impl AssistantBridge {
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: CodingTool, backend: Arc<dyn AssistantBackend>) {
        self.backends.insert(tool, backend);
    }

    pub async fn generate(&self, tool: CodingTool, prompt: &str, ctx: &AssistantContext) -> Result<String> {
        let backend = self
            .backends
            .get(&tool)
            .ok_or_else(|| anyhow::anyhow!("no assistant backend registered for {}", tool.as_str()))?;
        backend.generate(prompt, ctx).await
    }
}

impl Default for AssistantBridge {
    fn default() -> Self {
        Self::new()
    }
}
