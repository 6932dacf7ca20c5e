//! Shared application state, created once at startup and handed to every
//! connection.

use crate::{config::Config, ws::{registry::ConnectionRegistry, turn::TurnSettings}};
use serenity_core::{chunker::ChunkerConfig, llm_client::LLMClient, prompt::PromptComposer};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub llm_client: Arc<dyn LLMClient>,
    pub prompts: Arc<PromptComposer>,
    pub registry: Arc<ConnectionRegistry>,
    pub turn_settings: TurnSettings,
}

impl AppState {
    /// Builds state from loaded configuration with a fresh registry.
    pub fn from_config(
        config: &Config,
        llm_client: Arc<dyn LLMClient>,
        prompts: PromptComposer,
    ) -> Self {
        Self {
            llm_client,
            prompts: Arc::new(prompts),
            registry: Arc::new(ConnectionRegistry::new()),
            turn_settings: TurnSettings {
                chunker: ChunkerConfig {
                    max_chars: config.chunk_max_chars,
                },
                greeting_enabled: config.greeting_enabled,
            },
        }
    }
}
