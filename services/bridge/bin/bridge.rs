//! Entrypoint for the Serenity bridge service.
//!
//! Loads configuration, builds the LLM client and prompt composer, starts the
//! liveness supervisor, and serves the router until Ctrl+C.

use anyhow::Context;
use async_openai::config::OpenAIConfig;
use secrecy::ExposeSecret;
use serenity_bridge::{
    config::{Config, Provider},
    router::create_router,
    state::AppState,
    ws::{liveness::LivenessSupervisor, registry::ConnectionRegistry},
};
use serenity_core::{
    llm_client::{LLMClient, OpenAICompatibleClient, ScriptedLLMClient},
    prompt::PromptComposer,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Resolves when Ctrl+C is received, after closing every open session so
/// graceful shutdown does not wait on live calls.
async fn shutdown_signal(registry: Arc<ConnectionRegistry>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl+C; shutting down.");
    } else {
        info!("Received shutdown signal. Shutting down gracefully...");
    }
    for session in registry.snapshot() {
        session.close();
    }
}

fn build_llm_client(config: &Config) -> anyhow::Result<Arc<dyn LLMClient>> {
    match config.provider {
        Provider::Mock => {
            warn!("Using scripted mock provider; replies are canned.");
            Ok(Arc::new(ScriptedLLMClient::echo()))
        }
        Provider::Groq | Provider::OpenAI => {
            let api_key = config
                .api_key
                .as_ref()
                .context("API key missing for the configured provider")?;
            let openai_config = OpenAIConfig::new()
                .with_api_key(api_key.expose_secret())
                .with_api_base(&config.api_base);
            Ok(Arc::new(OpenAICompatibleClient::new(
                openai_config,
                config.chat_model.clone(),
                config.temperature,
            )))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing application state...");

    let llm_client = build_llm_client(&config)?;
    let mut prompts = PromptComposer::new(config.persona_name.clone());
    if let Some(path) = &config.prompts_path {
        prompts = prompts
            .with_templates_from(path)
            .with_context(|| format!("Failed to load prompts from {}", path.display()))?;
        info!(path = %path.display(), "Loaded prompt templates.");
    }

    let app_state = Arc::new(AppState::from_config(&config, llm_client, prompts));

    let supervisor_cancel = CancellationToken::new();
    let supervisor = tokio::spawn(
        LivenessSupervisor::new(
            app_state.registry.clone(),
            config.heartbeat_interval,
            config.heartbeat_max_missed,
        )
        .run(supervisor_cancel.clone()),
    );

    let registry = app_state.registry.clone();
    let app = create_router(app_state);

    info!(
        provider = ?config.provider,
        model = %config.chat_model,
        bind_address = %config.bind_address,
        "Service configured. Starting server..."
    );
    let listener = match tokio::net::TcpListener::bind(config.bind_address).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(bind_address = %config.bind_address, error = %e, "Failed to bind listener.");
            supervisor_cancel.cancel();
            return Err(e).context("Failed to bind listener");
        }
    };

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(registry))
        .await;

    supervisor_cancel.cancel();
    let _ = supervisor.await;
    served.context("Server error")?;

    info!("Server has shut down.");
    Ok(())
}
