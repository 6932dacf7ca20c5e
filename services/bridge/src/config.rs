use secrecy::SecretString;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Defines the supported chat-completion providers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Provider {
    Groq,
    OpenAI,
    /// Scripted replies, no network. For local development only.
    Mock,
}

impl Provider {
    /// The OpenAI-compatible API base used when `LLM_API_BASE` is unset.
    pub fn default_api_base(&self) -> &'static str {
        match self {
            Provider::Groq => "https://api.groq.com/openai/v1",
            Provider::OpenAI | Provider::Mock => "https://api.openai.com/v1",
        }
    }

    fn default_model(&self) -> &'static str {
        match self {
            Provider::Groq => "llama-3.3-70b-versatile",
            Provider::OpenAI | Provider::Mock => "gpt-4o-mini",
        }
    }
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub provider: Provider,
    pub api_key: Option<SecretString>,
    pub api_base: String,
    pub chat_model: String,
    pub temperature: Option<f32>,
    pub chunk_max_chars: usize,
    pub heartbeat_interval: Duration,
    pub heartbeat_max_missed: u32,
    pub persona_name: String,
    pub greeting_enabled: bool,
    pub prompts_path: Option<PathBuf>,
    pub log_level: Level,
}

/// Reads an optional variable and parses it, reporting unparsable values.
fn parse_var<T: FromStr>(name: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(None),
    }
}

/// Like `parse_var`, but also rejects zero.
fn parse_positive<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialEq + Default,
    T::Err: std::fmt::Display,
{
    let value = parse_var::<T>(name)?.unwrap_or(default);
    if value == T::default() {
        return Err(ConfigError::InvalidValue(
            name.to_string(),
            "must be greater than zero".to_string(),
        ));
    }
    Ok(value)
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address_str =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let provider_str = std::env::var("LLM_PROVIDER").unwrap_or_else(|_| "groq".to_string());
        let provider = match provider_str.to_lowercase().as_str() {
            "groq" => Provider::Groq,
            "openai" => Provider::OpenAI,
            "mock" => Provider::Mock,
            other => {
                return Err(ConfigError::InvalidValue(
                    "LLM_PROVIDER".to_string(),
                    format!("'{}' is not one of groq, openai, mock", other),
                ));
            }
        };

        let api_key: Option<SecretString> = match provider {
            Provider::Groq => Some(
                std::env::var("GROQ_API_KEY")
                    .map_err(|_| {
                        ConfigError::MissingVar(
                            "GROQ_API_KEY must be set for 'groq' provider".to_string(),
                        )
                    })?
                    .into(),
            ),
            Provider::OpenAI => Some(
                std::env::var("OPENAI_API_KEY")
                    .map_err(|_| {
                        ConfigError::MissingVar(
                            "OPENAI_API_KEY must be set for 'openai' provider".to_string(),
                        )
                    })?
                    .into(),
            ),
            Provider::Mock => None,
        };

        let api_base = std::env::var("LLM_API_BASE")
            .unwrap_or_else(|_| provider.default_api_base().to_string());
        let chat_model =
            std::env::var("CHAT_MODEL").unwrap_or_else(|_| provider.default_model().to_string());
        let temperature = parse_var::<f32>("CHAT_TEMPERATURE")?;

        let chunk_max_chars = parse_positive::<usize>("CHUNK_MAX_CHARS", 50)?;
        let heartbeat_secs = parse_positive::<u64>("HEARTBEAT_INTERVAL_SECS", 15)?;
        let heartbeat_max_missed = parse_positive::<u32>("HEARTBEAT_MAX_MISSED", 2)?;

        let persona_name =
            std::env::var("PERSONA_NAME").unwrap_or_else(|_| "Serenity".to_string());
        let greeting_enabled = parse_var::<bool>("GREETING_ENABLED")?.unwrap_or(true);
        let prompts_path = std::env::var("PROMPTS_PATH").ok().map(PathBuf::from);

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            bind_address,
            provider,
            api_key,
            api_base,
            chat_model,
            temperature,
            chunk_max_chars,
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
            heartbeat_max_missed,
            persona_name,
            greeting_enabled,
            prompts_path,
            log_level,
        })
    }
}
