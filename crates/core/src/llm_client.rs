//! Completion Stream Adapter
//!
//! Wraps a streaming chat-completion provider behind the `LLMClient` trait and
//! exposes one turn's reply as a lazy stream of text deltas. Provider failures
//! never escape as errors: the stream simply ends with a `TurnDelta::Failed`
//! marker that the caller turns into a graceful reply.

use anyhow::{Result, anyhow};
use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs,
    },
};
use async_trait::async_trait;
use futures::{Stream, StreamExt, future, stream};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

/// Who said a line of the call transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Agent,
    /// Any role the platform may add later. Skipped when building requests.
    #[serde(other)]
    Other,
}

/// One entry of the call transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    #[serde(default)]
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn agent(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Agent,
            content: content.into(),
        }
    }
}

/// Represents the events that can be yielded from a streaming text response.
#[derive(Debug, Clone)]
pub enum LLMStreamEvent {
    TextChunk(String),
}

/// A stream of text chunks from the LLM.
pub type LLMStream = Pin<Box<dyn Stream<Item = Result<LLMStreamEvent>> + Send>>;

/// A generic client for a streaming chat-completion provider.
#[async_trait]
pub trait LLMClient: Send + Sync {
    /// Opens one streamed completion for the given system instruction and
    /// transcript. Nothing is read from the network until the returned stream
    /// is polled.
    async fn stream_reply(&self, system_prompt: String, transcript: Vec<ChatTurn>)
    -> Result<LLMStream>;
}

/// An item of a turn's delta sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnDelta {
    Text(String),
    /// The provider failed; always the last item of the sequence.
    Failed(String),
}

/// The delta sequence of one turn.
pub type DeltaStream = Pin<Box<dyn Stream<Item = TurnDelta> + Send>>;

/// Starts one turn's reply.
///
/// The provider request is issued on first poll, not here. Dropping the
/// returned stream drops the underlying response stream, so a consumer that
/// stops pulling stops all further network reads.
pub fn begin_turn(
    client: Arc<dyn LLMClient>,
    system_prompt: String,
    transcript: Vec<ChatTurn>,
) -> DeltaStream {
    let opened = stream::once(async move { client.stream_reply(system_prompt, transcript).await });

    let deltas = opened.flat_map(|result| match result {
        Ok(inner) => inner
            .map(|item| match item {
                Ok(LLMStreamEvent::TextChunk(text)) => TurnDelta::Text(text),
                Err(e) => TurnDelta::Failed(format!("{e:#}")),
            })
            .boxed(),
        Err(e) => stream::iter([TurnDelta::Failed(format!("{e:#}"))]).boxed(),
    });

    // Cut the sequence right after the first failure.
    Box::pin(deltas.scan(false, |failed, delta| {
        if *failed {
            return future::ready(None);
        }
        *failed = matches!(delta, TurnDelta::Failed(_));
        future::ready(Some(delta))
    }))
}

/// Converts the call transcript into chat messages behind a system message.
/// The platform's `agent` role maps to the chat `assistant` role; entries
/// with any other role are left out.
fn build_messages(
    system_prompt: String,
    transcript: Vec<ChatTurn>,
) -> Result<Vec<ChatCompletionRequestMessage>> {
    let mut messages: Vec<ChatCompletionRequestMessage> = vec![
        ChatCompletionRequestSystemMessageArgs::default()
            .content(system_prompt)
            .build()?
            .into(),
    ];
    for turn in transcript {
        match turn.role {
            ChatRole::User => messages.push(
                ChatCompletionRequestUserMessageArgs::default()
                    .content(turn.content)
                    .build()?
                    .into(),
            ),
            ChatRole::Agent => messages.push(
                ChatCompletionRequestAssistantMessageArgs::default()
                    .content(turn.content)
                    .build()?
                    .into(),
            ),
            ChatRole::Other => {
                debug!("Skipping transcript entry with unrecognized role.");
            }
        }
    }
    Ok(messages)
}

/// An implementation of `LLMClient` for any OpenAI-compatible API (Groq,
/// OpenAI, ...).
pub struct OpenAICompatibleClient {
    client: Client<OpenAIConfig>,
    model: String,
    temperature: Option<f32>,
}

impl OpenAICompatibleClient {
    /// Creates a new client for an OpenAI-compatible service.
    ///
    /// # Arguments
    ///
    /// * `config` - The configuration for the OpenAI client, including API key and base URL.
    /// * `model` - The chat model to stream from (e.g., "llama-3.3-70b-versatile").
    /// * `temperature` - Optional sampling temperature; the provider default when `None`.
    pub fn new(config: OpenAIConfig, model: String, temperature: Option<f32>) -> Self {
        Self {
            client: Client::with_config(config),
            model,
            temperature,
        }
    }
}

#[async_trait]
impl LLMClient for OpenAICompatibleClient {
    async fn stream_reply(
        &self,
        system_prompt: String,
        transcript: Vec<ChatTurn>,
    ) -> Result<LLMStream> {
        let messages = build_messages(system_prompt, transcript)?;
        debug!(model = %self.model, messages = messages.len(), "Opening completion stream.");
        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(&self.model).messages(messages).stream(true);
        if let Some(temperature) = self.temperature {
            args.temperature(temperature);
        }
        let request = args.build()?;

        let stream = self.client.chat().create_stream(request).await?;

        Ok(Box::pin(stream.filter_map(|result| async move {
            match result {
                Ok(response) => {
                    let content = response.choices.first()?.delta.content.clone()?;
                    if content.is_empty() {
                        None
                    } else {
                        Some(Ok(LLMStreamEvent::TextChunk(content)))
                    }
                }
                Err(e) => Some(Err(anyhow!(e).context("completion stream failed"))),
            }
        })))
    }
}

/// A deterministic `LLMClient` for local development and integration testing.
///
/// Replays a fixed list of deltas, optionally paced and optionally failing,
/// without touching the network.
pub struct ScriptedLLMClient {
    deltas: Vec<String>,
    fail_after: Option<usize>,
    fail_on_open: bool,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl ScriptedLLMClient {
    pub fn new<I, S>(deltas: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            deltas: deltas.into_iter().map(Into::into).collect(),
            fail_after: None,
            fail_on_open: false,
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// A client that echoes a short, fixed reply.
    pub fn echo() -> Self {
        Self::new([
            "I hear you",
            ", and that sounds really hard.",
            " Tell me more about how it feels",
            "?",
        ])
    }

    /// Emits this many deltas and then fails the stream.
    pub fn failing_after(mut self, count: usize) -> Self {
        self.fail_after = Some(count);
        self
    }

    /// Fails before any delta, as a rejected request would.
    pub fn failing_on_open(mut self) -> Self {
        self.fail_on_open = true;
        self
    }

    /// Sleeps this long before each delta.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// How many completion requests have been opened.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LLMClient for ScriptedLLMClient {
    async fn stream_reply(
        &self,
        _system_prompt: String,
        _transcript: Vec<ChatTurn>,
    ) -> Result<LLMStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_on_open {
            return Err(anyhow!("scripted provider rejected the request"));
        }

        let take = self.fail_after.unwrap_or(self.deltas.len());
        let mut items: Vec<Result<LLMStreamEvent>> = self
            .deltas
            .iter()
            .take(take)
            .cloned()
            .map(|text| Ok(LLMStreamEvent::TextChunk(text)))
            .collect();
        if self.fail_after.is_some() {
            items.push(Err(anyhow!("scripted provider dropped the stream")));
        }

        let delay = self.delay;
        Ok(Box::pin(stream::iter(items).then(move |item| async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            item
        })))
    }
}
