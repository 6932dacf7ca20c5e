//! Drives one session's reply cycle.
//!
//! The controller receives every decoded frame of its connection. Control
//! frames are answered inline; a reply-needed event starts a turn task that
//! streams the LLM reply through a [`SpeechChunker`] and sends each chunk as
//! soon as it is ready. Only one turn runs per session at a time.

use super::{
    connection::{Session, TurnState},
    protocol::{
        self, ClientMessage, ControlFrame, InboundFrame, ResponseId, ServerMessage, TurnRequest,
    },
};
use futures_util::StreamExt;
use serenity_core::{
    chunker::{ChunkerConfig, SpeechChunk, SpeechChunker},
    llm_client::{LLMClient, TurnDelta, begin_turn},
    prompt::{CallContext, PromptComposer},
};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span, warn};

/// Spoken when the provider fails mid-turn.
pub const FALLBACK_REPLY: &str =
    "I'm sorry, I lost my train of thought for a moment. Could you say that again?";

/// Turn settings shared by every session.
#[derive(Debug, Clone)]
pub struct TurnSettings {
    pub chunker: ChunkerConfig,
    pub greeting_enabled: bool,
}

/// Everything a turn task needs, cloned out of the controller.
struct TurnJob {
    session: Arc<Session>,
    llm_client: Arc<dyn LLMClient>,
    prompts: Arc<PromptComposer>,
    settings: TurnSettings,
    request: TurnRequest,
    vars: CallContext,
}

/// Per-connection turn state machine.
pub struct TurnController {
    session: Arc<Session>,
    llm_client: Arc<dyn LLMClient>,
    prompts: Arc<PromptComposer>,
    settings: TurnSettings,
    active: Option<JoinHandle<()>>,
}

impl TurnController {
    pub fn new(
        session: Arc<Session>,
        llm_client: Arc<dyn LLMClient>,
        prompts: Arc<PromptComposer>,
        settings: TurnSettings,
    ) -> Self {
        Self {
            session,
            llm_client,
            prompts,
            settings,
            active: None,
        }
    }

    /// Sends the one-time config frame. Must be the first outbound frame.
    pub async fn open(&self) -> bool {
        self.session.set_turn_state(TurnState::Idle);
        self.session.send(&ServerMessage::config()).await
    }

    /// Handles one text frame. Malformed frames are logged and dropped.
    pub async fn handle_text(&mut self, raw: &str) {
        match protocol::decode(raw) {
            Ok(frame) => self.handle_frame(frame).await,
            Err(e) => warn!(session_id = %self.session.id, error = %e, "Dropping undecodable frame."),
        }
    }

    /// Handles one binary frame carrying JSON.
    pub async fn handle_binary(&mut self, raw: &[u8]) {
        match protocol::decode_bytes(raw) {
            Ok(frame) => self.handle_frame(frame).await,
            Err(e) => warn!(session_id = %self.session.id, error = %e, "Dropping undecodable frame."),
        }
    }

    pub async fn handle_frame(&mut self, frame: InboundFrame) {
        match frame {
            InboundFrame::Control(ControlFrame::Ping { timestamp }) => {
                self.session.mark_alive();
                self.session.send(&ServerMessage::PingPong { timestamp }).await;
            }
            InboundFrame::Event(event) => self.handle_event(event),
        }
    }

    fn handle_event(&mut self, event: ClientMessage) {
        match event {
            ClientMessage::ResponseRequired(request) | ClientMessage::ReminderRequired(request) => {
                self.start_turn(request)
            }
            ClientMessage::CallDetails { call } => {
                if let Some(vars) = call.retell_llm_dynamic_variables {
                    info!(
                        session_id = %self.session.id,
                        user_name = %vars.display_name(),
                        "Received call details."
                    );
                    self.session.set_call_context(vars);
                }
            }
            ClientMessage::UpdateOnly { transcript } => {
                debug!(session_id = %self.session.id, entries = transcript.len(), "Transcript update.");
            }
            // Answered as a control frame by `decode`.
            ClientMessage::PingPong { .. } => {}
            ClientMessage::Unknown => {
                debug!(session_id = %self.session.id, "Ignoring unknown interaction type.");
            }
        }
    }

    fn start_turn(&mut self, request: TurnRequest) {
        if !self.session.try_begin_turn() {
            warn!(
                session_id = %self.session.id,
                response_id = %request.response_id,
                state = ?self.session.turn_state(),
                "Reply requested while a turn is in progress; ignoring."
            );
            return;
        }

        let vars = request
            .dynamic_variables()
            .cloned()
            .or_else(|| self.session.call_context())
            .unwrap_or_default();

        let span = info_span!(
            "turn",
            session_id = %self.session.id,
            response_id = %request.response_id
        );
        let job = TurnJob {
            session: self.session.clone(),
            llm_client: self.llm_client.clone(),
            prompts: self.prompts.clone(),
            settings: self.settings.clone(),
            request,
            vars,
        };
        self.active = Some(tokio::spawn(run_turn(job).instrument(span)));
    }

    pub fn state(&self) -> TurnState {
        self.session.turn_state()
    }

    /// Waits for the in-flight turn, if any, to finish.
    pub async fn wait_idle(&mut self) {
        if let Some(handle) = self.active.take() {
            let _ = handle.await;
        }
    }

    /// Stops any in-flight turn. The session must already be closed so the
    /// turn cannot write between now and its cancellation.
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.active.take() {
            handle.abort();
            debug!(session_id = %self.session.id, "Aborted in-flight turn.");
        }
    }
}

impl Drop for TurnController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Sends one chunk of the current reply. Returns `false` once the session is
/// gone, which ends the turn.
async fn send_chunk(session: &Session, response_id: &ResponseId, chunk: SpeechChunk) -> bool {
    session
        .send(&ServerMessage::chunk(response_id.clone(), chunk.text, chunk.complete))
        .await
}

async fn run_turn(job: TurnJob) {
    let TurnJob {
        session,
        llm_client,
        prompts,
        settings,
        request,
        vars,
    } = job;
    let response_id = request.response_id;

    if request.transcript.is_empty() && settings.greeting_enabled {
        let greeting = prompts.compose_greeting(&vars);
        info!(user_name = %vars.display_name(), "Empty transcript; sending greeting.");
        session.set_turn_state(TurnState::Flushing);
        session
            .send(&ServerMessage::chunk(response_id, greeting, true))
            .await;
        session.set_turn_state(TurnState::Idle);
        return;
    }

    info!(
        user_name = %vars.display_name(),
        entries = request.transcript.len(),
        "Generating reply."
    );
    let system_prompt = prompts.compose(&vars);
    let mut deltas = begin_turn(llm_client, system_prompt, request.transcript);
    let mut chunker = SpeechChunker::new(settings.chunker);
    let mut failure = None;

    loop {
        let delta = tokio::select! {
            biased;
            () = session.closed() => {
                debug!("Session closed mid-turn; dropping completion stream.");
                return;
            }
            next = deltas.next() => match next {
                Some(delta) => delta,
                None => break,
            },
        };
        match delta {
            TurnDelta::Text(text) => {
                for chunk in chunker.push(&text) {
                    if !send_chunk(&session, &response_id, chunk).await {
                        return;
                    }
                }
            }
            TurnDelta::Failed(reason) => {
                failure = Some(reason);
                break;
            }
        }
    }
    drop(deltas);

    session.set_turn_state(TurnState::Flushing);
    match failure {
        Some(reason) => {
            warn!(error = %reason, "Completion failed; sending fallback reply.");
            if let Some(chunk) = chunker.abort() {
                if !send_chunk(&session, &response_id, chunk).await {
                    return;
                }
            }
            session
                .send(&ServerMessage::chunk(response_id, FALLBACK_REPLY.to_string(), true))
                .await;
        }
        None => {
            for chunk in chunker.finish() {
                if !send_chunk(&session, &response_id, chunk).await {
                    return;
                }
            }
            debug!("Reply complete.");
        }
    }
    session.set_turn_state(TurnState::Idle);
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use axum::extract::ws::Message;
    use serde_json::{Value, json};
    use serenity_core::llm_client::{ChatTurn, LLMStream, LLMStreamEvent, ScriptedLLMClient};
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Harness {
        controller: TurnController,
        session: Arc<Session>,
        rx: mpsc::Receiver<Message>,
    }

    fn harness(client: Arc<dyn LLMClient>, max_chars: usize) -> Harness {
        let (tx, rx) = mpsc::channel(64);
        let session = Arc::new(Session::new("call_test", tx));
        let controller = TurnController::new(
            session.clone(),
            client,
            Arc::new(PromptComposer::new("Serenity")),
            TurnSettings {
                chunker: ChunkerConfig { max_chars },
                greeting_enabled: true,
            },
        );
        Harness {
            controller,
            session,
            rx,
        }
    }

    fn drain(rx: &mut mpsc::Receiver<Message>) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let Message::Text(text) = msg {
                frames.push(serde_json::from_str(text.as_str()).unwrap());
            }
        }
        frames
    }

    fn required(response_id: Value, transcript: Value, vars: Value) -> String {
        json!({
            "interaction_type": "response_required",
            "response_id": response_id,
            "transcript": transcript,
            "call": { "retell_llm_dynamic_variables": vars }
        })
        .to_string()
    }

    fn one_user_line() -> Value {
        json!([{ "role": "user", "content": "I had a rough day" }])
    }

    #[tokio::test]
    async fn open_sends_config_first() {
        let mut h = harness(Arc::new(ScriptedLLMClient::echo()), 50);
        assert!(h.controller.open().await);
        let frames = drain(&mut h.rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["response_type"], "config");
        assert_eq!(frames[0]["config"]["auto_reconnect"], true);
        assert_eq!(frames[0]["config"]["call_details"], true);
        assert_eq!(h.controller.state(), TurnState::Idle);
    }

    #[tokio::test]
    async fn empty_transcript_gets_greeting_without_llm_call() {
        let client = Arc::new(ScriptedLLMClient::echo());
        let mut h = harness(client.clone(), 50);
        h.controller
            .handle_text(&required(json!(0), json!([]), json!({ "user_name": "Ada" })))
            .await;
        h.controller.wait_idle().await;

        let frames = drain(&mut h.rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["response_type"], "response");
        assert_eq!(frames[0]["response_id"], 0);
        assert_eq!(frames[0]["content_complete"], true);
        assert!(frames[0]["content"].as_str().unwrap().contains("Ada"));
        assert_eq!(client.calls(), 0);
        assert_eq!(h.controller.state(), TurnState::Idle);
    }

    #[tokio::test]
    async fn short_sentence_is_one_terminal_chunk() {
        let client = Arc::new(ScriptedLLMClient::new(["Hi", " there", "."]));
        let mut h = harness(client.clone(), 10);
        h.controller
            .handle_text(&required(json!("r1"), one_user_line(), json!({})))
            .await;
        h.controller.wait_idle().await;

        let frames = drain(&mut h.rx);
        assert_eq!(
            frames,
            vec![json!({
                "response_type": "response",
                "response_id": "r1",
                "content": "Hi there.",
                "content_complete": true,
                "end_call": false
            })]
        );
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn long_reply_is_chunked_with_single_terminal() {
        let deltas: Vec<String> = (0..40).map(|_| "abcde".to_string()).collect();
        let expected: String = deltas.concat();
        let mut h = harness(Arc::new(ScriptedLLMClient::new(deltas)), 50);
        h.controller
            .handle_text(&required(json!(5), one_user_line(), json!({})))
            .await;
        h.controller.wait_idle().await;

        let frames = drain(&mut h.rx);
        assert_eq!(frames.len(), 5);
        for frame in &frames[..4] {
            assert_eq!(frame["content_complete"], false);
            assert_eq!(frame["content"].as_str().unwrap().len(), 50);
        }
        assert_eq!(frames[4]["content"], "");
        assert_eq!(frames[4]["content_complete"], true);
        let joined: String = frames
            .iter()
            .map(|f| f["content"].as_str().unwrap())
            .collect();
        assert_eq!(joined, expected);
    }

    #[tokio::test]
    async fn provider_failure_ends_with_fallback() {
        let client = Arc::new(ScriptedLLMClient::new(["Okay.", " So", " then"]).failing_after(2));
        let mut h = harness(client, 50);
        h.controller
            .handle_text(&required(json!(9), one_user_line(), json!({})))
            .await;
        h.controller.wait_idle().await;

        let frames = drain(&mut h.rx);
        let last = frames.last().unwrap();
        assert_eq!(last["content"], FALLBACK_REPLY);
        assert_eq!(last["content_complete"], true);
        assert_eq!(
            frames.iter().filter(|f| f["content_complete"] == true).count(),
            1
        );
        assert!(h.session.is_open());
        assert_eq!(h.controller.state(), TurnState::Idle);
    }

    #[tokio::test]
    async fn flushed_sentence_is_sent_before_fallback() {
        let client = Arc::new(
            ScriptedLLMClient::new(["I hear you, that sounds hard."]).failing_after(1),
        );
        let mut h = harness(client, 50);
        h.controller
            .handle_text(&required(json!(3), one_user_line(), json!({})))
            .await;
        h.controller.wait_idle().await;

        let frames = drain(&mut h.rx);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0]["content"], "I hear you, that sounds hard.");
        assert_eq!(frames[0]["content_complete"], false);
        assert_eq!(frames[1]["content"], FALLBACK_REPLY);
        assert_eq!(frames[1]["content_complete"], true);
        assert_eq!(h.controller.state(), TurnState::Idle);
    }

    #[tokio::test]
    async fn unrecognized_transcript_role_still_gets_a_reply() {
        let client = Arc::new(ScriptedLLMClient::new(["Okay."]));
        let mut h = harness(client.clone(), 50);
        let transcript = json!([
            { "role": "system", "content": "call transferred" },
            { "role": "user", "content": "Hello?" }
        ]);
        h.controller
            .handle_text(&required(json!(6), transcript, json!({})))
            .await;
        h.controller.wait_idle().await;

        let frames = drain(&mut h.rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["content"], "Okay.");
        assert_eq!(frames[0]["content_complete"], true);
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn provider_rejection_sends_only_fallback() {
        let client = Arc::new(ScriptedLLMClient::new(["unused"]).failing_on_open());
        let mut h = harness(client, 50);
        h.controller
            .handle_text(&required(json!(1), one_user_line(), json!({})))
            .await;
        h.controller.wait_idle().await;

        let frames = drain(&mut h.rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["content"], FALLBACK_REPLY);

        // The session accepts the next turn.
        h.controller
            .handle_text(&required(json!(2), one_user_line(), json!({})))
            .await;
        h.controller.wait_idle().await;
        assert_eq!(drain(&mut h.rx).len(), 1);
    }

    #[tokio::test]
    async fn malformed_frame_does_not_block_next_frame() {
        let mut h = harness(Arc::new(ScriptedLLMClient::echo()), 50);
        h.controller.handle_text("{{not json").await;
        h.controller
            .handle_text(r#"{"interaction_type":"ping_pong","timestamp":123}"#)
            .await;

        let frames = drain(&mut h.rx);
        assert_eq!(frames, vec![json!({ "response_type": "ping_pong", "timestamp": 123 })]);
        assert!(h.session.is_open());
    }

    #[tokio::test]
    async fn app_ping_marks_session_alive() {
        let mut h = harness(Arc::new(ScriptedLLMClient::echo()), 50);
        assert!(h.session.check_alive());
        assert!(!h.session.check_alive());
        h.controller
            .handle_text(r#"{"interaction_type":"ping_pong","timestamp":1}"#)
            .await;
        assert!(h.session.check_alive());
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_request_is_ignored() {
        let client = Arc::new(
            ScriptedLLMClient::new(["One.", " Two."]).with_delay(Duration::from_millis(100)),
        );
        let mut h = harness(client.clone(), 50);
        h.controller
            .handle_text(&required(json!(1), one_user_line(), json!({})))
            .await;
        tokio::task::yield_now().await;
        assert_eq!(h.controller.state(), TurnState::Generating);

        h.controller
            .handle_text(&required(json!(2), one_user_line(), json!({})))
            .await;
        h.controller.wait_idle().await;

        let frames = drain(&mut h.rx);
        assert!(frames.iter().all(|f| f["response_id"] == 1));
        assert_eq!(client.calls(), 1);
        assert_eq!(frames.last().unwrap()["content_complete"], true);
    }

    #[tokio::test]
    async fn call_details_supply_variables_for_later_turns() {
        let mut h = harness(Arc::new(ScriptedLLMClient::echo()), 50);
        h.controller
            .handle_text(
                &json!({
                    "interaction_type": "call_details",
                    "call": { "retell_llm_dynamic_variables": { "user_name": "Sam" } }
                })
                .to_string(),
            )
            .await;
        h.controller
            .handle_text(
                &json!({
                    "interaction_type": "response_required",
                    "response_id": 0,
                    "transcript": []
                })
                .to_string(),
            )
            .await;
        h.controller.wait_idle().await;

        let frames = drain(&mut h.rx);
        assert_eq!(frames.len(), 1);
        assert!(frames[0]["content"].as_str().unwrap().contains("Sam"));
    }

    /// A provider whose deltas are fed by the test, one at a time.
    struct ChannelClient {
        deltas: parking_lot::Mutex<Option<mpsc::Receiver<String>>>,
    }

    #[async_trait]
    impl LLMClient for ChannelClient {
        async fn stream_reply(&self, _: String, _: Vec<ChatTurn>) -> Result<LLMStream> {
            let rx = self.deltas.lock().take().expect("single turn");
            Ok(Box::pin(futures_util::stream::unfold(rx, |mut rx| async move {
                rx.recv()
                    .await
                    .map(|text| (Ok::<_, anyhow::Error>(LLMStreamEvent::TextChunk(text)), rx))
            })))
        }
    }

    #[tokio::test]
    async fn close_mid_generation_stops_writes_and_consumption() {
        let (delta_tx, delta_rx) = mpsc::channel::<String>(8);
        let client = Arc::new(ChannelClient {
            deltas: parking_lot::Mutex::new(Some(delta_rx)),
        });
        let mut h = harness(client, 10);
        h.controller
            .handle_text(&required(json!(4), one_user_line(), json!({})))
            .await;

        delta_tx.send("First sentence.".into()).await.unwrap();
        delta_tx.send(" More".into()).await.unwrap();
        let first = tokio::time::timeout(Duration::from_secs(1), h.rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(first, Message::Text(ref t) if t.as_str().contains("First sentence.")));

        h.session.close();
        h.controller.shutdown();
        tokio::task::yield_now().await;

        // The turn task dropped the completion stream, so its receiver is gone.
        tokio::time::timeout(Duration::from_secs(1), delta_tx.closed())
            .await
            .expect("completion stream should be dropped");
        assert!(delta_tx.send(" ignored.".into()).await.is_err());
        assert!(h.rx.try_recv().is_err());
    }
}
