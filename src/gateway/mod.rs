//! Model Gateway (C4, §4.4): owns the single WebSocket to the speech-in/
//! speech-out model provider for one session.
//!
//! Wire parsing and setup-message construction are pure functions over
//! `serde_json::Value`/`&str` so they can be unit-tested without a live
//! socket (§10.4); [`ModelGateway`] itself is the thin async wrapper that
//! drives `tokio_tungstenite` and calls into them. Per the "dynamic
//! payloads become tagged variants" redesign note, nothing past
//! [`parse_inbound`] sees an untyped `serde_json::Value` parts array.

use std::time::Duration;

use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::error::RuntimeError;
use crate::types::CacheHandle;

/// Knowledge assembled into the inline system instruction is truncated to
/// this many characters, marker included (§3 invariant 4, §4.4).
pub const KNOWLEDGE_CHAR_LIMIT: usize = 20_000;
pub const TRUNCATION_MARKER: &str = "[... remaining knowledge truncated ...]";

/// Concatenates `documents` in order into one system-instruction string,
/// stopping as soon as the budget is exhausted and appending the literal
/// truncation marker if any document was cut (§4.4 knowledge assembly,
/// §8 property 5).
pub fn assemble_knowledge(documents: &[String]) -> String {
    let mut out = String::new();
    for doc in documents {
        if out.chars().count() + doc.chars().count() <= KNOWLEDGE_CHAR_LIMIT {
            out.push_str(doc);
            continue;
        }
        let marker_len = TRUNCATION_MARKER.chars().count();
        let budget = KNOWLEDGE_CHAR_LIMIT
            .saturating_sub(out.chars().count())
            .saturating_sub(marker_len);
        let prefix: String = doc.chars().take(budget).collect();
        out.push_str(&prefix);
        out.push_str(TRUNCATION_MARKER);
        break;
    }
    out
}

/// Whichever of `cachedContent` / `systemInstruction` the setup frame
/// carries; exactly one is ever present (§4.4, §3 invariant 3).
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum SetupContext {
    CachedContent {
        #[serde(rename = "cachedContent")]
        cached_content: String,
    },
    SystemInstruction {
        #[serde(rename = "systemInstruction")]
        system_instruction: String,
    },
}

/// Chooses `cachedContent` when `cache_handle` is `Some` (already
/// validated against the regex by [`CacheHandle::parse`] — a malformed
/// handle was already rewritten to `None` upstream, §3 invariant 3),
/// falling back to an inline system instruction built from `prompt` plus
/// truncated `knowledge`.
pub fn build_setup_context(
    cache_handle: Option<&CacheHandle>,
    prompt: &str,
    knowledge_documents: &[String],
) -> SetupContext {
    match cache_handle {
        Some(handle) => SetupContext::CachedContent {
            cached_content: handle.as_str().to_string(),
        },
        None => {
            let knowledge = assemble_knowledge(knowledge_documents);
            let system_instruction = if knowledge.is_empty() {
                prompt.to_string()
            } else {
                format!("{prompt}\n\n{knowledge}")
            };
            SetupContext::SystemInstruction { system_instruction }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationConfig {
    #[serde(rename = "voiceSpeed")]
    pub voice_speed: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct SetupMessage {
    pub model: String,
    #[serde(rename = "responseModalities")]
    pub response_modalities: Vec<&'static str>,
    pub voice: String,
    #[serde(flatten)]
    pub context: SetupContext,
    #[serde(rename = "generationConfig")]
    pub generation_config: GenerationConfig,
}

impl SetupMessage {
    pub fn new(model: String, voice: String, context: SetupContext, voice_speed: f32) -> Self {
        Self {
            model,
            response_modalities: vec!["AUDIO"],
            voice,
            context,
            generation_config: GenerationConfig { voice_speed },
        }
    }
}

#[derive(Debug, Deserialize)]
struct InlineData {
    #[serde(rename = "mimeType")]
    mime_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WirePart {
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: InlineData,
    },
    ToolCall {
        #[serde(rename = "toolCall")]
        tool_call: serde_json::Value,
    },
    TurnComplete {
        #[serde(rename = "turnComplete")]
        turn_complete: bool,
    },
    Interrupted {
        interrupted: bool,
    },
    Text {
        text: String,
    },
}

#[derive(Debug, Deserialize, Default)]
struct InboundMessage {
    #[serde(rename = "setupComplete", default)]
    setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    parts: Vec<WirePart>,
}

/// Normalized events surfaced to the session loop from one inbound model
/// message (§4.4 message parsing). A single wire message can yield zero,
/// one, or several of these (e.g. text plus a turn-complete marker).
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    SetupComplete,
    /// Decoded PCM16 audio, expected at 24 kHz (§4.4).
    Audio(Vec<i16>),
    Text(String),
    TurnComplete,
    InterruptedAck,
    /// Forwarded upward; the knowledge-retrieval hook is outside core
    /// scope, but the parser must not crash on it (§4.4).
    ToolCall(serde_json::Value),
    Ignored(&'static str),
}

fn decode_pcm16_le(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect()
}

/// Parses one inbound model message into zero or more [`GatewayEvent`]s.
/// Never errors on a recognizable-but-uninteresting payload: unknown MIME
/// types are logged and ignored per §4.4, and a `toolCall` part is
/// forwarded rather than rejected.
pub fn parse_inbound(raw: &str) -> Result<Vec<GatewayEvent>, RuntimeError> {
    let msg: InboundMessage = serde_json::from_str(raw)?;

    if msg.setup_complete.is_some() {
        return Ok(vec![GatewayEvent::SetupComplete]);
    }

    let mut events = Vec::with_capacity(msg.parts.len());
    for part in msg.parts {
        let event = match part {
            WirePart::InlineData { inline_data } if inline_data.mime_type.starts_with("audio/") => {
                match base64::engine::general_purpose::STANDARD.decode(&inline_data.data) {
                    Ok(bytes) => GatewayEvent::Audio(decode_pcm16_le(&bytes)),
                    Err(_) => GatewayEvent::Ignored("malformed base64 audio payload"),
                }
            }
            WirePart::InlineData { .. } => GatewayEvent::Ignored("inline data with non-audio mime type"),
            WirePart::Text { text } => GatewayEvent::Text(text),
            WirePart::TurnComplete { turn_complete: true } => GatewayEvent::TurnComplete,
            WirePart::TurnComplete { turn_complete: false } => GatewayEvent::Ignored("turnComplete=false"),
            WirePart::Interrupted { interrupted: true } => GatewayEvent::InterruptedAck,
            WirePart::Interrupted { interrupted: false } => GatewayEvent::Ignored("interrupted=false"),
            WirePart::ToolCall { tool_call } => GatewayEvent::ToolCall(tool_call),
        };
        events.push(event);
    }
    Ok(events)
}

/// Exponential reconnect schedule (§4.4, §8 property 7): 1s, 2s, 4s, then
/// exhausted. `attempt()` hands back the next delay or `None` once all
/// three have been spent; [`Self::reset`] is called after any successful
/// reconnect.
#[derive(Debug, Clone, Default)]
pub struct ReconnectPolicy {
    attempt: usize,
}

const BACKOFF_SCHEDULE_MS: [u64; 3] = [1_000, 2_000, 4_000];

impl ReconnectPolicy {
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempts_made(&self) -> usize {
        self.attempt
    }

    pub fn exhausted(&self) -> bool {
        self.attempt >= BACKOFF_SCHEDULE_MS.len()
    }

    /// Consumes the next backoff delay, advancing the attempt counter.
    /// Returns `None` once exhausted — the caller should emit
    /// `fatal_error` and not retry again.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.exhausted() {
            return None;
        }
        let ms = BACKOFF_SCHEDULE_MS[self.attempt];
        self.attempt += 1;
        Some(Duration::from_millis(ms))
    }
}

/// Outbound audio channel metrics: frames dropped because the bounded
/// channel to the model was full (§4.4 — "does not buffer unbounded").
#[derive(Debug, Clone, Default)]
pub struct GatewayMetrics {
    pub audio_frames_sent: u64,
    pub audio_frames_dropped: u64,
    pub reconnect_attempts: u64,
    pub malformed_cache_handle_warnings: u64,
}

type ModelSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Owns the live connection. Setup/parsing logic above is pure; this
/// struct is the thin async shell around `tokio_tungstenite`.
pub struct ModelGateway {
    endpoint: String,
    socket: Option<ModelSocket>,
    setup_confirmed: bool,
    reconnect: ReconnectPolicy,
    metrics: GatewayMetrics,
}

impl ModelGateway {
    pub fn new(endpoint: String) -> Self {
        Self {
            endpoint,
            socket: None,
            setup_confirmed: false,
            reconnect: ReconnectPolicy::default(),
            metrics: GatewayMetrics::default(),
        }
    }

    pub fn metrics(&self) -> &GatewayMetrics {
        &self.metrics
    }

    pub fn is_setup_confirmed(&self) -> bool {
        self.setup_confirmed
    }

    /// Opens the transport and sends the setup frame. Does not wait for
    /// `setupComplete` — that arrives asynchronously through the normal
    /// receive loop and flips [`Self::is_setup_confirmed`].
    pub async fn connect_and_setup(&mut self, setup: &SetupMessage) -> Result<(), RuntimeError> {
        let (socket, _) = tokio_tungstenite::connect_async(&self.endpoint)
            .await
            .map_err(RuntimeError::from)?;
        self.socket = Some(socket);
        self.setup_confirmed = false;
        self.send_setup(setup).await
    }

    async fn send_setup(&mut self, setup: &SetupMessage) -> Result<(), RuntimeError> {
        let json = serde_json::to_string(setup)?;
        let socket = self.socket.as_mut().ok_or_else(|| RuntimeError::Transport(
            "gateway socket not connected".into(),
        ))?;
        socket.send(Message::Text(json.into())).await.map_err(RuntimeError::from)
    }

    /// Sends one outbound PCM16 16 kHz little-endian audio chunk.
    /// Returns `RuntimeError::Protocol` if called before `setupComplete`
    /// was observed — per §4.4 this is a programming error, surfaced as a
    /// typed error rather than a panic so the session loop's central match
    /// handles it uniformly.
    pub async fn send_audio(&mut self, pcm16_16k: &[i16]) -> Result<(), RuntimeError> {
        if !self.setup_confirmed {
            return Err(RuntimeError::Protocol(
                "attempted to send audio before setupComplete".into(),
            ));
        }
        let mut bytes = Vec::with_capacity(pcm16_16k.len() * 2);
        for s in pcm16_16k {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        let socket = self.socket.as_mut().ok_or_else(|| RuntimeError::Transport(
            "gateway socket not connected".into(),
        ))?;
        match socket.send(Message::Binary(bytes.into())).await {
            Ok(()) => {
                self.metrics.audio_frames_sent += 1;
                Ok(())
            }
            Err(e) => Err(RuntimeError::from(e)),
        }
    }

    /// Sends a model-side interrupt signal on barge-in.
    pub async fn send_interrupt(&mut self) -> Result<(), RuntimeError> {
        let socket = self.socket.as_mut().ok_or_else(|| RuntimeError::Transport(
            "gateway socket not connected".into(),
        ))?;
        let frame = serde_json::json!({ "clientContent": { "interrupt": true } });
        socket
            .send(Message::Text(serde_json::to_string(&frame)?.into()))
            .await
            .map_err(RuntimeError::from)
    }

    /// Reads the next inbound message and classifies it. Updates
    /// `setup_confirmed` on a `SetupComplete` event.
    pub async fn receive(&mut self) -> Result<Vec<GatewayEvent>, RuntimeError> {
        let socket = self.socket.as_mut().ok_or_else(|| RuntimeError::Transport(
            "gateway socket not connected".into(),
        ))?;
        let msg = socket
            .next()
            .await
            .ok_or_else(|| RuntimeError::Transport("model socket closed".into()))?
            .map_err(RuntimeError::from)?;

        let text = match msg {
            Message::Text(t) => t.to_string(),
            Message::Close(_) => return Err(RuntimeError::Transport("model socket closed".into())),
            _ => return Ok(vec![GatewayEvent::Ignored("non-text model frame")]),
        };

        let events = parse_inbound(&text)?;
        if events.iter().any(|e| matches!(e, GatewayEvent::SetupComplete)) {
            self.setup_confirmed = true;
        }
        Ok(events)
    }

    /// Closes the transport intentionally (no reconnect attempt follows).
    pub async fn close_intentional(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            let _ = socket.close(None).await;
        }
        self.setup_confirmed = false;
    }

    /// Attempts one reconnect step per the backoff schedule. Returns
    /// `Ok(true)` if reconnected and setup resent, `Ok(false)` if the
    /// schedule is exhausted (caller should emit `fatal_error`).
    pub async fn try_reconnect(&mut self, setup: &SetupMessage) -> Result<bool, RuntimeError> {
        let Some(delay) = self.reconnect.next_delay() else {
            return Ok(false);
        };
        self.metrics.reconnect_attempts += 1;
        warn!(attempt = self.reconnect.attempts_made(), delay_ms = delay.as_millis() as u64, "model gateway reconnecting");
        tokio::time::sleep(delay).await;
        match self.connect_and_setup(setup).await {
            Ok(()) => {
                self.reconnect.reset();
                Ok(true)
            }
            Err(e) => {
                debug!(error = %e, "model gateway reconnect attempt failed");
                Ok(!self.reconnect.exhausted())
            }
        }
    }

    pub fn record_audio_dropped(&mut self) {
        self.metrics.audio_frames_dropped += 1;
    }

    pub fn record_malformed_cache_handle(&mut self) {
        self.metrics.malformed_cache_handle_warnings += 1;
        warn!("malformed cache handle rewritten to systemInstruction fallback");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CacheHandle;

    #[test]
    fn knowledge_under_budget_is_untouched() {
        let docs = vec!["hello".to_string(), "world".to_string()];
        assert_eq!(assemble_knowledge(&docs), "helloworld");
    }

    #[test]
    fn knowledge_over_budget_is_truncated_with_marker() {
        let big = "a".repeat(KNOWLEDGE_CHAR_LIMIT + 500);
        let out = assemble_knowledge(&[big]);
        assert!(out.chars().count() <= KNOWLEDGE_CHAR_LIMIT);
        assert!(out.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn knowledge_assembly_stops_after_first_truncated_document() {
        let docs = vec!["a".repeat(KNOWLEDGE_CHAR_LIMIT), "never appended".to_string()];
        let out = assemble_knowledge(&docs);
        assert!(!out.contains("never appended"));
    }

    #[test]
    fn setup_uses_cached_content_when_handle_present() {
        let handle = CacheHandle::parse("cachedContents/abc-123").unwrap();
        let ctx = build_setup_context(Some(&handle), "prompt", &[]);
        assert!(matches!(ctx, SetupContext::CachedContent { .. }));
    }

    #[test]
    fn setup_falls_back_to_system_instruction_without_handle() {
        let ctx = build_setup_context(None, "prompt", &["extra knowledge".to_string()]);
        match ctx {
            SetupContext::SystemInstruction { system_instruction } => {
                assert!(system_instruction.contains("prompt"));
                assert!(system_instruction.contains("extra knowledge"));
            }
            _ => panic!("expected system instruction"),
        }
    }

    #[test]
    fn setup_message_serializes_exactly_one_of_cache_or_instruction() {
        let handle = CacheHandle::parse("cachedContents/abc-123").unwrap();
        let ctx = build_setup_context(Some(&handle), "ignored", &[]);
        let msg = SetupMessage::new("model-x".into(), "voice-a".into(), ctx, 1.0);
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json.get("cachedContent").is_some());
        assert!(json.get("systemInstruction").is_none());
    }

    #[test]
    fn parse_inbound_setup_complete() {
        let events = parse_inbound(r#"{"setupComplete":{}}"#).unwrap();
        assert!(matches!(events[0], GatewayEvent::SetupComplete));
    }

    #[test]
    fn parse_inbound_classifies_text_and_turn_complete() {
        let events = parse_inbound(
            r#"{"parts":[{"text":"hello"},{"turnComplete":true}]}"#,
        )
        .unwrap();
        assert!(matches!(&events[0], GatewayEvent::Text(t) if t == "hello"));
        assert!(matches!(events[1], GatewayEvent::TurnComplete));
    }

    #[test]
    fn parse_inbound_ignores_non_audio_inline_data() {
        let events = parse_inbound(
            r#"{"parts":[{"inlineData":{"mimeType":"image/png","data":"AAAA"}}]}"#,
        )
        .unwrap();
        assert!(matches!(events[0], GatewayEvent::Ignored(_)));
    }

    #[test]
    fn parse_inbound_decodes_audio_inline_data() {
        let pcm: Vec<i16> = vec![1, 2, 3];
        let mut bytes = Vec::new();
        for s in &pcm {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        let b64 = base64::engine::general_purpose::STANDARD.encode(bytes);
        let json = format!(r#"{{"parts":[{{"inlineData":{{"mimeType":"audio/pcm","data":"{b64}"}}}}]}}"#);
        let events = parse_inbound(&json).unwrap();
        assert!(matches!(&events[0], GatewayEvent::Audio(p) if p == &pcm));
    }

    #[test]
    fn parse_inbound_forwards_tool_call_without_crashing() {
        let events = parse_inbound(r#"{"parts":[{"toolCall":{"name":"lookup","args":{}}}]}"#).unwrap();
        assert!(matches!(events[0], GatewayEvent::ToolCall(_)));
    }

    #[test]
    fn reconnect_schedule_is_1_2_4_then_exhausted() {
        let mut policy = ReconnectPolicy::default();
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(1000)));
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(2000)));
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(4000)));
        assert_eq!(policy.next_delay(), None);
        assert!(policy.exhausted());
    }

    #[test]
    fn reconnect_reset_restarts_the_schedule() {
        let mut policy = ReconnectPolicy::default();
        policy.next_delay();
        policy.reset();
        assert_eq!(policy.attempts_made(), 0);
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(1000)));
    }
}
