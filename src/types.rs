//! Shared types used across modules
//!
//! This module contains types that are used by multiple modules
//! to avoid circular dependencies: the call-session data model (§3 of the
//! design spec), plus the small value types that travel over channels
//! between the adapter, the VAD, the state machine and the model gateway.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Direction a call was established in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Which carrier adapter owns this session's wire framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Carrier {
    /// JSON events, mulaw 8 kHz payloads.
    A,
    /// Framed JSON plus raw binary PCM 44.1 kHz.
    B,
}

/// One contiguous attributed span of speech within a call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub content: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub interrupted: bool,
    pub latency_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    Agent,
    User,
}

impl Turn {
    pub fn new(role: TurnRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            start_time: Utc::now(),
            end_time: None,
            interrupted: false,
            latency_ms: None,
        }
    }

    /// Appends the `[interrupted]` marker used when a barge-in truncates an
    /// in-progress agent turn (§4.7 RESPONDING → LISTENING side-effect).
    pub fn mark_interrupted(&mut self) {
        self.interrupted = true;
        if !self.content.ends_with("[interrupted]") {
            if !self.content.is_empty() && !self.content.ends_with(' ') {
                self.content.push(' ');
            }
            self.content.push_str("[interrupted]");
        }
        self.end_time.get_or_insert_with(Utc::now);
    }

    pub fn finalize(&mut self) {
        self.end_time.get_or_insert_with(Utc::now);
    }
}

/// A pure value type carrying one chunk of linear PCM16 audio through
/// channels between the adapter, VAD, state machine and model gateway.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub pcm16: Vec<i16>,
    pub sample_rate: u32,
    pub rms: f32,
    pub seq: u32,
    pub capture_ts: DateTime<Utc>,
}

impl AudioFrame {
    pub fn new(pcm16: Vec<i16>, sample_rate: u32, seq: u32) -> Self {
        let rms = crate::audio::vad::rms(&pcm16);
        Self {
            pcm16,
            sample_rate,
            rms,
            seq,
            capture_ts: Utc::now(),
        }
    }
}

/// Action applied when voicemail is detected; `Transfer` always falls back
/// to `Hangup` since call transfer is an external collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoicemailAction {
    Hangup,
    LeaveMessage,
    Transfer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechSettings {
    #[serde(default = "default_voice_speed")]
    pub voice_speed: f32,
    #[serde(default = "default_responsiveness")]
    pub responsiveness: f32,
    /// Interruption sensitivity in [0, 1]; see the barge-in policy table.
    #[serde(default = "default_interruption_sensitivity")]
    pub interruption_sensitivity: f32,
    #[serde(default)]
    pub emotions: Vec<String>,
    #[serde(default)]
    pub background_noise: Option<String>,
}

fn default_voice_speed() -> f32 {
    1.0
}
fn default_responsiveness() -> f32 {
    0.5
}
fn default_interruption_sensitivity() -> f32 {
    0.6
}

impl Default for SpeechSettings {
    fn default() -> Self {
        Self {
            voice_speed: default_voice_speed(),
            responsiveness: default_responsiveness(),
            interruption_sensitivity: default_interruption_sensitivity(),
            emotions: Vec::new(),
            background_noise: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSettings {
    #[serde(default = "default_max_call_duration_sec")]
    pub max_call_duration_sec: u64,
    #[serde(default = "default_silence_detection_ms")]
    pub silence_detection_ms: u64,
    #[serde(default)]
    pub voicemail_detection: bool,
    #[serde(default = "default_voicemail_action")]
    pub voicemail_action: VoicemailAction,
}

fn default_max_call_duration_sec() -> u64 {
    600
}
fn default_silence_detection_ms() -> u64 {
    30_000
}
fn default_voicemail_action() -> VoicemailAction {
    VoicemailAction::Hangup
}

impl Default for CallSettings {
    fn default() -> Self {
        Self {
            max_call_duration_sec: default_max_call_duration_sec(),
            silence_detection_ms: default_silence_detection_ms(),
            voicemail_detection: false,
            voicemail_action: default_voicemail_action(),
        }
    }
}

/// Immutable, externally-supplied configuration for one call (§3
/// `AgentConfig`). Persistence / CRUD of this is out of scope; this type
/// only defines its shape.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentConfig {
    pub prompt: String,
    pub welcome_message: String,
    #[serde(default)]
    pub characteristics: Vec<String>,
    #[serde(default)]
    pub speech_settings: SpeechSettings,
    #[serde(default)]
    pub call_settings: CallSettings,
    /// Knowledge base documents folded into the inline system instruction
    /// when no cache handle is set (§4.4); truncated at the gateway's
    /// knowledge character budget.
    #[serde(default)]
    pub knowledge_documents: Vec<String>,
    /// Raw `cachedContents/...` handle as supplied by the caller, validated
    /// with [`CacheHandle::parse`] before use (§3 invariant 3).
    #[serde(default)]
    pub cache_handle: Option<String>,
}

static CACHE_HANDLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^cachedContents/[A-Za-z0-9_-]+$").expect("static pattern is valid"));

/// Opaque model-side context identifier. `parse` rewrites anything that
/// doesn't match the pattern to `None` rather than erroring, per invariant 3.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheHandle(String);

impl CacheHandle {
    pub fn parse(raw: impl AsRef<str>) -> Option<Self> {
        let raw = raw.as_ref();
        if CACHE_HANDLE_RE.is_match(raw) {
            Some(Self(raw.to_string()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_handle_accepts_well_formed_ids() {
        assert!(CacheHandle::parse("cachedContents/abc-123_DEF").is_some());
    }

    #[test]
    fn cache_handle_rejects_malformed_ids() {
        assert!(CacheHandle::parse("abc/xyz").is_none());
        assert!(CacheHandle::parse("cachedContents/has space").is_none());
        assert!(CacheHandle::parse("").is_none());
    }

    #[test]
    fn turn_interrupted_marker_is_appended_once() {
        let mut t = Turn::new(TurnRole::Agent, "hello there");
        t.mark_interrupted();
        t.mark_interrupted();
        assert_eq!(t.content.matches("[interrupted]").count(), 1);
    }
}
