//! The 9-state call lifecycle (C7, §4.7) — the core algorithm.
//!
//! `CallStateMachine` is a pure, synchronous transition function: it holds
//! no channels, no I/O, nothing async. The session loop (`call_session`) is
//! the sole caller of [`CallStateMachine::apply`] and is the only place
//! that turns a [`SideEffect`] into an actual send/timer/persist. This
//! mirrors the "event-emitter chains become a typed channel owned by one
//! consumer" redesign note: the state machine itself is the boundary
//! between "what happened" and "what to do about it".

use crate::audio::vad::DEFAULT_THRESHOLD;
use crate::types::{AudioFrame, VoicemailAction};

/// The 9 call states (§4.7). `Init` is the entry state, `Ended` terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Init,
    Welcome,
    Listening,
    HumanSpeaking,
    ProcessingRequest,
    Responding,
    ResponseComplete,
    CallEnding,
    Ended,
}

impl CallState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CallState::Ended)
    }
}

/// Why a call moved to `CallEnding`. Carried through to the persisted
/// `endReason` (§6 persisted state).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    DurationExceeded,
    Silence,
    Protocol,
    Provider,
    Error(String),
    Voicemail,
    Hangup,
}

impl EndReason {
    pub fn as_str(&self) -> &str {
        match self {
            EndReason::DurationExceeded => "duration-exceeded",
            EndReason::Silence => "silence",
            EndReason::Protocol => "protocol",
            EndReason::Provider => "provider-close",
            EndReason::Error(_) => "error",
            EndReason::Voicemail => "voicemail",
            EndReason::Hangup => "hangup",
        }
    }
}

/// Events the session loop feeds into the machine (§4.7, subset named plus
/// the ones needed to drive voicemail handling end-to-end).
#[derive(Debug, Clone)]
pub enum CallEvent {
    ModelReady,
    WelcomePlayed,
    AudioIn(AudioFrame),
    /// Continuous silence duration observed since the last voice-active
    /// frame, fed by the VAD's `SilenceTimer` in the session loop.
    Silence { duration_ms: u64 },
    ModelAudioIn(AudioFrame),
    ModelTurnComplete,
    ModelInterruptedAck,
    DurationExceeded,
    SilenceExceeded,
    FatalError,
    ProviderClose,
    VoicemailDetected(VoicemailAction),
    Hangup,
}

/// Actions the session loop must perform in response to a transition. Pure
/// data — no channel handles live here.
#[derive(Debug, Clone, PartialEq)]
pub enum SideEffect {
    SendWelcomeText(String),
    StartDurationTimer,
    ResetSilenceTimer,
    SignalUserSpeechEnded,
    StopFiller,
    SendInterruptToModel,
    TruncateCurrentAgentTurn,
    FinalizeAgentTurn,
    CloseModelIntentional,
    PersistSession,
    QueueVoicemailMessage,
}

/// Running statistics the RESPONDING barge-in guard needs across frames
/// (§4.7 interruption policy). Reset at the start of every RESPONDING
/// period since "maxObservedRms" is scoped to the current agent turn.
#[derive(Debug, Clone, Copy, Default)]
struct InterruptionTracker {
    max_observed_rms: f32,
    consecutive_voice_active: u32,
}

impl InterruptionTracker {
    fn reset(&mut self) {
        *self = Self::default();
    }

    /// Updates the running stats with one frame and returns whether this
    /// frame triggers a barge-in under `sensitivity` (§4.7 table).
    fn observe(&mut self, rms: f32, sensitivity: f32) -> bool {
        self.max_observed_rms = self.max_observed_rms.max(rms);
        // §4.2: voice-active is rms > threshold, not merely nonzero energy —
        // using the VAD's own definition keeps low-level noise from
        // satisfying the "3 consecutive voice-active frames" guard below.
        if rms > DEFAULT_THRESHOLD {
            self.consecutive_voice_active = self.consecutive_voice_active.saturating_add(1);
        } else {
            self.consecutive_voice_active = 0;
        }

        if sensitivity >= 0.8 {
            rms > 0.003
        } else if sensitivity >= 0.4 {
            rms > 0.7 * self.max_observed_rms && self.consecutive_voice_active >= 3
        } else {
            rms > 0.05 && self.consecutive_voice_active >= 3
        }
    }
}

/// Configuration the guards consult; a snapshot of the parts of
/// `AgentConfig` the state machine's transition logic needs directly.
#[derive(Debug, Clone, Copy)]
pub struct StateMachineConfig {
    pub interruption_sensitivity: f32,
    pub silence_detection_ms: u64,
    pub voicemail_action: VoicemailAction,
}

pub struct CallStateMachine {
    state: CallState,
    config: StateMachineConfig,
    interruption: InterruptionTracker,
}

impl CallStateMachine {
    pub fn new(config: StateMachineConfig) -> Self {
        Self {
            state: CallState::Init,
            config,
            interruption: InterruptionTracker::default(),
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    /// Applies one event to the machine, mutating `self.state` and
    /// returning the side effects the caller must perform. Events that
    /// don't match a transition for the current state are a no-op: the
    /// table in §4.7 is not exhaustive over `(state, event)` by design.
    pub fn apply(&mut self, event: CallEvent) -> Vec<SideEffect> {
        // Tie-break (§4.7): durationExceeded wins over modelTurnComplete
        // when both arrive in the same scheduling cycle. The caller is
        // expected to feed `DurationExceeded` first when both are pending
        // in the same poll; this machine just honors whichever arrives
        // first and ignores a same-cycle ModelTurnComplete once CallEnding
        // has already been entered.
        if self.state.is_terminal() {
            return Vec::new();
        }

        // Global transitions available from any non-terminal state. Hangup
        // sits here rather than in the main table so a carrier `stop` always
        // ends the call immediately, even from a state (e.g. ResponseComplete)
        // whose own table entry would otherwise absorb it as a plain event.
        match &event {
            CallEvent::SilenceExceeded => {
                self.state = CallState::CallEnding;
                return vec![];
            }
            CallEvent::FatalError | CallEvent::ProviderClose | CallEvent::Hangup => {
                self.state = CallState::CallEnding;
                return vec![];
            }
            CallEvent::VoicemailDetected(action) => {
                return self.handle_voicemail(*action);
            }
            _ => {}
        }

        match (self.state, event) {
            (CallState::Init, CallEvent::ModelReady) => {
                self.state = CallState::Welcome;
                vec![SideEffect::StartDurationTimer]
            }
            (CallState::Welcome, CallEvent::WelcomePlayed) => {
                self.state = CallState::Listening;
                vec![]
            }
            (CallState::Listening, CallEvent::AudioIn(frame)) if frame.rms > 0.003 => {
                self.state = CallState::HumanSpeaking;
                vec![SideEffect::ResetSilenceTimer]
            }
            (CallState::Listening, CallEvent::AudioIn(_)) => vec![],
            (CallState::HumanSpeaking, CallEvent::AudioIn(_)) => vec![],
            (CallState::HumanSpeaking, CallEvent::Silence { duration_ms })
                if duration_ms >= self.config.silence_detection_ms =>
            {
                self.state = CallState::ProcessingRequest;
                vec![SideEffect::SignalUserSpeechEnded]
            }
            (CallState::HumanSpeaking, CallEvent::Silence { .. }) => vec![],
            (CallState::ProcessingRequest, CallEvent::ModelAudioIn(_)) => {
                self.state = CallState::Responding;
                self.interruption.reset();
                vec![SideEffect::StopFiller]
            }
            (CallState::Responding, CallEvent::AudioIn(frame)) => {
                if self.interruption.observe(frame.rms, self.config.interruption_sensitivity) {
                    self.state = CallState::Listening;
                    vec![SideEffect::SendInterruptToModel, SideEffect::TruncateCurrentAgentTurn]
                } else {
                    vec![]
                }
            }
            (CallState::Responding, CallEvent::ModelAudioIn(_)) => vec![],
            (CallState::Responding, CallEvent::ModelTurnComplete) => {
                self.state = CallState::ResponseComplete;
                vec![SideEffect::FinalizeAgentTurn]
            }
            (CallState::Responding, CallEvent::ModelInterruptedAck) => vec![],
            (CallState::ResponseComplete, CallEvent::DurationExceeded) => {
                self.state = CallState::CallEnding;
                vec![]
            }
            (CallState::ResponseComplete, _) => {
                self.state = CallState::Listening;
                vec![]
            }
            (CallState::CallEnding, _) => {
                self.state = CallState::Ended;
                vec![SideEffect::CloseModelIntentional, SideEffect::PersistSession]
            }
            (_, CallEvent::DurationExceeded) => {
                self.state = CallState::CallEnding;
                vec![]
            }
            _ => vec![],
        }
    }

    fn handle_voicemail(&mut self, action: VoicemailAction) -> Vec<SideEffect> {
        self.state = CallState::CallEnding;
        match action {
            VoicemailAction::Hangup => vec![],
            VoicemailAction::LeaveMessage => vec![SideEffect::QueueVoicemailMessage],
            // Transfer is reported not-implemented and falls back to hangup (§4.7).
            VoicemailAction::Transfer => vec![],
        }
    }

    /// Drives the `CallEnding` → `Ended` transition explicitly, since the
    /// table's catch-all `(CallEnding, _) -> Ended` needs some event to
    /// fire it; the session loop calls this once it has finished tearing
    /// down (closing the model WS, etc.) rather than synthesizing an
    /// arbitrary event.
    pub fn finish_ending(&mut self) -> Vec<SideEffect> {
        if self.state == CallState::CallEnding {
            self.state = CallState::Ended;
            vec![SideEffect::CloseModelIntentional, SideEffect::PersistSession]
        } else {
            vec![]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn frame(rms: f32) -> AudioFrame {
        AudioFrame {
            pcm16: vec![],
            sample_rate: 16_000,
            rms,
            seq: 0,
            capture_ts: Utc::now(),
        }
    }

    fn config(sensitivity: f32) -> StateMachineConfig {
        StateMachineConfig {
            interruption_sensitivity: sensitivity,
            silence_detection_ms: 800,
            voicemail_action: VoicemailAction::Hangup,
        }
    }

    #[test]
    fn happy_path_drives_one_full_turn() {
        let mut sm = CallStateMachine::new(config(0.6));
        sm.apply(CallEvent::ModelReady);
        assert_eq!(sm.state(), CallState::Welcome);
        sm.apply(CallEvent::WelcomePlayed);
        assert_eq!(sm.state(), CallState::Listening);
        sm.apply(CallEvent::AudioIn(frame(0.01)));
        assert_eq!(sm.state(), CallState::HumanSpeaking);
        sm.apply(CallEvent::Silence { duration_ms: 900 });
        assert_eq!(sm.state(), CallState::ProcessingRequest);
        sm.apply(CallEvent::ModelAudioIn(frame(0.0)));
        assert_eq!(sm.state(), CallState::Responding);
        sm.apply(CallEvent::ModelTurnComplete);
        assert_eq!(sm.state(), CallState::ResponseComplete);
        let effects = sm.apply(CallEvent::SilenceExceeded);
        assert_eq!(sm.state(), CallState::CallEnding);
        assert!(effects.is_empty());
        let effects = sm.finish_ending();
        assert_eq!(sm.state(), CallState::Ended);
        assert!(effects.contains(&SideEffect::PersistSession));
    }

    #[test]
    fn response_complete_without_duration_goes_back_to_listening() {
        let mut sm = CallStateMachine::new(config(0.6));
        sm.apply(CallEvent::ModelReady);
        sm.apply(CallEvent::WelcomePlayed);
        sm.apply(CallEvent::AudioIn(frame(0.01)));
        sm.apply(CallEvent::Silence { duration_ms: 900 });
        sm.apply(CallEvent::ModelAudioIn(frame(0.0)));
        sm.apply(CallEvent::ModelTurnComplete);
        sm.apply(CallEvent::ModelInterruptedAck); // arbitrary non-duration event
        assert_eq!(sm.state(), CallState::Listening);
    }

    #[test]
    fn barge_in_at_high_sensitivity_triggers_on_any_voice() {
        let mut sm = CallStateMachine::new(config(0.9));
        sm.apply(CallEvent::ModelReady);
        sm.apply(CallEvent::WelcomePlayed);
        sm.apply(CallEvent::AudioIn(frame(0.01)));
        sm.apply(CallEvent::Silence { duration_ms: 900 });
        sm.apply(CallEvent::ModelAudioIn(frame(0.0)));
        assert_eq!(sm.state(), CallState::Responding);

        let effects = sm.apply(CallEvent::AudioIn(frame(0.01)));
        assert_eq!(sm.state(), CallState::Listening);
        assert!(effects.contains(&SideEffect::TruncateCurrentAgentTurn));
    }

    #[test]
    fn barge_in_suppressed_at_low_sensitivity_for_single_frame() {
        let mut sm = CallStateMachine::new(config(0.2));
        sm.apply(CallEvent::ModelReady);
        sm.apply(CallEvent::WelcomePlayed);
        sm.apply(CallEvent::AudioIn(frame(0.01)));
        sm.apply(CallEvent::Silence { duration_ms: 900 });
        sm.apply(CallEvent::ModelAudioIn(frame(0.0)));

        let effects = sm.apply(CallEvent::AudioIn(frame(0.01)));
        assert_eq!(sm.state(), CallState::Responding);
        assert!(effects.is_empty());
    }

    #[test]
    fn duration_exceeded_wins_tie_break_in_response_complete() {
        let mut sm = CallStateMachine::new(config(0.6));
        sm.apply(CallEvent::ModelReady);
        sm.apply(CallEvent::WelcomePlayed);
        sm.apply(CallEvent::AudioIn(frame(0.01)));
        sm.apply(CallEvent::Silence { duration_ms: 900 });
        sm.apply(CallEvent::ModelAudioIn(frame(0.0)));
        sm.apply(CallEvent::ModelTurnComplete);
        sm.apply(CallEvent::DurationExceeded);
        assert_eq!(sm.state(), CallState::CallEnding);
    }

    #[test]
    fn fatal_error_from_any_nonterminal_state_ends_call() {
        let mut sm = CallStateMachine::new(config(0.6));
        sm.apply(CallEvent::FatalError);
        assert_eq!(sm.state(), CallState::CallEnding);
    }

    #[test]
    fn hangup_from_response_complete_ends_call_immediately() {
        let mut sm = CallStateMachine::new(config(0.6));
        sm.apply(CallEvent::ModelReady);
        sm.apply(CallEvent::WelcomePlayed);
        sm.apply(CallEvent::AudioIn(frame(0.01)));
        sm.apply(CallEvent::Silence { duration_ms: 900 });
        sm.apply(CallEvent::ModelAudioIn(frame(0.0)));
        sm.apply(CallEvent::ModelTurnComplete);
        assert_eq!(sm.state(), CallState::ResponseComplete);
        sm.apply(CallEvent::Hangup);
        assert_eq!(sm.state(), CallState::CallEnding);
    }

    #[test]
    fn events_once_ended_are_ignored() {
        let mut sm = CallStateMachine::new(config(0.6));
        sm.apply(CallEvent::FatalError);
        sm.finish_ending();
        assert_eq!(sm.state(), CallState::Ended);
        let effects = sm.apply(CallEvent::ModelReady);
        assert!(effects.is_empty());
        assert_eq!(sm.state(), CallState::Ended);
    }

    #[test]
    fn voicemail_leave_message_queues_audio_then_ends() {
        let mut sm = CallStateMachine::new(config(0.6));
        sm.apply(CallEvent::ModelReady);
        sm.apply(CallEvent::WelcomePlayed);
        let effects = sm.apply(CallEvent::VoicemailDetected(VoicemailAction::LeaveMessage));
        assert_eq!(sm.state(), CallState::CallEnding);
        assert!(effects.contains(&SideEffect::QueueVoicemailMessage));
    }

    #[test]
    fn voicemail_transfer_falls_back_to_hangup_with_no_side_effects() {
        let mut sm = CallStateMachine::new(config(0.6));
        sm.apply(CallEvent::ModelReady);
        let effects = sm.apply(CallEvent::VoicemailDetected(VoicemailAction::Transfer));
        assert_eq!(sm.state(), CallState::CallEnding);
        assert!(effects.is_empty());
    }
}
