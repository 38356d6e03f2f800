//! Call Session Orchestrator (C8, §4.8 & §5): the session loop.
//!
//! This is the one async executor in the runtime that is allowed to turn a
//! [`SideEffect`] into a real send/timer/persist call — every other module
//! in this crate (`state_machine`, `hedge`, `router`, `limiter`) is pure or
//! a thin synchronous wrapper so it can be unit-tested without a live
//! socket. `CallSession::run` is deliberately the only place that holds
//! `&mut` references to all of C1–C7, C10 and the persistence port at once.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};

use crate::adapter::{AdapterEvent, OutboundWire, ProviderAdapter, WireFrame};
use crate::audio::vad::{SilenceTimer, VadConfig};
use crate::gateway::{GatewayEvent, ModelGateway, SetupMessage};
use crate::hedge::{HedgeAction, HedgeEngine};
use crate::limiter::{CallTimers, TimeoutConfig, TimerKind};
use crate::orchestrator::state_machine::{CallEvent, CallState, CallStateMachine, EndReason, SideEffect, StateMachineConfig};
use crate::orchestrator::voicemail::{self, AcousticSummary};
use crate::persistence::{CallLogEvent, CallSessionRecord, PersistencePort};
use crate::router::AudioRouter;
use crate::types::{AgentConfig, AudioFrame, Carrier, Direction, Turn, TurnRole, VoicemailAction};

/// How often the loop polls timers, the hedge deadline, and drains the
/// outbound router, independent of whichever I/O event last arrived.
const TICK_INTERVAL: Duration = Duration::from_millis(20);

/// Static identity for one call, set once at session creation.
pub struct CallSessionContext {
    pub call_id: String,
    pub direction: Direction,
    pub carrier: Carrier,
    pub agent_id: String,
    pub lead_id: Option<String>,
    pub agent_config: AgentConfig,
}

/// Everything the session loop needs to open the model connection, built
/// once from [`CallSessionContext::agent_config`] before `run` is called.
pub struct ModelSetup {
    pub endpoint: String,
    pub setup_message: SetupMessage,
}

/// Ties together C1–C7, C10 and the persistence port for the lifetime of
/// one call. Generic over the carrier adapter so the same loop drives both
/// wire formats (§4.3).
pub struct CallSession<A: ProviderAdapter> {
    ctx: CallSessionContext,
    adapter: A,
    gateway: ModelGateway,
    state_machine: CallStateMachine,
    utterance_silence: SilenceTimer,
    call_timers: CallTimers,
    hedge: HedgeEngine,
    router: AudioRouter,
    persistence: Arc<dyn PersistencePort>,
    turns: Vec<Turn>,
    current_agent_turn: Option<Turn>,
    current_user_turn: Option<Turn>,
    responding_started_at: Option<Instant>,
    hedge_deadline: Option<Instant>,
    end_reason: Option<EndReason>,
    seq: u32,
    started_at: chrono::DateTime<Utc>,
}

impl<A: ProviderAdapter> CallSession<A> {
    pub fn new(
        ctx: CallSessionContext,
        adapter: A,
        gateway: ModelGateway,
        hedge: HedgeEngine,
        persistence: Arc<dyn PersistencePort>,
        timeout_config: TimeoutConfig,
    ) -> Self {
        let sm_config = StateMachineConfig {
            interruption_sensitivity: ctx.agent_config.speech_settings.interruption_sensitivity,
            silence_detection_ms: ctx.agent_config.call_settings.silence_detection_ms,
            voicemail_action: ctx.agent_config.call_settings.voicemail_action,
        };
        let carrier_rate_hz = adapter.carrier_rate_hz();
        let now = Instant::now();
        Self {
            utterance_silence: SilenceTimer::new(VadConfig::real_call(sm_config.silence_detection_ms)),
            call_timers: CallTimers::new(&timeout_config, now),
            state_machine: CallStateMachine::new(sm_config),
            router: AudioRouter::new(carrier_rate_hz),
            ctx,
            adapter,
            gateway,
            hedge,
            persistence,
            turns: Vec::new(),
            current_agent_turn: None,
            current_user_turn: None,
            responding_started_at: None,
            hedge_deadline: None,
            end_reason: None,
            seq: 0,
            started_at: Utc::now(),
        }
    }

    /// Drives the call to completion: connects the model, feeds carrier
    /// frames in, routes model audio out, and persists on `Ended`. Returns
    /// the reason the call ended.
    #[instrument(skip_all, fields(call_id = %self.ctx.call_id, carrier = ?self.ctx.carrier))]
    pub async fn run(
        &mut self,
        setup: ModelSetup,
        mut carrier_in: mpsc::Receiver<WireFrame>,
        carrier_out: mpsc::Sender<OutboundWire>,
    ) -> EndReason {
        self.gateway = ModelGateway::new(setup.endpoint.clone());
        if let Err(e) = self.gateway.connect_and_setup(&setup.setup_message).await {
            warn!(error = %e, "model gateway connect failed at session start");
            return self.finish(EndReason::Error(e.to_string()));
        }

        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        loop {
            tokio::select! {
                biased;

                maybe_frame = carrier_in.recv() => {
                    match maybe_frame {
                        Some(frame) => self.on_carrier_frame(frame, &carrier_out).await,
                        None => {
                            self.transition(CallEvent::ProviderClose, &carrier_out).await;
                        }
                    }
                }

                model_msg = self.gateway.receive() => {
                    match model_msg {
                        Ok(events) => {
                            for event in events {
                                self.on_gateway_event(event, &carrier_out).await;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "model gateway read failed, attempting reconnect");
                            match self.gateway.try_reconnect(&setup.setup_message).await {
                                Ok(true) => continue,
                                Ok(false) => {
                                    self.transition(CallEvent::FatalError, &carrier_out).await;
                                }
                                Err(e) => {
                                    warn!(error = %e, "model gateway reconnect errored");
                                    self.transition(CallEvent::FatalError, &carrier_out).await;
                                }
                            }
                        }
                    }
                }

                _ = ticker.tick() => {
                    self.on_tick(&carrier_out).await;
                }
            }

            if self.state_machine.state().is_terminal() {
                break;
            }
        }

        let reason = self.end_reason.take().unwrap_or(EndReason::Hangup);
        self.finish(reason)
    }

    async fn on_carrier_frame(&mut self, wire: WireFrame, carrier_out: &mpsc::Sender<OutboundWire>) {
        let events = match self.adapter.parse(wire) {
            Ok(events) => events,
            Err(e) => {
                warn!(error = %e, "adapter failed to parse carrier frame");
                return;
            }
        };
        for event in events {
            self.on_adapter_event(event, carrier_out).await;
        }
    }

    async fn on_adapter_event(&mut self, event: AdapterEvent, carrier_out: &mpsc::Sender<OutboundWire>) {
        match event {
            AdapterEvent::Connected => {}
            AdapterEvent::StreamStarted { stream_id, call_id } => {
                info!(stream_id, call_id, "carrier stream started");
            }
            AdapterEvent::Media(frame) => self.on_media_frame(frame, carrier_out).await,
            AdapterEvent::Mark => {}
            AdapterEvent::Dtmf { digit, duration_ms } => {
                info!(%digit, duration_ms, "dtmf received, no in-call action defined");
            }
            AdapterEvent::Stop { reason } => {
                info!(?reason, "carrier sent stop");
                self.transition(CallEvent::Hangup, carrier_out).await;
            }
            AdapterEvent::AckRequired(wire) => {
                let _ = carrier_out.send(wire).await;
            }
            AdapterEvent::Ignored(reason) => {
                warn!(reason, "carrier frame ignored");
            }
        }
    }

    async fn on_media_frame(&mut self, frame: AudioFrame, carrier_out: &mpsc::Sender<OutboundWire>) {
        if self.gateway.is_setup_confirmed() {
            if let Err(e) = self.gateway.send_audio(&frame.pcm16).await {
                warn!(error = %e, "failed to forward audio to model");
                self.gateway.record_audio_dropped();
            }
        } else {
            self.gateway.record_audio_dropped();
        }

        let frame_duration_ms = if frame.sample_rate > 0 {
            (frame.pcm16.len() as u64 * 1000) / frame.sample_rate as u64
        } else {
            0
        };

        if self.state_machine.state() == CallState::HumanSpeaking {
            if self.utterance_silence.on_frame(frame.rms, frame_duration_ms) {
                let duration_ms = self.utterance_silence.elapsed_ms();
                self.transition(CallEvent::Silence { duration_ms }, carrier_out).await;
            }
        }

        if frame.rms > self.utterance_silence.threshold() {
            self.call_timers.silence.reset(Instant::now());
            self.append_user_audio_marker();
        } else if self.state_machine.state() == CallState::Listening
            || self.state_machine.state() == CallState::Welcome
        {
            self.maybe_detect_voicemail();
        }

        self.transition(CallEvent::AudioIn(frame), carrier_out).await;
    }

    fn append_user_audio_marker(&mut self) {
        let turn = self
            .current_user_turn
            .get_or_insert_with(|| Turn::new(TurnRole::User, String::new()));
        if turn.content.is_empty() {
            turn.content.push_str("[lead speaking]");
        }
    }

    /// Voicemail screening without a speech-to-text transcript is limited
    /// to the prolonged-absence signal; phrase and acoustic-pitch signals
    /// need a hypothesis/pitch estimate this crate does not produce itself
    /// and are left for a caller-supplied classifier to feed in separately.
    fn maybe_detect_voicemail(&mut self) {
        if !self.ctx.agent_config.call_settings.voicemail_detection {
            return;
        }
        let absence_ms = self.utterance_silence.elapsed_ms();
        let score = voicemail::score(None, None::<&AcousticSummary>, absence_ms, 15_000);
        if score.is_voicemail() {
            warn!(confidence = score.confidence, "voicemail detected");
            self.end_reason.get_or_insert(EndReason::Voicemail);
        }
    }

    async fn on_gateway_event(&mut self, event: GatewayEvent, carrier_out: &mpsc::Sender<OutboundWire>) {
        match event {
            GatewayEvent::SetupComplete => {
                self.transition(CallEvent::ModelReady, carrier_out).await;
                let welcome = self.ctx.agent_config.welcome_message.clone();
                self.handle_effect(SideEffect::SendWelcomeText(welcome), carrier_out).await;
                self.transition(CallEvent::WelcomePlayed, carrier_out).await;
            }
            GatewayEvent::Audio(pcm) => {
                let pcm = if self.hedge.is_armed() || self.hedge.is_playing() {
                    match self.hedge.model_first_audio() {
                        HedgeAction::CrossfadeOut(filler) => crate::router::crossfade(&filler, &pcm),
                        _ => pcm,
                    }
                } else {
                    pcm
                };
                // §4.10: the response timer measures time since last model
                // audio, so every chunk — not just the first — resets it.
                self.call_timers.response.reset(Instant::now());
                self.responding_started_at.get_or_insert_with(Instant::now);
                self.router.enqueue(pcm.clone());
                let frame = AudioFrame::new(pcm, crate::adapter::EGRESS_RATE_HZ, self.seq);
                self.seq = self.seq.wrapping_add(1);
                self.transition(CallEvent::ModelAudioIn(frame), carrier_out).await;
            }
            GatewayEvent::Text(text) => {
                let turn = self
                    .current_agent_turn
                    .get_or_insert_with(|| Turn::new(TurnRole::Agent, String::new()));
                turn.content.push_str(&text);
            }
            GatewayEvent::TurnComplete => {
                self.transition(CallEvent::ModelTurnComplete, carrier_out).await;
            }
            GatewayEvent::InterruptedAck => {
                self.transition(CallEvent::ModelInterruptedAck, carrier_out).await;
            }
            GatewayEvent::ToolCall(call) => {
                info!(?call, "tool call forwarded, no in-call handler registered");
            }
            GatewayEvent::Ignored(reason) => {
                warn!(reason, "gateway message ignored");
            }
        }
    }

    async fn on_tick(&mut self, carrier_out: &mpsc::Sender<OutboundWire>) {
        let now = Instant::now();

        if let Some(kind) = self.call_timers.poll(now) {
            let event = match kind {
                TimerKind::MaxDuration => CallEvent::DurationExceeded,
                TimerKind::Silence => CallEvent::SilenceExceeded,
                TimerKind::Response => CallEvent::FatalError,
            };
            self.transition(event, carrier_out).await;
        }

        if let Some(deadline) = self.hedge_deadline {
            if now >= deadline {
                self.hedge_deadline = None;
                if let HedgeAction::PlayFiller(clip) = self.hedge.timer_fired() {
                    self.router.enqueue((*clip).clone());
                }
            }
        }

        while let Some(result) = self.router.next_outbound() {
            match result {
                Ok(pcm) => match self.adapter.build_outbound_audio(&pcm) {
                    Ok(wire) => {
                        let bytes = match &wire {
                            OutboundWire::Text(t) => t.len(),
                            OutboundWire::Binary(b) => b.len(),
                        };
                        if carrier_out.send(wire).await.is_ok() {
                            self.router.record_sent(bytes);
                        } else {
                            self.router.record_failed();
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to frame outbound audio");
                        self.router.record_failed();
                    }
                },
                Err(e) => {
                    warn!(error = %e, "failed to resample outbound audio");
                    self.router.record_failed();
                }
            }
        }
    }

    async fn transition(&mut self, event: CallEvent, carrier_out: &mpsc::Sender<OutboundWire>) {
        if let Some(reason) = classify_end_reason(&event) {
            self.end_reason.get_or_insert(reason);
        }
        let from_state = self.state_machine.state();
        let event_name = format!("{event:?}");
        let effects = self.state_machine.apply(event);
        let to_state = self.state_machine.state();
        if from_state != to_state {
            info!(?from_state, ?to_state, "call state transition");
            self.log_transition(from_state, to_state, &event_name).await;
        }
        for effect in effects {
            self.handle_effect(effect, carrier_out).await;
        }
        if to_state == CallState::CallEnding {
            let effects = self.state_machine.finish_ending();
            for effect in effects {
                self.handle_effect(effect, carrier_out).await;
            }
        }
    }

    async fn handle_effect(&mut self, effect: SideEffect, _carrier_out: &mpsc::Sender<OutboundWire>) {
        match effect {
            SideEffect::SendWelcomeText(text) => {
                let mut turn = Turn::new(TurnRole::Agent, text);
                turn.finalize();
                self.turns.push(turn);
            }
            SideEffect::StartDurationTimer => {
                self.call_timers.max_duration.reset(Instant::now());
            }
            SideEffect::ResetSilenceTimer => {
                self.call_timers.silence.reset(Instant::now());
                self.utterance_silence.reset();
            }
            SideEffect::SignalUserSpeechEnded => {
                if let Some(mut turn) = self.current_user_turn.take() {
                    turn.finalize();
                    self.turns.push(turn);
                }
                self.hedge.arm();
                self.hedge_deadline = Some(Instant::now() + crate::hedge::HEDGE_ARM_DELAY);
                self.call_timers.response.reset(Instant::now());
            }
            SideEffect::StopFiller => {
                self.hedge_deadline = None;
                let _ = self.hedge.model_first_audio();
            }
            SideEffect::SendInterruptToModel => {
                if let Err(e) = self.gateway.send_interrupt().await {
                    warn!(error = %e, "failed to send interrupt to model");
                }
            }
            SideEffect::TruncateCurrentAgentTurn => {
                if let Some(turn) = self.current_agent_turn.as_mut() {
                    turn.mark_interrupted();
                }
                if let Some(mut turn) = self.current_agent_turn.take() {
                    turn.finalize();
                    self.turns.push(turn);
                }
                self.responding_started_at = None;
            }
            SideEffect::FinalizeAgentTurn => {
                if let Some(mut turn) = self.current_agent_turn.take() {
                    if let Some(start) = self.responding_started_at.take() {
                        turn.latency_ms = Some(start.elapsed().as_millis() as u64);
                    }
                    turn.finalize();
                    self.turns.push(turn);
                }
            }
            SideEffect::CloseModelIntentional => {
                self.gateway.close_intentional().await;
            }
            SideEffect::PersistSession => {
                self.persist().await;
            }
            SideEffect::QueueVoicemailMessage => {
                let mut turn = Turn::new(TurnRole::Agent, "[voicemail message queued]");
                turn.finalize();
                self.turns.push(turn);
            }
        }
    }

    async fn log_transition(&self, from: CallState, to: CallState, event: &str) {
        let log = CallLogEvent {
            call_id: self.ctx.call_id.clone(),
            from_state: format!("{from:?}"),
            to_state: format!("{to:?}"),
            event: event.to_string(),
            at: Utc::now(),
        };
        if let Err(e) = self.persistence.append_call_log(log).await {
            warn!(error = %e, "failed to append call log event");
        }
    }

    async fn persist(&self) {
        let record = CallSessionRecord::new(
            self.ctx.call_id.clone(),
            self.ctx.direction,
            self.ctx.carrier,
            self.ctx.agent_id.clone(),
            self.ctx.lead_id.clone(),
            self.started_at,
            Utc::now(),
            self.end_reason.as_ref().unwrap_or(&EndReason::Hangup),
            self.turns.clone(),
        );
        if let Err(e) = self.persistence.persist_session(record).await {
            warn!(error = %e, "failed to persist call session");
        }
        info!(summary = %self.router.summary_line(), "session ended, routing summary");
    }

    fn finish(&mut self, reason: EndReason) -> EndReason {
        self.end_reason = Some(reason.clone());
        reason
    }
}

fn classify_end_reason(event: &CallEvent) -> Option<EndReason> {
    match event {
        CallEvent::DurationExceeded => Some(EndReason::DurationExceeded),
        CallEvent::SilenceExceeded => Some(EndReason::Silence),
        CallEvent::ProviderClose => Some(EndReason::Provider),
        CallEvent::FatalError => Some(EndReason::Error("fatal error in session loop".to_string())),
        CallEvent::Hangup => Some(EndReason::Hangup),
        CallEvent::VoicemailDetected(VoicemailAction::LeaveMessage) => Some(EndReason::Voicemail),
        CallEvent::VoicemailDetected(_) => Some(EndReason::Voicemail),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::carrier_a::CarrierAAdapter;
    use crate::gateway::{build_setup_context, SetupMessage};
    use crate::persistence::PersistenceError;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FakePersistence {
        records: Mutex<Vec<CallSessionRecord>>,
    }

    impl FakePersistence {
        fn new() -> Self {
            Self { records: Mutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl PersistencePort for FakePersistence {
        async fn persist_session(&self, record: CallSessionRecord) -> Result<(), PersistenceError> {
            self.records.lock().unwrap().push(record);
            Ok(())
        }

        async fn append_call_log(&self, _event: CallLogEvent) -> Result<(), PersistenceError> {
            Ok(())
        }
    }

    fn test_ctx() -> CallSessionContext {
        CallSessionContext {
            call_id: "call-1".into(),
            direction: Direction::Inbound,
            carrier: Carrier::A,
            agent_id: "agent-1".into(),
            lead_id: None,
            agent_config: AgentConfig {
                prompt: "You are a helpful agent".into(),
                welcome_message: "Hello, how can I help?".into(),
                ..Default::default()
            },
        }
    }

    #[test]
    fn classify_end_reason_maps_each_terminal_event() {
        assert!(matches!(classify_end_reason(&CallEvent::DurationExceeded), Some(EndReason::DurationExceeded)));
        assert!(matches!(classify_end_reason(&CallEvent::SilenceExceeded), Some(EndReason::Silence)));
        assert!(matches!(classify_end_reason(&CallEvent::Hangup), Some(EndReason::Hangup)));
        assert!(classify_end_reason(&CallEvent::ModelReady).is_none());
    }

    #[tokio::test]
    async fn session_constructs_with_carrier_a_adapter() {
        let ctx = test_ctx();
        let gateway = ModelGateway::new("wss://example.invalid/model".into());
        let hedge = HedgeEngine::new(Arc::new(crate::hedge::FillerLibrary::empty_stub()), crate::hedge::Language::English);
        let persistence: Arc<dyn PersistencePort> = Arc::new(FakePersistence::new());
        let session = CallSession::new(
            ctx,
            CarrierAAdapter::new(),
            gateway,
            hedge,
            persistence,
            TimeoutConfig::default(),
        );
        assert_eq!(session.state_machine.state(), CallState::Init);
    }

    #[test]
    fn setup_message_builds_from_agent_config_without_cache_handle() {
        let ctx = test_ctx();
        let context = build_setup_context(None, &ctx.agent_config.prompt, &[]);
        let setup = SetupMessage::new("model-x".into(), "voice-a".into(), context, ctx.agent_config.speech_settings.voice_speed);
        let json = serde_json::to_value(&setup).unwrap();
        assert!(json.get("systemInstruction").is_some());
    }
}
