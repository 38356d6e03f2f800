//! Voicemail detection scorer (§4.7).
//!
//! Structured as named contributors so each can be unit-tested in
//! isolation, per the "heuristic voicemail detection" redesign note in
//! §9: a scorer with named signals rather than an inline if/else chain.
//! Each signal that fires contributes a fixed 0.4, capped at 1.0 total —
//! the §4.7 weights are authoritative per the SPEC_FULL.md decision log,
//! not the conflicting 0.3/0.3/0.4 scheme mentioned as an open question.

const SIGNAL_WEIGHT: f32 = 0.4;
const CONFIDENCE_THRESHOLD: f32 = 0.5;

/// Fixed phrase set a user-text hypothesis is checked against. Matching is
/// case-insensitive substring search, deliberately simple: the acoustic
/// signals below carry the harder cases.
const VOICEMAIL_PHRASES: &[&str] = &[
    "leave a message after the tone",
    "leave a message after the beep",
    "is not available",
    "please leave your message",
    "record your message",
    "voicemail box",
    "cannot take your call",
];

/// One independent voicemail signal. Each `check_*` function is pure and
/// individually testable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoicemailSignal {
    PhraseMatch,
    AcousticRobotic,
    ProlongedAbsence,
}

/// Flat pitch + low variation acoustic summary the voicemail scorer
/// consults. Computed upstream by the acoustic DSP service (out of scope
/// per §1); this type only defines the shape the scorer reads.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcousticSummary {
    pub pitch_variance: f32,
    pub is_flat_pitch: bool,
}

/// Checks the user-text hypothesis against the fixed phrase set.
pub fn check_phrase_match(hypothesis: &str) -> Option<VoicemailSignal> {
    let lower = hypothesis.to_lowercase();
    VOICEMAIL_PHRASES
        .iter()
        .any(|p| lower.contains(p))
        .then_some(VoicemailSignal::PhraseMatch)
}

/// Checks for a flat-pitch, low-variation acoustic signature typical of an
/// automated greeting.
pub fn check_acoustic_robotic(summary: &AcousticSummary) -> Option<VoicemailSignal> {
    (summary.is_flat_pitch && summary.pitch_variance < 0.1).then_some(VoicemailSignal::AcousticRobotic)
}

/// Checks whether human-speech-band energy has been absent for an
/// unusually long stretch while the call is nominally in a speaking state.
pub fn check_prolonged_absence(human_speech_absent_ms: u64, threshold_ms: u64) -> Option<VoicemailSignal> {
    (human_speech_absent_ms >= threshold_ms).then_some(VoicemailSignal::ProlongedAbsence)
}

/// Aggregate score across whichever signals fired, capped at 1.0 (§4.7).
#[derive(Debug, Clone, Default)]
pub struct VoicemailScore {
    pub signals: Vec<VoicemailSignal>,
    pub confidence: f32,
}

impl VoicemailScore {
    pub fn from_signals(signals: Vec<VoicemailSignal>) -> Self {
        let confidence = (signals.len() as f32 * SIGNAL_WEIGHT).min(1.0);
        Self { signals, confidence }
    }

    pub fn is_voicemail(&self) -> bool {
        self.confidence >= CONFIDENCE_THRESHOLD
    }
}

/// Runs every contributor and combines the result. `text_hypothesis` and
/// `acoustic` are optional because not every caller has both available on
/// a given frame.
pub fn score(
    text_hypothesis: Option<&str>,
    acoustic: Option<&AcousticSummary>,
    human_speech_absent_ms: u64,
    absence_threshold_ms: u64,
) -> VoicemailScore {
    let mut signals = Vec::new();
    if let Some(h) = text_hypothesis {
        signals.extend(check_phrase_match(h));
    }
    if let Some(a) = acoustic {
        signals.extend(check_acoustic_robotic(a));
    }
    signals.extend(check_prolonged_absence(human_speech_absent_ms, absence_threshold_ms));
    VoicemailScore::from_signals(signals)
}
