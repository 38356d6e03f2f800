//! RMS energy, a voice-active predicate, and the silence timer (C2).

/// RMS energy of a PCM16 buffer, normalized by `i16::MAX` into `[0, 1]`.
/// An empty buffer has zero energy.
pub fn rms(pcm16: &[i16]) -> f32 {
    if pcm16.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = pcm16.iter().map(|&s| (s as f64) * (s as f64)).sum();
    let mean_sq = sum_sq / pcm16.len() as f64;
    ((mean_sq.sqrt()) / 32768.0) as f32
}

/// True when the buffer's RMS energy exceeds `threshold`.
pub fn is_voice_active(pcm16: &[i16], threshold: f32) -> bool {
    rms(pcm16) > threshold
}

/// Default energy threshold for real calls (§4.2, §9 open question: 0.003
/// is normative across both carriers unless the agent overrides it).
pub const DEFAULT_THRESHOLD: f32 = 0.003;

/// Default threshold used by test sessions.
pub const TEST_THRESHOLD: f32 = 0.004;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadState {
    Silence,
    VoiceActive,
}

#[derive(Debug, Clone, Copy)]
pub struct VadConfig {
    pub threshold: f32,
    pub silence_detection_ms: u64,
}

impl VadConfig {
    pub fn real_call(silence_detection_ms: u64) -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            silence_detection_ms,
        }
    }

    pub fn test_session(silence_detection_ms: u64) -> Self {
        Self {
            threshold: TEST_THRESHOLD,
            silence_detection_ms,
        }
    }
}

/// Tracks continuous silence duration against a threshold, firing once the
/// accumulated silent time reaches `silence_detection_ms`. Any frame whose
/// RMS is at or above the threshold resets the accumulator to zero.
#[derive(Debug, Clone)]
pub struct SilenceTimer {
    config: VadConfig,
    elapsed_ms: u64,
}

impl SilenceTimer {
    pub fn new(config: VadConfig) -> Self {
        Self {
            config,
            elapsed_ms: 0,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.config.threshold
    }

    /// Feeds one frame's RMS plus its duration. Returns `true` exactly once
    /// per uninterrupted silence run, the instant the accumulated duration
    /// crosses `silence_detection_ms`.
    pub fn on_frame(&mut self, frame_rms: f32, frame_duration_ms: u64) -> bool {
        if frame_rms >= self.config.threshold {
            self.elapsed_ms = 0;
            return false;
        }
        let was_below = self.elapsed_ms < self.config.silence_detection_ms;
        self.elapsed_ms = self.elapsed_ms.saturating_add(frame_duration_ms);
        was_below && self.elapsed_ms >= self.config.silence_detection_ms
    }

    pub fn reset(&mut self) {
        self.elapsed_ms = 0;
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed_ms
    }
}

/// Thin convenience wrapper bundling the threshold predicate and the
/// silence timer behind one state (`Silence` / `VoiceActive`), mirroring
/// the state-machine shape the reference VAD module uses internally.
#[derive(Debug, Clone)]
pub struct Vad {
    timer: SilenceTimer,
    state: VadState,
}

impl Vad {
    pub fn new(config: VadConfig) -> Self {
        Self {
            timer: SilenceTimer::new(config),
            state: VadState::Silence,
        }
    }

    pub fn state(&self) -> VadState {
        self.state
    }

    /// Processes one frame, updating internal state and returning whether
    /// the silence timer fired on this call.
    pub fn process(&mut self, pcm16: &[i16], frame_duration_ms: u64) -> (VadState, bool) {
        let energy = rms(pcm16);
        let fired = self.timer.on_frame(energy, frame_duration_ms);
        self.state = if energy > self.timer.threshold() {
            VadState::VoiceActive
        } else {
            VadState::Silence
        };
        (self.state, fired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rms_of_silence_is_zero() {
        assert_eq!(rms(&[0; 160]), 0.0);
    }

    #[test]
    fn rms_of_full_scale_is_near_one() {
        let samples = vec![i16::MAX; 160];
        assert!((rms(&samples) - 1.0).abs() < 0.001);
    }

    #[test]
    fn voice_active_threshold_boundary() {
        // A buffer whose rms sits just above vs below default threshold.
        let loud = vec![200i16; 160];
        let quiet = vec![10i16; 160];
        assert!(is_voice_active(&loud, DEFAULT_THRESHOLD));
        assert!(!is_voice_active(&quiet, DEFAULT_THRESHOLD));
    }

    #[test]
    fn silence_timer_fires_exactly_once_per_run() {
        let mut timer = SilenceTimer::new(VadConfig::real_call(800));
        let silent_frame = vec![0i16; 160];
        let mut fired_count = 0;
        for _ in 0..9 {
            if timer.on_frame(rms(&silent_frame), 100) {
                fired_count += 1;
            }
        }
        assert_eq!(fired_count, 1);
        assert!(timer.elapsed_ms() >= 800);
    }

    #[test]
    fn silence_timer_resets_on_voice_active_frame() {
        let mut timer = SilenceTimer::new(VadConfig::real_call(800));
        let silent = vec![0i16; 160];
        let loud = vec![500i16; 160];
        for _ in 0..7 {
            assert!(!timer.on_frame(rms(&silent), 100));
        }
        assert!(!timer.on_frame(rms(&loud), 100));
        assert_eq!(timer.elapsed_ms(), 0);
    }
}
