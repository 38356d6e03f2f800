//! Hedge/Filler Engine (C5, §4.5): hides the gap between "user finished
//! speaking" and the model's first audio chunk behind a pre-generated
//! filler clip.
//!
//! Process-wide state here is limited to the filler library itself, which
//! is read-only after startup and safe to share across sessions (§5); the
//! 400 ms arm/disarm timer and round-robin cursor are per-session and live
//! on [`HedgeEngine`].

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Languages the filler library ships pre-generated clips for (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
    Hinglish,
    English,
    Spanish,
    French,
}

impl Language {
    const ALL: [Language; 4] = [Language::Hinglish, Language::English, Language::Spanish, Language::French];

    /// Subdirectory name `FillerLibrary::load_from_dir` looks under.
    fn dir_name(self) -> &'static str {
        match self {
            Language::Hinglish => "hinglish",
            Language::English => "english",
            Language::Spanish => "spanish",
            Language::French => "french",
        }
    }
}

#[derive(Debug, Error)]
pub enum FillerLibraryError {
    #[error("failed to read filler clip {path}: {source}")]
    Read { path: String, source: hound::Error },
    #[error("filler clip {0} is not mono")]
    NotMono(String),
}

/// Delay between `userSpeechEnded` and arming the filler if the model
/// hasn't produced audio yet.
pub const HEDGE_ARM_DELAY: Duration = Duration::from_millis(400);

/// Read-only, shared across sessions: one or more pre-generated PCM16
/// filler buffers per language, cycled round-robin per session to avoid
/// repetition artifacts in the same call.
#[derive(Debug, Clone)]
pub struct FillerLibrary {
    buffers: HashMap<Language, Vec<Arc<Vec<i16>>>>,
}

impl FillerLibrary {
    pub fn new(buffers: HashMap<Language, Vec<Arc<Vec<i16>>>>) -> Self {
        Self { buffers }
    }

    /// Builds a library with one synthetic (silent) filler per language,
    /// useful where no real pre-recorded clips have been loaded yet.
    pub fn empty_stub() -> Self {
        let mut buffers = HashMap::new();
        for lang in [Language::Hinglish, Language::English, Language::Spanish, Language::French] {
            buffers.insert(lang, vec![Arc::new(Vec::new())]);
        }
        Self { buffers }
    }

    /// Loads pre-generated PCM16 filler clips from `<root>/<language>/*.wav`
    /// (one subdirectory per [`Language`]). A language with no subdirectory,
    /// or no `.wav` files in it, is simply absent from the resulting
    /// library rather than an error — callers fall back to [`Self::empty_stub`]
    /// entries for whichever language they select at call time.
    pub fn load_from_dir(root: &Path) -> Result<Self, FillerLibraryError> {
        let mut buffers = HashMap::new();
        for lang in Language::ALL {
            let dir = root.join(lang.dir_name());
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            let mut clips = Vec::new();
            let mut paths: Vec<_> = entries.filter_map(|e| e.ok().map(|e| e.path())).collect();
            paths.sort();
            for path in paths {
                if path.extension().and_then(|e| e.to_str()) != Some("wav") {
                    continue;
                }
                let mut reader = hound::WavReader::open(&path).map_err(|source| FillerLibraryError::Read {
                    path: path.display().to_string(),
                    source,
                })?;
                if reader.spec().channels != 1 {
                    return Err(FillerLibraryError::NotMono(path.display().to_string()));
                }
                let samples: Result<Vec<i16>, hound::Error> = reader.samples::<i16>().collect();
                let samples = samples.map_err(|source| FillerLibraryError::Read {
                    path: path.display().to_string(),
                    source,
                })?;
                clips.push(Arc::new(samples));
            }
            if !clips.is_empty() {
                buffers.insert(lang, clips);
            }
        }
        Ok(Self { buffers })
    }

    fn clip(&self, lang: Language, index: usize) -> Option<Arc<Vec<i16>>> {
        let clips = self.buffers.get(&lang)?;
        if clips.is_empty() {
            return None;
        }
        Some(clips[index % clips.len()].clone())
    }
}

/// Per-session hedge state: arm/disarm bookkeeping plus the round-robin
/// cursor for its chosen language.
pub struct HedgeEngine {
    library: Arc<FillerLibrary>,
    language: Language,
    cursor: usize,
    armed: bool,
    playing: Option<Arc<Vec<i16>>>,
}

/// What the session loop should do in response to a hedge-engine event.
#[derive(Debug, Clone, PartialEq)]
pub enum HedgeAction {
    /// Nothing to do yet.
    None,
    /// Emit this filler buffer on the outbound path immediately.
    PlayFiller(Arc<Vec<i16>>),
    /// A filler was playing; crossfade it out over one frame rather than a
    /// hard cut (§4.5).
    CrossfadeOut(Arc<Vec<i16>>),
}

impl HedgeEngine {
    pub fn new(library: Arc<FillerLibrary>, language: Language) -> Self {
        Self {
            library,
            language,
            cursor: 0,
            armed: false,
            playing: None,
        }
    }

    /// Arms the hedge timer on `userSpeechEnded`. The session loop is
    /// expected to schedule a 400 ms timer and call [`Self::timer_fired`]
    /// when it elapses, or [`Self::model_first_audio`] if audio beats it.
    pub fn arm(&mut self) {
        self.armed = true;
    }

    /// The 400 ms arm timer elapsed without `modelFirstAudio`: play the
    /// next filler in this session's round-robin sequence.
    pub fn timer_fired(&mut self) -> HedgeAction {
        if !self.armed {
            return HedgeAction::None;
        }
        self.armed = false;
        match self.library.clip(self.language, self.cursor) {
            Some(clip) => {
                self.cursor = self.cursor.wrapping_add(1);
                self.playing = Some(clip.clone());
                HedgeAction::PlayFiller(clip)
            }
            None => HedgeAction::None,
        }
    }

    /// The model produced its first audio chunk. Disarms the timer and, if
    /// a filler was already playing, signals a one-frame crossfade instead
    /// of a hard cut.
    pub fn model_first_audio(&mut self) -> HedgeAction {
        self.armed = false;
        match self.playing.take() {
            Some(clip) => HedgeAction::CrossfadeOut(clip),
            None => HedgeAction::None,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn is_playing(&self) -> bool {
        self.playing.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn library_with_two_clips(lang: Language) -> Arc<FillerLibrary> {
        let mut buffers = HashMap::new();
        buffers.insert(lang, vec![Arc::new(vec![1, 2, 3]), Arc::new(vec![4, 5, 6])]);
        Arc::new(FillerLibrary::new(buffers))
    }

    #[test]
    fn timer_fired_without_arming_is_noop() {
        let lib = library_with_two_clips(Language::English);
        let mut hedge = HedgeEngine::new(lib, Language::English);
        assert_eq!(hedge.timer_fired(), HedgeAction::None);
    }

    #[test]
    fn model_audio_before_timer_discards_filler_silently() {
        let lib = library_with_two_clips(Language::English);
        let mut hedge = HedgeEngine::new(lib, Language::English);
        hedge.arm();
        assert_eq!(hedge.model_first_audio(), HedgeAction::None);
        assert!(!hedge.is_armed());
    }

    #[test]
    fn timer_fired_after_arming_plays_filler() {
        let lib = library_with_two_clips(Language::English);
        let mut hedge = HedgeEngine::new(lib, Language::English);
        hedge.arm();
        let action = hedge.timer_fired();
        assert!(matches!(action, HedgeAction::PlayFiller(_)));
        assert!(hedge.is_playing());
    }

    #[test]
    fn model_audio_while_playing_crossfades_out() {
        let lib = library_with_two_clips(Language::English);
        let mut hedge = HedgeEngine::new(lib, Language::English);
        hedge.arm();
        hedge.timer_fired();
        let action = hedge.model_first_audio();
        assert!(matches!(action, HedgeAction::CrossfadeOut(_)));
        assert!(!hedge.is_playing());
    }

    #[test]
    fn load_from_dir_reads_wav_clips_per_language_subdirectory() {
        let root = tempfile::tempdir().unwrap();
        let english_dir = root.path().join("english");
        std::fs::create_dir_all(&english_dir).unwrap();
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 24_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(english_dir.join("filler-1.wav"), spec).unwrap();
        for s in [100i16, -100, 200, -200] {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();

        let library = FillerLibrary::load_from_dir(root.path()).unwrap();
        let clip = library.clip(Language::English, 0).unwrap();
        assert_eq!(clip.as_slice(), &[100, -100, 200, -200]);
        assert!(library.clip(Language::French, 0).is_none());
    }

    #[test]
    fn round_robin_cycles_through_clips_without_repeats() {
        let lib = library_with_two_clips(Language::English);
        let mut hedge = HedgeEngine::new(lib, Language::English);
        hedge.arm();
        let first = hedge.timer_fired();
        hedge.model_first_audio();
        hedge.arm();
        let second = hedge.timer_fired();
        assert_ne!(first, second);
    }
}
