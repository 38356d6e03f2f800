//! Audio codec and voice-activity detection (C1 and C2).
//!
//! `codec` converts between mulaw and linear PCM16 and resamples between the
//! handful of rates the two carrier adapters and the model gateway need.
//! `vad` turns a PCM16 buffer into an energy estimate and a voice-active
//! predicate, the same RMS-threshold approach the reference voice pipeline
//! uses for its own Silero/VAD front end.

pub mod codec;
pub mod vad;

pub use codec::{decode_mulaw, encode_mulaw, resample, AudioCodecError};
pub use vad::{rms, Vad, VadConfig, VadState};
