//! mulaw <-> PCM16 conversion and linear-interpolation resampling (C1).

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AudioCodecError {
    #[error("pcm16 buffer has odd byte length {0}")]
    OddLength(usize),
    #[error("unsupported sample rate: {0} -> {1}")]
    BadRate(u32, u32),
}

const MULAW_BIAS: i16 = 0x84;
const MULAW_CLIP: i16 = 32635;

/// Decodes a buffer of ITU G.711 mulaw bytes into linear PCM16 samples.
pub fn decode_mulaw(bytes: &[u8]) -> Vec<i16> {
    bytes.iter().map(|&b| decode_mulaw_sample(b)).collect()
}

fn decode_mulaw_sample(u_val: u8) -> i16 {
    let u_val = !u_val;
    let sign = u_val & 0x80;
    let exponent = (u_val >> 4) & 0x07;
    let mantissa = u_val & 0x0F;

    let mut sample = ((mantissa as i16) << 3) + MULAW_BIAS;
    sample <<= exponent as i16;
    sample -= MULAW_BIAS;

    if sign != 0 {
        -sample
    } else {
        sample
    }
}

/// Encodes linear PCM16 samples into ITU G.711 mulaw bytes.
pub fn encode_mulaw(pcm16: &[i16]) -> Vec<u8> {
    pcm16.iter().map(|&s| encode_mulaw_sample(s)).collect()
}

fn encode_mulaw_sample(sample: i16) -> u8 {
    let sign = if sample < 0 { 0x80u8 } else { 0x00u8 };
    let mut magnitude = if sample < 0 {
        sample.saturating_neg()
    } else {
        sample
    };
    if magnitude > MULAW_CLIP {
        magnitude = MULAW_CLIP;
    }
    magnitude += MULAW_BIAS;

    let exponent = (15 - magnitude.leading_zeros() as i16).clamp(0, 7);
    let mantissa = (magnitude >> (exponent + 3)) & 0x0F;
    let u_val = sign | ((exponent as u8) << 4) | (mantissa as u8);
    !u_val
}

/// Resamples linear PCM16 `samples` from `from_hz` to `to_hz` via linear
/// interpolation between adjacent samples, clamped to i16 range. Returns
/// `samples` unchanged (cloned) if the rates are equal.
///
/// Deterministic: no dithering, so `resample(resample(b, r1, r2), r2, r1)`
/// only ever differs from `b` at interpolated positions, and only by
/// rounding error bounded by a couple of LSBs.
pub fn resample(samples: &[i16], from_hz: u32, to_hz: u32) -> Result<Vec<i16>, AudioCodecError> {
    if from_hz == 0 || to_hz == 0 {
        return Err(AudioCodecError::BadRate(from_hz, to_hz));
    }
    if from_hz == to_hz {
        return Ok(samples.to_vec());
    }
    if samples.is_empty() {
        return Ok(Vec::new());
    }

    let ratio = to_hz as f64 / from_hz as f64;
    let out_len = ((samples.len() as f64) * ratio).round().max(1.0) as usize;
    let mut out = Vec::with_capacity(out_len);
    let last_index = (samples.len() - 1) as f64;

    for i in 0..out_len {
        let src_pos = (i as f64) / ratio;
        let src_pos = src_pos.min(last_index);
        let lower = src_pos.floor() as usize;
        let upper = (lower + 1).min(samples.len() - 1);
        let frac = src_pos - lower as f64;

        let a = samples[lower] as f64;
        let b = samples[upper] as f64;
        let interpolated = a + (b - a) * frac;
        out.push(interpolated.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16);
    }

    Ok(out)
}

/// Even-length validation for callers that decode raw bytes into PCM16
/// directly (as opposed to going through `decode_mulaw`, which is
/// byte-for-sample and has no parity constraint).
pub fn check_even_length(bytes: &[u8]) -> Result<(), AudioCodecError> {
    if bytes.len() % 2 != 0 {
        Err(AudioCodecError::OddLength(bytes.len()))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mulaw_round_trip_is_identity_within_quantization() {
        // mulaw is lossy by construction; round-tripping an arbitrary PCM16
        // value is not exact, but decode(encode(x)) must land in the same
        // quantization bucket as x when re-encoded.
        for original in [0i16, 100, -100, 4000, -4000, 32000, -32000] {
            let encoded = encode_mulaw_sample(original);
            let decoded = decode_mulaw_sample(encoded);
            let re_encoded = encode_mulaw_sample(decoded);
            assert_eq!(encoded, re_encoded);
        }
    }

    #[test]
    fn encode_decode_mulaw_is_identity_on_already_mulaw_bytes() {
        let bytes: Vec<u8> = (0..=255u8).collect();
        let pcm = decode_mulaw(&bytes);
        let re_encoded = encode_mulaw(&pcm);
        assert_eq!(bytes, re_encoded);
    }

    #[test]
    fn resample_identity_when_rates_match() {
        let samples = vec![1, 2, 3, -4, 5];
        let out = resample(&samples, 16_000, 16_000).unwrap();
        assert_eq!(out, samples);
    }

    #[test]
    fn resample_upsample_preserves_endpoints() {
        let samples = vec![100, 200, 300, 400];
        let out = resample(&samples, 8_000, 16_000).unwrap();
        assert_eq!(out.first(), samples.first());
        assert_eq!(out.len(), 8);
    }

    #[test]
    fn resample_round_trip_stays_within_two_lsb() {
        let samples: Vec<i16> = (0..64).map(|i| ((i * 137) % 2000) as i16 - 1000).collect();
        let up = resample(&samples, 8_000, 16_000).unwrap();
        let down = resample(&up, 16_000, 8_000).unwrap();
        assert_eq!(down.len(), samples.len());
        for (a, b) in samples.iter().zip(down.iter()) {
            assert!((*a as i32 - *b as i32).abs() <= 2, "{a} vs {b}");
        }
    }

    #[test]
    fn resample_rejects_zero_rate() {
        assert_eq!(
            resample(&[1, 2], 0, 16_000),
            Err(AudioCodecError::BadRate(0, 16_000))
        );
    }

    #[test]
    fn even_length_check() {
        assert!(check_even_length(&[1, 2, 3, 4]).is_ok());
        assert_eq!(check_even_length(&[1, 2, 3]), Err(AudioCodecError::OddLength(3)));
    }
}
