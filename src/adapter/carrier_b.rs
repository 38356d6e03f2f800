//! Carrier B: framed JSON plus raw binary PCM 44.1 kHz (§4.3).
//!
//! Frame-type detection is the fragile first-byte sniff the design notes
//! flag as an open question: anything not starting with `{` or `[` is
//! treated as raw PCM. It is isolated to `parse` so a future sub-protocol
//! negotiation only has to change this one function.

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::audio::codec::{check_even_length, resample};
use crate::error::RuntimeError;
use crate::types::AudioFrame;

use super::{AdapterEvent, OutboundWire, ProviderAdapter, WireFrame, EGRESS_RATE_HZ, INGRESS_RATE_HZ};

const CARRIER_B_RATE_HZ: u32 = 44_100;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InboundEvent {
    Answer {
        #[serde(rename = "streamId")]
        stream_id: String,
        #[serde(rename = "channelId")]
        #[allow(dead_code)]
        channel_id: String,
        #[serde(rename = "callId")]
        call_id: String,
    },
    Start {
        #[serde(rename = "mediaFormat")]
        #[allow(dead_code)]
        media_format: Option<serde_json::Value>,
    },
    Media {
        #[allow(dead_code)]
        chunk: Option<u64>,
        payload: String,
    },
    Dtmf {
        digit: String,
        #[serde(rename = "durationMs")]
        duration_ms: u64,
    },
    Stop {
        #[serde(rename = "disconnectedBy")]
        #[allow(dead_code)]
        disconnected_by: Option<String>,
        #[serde(rename = "callId")]
        #[allow(dead_code)]
        call_id: Option<String>,
        #[allow(dead_code)]
        timestamp: Option<i64>,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutboundEvent {
    AnswerAck,
    Media { payload: String },
}

pub struct CarrierBAdapter {
    stream_id: Option<String>,
    seq: u32,
}

impl CarrierBAdapter {
    pub fn new() -> Self {
        Self {
            stream_id: None,
            seq: 0,
        }
    }

    /// True when the raw byte stream (not JSON-wrapped) should be treated
    /// as linear PCM44.1k, per the first-byte sniff in §4.3/§9.
    fn is_raw_pcm(bytes: &[u8]) -> bool {
        match bytes.first() {
            Some(b'{') | Some(b'[') => false,
            _ => true,
        }
    }

    fn decode_pcm_bytes(&mut self, bytes: &[i16]) -> AudioFrame {
        let pcm_16k = resample(bytes, CARRIER_B_RATE_HZ, INGRESS_RATE_HZ).unwrap_or_else(|_| bytes.to_vec());
        self.seq += 1;
        AudioFrame::new(pcm_16k, INGRESS_RATE_HZ, self.seq)
    }
}

impl Default for CarrierBAdapter {
    fn default() -> Self {
        Self::new()
    }
}

fn i16_le_from_bytes(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect()
}

/// Validates §4.1's "input length must be even" constraint before decoding
/// raw little-endian PCM16 bytes, rather than letting `chunks_exact(2)`
/// silently drop a trailing odd byte.
fn decode_pcm_bytes_checked(bytes: &[u8]) -> Result<Vec<i16>, crate::audio::codec::AudioCodecError> {
    check_even_length(bytes)?;
    Ok(i16_le_from_bytes(bytes))
}

fn i16_le_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

impl ProviderAdapter for CarrierBAdapter {
    fn parse(&mut self, wire: WireFrame) -> Result<Vec<AdapterEvent>, RuntimeError> {
        match wire {
            WireFrame::Binary(bytes) if Self::is_raw_pcm(&bytes) => {
                match decode_pcm_bytes_checked(&bytes) {
                    Ok(pcm) => Ok(vec![AdapterEvent::Media(self.decode_pcm_bytes(&pcm))]),
                    Err(_) => Ok(vec![AdapterEvent::Ignored("odd-length raw pcm frame")]),
                }
            }
            WireFrame::Binary(bytes) => self.parse_json_bytes(&bytes),
            WireFrame::Text(text) => self.parse_json_bytes(text.as_bytes()),
        }
    }

    fn build_outbound_audio(&self, pcm16_24k: &[i16]) -> Result<OutboundWire, RuntimeError> {
        let pcm_44k = resample(pcm16_24k, EGRESS_RATE_HZ, CARRIER_B_RATE_HZ)
            .map_err(|e| RuntimeError::Protocol(e.to_string()))?;
        let payload = base64::engine::general_purpose::STANDARD.encode(i16_le_to_bytes(&pcm_44k));
        let event = OutboundEvent::Media { payload };
        Ok(OutboundWire::Text(serde_json::to_string(&event)?))
    }

    fn carrier_rate_hz(&self) -> u32 {
        CARRIER_B_RATE_HZ
    }
}

impl CarrierBAdapter {
    fn parse_json_bytes(&mut self, bytes: &[u8]) -> Result<Vec<AdapterEvent>, RuntimeError> {
        let text = match std::str::from_utf8(bytes) {
            Ok(t) => t,
            Err(_) => return Ok(vec![AdapterEvent::Ignored("non-utf8 frame, not raw pcm")]),
        };

        let event: InboundEvent = match serde_json::from_str(text) {
            Ok(e) => e,
            Err(_) => return Ok(vec![AdapterEvent::Ignored("malformed json")]),
        };

        let events = match event {
            InboundEvent::Answer { stream_id, call_id, .. } => {
                self.stream_id = Some(stream_id.clone());
                let ack = serde_json::to_string(&OutboundEvent::AnswerAck)?;
                vec![
                    AdapterEvent::StreamStarted {
                        stream_id,
                        call_id,
                    },
                    AdapterEvent::AckRequired(OutboundWire::Text(ack)),
                ]
            }
            InboundEvent::Start { .. } => vec![AdapterEvent::Connected],
            InboundEvent::Media { payload, .. } => {
                let raw = base64::engine::general_purpose::STANDARD
                    .decode(payload)
                    .unwrap_or_default();
                match decode_pcm_bytes_checked(&raw) {
                    Ok(pcm) => vec![AdapterEvent::Media(self.decode_pcm_bytes(&pcm))],
                    Err(_) => vec![AdapterEvent::Ignored("odd-length media payload")],
                }
            }
            InboundEvent::Dtmf { digit, duration_ms } => {
                match digit.chars().next() {
                    Some(d) => vec![AdapterEvent::Dtmf { digit: d, duration_ms }],
                    None => vec![AdapterEvent::Ignored("empty dtmf digit")],
                }
            }
            InboundEvent::Stop { .. } => vec![AdapterEvent::Stop { reason: None }],
        };
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn answer_frame_requires_immediate_ack() {
        let mut adapter = CarrierBAdapter::new();
        let wire = WireFrame::Text(
            r#"{"type":"answer","streamId":"s1","channelId":"c1","callId":"call1"}"#.to_string(),
        );
        let events = adapter.parse(wire).unwrap();
        assert!(matches!(events[0], AdapterEvent::StreamStarted { .. }));
        assert!(matches!(events[1], AdapterEvent::AckRequired(_)));
    }

    #[test]
    fn raw_binary_frame_is_treated_as_pcm() {
        let mut adapter = CarrierBAdapter::new();
        let pcm: Vec<i16> = vec![1000, -1000, 2000, -2000];
        let bytes = i16_le_to_bytes(&pcm);
        assert!(CarrierBAdapter::is_raw_pcm(&bytes));
        let events = adapter.parse(WireFrame::Binary(bytes)).unwrap();
        assert!(matches!(events[0], AdapterEvent::Media(_)));
    }

    #[test]
    fn json_wrapped_binary_frame_is_not_raw_pcm() {
        let json = br#"{"type":"stop"}"#.to_vec();
        assert!(!CarrierBAdapter::is_raw_pcm(&json));
    }

    #[test]
    fn odd_length_raw_binary_frame_is_ignored_not_truncated() {
        let mut adapter = CarrierBAdapter::new();
        let bytes = vec![0x01, 0x02, 0x03]; // 3 bytes: not a whole number of i16 samples
        assert!(CarrierBAdapter::is_raw_pcm(&bytes));
        let events = adapter.parse(WireFrame::Binary(bytes)).unwrap();
        assert!(matches!(events[0], AdapterEvent::Ignored(_)));
    }

    #[test]
    fn odd_length_media_payload_is_ignored_not_truncated() {
        let mut adapter = CarrierBAdapter::new();
        let raw = vec![0x01, 0x02, 0x03];
        let payload = base64::engine::general_purpose::STANDARD.encode(&raw);
        let wire = WireFrame::Text(format!(r#"{{"type":"media","payload":"{payload}"}}"#));
        let events = adapter.parse(wire).unwrap();
        assert!(matches!(events[0], AdapterEvent::Ignored(_)));
    }

    #[test]
    fn dtmf_event_carries_digit_and_duration() {
        let mut adapter = CarrierBAdapter::new();
        let wire = WireFrame::Text(r#"{"type":"dtmf","digit":"5","durationMs":120}"#.to_string());
        let events = adapter.parse(wire).unwrap();
        assert!(matches!(events[0], AdapterEvent::Dtmf { digit: '5', duration_ms: 120 }));
    }
}
