//! Carrier A: JSON events, mulaw 8 kHz payloads (§4.3).

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::audio::codec::{decode_mulaw, encode_mulaw, resample};
use crate::error::RuntimeError;
use crate::types::AudioFrame;

use super::{AdapterEvent, OutboundWire, ProviderAdapter, WireFrame, EGRESS_RATE_HZ, INGRESS_RATE_HZ};

const CARRIER_A_RATE_HZ: u32 = 8_000;

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum InboundEvent {
    Connected,
    Start {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        #[serde(rename = "callSid")]
        call_sid: String,
    },
    Media {
        media: MediaPayload,
    },
    Mark,
    Stop,
}

#[derive(Debug, Deserialize)]
struct MediaPayload {
    payload: String,
}

#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum OutboundEvent<'a> {
    Media {
        #[serde(rename = "streamSid")]
        stream_sid: &'a str,
        media: OutboundMediaPayload,
    },
}

#[derive(Debug, Serialize)]
struct OutboundMediaPayload {
    payload: String,
}

pub struct CarrierAAdapter {
    stream_sid: Option<String>,
    seq: u32,
}

impl CarrierAAdapter {
    pub fn new() -> Self {
        Self {
            stream_sid: None,
            seq: 0,
        }
    }
}

impl Default for CarrierAAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderAdapter for CarrierAAdapter {
    fn parse(&mut self, wire: WireFrame) -> Result<Vec<AdapterEvent>, RuntimeError> {
        let text = match wire {
            WireFrame::Text(t) => t,
            WireFrame::Binary(_) => return Ok(vec![AdapterEvent::Ignored("carrier a sent unexpected binary frame")]),
        };

        let event: InboundEvent = match serde_json::from_str(&text) {
            Ok(e) => e,
            Err(_) => return Ok(vec![AdapterEvent::Ignored("malformed json")]),
        };

        let events = match event {
            InboundEvent::Connected => vec![AdapterEvent::Connected],
            InboundEvent::Start { stream_sid, call_sid } => {
                self.stream_sid = Some(stream_sid.clone());
                vec![AdapterEvent::StreamStarted {
                    stream_id: stream_sid,
                    call_id: call_sid,
                }]
            }
            InboundEvent::Media { media } => match self.decode_media(&media.payload) {
                Some(frame) => vec![AdapterEvent::Media(frame)],
                None => vec![AdapterEvent::Ignored("malformed media payload")],
            },
            InboundEvent::Mark => vec![AdapterEvent::Mark],
            InboundEvent::Stop => vec![AdapterEvent::Stop { reason: None }],
        };
        Ok(events)
    }

    fn build_outbound_audio(&self, pcm16_24k: &[i16]) -> Result<OutboundWire, RuntimeError> {
        let stream_sid = self
            .stream_sid
            .as_deref()
            .ok_or_else(|| RuntimeError::Protocol("outbound audio before stream start".into()))?;

        let pcm_8k = resample(pcm16_24k, EGRESS_RATE_HZ, CARRIER_A_RATE_HZ)
            .map_err(|e| RuntimeError::Protocol(e.to_string()))?;
        let mulaw = encode_mulaw(&pcm_8k);
        let payload = base64::engine::general_purpose::STANDARD.encode(mulaw);

        let event = OutboundEvent::Media {
            stream_sid,
            media: OutboundMediaPayload { payload },
        };
        let json = serde_json::to_string(&event)?;
        Ok(OutboundWire::Text(json))
    }

    fn carrier_rate_hz(&self) -> u32 {
        CARRIER_A_RATE_HZ
    }
}

impl CarrierAAdapter {
    fn decode_media(&mut self, payload_b64: &str) -> Option<AudioFrame> {
        let raw = base64::engine::general_purpose::STANDARD
            .decode(payload_b64)
            .ok()?;
        let pcm_8k = decode_mulaw(&raw);
        let pcm_16k = resample(&pcm_8k, CARRIER_A_RATE_HZ, INGRESS_RATE_HZ).ok()?;
        self.seq += 1;
        Some(AudioFrame::new(pcm_16k, INGRESS_RATE_HZ, self.seq))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_event_captures_stream_sid() {
        let mut adapter = CarrierAAdapter::new();
        let wire = WireFrame::Text(
            r#"{"event":"start","streamSid":"s1","callSid":"c1"}"#.to_string(),
        );
        let events = adapter.parse(wire).unwrap();
        assert!(matches!(
            &events[0],
            AdapterEvent::StreamStarted { stream_id, call_id }
                if stream_id == "s1" && call_id == "c1"
        ));
        assert_eq!(adapter.stream_sid.as_deref(), Some("s1"));
    }

    #[test]
    fn media_round_trip_produces_ingress_rate_frame() {
        let mut adapter = CarrierAAdapter::new();
        let pcm = vec![100i16; 160];
        let mulaw = encode_mulaw(&pcm);
        let payload = base64::engine::general_purpose::STANDARD.encode(mulaw);
        let wire = WireFrame::Text(format!(r#"{{"event":"media","media":{{"payload":"{payload}"}}}}"#));
        let events = adapter.parse(wire).unwrap();
        match &events[0] {
            AdapterEvent::Media(frame) => assert_eq!(frame.sample_rate, INGRESS_RATE_HZ),
            other => panic!("expected media event, got {other:?}"),
        }
    }

    #[test]
    fn unknown_event_is_ignored_not_errored() {
        let mut adapter = CarrierAAdapter::new();
        let wire = WireFrame::Text(r#"{"event":"totally-unknown"}"#.to_string());
        let events = adapter.parse(wire).unwrap();
        assert!(matches!(events[0], AdapterEvent::Ignored(_)));
    }

    #[test]
    fn malformed_json_is_ignored_not_errored() {
        let mut adapter = CarrierAAdapter::new();
        let wire = WireFrame::Text("{not json".to_string());
        let events = adapter.parse(wire).unwrap();
        assert!(matches!(events[0], AdapterEvent::Ignored(_)));
    }

    #[test]
    fn outbound_audio_without_stream_start_is_protocol_error() {
        let adapter = CarrierAAdapter::new();
        let err = adapter.build_outbound_audio(&[0i16; 10]).unwrap_err();
        assert!(matches!(err, RuntimeError::Protocol(_)));
    }
}
