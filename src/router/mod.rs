//! Audio Router (C6, §4.6): per-session outbound coordinator sitting
//! between the state machine/hedge engine and the provider adapter.
//!
//! The ring buffer is deliberately single-producer/single-consumer and
//! drops the *oldest* frame on overflow — audio freshness over
//! completeness (§4.6 backpressure, §8 property 8). It does not touch the
//! network itself; `drain_for_adapter` hands frames to whatever the
//! session loop's adapter/egress step is.

use std::collections::VecDeque;
use std::time::Instant;

use crate::audio::codec::{resample, AudioCodecError};
use crate::adapter::EGRESS_RATE_HZ;

/// Bound on the outbound ring. Chosen to hold a few hundred ms of audio at
/// typical frame sizes without growing unbounded under backpressure.
pub const RING_CAPACITY: usize = 64;

#[derive(Debug, Clone, Default)]
pub struct RouterMetrics {
    pub chunks_sent: u64,
    pub chunks_failed: u64,
    pub chunks_dropped: u64,
    pub bytes: u64,
    pub elapsed_ms: u64,
}

/// Blends a still-playing filler clip into the model's first real audio
/// chunk over that one chunk, per §4.5 ("crossfade out the filler over one
/// frame, no hard cut"): the filler's tail fades `1 -> 0` linearly across
/// `incoming`'s length while `incoming` fades `0 -> 1` in lockstep. If the
/// filler is shorter than `incoming`, its last sample holds through the
/// rest of the fade rather than going silent early.
pub fn crossfade(filler: &[i16], incoming: &[i16]) -> Vec<i16> {
    if incoming.is_empty() || filler.is_empty() {
        return incoming.to_vec();
    }
    let len = incoming.len();
    let mut out = Vec::with_capacity(len);
    for (i, &in_sample) in incoming.iter().enumerate() {
        let t = (i + 1) as f32 / len as f32;
        let filler_sample = filler[i.min(filler.len() - 1)] as f32;
        let mixed = filler_sample * (1.0 - t) + (in_sample as f32) * t;
        out.push(mixed.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16);
    }
    out
}

pub struct AudioRouter {
    ring: VecDeque<Vec<i16>>,
    carrier_rate_hz: u32,
    metrics: RouterMetrics,
    started_at: Instant,
}

impl AudioRouter {
    pub fn new(carrier_rate_hz: u32) -> Self {
        Self {
            ring: VecDeque::with_capacity(RING_CAPACITY),
            carrier_rate_hz,
            metrics: RouterMetrics::default(),
            started_at: Instant::now(),
        }
    }

    /// Enqueues one outbound frame at `EGRESS_RATE_HZ`. On overflow, the
    /// oldest frame is discarded, not the new one, and the drop is
    /// counted (§4.6, §8 property 8).
    pub fn enqueue(&mut self, pcm16_24k: Vec<i16>) {
        if self.ring.len() >= RING_CAPACITY {
            self.ring.pop_front();
            self.metrics.chunks_dropped += 1;
        }
        self.ring.push_back(pcm16_24k);
    }

    /// Pops the next queued frame, resampled to the carrier-native rate,
    /// ready to hand to the provider adapter's `build_outbound_audio`.
    pub fn next_outbound(&mut self) -> Option<Result<Vec<i16>, AudioCodecError>> {
        let frame = self.ring.pop_front()?;
        Some(resample(&frame, EGRESS_RATE_HZ, self.carrier_rate_hz))
    }

    pub fn record_sent(&mut self, bytes: usize) {
        self.metrics.chunks_sent += 1;
        self.metrics.bytes += bytes as u64;
    }

    pub fn record_failed(&mut self) {
        self.metrics.chunks_failed += 1;
    }

    pub fn metrics(&self) -> RouterMetrics {
        let mut m = self.metrics.clone();
        m.elapsed_ms = self.started_at.elapsed().as_millis() as u64;
        m
    }

    /// One-line routing summary logged on session end (§4.6).
    pub fn summary_line(&self) -> String {
        let m = self.metrics();
        format!(
            "chunks_sent={} chunks_failed={} chunks_dropped={} bytes={} elapsed_ms={}",
            m.chunks_sent, m.chunks_failed, m.chunks_dropped, m.bytes, m.elapsed_ms
        )
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_beyond_capacity_drops_oldest() {
        let mut router = AudioRouter::new(8_000);
        for i in 0..(RING_CAPACITY + 3) {
            router.enqueue(vec![i as i16]);
        }
        assert_eq!(router.len(), RING_CAPACITY);
        assert_eq!(router.metrics().chunks_dropped, 3);
        // The three oldest (0, 1, 2) should have been evicted.
        let first = router.next_outbound().unwrap().unwrap();
        assert_eq!(first, vec![3]);
    }

    #[test]
    fn next_outbound_resamples_to_carrier_rate() {
        let mut router = AudioRouter::new(8_000);
        router.enqueue(vec![100; 240]); // 10ms @ 24kHz
        let out = router.next_outbound().unwrap().unwrap();
        assert_eq!(out.len(), 80); // 10ms @ 8kHz
    }

    #[test]
    fn crossfade_starts_at_filler_and_ends_at_incoming() {
        let filler = vec![1000i16; 4];
        let incoming = vec![0i16; 4];
        let out = crossfade(&filler, &incoming);
        assert_eq!(out.len(), 4);
        // First sample is mostly filler, last sample is entirely incoming.
        assert!(out[0] > out[3]);
        assert_eq!(out[3], 0);
    }

    #[test]
    fn crossfade_with_empty_filler_returns_incoming_unchanged() {
        let incoming = vec![5i16, 6, 7];
        assert_eq!(crossfade(&[], &incoming), incoming);
    }

    #[test]
    fn crossfade_holds_last_filler_sample_when_shorter_than_incoming() {
        let filler = vec![1000i16];
        let incoming = vec![0i16; 4];
        let out = crossfade(&filler, &incoming);
        assert_eq!(out.len(), 4);
        assert_eq!(out[3], 0);
    }

    #[test]
    fn metrics_track_sent_and_failed() {
        let mut router = AudioRouter::new(8_000);
        router.record_sent(160);
        router.record_failed();
        let m = router.metrics();
        assert_eq!(m.chunks_sent, 1);
        assert_eq!(m.chunks_failed, 1);
        assert_eq!(m.bytes, 160);
    }
}
