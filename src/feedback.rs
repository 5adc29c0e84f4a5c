//! Clock feedback filtering.
//!
//! The device reports how many samples per millisecond it is actually
//! consuming, as a fixed-point number. [`FeedbackFilter`] smooths those reports
//! with an exponential moving average and hands the result to the playback
//! task, which sizes its packets from it.
//!
//! One writer (the feedback task, or the capture task when there is no
//! feedback endpoint) and one reader (the playback task) share the filter
//! through an `Arc`. Readers take the lock only long enough to copy the value.

use parking_lot::Mutex;
use tracing::trace;

use crate::config::FeedbackConfig;

/// Divisor that turns a Q16.16 value into a float.
const Q16_16_ONE: f32 = 65536.0;

#[derive(Debug, Default, Clone, Copy)]
struct FilterState {
    value: f32,
    min: f32,
    max: f32,
    nominal: Option<f32>,
    samples: u64,
}

/// A smoothed clock-feedback value in samples per millisecond.
///
/// # Example
///
/// ```
/// use uac2_stream::{FeedbackConfig, FeedbackFilter};
///
/// let filter = FeedbackFilter::new(FeedbackConfig::default());
/// filter.set_nominal(48000);
/// filter.push_raw(48 << 16);
/// assert_eq!(filter.value(), 48.0);
/// assert_eq!(filter.estimated_sample_rate(), 48000.0);
/// ```
#[derive(Debug)]
pub struct FeedbackFilter {
    config: FeedbackConfig,
    state: Mutex<FilterState>,
}

impl Default for FeedbackFilter {
    fn default() -> Self {
        Self::new(FeedbackConfig::default())
    }
}

/// Decodes a Q16.16 feedback word.
pub fn decode_q16_16(raw: u32) -> f32 {
    raw as f32 / Q16_16_ONE
}

/// Widens the payload of a feedback packet to a Q16.16 word.
///
/// Four or more bytes are a little-endian Q16.16 value. Three bytes are the
/// full-speed Q10.14 format, shifted up by two. Two bytes are zero-extended.
/// Anything shorter carries no value.
pub fn decode_feedback_packet(payload: &[u8]) -> Option<u32> {
    match payload.len() {
        0 | 1 => None,
        2 => Some(u32::from(u16::from_le_bytes([payload[0], payload[1]]))),
        3 => Some(u32::from_le_bytes([payload[0], payload[1], payload[2], 0]) << 2),
        _ => Some(u32::from_le_bytes([
            payload[0], payload[1], payload[2], payload[3],
        ])),
    }
}

impl FeedbackFilter {
    /// Creates an empty filter.
    pub fn new(config: FeedbackConfig) -> Self {
        Self {
            config,
            state: Mutex::new(FilterState::default()),
        }
    }

    /// The filter settings.
    pub fn config(&self) -> &FeedbackConfig {
        &self.config
    }

    /// Feeds one raw Q16.16 sample.
    ///
    /// Zero resets the value, which makes the playback task fall back to
    /// nominal packet sizes until the next report arrives. The first sample
    /// after a reset is taken as-is; later samples are averaged in.
    pub fn push_raw(&self, raw: u32) {
        let mut state = self.state.lock();
        if raw == 0 {
            state.value = 0.0;
            return;
        }

        let mut sample = decode_q16_16(raw);
        if let Some(threshold) = self.config.format_detect_threshold {
            let reference = if state.value > 0.0 {
                Some(state.value)
            } else {
                state.nominal
            };
            if let Some(reference) = reference.filter(|r| *r > 0.0) {
                if sample > threshold * reference {
                    trace!(sample, reference, "feedback looks like Q15.17, halving");
                    sample /= 2.0;
                }
            }
        }

        state.value = if state.value == 0.0 {
            sample
        } else {
            (1.0 - self.config.smoothing) * state.value + self.config.smoothing * sample
        };
        state.samples += 1;

        if state.max == 0.0 || state.value > state.max {
            state.max = state.value;
        }
        if state.min == 0.0 || state.value < state.min {
            state.min = state.value;
        }
    }

    /// Drops the current value (same as pushing zero).
    pub fn reset(&self) {
        self.push_raw(0);
    }

    /// The smoothed value; 0.0 means no feedback yet.
    pub fn value(&self) -> f32 {
        self.state.lock().value
    }

    /// Smallest smoothed value since the last [`clear_statistics`](Self::clear_statistics).
    pub fn min(&self) -> f32 {
        self.state.lock().min
    }

    /// Largest smoothed value since the last [`clear_statistics`](Self::clear_statistics).
    pub fn max(&self) -> f32 {
        self.state.lock().max
    }

    /// Samples averaged in since creation.
    pub fn sample_count(&self) -> u64 {
        self.state.lock().samples
    }

    /// Forgets the min/max history.
    pub fn clear_statistics(&self) {
        let mut state = self.state.lock();
        state.min = 0.0;
        state.max = 0.0;
    }

    /// Sets the nominal rate, the reference for format detection before any
    /// sample arrives.
    pub fn set_nominal(&self, sample_rate: u32) {
        self.state.lock().nominal = Some(sample_rate as f32 / 1000.0);
    }

    /// The nominal value in samples per millisecond, if a rate was set.
    pub fn nominal(&self) -> Option<f32> {
        self.state.lock().nominal
    }

    /// The device's sample rate implied by the current value, in Hz.
    pub fn estimated_sample_rate(&self) -> f32 {
        self.value() * 1000.0
    }
}

/// Encodes a samples-per-millisecond value as Q16.16.
pub fn encode_q16_16(samples_per_ms: f32) -> u32 {
    (samples_per_ms * Q16_16_ONE) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sample_initializes() {
        let filter = FeedbackFilter::default();
        filter.push_raw(encode_q16_16(44.1));
        assert!((filter.value() - 44.1).abs() < 1e-3);
        assert_eq!(filter.sample_count(), 1);
    }

    #[test]
    fn test_zero_resets() {
        let filter = FeedbackFilter::default();
        filter.push_raw(48 << 16);
        filter.push_raw(0);
        assert_eq!(filter.value(), 0.0);
        filter.push_raw(47 << 16);
        assert_eq!(filter.value(), 47.0);
    }

    #[test]
    fn test_ema_step() {
        let filter = FeedbackFilter::default();
        filter.push_raw(48 << 16);
        filter.push_raw(49 << 16);
        let expected = 0.98 * 48.0 + 0.02 * 49.0;
        assert!((filter.value() - expected).abs() < 1e-4);
    }

    #[test]
    fn test_converges_to_constant_input() {
        let filter = FeedbackFilter::default();
        filter.set_nominal(48000);
        filter.push_raw(48 << 16);
        let target = encode_q16_16(48.05);
        for _ in 0..1000 {
            filter.push_raw(target);
        }
        assert!((filter.value() - 48.05).abs() < 1e-3);
        assert!((filter.estimated_sample_rate() - 48050.0).abs() < 1.0);
    }

    #[test]
    fn test_min_max_bracket_value() {
        let filter = FeedbackFilter::default();
        for v in [48.0f32, 48.2, 47.9, 48.1, 47.95] {
            filter.push_raw(encode_q16_16(v));
            assert!(filter.min() <= filter.value());
            assert!(filter.value() <= filter.max());
        }
        filter.clear_statistics();
        assert_eq!(filter.min(), 0.0);
        assert_eq!(filter.max(), 0.0);
        filter.push_raw(encode_q16_16(48.0));
        assert_eq!(filter.min(), filter.max());
    }

    #[test]
    fn test_q15_17_detected_against_nominal() {
        let filter = FeedbackFilter::default();
        filter.set_nominal(48000);
        // 48 samples/ms in Q15.17 reads as 96 in Q16.16
        filter.push_raw(48 << 17);
        assert_eq!(filter.value(), 48.0);
    }

    #[test]
    fn test_q15_17_detected_against_smoothed_value() {
        let filter = FeedbackFilter::default();
        filter.push_raw(encode_q16_16(48.0));
        filter.push_raw(48 << 17);
        assert!((filter.value() - 48.0).abs() < 1e-4);

        // Just under 1.5x the current value is taken as Q16.16
        filter.push_raw(encode_q16_16(71.5));
        let expected = 0.98 * 48.0 + 0.02 * 71.5;
        assert!((filter.value() - expected).abs() < 1e-3);
    }

    #[test]
    fn test_detection_disabled() {
        let filter = FeedbackFilter::new(FeedbackConfig {
            format_detect_threshold: None,
            ..Default::default()
        });
        filter.set_nominal(48000);
        filter.push_raw(48 << 17);
        assert_eq!(filter.value(), 96.0);
    }

    #[test]
    fn test_no_reference_no_detection() {
        let filter = FeedbackFilter::default();
        filter.push_raw(48 << 17);
        assert_eq!(filter.value(), 96.0);
    }

    #[test]
    fn test_decode_feedback_packet() {
        assert_eq!(decode_feedback_packet(&[]), None);
        assert_eq!(decode_feedback_packet(&[0x12]), None);
        assert_eq!(decode_feedback_packet(&[0x34, 0x12]), Some(0x1234));
        // 48.0 in Q10.14 is 48 << 14
        let q10_14 = (48u32 << 14).to_le_bytes();
        assert_eq!(
            decode_feedback_packet(&q10_14[..3]),
            Some(48 << 16)
        );
        let q16_16 = (48u32 << 16).to_le_bytes();
        assert_eq!(decode_feedback_packet(&q16_16), Some(48 << 16));
        assert_eq!(decode_feedback_packet(&[0, 0, 0x30, 0, 0xFF]), Some(48 << 16));
    }
}
