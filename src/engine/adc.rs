//! Capture stream.

use std::sync::Arc;

use super::{CaptureCallback, StreamKind, StreamParams, TaskKind};
use crate::feedback::FeedbackFilter;
use crate::transport::IsoTransfer;

/// Capture specialization.
///
/// Completed transfers are compacted so the payloads of all packets sit back
/// to back at the start of the buffer, then handed to the callback. When
/// wired to the feedback filter (no explicit feedback endpoint), the captured
/// frame count per transfer becomes an implicit feedback sample.
pub(crate) struct AdcStream {
    feedback: Option<Arc<FeedbackFilter>>,
    callback: Option<CaptureCallback>,
}

impl AdcStream {
    pub fn new(feedback: Option<Arc<FeedbackFilter>>) -> Self {
        Self {
            feedback,
            callback: None,
        }
    }

    pub fn set_callback(&mut self, callback: Option<CaptureCallback>) {
        self.callback = callback;
    }
}

/// Moves every packet's payload down so they are contiguous from offset 0.
///
/// Returns the compacted length.
pub(crate) fn compact_packets(transfer: &mut IsoTransfer) -> usize {
    let mut written = 0;
    let len = transfer.buffer.len();
    for p in &transfer.packets {
        let start = p.offset.min(len);
        let n = p.actual_length.min(p.length).min(len - start);
        if n > 0 && start != written {
            transfer.buffer.copy_within(start..start + n, written);
        }
        written += n;
    }
    written
}

/// Implicit feedback from a capture transfer, as Q16.16 frames per ms.
pub(crate) fn implicit_feedback(frames: usize, packets: usize, packet_interval: u32) -> u32 {
    let denominator = packets as u64 * u64::from(packet_interval);
    if denominator == 0 {
        return 0;
    }
    let raw = frames as u64 * 65536 * 8 / denominator;
    u32::try_from(raw).unwrap_or(u32::MAX)
}

impl StreamKind for AdcStream {
    fn kind(&self) -> TaskKind {
        TaskKind::Adc
    }

    fn packet_size(&self, params: &StreamParams, sample_rate: u32) -> usize {
        params.audio_packet_size(sample_rate)
    }

    fn fill(&mut self, _params: &StreamParams, transfer: &mut IsoTransfer) {
        let size = transfer.buffer.len() / transfer.packets.len().max(1);
        transfer.set_uniform_packets(size);
    }

    fn process(&mut self, params: &StreamParams, transfer: &mut IsoTransfer) {
        let recorded = compact_packets(transfer);
        if let Some(callback) = self.callback.as_mut() {
            callback(&transfer.buffer[..recorded]);
        }
        if let Some(feedback) = &self.feedback {
            let frames = recorded / params.frame_bytes().max(1);
            let raw = implicit_feedback(frames, transfer.packets.len(), params.packet_interval);
            // Zero would reset the filter
            if raw > 0 {
                feedback.push_raw(raw);
            }
        }
    }

    fn on_start(&mut self, _params: &StreamParams) {
        if let Some(feedback) = &self.feedback {
            feedback.reset();
        }
    }
}
