//! Playback stream: sizes each packet from the clock feedback.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{PlaybackCallback, StreamKind, StreamParams, TaskKind};
use crate::feedback::FeedbackFilter;
use crate::transport::IsoTransfer;

/// Playback specialization.
///
/// With feedback available, every packet carries the whole part of the
/// frames the device consumes per packet interval, and a fractional
/// accumulator adds one extra frame whenever it reaches a whole frame. The
/// accumulator carries across transfers, so the long-run frame count tracks
/// the feedback value exactly. Without feedback, packets carry the nominal
/// whole-frame count.
pub(crate) struct DacStream {
    feedback: Option<Arc<FeedbackFilter>>,
    callback: Option<PlaybackCallback>,
    accumulator: f32,
    default_packet_bytes: usize,
}

impl DacStream {
    pub fn new(feedback: Option<Arc<FeedbackFilter>>) -> Self {
        Self {
            feedback,
            callback: None,
            accumulator: 0.0,
            default_packet_bytes: 0,
        }
    }

    pub fn set_callback(&mut self, callback: Option<PlaybackCallback>) {
        self.callback = callback;
    }

    /// Bytes per packet when there is no feedback.
    pub fn default_packet_bytes(&self) -> usize {
        self.default_packet_bytes
    }

    fn fill_nominal(&mut self, params: &StreamParams, transfer: &mut IsoTransfer) {
        let frame = params.frame_bytes().max(1);
        let packet_capacity = transfer.buffer.len() / transfer.packets.len().max(1) / frame * frame;
        let size = self.default_packet_bytes.min(packet_capacity);
        for (i, p) in transfer.packets.iter_mut().enumerate() {
            p.offset = i * size;
            p.length = size;
        }
        let length = (size * transfer.packets.len()).min(transfer.buffer.len());
        transfer.length = length;
        let data = &mut transfer.buffer[..length];
        data.fill(0);
        if let Some(callback) = self.callback.as_mut() {
            callback(data);
        }
    }

    fn fill_adaptive(&mut self, params: &StreamParams, transfer: &mut IsoTransfer, feedback: f32) {
        let frame = params.frame_bytes().max(1);
        let packet_capacity = transfer.buffer.len() / transfer.packets.len().max(1);
        let max_frames = packet_capacity / frame;
        let interval = params.packet_interval as f32;

        // Feedback is in frames per millisecond; eight microframes per ms
        let max_rate = max_frames as f32 * 8.0 / interval;
        let (rate, capped) = if feedback >= max_rate {
            (max_rate, true)
        } else {
            (feedback, false)
        };
        let per_packet = rate * interval / 8.0;
        let whole = (per_packet as usize).min(max_frames);
        let fraction = if capped {
            0.0
        } else {
            per_packet - whole as f32
        };

        let mut offset = 0;
        for p in &mut transfer.packets {
            let mut frames = whole;
            self.accumulator += fraction;
            if self.accumulator >= 1.0 {
                self.accumulator -= 1.0;
                frames += 1;
            }
            let length = frames.min(max_frames) * frame;
            p.offset = offset;
            p.length = length;
            offset += length;
        }
        transfer.length = offset;

        let data = &mut transfer.buffer[..offset];
        match self.callback.as_mut() {
            Some(callback) => callback(data),
            None => data.fill(0),
        }
    }
}

impl StreamKind for DacStream {
    fn kind(&self) -> TaskKind {
        TaskKind::Dac
    }

    fn packet_size(&self, params: &StreamParams, sample_rate: u32) -> usize {
        params.audio_packet_size(sample_rate)
    }

    fn on_sample_rate(&mut self, params: &StreamParams, sample_rate: u32) {
        let frame = params.frame_bytes();
        let frames = params.nominal_frames_per_packet(sample_rate) as usize;
        let cap = params.max_packet_size / frame.max(1) * frame;
        self.default_packet_bytes = frames * frame;
        if cap > 0 && self.default_packet_bytes > cap {
            warn!(
                sample_rate,
                nominal = self.default_packet_bytes,
                max_packet_size = params.max_packet_size,
                "endpoint cannot carry the nominal rate; packets capped"
            );
            self.default_packet_bytes = cap;
        }
    }

    fn fill(&mut self, params: &StreamParams, transfer: &mut IsoTransfer) {
        let value = self.feedback.as_ref().map_or(0.0, |f| f.value());
        if value > 0.0 {
            self.fill_adaptive(params, transfer, value);
        } else {
            self.fill_nominal(params, transfer);
        }
    }

    fn process(&mut self, _params: &StreamParams, _transfer: &mut IsoTransfer) {}

    fn on_start(&mut self, _params: &StreamParams) {
        self.accumulator = 0.0;
        if let Some(feedback) = &self.feedback {
            feedback.clear_statistics();
            debug!("cleared feedback statistics");
        }
    }

    fn on_stop(&mut self, _params: &StreamParams) {
        if let Some(feedback) = &self.feedback {
            info!(
                min = feedback.min(),
                max = feedback.max(),
                "feedback range while streaming"
            );
        }
    }
}
