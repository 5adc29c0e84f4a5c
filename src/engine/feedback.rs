//! Explicit feedback stream.

use std::sync::Arc;

use tracing::trace;

use super::{StreamKind, StreamParams, TaskKind};
use crate::feedback::{decode_feedback_packet, FeedbackFilter};
use crate::transport::IsoTransfer;

/// Reads the device's feedback endpoint into the filter.
///
/// Only the last packet of each transfer is interpreted; it is the most
/// recent report.
pub(crate) struct FeedbackStream {
    filter: Arc<FeedbackFilter>,
}

impl FeedbackStream {
    pub fn new(filter: Arc<FeedbackFilter>) -> Self {
        Self { filter }
    }
}

impl StreamKind for FeedbackStream {
    fn kind(&self) -> TaskKind {
        TaskKind::Feedback
    }

    fn packet_size(&self, params: &StreamParams, _sample_rate: u32) -> usize {
        params.max_packet_size
    }

    fn fill(&mut self, _params: &StreamParams, transfer: &mut IsoTransfer) {
        let size = transfer.buffer.len() / transfer.packets.len().max(1);
        transfer.set_uniform_packets(size);
    }

    fn process(&mut self, _params: &StreamParams, transfer: &mut IsoTransfer) {
        let Some(last) = transfer.packets.last() else {
            return;
        };
        let start = last.offset.min(transfer.buffer.len());
        let end = (start + last.actual_length.min(last.length)).min(transfer.buffer.len());
        if let Some(raw) = decode_feedback_packet(&transfer.buffer[start..end]) {
            trace!(raw, bytes = end - start, "feedback report");
            self.filter.push_raw(raw);
        }
    }

    fn on_start(&mut self, _params: &StreamParams) {
        self.filter.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> StreamParams {
        StreamParams {
            endpoint: 0x81,
            max_packet_size: 4,
            packet_interval: 8,
            channels: 1,
            subslot_size: 4,
            packets_per_transfer: 8,
        }
    }

    fn transfer_with_last(payload: &[u8]) -> IsoTransfer {
        let mut t = IsoTransfer::new(8, 4, 0);
        t.set_uniform_packets(4);
        let last = t.packets[7];
        t.buffer[last.offset..last.offset + payload.len()].copy_from_slice(payload);
        t.packets[7].actual_length = payload.len();
        t
    }

    #[test]
    fn test_packet_size_is_max_packet() {
        let stream = FeedbackStream::new(Arc::new(FeedbackFilter::default()));
        assert_eq!(stream.packet_size(&params(), 48000), 4);
    }

    #[test]
    fn test_reads_last_packet_q16_16() {
        let filter = Arc::new(FeedbackFilter::default());
        let mut stream = FeedbackStream::new(Arc::clone(&filter));
        let mut t = transfer_with_last(&(48u32 << 16).to_le_bytes());
        stream.process(&params(), &mut t);
        assert_eq!(filter.value(), 48.0);
    }

    #[test]
    fn test_reads_three_byte_format() {
        let filter = Arc::new(FeedbackFilter::default());
        let mut stream = FeedbackStream::new(Arc::clone(&filter));
        let q10_14 = (44u32 << 14).to_le_bytes();
        let mut t = transfer_with_last(&q10_14[..3]);
        stream.process(&params(), &mut t);
        assert_eq!(filter.value(), 44.0);
    }

    #[test]
    fn test_short_last_packet_ignored() {
        let filter = Arc::new(FeedbackFilter::default());
        let mut stream = FeedbackStream::new(Arc::clone(&filter));
        let mut t = transfer_with_last(&[7]);
        // Earlier packets carry data but are not looked at
        t.packets[0].actual_length = 4;
        t.buffer[..4].copy_from_slice(&(48u32 << 16).to_le_bytes());
        stream.process(&params(), &mut t);
        assert_eq!(filter.value(), 0.0);
    }

    #[test]
    fn test_start_resets_filter() {
        let filter = Arc::new(FeedbackFilter::default());
        filter.push_raw(48 << 16);
        let mut stream = FeedbackStream::new(Arc::clone(&filter));
        stream.on_start(&params());
        assert_eq!(filter.value(), 0.0);
    }
}
