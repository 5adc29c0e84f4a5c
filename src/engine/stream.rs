//! The generic transfer engine and the per-stream specialization seam.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, trace, warn};

use super::{ErrorRegister, EventSink, TaskCounters, TaskKind, TransferRing};
use crate::error::{TransportError, Uac2Error};
use crate::event::DeviceEvent;
use crate::transport::{IsoTransfer, UsbTransport};

/// Static description of the endpoint a task streams on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StreamParams {
    /// Endpoint address.
    pub endpoint: u8,
    /// wMaxPacketSize.
    pub max_packet_size: usize,
    /// Microframes between packets, 2^(bInterval - 1).
    pub packet_interval: u32,
    /// Channels per frame.
    pub channels: u8,
    /// Bytes per channel sample.
    pub subslot_size: u8,
    /// Packets per transfer.
    pub packets_per_transfer: usize,
}

impl StreamParams {
    /// Bytes per audio frame. Also the per-transfer frame-number stride.
    pub fn frame_bytes(&self) -> usize {
        usize::from(self.channels) * usize::from(self.subslot_size)
    }

    /// Frames per packet at the nominal rate, with the fraction kept.
    pub fn nominal_frames_per_packet(&self, sample_rate: u32) -> f32 {
        sample_rate as f32 / 8000.0 * self.packet_interval as f32
    }

    /// Packet size for audio data: one frame more than nominal, capped at
    /// the endpoint's max packet size rounded down to whole frames.
    pub fn audio_packet_size(&self, sample_rate: u32) -> usize {
        let frame = self.frame_bytes().max(1);
        let wanted = frame * (self.nominal_frames_per_packet(sample_rate) as usize + 1);
        let cap = self.max_packet_size / frame * frame;
        if cap == 0 {
            wanted
        } else {
            wanted.min(cap)
        }
    }
}

/// What one stream does with its transfers.
///
/// The engine owns the ring and the transport calls; implementations only
/// decide packet layout and what happens to completed data.
pub(crate) trait StreamKind: Send + 'static {
    /// Which task this is.
    fn kind(&self) -> TaskKind;

    /// Packet size to allocate for `sample_rate`.
    fn packet_size(&self, params: &StreamParams, sample_rate: u32) -> usize;

    /// Lays out the packet table and sets `transfer.length`.
    fn fill(&mut self, params: &StreamParams, transfer: &mut IsoTransfer);

    /// Handles a completed transfer.
    fn process(&mut self, params: &StreamParams, transfer: &mut IsoTransfer);

    /// Called on start, after the ring is reset.
    fn on_start(&mut self, _params: &StreamParams) {}

    /// Called on stop, after outstanding transfers are cancelled.
    fn on_stop(&mut self, _params: &StreamParams) {}

    /// Called after buffers are sized for a new rate.
    fn on_sample_rate(&mut self, _params: &StreamParams, _sample_rate: u32) {}
}

/// Result of one work quantum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Quantum {
    /// The oldest transfer completed and was processed.
    Completed,
    /// The wait timed out; the transfer stays in flight.
    TimedOut,
    /// Nothing was in flight.
    Idle,
    /// A transport error halted the engine until the next start.
    Fatal(TransportError),
}

/// Ring, transport and stream specialization for one task.
pub(crate) struct TransferEngine<K> {
    kind: K,
    params: StreamParams,
    ring: TransferRing,
    capacity: usize,
    transport: Arc<dyn UsbTransport>,
    errors: ErrorRegister,
    events: EventSink,
    counters: Arc<TaskCounters>,
    completion_timeout: Duration,
    sample_rate: Option<u32>,
    frame_number: u32,
    halted: bool,
}

impl<K: StreamKind> TransferEngine<K> {
    pub fn new(
        kind: K,
        params: StreamParams,
        capacity: usize,
        transport: Arc<dyn UsbTransport>,
        errors: ErrorRegister,
        events: EventSink,
        completion_timeout: Duration,
    ) -> Self {
        Self {
            kind,
            params,
            ring: TransferRing::new(),
            capacity,
            transport,
            errors,
            events,
            counters: Arc::new(TaskCounters::default()),
            completion_timeout,
            sample_rate: None,
            frame_number: 0,
            halted: false,
        }
    }

    pub fn task(&self) -> TaskKind {
        self.kind.kind()
    }

    pub fn params(&self) -> &StreamParams {
        &self.params
    }

    pub fn stream(&mut self) -> &mut K {
        &mut self.kind
    }

    pub fn counters(&self) -> Arc<TaskCounters> {
        Arc::clone(&self.counters)
    }

    #[cfg(test)]
    pub fn ring(&self) -> &TransferRing {
        &self.ring
    }

    #[cfg(test)]
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Sizes the ring for `sample_rate`. The caller guarantees the task is
    /// not started.
    pub fn resize(&mut self, sample_rate: u32) -> Result<(), Uac2Error> {
        let packet_size = self.kind.packet_size(&self.params, sample_rate);
        if self.ring.is_allocated()
            && self.sample_rate == Some(sample_rate)
            && self.ring.packet_size() == packet_size
        {
            return Ok(());
        }
        if !self
            .ring
            .allocate(self.capacity, self.params.packets_per_transfer, packet_size)
        {
            return Err(Uac2Error::TaskRunning {
                task: self.task().to_string(),
            });
        }
        self.sample_rate = Some(sample_rate);
        self.kind.on_sample_rate(&self.params, sample_rate);
        debug!(
            task = %self.task(),
            sample_rate,
            packet_size,
            packets = self.params.packets_per_transfer,
            slots = self.capacity,
            "allocated transfer buffers"
        );
        Ok(())
    }

    /// Drops the transfer buffers if nothing is in flight.
    pub fn release_buffers(&mut self) {
        if !self.ring.free() {
            warn!(task = %self.task(), "transfers still in flight, buffers kept");
        }
    }

    /// Resets the ring and counters and runs the start hook.
    pub fn prepare_start(&mut self) -> Result<(), Uac2Error> {
        if !self.ring.is_allocated() {
            return Err(Uac2Error::BuffersNotAllocated {
                task: self.task().to_string(),
            });
        }
        self.counters.reset();
        self.frame_number = 0;
        self.halted = false;
        self.ring.reset_cursors();
        self.ring.fill_sentinel();
        if let Err(e) = self.transport.reset_pipe(self.params.endpoint) {
            warn!(task = %self.task(), endpoint = self.params.endpoint, error = %e, "pipe reset failed");
        }
        self.kind.on_start(&self.params);
        Ok(())
    }

    /// Aborts the pipe, cancels outstanding transfers oldest first, clears
    /// the error register and runs the stop hook.
    pub fn shutdown(&mut self) -> usize {
        if let Err(e) = self.transport.abort_pipe(self.params.endpoint) {
            warn!(task = %self.task(), endpoint = self.params.endpoint, error = %e, "pipe abort failed");
        }
        let cancelled = self.ring.cancel_all();
        self.errors.clear();
        self.halted = false;
        self.kind.on_stop(&self.params);
        cancelled
    }

    /// Puts vacant slots back after a panic interrupted a quantum.
    pub fn recover(&mut self) {
        self.ring.repair();
    }

    /// One work quantum: submit into every free slot, then wait for the
    /// oldest transfer.
    pub fn work(&mut self) -> Quantum {
        if self.halted {
            return Quantum::Idle;
        }

        while self.ring.can_submit() && !self.errors.is_set() {
            let Some(mut transfer) = self.ring.take_next() else {
                break;
            };
            self.kind.fill(&self.params, &mut transfer);
            transfer.start_frame = self.frame_number;

            match self.transport.submit_iso(self.params.endpoint, transfer) {
                Ok(pending) => {
                    self.frame_number = self
                        .frame_number
                        .wrapping_add(self.params.frame_bytes() as u32);
                    self.ring.mark_in_flight(pending);
                    self.counters.record_submitted();
                }
                Err(rejected) => {
                    self.ring.put_back(rejected.transfer);
                    return self.fail(rejected.error, "submission failed");
                }
            }
        }

        let timeout = self.completion_timeout;
        let Some(pending) = self.ring.oldest_mut() else {
            return Quantum::Idle;
        };
        match pending.wait(timeout) {
            Ok(()) => {}
            Err(e) if e.is_timeout() => {
                trace!(task = %self.task(), "completion wait timed out");
                return Quantum::TimedOut;
            }
            Err(e) => return self.fail(e, "transfer failed"),
        }

        let Some(pending) = self.ring.take_oldest() else {
            return Quantum::Idle;
        };
        let mut transfer = pending.complete();
        self.kind.process(&self.params, &mut transfer);
        self.counters.record_completed(transfer.start_frame);
        self.ring.finish_oldest(transfer);
        Quantum::Completed
    }

    fn fail(&mut self, error: TransportError, what: &str) -> Quantum {
        error!(
            task = %self.task(),
            endpoint = self.params.endpoint,
            error = %error,
            "{what}; task halted until stopped"
        );
        self.errors.record(error.clone());
        self.halted = true;
        self.events.emit(DeviceEvent::TransferFailed {
            task: self.task(),
            error: error.clone(),
        });
        Quantum::Fatal(error)
    }
}
