//! In-memory transport for testing without hardware.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::{IsoTransfer, PendingTransfer, SubmitError, UsbTransport};
use crate::descriptor::{
    encode_range_response, ControlSetup, SampleRateRange, CS_SAM_FREQ_CONTROL, CUR, RANGE,
};
use crate::error::TransportError;

/// Submissions kept for inspection; later ones are only counted.
const RECORD_LIMIT: usize = 16_384;

type InHandler = Box<dyn FnMut(&mut IsoTransfer) + Send>;

/// A control request seen by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRecord {
    /// The setup packet.
    pub setup: ControlSetup,
    /// Payload sent (OUT requests only).
    pub data: Vec<u8>,
}

/// An isochronous submission seen by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionRecord {
    /// Endpoint address.
    pub endpoint: u8,
    /// Frame number stamped by the engine.
    pub start_frame: u32,
    /// Requested length of each packet.
    pub packet_lengths: Vec<usize>,
    /// Transfer length in bytes.
    pub length: usize,
    /// Bytes sent (OUT endpoints only).
    pub data: Vec<u8>,
}

#[derive(Default)]
struct MockState {
    descriptor: Vec<u8>,
    clock_ranges: HashMap<u8, Vec<SampleRateRange>>,
    clock_rates: HashMap<u8, u32>,
    set_rate_length: Option<usize>,
    controls: Vec<ControlRecord>,
    claimed: Vec<u8>,
    alt_settings: Vec<(u8, u8)>,
    reset_pipes: Vec<u8>,
    aborted_pipes: Vec<u8>,
    submissions: Vec<SubmissionRecord>,
    submitted: HashMap<u8, u64>,
    pending: usize,
    cancelled: u64,
    submit_failures: VecDeque<(u8, TransportError)>,
    wait_timeouts: usize,
    wait_failures: VecDeque<TransportError>,
    in_handlers: HashMap<u8, InHandler>,
    completion_delay: Duration,
    disconnected: bool,
}

/// A [`UsbTransport`] that keeps everything in memory.
///
/// Clones share state, so a test can hand one clone to
/// [`UacDevice`](crate::UacDevice) and inspect another. IN transfers complete
/// with empty packets unless a handler is installed with
/// [`MockTransport::set_in_handler`]; OUT transfers complete with every byte
/// sent. Each completion wait sleeps for the completion delay (1ms by
/// default) to pace the worker threads like a real bus.
///
/// # Example
///
/// ```
/// use uac2_stream::descriptor::{ConfigDescriptorBuilder, SampleRateRange};
/// use uac2_stream::MockTransport;
///
/// let descriptor = ConfigDescriptorBuilder::new()
///     .control_interface(0)
///     .header(0x0200)
///     .clock_source(5, 0x01, 0x07)
///     .build();
///
/// let mock = MockTransport::new(descriptor)
///     .with_clock(5, vec![SampleRateRange::discrete(48000)], 48000);
/// assert_eq!(mock.clock_rate(5), Some(48000));
/// ```
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MockTransport")
            .field("descriptor_len", &state.descriptor.len())
            .field("pending", &state.pending)
            .field("disconnected", &state.disconnected)
            .finish()
    }
}

impl MockTransport {
    /// Creates a mock device with the given configuration descriptor.
    pub fn new(descriptor: Vec<u8>) -> Self {
        let state = MockState {
            descriptor,
            completion_delay: Duration::from_millis(1),
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Declares the RANGE answer and current rate of a clock source.
    pub fn with_clock(self, clock_id: u8, ranges: Vec<SampleRateRange>, current: u32) -> Self {
        {
            let mut state = self.state.lock();
            state.clock_ranges.insert(clock_id, ranges);
            state.clock_rates.insert(clock_id, current);
        }
        self
    }

    /// Sets how long each completion wait takes.
    pub fn with_completion_delay(self, delay: Duration) -> Self {
        self.state.lock().completion_delay = delay;
        self
    }

    /// Overrides the byte count reported for sample-rate CUR writes.
    pub fn set_rate_write_length(&self, length: Option<usize>) {
        self.state.lock().set_rate_length = length;
    }

    /// Fills every IN transfer on `endpoint` through `handler` at completion.
    pub fn set_in_handler<F>(&self, endpoint: u8, handler: F)
    where
        F: FnMut(&mut IsoTransfer) + Send + 'static,
    {
        self.state
            .lock()
            .in_handlers
            .insert(endpoint, Box::new(handler));
    }

    /// Answers every packet on a feedback endpoint with `value`.
    pub fn set_feedback(&self, endpoint: u8, value: Vec<u8>) {
        self.set_in_handler(endpoint, move |transfer| {
            for packet in &mut transfer.packets {
                let n = value.len().min(packet.length);
                let start = packet.offset;
                transfer.buffer[start..start + n].copy_from_slice(&value[..n]);
                packet.actual_length = n;
            }
        });
    }

    /// The next submission on `endpoint` is refused with `error`.
    pub fn fail_next_submit(&self, endpoint: u8, error: TransportError) {
        self.state
            .lock()
            .submit_failures
            .push_back((endpoint, error));
    }

    /// The next `count` completion waits (any endpoint) time out.
    pub fn time_out_next_waits(&self, count: usize) {
        self.state.lock().wait_timeouts += count;
    }

    /// The next completion wait (any endpoint) fails with `error`.
    pub fn fail_next_wait(&self, error: TransportError) {
        self.state.lock().wait_failures.push_back(error);
    }

    /// Every later operation fails with [`TransportError::Disconnected`].
    pub fn disconnect(&self) {
        self.state.lock().disconnected = true;
    }

    /// Current sample rate of a clock source.
    pub fn clock_rate(&self, clock_id: u8) -> Option<u32> {
        self.state.lock().clock_rates.get(&clock_id).copied()
    }

    /// Every control request so far.
    pub fn controls(&self) -> Vec<ControlRecord> {
        self.state.lock().controls.clone()
    }

    /// Interfaces currently claimed.
    pub fn claimed_interfaces(&self) -> Vec<u8> {
        self.state.lock().claimed.clone()
    }

    /// Every (interface, alternate) selection so far.
    pub fn alt_settings(&self) -> Vec<(u8, u8)> {
        self.state.lock().alt_settings.clone()
    }

    /// Pipes reset so far, in order.
    pub fn reset_pipes(&self) -> Vec<u8> {
        self.state.lock().reset_pipes.clone()
    }

    /// Pipes aborted so far, in order.
    pub fn aborted_pipes(&self) -> Vec<u8> {
        self.state.lock().aborted_pipes.clone()
    }

    /// Recorded submissions on `endpoint`.
    pub fn submissions(&self, endpoint: u8) -> Vec<SubmissionRecord> {
        self.state
            .lock()
            .submissions
            .iter()
            .filter(|s| s.endpoint == endpoint)
            .cloned()
            .collect()
    }

    /// Total submissions accepted on `endpoint`, recorded or not.
    pub fn submitted_count(&self, endpoint: u8) -> u64 {
        self.state
            .lock()
            .submitted
            .get(&endpoint)
            .copied()
            .unwrap_or(0)
    }

    /// Transfers the mock currently owns.
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending
    }

    /// Transfers cancelled so far.
    pub fn cancelled_count(&self) -> u64 {
        self.state.lock().cancelled
    }

    fn check_connected(state: &MockState) -> Result<(), TransportError> {
        if state.disconnected {
            Err(TransportError::Disconnected)
        } else {
            Ok(())
        }
    }
}

impl UsbTransport for MockTransport {
    fn config_descriptor(&self) -> Result<Vec<u8>, TransportError> {
        let state = self.state.lock();
        Self::check_connected(&state)?;
        Ok(state.descriptor.clone())
    }

    fn control_in(&self, setup: ControlSetup, buf: &mut [u8]) -> Result<usize, TransportError> {
        let mut state = self.state.lock();
        Self::check_connected(&state)?;
        state.controls.push(ControlRecord {
            setup,
            data: Vec::new(),
        });
        if setup.selector() != CS_SAM_FREQ_CONTROL {
            return Err(TransportError::Stall);
        }
        let payload = match setup.request {
            RANGE => state
                .clock_ranges
                .get(&setup.entity())
                .map(|ranges| encode_range_response(ranges)),
            CUR => state
                .clock_rates
                .get(&setup.entity())
                .map(|rate| rate.to_le_bytes().to_vec()),
            _ => None,
        }
        .ok_or(TransportError::Stall)?;
        let n = payload.len().min(buf.len());
        buf[..n].copy_from_slice(&payload[..n]);
        Ok(n)
    }

    fn control_out(&self, setup: ControlSetup, data: &[u8]) -> Result<usize, TransportError> {
        let mut state = self.state.lock();
        Self::check_connected(&state)?;
        state.controls.push(ControlRecord {
            setup,
            data: data.to_vec(),
        });
        if setup.request != CUR || setup.selector() != CS_SAM_FREQ_CONTROL {
            return Err(TransportError::Stall);
        }
        if !state.clock_rates.contains_key(&setup.entity()) || data.len() < 4 {
            return Err(TransportError::Stall);
        }
        let rate = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        state.clock_rates.insert(setup.entity(), rate);
        Ok(state.set_rate_length.unwrap_or(data.len()))
    }

    fn claim_interface(&self, interface: u8) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        Self::check_connected(&state)?;
        if !state.claimed.contains(&interface) {
            state.claimed.push(interface);
        }
        Ok(())
    }

    fn release_interface(&self, interface: u8) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.claimed.retain(|&i| i != interface);
        Ok(())
    }

    fn set_alt_setting(&self, interface: u8, alternate: u8) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        Self::check_connected(&state)?;
        state.alt_settings.push((interface, alternate));
        Ok(())
    }

    fn reset_pipe(&self, endpoint: u8) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        Self::check_connected(&state)?;
        state.reset_pipes.push(endpoint);
        Ok(())
    }

    fn abort_pipe(&self, endpoint: u8) -> Result<(), TransportError> {
        self.state.lock().aborted_pipes.push(endpoint);
        Ok(())
    }

    fn submit_iso(
        &self,
        endpoint: u8,
        transfer: IsoTransfer,
    ) -> Result<Box<dyn PendingTransfer>, SubmitError> {
        let mut state = self.state.lock();
        if state.disconnected {
            return Err(SubmitError {
                error: TransportError::Disconnected,
                transfer,
            });
        }
        if let Some(pos) = state
            .submit_failures
            .iter()
            .position(|(ep, _)| *ep == endpoint)
        {
            if let Some((_, error)) = state.submit_failures.remove(pos) {
                return Err(SubmitError { error, transfer });
            }
        }

        *state.submitted.entry(endpoint).or_insert(0) += 1;
        state.pending += 1;
        if state.submissions.len() < RECORD_LIMIT {
            let data = if endpoint & 0x80 == 0 {
                transfer.data().to_vec()
            } else {
                Vec::new()
            };
            state.submissions.push(SubmissionRecord {
                endpoint,
                start_frame: transfer.start_frame,
                packet_lengths: transfer.packets.iter().map(|p| p.length).collect(),
                length: transfer.length,
                data,
            });
        }

        Ok(Box::new(MockPending {
            state: Arc::clone(&self.state),
            endpoint,
            transfer,
        }))
    }
}

struct MockPending {
    state: Arc<Mutex<MockState>>,
    endpoint: u8,
    transfer: IsoTransfer,
}

impl PendingTransfer for MockPending {
    fn wait(&mut self, timeout: Duration) -> Result<(), TransportError> {
        let delay = self.state.lock().completion_delay;
        if !delay.is_zero() {
            std::thread::sleep(delay.min(timeout));
        }
        let mut state = self.state.lock();
        if state.disconnected {
            return Err(TransportError::Disconnected);
        }
        if state.wait_timeouts > 0 {
            state.wait_timeouts -= 1;
            return Err(TransportError::Timeout);
        }
        if let Some(error) = state.wait_failures.pop_front() {
            return Err(error);
        }
        Ok(())
    }

    fn complete(self: Box<Self>) -> IsoTransfer {
        let MockPending {
            state,
            endpoint,
            mut transfer,
        } = *self;
        let mut state = state.lock();
        state.pending = state.pending.saturating_sub(1);
        if endpoint & 0x80 == 0 {
            for p in &mut transfer.packets {
                p.actual_length = p.length;
            }
        } else {
            for p in &mut transfer.packets {
                p.actual_length = 0;
            }
            if let Some(handler) = state.in_handlers.get_mut(&endpoint) {
                handler(&mut transfer);
            }
        }
        transfer
    }

    fn cancel(self: Box<Self>) -> IsoTransfer {
        let mut state = self.state.lock();
        state.pending = state.pending.saturating_sub(1);
        state.cancelled += 1;
        drop(state);
        self.transfer
    }
}
