//! Device orchestrator.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::DeviceConfig;
use crate::descriptor::{
    self, ControlSetup, Endpoint, StreamingInterface, Topology, CS_SAM_FREQ_CONTROL, CUR,
};
use crate::engine::{
    AdcStream, AudioTask, DacStream, ErrorRegister, EventSink, FeedbackStream, StreamKind,
    StreamParams, TaskOptions, TaskStats, TransferEngine,
};
use crate::error::{TransportError, Uac2Error};
use crate::event::EventCallback;
use crate::feedback::FeedbackFilter;
use crate::lock::DeviceLock;
use crate::transport::UsbTransport;

/// Bytes in a sample-rate CUR payload.
const SAMPLE_RATE_BYTES: usize = 4;

/// Channels and sample size of the feedback stream.
const FEEDBACK_CHANNELS: u8 = 1;
const FEEDBACK_SUBSLOT: u8 = 4;

/// Snapshot of the device's streaming state.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceStats {
    /// Playback task, if discovered.
    pub dac: Option<TaskStats>,
    /// Capture task, if enabled and discovered.
    pub adc: Option<TaskStats>,
    /// Feedback task, if the device has a feedback endpoint.
    pub feedback: Option<TaskStats>,
    /// Smoothed feedback in samples per millisecond (0.0 when none yet).
    pub feedback_value: f32,
    /// Smallest feedback value since the last start.
    pub feedback_min: f32,
    /// Largest feedback value since the last start.
    pub feedback_max: f32,
    /// Device clock implied by the feedback, in Hz.
    pub estimated_sample_rate: f32,
    /// The sample rate in effect.
    pub sample_rate: Option<u32>,
}

/// A task together with the streaming interface it runs on.
struct Bound<K: StreamKind> {
    task: AudioTask<K>,
    interface: u8,
    alternate: u8,
}

/// A USB Audio Class 2 device streaming over a [`UsbTransport`].
///
/// # Lifecycle
///
/// 1. [`new`](Self::new) with a transport and a [`DeviceConfig`]
/// 2. [`init`](Self::init) takes the device lock, parses the descriptors and
///    spawns one worker thread per stream
/// 3. [`set_sample_rate`](Self::set_sample_rate) programs the clock and sizes
///    the buffers
/// 4. [`start`](Self::start) / [`stop`](Self::stop), as often as needed
/// 5. Dropping the device stops streaming and joins the workers
///
/// # Example
///
/// ```
/// use uac2_stream::descriptor::{ConfigDescriptorBuilder, EndpointSpec, SampleRateRange};
/// use uac2_stream::{DeviceConfig, MockTransport, UacDevice};
///
/// let descriptor = ConfigDescriptorBuilder::new()
///     .control_interface(0)
///     .header(0x0200)
///     .clock_source(5, 0x01, 0x07)
///     .streaming_interface(1, 0)
///     .streaming_interface(1, 1)
///     .as_general(3, 2)
///     .format_type_i(4, 24)
///     .endpoint(EndpointSpec::iso_out(1, 512, 1))
///     .endpoint(EndpointSpec::feedback(1, 4, 4))
///     .build();
/// let mock = MockTransport::new(descriptor)
///     .with_clock(5, vec![SampleRateRange::discrete(48000)], 44100);
///
/// let mut device = UacDevice::new(mock, DeviceConfig {
///     lock_name: None,
///     realtime_priority: false,
///     ..Default::default()
/// });
/// device.init()?;
/// device.set_sample_rate(48000)?;
/// device.set_dac_callback(|buf: &mut [u8]| buf.fill(0))?;
/// device.start()?;
/// device.stop();
/// # Ok::<(), uac2_stream::Uac2Error>(())
/// ```
pub struct UacDevice {
    dac: Option<Bound<DacStream>>,
    adc: Option<Bound<AdcStream>>,
    feedback_task: Option<Bound<FeedbackStream>>,
    transport: Arc<dyn UsbTransport>,
    config: DeviceConfig,
    topology: Option<Topology>,
    filter: Arc<FeedbackFilter>,
    errors: ErrorRegister,
    events: EventSink,
    sample_rate: Option<u32>,
    started: bool,
    claimed: Vec<u8>,
    // Released last, after the workers have exited
    lock: Option<DeviceLock>,
}

impl UacDevice {
    /// Creates an uninitialized device.
    pub fn new(transport: impl UsbTransport + 'static, config: DeviceConfig) -> Self {
        Self::with_shared_transport(Arc::new(transport), config)
    }

    /// Creates an uninitialized device over a transport shared with the caller.
    pub fn with_shared_transport(transport: Arc<dyn UsbTransport>, config: DeviceConfig) -> Self {
        let filter = Arc::new(FeedbackFilter::new(config.feedback));
        Self {
            dac: None,
            adc: None,
            feedback_task: None,
            transport,
            config,
            topology: None,
            filter,
            errors: ErrorRegister::default(),
            events: EventSink::default(),
            sample_rate: None,
            started: false,
            claimed: Vec::new(),
            lock: None,
        }
    }

    /// Takes the device lock, parses the configuration descriptor and spawns
    /// the worker threads for the discovered endpoints.
    ///
    /// # Errors
    ///
    /// - [`Uac2Error::DeviceBusy`] if the named lock is held elsewhere
    /// - [`Uac2Error::DeviceNotFound`] if the descriptor cannot be read
    /// - [`Uac2Error::Descriptor`] if it is malformed
    /// - [`Uac2Error::NoStreamingEndpoint`] if there is nothing to play to or
    ///   capture from
    pub fn init(&mut self) -> Result<(), Uac2Error> {
        if self.topology.is_some() {
            return Ok(());
        }

        if self.lock.is_none() {
            if let Some(name) = &self.config.lock_name {
                self.lock = Some(DeviceLock::acquire(name)?);
            }
        }

        let bytes = self
            .transport
            .config_descriptor()
            .map_err(|e| Uac2Error::DeviceNotFound {
                reason: e.to_string(),
            })?;
        let topology = descriptor::parse(&bytes)?;
        info!(
            version = topology.audio_class_version(),
            control_interfaces = topology.control_interfaces.len(),
            streaming_interfaces = topology.streaming_interfaces.len(),
            clock_sources = topology.clock_sources().count(),
            "parsed configuration descriptor"
        );
        if topology.audio_class_version() != 2 {
            warn!("device does not declare Audio Class 2.0");
        }
        if topology.has_unsupported_units() {
            warn!("topology has units that are not modelled; channel routing may be incomplete");
        }

        if let Err(e) = self.discover(&topology) {
            self.dac = None;
            self.adc = None;
            self.feedback_task = None;
            return Err(e);
        }
        self.topology = Some(topology);
        Ok(())
    }

    fn discover(&mut self, topology: &Topology) -> Result<(), Uac2Error> {
        let options = TaskOptions {
            idle_sleep: self.config.idle_sleep,
            shutdown_timeout: self.config.shutdown_timeout,
            realtime: self.config.realtime_priority,
        };

        let mut feedback_interface = None;
        let capture = if self.config.use_input {
            let found = find_endpoint(topology, |e| e.is_in() && e.is_data());
            if found.is_none() {
                warn!("no isochronous IN data endpoint; falling back to feedback discovery");
            }
            found
        } else {
            None
        };

        if let Some((streaming, endpoint)) = capture {
            let params = Self::params(
                endpoint,
                topology.input_channel_count(streaming),
                streaming.subslot_size(),
                self.config.adc_packets_per_transfer,
            );
            // No hardware feedback in this mode: capture drives the filter
            let stream = AdcStream::new(Some(Arc::clone(&self.filter)));
            debug!(
                endpoint = endpoint.address,
                interface = streaming.number,
                alternate = streaming.alternate,
                channels = params.channels,
                "capture endpoint"
            );
            self.adc = Some(self.bind(stream, params, streaming, options)?);
        } else if let Some((streaming, endpoint)) = find_endpoint(topology, Endpoint::is_feedback) {
            let params = Self::params(
                endpoint,
                FEEDBACK_CHANNELS,
                FEEDBACK_SUBSLOT,
                self.config.feedback_packets_per_transfer,
            );
            let stream = FeedbackStream::new(Arc::clone(&self.filter));
            debug!(endpoint = endpoint.address, interface = streaming.number, "feedback endpoint");
            feedback_interface = Some(streaming.number);
            self.feedback_task = Some(self.bind(stream, params, streaming, options)?);
        } else {
            warn!("no feedback endpoint; playback uses nominal packet sizes");
        }

        let is_out = |e: &Endpoint| !e.is_in();
        let playback = feedback_interface
            .and_then(|number| {
                find_endpoint_where(topology, |s| s.number == number, is_out)
            })
            .or_else(|| find_endpoint(topology, is_out));
        let Some((streaming, endpoint)) = playback else {
            if self.adc.is_some() {
                warn!("no isochronous OUT endpoint; capture only");
                return Ok(());
            }
            return Err(Uac2Error::NoStreamingEndpoint {
                reason: "no isochronous OUT endpoint for playback".to_string(),
            });
        };
        let params = Self::params(
            endpoint,
            topology.output_channel_count(streaming),
            streaming.subslot_size(),
            self.config.dac_packets_per_transfer,
        );
        let stream = DacStream::new(Some(Arc::clone(&self.filter)));
        debug!(
            endpoint = endpoint.address,
            interface = streaming.number,
            alternate = streaming.alternate,
            channels = params.channels,
            subslot = params.subslot_size,
            "playback endpoint"
        );
        self.dac = Some(self.bind(stream, params, streaming, options)?);
        Ok(())
    }

    fn params(
        endpoint: &Endpoint,
        channels: u8,
        subslot_size: u8,
        packets_per_transfer: usize,
    ) -> StreamParams {
        StreamParams {
            endpoint: endpoint.address,
            max_packet_size: usize::from(endpoint.max_packet_size),
            packet_interval: endpoint.packet_interval(),
            channels,
            subslot_size,
            packets_per_transfer,
        }
    }

    fn bind<K: StreamKind>(
        &self,
        stream: K,
        params: StreamParams,
        streaming: &StreamingInterface,
        options: TaskOptions,
    ) -> Result<Bound<K>, Uac2Error> {
        let engine = TransferEngine::new(
            stream,
            params,
            self.config.transfer_slots,
            Arc::clone(&self.transport),
            self.errors.clone(),
            self.events.clone(),
            self.config.completion_timeout,
        );
        Ok(Bound {
            task: AudioTask::spawn(engine, options, self.events.clone())?,
            interface: streaming.number,
            alternate: streaming.alternate,
        })
    }

    fn topology_or_err(&self) -> Result<&Topology, Uac2Error> {
        self.topology.as_ref().ok_or(Uac2Error::NotInitialized)
    }

    /// Returns true if some clock source supports `rate`.
    pub fn can_sample_rate(&self, rate: u32) -> bool {
        self.topology
            .as_ref()
            .is_some_and(|t| t.find_clock_source(&*self.transport, rate).is_some())
    }

    /// Programs the clock source that supports `rate` and resizes every
    /// task's buffers for it.
    ///
    /// # Errors
    ///
    /// - [`Uac2Error::TaskRunning`] while streaming
    /// - [`Uac2Error::UnsupportedSampleRate`] if no clock source has the rate
    /// - [`Uac2Error::Transport`] if the CUR write fails or is short
    pub fn set_sample_rate(&mut self, rate: u32) -> Result<(), Uac2Error> {
        if let Some(task) = self.running_task() {
            return Err(Uac2Error::TaskRunning { task });
        }
        let topology = self.topology_or_err()?;
        let clock = topology
            .find_clock_source(&*self.transport, rate)
            .ok_or(Uac2Error::UnsupportedSampleRate { requested: rate })?
            .clone();

        self.transport.claim_interface(clock.interface)?;
        let setup = ControlSetup::class_out(CUR, CS_SAM_FREQ_CONTROL, clock.id, clock.interface);
        let written = self.transport.control_out(setup, &rate.to_le_bytes());
        self.release(clock.interface);
        let written = written?;
        if written != SAMPLE_RATE_BYTES {
            return Err(TransportError::ShortTransfer {
                expected: SAMPLE_RATE_BYTES,
                actual: written,
            }
            .into());
        }

        self.apply_sample_rate(rate)?;
        info!(rate, clock = clock.id, "sample rate set");
        Ok(())
    }

    fn apply_sample_rate(&mut self, rate: u32) -> Result<(), Uac2Error> {
        if let Some(b) = &self.dac {
            b.task.resize(rate)?;
        }
        if let Some(b) = &self.adc {
            b.task.resize(rate)?;
        }
        if let Some(b) = &self.feedback_task {
            b.task.resize(rate)?;
        }
        self.filter.set_nominal(rate);
        self.sample_rate = Some(rate);
        Ok(())
    }

    fn running_task(&self) -> Option<String> {
        let running = [
            self.dac.as_ref().filter(|b| b.task.is_started()).map(|b| b.task.kind()),
            self.adc.as_ref().filter(|b| b.task.is_started()).map(|b| b.task.kind()),
            self.feedback_task
                .as_ref()
                .filter(|b| b.task.is_started())
                .map(|b| b.task.kind()),
        ];
        running.into_iter().flatten().next().map(|k| k.to_string())
    }

    /// Reads the current rate from the device's clock source.
    ///
    /// Returns `None` unless there is exactly one control interface with
    /// exactly one clock source, or if the request fails.
    pub fn current_sample_rate(&self) -> Option<u32> {
        let topology = self.topology.as_ref()?;
        if topology.control_interfaces.len() != 1 {
            return None;
        }
        let mut clocks = topology.clock_sources();
        let clock = clocks.next()?;
        if clocks.next().is_some() {
            debug!("more than one clock source, current rate is ambiguous");
            return None;
        }

        if let Err(e) = self.transport.claim_interface(clock.interface) {
            warn!(interface = clock.interface, error = %e, "failed to claim control interface");
            return None;
        }
        let mut buf = [0u8; SAMPLE_RATE_BYTES];
        let setup = ControlSetup::class_in(CUR, CS_SAM_FREQ_CONTROL, clock.id, clock.interface);
        let result = self.transport.control_in(setup, &mut buf);
        self.release(clock.interface);
        match result {
            Ok(SAMPLE_RATE_BYTES) => Some(u32::from_le_bytes(buf)),
            Ok(n) => {
                warn!(bytes = n, "short sample rate response");
                None
            }
            Err(e) => {
                warn!(clock = clock.id, error = %e, "failed to read sample rate");
                None
            }
        }
    }

    /// The sample rate in effect, if one was set or read back at start.
    pub fn sample_rate(&self) -> Option<u32> {
        self.sample_rate
    }

    /// Starts streaming. A no-op if already started.
    ///
    /// Without a prior [`set_sample_rate`](Self::set_sample_rate) the
    /// device's current rate is read back and used.
    ///
    /// # Errors
    ///
    /// - [`Uac2Error::NotInitialized`] before [`init`](Self::init)
    /// - [`Uac2Error::SampleRateNotSet`] if no rate is known
    /// - [`Uac2Error::Transport`] if an interface cannot be claimed or selected
    pub fn start(&mut self) -> Result<(), Uac2Error> {
        if self.started {
            return Ok(());
        }
        self.topology_or_err()?;
        if self.sample_rate.is_none() {
            let rate = self.current_sample_rate().ok_or(Uac2Error::SampleRateNotSet)?;
            debug!(rate, "using the device's current sample rate");
            self.apply_sample_rate(rate)?;
        }

        if let Err(e) = self.start_streams() {
            self.halt();
            return Err(e);
        }
        self.started = true;
        info!(sample_rate = ?self.sample_rate, "streaming started");
        Ok(())
    }

    fn start_streams(&mut self) -> Result<(), Uac2Error> {
        if let Some((interface, alternate)) = self.adc.as_ref().map(|b| (b.interface, b.alternate)) {
            self.open_interface(interface, alternate)?;
            if let Some(b) = &self.adc {
                b.task.start()?;
            }
        }
        if let Some((interface, alternate)) = self.dac.as_ref().map(|b| (b.interface, b.alternate)) {
            self.open_interface(interface, alternate)?;
            if let Some(b) = &self.dac {
                b.task.start()?;
            }
        }
        if let Some((interface, alternate)) =
            self.feedback_task.as_ref().map(|b| (b.interface, b.alternate))
        {
            self.open_interface(interface, alternate)?;
            if let Some(b) = &self.feedback_task {
                b.task.start()?;
            }
        }
        Ok(())
    }

    fn open_interface(&mut self, interface: u8, alternate: u8) -> Result<(), Uac2Error> {
        if self.claimed.contains(&interface) {
            return Ok(());
        }
        self.transport.claim_interface(interface)?;
        self.claimed.push(interface);
        self.transport.set_alt_setting(interface, alternate)?;
        debug!(interface, alternate, "selected streaming alternate setting");
        Ok(())
    }

    fn release(&self, interface: u8) {
        if let Err(e) = self.transport.release_interface(interface) {
            warn!(interface, error = %e, "failed to release interface");
        }
    }

    /// Stops streaming and idles the streaming interfaces. A no-op if not
    /// started. Buffers are kept for the next start.
    pub fn stop(&mut self) {
        if !self.started {
            return;
        }
        self.halt();
        self.started = false;
        info!("streaming stopped");
    }

    fn halt(&mut self) {
        if let Some(b) = &self.dac {
            b.task.stop();
        }
        if let Some(b) = &self.feedback_task {
            b.task.stop();
        }
        if let Some(b) = &self.adc {
            b.task.stop();
        }
        for interface in std::mem::take(&mut self.claimed) {
            let idle = self
                .topology
                .as_ref()
                .and_then(|t| t.idle_alternate(interface))
                .unwrap_or(0);
            if let Err(e) = self.transport.set_alt_setting(interface, idle) {
                warn!(interface, error = %e, "failed to select idle alternate setting");
            }
            self.release(interface);
        }
    }

    /// True between [`start`](Self::start) and [`stop`](Self::stop).
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Sets the closure that fills each playback transfer.
    ///
    /// It runs on the playback worker thread with exactly the bytes about to
    /// be sent, pre-zeroed. Replacing it waits for the current quantum.
    pub fn set_dac_callback<F>(&mut self, callback: F) -> Result<(), Uac2Error>
    where
        F: FnMut(&mut [u8]) + Send + 'static,
    {
        self.topology_or_err()?;
        let dac = self.dac.as_ref().ok_or_else(|| Uac2Error::NoStreamingEndpoint {
            reason: "playback endpoint not found".to_string(),
        })?;
        dac.task.with_stream(|s| s.set_callback(Some(Box::new(callback))));
        Ok(())
    }

    /// Sets the closure that receives each captured transfer, compacted.
    ///
    /// Capture is only active with [`DeviceConfig::use_input`].
    pub fn set_adc_callback<F>(&mut self, callback: F) -> Result<(), Uac2Error>
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        self.topology_or_err()?;
        let adc = self.adc.as_ref().ok_or_else(|| Uac2Error::NoStreamingEndpoint {
            reason: "capture is not enabled".to_string(),
        })?;
        adc.task.with_stream(|s| s.set_callback(Some(Box::new(callback))));
        Ok(())
    }

    /// Channels in each capture frame.
    pub fn input_channel_count(&self) -> Option<u8> {
        self.adc.as_ref().map(|b| b.task.params().channels)
    }

    /// Channels in each playback frame.
    pub fn output_channel_count(&self) -> Option<u8> {
        self.dac.as_ref().map(|b| b.task.params().channels)
    }

    /// Playback bytes per packet while no feedback has arrived.
    pub fn default_packet_bytes(&self) -> Option<usize> {
        self.dac
            .as_ref()
            .map(|b| b.task.with_stream(|s| s.default_packet_bytes()))
    }

    /// Current statistics.
    pub fn stats(&self) -> DeviceStats {
        DeviceStats {
            dac: self.dac.as_ref().map(|b| b.task.stats()),
            adc: self.adc.as_ref().map(|b| b.task.stats()),
            feedback: self.feedback_task.as_ref().map(|b| b.task.stats()),
            feedback_value: self.filter.value(),
            feedback_min: self.filter.min(),
            feedback_max: self.filter.max(),
            estimated_sample_rate: self.filter.estimated_sample_rate(),
            sample_rate: self.sample_rate,
        }
    }

    /// The first fatal transport error since the last stop, if any.
    ///
    /// While set, no task submits new transfers.
    pub fn last_error(&self) -> Option<TransportError> {
        self.errors.get()
    }

    /// Clears the last-error register so streaming tasks may submit again.
    ///
    /// A task halted by the error stays idle until it is stopped.
    pub fn clear_last_error(&self) {
        self.errors.clear();
    }

    /// Registers a callback for runtime events, replacing any previous one.
    pub fn on_event(&self, callback: EventCallback) {
        self.events.set(Some(callback));
    }

    /// The shared feedback filter.
    pub fn feedback(&self) -> &Arc<FeedbackFilter> {
        &self.filter
    }

    /// The parsed topology, after [`init`](Self::init).
    pub fn topology(&self) -> Option<&Topology> {
        self.topology.as_ref()
    }
}

impl Drop for UacDevice {
    fn drop(&mut self) {
        self.stop();
    }
}

fn find_endpoint(
    topology: &Topology,
    endpoint: impl Fn(&Endpoint) -> bool,
) -> Option<(&StreamingInterface, &Endpoint)> {
    find_endpoint_where(topology, |_| true, endpoint)
}

/// First isochronous endpoint matching both predicates, in descriptor order.
fn find_endpoint_where(
    topology: &Topology,
    interface: impl Fn(&StreamingInterface) -> bool,
    endpoint: impl Fn(&Endpoint) -> bool,
) -> Option<(&StreamingInterface, &Endpoint)> {
    topology
        .streaming_interfaces
        .iter()
        .filter(|&s| interface(s))
        .find_map(|s| {
            s.endpoints
                .iter()
                .find(|&e| e.is_isochronous() && endpoint(e))
                .map(|e| (s, e))
        })
}
