//! Integration tests for uac2-stream.
//!
//! Every test drives a [`UacDevice`] end to end over [`MockTransport`], with
//! configuration descriptors produced by [`ConfigDescriptorBuilder`].

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use ringbuf::traits::Producer;
use uac2_stream::descriptor::{
    ConfigDescriptorBuilder, EndpointSpec, SampleRateRange, CS_SAM_FREQ_CONTROL, CUR,
    TERMINAL_MICROPHONE, TERMINAL_SPEAKER, TERMINAL_USB_STREAMING,
};
use uac2_stream::{
    bridge, encode_q16_16, event_callback, DeviceConfig, DeviceEvent, MockTransport, TaskKind,
    TaskState, TransportError, Uac2Error, UacDevice,
};

const CLOCK: u8 = 5;
const DAC_EP: u8 = 0x01;
const FEEDBACK_EP: u8 = 0x81;
const ADC_EP: u8 = 0x82;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config() -> DeviceConfig {
    DeviceConfig {
        lock_name: None,
        realtime_priority: false,
        completion_timeout: Duration::from_millis(50),
        ..Default::default()
    }
}

/// Stereo playback on interface 1 with an explicit feedback endpoint, plus
/// mono capture on interface 2.
fn descriptor() -> Vec<u8> {
    ConfigDescriptorBuilder::new()
        .control_interface(0)
        .header(0x0200)
        .clock_source(CLOCK, 0x01, 0x07)
        // Playback: USB streaming -> feature unit -> speaker
        .input_terminal(1, TERMINAL_USB_STREAMING, CLOCK, 2)
        .feature_unit(2, 1, 2)
        .output_terminal(3, TERMINAL_SPEAKER, 2, CLOCK)
        // Capture: microphone -> feature unit -> USB streaming
        .input_terminal(4, TERMINAL_MICROPHONE, CLOCK, 1)
        .feature_unit(5, 4, 1)
        .output_terminal(6, TERMINAL_USB_STREAMING, 5, CLOCK)
        .streaming_interface(1, 0)
        .streaming_interface(1, 1)
        .as_general(1, 2)
        .format_type_i(4, 24)
        .endpoint(EndpointSpec::iso_out(1, 1024, 1))
        .endpoint_general()
        .endpoint(EndpointSpec::feedback(1, 4, 4))
        .streaming_interface(2, 0)
        .streaming_interface(2, 1)
        .as_general(6, 1)
        .format_type_i(4, 24)
        .endpoint(EndpointSpec::iso_in(2, 1024, 1))
        .endpoint_general()
        .build()
}

fn mock() -> MockTransport {
    MockTransport::new(descriptor()).with_clock(
        CLOCK,
        vec![
            SampleRateRange::discrete(44100),
            SampleRateRange::discrete(48000),
        ],
        44100,
    )
}

fn ready_device(mock: &MockTransport, config: DeviceConfig) -> UacDevice {
    init_tracing();
    let mut device = UacDevice::new(mock.clone(), config);
    device.init().unwrap();
    device.set_sample_rate(48000).unwrap();
    device
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    false
}

fn collect_events(device: &UacDevice) -> Arc<Mutex<Vec<DeviceEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    device.on_event(event_callback(move |e| sink.lock().push(e)));
    events
}

#[test]
fn test_init_discovers_playback_and_feedback() {
    init_tracing();
    let mut device = UacDevice::new(mock(), config());
    device.init().unwrap();

    let topology = device.topology().unwrap();
    assert_eq!(topology.audio_class_version(), 2);
    assert_eq!(topology.streaming_interfaces.len(), 4);
    assert_eq!(device.output_channel_count(), Some(2));
    assert_eq!(device.input_channel_count(), None);

    let stats = device.stats();
    assert_eq!(stats.dac.unwrap().state, TaskState::Created);
    assert_eq!(stats.feedback.unwrap().kind, TaskKind::Feedback);
    assert!(stats.adc.is_none());
}

#[test]
fn test_set_sample_rate_programs_clock() {
    let mock = mock();
    let device = ready_device(&mock, config());

    assert_eq!(mock.clock_rate(CLOCK), Some(48000));
    assert_eq!(device.sample_rate(), Some(48000));
    assert_eq!(device.feedback().nominal(), Some(48.0));

    let write = mock
        .controls()
        .into_iter()
        .find(|c| c.setup.request == CUR && !c.setup.is_in())
        .unwrap();
    assert_eq!(write.setup.value, u16::from(CS_SAM_FREQ_CONTROL) << 8);
    assert_eq!(write.setup.index, u16::from(CLOCK) << 8);
    assert_eq!(write.data, 48000u32.to_le_bytes().to_vec());
    // The control interface is released after the request
    assert!(mock.claimed_interfaces().is_empty());
}

#[test]
fn test_unsupported_sample_rate() {
    let mock = mock();
    let mut device = ready_device(&mock, config());
    assert!(device.can_sample_rate(44100));
    assert!(!device.can_sample_rate(96000));
    assert!(matches!(
        device.set_sample_rate(96000),
        Err(Uac2Error::UnsupportedSampleRate { requested: 96000 })
    ));
    assert_eq!(mock.clock_rate(CLOCK), Some(48000));
}

#[test]
fn test_start_stop_selects_alternate_settings() {
    let mock = mock();
    let mut device = ready_device(&mock, config());

    device.start().unwrap();
    assert!(device.is_started());
    assert_eq!(mock.alt_settings(), vec![(1, 1)]);
    assert_eq!(mock.claimed_interfaces(), vec![1]);
    assert!(wait_until(|| device.stats().dac.unwrap().completed_transfers >= 5));
    assert!(mock.reset_pipes().contains(&DAC_EP));
    assert!(mock.reset_pipes().contains(&FEEDBACK_EP));

    device.stop();
    assert!(!device.is_started());
    assert_eq!(mock.alt_settings(), vec![(1, 1), (1, 0)]);
    assert!(mock.claimed_interfaces().is_empty());
    assert_eq!(mock.pending_count(), 0);
    assert_eq!(mock.aborted_pipes(), vec![DAC_EP, FEEDBACK_EP]);
    let stats = device.stats();
    assert_eq!(stats.dac.unwrap().state, TaskState::Stopped);
    assert_eq!(stats.feedback.unwrap().state, TaskState::Stopped);

    // A second stop changes nothing
    device.stop();
    assert_eq!(mock.alt_settings().len(), 2);
    assert_eq!(mock.aborted_pipes().len(), 2);
}

#[test]
fn test_restart_resumes_streaming() {
    let mock = mock();
    let mut device = ready_device(&mock, config());
    device.start().unwrap();
    assert!(wait_until(|| mock.submitted_count(DAC_EP) > 0));
    device.stop();

    // Buffers are kept, and the rate can change between runs
    device.set_sample_rate(44100).unwrap();
    let before = mock.submitted_count(DAC_EP);
    device.start().unwrap();
    assert!(wait_until(|| mock.submitted_count(DAC_EP) > before));
    assert_eq!(device.default_packet_bytes(), Some(5 * 8));
    device.stop();
}

#[test]
fn test_sample_rate_refused_while_streaming() {
    let mock = mock();
    let mut device = ready_device(&mock, config());
    device.start().unwrap();
    assert!(matches!(
        device.set_sample_rate(44100),
        Err(Uac2Error::TaskRunning { .. })
    ));
    assert_eq!(mock.clock_rate(CLOCK), Some(48000));
    device.stop();
}

#[test]
fn test_start_without_rate_reads_device_rate() {
    init_tracing();
    let mock = mock();
    let mut device = UacDevice::new(mock.clone(), config());
    device.init().unwrap();
    device.start().unwrap();
    assert_eq!(device.sample_rate(), Some(44100));
    device.stop();
}

#[test]
fn test_lock_makes_second_device_busy() {
    init_tracing();
    let name = format!("uac2-stream-test-{}", std::process::id());
    let locked = DeviceConfig {
        lock_name: Some(name.clone()),
        ..config()
    };

    let mut first = UacDevice::new(mock(), locked.clone());
    first.init().unwrap();

    let mut second = UacDevice::new(mock(), locked.clone());
    assert!(matches!(
        second.init(),
        Err(Uac2Error::DeviceBusy { name: held }) if held == name
    ));

    drop(first);
    let mut third = UacDevice::new(mock(), locked);
    third.init().unwrap();
}

#[test]
fn test_missing_device_is_not_found() {
    init_tracing();
    let mock = mock();
    mock.disconnect();
    let mut device = UacDevice::new(mock, config());
    assert!(matches!(
        device.init(),
        Err(Uac2Error::DeviceNotFound { .. })
    ));
}

#[test]
fn test_zero_feedback_uses_nominal_packets() {
    let mock = mock();
    let mut device = ready_device(&mock, config());
    device.start().unwrap();
    assert!(wait_until(|| mock.submissions(DAC_EP).len() >= 3));
    device.stop();

    // 48 kHz, one packet per microframe: 6 frames of 8 bytes in each of 8 packets
    for submission in mock.submissions(DAC_EP) {
        assert_eq!(submission.length, 384);
        assert_eq!(submission.packet_lengths, vec![48; 8]);
        assert!(submission.data.iter().all(|&b| b == 0));
    }
    assert_eq!(device.stats().feedback_value, 0.0);
}

#[test]
fn test_feedback_endpoint_drives_packet_sizes() {
    let mock = mock();
    mock.set_feedback(FEEDBACK_EP, encode_q16_16(47.5).to_le_bytes().to_vec());
    let mut device = ready_device(&mock, config());
    device.start().unwrap();

    // 47.5 frames/ms is 5.9375 frames per packet: mostly 6, sometimes 5
    assert!(wait_until(|| {
        mock.submissions(DAC_EP)
            .iter()
            .any(|s| s.packet_lengths.contains(&40))
    }));
    let stats = device.stats();
    device.stop();

    assert!((stats.feedback_value - 47.5).abs() < 0.01);
    assert!((stats.estimated_sample_rate - 47_500.0).abs() < 10.0);
    assert!(stats.feedback_min <= stats.feedback_value);
    assert!(stats.feedback_max >= stats.feedback_value);
    for submission in mock.submissions(DAC_EP) {
        assert!(submission.packet_lengths.iter().all(|&l| l <= 56));
        assert_eq!(
            submission.length,
            submission.packet_lengths.iter().sum::<usize>()
        );
    }
}

#[test]
fn test_capture_with_implicit_feedback() {
    let mock = mock();
    // Six mono frames in every packet
    mock.set_in_handler(ADC_EP, |transfer| {
        for (i, packet) in transfer.packets.iter_mut().enumerate() {
            let start = packet.offset;
            transfer.buffer[start..start + 24].fill(i as u8);
            packet.actual_length = 24;
        }
    });
    let mut device = ready_device(
        &mock,
        DeviceConfig {
            use_input: true,
            ..config()
        },
    );
    assert_eq!(device.input_channel_count(), Some(1));
    assert!(device.stats().feedback.is_none());

    let captured = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&captured);
    device
        .set_adc_callback(move |data: &[u8]| sink.lock().push(data.to_vec()))
        .unwrap();

    device.start().unwrap();
    // Capture interface comes up before playback
    assert_eq!(mock.alt_settings(), vec![(2, 1), (1, 1)]);
    assert!(wait_until(|| captured.lock().len() >= 2));
    assert!(wait_until(|| device.feedback().value() > 0.0));
    device.stop();

    // 16 packets of 6 frames over 16 microframes is 48 frames/ms
    assert!((device.feedback().value() - 48.0).abs() < 0.01);
    let first = captured.lock()[0].clone();
    assert_eq!(first.len(), 16 * 24);
    assert!(first[..24].iter().all(|&b| b == 0));
    assert!(first[24..48].iter().all(|&b| b == 1));
    assert_eq!(mock.alt_settings().last(), Some(&(1, 0)));
    assert!(mock.claimed_interfaces().is_empty());
}

#[test]
fn test_adc_callback_requires_capture() {
    let mock = mock();
    let mut device = ready_device(&mock, config());
    assert!(matches!(
        device.set_adc_callback(|_: &[u8]| {}),
        Err(Uac2Error::NoStreamingEndpoint { .. })
    ));
}

fn clocked(descriptor: Vec<u8>) -> MockTransport {
    MockTransport::new(descriptor).with_clock(CLOCK, vec![SampleRateRange::discrete(48000)], 48000)
}

#[test]
fn test_capture_request_falls_back_to_feedback() {
    init_tracing();
    let descriptor = ConfigDescriptorBuilder::new()
        .control_interface(0)
        .header(0x0200)
        .clock_source(CLOCK, 0x01, 0x07)
        .streaming_interface(1, 0)
        .streaming_interface(1, 1)
        .format_type_i(4, 24)
        .endpoint(EndpointSpec::iso_out(1, 1024, 1))
        .endpoint(EndpointSpec::feedback(1, 4, 4))
        .build();
    let mut device = UacDevice::new(
        clocked(descriptor),
        DeviceConfig {
            use_input: true,
            ..config()
        },
    );
    device.init().unwrap();

    let stats = device.stats();
    assert!(stats.adc.is_none());
    assert!(stats.dac.is_some());
    assert_eq!(stats.feedback.unwrap().kind, TaskKind::Feedback);
}

#[test]
fn test_capture_only_device() {
    init_tracing();
    let descriptor = ConfigDescriptorBuilder::new()
        .control_interface(0)
        .header(0x0200)
        .clock_source(CLOCK, 0x01, 0x07)
        .input_terminal(4, TERMINAL_MICROPHONE, CLOCK, 1)
        .feature_unit(5, 4, 1)
        .output_terminal(6, TERMINAL_USB_STREAMING, 5, CLOCK)
        .streaming_interface(2, 0)
        .streaming_interface(2, 1)
        .as_general(6, 1)
        .format_type_i(4, 24)
        .endpoint(EndpointSpec::iso_in(2, 1024, 1))
        .build();
    let mock = clocked(descriptor);
    let mut device = UacDevice::new(
        mock.clone(),
        DeviceConfig {
            use_input: true,
            ..config()
        },
    );
    device.init().unwrap();
    assert_eq!(device.input_channel_count(), Some(1));
    assert_eq!(device.output_channel_count(), None);
    assert!(matches!(
        device.set_dac_callback(|_: &mut [u8]| {}),
        Err(Uac2Error::NoStreamingEndpoint { .. })
    ));

    device.set_sample_rate(48000).unwrap();
    device.start().unwrap();
    assert_eq!(mock.alt_settings(), vec![(2, 1)]);
    assert!(wait_until(|| mock.submitted_count(ADC_EP) > 0));
    device.stop();
    assert_eq!(mock.submitted_count(DAC_EP), 0);
    assert!(mock.claimed_interfaces().is_empty());
}

#[test]
fn test_small_endpoint_caps_nominal_packets() {
    init_tracing();
    // 40 bytes holds five stereo frames, below the six needed at 48 kHz
    let descriptor = ConfigDescriptorBuilder::new()
        .control_interface(0)
        .header(0x0200)
        .clock_source(CLOCK, 0x01, 0x07)
        .streaming_interface(1, 0)
        .streaming_interface(1, 1)
        .as_general(1, 2)
        .format_type_i(4, 24)
        .endpoint(EndpointSpec::iso_out(1, 40, 1))
        .build();
    let mock = clocked(descriptor);
    let mut device = UacDevice::new(mock.clone(), config());
    device.init().unwrap();
    device.set_sample_rate(48000).unwrap();
    assert_eq!(device.default_packet_bytes(), Some(40));

    device.start().unwrap();
    assert!(wait_until(|| mock.submitted_count(DAC_EP) > 0));
    device.stop();

    let first = &mock.submissions(DAC_EP)[0];
    assert!(first.packet_lengths.iter().all(|&n| n == 40));
    assert_eq!(first.length, 40 * first.packet_lengths.len());
    assert_eq!(first.data.len(), first.length);
}

#[test]
fn test_panicking_callback_is_contained() {
    let mock = mock();
    let mut device = ready_device(&mock, config());
    let events = collect_events(&device);

    let armed = Arc::new(AtomicBool::new(true));
    let calls = Arc::new(AtomicUsize::new(0));
    let (armed_cb, calls_cb) = (Arc::clone(&armed), Arc::clone(&calls));
    device
        .set_dac_callback(move |buf: &mut [u8]| {
            calls_cb.fetch_add(1, Ordering::SeqCst);
            if armed_cb.swap(false, Ordering::SeqCst) {
                panic!("callback failed");
            }
            buf.fill(0x11);
        })
        .unwrap();

    device.start().unwrap();
    assert!(wait_until(|| calls.load(Ordering::SeqCst) > 20));
    assert!(device.is_started());
    assert!(device.last_error().is_none());
    device.stop();

    let events = events.lock();
    assert!(events.contains(&DeviceEvent::QuantumPanicked {
        task: TaskKind::Dac,
        message: "callback failed".to_string(),
    }));
    assert!(mock
        .submissions(DAC_EP)
        .iter()
        .all(|s| s.data.iter().all(|&b| b == 0x11)));
}

#[test]
fn test_disconnect_halts_and_reports() {
    let mock = mock();
    let mut device = ready_device(&mock, config());
    let events = collect_events(&device);
    device.start().unwrap();
    assert!(wait_until(|| mock.submitted_count(DAC_EP) > 0));

    mock.disconnect();
    assert!(wait_until(|| device.last_error().is_some()));
    assert_eq!(device.last_error(), Some(TransportError::Disconnected));
    assert!(wait_until(|| {
        events
            .lock()
            .iter()
            .any(|e| matches!(e, DeviceEvent::TransferFailed { .. }))
    }));

    // Stop clears the register even though the device is gone
    device.stop();
    assert_eq!(device.last_error(), None);
    assert!(events
        .lock()
        .iter()
        .any(|e| matches!(e, DeviceEvent::TaskStopped { task: TaskKind::Dac, .. })));
}

#[test]
fn test_playback_bridge_feeds_transfers() {
    let mock = mock();
    let mut device = ready_device(&mock, config());
    let (mut producer, feed) = bridge::playback_ring(4096);
    let underruns = feed.underruns();
    assert_eq!(producer.push_slice(&[0x5A; 384]), 384);
    device.set_dac_callback(feed.into_callback()).unwrap();

    device.start().unwrap();
    assert!(wait_until(|| mock.submissions(DAC_EP).len() >= 2));
    device.stop();

    let submissions = mock.submissions(DAC_EP);
    assert_eq!(submissions[0].data, vec![0x5A; 384]);
    assert!(submissions[1].data.iter().all(|&b| b == 0));
    assert!(underruns.get() >= 1);
}

#[test]
fn test_capture_bridge_collects_bytes() {
    let mock = mock();
    mock.set_in_handler(ADC_EP, |transfer| {
        for packet in &mut transfer.packets {
            let start = packet.offset;
            transfer.buffer[start..start + 4].copy_from_slice(&[1, 2, 3, 4]);
            packet.actual_length = 4;
        }
    });
    let mut device = ready_device(
        &mock,
        DeviceConfig {
            use_input: true,
            ..config()
        },
    );
    let (tap, mut consumer) = bridge::capture_ring(1 << 16);
    device.set_adc_callback(tap.into_callback()).unwrap();

    device.start().unwrap();
    assert!(wait_until(|| {
        use ringbuf::traits::Observer;
        consumer.occupied_len() >= 128
    }));
    device.stop();

    use ringbuf::traits::Consumer;
    let mut out = [0u8; 8];
    assert_eq!(consumer.pop_slice(&mut out), 8);
    assert_eq!(out, [1, 2, 3, 4, 1, 2, 3, 4]);
}
