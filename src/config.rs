//! Configuration types for the device and its worker tasks.

use std::time::Duration;

/// Default name of the cross-process device lock.
pub const DEFAULT_LOCK_NAME: &str = "uac2-stream";

/// Configuration for the clock-feedback filter.
///
/// # Example
///
/// ```
/// use uac2_stream::FeedbackConfig;
///
/// let config = FeedbackConfig {
///     format_detect_threshold: None,
///     ..Default::default()
/// };
/// assert_eq!(config.smoothing, 0.02);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeedbackConfig {
    /// Weight of each new sample in the exponential moving average.
    ///
    /// Default: 0.02
    pub smoothing: f32,

    /// Ratio above the reference value at which a decoded sample is assumed
    /// to be Q15.17 rather than Q16.16 and halved.
    ///
    /// `None` disables format detection entirely.
    /// Default: `Some(1.5)`
    pub format_detect_threshold: Option<f32>,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            smoothing: 0.02,
            format_detect_threshold: Some(1.5),
        }
    }
}

/// Configuration for a [`UacDevice`](crate::UacDevice).
///
/// Use [`DeviceConfig::default()`] for sensible defaults, or customize as needed.
///
/// # Example
///
/// ```
/// use uac2_stream::DeviceConfig;
/// use std::time::Duration;
///
/// let config = DeviceConfig {
///     use_input: true,
///     completion_timeout: Duration::from_millis(250),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Stream capture (ADC) instead of using a hardware feedback endpoint.
    ///
    /// When set, the capture stream drives the clock feedback implicitly.
    /// Default: false
    pub use_input: bool,

    /// Number of transfer slots in each task's ring.
    ///
    /// At most `transfer_slots - 1` transfers are ever in flight.
    /// Default: 6
    pub transfer_slots: usize,

    /// Isochronous packets per playback transfer.
    ///
    /// Default: 8
    pub dac_packets_per_transfer: usize,

    /// Isochronous packets per capture transfer.
    ///
    /// Default: 16
    pub adc_packets_per_transfer: usize,

    /// Isochronous packets per feedback transfer.
    ///
    /// Default: 8
    pub feedback_packets_per_transfer: usize,

    /// Bounded wait for the oldest in-flight transfer.
    ///
    /// Expiry is not an error; the transfer is waited on again next quantum.
    /// Default: 500ms
    pub completion_timeout: Duration,

    /// Sleep between polls while a task is not started.
    ///
    /// Default: 1ms
    pub idle_sleep: Duration,

    /// How long dropping a task waits for its worker thread to exit.
    ///
    /// Default: 1s
    pub shutdown_timeout: Duration,

    /// Feedback filter settings.
    pub feedback: FeedbackConfig,

    /// Name of the cross-process device lock, or `None` to skip locking.
    ///
    /// Default: `Some("uac2-stream")`
    pub lock_name: Option<String>,

    /// Ask the OS for real-time scheduling on the worker threads.
    ///
    /// Only honored with the `realtime` feature on Unix. Failure is logged
    /// and otherwise ignored.
    /// Default: true
    pub realtime_priority: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            use_input: false,
            transfer_slots: 6,
            dac_packets_per_transfer: 8,
            adc_packets_per_transfer: 16,
            feedback_packets_per_transfer: 8,
            completion_timeout: Duration::from_millis(500),
            idle_sleep: Duration::from_millis(1),
            shutdown_timeout: Duration::from_secs(1),
            feedback: FeedbackConfig::default(),
            lock_name: Some(DEFAULT_LOCK_NAME.to_string()),
            realtime_priority: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_config_defaults() {
        let config = DeviceConfig::default();
        assert!(!config.use_input);
        assert_eq!(config.transfer_slots, 6);
        assert_eq!(config.dac_packets_per_transfer, 8);
        assert_eq!(config.adc_packets_per_transfer, 16);
        assert_eq!(config.feedback_packets_per_transfer, 8);
        assert_eq!(config.completion_timeout, Duration::from_millis(500));
        assert_eq!(config.idle_sleep, Duration::from_millis(1));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(1));
        assert_eq!(config.lock_name.as_deref(), Some("uac2-stream"));
        assert!(config.realtime_priority);
    }

    #[test]
    fn test_feedback_config_defaults() {
        let config = FeedbackConfig::default();
        assert_eq!(config.smoothing, 0.02);
        assert_eq!(config.format_detect_threshold, Some(1.5));
    }

    #[test]
    fn test_struct_update_syntax() {
        let config = DeviceConfig {
            lock_name: None,
            ..Default::default()
        };
        assert!(config.lock_name.is_none());
        assert_eq!(config.transfer_slots, 6);
    }
}
