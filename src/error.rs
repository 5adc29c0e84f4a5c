//! Error types for uac2-stream.
//!
//! Errors are split into three categories:
//! - **Device errors** ([`Uac2Error`]): returned from [`UacDevice`](crate::UacDevice)
//!   calls when initialization, negotiation or a lifecycle step fails
//! - **Transport errors** ([`TransportError`]): reported by a
//!   [`UsbTransport`](crate::UsbTransport) implementation
//! - **Descriptor errors** ([`DescriptorError`]): malformed configuration
//!   descriptors or control responses
//!
//! Runtime issues on the worker threads are never returned from a call. They
//! land in the device's last-error register and are surfaced via
//! [`EventCallback`](crate::EventCallback).

/// Errors returned by the device orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum Uac2Error {
    /// No USB Audio Class 2 device is reachable through the transport.
    #[error("device not found: {reason}")]
    DeviceNotFound {
        /// Why the device could not be opened.
        reason: String,
    },

    /// The device is already claimed by another process or device instance.
    ///
    /// Distinct from [`Uac2Error::DeviceNotFound`]: the hardware exists but
    /// its named lock is held elsewhere.
    #[error("device busy: lock '{name}' is held by another instance")]
    DeviceBusy {
        /// Name of the held lock.
        name: String,
    },

    /// An operation that needs a parsed topology was called before `init()`.
    #[error("device not initialized (call init first)")]
    NotInitialized,

    /// The configuration descriptor could not be parsed.
    #[error("descriptor error: {0}")]
    Descriptor(#[from] DescriptorError),

    /// No clock source advertises the requested sample rate.
    #[error("sample rate {requested}Hz not supported by any clock source")]
    UnsupportedSampleRate {
        /// The requested sample rate.
        requested: u32,
    },

    /// The device has no streaming endpoint this engine can drive.
    #[error("no usable isochronous endpoint: {reason}")]
    NoStreamingEndpoint {
        /// What was missing.
        reason: String,
    },

    /// Start was requested before any sample rate was known.
    #[error("sample rate not set and the device did not report one")]
    SampleRateNotSet,

    /// Buffers cannot be resized while the owning task is streaming.
    #[error("{task} is running; stop it before changing buffers")]
    TaskRunning {
        /// Name of the running task.
        task: String,
    },

    /// A task was started without allocated transfer buffers.
    #[error("{task} has no transfer buffers (set a sample rate first)")]
    BuffersNotAllocated {
        /// Name of the task.
        task: String,
    },

    /// A worker thread could not be spawned.
    #[error("failed to spawn {task} thread: {source}")]
    ThreadSpawn {
        /// Name of the task.
        task: String,
        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// The device lock file could not be created or locked.
    #[error("device lock error: {0}")]
    Lock(#[source] std::io::Error),

    /// A USB operation failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Errors reported by a [`UsbTransport`](crate::UsbTransport).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// A bounded wait elapsed before the transfer completed.
    ///
    /// Not fatal: the transfer is still pending and may be waited on again.
    #[error("transfer timed out")]
    Timeout,

    /// The endpoint stalled.
    #[error("endpoint stalled")]
    Stall,

    /// The device went away.
    #[error("device disconnected")]
    Disconnected,

    /// The transfer was cancelled before completion.
    #[error("transfer cancelled")]
    Cancelled,

    /// The transfer could not be queued at all.
    #[error("submission rejected (code {code})")]
    Submit {
        /// Platform error code.
        code: i32,
    },

    /// A control transfer moved fewer bytes than required.
    #[error("short transfer: expected {expected} bytes, got {actual}")]
    ShortTransfer {
        /// Bytes required.
        expected: usize,
        /// Bytes transferred.
        actual: usize,
    },

    /// Any other platform failure.
    #[error("usb i/o error: {0}")]
    Io(String),
}

impl TransportError {
    /// Returns true for the only non-fatal transfer outcome, a wait timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    /// Creates an I/O error with the given message.
    pub fn io(msg: impl Into<String>) -> Self {
        Self::Io(msg.into())
    }
}

/// Errors found while decoding descriptors or class-specific responses.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DescriptorError {
    /// A record declared a length too small to advance past.
    #[error("descriptor at offset {offset} has invalid bLength {length}")]
    ZeroLength {
        /// Byte offset of the record.
        offset: usize,
        /// The declared bLength.
        length: u8,
    },

    /// A record extends past the end of the buffer.
    #[error("descriptor at offset {offset} declares {length} bytes, only {remaining} remain")]
    Truncated {
        /// Byte offset of the record.
        offset: usize,
        /// The declared bLength.
        length: usize,
        /// Bytes left in the buffer.
        remaining: usize,
    },

    /// A RANGE response was too short to hold its count.
    #[error("malformed RANGE response ({length} bytes)")]
    BadRangeResponse {
        /// Bytes received.
        length: usize,
    },
}
