//! The isochronous streaming engine.
//!
//! Each stream (playback, capture, feedback) is an [`AudioTask`] running a
//! [`TransferEngine`] on its own OS thread. The engine owns a
//! [`TransferRing`] of reusable buffers and repeats one work quantum: submit
//! into every free slot, then wait for the oldest transfer and hand it to the
//! stream's [`StreamKind`] for post-processing.

mod adc;
mod dac;
mod feedback;
mod ring;
mod stream;
mod task;

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

pub(crate) use adc::AdcStream;
pub(crate) use dac::DacStream;
pub(crate) use feedback::FeedbackStream;
pub use ring::frame_precedes;
pub(crate) use ring::TransferRing;
pub(crate) use stream::{Quantum, StreamKind, StreamParams, TransferEngine};
pub(crate) use task::{AudioTask, TaskOptions};
pub use task::TaskState;

use crate::error::TransportError;
use crate::event::{DeviceEvent, EventCallback};

/// Byte written over every transfer buffer at allocation and on start.
pub const SENTINEL: u8 = 0xAA;

/// Fills a playback buffer; called on the playback worker thread.
pub type PlaybackCallback = Box<dyn FnMut(&mut [u8]) + Send>;

/// Receives captured bytes; called on the capture worker thread.
pub type CaptureCallback = Box<dyn FnMut(&[u8]) + Send>;

/// Which stream a task drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// Playback, host to device.
    Dac,
    /// Capture, device to host.
    Adc,
    /// Explicit clock feedback, device to host.
    Feedback,
}

impl TaskKind {
    /// Short name, also used for the worker thread.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Dac => "uac2-dac",
            Self::Adc => "uac2-adc",
            Self::Feedback => "uac2-feedback",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dac => write!(f, "DAC"),
            Self::Adc => write!(f, "ADC"),
            Self::Feedback => write!(f, "feedback"),
        }
    }
}

/// The device-wide last-error register.
///
/// The first fatal transport error from any task is kept here. While it is
/// set no task submits new transfers. Stopping a task clears it.
#[derive(Debug, Clone, Default)]
pub(crate) struct ErrorRegister(Arc<Mutex<Option<TransportError>>>);

impl ErrorRegister {
    /// Records `error` unless an earlier one is already held.
    pub fn record(&self, error: TransportError) {
        let mut slot = self.0.lock();
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    pub fn get(&self) -> Option<TransportError> {
        self.0.lock().clone()
    }

    pub fn is_set(&self) -> bool {
        self.0.lock().is_some()
    }

    pub fn clear(&self) {
        *self.0.lock() = None;
    }
}

/// Shared slot for the user's event callback.
#[derive(Clone, Default)]
pub(crate) struct EventSink(Arc<RwLock<Option<EventCallback>>>);

impl EventSink {
    pub fn set(&self, callback: Option<EventCallback>) {
        *self.0.write() = callback;
    }

    pub fn emit(&self, event: DeviceEvent) {
        let callback = self.0.read().clone();
        if let Some(callback) = callback {
            callback(event);
        }
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EventSink")
            .field(&self.0.read().is_some())
            .finish()
    }
}

/// Counters a task updates as transfers complete.
///
/// Atomics, so statistics can be read without waiting for a quantum.
#[derive(Debug, Default)]
pub(crate) struct TaskCounters {
    submitted: AtomicU64,
    completed: AtomicU64,
    last_start_frame: AtomicU32,
}

impl TaskCounters {
    pub fn reset(&self) {
        self.submitted.store(0, Ordering::Relaxed);
        self.completed.store(0, Ordering::Relaxed);
        self.last_start_frame.store(0, Ordering::Relaxed);
    }

    pub fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self, start_frame: u32) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.last_start_frame.store(start_frame, Ordering::Relaxed);
    }

    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn last_start_frame(&self) -> u32 {
        self.last_start_frame.load(Ordering::Relaxed)
    }
}

/// A snapshot of one task's progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskStats {
    /// Which task.
    pub kind: TaskKind,
    /// Lifecycle state.
    pub state: TaskState,
    /// Transfers submitted since the last start.
    pub submitted_transfers: u64,
    /// Transfers completed since the last start.
    pub completed_transfers: u64,
    /// Start frame of the most recently completed transfer.
    pub last_start_frame: u32,
}
