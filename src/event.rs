//! Runtime events for monitoring stream health.
//!
//! Events are notifications from the worker threads. A task keeps running
//! after most events; [`DeviceEvent::TransferFailed`] is the exception and
//! halts the affected task until it is stopped.

use std::sync::Arc;

use crate::engine::TaskKind;
use crate::error::TransportError;

/// Runtime events emitted by the streaming tasks.
///
/// # Example
///
/// ```
/// use uac2_stream::DeviceEvent;
///
/// fn handle_event(event: DeviceEvent) {
///     match event {
///         DeviceEvent::TaskStarted { task } => eprintln!("{task} started"),
///         DeviceEvent::TaskStopped { task, completed } => {
///             eprintln!("{task} stopped after {completed} transfers");
///         }
///         DeviceEvent::TransferFailed { task, error } => {
///             eprintln!("{task} halted: {error}");
///         }
///         DeviceEvent::QuantumPanicked { task, message } => {
///             eprintln!("{task} recovered from panic: {message}");
///         }
///     }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// A task began streaming.
    TaskStarted {
        /// Which task.
        task: TaskKind,
    },

    /// A task stopped and reclaimed its buffers.
    TaskStopped {
        /// Which task.
        task: TaskKind,
        /// Transfers completed since the task was started.
        completed: u64,
    },

    /// A submission or completion failed; the task is halted until stopped.
    ///
    /// The error is also stored in the device's last-error register, which
    /// blocks further submissions on every task.
    TransferFailed {
        /// Which task.
        task: TaskKind,
        /// The transport failure.
        error: TransportError,
    },

    /// A work quantum panicked (usually inside a user callback).
    ///
    /// The panic was caught at the thread boundary and the task carries on.
    QuantumPanicked {
        /// Which task.
        task: TaskKind,
        /// The panic payload, if it was a string.
        message: String,
    },
}

/// Callback type for receiving runtime events.
///
/// Register one with [`UacDevice::on_event()`](crate::UacDevice::on_event).
/// It runs on the worker thread that produced the event, so keep it short.
pub type EventCallback = Arc<dyn Fn(DeviceEvent) + Send + Sync>;

/// Creates an [`EventCallback`] from a closure.
///
/// # Example
///
/// ```
/// use uac2_stream::{event_callback, DeviceEvent};
///
/// let callback = event_callback(|event: DeviceEvent| {
///     println!("Got event: {:?}", event);
/// });
/// ```
pub fn event_callback<F>(f: F) -> EventCallback
where
    F: Fn(DeviceEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_event_debug() {
        let event = DeviceEvent::TaskStopped {
            task: TaskKind::Dac,
            completed: 42,
        };
        let debug = format!("{:?}", event);
        assert!(debug.contains("TaskStopped"));
        assert!(debug.contains("42"));
    }

    #[test]
    fn test_device_event_clone() {
        let event = DeviceEvent::TransferFailed {
            task: TaskKind::Feedback,
            error: TransportError::Stall,
        };
        if let DeviceEvent::TransferFailed { task, error } = event.clone() {
            assert_eq!(task, TaskKind::Feedback);
            assert_eq!(error, TransportError::Stall);
        } else {
            panic!("Expected TransferFailed variant");
        }
    }

    #[test]
    fn test_event_callback_helper() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let called = Arc::new(AtomicBool::new(false));
        let called_clone = called.clone();

        let callback = event_callback(move |_| {
            called_clone.store(true, Ordering::SeqCst);
        });

        callback(DeviceEvent::TaskStarted { task: TaskKind::Adc });
        assert!(called.load(Ordering::SeqCst));
    }
}
