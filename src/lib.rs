//! # uac2-stream
//!
//! **Note:** This crate is under active development. The API may change before 1.0.
//!
//! Isochronous streaming to and from USB Audio Class 2 devices, with the
//! host following the device's clock.
//!
//! `uac2-stream` parses the device's configuration descriptor, programs its
//! clock source, and keeps a ring of isochronous transfers in flight on each
//! streaming endpoint. Playback packets are sized from the device's clock
//! feedback, so the host sends exactly as many frames as the device consumes
//! and never drifts.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use uac2_stream::{bridge, DeviceConfig, UacDevice};
//!
//! let mut device = UacDevice::new(transport, DeviceConfig::default());
//! device.init()?;
//! device.set_sample_rate(48000)?;
//!
//! // Feed playback from another thread through a lock-free ring
//! let (mut producer, feed) = bridge::playback_ring(64 * 1024);
//! device.set_dac_callback(feed.into_callback())?;
//! device.on_event(uac2_stream::event_callback(|e| tracing::warn!(?e, "device event")));
//!
//! device.start()?;
//! // producer.push_slice(&pcm) ...
//! device.stop();
//! ```
//!
//! ## Architecture
//!
//! The crate maintains a strict thread boundary:
//!
//! - **Worker threads**: one per stream (playback, capture, feedback), each
//!   owning a private transfer ring and never blocking beyond a bounded wait
//! - **Feedback filter**: the single value shared between threads, a smoothed
//!   samples-per-millisecond figure behind a short mutex
//! - **Control calls**: `init`/`set_sample_rate`/`start`/`stop` take
//!   `&mut self` and run on the caller's thread
//!
//! All USB access goes through the [`UsbTransport`] trait. [`MockTransport`]
//! implements it in memory for tests.

// unsafe_code lint is configured in Cargo.toml as "deny"; flock and thread
// scheduling opt out locally
#![warn(missing_docs)]
// Packet math converts between frame counts, byte counts and rates
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::cast_lossless
)]
// unwrap/expect allowed in tests only
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]
// These doc lints are too strict for internal implementation details
#![allow(clippy::missing_panics_doc, clippy::missing_errors_doc)]

pub mod bridge;
mod config;
pub mod descriptor;
mod device;
mod engine;
mod error;
mod event;
mod feedback;
mod lock;
mod transport;

pub use config::{DeviceConfig, FeedbackConfig, DEFAULT_LOCK_NAME};
pub use device::{DeviceStats, UacDevice};
pub use engine::{
    frame_precedes, CaptureCallback, PlaybackCallback, TaskKind, TaskState, TaskStats, SENTINEL,
};
pub use error::{DescriptorError, TransportError, Uac2Error};
pub use event::{event_callback, DeviceEvent, EventCallback};
pub use feedback::{decode_feedback_packet, decode_q16_16, encode_q16_16, FeedbackFilter};
pub use lock::DeviceLock;
pub use transport::{
    ControlRecord, IsoPacket, IsoTransfer, MockTransport, PendingTransfer, SubmissionRecord,
    SubmitError, UsbTransport,
};
