//! Lock-free byte rings between the worker threads and the application.
//!
//! The streaming callbacks run on realtime worker threads and must not block.
//! These helpers put an SPSC ring buffer in between: the application pushes
//! playback bytes from any thread and the playback task pops them, while the
//! capture task pushes into a ring the application drains at its own pace.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

use crate::engine::{CaptureCallback, PlaybackCallback};

/// Shared count of underruns or dropped bytes.
#[derive(Debug, Clone, Default)]
pub struct XrunCounter(Arc<AtomicU64>);

impl XrunCounter {
    /// Number of events counted so far.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }
}

/// Consumer side of the playback ring, used by the playback callback.
pub struct PlaybackFeed {
    consumer: HeapCons<u8>,
    underruns: XrunCounter,
}

impl PlaybackFeed {
    /// Counter of callbacks that found too few bytes queued.
    pub fn underruns(&self) -> XrunCounter {
        self.underruns.clone()
    }

    /// Bytes queued and not yet played.
    pub fn available(&self) -> usize {
        self.consumer.occupied_len()
    }

    /// Fills `buf` from the ring, padding any shortfall with silence.
    ///
    /// Returns the number of bytes taken from the ring.
    pub fn fill(&mut self, buf: &mut [u8]) -> usize {
        let n = self.consumer.pop_slice(buf);
        if n < buf.len() {
            buf[n..].fill(0);
            self.underruns.add(1);
        }
        n
    }

    /// Turns the feed into a playback callback.
    pub fn into_callback(mut self) -> PlaybackCallback {
        Box::new(move |buf: &mut [u8]| {
            self.fill(buf);
        })
    }
}

/// Producer side of the capture ring, used by the capture callback.
pub struct CaptureTap {
    producer: HeapProd<u8>,
    overruns: XrunCounter,
}

impl CaptureTap {
    /// Counter of bytes dropped because the ring was full.
    pub fn overruns(&self) -> XrunCounter {
        self.overruns.clone()
    }

    /// Pushes `data` into the ring. Whatever does not fit is dropped.
    ///
    /// Returns the number of bytes stored.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let n = self.producer.push_slice(data);
        if n < data.len() {
            self.overruns.add((data.len() - n) as u64);
        }
        n
    }

    /// Turns the tap into a capture callback.
    pub fn into_callback(mut self) -> CaptureCallback {
        Box::new(move |data: &[u8]| {
            self.write(data);
        })
    }
}

/// Creates a playback ring of `capacity` bytes.
///
/// Returns the producer for the application and the feed for
/// [`UacDevice::set_dac_callback`](crate::UacDevice::set_dac_callback).
///
/// # Example
///
/// ```
/// use ringbuf::traits::Producer;
/// use uac2_stream::bridge::playback_ring;
///
/// let (mut producer, mut feed) = playback_ring(1024);
/// producer.push_slice(&[1, 2, 3]);
///
/// let mut packet = [0xFFu8; 6];
/// assert_eq!(feed.fill(&mut packet), 3);
/// assert_eq!(packet, [1, 2, 3, 0, 0, 0]);
/// assert_eq!(feed.underruns().get(), 1);
/// ```
pub fn playback_ring(capacity: usize) -> (HeapProd<u8>, PlaybackFeed) {
    let (producer, consumer) = HeapRb::<u8>::new(capacity).split();
    (
        producer,
        PlaybackFeed {
            consumer,
            underruns: XrunCounter::default(),
        },
    )
}

/// Creates a capture ring of `capacity` bytes.
///
/// Returns the tap for
/// [`UacDevice::set_adc_callback`](crate::UacDevice::set_adc_callback) and
/// the consumer for the application.
pub fn capture_ring(capacity: usize) -> (CaptureTap, HeapCons<u8>) {
    let (producer, consumer) = HeapRb::<u8>::new(capacity).split();
    (
        CaptureTap {
            producer,
            overruns: XrunCounter::default(),
        },
        consumer,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_playback_callback_drains_ring() {
        let (mut producer, feed) = playback_ring(64);
        let underruns = feed.underruns();
        let mut callback = feed.into_callback();

        producer.push_slice(&[7; 16]);
        let mut buf = [0xAAu8; 8];
        callback(&mut buf);
        assert_eq!(buf, [7; 8]);
        assert_eq!(underruns.get(), 0);

        let mut buf = [0xAAu8; 12];
        callback(&mut buf);
        assert_eq!(&buf[..8], &[7; 8]);
        assert_eq!(&buf[8..], &[0; 4]);
        assert_eq!(underruns.get(), 1);
    }

    #[test]
    fn test_capture_tap_counts_overruns() {
        let (tap, mut consumer) = capture_ring(10);
        let overruns = tap.overruns();
        let mut callback = tap.into_callback();

        callback(&[1; 6]);
        assert_eq!(overruns.get(), 0);
        callback(&[2; 6]);
        assert_eq!(overruns.get(), 2);

        let mut out = [0u8; 16];
        let n = consumer.pop_slice(&mut out);
        assert_eq!(n, 10);
        assert_eq!(&out[..6], &[1; 6]);
        assert_eq!(&out[6..10], &[2; 4]);
    }

    #[test]
    fn test_available_tracks_queue() {
        let (mut producer, mut feed) = playback_ring(32);
        assert_eq!(feed.available(), 0);
        producer.push_slice(&[0; 20]);
        assert_eq!(feed.available(), 20);
        let mut buf = [0u8; 5];
        feed.fill(&mut buf);
        assert_eq!(feed.available(), 15);
    }
}
