//! The USB operations the engine needs, as a trait.
//!
//! Everything above this module talks to hardware only through
//! [`UsbTransport`]. A platform backend implements it over its USB stack;
//! [`MockTransport`] implements it in memory for tests and CI.
//!
//! Isochronous transfers move buffer ownership: [`UsbTransport::submit_iso`]
//! takes an [`IsoTransfer`] by value and returns a [`PendingTransfer`] handle,
//! and the buffer comes back from [`PendingTransfer::complete`] or
//! [`PendingTransfer::cancel`]. A buffer is therefore either owned by the
//! caller or by the transport, never both.

mod mock;

use std::time::Duration;

pub use mock::{ControlRecord, MockTransport, SubmissionRecord};

use crate::descriptor::ControlSetup;
use crate::error::TransportError;

/// One packet of an isochronous transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IsoPacket {
    /// Byte offset of the packet in the transfer buffer.
    pub offset: usize,
    /// Requested length (OUT: bytes to send, IN: capacity).
    pub length: usize,
    /// Bytes actually moved, filled in by the transport on completion.
    pub actual_length: usize,
}

/// An isochronous transfer buffer with its packet table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IsoTransfer {
    /// The raw buffer, sized for the maximum transfer.
    pub buffer: Vec<u8>,
    /// Bytes of `buffer` in use for this transfer.
    pub length: usize,
    /// Packet table.
    pub packets: Vec<IsoPacket>,
    /// Frame number stamped on submission.
    pub start_frame: u32,
}

impl IsoTransfer {
    /// Allocates a buffer of `packets × packet_size` bytes filled with `fill`.
    pub fn new(packets: usize, packet_size: usize, fill: u8) -> Self {
        Self {
            buffer: vec![fill; packets * packet_size],
            length: 0,
            packets: vec![IsoPacket::default(); packets],
            start_frame: 0,
        }
    }

    /// Lays out `packets` equal packets of `packet_size` bytes.
    pub fn set_uniform_packets(&mut self, packet_size: usize) {
        for (i, p) in self.packets.iter_mut().enumerate() {
            p.offset = i * packet_size;
            p.length = packet_size;
            p.actual_length = 0;
        }
        self.length = packet_size * self.packets.len();
    }

    /// The bytes in use.
    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.length.min(self.buffer.len())]
    }
}

/// A submission the transport refused, with the buffer handed back.
#[derive(Debug)]
pub struct SubmitError {
    /// Why it was refused.
    pub error: TransportError,
    /// The transfer, returned to the caller.
    pub transfer: IsoTransfer,
}

/// A transfer the transport currently owns.
pub trait PendingTransfer: Send {
    /// Waits up to `timeout` for completion.
    ///
    /// [`TransportError::Timeout`] leaves the transfer pending; any other
    /// error means the transfer failed.
    fn wait(&mut self, timeout: Duration) -> Result<(), TransportError>;

    /// Returns the buffer after a successful [`wait`](PendingTransfer::wait),
    /// with `actual_length` filled in on each packet.
    fn complete(self: Box<Self>) -> IsoTransfer;

    /// Cancels the transfer and returns its buffer.
    fn cancel(self: Box<Self>) -> IsoTransfer;
}

/// USB operations needed to drive an Audio Class 2 device.
///
/// Implementations are shared between the control thread and up to three
/// worker threads, so every method takes `&self`.
pub trait UsbTransport: Send + Sync {
    /// Reads the active configuration descriptor, all of it.
    fn config_descriptor(&self) -> Result<Vec<u8>, TransportError>;

    /// Device-to-host control transfer. Returns bytes received.
    fn control_in(&self, setup: ControlSetup, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Host-to-device control transfer. Returns bytes sent.
    fn control_out(&self, setup: ControlSetup, data: &[u8]) -> Result<usize, TransportError>;

    /// Claims an interface for exclusive use.
    fn claim_interface(&self, interface: u8) -> Result<(), TransportError>;

    /// Releases a claimed interface.
    fn release_interface(&self, interface: u8) -> Result<(), TransportError>;

    /// Selects an alternate setting.
    fn set_alt_setting(&self, interface: u8, alternate: u8) -> Result<(), TransportError>;

    /// Clears any halt and pending state on a pipe.
    fn reset_pipe(&self, endpoint: u8) -> Result<(), TransportError>;

    /// Aborts every transfer pending on a pipe.
    fn abort_pipe(&self, endpoint: u8) -> Result<(), TransportError>;

    /// Queues an isochronous transfer.
    fn submit_iso(
        &self,
        endpoint: u8,
        transfer: IsoTransfer,
    ) -> Result<Box<dyn PendingTransfer>, SubmitError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iso_transfer_new() {
        let t = IsoTransfer::new(8, 24, 0xAA);
        assert_eq!(t.buffer.len(), 192);
        assert!(t.buffer.iter().all(|&b| b == 0xAA));
        assert_eq!(t.packets.len(), 8);
        assert_eq!(t.length, 0);
    }

    #[test]
    fn test_uniform_packets() {
        let mut t = IsoTransfer::new(4, 10, 0);
        t.set_uniform_packets(10);
        assert_eq!(t.length, 40);
        assert_eq!(t.packets[3].offset, 30);
        assert_eq!(t.packets[3].length, 10);
        assert_eq!(t.data().len(), 40);
    }
}
