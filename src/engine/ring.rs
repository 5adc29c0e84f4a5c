//! Fixed pool of reusable isochronous transfer slots.

use tracing::warn;

use super::SENTINEL;
use crate::transport::{IsoTransfer, PendingTransfer};

/// Returns true if frame `a` comes before frame `b`, across the u32 wrap.
///
/// Frames more than half the number space apart compare the other way.
pub fn frame_precedes(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

enum Slot {
    /// Buffer owned by the ring.
    Free(IsoTransfer),
    /// Buffer owned by the transport.
    InFlight(Box<dyn PendingTransfer>),
    /// Buffer taken out for filling or post-processing.
    Vacant,
}

/// Ring of transfer slots addressed by two cursors.
///
/// Slots from `completed` up to (not including) `outstanding` are in flight;
/// the rest are free. One slot is always left free, so at most
/// `capacity - 1` transfers are in flight and equal cursors mean none.
pub(crate) struct TransferRing {
    slots: Vec<Slot>,
    packets_per_transfer: usize,
    packet_size: usize,
    outstanding: usize,
    completed: usize,
}

impl Default for TransferRing {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferRing {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            packets_per_transfer: 0,
            packet_size: 0,
            outstanding: 0,
            completed: 0,
        }
    }

    /// Replaces every slot with a fresh sentinel-filled buffer.
    ///
    /// Returns false (and changes nothing) while transfers are in flight.
    #[must_use]
    pub fn allocate(&mut self, capacity: usize, packets_per_transfer: usize, packet_size: usize) -> bool {
        if self.in_flight() > 0 {
            return false;
        }
        self.slots = (0..capacity)
            .map(|_| Slot::Free(IsoTransfer::new(packets_per_transfer, packet_size, SENTINEL)))
            .collect();
        self.packets_per_transfer = packets_per_transfer;
        self.packet_size = packet_size;
        self.outstanding = 0;
        self.completed = 0;
        true
    }

    /// Drops every buffer. Returns false while transfers are in flight.
    #[must_use]
    pub fn free(&mut self) -> bool {
        if self.in_flight() > 0 {
            return false;
        }
        self.slots.clear();
        self.outstanding = 0;
        self.completed = 0;
        true
    }

    pub fn is_allocated(&self) -> bool {
        !self.slots.is_empty() && self.packet_size > 0 && self.packets_per_transfer > 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    pub fn in_flight(&self) -> usize {
        let cap = self.slots.len();
        if cap == 0 {
            return 0;
        }
        (self.outstanding + cap - self.completed) % cap
    }

    /// True if another transfer may be submitted.
    pub fn can_submit(&self) -> bool {
        self.capacity() > 1 && self.in_flight() < self.capacity() - 1
    }

    /// Resets both cursors. Only valid with nothing in flight.
    pub fn reset_cursors(&mut self) {
        if self.in_flight() == 0 {
            self.outstanding = 0;
            self.completed = 0;
        }
    }

    /// Writes the sentinel over every free buffer.
    pub fn fill_sentinel(&mut self) {
        for slot in &mut self.slots {
            if let Slot::Free(transfer) = slot {
                transfer.buffer.fill(SENTINEL);
                transfer.length = 0;
            }
        }
    }

    /// Takes the buffer at the submit cursor for filling.
    pub fn take_next(&mut self) -> Option<IsoTransfer> {
        let slot = self.slots.get_mut(self.outstanding)?;
        match std::mem::replace(slot, Slot::Vacant) {
            Slot::Free(transfer) => Some(transfer),
            other => {
                *slot = other;
                None
            }
        }
    }

    /// Puts an unsubmitted buffer back at the submit cursor.
    pub fn put_back(&mut self, transfer: IsoTransfer) {
        if let Some(slot) = self.slots.get_mut(self.outstanding) {
            *slot = Slot::Free(transfer);
        }
    }

    /// Records the buffer at the submit cursor as in flight and advances.
    pub fn mark_in_flight(&mut self, pending: Box<dyn PendingTransfer>) {
        let cap = self.slots.len();
        if let Some(slot) = self.slots.get_mut(self.outstanding) {
            *slot = Slot::InFlight(pending);
            self.outstanding = (self.outstanding + 1) % cap;
        }
    }

    /// The oldest in-flight transfer.
    pub fn oldest_mut(&mut self) -> Option<&mut Box<dyn PendingTransfer>> {
        if self.in_flight() == 0 {
            return None;
        }
        match self.slots.get_mut(self.completed) {
            Some(Slot::InFlight(pending)) => Some(pending),
            _ => None,
        }
    }

    /// Takes the oldest in-flight transfer out for completion.
    pub fn take_oldest(&mut self) -> Option<Box<dyn PendingTransfer>> {
        if self.in_flight() == 0 {
            return None;
        }
        let slot = self.slots.get_mut(self.completed)?;
        match std::mem::replace(slot, Slot::Vacant) {
            Slot::InFlight(pending) => Some(pending),
            other => {
                *slot = other;
                None
            }
        }
    }

    /// Returns a completed buffer to its slot and advances past it.
    pub fn finish_oldest(&mut self, transfer: IsoTransfer) {
        let cap = self.slots.len();
        if let Some(slot) = self.slots.get_mut(self.completed) {
            *slot = Slot::Free(transfer);
            self.completed = (self.completed + 1) % cap;
        }
    }

    /// Cancels every in-flight transfer, oldest first, reclaiming buffers.
    ///
    /// Returns how many were cancelled.
    pub fn cancel_all(&mut self) -> usize {
        let cap = self.slots.len();
        let mut cancelled = 0;
        while self.in_flight() > 0 {
            let slot = &mut self.slots[self.completed];
            if let Slot::InFlight(pending) = std::mem::replace(slot, Slot::Vacant) {
                *slot = Slot::Free(pending.cancel());
                cancelled += 1;
            }
            self.completed = (self.completed + 1) % cap;
        }
        self.repair();
        cancelled
    }

    /// Restores slots left vacant by an interrupted fill or post-process.
    ///
    /// A vacant slot at the completion cursor held a transfer that had
    /// already completed, so the cursor moves past it. Buffers that were lost
    /// are reallocated.
    pub fn repair(&mut self) -> usize {
        let cap = self.slots.len();
        let mut repaired = 0;
        for i in 0..cap {
            if matches!(self.slots[i], Slot::Vacant) {
                self.slots[i] = Slot::Free(IsoTransfer::new(
                    self.packets_per_transfer,
                    self.packet_size,
                    SENTINEL,
                ));
                if i == self.completed && self.in_flight() > 0 {
                    self.completed = (self.completed + 1) % cap;
                }
                repaired += 1;
            }
        }
        if repaired > 0 {
            warn!(repaired, "reallocated transfer buffers after an interrupted quantum");
        }
        repaired
    }
}
