// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Ring control block: the header at offset 0 of every ring buffer object.
//
// Two saturating ticket counters drive the ring. `acquire` hands out producer
// tickets and `release` hands out consumer tickets; ticket `t` addresses slot
// `t % capacity` on lap `t / capacity`. A ticket is only claimed when its slot
// is in the state the claiming side needs (Empty for producers, Ready for
// consumers), so neither side ever waits on the other.

use std::mem::{align_of, size_of};
use std::ptr;

use crate::error::{Error, ErrorCode, Result};
use crate::saturating::{ClaimError, SaturatingCounter};
use crate::slot::{Slot, SlotArray, SlotState};
use crate::sync::{AtomicU64, Ordering};

/// "TRCRING1", published last when a ring is created.
pub const RING_MAGIC: u64 = u64::from_le_bytes(*b"TRCRING1");

/// Bumped whenever the shared layout changes.
pub const LAYOUT_VERSION: u32 = 1;

/// Counter bits of the ticket counters (flag in bit 63).
pub const TICKET_BITS: u32 = 63;

pub type TicketCounter = SaturatingCounter<AtomicU64, TICKET_BITS>;

#[repr(C, align(64))]
struct CacheLine<T>(T);

/// Shared header of a ring buffer.
#[repr(C)]
pub struct RingControlBlock {
    magic: AtomicU64,
    layout_version: u32,
    slot_size: u32,
    slot_align: u32,
    _reserved: u32,
    capacity: u64,
    acquire: CacheLine<TicketCounter>,
    release: CacheLine<TicketCounter>,
}

#[cfg(not(feature = "loom"))]
const _: () = assert!(size_of::<RingControlBlock>() == 192);

/// Bytes needed for a control block followed by `capacity` slots of `T`.
pub fn layout_size<T>(capacity: usize) -> Option<usize> {
    capacity
        .checked_mul(size_of::<Slot<T>>())?
        .checked_add(size_of::<RingControlBlock>())
}

impl RingControlBlock {
    /// Write an unpublished control block at `this`.
    ///
    /// # Safety
    /// `this` must be valid for writes, 64-byte aligned and not yet visible
    /// to any other party.
    pub(crate) unsafe fn init_in_place<T>(this: *mut Self, capacity: usize, max_retries: u32) {
        ptr::write(
            this,
            Self {
                magic: AtomicU64::new(0),
                layout_version: LAYOUT_VERSION,
                slot_size: size_of::<Slot<T>>() as u32,
                slot_align: align_of::<Slot<T>>() as u32,
                _reserved: 0,
                capacity: capacity as u64,
                acquire: CacheLine(TicketCounter::with_max_retries(max_retries)),
                release: CacheLine(TicketCounter::with_max_retries(max_retries)),
            },
        );
    }

    /// Make the block visible to attaching processes. Everything written
    /// before this call happens-before a successful [`validate`](Self::validate).
    pub(crate) fn publish(&self) {
        self.magic.store(RING_MAGIC, Ordering::Release);
    }

    /// Check the stamp written at creation against what this process expects
    /// and against the size reported by the mapped object.
    pub fn validate(&self, object_size: usize, slot_size: usize, slot_align: usize) -> Result<()> {
        match self.magic.load(Ordering::Acquire) {
            RING_MAGIC => {}
            0 => return Err(Error::with_context(ErrorCode::NotInitialized, "ring not yet published")),
            _ => return Err(Error::with_context(ErrorCode::CorruptionDetected, "bad ring magic")),
        }
        if self.layout_version != LAYOUT_VERSION {
            return Err(Error::with_context(
                ErrorCode::SharedMemoryLayoutMismatch,
                "layout version differs",
            ));
        }
        if self.slot_size as usize != slot_size || self.slot_align as usize != slot_align {
            return Err(Error::with_context(
                ErrorCode::SharedMemoryLayoutMismatch,
                "slot layout differs",
            ));
        }
        if self.capacity == 0 {
            return Err(Error::with_context(ErrorCode::CorruptionDetected, "zero capacity"));
        }
        let expected = usize::try_from(self.capacity)
            .ok()
            .and_then(|cap| cap.checked_mul(slot_size))
            .and_then(|slots| slots.checked_add(size_of::<Self>()));
        if expected != Some(object_size) {
            return Err(Error::with_context(
                ErrorCode::SharedMemoryLayoutMismatch,
                "recorded capacity does not match object size",
            ));
        }
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    pub fn layout_version(&self) -> u32 {
        self.layout_version
    }

    pub fn acquire_counter(&self) -> &TicketCounter {
        &self.acquire.0
    }

    pub fn release_counter(&self) -> &TicketCounter {
        &self.release.0
    }

    /// Produced-but-not-consumed tickets. Racy by nature; a hint only.
    pub fn len_hint(&self) -> usize {
        let acquired = self.acquire.0.load();
        let released = self.release.0.load();
        acquired.saturating_sub(released) as usize
    }

    // --- producer side ---

    /// Claim the next producer ticket and move its slot `Empty -> Writing`.
    ///
    /// `Full` covers both a momentarily full ring and a saturated ticket
    /// counter; contention past the retry budget is `RetriesExhausted`.
    pub fn acquire_slot<T>(&self, slots: &SlotArray<'_, T>) -> Result<u64> {
        let ticket = self
            .acquire
            .0
            .increment_if(|t| slots.ticket_is(t, SlotState::Empty))
            .map_err(|e| match e {
                ClaimError::Saturated | ClaimError::Unavailable => Error::new(ErrorCode::Full),
                ClaimError::RetriesExhausted => Error::new(ErrorCode::RetriesExhausted),
            })?;
        slots
            .transition_ticket(ticket, SlotState::Empty, SlotState::Writing)
            .map_err(|_| Error::with_context(ErrorCode::CorruptionDetected, "claimed slot was not empty"))?;
        Ok(ticket)
    }

    /// Publish a written slot: `Writing -> Ready`.
    pub fn commit<T>(&self, slots: &SlotArray<'_, T>, ticket: u64) -> Result<()> {
        slots
            .transition_ticket(ticket, SlotState::Writing, SlotState::Ready)
            .map_err(|_| Error::with_context(ErrorCode::CorruptionDetected, "committed slot was not writing"))
    }

    // --- consumer side ---

    /// Claim the next consumer ticket and move its slot `Ready -> Reading`.
    ///
    /// `Empty` covers both a momentarily empty ring and a saturated ticket
    /// counter.
    pub fn acquire_ready_slot<T>(&self, slots: &SlotArray<'_, T>) -> Result<u64> {
        let ticket = self
            .release
            .0
            .increment_if(|t| slots.ticket_is(t, SlotState::Ready))
            .map_err(|e| match e {
                ClaimError::Saturated | ClaimError::Unavailable => Error::new(ErrorCode::Empty),
                ClaimError::RetriesExhausted => Error::new(ErrorCode::RetriesExhausted),
            })?;
        slots
            .transition_ticket(ticket, SlotState::Ready, SlotState::Reading)
            .map_err(|_| Error::with_context(ErrorCode::CorruptionDetected, "claimed slot was not ready"))?;
        Ok(ticket)
    }

    /// Hand a consumed slot back to producers: `Reading -> Empty`, next lap.
    pub fn finish_read<T>(&self, slots: &SlotArray<'_, T>, ticket: u64) -> Result<()> {
        slots
            .transition_ticket(ticket, SlotState::Reading, SlotState::Empty)
            .map_err(|_| Error::with_context(ErrorCode::CorruptionDetected, "released slot was not reading"))
    }

    // --- crash recovery ---

    /// Hand slots left in `Reading` by a dead consumer back to producers.
    ///
    /// Each such slot moves to `Empty` on its next lap; the record it held
    /// is lost. Returns the number of slots released.
    ///
    /// # Safety
    /// No live consumer may hold a slot in `Reading`. A restarted consumer
    /// calls this before it consumes anything, while it is the ring's only
    /// consumer.
    pub unsafe fn release_abandoned_reads<T>(&self, slots: &SlotArray<'_, T>) -> usize {
        let mut released = 0;
        for index in 0..slots.capacity() {
            let Ok((lap, state)) = slots.state(index) else { continue };
            if state == SlotState::Reading
                && slots.transition(index, lap, SlotState::Reading, SlotState::Empty).is_ok()
            {
                released += 1;
            }
        }
        released
    }

    /// Publish slots abandoned by dead producers.
    ///
    /// Covers slots left in `Writing`, and slots whose ticket was claimed but
    /// which never left `Empty`. The record is reset to `T::default()` before
    /// the slot becomes `Ready`, so consumers never see a torn record and the
    /// ticket order keeps moving. Returns the number of slots published.
    ///
    /// # Safety
    /// No live producer may be between claiming a ticket and committing it.
    pub unsafe fn publish_abandoned_writes<T: Default>(&self, slots: &SlotArray<'_, T>) -> usize {
        let claimed = self.acquire.0.load();
        let capacity = slots.capacity() as u64;
        let mut published = 0;
        for index in 0..slots.capacity() {
            let Ok(slot) = slots.get(index) else { continue };
            let (lap, state) = slot.load();
            let orphaned = match state {
                SlotState::Writing => true,
                SlotState::Empty => {
                    lap * capacity + (index as u64) < claimed
                        && slots.transition(index, lap, SlotState::Empty, SlotState::Writing).is_ok()
                }
                _ => false,
            };
            if !orphaned {
                continue;
            }
            // Safety: the writer is gone, so the record is ours until the
            // transition below.
            unsafe { ptr::write(slot.record_ptr(), T::default()) };
            if slots.transition(index, lap, SlotState::Writing, SlotState::Ready).is_ok() {
                published += 1;
            }
        }
        published
    }
}
