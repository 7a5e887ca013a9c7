// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Slot array stored directly after the ring control block.
//
// Each slot carries a 64-bit state word `[lap: bits 2..63][tag: bits 0..1]`
// and one fixed-size record. The tag walks Empty -> Writing -> Ready ->
// Reading -> Empty and every edge is a CAS on the state word, so whoever moved
// a slot into Writing or Reading holds its record exclusively until the next
// edge. The lap counts how many times the slot has gone round the ring and
// keeps a stale ticket from matching a recycled slot.

use std::cell::UnsafeCell;
use std::ptr;

use crate::error::{Error, ErrorCode, Result};
use crate::sync::{AtomicU64, Ordering};

const TAG_BITS: u32 = 2;
const TAG_MASK: u64 = (1 << TAG_BITS) - 1;

/// Lifecycle tag of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SlotState {
    Empty = 0,
    Writing = 1,
    Ready = 2,
    Reading = 3,
}

impl SlotState {
    fn from_tag(tag: u64) -> Self {
        match tag & TAG_MASK {
            0 => SlotState::Empty,
            1 => SlotState::Writing,
            2 => SlotState::Ready,
            _ => SlotState::Reading,
        }
    }

    /// The only state this one may move to.
    pub const fn successor(self) -> SlotState {
        match self {
            SlotState::Empty => SlotState::Writing,
            SlotState::Writing => SlotState::Ready,
            SlotState::Ready => SlotState::Reading,
            SlotState::Reading => SlotState::Empty,
        }
    }

    pub const fn can_transition_to(self, to: SlotState) -> bool {
        self.successor() as u8 == to as u8
    }
}

#[inline]
pub(crate) const fn pack(lap: u64, state: SlotState) -> u64 {
    (lap << TAG_BITS) | state as u64
}

#[inline]
pub(crate) fn unpack(word: u64) -> (u64, SlotState) {
    (word >> TAG_BITS, SlotState::from_tag(word))
}

// ---------------------------------------------------------------------------
// Slot
// ---------------------------------------------------------------------------

/// One record position in the ring.
#[repr(C)]
pub struct Slot<T> {
    state: AtomicU64,
    record: UnsafeCell<T>,
}

impl<T> Slot<T> {
    /// Current `(lap, state)` with `Acquire` ordering.
    pub fn load(&self) -> (u64, SlotState) {
        unpack(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn matches(&self, lap: u64, state: SlotState) -> bool {
        self.state.load(Ordering::Acquire) == pack(lap, state)
    }

    /// Raw pointer to the record.
    ///
    /// Dereferencing is only sound while the caller holds the slot in
    /// `Writing` (for writes) or `Reading` (for reads).
    pub(crate) fn record_ptr(&self) -> *mut T {
        self.record.get()
    }
}

// ---------------------------------------------------------------------------
// SlotArray
// ---------------------------------------------------------------------------

/// A borrowed view over `capacity` slots in a mapped region.
pub struct SlotArray<'a, T> {
    slots: &'a [Slot<T>],
}

impl<'a, T> SlotArray<'a, T> {
    /// Write `capacity` fresh slots at `base`, all `(lap 0, Empty)`.
    ///
    /// # Safety
    /// `base` must be valid for writes of `capacity` slots, suitably aligned,
    /// and not yet visible to any other party.
    pub(crate) unsafe fn init_in_place(base: *mut Slot<T>, capacity: usize)
    where
        T: Default,
    {
        for i in 0..capacity {
            ptr::write(
                base.add(i),
                Slot {
                    state: AtomicU64::new(pack(0, SlotState::Empty)),
                    record: UnsafeCell::new(T::default()),
                },
            );
        }
    }

    /// View already-initialised slots.
    ///
    /// # Safety
    /// `base` must point to `capacity` initialised slots that outlive `'a`.
    pub(crate) unsafe fn from_raw(base: *const Slot<T>, capacity: usize) -> Self {
        Self {
            slots: std::slice::from_raw_parts(base, capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Slot by index.
    pub fn get(&self, index: usize) -> Result<&'a Slot<T>> {
        self.slots
            .get(index)
            .ok_or(Error::with_context(ErrorCode::IndexOutOfBounds, "slot index"))
    }

    /// `(lap, state)` of the slot at `index`.
    pub fn state(&self, index: usize) -> Result<(u64, SlotState)> {
        Ok(self.get(index)?.load())
    }

    /// Every slot's `(lap, state)`, in index order.
    pub fn snapshot(&self) -> Vec<(u64, SlotState)> {
        self.slots.iter().map(Slot::load).collect()
    }

    /// Slot index and lap that `ticket` maps to.
    #[inline]
    pub fn position(&self, ticket: u64) -> (usize, u64) {
        let cap = self.slots.len() as u64;
        ((ticket % cap) as usize, ticket / cap)
    }

    /// Slot that `ticket` maps to.
    #[inline]
    pub(crate) fn slot_for(&self, ticket: u64) -> &'a Slot<T> {
        let (index, _) = self.position(ticket);
        &self.slots[index]
    }

    /// Whether the slot for `ticket` is in `state` on the ticket's lap.
    #[inline]
    pub(crate) fn ticket_is(&self, ticket: u64, state: SlotState) -> bool {
        let (index, lap) = self.position(ticket);
        self.slots[index].matches(lap, state)
    }

    /// Move slot `index` from `(lap, from)` to `to`.
    ///
    /// Illegal edges are rejected before memory is touched. The `Reading ->
    /// Empty` edge advances the lap. A CAS failure means the slot was not in
    /// the expected state and leaves it unchanged. Only the holder of the
    /// slot's ticket, or crash recovery, may move a slot.
    pub(crate) fn transition(&self, index: usize, lap: u64, from: SlotState, to: SlotState) -> Result<()> {
        if !from.can_transition_to(to) {
            return Err(Error::with_context(ErrorCode::InvalidState, "illegal slot transition"));
        }
        let slot = self.get(index)?;
        let next_lap = if to == SlotState::Empty { lap.wrapping_add(1) } else { lap };
        slot.state
            .compare_exchange(
                pack(lap, from),
                pack(next_lap, to),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(|_| Error::with_context(ErrorCode::InvalidState, "slot not in expected state"))
    }

    /// [`transition`](Self::transition) addressed by ticket.
    pub(crate) fn transition_ticket(&self, ticket: u64, from: SlotState, to: SlotState) -> Result<()> {
        let (index, lap) = self.position(ticket);
        self.transition(index, lap, from, to)
    }
}
