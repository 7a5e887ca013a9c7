// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Lock-free multi-producer multi-consumer ring buffer over a named shared
// memory object.
//
// Object layout:
//   [RingControlBlock: 192 bytes][Slot<T>; capacity]
//
// The object is exactly that size; every open re-derives the expected size
// from the capacity recorded in the header and refuses anything else.

use std::fmt;
use std::marker::PhantomData;
use std::mem::{align_of, size_of};

use crate::config::RingConfig;
use crate::control::{layout_size, RingControlBlock};
use crate::error::{Error, ErrorCode, Result};
use crate::shm::{MappedRegion, SharedMemoryProvider, REGION_ALIGN};
use crate::sink::RecordSink;
use crate::slot::{Slot, SlotArray};

const HEADER_SIZE: usize = size_of::<RingControlBlock>();

/// A ring buffer of `T` records living in shared memory.
///
/// Any number of producers and consumers, in any number of processes, may
/// hold a handle to the same ring. No operation blocks: a producer facing a
/// full ring gets `Full`, a consumer facing an empty ring gets `Empty`, and
/// contention beyond the retry budget is reported as `RetriesExhausted`.
///
/// Dropping a handle unmaps the object but never removes it; use
/// [`SharedRingBuffer::remove`] for that.
pub struct SharedRingBuffer<T: Copy + Default + Send + 'static> {
    region: Box<dyn MappedRegion>,
    name: String,
    _marker: PhantomData<T>,
}

// Safety: records are only touched by the party holding their slot in
// Writing or Reading, and `T: Send` lets them move between threads.
unsafe impl<T: Copy + Default + Send + 'static> Sync for SharedRingBuffer<T> {}

impl<T: Copy + Default + Send + 'static> SharedRingBuffer<T> {
    fn check_slot_layout() -> Result<()> {
        if align_of::<Slot<T>>() > REGION_ALIGN {
            return Err(Error::with_context(
                ErrorCode::InvalidArgument,
                "record alignment exceeds region alignment",
            ));
        }
        if u32::try_from(size_of::<Slot<T>>()).is_err() {
            return Err(Error::with_context(ErrorCode::InvalidArgument, "record too large"));
        }
        Ok(())
    }

    fn check_alignment(region: &dyn MappedRegion) -> Result<()> {
        if region.as_ptr() as usize % REGION_ALIGN != 0 {
            return Err(Error::with_context(
                ErrorCode::SharedMemoryMapFailure,
                "mapping is not cache-line aligned",
            ));
        }
        Ok(())
    }

    /// Create a new ring object sized for `config.capacity` records.
    ///
    /// Fails if an object with that name already exists.
    pub fn create(provider: &dyn SharedMemoryProvider, config: &RingConfig) -> Result<Self> {
        if config.capacity == 0 {
            return Err(Error::with_context(ErrorCode::InvalidArgument, "ring capacity is zero"));
        }
        Self::check_slot_layout()?;
        let size = layout_size::<T>(config.capacity)
            .ok_or(Error::with_context(ErrorCode::InvalidArgument, "ring size overflows"))?;

        let region = provider.create(&config.name, size)?;
        if region.len() != size {
            return Err(Error::with_context(
                ErrorCode::SharedMemoryLayoutMismatch,
                "created object has unexpected size",
            ));
        }
        Self::check_alignment(region.as_ref())?;

        let base = region.as_ptr();
        // Safety: the object was just created, is large enough and aligned,
        // and nobody can validate it until the magic is published.
        unsafe {
            SlotArray::<T>::init_in_place(base.add(HEADER_SIZE) as *mut Slot<T>, config.capacity);
            RingControlBlock::init_in_place::<T>(
                base as *mut RingControlBlock,
                config.capacity,
                config.max_retries,
            );
        }

        let ring = Self {
            region,
            name: config.name.clone(),
            _marker: PhantomData,
        };
        ring.control().publish();
        tracing::debug!(
            name = %ring.name,
            capacity = config.capacity,
            slot_size = size_of::<Slot<T>>(),
            size,
            "created ring"
        );
        Ok(ring)
    }

    /// Attach to an existing ring.
    ///
    /// A ring whose creator has not finished initialising it yields
    /// `NotInitialized`; retry later. Any disagreement between the recorded
    /// layout, this process's record type, and the object's size is
    /// `SharedMemoryLayoutMismatch` and the mapping is released.
    pub fn open(provider: &dyn SharedMemoryProvider, name: &str) -> Result<Self> {
        Self::check_slot_layout()?;
        let region = provider.open(name)?;
        if region.len() < HEADER_SIZE {
            tracing::error!(name, size = region.len(), "object smaller than ring header");
            return Err(Error::with_context(
                ErrorCode::SharedMemoryLayoutMismatch,
                "object smaller than ring header",
            ));
        }
        Self::check_alignment(region.as_ref())?;

        let ring = Self {
            region,
            name: name.to_owned(),
            _marker: PhantomData,
        };
        let validated = ring.control().validate(
            ring.region.len(),
            size_of::<Slot<T>>(),
            align_of::<Slot<T>>(),
        );
        if let Err(e) = validated {
            if e.is_fatal() {
                tracing::error!(name, error = %e, "refusing to attach to ring");
            }
            return Err(e);
        }
        tracing::debug!(name, capacity = ring.capacity(), "opened ring");
        Ok(ring)
    }

    /// Create the ring, or attach to it if it already exists.
    pub fn create_or_open(provider: &dyn SharedMemoryProvider, config: &RingConfig) -> Result<Self> {
        match Self::create(provider, config) {
            Err(e)
                if e.code() == ErrorCode::SharedMemoryCreationFailure
                    && e.os_error().map(|io| io.kind()) == Some(std::io::ErrorKind::AlreadyExists) =>
            {
                Self::open(provider, &config.name)
            }
            other => other,
        }
    }

    /// Remove the named object. Mapped handles stay usable.
    pub fn remove(provider: &dyn SharedMemoryProvider, name: &str) -> Result<()> {
        provider.remove(name)
    }

    pub fn control(&self) -> &RingControlBlock {
        // Safety: validated or initialised at construction; the region
        // outlives `self`.
        unsafe { &*(self.region.as_ptr() as *const RingControlBlock) }
    }

    pub fn slots(&self) -> SlotArray<'_, T> {
        // Safety: the slot array follows the header and was sized against
        // the recorded capacity.
        unsafe {
            SlotArray::from_raw(
                self.region.as_ptr().add(HEADER_SIZE) as *const Slot<T>,
                self.control().capacity(),
            )
        }
    }

    pub fn capacity(&self) -> usize {
        self.control().capacity()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Descriptor of the backing object, where the provider has one.
    pub fn raw_fd(&self) -> Option<i32> {
        self.region.raw_fd()
    }

    /// Records produced but not yet consumed. Racy; a hint only.
    pub fn len_hint(&self) -> usize {
        self.control().len_hint()
    }

    // --- producer side ---

    /// Copy `record` into the next free slot.
    pub fn produce(&self, record: &T) -> Result<()> {
        self.produce_with(|slot| *slot = *record)
    }

    /// Fill the next free slot in place.
    ///
    /// If `fill` panics the slot is still published so the ring keeps
    /// moving; consumers then see whatever `fill` had written.
    pub fn produce_with<F: FnOnce(&mut T)>(&self, fill: F) -> Result<()> {
        let control = self.control();
        let slots = self.slots();
        let ticket = control.acquire_slot(&slots)?;
        let guard = SlotGuard::new(&slots, ticket, |slots, t| control.commit(slots, t));
        // Safety: the slot is ours while it is Writing.
        fill(unsafe { &mut *slots.slot_for(ticket).record_ptr() });
        guard.finish()?;
        tracing::trace!(name = %self.name, ticket, "produced");
        Ok(())
    }

    /// Produce, dropping the record on any recoverable failure.
    ///
    /// Returns whether the record was written. Fatal errors are returned.
    pub fn try_produce(&self, record: &T) -> Result<bool> {
        match self.produce(record) {
            Ok(()) => Ok(true),
            Err(e) if e.is_recoverable() => {
                tracing::trace!(name = %self.name, code = %e.code(), "dropped record");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    // --- consumer side ---

    /// Copy out the oldest ready record.
    pub fn consume(&self) -> Result<T> {
        self.consume_with(|record| *record)
    }

    /// Read the oldest ready record in place.
    pub fn consume_with<R, F: FnOnce(&T) -> R>(&self, read: F) -> Result<R> {
        let control = self.control();
        let slots = self.slots();
        let ticket = control.acquire_ready_slot(&slots)?;
        let guard = SlotGuard::new(&slots, ticket, |slots, t| control.finish_read(slots, t));
        // Safety: the slot is ours while it is Reading.
        let out = read(unsafe { &*slots.slot_for(ticket).record_ptr() });
        guard.finish()?;
        tracing::trace!(name = %self.name, ticket, "consumed");
        Ok(out)
    }

    /// Consume up to `max` records into `sink`.
    ///
    /// Stops early when the ring is empty or contended. A recoverable sink
    /// error drops that record; a fatal one ends the drain. Returns the
    /// number of records taken off the ring.
    pub fn drain<S: RecordSink<T> + ?Sized>(&self, sink: &mut S, max: usize) -> Result<usize> {
        let mut taken = 0;
        while taken < max {
            let record = match self.consume() {
                Ok(record) => record,
                Err(e) if matches!(e.code(), ErrorCode::Empty | ErrorCode::RetriesExhausted) => break,
                Err(e) => return Err(e),
            };
            taken += 1;
            if let Err(e) = sink.emit(&record) {
                if e.is_fatal() {
                    tracing::error!(name = %self.name, error = %e, "sink failed");
                    return Err(e);
                }
                tracing::warn!(name = %self.name, error = %e, "sink dropped record");
            }
        }
        Ok(taken)
    }

    // --- crash recovery ---

    /// Release slots a crashed consumer left in `Reading`, so producers can
    /// wrap onto them again. The records they held are lost.
    ///
    /// # Safety
    /// The caller must be the ring's only live consumer and must not be
    /// inside [`consume_with`](Self::consume_with), e.g. a daemon that has
    /// just restarted and attached.
    pub unsafe fn release_abandoned_reads(&self) -> usize {
        let released = unsafe { self.control().release_abandoned_reads(&self.slots()) };
        if released > 0 {
            tracing::warn!(name = %self.name, released, "released slots of a dead consumer");
        }
        released
    }

    /// Publish slots crashed producers claimed but never committed, each as
    /// `T::default()`, so consumers can move past them.
    ///
    /// # Safety
    /// No live producer may be inside [`produce_with`](Self::produce_with),
    /// e.g. every process writing to this ring has exited.
    pub unsafe fn publish_abandoned_writes(&self) -> usize {
        let published = unsafe { self.control().publish_abandoned_writes(&self.slots()) };
        if published > 0 {
            tracing::warn!(name = %self.name, published, "published slots of a dead producer");
        }
        published
    }
}

impl<T: Copy + Default + Send + 'static> fmt::Debug for SharedRingBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedRingBuffer")
            .field("name", &self.name)
            .field("capacity", &self.capacity())
            .field("len_hint", &self.len_hint())
            .finish()
    }
}

/// Completes the slot edge after a claim, also when the caller panics.
struct SlotGuard<'s, 'a, T, F>
where
    F: FnMut(&SlotArray<'a, T>, u64) -> Result<()>,
{
    slots: &'s SlotArray<'a, T>,
    ticket: u64,
    complete: F,
    armed: bool,
}

impl<'s, 'a, T, F> SlotGuard<'s, 'a, T, F>
where
    F: FnMut(&SlotArray<'a, T>, u64) -> Result<()>,
{
    fn new(slots: &'s SlotArray<'a, T>, ticket: u64, complete: F) -> Self {
        Self { slots, ticket, complete, armed: true }
    }

    fn finish(mut self) -> Result<()> {
        self.armed = false;
        (self.complete)(self.slots, self.ticket)
    }
}

impl<'s, 'a, T, F> Drop for SlotGuard<'s, 'a, T, F>
where
    F: FnMut(&SlotArray<'a, T>, u64) -> Result<()>,
{
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = (self.complete)(self.slots, self.ticket) {
                tracing::error!(ticket = self.ticket, error = %e, "slot release after panic failed");
            }
        }
    }
}
