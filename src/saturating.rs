// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Bit-packed saturating atomic counter.
//
// The counter occupies bits [0, N-1] of a single atomic word and bit N is the
// saturation flag. Increments never wrap: the increment that carries the
// counter past 2^N - 1 sets the flag, and every later increment reports
// `Saturated` without touching the word. Every read-modify-write loop is
// bounded by a retry budget so a frozen or descheduled peer process can never
// make a caller spin forever.

use crate::sync::{AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};

/// Retry budget used when none is given explicitly.
pub const DEFAULT_MAX_RETRIES: u32 = 100;

// ---------------------------------------------------------------------------
// AtomicWord: storage words a counter can be packed into
// ---------------------------------------------------------------------------

/// An unsigned atomic integer usable as counter storage.
///
/// Values cross this interface widened to `u64`; implementations truncate on
/// the way in, which is lossless because the counter never sets bits above
/// its flag.
pub trait AtomicWord: Send + Sync {
    /// Width of the underlying integer in bits.
    const BITS: u32;

    fn new(value: u64) -> Self;
    fn load(&self, order: Ordering) -> u64;
    fn swap(&self, value: u64, order: Ordering) -> u64;
    fn compare_exchange_weak(
        &self,
        current: u64,
        new: u64,
        success: Ordering,
        failure: Ordering,
    ) -> Result<u64, u64>;
    fn is_always_lock_free() -> bool;
}

macro_rules! atomic_word {
    ($atomic:ty, $prim:ty, $lock_free:expr) => {
        impl AtomicWord for $atomic {
            const BITS: u32 = <$prim>::BITS;

            #[inline]
            fn new(value: u64) -> Self {
                <$atomic>::new(value as $prim)
            }

            #[inline]
            fn load(&self, order: Ordering) -> u64 {
                <$atomic>::load(self, order) as u64
            }

            #[inline]
            fn swap(&self, value: u64, order: Ordering) -> u64 {
                <$atomic>::swap(self, value as $prim, order) as u64
            }

            #[inline]
            fn compare_exchange_weak(
                &self,
                current: u64,
                new: u64,
                success: Ordering,
                failure: Ordering,
            ) -> Result<u64, u64> {
                <$atomic>::compare_exchange_weak(
                    self,
                    current as $prim,
                    new as $prim,
                    success,
                    failure,
                )
                .map(|v| v as u64)
                .map_err(|v| v as u64)
            }

            #[inline]
            fn is_always_lock_free() -> bool {
                $lock_free
            }
        }
    };
}

atomic_word!(AtomicU8, u8, cfg!(target_has_atomic = "8"));
atomic_word!(AtomicU16, u16, cfg!(target_has_atomic = "16"));
atomic_word!(AtomicU32, u32, cfg!(target_has_atomic = "32"));
atomic_word!(AtomicU64, u64, cfg!(target_has_atomic = "64"));

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Why [`SaturatingCounter::increment`] did not increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncrementError {
    /// The flag bit is set; the counter will not move until reset.
    Saturated,
    /// Contention outlasted the retry budget.
    RetriesExhausted,
}

/// Why [`SaturatingCounter::increment_if`] did not claim a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimError {
    Saturated,
    /// The predicate rejected the current value and nobody else moved it.
    Unavailable,
    RetriesExhausted,
}

// ---------------------------------------------------------------------------
// SaturatingCounter
// ---------------------------------------------------------------------------

/// Atomic counter with `N` counter bits and one saturation flag bit, stored in
/// the atomic word `A`.
///
/// The struct is `#[repr(C)]` so it can be embedded in shared memory control
/// blocks; the retry budget is fixed at construction and travels with it.
///
/// Once [`is_saturated`](Self::is_saturated) returns `true` the value returned
/// by [`load`](Self::load) is no longer a count. The increment that sets the
/// flag leaves the counter field at 0, so callers must test the flag rather
/// than compare loaded values against [`MAX_COUNTER`](Self::MAX_COUNTER).
#[repr(C)]
pub struct SaturatingCounter<A: AtomicWord, const N: u32> {
    value: A,
    max_retries: u32,
}

impl<A: AtomicWord, const N: u32> SaturatingCounter<A, N> {
    const WIDTH_CHECK: () = assert!(
        N >= 1 && N < A::BITS && N < 64,
        "SaturatingCounter: N must leave room for the flag bit in the storage word"
    );

    const FLAG_MASK: u64 = 1u64 << N;
    const COUNTER_MASK: u64 = Self::FLAG_MASK - 1;

    /// Largest count representable before saturation: `2^N - 1`.
    pub const MAX_COUNTER: u64 = Self::COUNTER_MASK;

    /// A zeroed counter with the default retry budget.
    pub fn new() -> Self {
        Self::with_max_retries(DEFAULT_MAX_RETRIES)
    }

    /// A zeroed counter that gives up after `max_retries` CAS attempts.
    pub fn with_max_retries(max_retries: u32) -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::WIDTH_CHECK;
        Self {
            value: A::new(0),
            max_retries,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Whether the storage word is lock-free on this target.
    pub fn is_always_lock_free(&self) -> bool {
        A::is_always_lock_free()
    }

    /// Atomically add one.
    ///
    /// A saturated counter is reported without attempting a CAS. On contention
    /// the current value is reloaded and the CAS retried, at most
    /// `max_retries` times.
    pub fn increment(&self) -> Result<(), IncrementError> {
        let mut old = self.value.load(Ordering::Relaxed);
        for _ in 0..self.max_retries {
            if old & Self::FLAG_MASK != 0 {
                return Err(IncrementError::Saturated);
            }
            let counter = old & Self::COUNTER_MASK;
            match self.value.compare_exchange_weak(
                old,
                counter + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => old = actual,
            }
        }
        Err(IncrementError::RetriesExhausted)
    }

    /// Increment only if `available` accepts the current counter value, and
    /// return that value (the claimed ticket).
    ///
    /// When the predicate rejects a value the word is re-read; if it has not
    /// moved the call reports [`ClaimError::Unavailable`] without writing,
    /// otherwise the loop retries with the new value. The successful CAS is
    /// `AcqRel` so whatever the predicate observed happens-before the claim.
    pub fn increment_if<F>(&self, mut available: F) -> Result<u64, ClaimError>
    where
        F: FnMut(u64) -> bool,
    {
        let mut old = self.value.load(Ordering::Acquire);
        for _ in 0..self.max_retries {
            if old & Self::FLAG_MASK != 0 {
                return Err(ClaimError::Saturated);
            }
            let counter = old & Self::COUNTER_MASK;
            if !available(counter) {
                let now = self.value.load(Ordering::Acquire);
                if now == old {
                    return Err(ClaimError::Unavailable);
                }
                old = now;
                continue;
            }
            match self.value.compare_exchange_weak(
                old,
                counter + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(counter),
                Err(actual) => old = actual,
            }
        }
        Err(ClaimError::RetriesExhausted)
    }

    /// The counter field with the flag masked out.
    pub fn load(&self) -> u64 {
        self.value.load(Ordering::Relaxed) & Self::COUNTER_MASK
    }

    /// Like [`load`](Self::load) but with `Acquire` ordering.
    pub fn load_acquire(&self) -> u64 {
        self.value.load(Ordering::Acquire) & Self::COUNTER_MASK
    }

    pub fn is_saturated(&self) -> bool {
        self.value.load(Ordering::Relaxed) & Self::FLAG_MASK != 0
    }

    /// Atomically reset to zero.
    ///
    /// Returns the previous count and `false`, or `(MAX_COUNTER, true)` when
    /// the previous value was saturated.
    pub fn exchange_with_zero(&self) -> (u64, bool) {
        let prev = self.value.swap(0, Ordering::Relaxed);
        if prev & Self::FLAG_MASK != 0 {
            (Self::MAX_COUNTER, true)
        } else {
            (prev & Self::COUNTER_MASK, false)
        }
    }

    #[cfg(test)]
    pub(crate) fn store_raw(&self, raw: u64) {
        self.value.swap(raw, Ordering::Relaxed);
    }
}

impl<A: AtomicWord, const N: u32> Default for SaturatingCounter<A, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: AtomicWord, const N: u32> std::fmt::Debug for SaturatingCounter<A, N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaturatingCounter")
            .field("bits", &N)
            .field("counter", &self.load())
            .field("saturated", &self.is_saturated())
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Top-bit variant
// ---------------------------------------------------------------------------

/// Increment a bare atomic word whose most significant bit is the saturation
/// flag, with the default retry budget.
///
/// Equivalent to a `SaturatingCounter<A, {A::BITS - 1}>` for words that are
/// not wrapped in the counter type, e.g. fields of an existing layout.
pub fn increment_with_saturation<A: AtomicWord>(word: &A) -> Result<(), IncrementError> {
    let flag = 1u64 << (A::BITS - 1);
    let mask = flag - 1;
    let mut old = word.load(Ordering::Relaxed);
    for _ in 0..DEFAULT_MAX_RETRIES {
        if old & flag != 0 {
            return Err(IncrementError::Saturated);
        }
        match word.compare_exchange_weak(old, (old & mask) + 1, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return Ok(()),
            Err(actual) => old = actual,
        }
    }
    Err(IncrementError::RetriesExhausted)
}
