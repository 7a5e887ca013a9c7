// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Atomics used by the lock-free structures. Under the `loom` feature these
// resolve to loom's model-checked types so the same algorithms can be run
// through `loom::model`.

#[cfg(not(feature = "loom"))]
pub use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};
#[cfg(feature = "loom")]
pub use loom::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};

#[cfg(feature = "loom")]
pub use loom::thread;
