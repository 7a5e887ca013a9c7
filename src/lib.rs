// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Lock-free shared memory transport for cross-process trace pipelines.
// Client processes write trace records into named shared memory rings that an
// independently scheduled daemon drains; neither side ever blocks the other.

mod sync;

pub mod error;
pub use error::{Error, ErrorCode, Result, Severity};

pub mod saturating;
pub use saturating::{ClaimError, IncrementError, SaturatingCounter, DEFAULT_MAX_RETRIES};

pub mod slot;
pub use slot::{SlotArray, SlotState};

pub mod control;
pub use control::RingControlBlock;

pub mod shm_name;

pub mod shm;
pub use shm::{HeapShm, MappedRegion, SharedMemoryProvider};

pub mod platform;
#[cfg(unix)]
pub use platform::PosixShm;

pub mod config;
pub use config::{RingConfig, SessionConfig};

pub mod sink;
pub use sink::{RecordSink, TraceRecord, TracingSink};

mod ring;
pub use ring::SharedRingBuffer;

pub mod daemon;
pub use daemon::{
    ClientId, DaemonTransport, MessageId, Request, RequestEnvelope, Response, ResponseEnvelope,
    ShmObjectHandle, ShmObjectRef,
};

pub mod identity;
pub use identity::{DaemonIdentityResolver, FixedIdentity, PasswdIdentityResolver};

mod session;
pub use session::{ClientSession, SessionState, ShmObjectKey};

#[cfg(all(test, feature = "loom"))]
mod loom_tests;
