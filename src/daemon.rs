// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Request/response surface of the trace daemon.
//
// The wire encoding belongs to the transport; this module only fixes what a
// request and a response mean and how they are correlated.

use std::fmt;

use crate::error::{ErrorCode, Result};

/// Daemon-assigned client identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u32);

/// Per-request identifier, unique within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub u64);

/// Daemon-assigned handle of a registered shared memory object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShmObjectHandle(pub u32);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client#{}", self.0)
    }
}

impl fmt::Display for ShmObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shm#{}", self.0)
    }
}

/// How a shared memory object is identified to the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ShmObjectRef {
    /// Descriptor to be passed over the transport.
    Fd(i32),
    /// Object name the daemon can open itself.
    Path(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    RegisterClient { name: String },
    UnregisterClient,
    RegisterShmObject { object: ShmObjectRef },
    UnregisterShmObject { handle: ShmObjectHandle },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestEnvelope {
    /// Absent until the daemon has assigned one.
    pub client_id: Option<ClientId>,
    pub message_id: MessageId,
    pub request: Request,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    ClientRegistered { client_id: ClientId },
    ShmObjectRegistered { handle: ShmObjectHandle },
    Ack,
    /// The daemon refused the request for the given reason.
    Rejected { code: ErrorCode },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseEnvelope {
    pub client_id: Option<ClientId>,
    pub message_id: MessageId,
    pub response: Response,
}

/// Connection to the daemon.
///
/// `send` is a request/response round trip. A transport that cannot reach the
/// daemon returns `DaemonUnavailable`.
pub trait DaemonTransport: Send {
    /// Whether the daemon currently accepts requests.
    fn is_available(&self) -> bool;

    fn send(&mut self, request: &RequestEnvelope) -> Result<ResponseEnvelope>;
}
