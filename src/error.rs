// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Error domain shared by every component of the trace transport.
// Each code is classified as recoverable or fatal; callers consult
// `ErrorCode::severity` to decide between retry/backoff and teardown.

use std::fmt;
use std::io;

/// How a caller is allowed to react to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    /// Retry, back off, drop the event or continue without the registration.
    Recoverable,
    /// Stop using the affected shared structure and unwind the session.
    Fatal,
}

/// Every failure kind reported by the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum ErrorCode {
    // --- recoverable ---
    #[error("no empty element in the ring buffer could be acquired")]
    Full,
    #[error("no ready element in the ring buffer could be acquired")]
    Empty,
    #[error("atomic access failed after the maximum number of retries")]
    RetriesExhausted,
    #[error("not enough memory in container")]
    ContainerExhausted,
    #[error("index is out of bounds")]
    IndexOutOfBounds,
    #[error("shared-memory object is already registered with this file descriptor/path")]
    DuplicateRegistration,
    #[error("response id does not match the outstanding request")]
    IdMismatch,
    #[error("daemon is not available")]
    DaemonUnavailable,
    #[error("invalid slot state transition")]
    InvalidState,
    #[error("ring buffer not initialized")]
    NotInitialized,
    #[error("client id not found")]
    ClientNotFound,
    #[error("failed to send the message")]
    MessageSendFailed,
    #[error("client name is already used by a different process")]
    ClientNameAlreadyUsed,
    #[error("wrong shared-memory object handle")]
    WrongHandle,

    // --- fatal ---
    #[error("memory corruption detected")]
    CorruptionDetected,
    #[error("calculated shared memory size doesn't match the size of the created shared memory")]
    SharedMemoryLayoutMismatch,
    #[error("failed to create shared memory for the ring buffer")]
    SharedMemoryCreationFailure,
    #[error("failed to open shared memory handle of the ring buffer")]
    SharedMemoryHandleOpenFailure,
    #[error("failed to seal shared memory of the ring buffer")]
    SharedMemorySealFailure,
    #[error("failed to map memory region of the ring buffer")]
    SharedMemoryMapFailure,
    #[error("failed to query the size of the ring buffer shared memory")]
    SharedMemorySizeQueryFailure,
    #[error("allocator initialization failed")]
    AllocatorInitFailure,
    #[error("failed to replay cached registration requests")]
    ReplayCacheFailure,
    #[error("bad file descriptor")]
    BadFileDescriptor,
    #[error("no more space for a new client or shared-memory object")]
    NoSpaceForNewClientOrObject,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("failed to register a shared-memory object")]
    ShmObjectRegistrationFailed,
}

impl ErrorCode {
    /// The single classification consulted for retry-vs-abort decisions.
    pub const fn severity(self) -> Severity {
        match self {
            ErrorCode::Full
            | ErrorCode::Empty
            | ErrorCode::RetriesExhausted
            | ErrorCode::ContainerExhausted
            | ErrorCode::IndexOutOfBounds
            | ErrorCode::DuplicateRegistration
            | ErrorCode::IdMismatch
            | ErrorCode::DaemonUnavailable
            | ErrorCode::InvalidState
            | ErrorCode::NotInitialized
            | ErrorCode::ClientNotFound
            | ErrorCode::MessageSendFailed
            | ErrorCode::ClientNameAlreadyUsed
            | ErrorCode::WrongHandle => Severity::Recoverable,

            ErrorCode::CorruptionDetected
            | ErrorCode::SharedMemoryLayoutMismatch
            | ErrorCode::SharedMemoryCreationFailure
            | ErrorCode::SharedMemoryHandleOpenFailure
            | ErrorCode::SharedMemorySealFailure
            | ErrorCode::SharedMemoryMapFailure
            | ErrorCode::SharedMemorySizeQueryFailure
            | ErrorCode::AllocatorInitFailure
            | ErrorCode::ReplayCacheFailure
            | ErrorCode::BadFileDescriptor
            | ErrorCode::NoSpaceForNewClientOrObject
            | ErrorCode::InvalidArgument
            | ErrorCode::ShmObjectRegistrationFailed => Severity::Fatal,
        }
    }

    pub const fn is_recoverable(self) -> bool {
        matches!(self.severity(), Severity::Recoverable)
    }

    pub const fn is_fatal(self) -> bool {
        matches!(self.severity(), Severity::Fatal)
    }
}

/// An [`ErrorCode`] plus optional context and OS cause.
pub struct Error {
    code: ErrorCode,
    context: Option<&'static str>,
    source: Option<io::Error>,
}

impl Error {
    pub const fn new(code: ErrorCode) -> Self {
        Self { code, context: None, source: None }
    }

    /// Attach a short description of where the failure happened.
    pub const fn with_context(code: ErrorCode, context: &'static str) -> Self {
        Self { code, context: Some(context), source: None }
    }

    /// Wrap an OS error under `code`.
    pub fn from_io(code: ErrorCode, err: io::Error) -> Self {
        Self { code, context: None, source: Some(err) }
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn severity(&self) -> Severity {
        self.code.severity()
    }

    pub fn is_recoverable(&self) -> bool {
        self.code.is_recoverable()
    }

    pub fn is_fatal(&self) -> bool {
        self.code.is_fatal()
    }

    pub fn context(&self) -> Option<&'static str> {
        self.context
    }

    /// The OS error behind this failure, if any.
    pub fn os_error(&self) -> Option<&io::Error> {
        self.source.as_ref()
    }
}

impl From<ErrorCode> for Error {
    fn from(code: ErrorCode) -> Self {
        Self::new(code)
    }
}

impl PartialEq<ErrorCode> for Error {
    fn eq(&self, other: &ErrorCode) -> bool {
        self.code == *other
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Error")
            .field("code", &self.code)
            .field("severity", &self.code.severity())
            .field("context", &self.context)
            .field("source", &self.source)
            .finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code)?;
        if let Some(ctx) = self.context {
            write!(f, " ({ctx})")?;
        }
        if let Some(err) = &self.source {
            write!(f, ": {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e as &(dyn std::error::Error + 'static))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_conditions_are_recoverable() {
        for code in [
            ErrorCode::Full,
            ErrorCode::Empty,
            ErrorCode::RetriesExhausted,
            ErrorCode::ContainerExhausted,
            ErrorCode::IndexOutOfBounds,
            ErrorCode::DuplicateRegistration,
            ErrorCode::IdMismatch,
            ErrorCode::DaemonUnavailable,
            ErrorCode::WrongHandle,
        ] {
            assert_eq!(code.severity(), Severity::Recoverable, "{code:?}");
        }
    }

    #[test]
    fn shared_memory_and_replay_failures_are_fatal() {
        for code in [
            ErrorCode::CorruptionDetected,
            ErrorCode::SharedMemoryLayoutMismatch,
            ErrorCode::SharedMemoryCreationFailure,
            ErrorCode::AllocatorInitFailure,
            ErrorCode::ReplayCacheFailure,
            ErrorCode::NoSpaceForNewClientOrObject,
            ErrorCode::BadFileDescriptor,
        ] {
            assert!(code.is_fatal(), "{code:?}");
        }
    }

    #[test]
    fn display_includes_context_and_cause() {
        let err = Error::with_context(ErrorCode::Full, "acquire_slot");
        assert_eq!(err.to_string(), "no empty element in the ring buffer could be acquired (acquire_slot)");

        let err = Error::from_io(
            ErrorCode::SharedMemoryMapFailure,
            io::Error::from_raw_os_error(12),
        );
        assert!(err.is_fatal());
        assert!(std::error::Error::source(&err).is_some());
        assert_eq!(err, ErrorCode::SharedMemoryMapFailure);
    }
}
