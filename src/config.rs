// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Configuration for rings and client sessions.

use crate::saturating::DEFAULT_MAX_RETRIES;

/// Default number of registrations held while the daemon is away.
pub const DEFAULT_REQUEST_CACHE_CAPACITY: usize = 16;

/// Default number of shared memory objects one session may register.
pub const DEFAULT_MAX_SHM_OBJECTS: usize = 32;

/// Configuration for a shared ring buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingConfig {
    /// Object name (`/` is prepended by the POSIX provider).
    pub name: String,
    /// Number of slots. Fixed for the lifetime of the object.
    pub capacity: usize,
    /// CAS attempts per ticket claim before `RetriesExhausted`.
    pub max_retries: u32,
}

impl RingConfig {
    pub fn new(name: &str, capacity: usize) -> Self {
        Self {
            name: name.to_owned(),
            capacity,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// Configuration for a [`ClientSession`](crate::ClientSession).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Name the client registers under.
    pub client_name: String,
    /// Registrations kept for replay while disconnected.
    pub request_cache_capacity: usize,
    /// Upper bound on registered shared memory objects.
    pub max_shm_objects: usize,
    /// Retry budget for rings created through the session.
    pub max_retries: u32,
}

impl SessionConfig {
    pub fn new(client_name: &str) -> Self {
        Self {
            client_name: client_name.to_owned(),
            request_cache_capacity: DEFAULT_REQUEST_CACHE_CAPACITY,
            max_shm_objects: DEFAULT_MAX_SHM_OBJECTS,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_request_cache_capacity(mut self, capacity: usize) -> Self {
        self.request_cache_capacity = capacity;
        self
    }

    pub fn with_max_shm_objects(mut self, max: usize) -> Self {
        self.max_shm_objects = max;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let ring = RingConfig::new("r", 8);
        assert_eq!(ring.max_retries, DEFAULT_MAX_RETRIES);

        let session = SessionConfig::new("client").with_max_shm_objects(4);
        assert_eq!(session.request_cache_capacity, DEFAULT_REQUEST_CACHE_CAPACITY);
        assert_eq!(session.max_shm_objects, 4);
    }
}
