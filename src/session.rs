// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Per-process client session with the trace daemon.
//
// The session registers the client and its shared memory objects with the
// daemon. While the daemon is away, registrations are held in a bounded
// cache; when it comes back, everything the daemon knew about is registered
// again and the cache is replayed in submission order, each entry once.
//
//   Disconnected --daemon available--> Registering --replay ok--> Connected
//   Connected --daemon lost--> Degraded --daemon available--> Registering

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use slab::Slab;

use crate::config::{RingConfig, SessionConfig};
use crate::daemon::{
    ClientId, DaemonTransport, MessageId, Request, RequestEnvelope, Response, ShmObjectHandle,
    ShmObjectRef,
};
use crate::error::{Error, ErrorCode, Result};
use crate::identity::DaemonIdentityResolver;
use crate::ring::SharedRingBuffer;
use crate::shm::SharedMemoryProvider;

/// Connection state of a [`ClientSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Never reached the daemon.
    Disconnected,
    /// Replaying registrations to the daemon.
    Registering,
    Connected,
    /// Was connected; the daemon went away.
    Degraded,
}

/// Session-local key of a shared memory object registration.
///
/// Valid from the moment the registration is accepted, including while it
/// is still waiting in the cache for the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShmObjectKey(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingRequest {
    RegisterClient,
    RegisterShmObject { key: usize },
    /// A confirmed object dropped while the daemon was away.
    UnregisterShmObject { handle: ShmObjectHandle },
}

struct ShmObjectEntry {
    object: ShmObjectRef,
    /// Set once the daemon has confirmed the registration.
    handle: Option<ShmObjectHandle>,
    /// Submission order, for rebuilding in the order things were registered.
    seq: u64,
}

struct RingEntry {
    name: String,
    key: ShmObjectKey,
    ring: Arc<dyn Any + Send + Sync>,
}

/// A process's registration with the trace daemon.
pub struct ClientSession {
    config: SessionConfig,
    transport: Box<dyn DaemonTransport>,
    provider: Arc<dyn SharedMemoryProvider>,
    identity: Option<Arc<dyn DaemonIdentityResolver>>,

    state: SessionState,
    client_id: Option<ClientId>,
    client_requested: bool,
    pending: VecDeque<PendingRequest>,
    objects: Slab<ShmObjectEntry>,
    rings: Vec<RingEntry>,

    next_message_id: u64,
    next_seq: u64,
    /// The daemon may have lost everything it was told before.
    needs_rebuild: bool,
    /// Set by a fatal replay failure; the session is unusable afterwards.
    failed: Option<ErrorCode>,
}

impl ClientSession {
    pub fn new(
        config: SessionConfig,
        transport: Box<dyn DaemonTransport>,
        provider: Arc<dyn SharedMemoryProvider>,
    ) -> Self {
        let objects = Slab::with_capacity(config.max_shm_objects);
        let pending = VecDeque::with_capacity(config.request_cache_capacity);
        Self {
            config,
            transport,
            provider,
            identity: None,
            state: SessionState::Disconnected,
            client_id: None,
            client_requested: false,
            pending,
            objects,
            rings: Vec::new(),
            next_message_id: 1,
            next_seq: 0,
            needs_rebuild: false,
            failed: None,
        }
    }

    pub fn with_identity_resolver(mut self, resolver: Arc<dyn DaemonIdentityResolver>) -> Self {
        self.identity = Some(resolver);
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn client_id(&self) -> Option<ClientId> {
        self.client_id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Requests waiting for the daemon.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn shm_object_count(&self) -> usize {
        self.objects.len()
    }

    /// Daemon handle of a registration, once confirmed.
    pub fn shm_object_handle(&self, key: ShmObjectKey) -> Option<ShmObjectHandle> {
        self.objects.get(key.0).and_then(|e| e.handle)
    }

    /// The fatal error that ended this session, if any.
    pub fn failure(&self) -> Option<ErrorCode> {
        self.failed
    }

    /// Uid of the privileged daemon account, where one exists.
    pub fn daemon_identity(&self) -> Option<u32> {
        self.identity.as_ref().and_then(|r| r.resolve())
    }

    fn check_usable(&self) -> Result<()> {
        match self.failed {
            Some(code) => Err(Error::with_context(code, "session failed")),
            None => Ok(()),
        }
    }

    fn set_state(&mut self, next: SessionState) {
        if self.state != next {
            tracing::debug!(client = %self.config.client_name, from = ?self.state, to = ?next, "session state");
            self.state = next;
        }
    }

    fn degrade(&mut self, why: &str) {
        tracing::warn!(client = %self.config.client_name, reason = why, "daemon lost");
        self.needs_rebuild = true;
        self.set_state(SessionState::Degraded);
    }

    fn cache(&mut self, request: PendingRequest) -> Result<()> {
        if self.pending.len() >= self.config.request_cache_capacity {
            return Err(Error::with_context(ErrorCode::ContainerExhausted, "request cache full"));
        }
        self.pending.push_back(request);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Register this process with the daemon under the configured name.
    ///
    /// Sent immediately when connected, cached otherwise.
    pub fn register_client(&mut self) -> Result<()> {
        self.check_usable()?;
        if self.client_requested {
            return Err(Error::with_context(
                ErrorCode::DuplicateRegistration,
                "client already registered",
            ));
        }
        if self.state != SessionState::Connected {
            self.cache(PendingRequest::RegisterClient)?;
            self.client_requested = true;
            return Ok(());
        }

        match self.send_register_client() {
            Ok(()) => {
                self.client_requested = true;
                Ok(())
            }
            Err(e) if e.code() == ErrorCode::DaemonUnavailable => {
                // exchange() already degraded the session
                self.cache(PendingRequest::RegisterClient)?;
                self.client_requested = true;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Register a shared memory object with the daemon.
    ///
    /// The same descriptor or path may only be registered once per session;
    /// a repeat is rejected with `DuplicateRegistration` and the existing
    /// registration stays in place.
    pub fn register_shm_object(&mut self, object: ShmObjectRef) -> Result<ShmObjectKey> {
        self.check_usable()?;
        if self.objects.iter().any(|(_, e)| e.object == object) {
            return Err(Error::with_context(
                ErrorCode::DuplicateRegistration,
                "shm object already registered",
            ));
        }
        if self.objects.len() >= self.config.max_shm_objects {
            tracing::error!(
                client = %self.config.client_name,
                max = self.config.max_shm_objects,
                "shm object table full"
            );
            return Err(Error::new(ErrorCode::NoSpaceForNewClientOrObject));
        }

        let connected = self.state == SessionState::Connected;
        if !connected && self.pending.len() >= self.config.request_cache_capacity {
            return Err(Error::with_context(ErrorCode::ContainerExhausted, "request cache full"));
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        let key = self.objects.insert(ShmObjectEntry { object, handle: None, seq });

        if !connected {
            self.cache(PendingRequest::RegisterShmObject { key })?;
            return Ok(ShmObjectKey(key));
        }

        match self.send_register_shm_object(key) {
            Ok(()) => Ok(ShmObjectKey(key)),
            Err(e) if e.code() == ErrorCode::DaemonUnavailable => {
                if let Err(full) = self.cache(PendingRequest::RegisterShmObject { key }) {
                    self.objects.remove(key);
                    return Err(full);
                }
                Ok(ShmObjectKey(key))
            }
            Err(e) => {
                self.objects.remove(key);
                Err(e)
            }
        }
    }

    /// Drop a shared memory object registration.
    ///
    /// A registration the daemon confirmed is unregistered with the daemon
    /// too; while the daemon is away that request waits in the cache and is
    /// sent on reconnect, before anything is registered again. An unknown
    /// key is `WrongHandle`.
    pub fn unregister_shm_object(&mut self, key: ShmObjectKey) -> Result<()> {
        self.check_usable()?;
        let handle = match self.objects.get(key.0) {
            Some(entry) => entry.handle,
            None => return Err(Error::with_context(ErrorCode::WrongHandle, "unknown shm object")),
        };

        match handle {
            Some(handle) => {
                let sent = self.state == SessionState::Connected
                    && match self.send_unregister_shm_object(handle) {
                        Ok(()) => true,
                        // exchange() already degraded the session
                        Err(e) if e.code() == ErrorCode::DaemonUnavailable => false,
                        Err(e) => return Err(e),
                    };
                if !sent {
                    self.cache(PendingRequest::UnregisterShmObject { handle })?;
                }
            }
            None => self
                .pending
                .retain(|p| *p != PendingRequest::RegisterShmObject { key: key.0 }),
        }
        self.objects.remove(key.0);
        self.rings.retain(|r| r.key != key);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Rings
    // -----------------------------------------------------------------------

    /// Ring configuration carrying this session's retry budget.
    pub fn ring_config(&self, name: &str, capacity: usize) -> RingConfig {
        RingConfig::new(name, capacity).with_max_retries(self.config.max_retries)
    }

    /// Create a ring and register it with the daemon.
    ///
    /// If the registration is refused the ring object is removed again.
    pub fn create_ring<T>(&mut self, config: &RingConfig) -> Result<Arc<SharedRingBuffer<T>>>
    where
        T: Copy + Default + Send + 'static,
    {
        self.check_usable()?;
        let ring = Arc::new(SharedRingBuffer::<T>::create(self.provider.as_ref(), config)?);
        let object = match ring.raw_fd() {
            Some(fd) => ShmObjectRef::Fd(fd),
            None => ShmObjectRef::Path(config.name.clone()),
        };

        let key = match self.register_shm_object(object) {
            Ok(key) => key,
            Err(e) => {
                drop(ring);
                if let Err(rm) = self.provider.remove(&config.name) {
                    tracing::warn!(name = %config.name, error = %rm, "failed to remove ring");
                }
                return Err(e);
            }
        };

        self.rings.push(RingEntry {
            name: config.name.clone(),
            key,
            ring: Arc::clone(&ring) as Arc<dyn Any + Send + Sync>,
        });
        Ok(ring)
    }

    /// A ring created through this session, if `T` is its record type.
    pub fn ring<T>(&self, name: &str) -> Option<Arc<SharedRingBuffer<T>>>
    where
        T: Copy + Default + Send + 'static,
    {
        self.rings
            .iter()
            .find(|r| r.name == name)
            .and_then(|r| Arc::clone(&r.ring).downcast::<SharedRingBuffer<T>>().ok())
    }

    /// Registration key of a ring created through this session.
    pub fn ring_key(&self, name: &str) -> Option<ShmObjectKey> {
        self.rings.iter().find(|r| r.name == name).map(|r| r.key)
    }

    // -----------------------------------------------------------------------
    // Daemon availability
    // -----------------------------------------------------------------------

    /// Observe daemon availability and advance the state machine.
    ///
    /// Returns the state after this step. A failure while replaying cached
    /// registrations is fatal: the session is marked failed and every later
    /// call returns the same error.
    pub fn poll(&mut self) -> Result<SessionState> {
        self.check_usable()?;
        let available = self.transport.is_available();

        match self.state {
            SessionState::Connected if !available => self.degrade("transport reports unavailable"),
            SessionState::Disconnected | SessionState::Degraded if available => {
                self.set_state(SessionState::Registering);
                match self.replay() {
                    Ok(()) => self.set_state(SessionState::Connected),
                    Err(e) if e.code() == ErrorCode::DaemonUnavailable => {
                        self.degrade("daemon lost during replay")
                    }
                    Err(e) => {
                        tracing::error!(client = %self.config.client_name, error = %e, "replay failed");
                        self.failed = Some(ErrorCode::ReplayCacheFailure);
                        self.set_state(SessionState::Disconnected);
                        return Err(e);
                    }
                }
            }
            _ => {}
        }
        Ok(self.state)
    }

    /// Tell the session the daemon is gone, e.g. after a transport error
    /// seen outside the session.
    pub fn note_daemon_lost(&mut self) {
        if matches!(self.state, SessionState::Connected | SessionState::Registering) {
            self.degrade("reported by caller");
        }
    }

    fn replay(&mut self) -> Result<()> {
        // Before anything is registered again, so a stale handle can only
        // name the object it was issued for.
        self.flush_unregistrations()?;
        if self.needs_rebuild {
            self.rebuild()?;
            self.needs_rebuild = false;
        }

        let mut replayed = 0usize;
        while let Some(&request) = self.pending.front() {
            match request {
                PendingRequest::RegisterClient => {
                    self.send_register_client()
                        .map_err(|e| replay_error(e, "client registration replay failed"))?;
                }
                PendingRequest::RegisterShmObject { key } => {
                    if self.objects.contains(key) {
                        self.send_register_shm_object(key)
                            .map_err(|e| replay_error(e, "shm object replay failed"))?;
                    }
                }
                PendingRequest::UnregisterShmObject { handle } => self.replay_unregister(handle)?,
            }
            self.pending.pop_front();
            replayed += 1;
        }
        if replayed > 0 {
            tracing::debug!(client = %self.config.client_name, replayed, "replayed cached requests");
        }
        Ok(())
    }

    /// Send every cached unregistration, in the order they were made.
    fn flush_unregistrations(&mut self) -> Result<()> {
        while let Some(pos) = self
            .pending
            .iter()
            .position(|p| matches!(p, PendingRequest::UnregisterShmObject { .. }))
        {
            if let PendingRequest::UnregisterShmObject { handle } = self.pending[pos] {
                self.replay_unregister(handle)?;
            }
            self.pending.remove(pos);
        }
        Ok(())
    }

    /// A daemon that restarted no longer knows the handle; nothing is left
    /// to unregister then.
    fn replay_unregister(&mut self, handle: ShmObjectHandle) -> Result<()> {
        match self.send_unregister_shm_object(handle) {
            Ok(()) => Ok(()),
            Err(e) if forgotten(&e) => {
                tracing::debug!(%handle, code = %e.code(), "daemon no longer knows object");
                Ok(())
            }
            Err(e) => Err(replay_error(e, "shm object unregister replay failed")),
        }
    }

    /// Register again whatever the daemon had confirmed before it was lost.
    fn rebuild(&mut self) -> Result<()> {
        if let Some(old) = self.client_id {
            match self.send_register_client() {
                Ok(()) => {}
                Err(e) if already_known(&e) => self.client_id = Some(old),
                Err(e) => return Err(replay_error(e, "client registration replay failed")),
            }
        }

        let mut confirmed: Vec<(u64, usize)> = self
            .objects
            .iter()
            .filter(|(_, e)| e.handle.is_some())
            .map(|(key, e)| (e.seq, key))
            .collect();
        confirmed.sort_unstable();
        for (_, key) in confirmed {
            match self.send_register_shm_object(key) {
                Ok(()) => {}
                Err(e) if already_known(&e) => {}
                Err(e) => return Err(replay_error(e, "shm object replay failed")),
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Wire
    // -----------------------------------------------------------------------

    fn send_register_client(&mut self) -> Result<()> {
        let name = self.config.client_name.clone();
        match self.exchange(Request::RegisterClient { name })? {
            Response::ClientRegistered { client_id } => {
                tracing::debug!(client = %self.config.client_name, %client_id, "client registered");
                self.client_id = Some(client_id);
                Ok(())
            }
            other => Err(unexpected(other)),
        }
    }

    fn send_register_shm_object(&mut self, key: usize) -> Result<()> {
        let object = match self.objects.get(key) {
            Some(entry) => entry.object.clone(),
            None => return Err(Error::with_context(ErrorCode::WrongHandle, "unknown shm object")),
        };
        match self.exchange(Request::RegisterShmObject { object })? {
            Response::ShmObjectRegistered { handle } => {
                if let Some(entry) = self.objects.get_mut(key) {
                    entry.handle = Some(handle);
                }
                Ok(())
            }
            other => Err(unexpected(other)),
        }
    }

    fn send_unregister_shm_object(&mut self, handle: ShmObjectHandle) -> Result<()> {
        self.exchange(Request::UnregisterShmObject { handle }).and_then(expect_ack)
    }

    /// One request/response round trip with id correlation.
    fn exchange(&mut self, request: Request) -> Result<Response> {
        let message_id = MessageId(self.next_message_id);
        self.next_message_id += 1;
        // A fresh registration asks for a new id; everything else carries ours.
        let client_id = match request {
            Request::RegisterClient { .. } => None,
            _ => self.client_id,
        };
        let envelope = RequestEnvelope { client_id, message_id, request };

        let reply = match self.transport.send(&envelope) {
            Ok(reply) => reply,
            Err(e) => {
                if e.code() == ErrorCode::DaemonUnavailable && self.state == SessionState::Connected {
                    self.degrade("transport send failed");
                }
                return Err(e);
            }
        };

        if reply.message_id != message_id {
            tracing::warn!(sent = message_id.0, got = reply.message_id.0, "message id mismatch");
            return Err(Error::with_context(ErrorCode::IdMismatch, "message id mismatch"));
        }
        if client_id.is_some() && reply.client_id != client_id {
            tracing::warn!(sent = ?client_id, got = ?reply.client_id, "client id mismatch");
            return Err(Error::with_context(ErrorCode::IdMismatch, "client id mismatch"));
        }

        match reply.response {
            Response::Rejected { code } => {
                tracing::warn!(%code, "daemon rejected request");
                Err(Error::with_context(code, "rejected by daemon"))
            }
            response => Ok(response),
        }
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Best-effort unregistration of every object and the client.
    ///
    /// Transport errors are logged and otherwise ignored. Ring objects are
    /// left in place for the daemon to drain.
    pub fn shutdown(&mut self) {
        if self.state == SessionState::Connected && self.failed.is_none() {
            let handles: Vec<ShmObjectHandle> =
                self.objects.iter().filter_map(|(_, e)| e.handle).collect();
            for handle in handles {
                if let Err(e) = self.exchange(Request::UnregisterShmObject { handle }) {
                    tracing::warn!(%handle, error = %e, "unregister on shutdown failed");
                }
            }
            if self.client_id.is_some() {
                if let Err(e) = self.exchange(Request::UnregisterClient) {
                    tracing::warn!(error = %e, "client unregister on shutdown failed");
                }
            }
        }
        self.objects.clear();
        self.pending.clear();
        self.rings.clear();
        self.client_id = None;
        self.client_requested = false;
        self.needs_rebuild = false;
        self.set_state(SessionState::Disconnected);
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSession")
            .field("client_name", &self.config.client_name)
            .field("state", &self.state)
            .field("client_id", &self.client_id)
            .field("pending", &self.pending.len())
            .field("objects", &self.objects.len())
            .field("failed", &self.failed)
            .finish()
    }
}

fn expect_ack(response: Response) -> Result<()> {
    match response {
        Response::Ack => Ok(()),
        other => Err(unexpected(other)),
    }
}

fn unexpected(response: Response) -> Error {
    tracing::warn!(?response, "unexpected daemon response");
    Error::with_context(ErrorCode::InvalidState, "unexpected daemon response")
}

/// The daemon still has a registration it was asked to repeat.
fn already_known(e: &Error) -> bool {
    matches!(e.code(), ErrorCode::DuplicateRegistration | ErrorCode::ClientNameAlreadyUsed)
}

/// The daemon has no record of what it was asked to drop.
fn forgotten(e: &Error) -> bool {
    matches!(e.code(), ErrorCode::WrongHandle | ErrorCode::ClientNotFound)
}

/// Replay failures are fatal unless the daemon simply went away again.
fn replay_error(e: Error, context: &'static str) -> Error {
    if e.code() == ErrorCode::DaemonUnavailable {
        e
    } else {
        tracing::error!(error = %e, context, "replay step failed");
        Error::with_context(ErrorCode::ReplayCacheFailure, context)
    }
}
