// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Client session against an in-process daemon: registration, loss, replay and
// the daemon side draining the session's ring.

#![cfg(not(feature = "loom"))]

use std::sync::{Arc, Mutex};

use libtrace::{
    ClientId, ClientSession, DaemonTransport, Error, ErrorCode, HeapShm, MessageId, Request,
    RequestEnvelope, Response, ResponseEnvelope, SessionConfig, SessionState, SharedRingBuffer,
    ShmObjectHandle, ShmObjectRef, TraceRecord, TracingSink,
};

#[derive(Default)]
struct DaemonState {
    up: bool,
    clients: u32,
    handles: u32,
    requests: Vec<Request>,
    reject_next: Option<ErrorCode>,
    answer_for_other_client: bool,
    /// Go down once this many requests have been served.
    drop_after: Option<usize>,
}

/// Daemon stand-in shared between the session and the test body.
#[derive(Clone, Default)]
struct FakeDaemon(Arc<Mutex<DaemonState>>);

impl FakeDaemon {
    fn up(&self) {
        self.0.lock().unwrap().up = true;
    }

    fn down(&self) {
        self.0.lock().unwrap().up = false;
    }

    fn requests(&self) -> Vec<Request> {
        self.0.lock().unwrap().requests.clone()
    }
}

impl DaemonTransport for FakeDaemon {
    fn is_available(&self) -> bool {
        self.0.lock().unwrap().up
    }

    fn send(&mut self, req: &RequestEnvelope) -> libtrace::Result<ResponseEnvelope> {
        let mut d = self.0.lock().unwrap();
        if d.drop_after.is_some_and(|n| d.requests.len() >= n) {
            d.up = false;
            d.drop_after = None;
        }
        if !d.up {
            return Err(Error::new(ErrorCode::DaemonUnavailable));
        }
        d.requests.push(req.request.clone());

        let mut client_id = req.client_id;
        let response = match (d.reject_next.take(), &req.request) {
            (Some(code), _) => Response::Rejected { code },
            (None, Request::RegisterClient { .. }) => {
                d.clients += 1;
                client_id = Some(ClientId(d.clients));
                Response::ClientRegistered { client_id: ClientId(d.clients) }
            }
            (None, Request::RegisterShmObject { .. }) => {
                d.handles += 1;
                Response::ShmObjectRegistered { handle: ShmObjectHandle(d.handles) }
            }
            (None, _) => Response::Ack,
        };
        if std::mem::take(&mut d.answer_for_other_client) {
            client_id = Some(ClientId(9999));
        }
        Ok(ResponseEnvelope {
            client_id,
            message_id: MessageId(req.message_id.0),
            response,
        })
    }
}

/// Route session logs to the test output; `RUST_LOG=libtrace=debug` shows
/// the state transitions.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn session(daemon: &FakeDaemon, shm: Arc<HeapShm>, cache: usize) -> ClientSession {
    ClientSession::new(
        SessionConfig::new("tracer").with_request_cache_capacity(cache),
        Box::new(daemon.clone()),
        shm,
    )
}

#[test]
fn cached_requests_replay_in_order_exactly_once() {
    let daemon = FakeDaemon::default();
    let mut s = session(&daemon, Arc::new(HeapShm::new()), 8);

    s.register_client().unwrap();
    let keys: Vec<_> = ["/a", "/b", "/c"]
        .iter()
        .map(|p| s.register_shm_object(ShmObjectRef::Path(p.to_string())).unwrap())
        .collect();
    assert_eq!(s.poll().unwrap(), SessionState::Disconnected);
    assert!(daemon.requests().is_empty());

    daemon.up();
    assert_eq!(s.poll().unwrap(), SessionState::Connected);
    assert_eq!(
        daemon.requests(),
        vec![
            Request::RegisterClient { name: "tracer".into() },
            Request::RegisterShmObject { object: ShmObjectRef::Path("/a".into()) },
            Request::RegisterShmObject { object: ShmObjectRef::Path("/b".into()) },
            Request::RegisterShmObject { object: ShmObjectRef::Path("/c".into()) },
        ]
    );
    for key in keys {
        assert!(s.shm_object_handle(key).is_some());
    }

    // Polling again while connected replays nothing.
    assert_eq!(s.poll().unwrap(), SessionState::Connected);
    assert_eq!(daemon.requests().len(), 4);
}

#[test]
fn daemon_restart_registers_everything_again() {
    init_tracing();
    let daemon = FakeDaemon::default();
    daemon.up();
    let mut s = session(&daemon, Arc::new(HeapShm::new()), 8);
    s.poll().unwrap();
    s.register_client().unwrap();
    s.register_shm_object(ShmObjectRef::Path("/first".into())).unwrap();

    daemon.down();
    assert_eq!(s.poll().unwrap(), SessionState::Degraded);
    let late = s.register_shm_object(ShmObjectRef::Path("/late".into())).unwrap();
    assert_eq!(s.pending_len(), 1);

    daemon.up();
    assert_eq!(s.poll().unwrap(), SessionState::Connected);
    let tail: Vec<_> = daemon.requests().split_off(2);
    assert_eq!(
        tail,
        vec![
            Request::RegisterClient { name: "tracer".into() },
            Request::RegisterShmObject { object: ShmObjectRef::Path("/first".into()) },
            Request::RegisterShmObject { object: ShmObjectRef::Path("/late".into()) },
        ]
    );
    assert_eq!(s.client_id(), Some(ClientId(2)));
    assert!(s.shm_object_handle(late).is_some());
}

#[test]
fn cache_overflow_is_recoverable_and_keeps_entries() {
    let daemon = FakeDaemon::default();
    let mut s = session(&daemon, Arc::new(HeapShm::new()), 2);
    s.register_client().unwrap();
    s.register_shm_object(ShmObjectRef::Fd(10)).unwrap();
    let err = s.register_shm_object(ShmObjectRef::Fd(11)).unwrap_err();
    assert_eq!(err.code(), ErrorCode::ContainerExhausted);
    assert!(err.is_recoverable());
    assert_eq!(s.pending_len(), 2);

    daemon.up();
    assert_eq!(s.poll().unwrap(), SessionState::Connected);
    assert_eq!(daemon.requests().len(), 2);
}

#[test]
fn foreign_client_id_is_rejected() {
    let daemon = FakeDaemon::default();
    daemon.up();
    let mut s = session(&daemon, Arc::new(HeapShm::new()), 4);
    s.poll().unwrap();
    s.register_client().unwrap();

    daemon.0.lock().unwrap().answer_for_other_client = true;
    let err = s.register_shm_object(ShmObjectRef::Fd(3)).unwrap_err();
    assert_eq!(err.code(), ErrorCode::IdMismatch);
    assert!(err.is_recoverable());
    assert_eq!(s.state(), SessionState::Connected);
    assert_eq!(s.shm_object_count(), 0);
    assert_eq!(s.client_id(), Some(ClientId(1)));
}

#[test]
fn duplicate_fd_is_recoverable() {
    let daemon = FakeDaemon::default();
    daemon.up();
    let mut s = session(&daemon, Arc::new(HeapShm::new()), 4);
    s.poll().unwrap();
    let key = s.register_shm_object(ShmObjectRef::Fd(5)).unwrap();
    let err = s.register_shm_object(ShmObjectRef::Fd(5)).unwrap_err();
    assert_eq!(err.code(), ErrorCode::DuplicateRegistration);
    assert!(err.is_recoverable());
    assert!(s.shm_object_handle(key).is_some());
    assert_eq!(daemon.requests().len(), 1);
}

#[test]
fn shm_object_replay_failure_is_fatal() {
    let daemon = FakeDaemon::default();
    let mut s = session(&daemon, Arc::new(HeapShm::new()), 4);
    s.register_shm_object(ShmObjectRef::Fd(1)).unwrap();
    daemon.up();
    daemon.0.lock().unwrap().reject_next = Some(ErrorCode::ShmObjectRegistrationFailed);

    let err = s.poll().unwrap_err();
    assert_eq!(err.code(), ErrorCode::ReplayCacheFailure);
    assert!(err.is_fatal());
    assert_ne!(s.state(), SessionState::Connected);
    assert_eq!(
        s.register_shm_object(ShmObjectRef::Fd(2)).unwrap_err().code(),
        ErrorCode::ReplayCacheFailure
    );
}

#[test]
fn unregister_while_degraded_reaches_daemon_that_kept_state() {
    let daemon = FakeDaemon::default();
    daemon.up();
    let mut s = session(&daemon, Arc::new(HeapShm::new()), 4);
    s.poll().unwrap();
    s.register_client().unwrap();
    let key = s.register_shm_object(ShmObjectRef::Path("/x".into())).unwrap();
    let handle = s.shm_object_handle(key).unwrap();

    daemon.down();
    assert_eq!(s.poll().unwrap(), SessionState::Degraded);
    s.unregister_shm_object(key).unwrap();
    assert_eq!(s.shm_object_count(), 0);
    assert_eq!(s.pending_len(), 1);

    daemon.up();
    assert_eq!(s.poll().unwrap(), SessionState::Connected);
    assert_eq!(
        daemon.requests(),
        vec![
            Request::RegisterClient { name: "tracer".into() },
            Request::RegisterShmObject { object: ShmObjectRef::Path("/x".into()) },
            // Dropped before anything is registered again.
            Request::UnregisterShmObject { handle },
            Request::RegisterClient { name: "tracer".into() },
        ]
    );
    assert_eq!(s.pending_len(), 0);
    assert_eq!(
        s.unregister_shm_object(key).unwrap_err().code(),
        ErrorCode::WrongHandle
    );
}

#[test]
fn daemon_lost_mid_replay_resumes_where_it_stopped() {
    init_tracing();
    let daemon = FakeDaemon::default();
    let mut s = session(&daemon, Arc::new(HeapShm::new()), 4);
    s.register_client().unwrap();
    s.register_shm_object(ShmObjectRef::Fd(1)).unwrap();
    s.register_shm_object(ShmObjectRef::Fd(2)).unwrap();

    // Up for the poll, gone again after the first request.
    daemon.up();
    daemon.0.lock().unwrap().drop_after = Some(1);
    assert_eq!(s.poll().unwrap(), SessionState::Degraded);
    assert_eq!(s.pending_len(), 2);
    assert!(s.failure().is_none());

    daemon.up();
    assert_eq!(s.poll().unwrap(), SessionState::Connected);
    assert_eq!(
        daemon.requests(),
        vec![
            Request::RegisterClient { name: "tracer".into() },
            // The daemon may have restarted: the client registers again,
            // then the rest of the cache goes out once.
            Request::RegisterClient { name: "tracer".into() },
            Request::RegisterShmObject { object: ShmObjectRef::Fd(1) },
            Request::RegisterShmObject { object: ShmObjectRef::Fd(2) },
        ]
    );
}

#[test]
fn session_ring_drained_by_daemon() {
    init_tracing();
    let daemon = FakeDaemon::default();
    daemon.up();
    let shm = Arc::new(HeapShm::new());
    let mut s = session(&daemon, Arc::clone(&shm), 4);
    s.poll().unwrap();
    s.register_client().unwrap();

    let cfg = s.ring_config("trace_events", 8);
    let ring = s.create_ring::<TraceRecord>(&cfg).unwrap();
    assert!(matches!(
        daemon.requests().last(),
        Some(Request::RegisterShmObject { object: ShmObjectRef::Path(p) }) if p == "trace_events"
    ));

    let id = s.client_id().unwrap().0;
    for i in 0..5u64 {
        assert!(ring.try_produce(&TraceRecord::new(id, b"tick").with_timestamp(i)).unwrap());
    }

    // Daemon side: its own mapping of the same object.
    let daemon_view = SharedRingBuffer::<TraceRecord>::open(shm.as_ref(), "trace_events").unwrap();
    let mut sink = TracingSink::new();
    assert_eq!(daemon_view.drain(&mut sink, 16).unwrap(), 5);
    assert_eq!(sink.emitted(), 5);

    s.shutdown();
    let reqs = daemon.requests();
    assert!(matches!(reqs[reqs.len() - 2], Request::UnregisterShmObject { .. }));
    assert_eq!(reqs[reqs.len() - 1], Request::UnregisterClient);
}

#[test]
fn rejected_ring_registration_removes_object() {
    let daemon = FakeDaemon::default();
    daemon.up();
    let shm = Arc::new(HeapShm::new());
    let mut s = session(&daemon, Arc::clone(&shm), 4);
    s.poll().unwrap();
    daemon.0.lock().unwrap().reject_next = Some(ErrorCode::ShmObjectRegistrationFailed);

    let cfg = s.ring_config("refused", 4);
    let err = s.create_ring::<u64>(&cfg).unwrap_err();
    assert_eq!(err.code(), ErrorCode::ShmObjectRegistrationFailed);
    assert!(!shm.contains("refused"));
    assert!(s.ring::<u64>("refused").is_none());
}
