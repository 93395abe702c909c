/*
 * client.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Portcullis, an IMAP/POP3 login front-end.
 *
 * Portcullis is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Portcullis is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Portcullis.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Request dispatcher: the API login sessions use to run an authentication
//! exchange against whichever worker serves the chosen mechanism.
//!
//! Everything here runs on one thread. Callbacks are invoked with no internal
//! borrow held, so a callback may start, continue or abort requests. Connection
//! teardown requested while a callback is running is queued and performed once
//! the outermost delivery returns.

use std::cell::{Cell, RefCell};
use std::io;
use std::ops::Deref;
use std::rc::{Rc, Weak};

use bytes::BytesMut;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use super::connection::{ConnectionId, RequestEntry, WorkerConnection};
use super::error::AuthError;
use super::mechanism::{AuthMech, AuthProtocol};
use super::parser::WorkerFrame;
use super::registry::{Connector, Registry};
use super::wire::{
    ContinueRequest, NewRequest, Reply, ReplyResult, MAX_OUTBUF_SIZE, MAX_REQUEST_DATA_SIZE,
};
use crate::config::LoginConfig;

/// A reply delivered to a request callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthReply<'a> {
    pub result: ReplyResult,
    pub data: &'a [u8],
}

/// Request callback. `Some(reply)` for each worker reply; `None` exactly once if
/// the connection goes away before a terminal reply. Caller state lives in the
/// closure.
pub type AuthCallback = Box<dyn FnMut(&AuthRequest, Option<AuthReply<'_>>)>;

/// Handle to an in-flight request. Holds only a weak reference to its
/// connection; use [`AuthRequest::retain`] to keep the connection alive.
#[derive(Debug, Clone)]
pub struct AuthRequest {
    id: u32,
    mech: AuthMech,
    protocol: AuthProtocol,
    conn: Weak<WorkerConnection>,
}

impl AuthRequest {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn mech(&self) -> AuthMech {
        self.mech
    }

    pub fn protocol(&self) -> AuthProtocol {
        self.protocol
    }

    pub fn connection(&self) -> Option<Rc<WorkerConnection>> {
        self.conn.upgrade()
    }

    /// Still in its connection's table: no terminal reply, not aborted, not terminated.
    pub fn is_active(&self) -> bool {
        self.conn
            .upgrade()
            .map(|conn| !conn.is_destroyed() && conn.has_request(self.id))
            .unwrap_or(false)
    }

    /// Take a reference on the owning connection. Dropping the result releases it.
    /// `None` if the connection has already been freed.
    pub fn retain(&self) -> Option<RetainedRequest> {
        let conn = self.conn.upgrade()?;
        Some(RetainedRequest {
            request: self.clone(),
            _conn: conn,
        })
    }

    /// Strong references on the owning connection: 1 while registered, plus one
    /// per outstanding [`RetainedRequest`].
    pub fn refcount(&self) -> usize {
        self.conn.strong_count()
    }
}

/// A request handle that keeps its connection's storage alive.
#[derive(Debug)]
pub struct RetainedRequest {
    request: AuthRequest,
    _conn: Rc<WorkerConnection>,
}

impl Deref for RetainedRequest {
    type Target = AuthRequest;

    fn deref(&self) -> &AuthRequest {
        &self.request
    }
}

struct ClientInner {
    registry: RefCell<Registry>,
    deferred: RefCell<Vec<Rc<WorkerConnection>>>,
    dispatch_depth: Cell<usize>,
    wakeup: Notify,
}

/// Decrements the dispatch depth on every exit path, unwinding included.
struct DispatchGuard<'a>(&'a Cell<usize>);

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        self.0.set(self.0.get() - 1);
    }
}

/// The auth multiplexer. Cloning yields another handle to the same state.
#[derive(Clone)]
pub struct AuthClient {
    inner: Rc<ClientInner>,
}

impl AuthClient {
    pub fn new(config: &LoginConfig, connector: Box<dyn Connector>) -> Self {
        let registry = Registry::new(
            config.socket_dir.clone(),
            connector,
            config.login_uid,
            config.max_inbuf_size,
            MAX_OUTBUF_SIZE,
        );
        Self {
            inner: Rc::new(ClientInner {
                registry: RefCell::new(registry),
                deferred: RefCell::new(Vec::new()),
                dispatch_depth: Cell::new(0),
                wakeup: Notify::new(),
            }),
        }
    }

    /// Connect to every worker currently present.
    pub fn init(&self) {
        self.reconcile();
    }

    pub fn reconcile(&self) {
        self.inner.registry.borrow_mut().reconcile();
    }

    /// Periodic work: perform queued teardowns, then reconnect if needed.
    pub fn tick(&self) {
        self.run_deferred();
        let needs_reconnect = self.inner.registry.borrow().needs_reconnect();
        if needs_reconnect {
            debug!("auth: reconnecting to missing workers");
            self.reconcile();
        }
    }

    /// Start an authentication exchange. On success a NewRequest has been queued
    /// to a worker and `callback` will receive its replies.
    ///
    /// A send failure at this point still returns the handle; the request is then
    /// terminated once the connection teardown runs.
    pub fn init_request<F>(
        &self,
        mech: AuthMech,
        protocol: AuthProtocol,
        callback: F,
    ) -> Result<AuthRequest, AuthError>
    where
        F: FnMut(&AuthRequest, Option<AuthReply<'_>>) + 'static,
    {
        if !mech.is_single() {
            return Err(AuthError::UnsupportedMechanism);
        }
        let (conn, id) = {
            let mut registry = self.inner.registry.borrow_mut();
            if registry.needs_reconnect() {
                registry.reconcile();
            }
            let conn = registry.select(mech, NewRequest::SIZE)?;
            let id = registry.next_request_id(&conn);
            (conn, id)
        };

        conn.insert_request(
            id,
            RequestEntry {
                mech,
                protocol,
                callback: Some(Box::new(callback)),
            },
        );
        let mut buf = BytesMut::with_capacity(NewRequest::SIZE);
        NewRequest { protocol, mech, id }.encode(&mut buf);
        if let Err(e) = conn.send(&[&buf[..]]) {
            warn!("auth {}: sending request {} failed: {}", conn.path(), id, e);
            self.schedule_destroy(&conn);
        }
        debug!("auth {}: request {} {} {}", conn.path(), id, protocol, mech);

        Ok(AuthRequest {
            id,
            mech,
            protocol,
            conn: Rc::downgrade(&conn),
        })
    }

    /// Send the next client response of an exchange.
    pub fn continue_request(&self, request: &AuthRequest, data: &[u8]) -> Result<(), AuthError> {
        if data.len() > MAX_REQUEST_DATA_SIZE {
            return Err(AuthError::PayloadTooLarge {
                size: data.len(),
                max: MAX_REQUEST_DATA_SIZE,
            });
        }
        let conn = request.conn.upgrade().ok_or(AuthError::ConnectionClosed)?;
        if conn.is_destroyed() || conn.is_destroy_pending() {
            return Err(AuthError::ConnectionClosed);
        }
        if !conn.has_request(request.id) {
            return Err(AuthError::RequestNotFound(request.id));
        }

        let mut header = BytesMut::with_capacity(ContinueRequest::SIZE);
        ContinueRequest {
            id: request.id,
            data_size: data.len() as u32,
        }
        .encode(&mut header);
        if let Err(e) = conn.send(&[&header[..], data]) {
            warn!(
                "auth {}: sending continuation for {} failed: {}",
                conn.path(),
                request.id,
                e
            );
            self.schedule_destroy(&conn);
        }
        Ok(())
    }

    /// Forget a request. Its callback is not invoked again and the worker is not
    /// told. Returns false if the request was no longer live.
    pub fn abort_request(&self, request: &AuthRequest) -> bool {
        match request.conn.upgrade() {
            Some(conn) => conn.remove_request(request.id).is_some(),
            None => false,
        }
    }

    /// True once every known worker has completed its handshake and no
    /// reconnect is outstanding.
    pub fn is_connected(&self) -> bool {
        let registry = self.inner.registry.borrow();
        !registry.needs_reconnect() && registry.handshake_pending() == 0
    }

    /// Feed bytes read from connection `id`.
    pub fn receive(&self, id: ConnectionId, data: &[u8]) {
        let conn = match self.inner.registry.borrow().get(id) {
            Some(conn) => conn,
            None => return,
        };
        let mut frames = Vec::new();
        let result = conn.receive(data, &mut frames);

        {
            let _guard = self.enter_dispatch();
            for frame in frames {
                match frame {
                    WorkerFrame::Handshake(handshake) => {
                        conn.complete_handshake(handshake);
                        self.inner.registry.borrow_mut().handshake_completed(&conn);
                    }
                    WorkerFrame::Reply(reply, data) => self.dispatch(&conn, reply, &data),
                }
            }
        }

        if let Err(e) = result {
            if e.is_worker_bug() {
                error!("BUG: {}", e);
            } else {
                error!("auth {}: read failed: {}", conn.path(), e);
            }
            self.destroy(&conn);
        }
        self.run_deferred();
    }

    fn dispatch(&self, conn: &Rc<WorkerConnection>, reply: Reply, data: &[u8]) {
        let (mech, protocol, mut callback) = match conn.take_callback(reply.id) {
            Some(taken) => taken,
            None => {
                error!("BUG: Auth process sent us reply with unknown ID {}", reply.id);
                return;
            }
        };
        let request = AuthRequest {
            id: reply.id,
            mech,
            protocol,
            conn: Rc::downgrade(conn),
        };
        callback(
            &request,
            Some(AuthReply {
                result: reply.result,
                data,
            }),
        );
        if reply.result.is_terminal() {
            // The callback may already have aborted it.
            conn.remove_request(reply.id);
        } else {
            conn.restore_callback(reply.id, callback);
        }
    }

    /// The driver saw EOF (`None`) or an I/O error on connection `id`.
    pub fn connection_lost(&self, id: ConnectionId, err: Option<io::Error>) {
        let conn = match self.inner.registry.borrow().get(id) {
            Some(conn) => conn,
            None => return,
        };
        match err {
            Some(e) => error!("auth {}: connection failed: {}", conn.path(), e),
            None => info!("auth {}: auth process disconnected", conn.path()),
        }
        self.destroy(&conn);
        self.run_deferred();
    }

    /// Write buffered output for connection `id`.
    pub fn flush(&self, id: ConnectionId) {
        let conn = match self.inner.registry.borrow().get(id) {
            Some(conn) => conn,
            None => return,
        };
        if let Err(e) = conn.flush() {
            warn!("auth {}: write failed: {}", conn.path(), e);
            self.destroy(&conn);
            self.run_deferred();
        }
    }

    pub fn has_pending_output(&self, id: ConnectionId) -> bool {
        self.inner
            .registry
            .borrow()
            .get(id)
            .map(|conn| conn.has_pending_output())
            .unwrap_or(false)
    }

    fn enter_dispatch(&self) -> DispatchGuard<'_> {
        let depth = &self.inner.dispatch_depth;
        depth.set(depth.get() + 1);
        DispatchGuard(depth)
    }

    fn destroy(&self, conn: &Rc<WorkerConnection>) {
        if self.inner.dispatch_depth.get() > 0 {
            self.schedule_destroy(conn);
        } else {
            self.destroy_now(conn);
        }
    }

    fn schedule_destroy(&self, conn: &Rc<WorkerConnection>) {
        if conn.mark_destroy_pending() {
            self.inner.deferred.borrow_mut().push(conn.clone());
            self.inner.wakeup.notify_one();
        }
    }

    /// Perform queued teardowns. Does nothing while a callback is running.
    pub fn run_deferred(&self) {
        loop {
            if self.inner.dispatch_depth.get() > 0 {
                return;
            }
            let next = {
                let mut deferred = self.inner.deferred.borrow_mut();
                if deferred.is_empty() {
                    return;
                }
                deferred.remove(0)
            };
            self.destroy_now(&next);
        }
    }

    fn destroy_now(&self, conn: &Rc<WorkerConnection>) {
        if conn.is_destroyed() {
            return;
        }
        self.inner.registry.borrow_mut().unregister(conn);
        conn.close();

        let entries = conn.drain_requests();
        if entries.is_empty() {
            return;
        }
        debug!(
            "auth {}: terminating {} pending requests",
            conn.path(),
            entries.len()
        );
        let _guard = self.enter_dispatch();
        for (id, entry) in entries {
            if let Some(mut callback) = entry.callback {
                let request = AuthRequest {
                    id,
                    mech: entry.mech,
                    protocol: entry.protocol,
                    conn: Rc::downgrade(conn),
                };
                callback(&request, None);
            }
        }
    }

    /// Destroy every connection. Pending requests receive terminated callbacks.
    pub fn shutdown(&self) {
        let connections = {
            let mut registry = self.inner.registry.borrow_mut();
            registry.begin_shutdown();
            registry.connections()
        };
        for conn in connections {
            self.destroy(&conn);
        }
        self.run_deferred();
    }

    /// Resolves when teardown work has been queued.
    pub async fn wait_for_work(&self) {
        self.inner.wakeup.notified().await;
    }

    pub fn available_mechs(&self) -> AuthMech {
        self.inner.registry.borrow().available_mechs()
    }

    /// Every mechanism a worker has offered since startup.
    pub fn known_mechs(&self) -> AuthMech {
        self.inner.registry.borrow().known_mechs()
    }

    pub fn needs_reconnect(&self) -> bool {
        self.inner.registry.borrow().needs_reconnect()
    }

    pub fn handshake_pending(&self) -> usize {
        self.inner.registry.borrow().handshake_pending()
    }

    /// Registered socket names, in first-fit order.
    pub fn connection_paths(&self) -> Vec<String> {
        self.inner.registry.borrow().paths()
    }

    pub fn connection(&self, path: &str) -> Option<Rc<WorkerConnection>> {
        self.inner.registry.borrow().find(path)
    }

    pub fn connections(&self) -> Vec<Rc<WorkerConnection>> {
        self.inner.registry.borrow().connections()
    }

    #[cfg(test)]
    fn set_request_id_counter(&self, value: u32) {
        self.inner
            .registry
            .borrow_mut()
            .set_request_id_counter(value);
    }
}

impl std::fmt::Debug for AuthClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthClient")
            .field("connections", &self.connection_paths())
            .field("available_mechs", &self.available_mechs())
            .field("needs_reconnect", &self.needs_reconnect())
            .field("handshake_pending", &self.handshake_pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::connection::WorkerLink;
    use crate::auth::registry::scan_worker_sockets;
    use crate::auth::wire::ServerHandshake;
    use bytes::Buf;
    use proptest::prelude::*;
    use std::collections::{HashMap, HashSet};
    use std::os::unix::net::UnixListener;
    use std::path::Path;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Peer {
        written: Vec<u8>,
        /// Bytes the socket will take before blocking; `None` is unlimited.
        accept: Option<usize>,
        broken: bool,
        closed: bool,
    }

    struct PeerLink(Rc<RefCell<Peer>>);

    impl WorkerLink for PeerLink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let mut peer = self.0.borrow_mut();
            if peer.broken {
                return Err(io::ErrorKind::BrokenPipe.into());
            }
            let n = match peer.accept {
                Some(0) => return Err(io::ErrorKind::WouldBlock.into()),
                Some(limit) => limit.min(buf.len()),
                None => buf.len(),
            };
            if let Some(limit) = peer.accept.as_mut() {
                *limit -= n;
            }
            peer.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn close(&mut self) {
            self.0.borrow_mut().closed = true;
        }
    }

    #[derive(Default)]
    struct World {
        peers: HashMap<String, Rc<RefCell<Peer>>>,
        ids: HashMap<String, ConnectionId>,
        refuse: HashSet<String>,
        connects: usize,
    }

    struct MockConnector(Rc<RefCell<World>>);

    impl Connector for MockConnector {
        fn connect(&mut self, id: ConnectionId, path: &Path) -> io::Result<Box<dyn WorkerLink>> {
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();
            let mut world = self.0.borrow_mut();
            world.connects += 1;
            if world.refuse.contains(&name) {
                return Err(io::ErrorKind::ConnectionRefused.into());
            }
            let peer = Rc::new(RefCell::new(Peer::default()));
            world.peers.insert(name.clone(), peer.clone());
            world.ids.insert(name, id);
            Ok(Box::new(PeerLink(peer)))
        }
    }

    /// What the login side wrote to one worker, decoded.
    #[derive(Debug, PartialEq, Eq)]
    enum Sent {
        Handshake(u32),
        New(NewRequest),
        Continue(u32, Vec<u8>),
    }

    struct Fixture {
        dir: TempDir,
        listeners: Vec<UnixListener>,
        world: Rc<RefCell<World>>,
        client: AuthClient,
    }

    type Log = Rc<RefCell<Vec<(u32, Option<ReplyResult>, Vec<u8>)>>>;

    fn recorder(log: &Log) -> impl FnMut(&AuthRequest, Option<AuthReply<'_>>) + 'static {
        let log = log.clone();
        move |request, reply| {
            log.borrow_mut().push((
                request.id(),
                reply.map(|r| r.result),
                reply.map(|r| r.data.to_vec()).unwrap_or_default(),
            ));
        }
    }

    impl Fixture {
        fn new(names: &[&str]) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let listeners = names
                .iter()
                .map(|name| UnixListener::bind(dir.path().join(name)).unwrap())
                .collect();
            let world = Rc::new(RefCell::new(World::default()));
            let config = LoginConfig {
                socket_dir: dir.path().to_path_buf(),
                login_uid: 4242,
                ..LoginConfig::default()
            };
            let client = AuthClient::new(&config, Box::new(MockConnector(world.clone())));
            Self {
                dir,
                listeners,
                world,
                client,
            }
        }

        fn id(&self, name: &str) -> ConnectionId {
            self.world.borrow().ids[name]
        }

        fn peer(&self, name: &str) -> Rc<RefCell<Peer>> {
            self.world.borrow().peers[name].clone()
        }

        fn handshake(&self, name: &str, pid: u32, mechs: AuthMech) {
            let mut buf = BytesMut::new();
            ServerHandshake { pid, mechs }.encode(&mut buf);
            self.client.receive(self.id(name), &buf);
        }

        fn reply(&self, name: &str, id: u32, result: ReplyResult, data: &[u8]) {
            let mut buf = BytesMut::new();
            Reply {
                id,
                result,
                data_size: data.len() as u32,
            }
            .encode(&mut buf);
            buf.extend_from_slice(data);
            self.client.receive(self.id(name), &buf);
        }

        fn sent(&self, name: &str) -> Vec<Sent> {
            let peer = self.peer(name);
            let peer = peer.borrow();
            let mut buf = &peer.written[..];
            let mut out = Vec::new();
            if buf.len() >= 4 {
                out.push(Sent::Handshake(buf.get_u32_ne()));
            }
            while buf.len() >= 12 {
                match buf[0] {
                    1 => {
                        out.push(Sent::New(NewRequest::decode(&buf[..12]).unwrap()));
                        buf.advance(12);
                    }
                    _ => {
                        let header = ContinueRequest::decode(&buf[..12]).unwrap();
                        buf.advance(12);
                        let size = header.data_size as usize;
                        out.push(Sent::Continue(header.id, buf[..size].to_vec()));
                        buf.advance(size);
                    }
                }
            }
            out
        }

        fn two_workers(&self) {
            self.client.init();
            self.handshake("w1", 111, AuthMech::PLAIN);
            self.handshake("w2", 222, AuthMech::PLAIN | AuthMech::CRAM_MD5);
        }
    }

    fn pending_handshakes(client: &AuthClient) -> usize {
        client
            .connections()
            .iter()
            .filter(|c| !c.handshake_received())
            .count()
    }

    #[test]
    fn cold_start_with_two_workers() {
        let fx = Fixture::new(&["w1", "w2"]);
        std::fs::write(fx.dir.path().join("readme"), b"hello").unwrap();

        fx.client.init();
        assert_eq!(fx.client.connection_paths(), vec!["w1", "w2"]);
        assert_eq!(fx.client.handshake_pending(), 2);
        assert!(!fx.client.is_connected());
        assert_eq!(fx.sent("w1"), vec![Sent::Handshake(4242)]);

        fx.handshake("w1", 111, AuthMech::PLAIN);
        assert_eq!(fx.client.handshake_pending(), 1);
        assert_eq!(fx.client.available_mechs(), AuthMech::PLAIN);

        fx.handshake("w2", 222, AuthMech::PLAIN | AuthMech::CRAM_MD5);
        assert_eq!(
            fx.client.available_mechs(),
            AuthMech::PLAIN | AuthMech::CRAM_MD5
        );
        assert!(fx.client.is_connected());
        assert_eq!(fx.client.connection("w2").unwrap().pid(), Some(222));
    }

    #[test]
    fn dispatch_sends_one_new_request() {
        let fx = Fixture::new(&["w1", "w2"]);
        fx.two_workers();
        let log: Log = Default::default();

        let request = fx
            .client
            .init_request(AuthMech::PLAIN, AuthProtocol::Imap, recorder(&log))
            .unwrap();
        let expected = Sent::New(NewRequest {
            protocol: AuthProtocol::Imap,
            mech: AuthMech::PLAIN,
            id: request.id(),
        });
        // First fit in directory order.
        assert_eq!(fx.sent("w1"), vec![Sent::Handshake(4242), expected]);
        assert_eq!(fx.sent("w2"), vec![Sent::Handshake(4242)]);
        assert_eq!(fx.client.connection("w1").unwrap().request_ids(), vec![request.id()]);
        assert_eq!(fx.client.connection("w2").unwrap().request_count(), 0);
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn continue_then_success() {
        let fx = Fixture::new(&["w1", "w2"]);
        fx.two_workers();
        let log: Log = Default::default();
        let request = fx
            .client
            .init_request(AuthMech::CRAM_MD5, AuthProtocol::Pop3, recorder(&log))
            .unwrap();
        let id = request.id();

        fx.reply("w2", id, ReplyResult::Continue, b"+");
        assert!(request.is_active());
        fx.client.continue_request(&request, b"response").unwrap();
        assert_eq!(
            fx.sent("w2").last(),
            Some(&Sent::Continue(id, b"response".to_vec()))
        );

        fx.reply("w2", id, ReplyResult::Ok, b"");
        assert_eq!(
            *log.borrow(),
            vec![
                (id, Some(ReplyResult::Continue), b"+".to_vec()),
                (id, Some(ReplyResult::Ok), Vec::new()),
            ]
        );
        assert!(!request.is_active());
        assert!(!fx.client.connection("w2").unwrap().has_request(id));
        assert!(matches!(
            fx.client.continue_request(&request, b"again"),
            Err(AuthError::RequestNotFound(n)) if n == id
        ));
    }

    #[test]
    fn worker_crash_terminates_requests_and_reconnects() {
        let fx = Fixture::new(&["w1", "w2"]);
        fx.two_workers();
        let log: Log = Default::default();
        let request = fx
            .client
            .init_request(AuthMech::CRAM_MD5, AuthProtocol::Imap, recorder(&log))
            .unwrap();
        let old_id = fx.id("w2");

        fx.client.connection_lost(old_id, None);
        assert_eq!(*log.borrow(), vec![(request.id(), None, Vec::new())]);
        assert_eq!(fx.client.available_mechs(), AuthMech::PLAIN);
        assert!(fx.client.needs_reconnect());
        assert!(!fx.client.is_connected());
        assert!(fx.peer("w2").borrow().closed);
        assert_eq!(request.refcount(), 0);
        assert!(matches!(
            fx.client.continue_request(&request, b"x"),
            Err(AuthError::ConnectionClosed)
        ));

        fx.client.tick();
        assert_eq!(fx.client.connection_paths(), vec!["w1", "w2"]);
        assert_ne!(fx.id("w2"), old_id);
        assert!(!fx.client.needs_reconnect());
        fx.handshake("w2", 333, AuthMech::PLAIN | AuthMech::CRAM_MD5);
        assert!(fx.client.is_connected());
        assert_eq!(log.borrow().len(), 1);
    }

    #[test]
    fn unknown_mechanism_sends_nothing() {
        let fx = Fixture::new(&["w1"]);
        fx.client.init();
        fx.handshake("w1", 111, AuthMech::PLAIN);

        let err = fx
            .client
            .init_request(AuthMech::GSSAPI, AuthProtocol::Imap, |_, _| {})
            .unwrap_err();
        assert!(matches!(err, AuthError::UnsupportedMechanism));
        assert_eq!(err.to_string(), "Unsupported authentication mechanism");
        assert_eq!(fx.sent("w1"), vec![Sent::Handshake(4242)]);

        let err = fx
            .client
            .init_request(AuthMech::PLAIN | AuthMech::LOGIN, AuthProtocol::Imap, |_, _| {})
            .unwrap_err();
        assert!(matches!(err, AuthError::UnsupportedMechanism));
    }

    #[test]
    fn request_id_wraps_past_zero() {
        let fx = Fixture::new(&["w1"]);
        fx.client.init();
        fx.handshake("w1", 111, AuthMech::PLAIN);
        fx.client.set_request_id_counter(u32::MAX - 1);

        let a = fx
            .client
            .init_request(AuthMech::PLAIN, AuthProtocol::Imap, |_, _| {})
            .unwrap();
        let b = fx
            .client
            .init_request(AuthMech::PLAIN, AuthProtocol::Imap, |_, _| {})
            .unwrap();
        assert_eq!(a.id(), u32::MAX);
        assert_eq!(b.id(), 1);
    }

    #[test]
    fn wrapped_ids_skip_live_requests() {
        let fx = Fixture::new(&["w1"]);
        fx.client.init();
        fx.handshake("w1", 111, AuthMech::PLAIN);
        let first = fx
            .client
            .init_request(AuthMech::PLAIN, AuthProtocol::Imap, |_, _| {})
            .unwrap();
        assert_eq!(first.id(), 1);
        fx.client.set_request_id_counter(u32::MAX);
        let second = fx
            .client
            .init_request(AuthMech::PLAIN, AuthProtocol::Imap, |_, _| {})
            .unwrap();
        assert_eq!(second.id(), 2);
    }

    #[test]
    fn full_output_buffers_mean_busy() {
        let fx = Fixture::new(&["w1"]);
        fx.client.init();
        fx.handshake("w1", 111, AuthMech::PLAIN);
        fx.peer("w1").borrow_mut().accept = Some(0);

        let mut accepted = 0;
        let err = loop {
            match fx
                .client
                .init_request(AuthMech::PLAIN, AuthProtocol::Imap, |_, _| {})
            {
                Ok(_) => accepted += 1,
                Err(e) => break e,
            }
        };
        assert_eq!(accepted, MAX_OUTBUF_SIZE / NewRequest::SIZE);
        assert!(matches!(err, AuthError::WorkersBusy));
        assert!(fx.client.has_pending_output(fx.id("w1")));

        fx.peer("w1").borrow_mut().accept = None;
        fx.client.flush(fx.id("w1"));
        assert!(!fx.client.has_pending_output(fx.id("w1")));
        assert!(fx
            .client
            .init_request(AuthMech::PLAIN, AuthProtocol::Imap, |_, _| {})
            .is_ok());
    }

    #[test]
    fn send_failure_terminates_on_next_tick() {
        let fx = Fixture::new(&["w1"]);
        fx.client.init();
        fx.handshake("w1", 111, AuthMech::PLAIN);
        fx.peer("w1").borrow_mut().broken = true;
        let log: Log = Default::default();

        let request = fx
            .client
            .init_request(AuthMech::PLAIN, AuthProtocol::Imap, recorder(&log))
            .unwrap();
        assert!(log.borrow().is_empty());
        assert!(fx.client.connection("w1").unwrap().is_destroy_pending());

        let err = fx
            .client
            .init_request(AuthMech::PLAIN, AuthProtocol::Imap, |_, _| {})
            .unwrap_err();
        assert!(matches!(err, AuthError::WorkersDisconnected));
        assert!(fx.client.needs_reconnect());

        fx.client.run_deferred();
        assert_eq!(*log.borrow(), vec![(request.id(), None, Vec::new())]);
        assert!(fx.client.connection_paths().is_empty());
        assert_eq!(fx.client.available_mechs(), AuthMech::empty());
    }

    #[test]
    fn stale_reply_id_is_dropped() {
        let fx = Fixture::new(&["w1"]);
        fx.client.init();
        fx.handshake("w1", 111, AuthMech::PLAIN);
        let log: Log = Default::default();
        let request = fx
            .client
            .init_request(AuthMech::PLAIN, AuthProtocol::Imap, recorder(&log))
            .unwrap();

        fx.reply("w1", 999, ReplyResult::Ok, b"");
        assert!(log.borrow().is_empty());
        assert!(request.is_active());
        assert_eq!(fx.client.connection_paths(), vec!["w1"]);
        assert!(fx.client.is_connected());
    }

    #[test]
    fn malformed_handshake_destroys_connection() {
        let fx = Fixture::new(&["w1", "w2"]);
        fx.client.init();
        fx.handshake("w2", 222, AuthMech::PLAIN);
        fx.client.receive(fx.id("w1"), &[1u8; 12]);

        assert_eq!(fx.client.connection_paths(), vec!["w2"]);
        assert_eq!(fx.client.handshake_pending(), 0);
        assert!(fx.client.needs_reconnect());
        assert!(fx.peer("w1").borrow().closed);
    }

    #[test]
    fn zero_pid_handshake_destroys_connection() {
        let fx = Fixture::new(&["w1"]);
        fx.client.init();
        fx.handshake("w1", 0, AuthMech::PLAIN);
        assert!(fx.client.connection_paths().is_empty());
        assert_eq!(fx.client.handshake_pending(), 0);
        assert_eq!(fx.client.available_mechs(), AuthMech::empty());
    }

    #[test]
    fn callback_may_abort_its_own_request() {
        let fx = Fixture::new(&["w1"]);
        fx.client.init();
        fx.handshake("w1", 111, AuthMech::PLAIN);
        let calls = Rc::new(Cell::new(0));
        let client = fx.client.clone();
        let counter = calls.clone();
        let request = fx
            .client
            .init_request(AuthMech::PLAIN, AuthProtocol::Imap, move |request, _| {
                counter.set(counter.get() + 1);
                assert!(client.abort_request(request));
            })
            .unwrap();

        fx.reply("w1", request.id(), ReplyResult::Continue, b"+");
        fx.reply("w1", request.id(), ReplyResult::Continue, b"+");
        assert_eq!(calls.get(), 1);
        assert!(!request.is_active());
        assert!(!fx.client.abort_request(&request));
    }

    #[test]
    fn callback_may_start_a_request_on_terminal_reply() {
        let fx = Fixture::new(&["w1"]);
        fx.client.init();
        fx.handshake("w1", 111, AuthMech::PLAIN);
        let started: Rc<RefCell<Option<AuthRequest>>> = Default::default();
        let client = fx.client.clone();
        let slot = started.clone();
        let first = fx
            .client
            .init_request(AuthMech::PLAIN, AuthProtocol::Imap, move |_, reply| {
                if let Some(reply) = reply {
                    if reply.result == ReplyResult::Fail {
                        let next = client
                            .init_request(AuthMech::PLAIN, AuthProtocol::Imap, |_, _| {})
                            .unwrap();
                        *slot.borrow_mut() = Some(next);
                    }
                }
            })
            .unwrap();

        fx.reply("w1", first.id(), ReplyResult::Fail, b"");
        let second = started.borrow().clone().unwrap();
        assert_ne!(second.id(), first.id());
        assert!(second.is_active());
        assert!(!first.is_active());
        assert_eq!(
            fx.client.connection("w1").unwrap().request_ids(),
            vec![second.id()]
        );
    }

    #[test]
    fn teardown_during_callback_waits_for_delivery_to_finish() {
        let fx = Fixture::new(&["w1"]);
        fx.client.init();
        fx.handshake("w1", 111, AuthMech::PLAIN);
        let log: Log = Default::default();
        let client = fx.client.clone();
        let peer = fx.peer("w1");
        let inner_log = log.clone();
        let request = fx
            .client
            .init_request(AuthMech::PLAIN, AuthProtocol::Imap, move |request, reply| {
                inner_log
                    .borrow_mut()
                    .push((request.id(), reply.map(|r| r.result), Vec::new()));
                if reply.is_some() {
                    peer.borrow_mut().broken = true;
                    client.continue_request(request, b"resp").unwrap();
                    // Still registered until this callback returns.
                    assert_eq!(client.connection_paths(), vec!["w1"]);
                    assert!(request.is_active());
                }
            })
            .unwrap();

        fx.reply("w1", request.id(), ReplyResult::Continue, b"+");
        assert_eq!(
            *log.borrow(),
            vec![
                (request.id(), Some(ReplyResult::Continue), Vec::new()),
                (request.id(), None, Vec::new()),
            ]
        );
        assert!(fx.client.connection_paths().is_empty());
    }

    #[test]
    fn retained_request_keeps_connection_alive() {
        let fx = Fixture::new(&["w1"]);
        fx.client.init();
        fx.handshake("w1", 111, AuthMech::PLAIN);
        let request = fx
            .client
            .init_request(AuthMech::PLAIN, AuthProtocol::Imap, |_, _| {})
            .unwrap();
        assert_eq!(request.refcount(), 1);

        let retained = request.retain().unwrap();
        assert_eq!(request.refcount(), 2);
        let again = retained.retain().unwrap();
        assert_eq!(request.refcount(), 3);
        drop(again);
        assert_eq!(request.refcount(), 2);

        fx.client.connection_lost(fx.id("w1"), Some(io::ErrorKind::ConnectionReset.into()));
        assert_eq!(request.refcount(), 1);
        assert!(request.connection().unwrap().is_destroyed());
        assert!(matches!(
            fx.client.continue_request(&retained, b"x"),
            Err(AuthError::ConnectionClosed)
        ));
        drop(retained);
        assert_eq!(request.refcount(), 0);
        assert!(request.retain().is_none());
    }

    #[test]
    fn oversized_continuation_is_refused() {
        let fx = Fixture::new(&["w1"]);
        fx.client.init();
        fx.handshake("w1", 111, AuthMech::PLAIN);
        let request = fx
            .client
            .init_request(AuthMech::PLAIN, AuthProtocol::Imap, |_, _| {})
            .unwrap();
        let data = vec![b'x'; MAX_REQUEST_DATA_SIZE + 1];
        assert!(matches!(
            fx.client.continue_request(&request, &data),
            Err(AuthError::PayloadTooLarge { size, max }) if size == 4097 && max == 4096
        ));
        assert_eq!(fx.client.connection_paths(), vec!["w1"]);
    }

    #[test]
    fn failed_connect_keeps_reconnect_flag() {
        let fx = Fixture::new(&["w1", "w2"]);
        fx.world.borrow_mut().refuse.insert("w2".into());
        fx.client.init();
        assert_eq!(fx.client.connection_paths(), vec!["w1"]);
        assert!(fx.client.needs_reconnect());
        fx.handshake("w1", 111, AuthMech::PLAIN);
        assert!(!fx.client.is_connected());

        fx.world.borrow_mut().refuse.clear();
        fx.client.tick();
        assert_eq!(fx.client.connection_paths(), vec!["w1", "w2"]);
        assert!(!fx.client.needs_reconnect());
        assert_eq!(fx.client.handshake_pending(), 1);
    }

    #[test]
    fn empty_directory_keeps_reconnect_flag() {
        let fx = Fixture::new(&[]);
        fx.client.init();
        assert!(fx.client.needs_reconnect());
        assert!(matches!(
            fx.client
                .init_request(AuthMech::PLAIN, AuthProtocol::Imap, |_, _| {}),
            Err(AuthError::UnsupportedMechanism)
        ));
        assert_eq!(fx.world.borrow().connects, 0);
    }

    #[test]
    fn init_request_reconnects_first() {
        let fx = Fixture::new(&["w1"]);
        fx.client.init();
        fx.handshake("w1", 111, AuthMech::PLAIN);
        fx.client.connection_lost(fx.id("w1"), None);
        assert_eq!(fx.world.borrow().connects, 1);

        // Reconnected, but the new connection has no handshake yet.
        let err = fx
            .client
            .init_request(AuthMech::PLAIN, AuthProtocol::Imap, |_, _| {})
            .unwrap_err();
        assert!(matches!(err, AuthError::WorkersDisconnected));
        assert_eq!(fx.world.borrow().connects, 2);
        assert_eq!(fx.client.handshake_pending(), 1);
    }

    #[test]
    fn crashed_worker_mechanisms_stay_known() {
        let fx = Fixture::new(&["w1"]);
        fx.client.init();
        fx.handshake("w1", 111, AuthMech::PLAIN | AuthMech::LOGIN);
        std::fs::remove_file(fx.dir.path().join("w1")).unwrap();
        fx.client.connection_lost(fx.id("w1"), None);
        assert_eq!(fx.client.available_mechs(), AuthMech::empty());
        assert_eq!(fx.client.known_mechs(), AuthMech::PLAIN | AuthMech::LOGIN);

        let err = fx
            .client
            .init_request(AuthMech::LOGIN, AuthProtocol::Pop3, |_, _| {})
            .unwrap_err();
        assert!(matches!(err, AuthError::WorkersDisconnected));
        assert_eq!(
            err.to_string(),
            "Authentication server isn't connected, try again later.."
        );
        assert!(fx.client.needs_reconnect());

        // never offered by anyone
        let err = fx
            .client
            .init_request(AuthMech::GSSAPI, AuthProtocol::Imap, |_, _| {})
            .unwrap_err();
        assert!(matches!(err, AuthError::UnsupportedMechanism));
    }

    #[test]
    fn shutdown_terminates_everything() {
        let fx = Fixture::new(&["w1", "w2"]);
        fx.two_workers();
        let log: Log = Default::default();
        let a = fx
            .client
            .init_request(AuthMech::PLAIN, AuthProtocol::Imap, recorder(&log))
            .unwrap();
        let b = fx
            .client
            .init_request(AuthMech::CRAM_MD5, AuthProtocol::Imap, recorder(&log))
            .unwrap();

        fx.client.shutdown();
        assert!(fx.client.connection_paths().is_empty());
        assert!(!fx.client.needs_reconnect());
        assert_eq!(
            *log.borrow(),
            vec![(a.id(), None, Vec::new()), (b.id(), None, Vec::new())]
        );
        assert!(fx.peer("w1").borrow().closed);
        assert!(fx.peer("w2").borrow().closed);

        // No reconnection after shutdown.
        fx.client.tick();
        assert!(fx.client.connection_paths().is_empty());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Init(bool),
        Continue(usize),
        Abort(usize),
        Reply(usize, u8),
        Crash(bool),
        Rewind(usize),
        Vanish(bool),
        Appear(bool),
        Tick,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => any::<bool>().prop_map(Op::Init),
            2 => any::<usize>().prop_map(Op::Continue),
            1 => any::<usize>().prop_map(Op::Abort),
            4 => (any::<usize>(), 1u8..=4).prop_map(|(i, r)| Op::Reply(i, r)),
            1 => any::<bool>().prop_map(Op::Crash),
            1 => any::<usize>().prop_map(Op::Rewind),
            1 => any::<bool>().prop_map(Op::Vanish),
            1 => any::<bool>().prop_map(Op::Appear),
            2 => Just(Op::Tick),
        ]
    }

    struct Tracked {
        request: AuthRequest,
        aborted: bool,
        calls: Rc<RefCell<Vec<Option<ReplyResult>>>>,
    }

    impl Tracked {
        fn terminals(&self) -> usize {
            self.calls
                .borrow()
                .iter()
                .filter(|r| !matches!(r, Some(ReplyResult::Continue)))
                .count()
        }

        fn is_live(&self) -> bool {
            !self.aborted && self.terminals() == 0
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn callbacks_end_with_exactly_one_terminal(
            start in prop_oneof![Just(0u32), Just(u32::MAX - 2)],
            ops in proptest::collection::vec(op(), 1..40),
        ) {
            let mut fx = Fixture::new(&["w1", "w2"]);
            fx.two_workers();
            fx.client.set_request_id_counter(start);
            let mut requests: Vec<Tracked> = Vec::new();

            for op in ops {
                match op {
                    Op::Init(cram) => {
                        let mech = if cram { AuthMech::CRAM_MD5 } else { AuthMech::PLAIN };
                        let calls: Rc<RefCell<Vec<Option<ReplyResult>>>> = Default::default();
                        let sink = calls.clone();
                        let started = fx.client.init_request(mech, AuthProtocol::Imap, move |_, reply| {
                            sink.borrow_mut().push(reply.map(|r| r.result));
                        });
                        if let Ok(request) = started {
                            requests.push(Tracked { request, aborted: false, calls });
                        }
                    }
                    Op::Continue(i) if !requests.is_empty() => {
                        let tracked = &requests[i % requests.len()];
                        let _ = fx.client.continue_request(&tracked.request, b"data");
                    }
                    Op::Abort(i) if !requests.is_empty() => {
                        let n = requests.len();
                        let tracked = &mut requests[i % n];
                        // a finished handle's id may belong to a newer request by now
                        if tracked.is_live() && fx.client.abort_request(&tracked.request) {
                            tracked.aborted = true;
                        }
                    }
                    Op::Reply(i, code) if !requests.is_empty() => {
                        let request = &requests[i % requests.len()].request;
                        if let Some(conn) = request.connection() {
                            if !conn.is_destroyed() {
                                let result = ReplyResult::from_code(code).unwrap();
                                fx.reply(conn.path(), request.id(), result, b"");
                            }
                        }
                    }
                    Op::Crash(second) => {
                        let name = if second { "w2" } else { "w1" };
                        if let Some(conn) = fx.client.connection(name) {
                            fx.client.connection_lost(conn.id(), None);
                        }
                    }
                    Op::Rewind(i) if !requests.is_empty() => {
                        // the next id would collide with this one if it is still live
                        let id = requests[i % requests.len()].request.id();
                        fx.client.set_request_id_counter(id.wrapping_sub(1));
                    }
                    Op::Vanish(second) => {
                        let name = if second { "w2" } else { "w1" };
                        let _ = std::fs::remove_file(fx.dir.path().join(name));
                        if let Some(conn) = fx.client.connection(name) {
                            fx.client.connection_lost(conn.id(), None);
                        }
                    }
                    Op::Appear(second) => {
                        let name = if second { "w2" } else { "w1" };
                        let path = fx.dir.path().join(name);
                        if !path.exists() {
                            fx.listeners.push(UnixListener::bind(path).unwrap());
                        }
                    }
                    Op::Tick => {
                        fx.client.tick();
                        let sockets = scan_worker_sockets(fx.dir.path()).unwrap();
                        for path in fx.client.connection_paths() {
                            prop_assert!(sockets.contains(&path), "{} has no socket", path);
                        }
                        for conn in fx.client.connections() {
                            if !conn.handshake_received() {
                                let mechs = if conn.path() == "w1" {
                                    AuthMech::PLAIN
                                } else {
                                    AuthMech::PLAIN | AuthMech::CRAM_MD5
                                };
                                fx.handshake(conn.path(), 100, mechs);
                            }
                        }
                    }
                    _ => {}
                }

                prop_assert_eq!(fx.client.handshake_pending(), pending_handshakes(&fx.client));
                for conn in fx.client.connections() {
                    let table = conn.request_ids();
                    prop_assert!(!table.contains(&0));
                    let mut live = HashSet::new();
                    for tracked in requests.iter().filter(|t| t.is_live()) {
                        let owned = tracked
                            .request
                            .connection()
                            .map(|c| Rc::ptr_eq(&c, &conn))
                            .unwrap_or(false);
                        if !owned {
                            continue;
                        }
                        let id = tracked.request.id();
                        prop_assert!(live.insert(id), "id {} reused on {}", id, conn.path());
                        if !conn.is_destroy_pending() {
                            prop_assert!(table.contains(&id));
                        }
                    }
                }
            }
            fx.client.shutdown();

            for tracked in &requests {
                let terminal = tracked.terminals();
                prop_assert_eq!(terminal, if tracked.aborted { 0 } else { 1 });
                if terminal == 1 {
                    let calls = tracked.calls.borrow();
                    prop_assert!(!matches!(calls.last(), Some(Some(ReplyResult::Continue))));
                }
            }
        }
    }
}
