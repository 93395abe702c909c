/*
 * registry.rs
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

//! The set of worker connections, the aggregate mechanism view and the
//! directory reconciler.

use std::fs;
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use bytes::BytesMut;
use indexmap::IndexMap;
use tracing::{debug, error, info, warn};

use super::connection::{ConnectionId, WorkerConnection, WorkerLink};
use super::error::AuthError;
use super::mechanism::AuthMech;
use super::wire::ClientHandshake;

/// Opens the transport for a worker socket. `connect` may block briefly.
pub trait Connector {
    fn connect(&mut self, id: ConnectionId, path: &Path) -> io::Result<Box<dyn WorkerLink>>;
}

/// Sorted names of the worker sockets in `dir`: socket files whose name does
/// not start with a dot.
pub fn scan_worker_sockets(dir: &Path) -> io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = match entry.file_name().into_string() {
            Ok(name) => name,
            Err(_) => continue,
        };
        if name.starts_with('.') {
            continue;
        }
        // stat, not lstat: a symlink to a socket counts.
        match fs::metadata(entry.path()) {
            Ok(meta) if meta.file_type().is_socket() => names.push(name),
            Ok(_) => {}
            Err(e) => debug!("auth: stat({}) failed: {}", name, e),
        }
    }
    names.sort();
    Ok(names)
}

pub struct Registry {
    socket_dir: PathBuf,
    connector: Box<dyn Connector>,
    /// Keyed by socket file name; insertion order is first-fit order.
    connections: IndexMap<String, Rc<WorkerConnection>>,
    /// Union over live connections.
    available_mechs: AuthMech,
    /// Every mechanism any worker has advertised since startup; never shrinks.
    known_mechs: AuthMech,
    needs_reconnect: bool,
    handshake_pending: usize,
    request_id_counter: u32,
    next_connection_id: ConnectionId,
    login_uid: u32,
    max_inbuf: usize,
    max_outbuf: usize,
    shutting_down: bool,
}

impl Registry {
    pub fn new(
        socket_dir: PathBuf,
        connector: Box<dyn Connector>,
        login_uid: u32,
        max_inbuf: usize,
        max_outbuf: usize,
    ) -> Self {
        Self {
            socket_dir,
            connector,
            connections: IndexMap::new(),
            available_mechs: AuthMech::empty(),
            known_mechs: AuthMech::empty(),
            needs_reconnect: false,
            handshake_pending: 0,
            request_id_counter: 0,
            next_connection_id: 1,
            login_uid,
            max_inbuf,
            max_outbuf,
            shutting_down: false,
        }
    }

    pub fn available_mechs(&self) -> AuthMech {
        self.available_mechs
    }

    pub fn known_mechs(&self) -> AuthMech {
        self.known_mechs
    }

    pub fn needs_reconnect(&self) -> bool {
        self.needs_reconnect
    }

    pub fn set_needs_reconnect(&mut self) {
        self.needs_reconnect = true;
    }

    pub fn handshake_pending(&self) -> usize {
        self.handshake_pending
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    pub(crate) fn begin_shutdown(&mut self) {
        self.shutting_down = true;
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn paths(&self) -> Vec<String> {
        self.connections.keys().cloned().collect()
    }

    pub fn find(&self, path: &str) -> Option<Rc<WorkerConnection>> {
        self.connections.get(path).cloned()
    }

    pub fn get(&self, id: ConnectionId) -> Option<Rc<WorkerConnection>> {
        self.connections.values().find(|c| c.id() == id).cloned()
    }

    pub fn connections(&self) -> Vec<Rc<WorkerConnection>> {
        self.connections.values().cloned().collect()
    }

    /// Open a connection for every worker socket not yet registered. The
    /// reconnect flag is cleared only if every open succeeded and at least one
    /// worker is registered.
    pub fn reconcile(&mut self) {
        if self.shutting_down {
            return;
        }
        self.needs_reconnect = true;
        let names = match scan_worker_sockets(&self.socket_dir) {
            Ok(names) => names,
            Err(e) => {
                error!("auth: opendir({}) failed: {}", self.socket_dir.display(), e);
                return;
            }
        };

        let mut all_ok = true;
        for name in names {
            if self.connections.contains_key(&name) {
                continue;
            }
            if !self.open(&name) {
                all_ok = false;
            }
        }
        if all_ok && !self.connections.is_empty() {
            self.needs_reconnect = false;
        }
    }

    fn open(&mut self, name: &str) -> bool {
        let path = self.socket_dir.join(name);
        let id = self.next_connection_id;
        self.next_connection_id += 1;

        let link = match self.connector.connect(id, &path) {
            Ok(link) => link,
            Err(e) => {
                error!("auth: connect({}) failed: {}", name, e);
                return false;
            }
        };
        let conn = Rc::new(WorkerConnection::new(
            id,
            name.to_string(),
            link,
            self.max_inbuf,
            self.max_outbuf,
        ));
        self.connections.insert(name.to_string(), conn.clone());
        self.handshake_pending += 1;

        let mut buf = BytesMut::with_capacity(ClientHandshake::SIZE);
        ClientHandshake {
            pid: self.login_uid,
        }
        .encode(&mut buf);
        if let Err(e) = conn.send(&[&buf[..]]) {
            error!("auth: sending handshake to {} failed: {}", name, e);
            self.unregister(&conn);
            conn.close();
            return false;
        }
        info!("auth: connected to {}", name);
        true
    }

    /// First-fit choice of a connection serving `mech` with room for `size`
    /// more output bytes.
    pub fn select(&mut self, mech: AuthMech, size: usize) -> Result<Rc<WorkerConnection>, AuthError> {
        let mut found = false;
        for conn in self.connections.values() {
            if conn.is_destroy_pending() || !conn.mechs().intersects(mech) {
                continue;
            }
            if conn.has_room(size) {
                return Ok(conn.clone());
            }
            found = true;
        }
        if found {
            warn!("Authentication servers are busy");
            return Err(AuthError::WorkersBusy);
        }
        if !self.known_mechs.intersects(mech) {
            return Err(AuthError::UnsupportedMechanism);
        }
        self.needs_reconnect = true;
        Err(AuthError::WorkersDisconnected)
    }

    /// Next correlation id for a request on `conn`: never zero, never one that
    /// is still live on that connection.
    pub fn next_request_id(&mut self, conn: &WorkerConnection) -> u32 {
        loop {
            self.request_id_counter = self.request_id_counter.wrapping_add(1);
            if self.request_id_counter == 0 {
                self.request_id_counter = 1;
            }
            if !conn.has_request(self.request_id_counter) {
                return self.request_id_counter;
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn set_request_id_counter(&mut self, value: u32) {
        self.request_id_counter = value;
    }

    pub(crate) fn handshake_completed(&mut self, conn: &WorkerConnection) {
        self.handshake_pending = self.handshake_pending.saturating_sub(1);
        debug!(
            "auth {}: handshake from pid {:?}, mechs {}",
            conn.path(),
            conn.pid(),
            conn.mechs()
        );
        self.known_mechs |= conn.mechs();
        self.update_available_mechs();
    }

    /// Remove `conn` from the registry if it is still the registered entry for
    /// its path. Returns false if it was not registered.
    pub fn unregister(&mut self, conn: &Rc<WorkerConnection>) -> bool {
        match self.connections.get(conn.path()) {
            Some(registered) if Rc::ptr_eq(registered, conn) => {}
            _ => return false,
        }
        self.connections.shift_remove(conn.path());
        if !conn.handshake_received() {
            self.handshake_pending = self.handshake_pending.saturating_sub(1);
        }
        self.update_available_mechs();
        if !self.shutting_down {
            self.needs_reconnect = true;
        }
        true
    }

    pub fn update_available_mechs(&mut self) {
        self.available_mechs = self
            .connections
            .values()
            .fold(AuthMech::empty(), |acc, conn| acc | conn.mechs());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;

    #[test]
    fn scan_skips_dotfiles_and_regular_files() {
        let dir = tempfile::tempdir().unwrap();
        let _w2 = UnixListener::bind(dir.path().join("w2")).unwrap();
        let _w1 = UnixListener::bind(dir.path().join("w1")).unwrap();
        let _hidden = UnixListener::bind(dir.path().join(".w3")).unwrap();
        fs::write(dir.path().join("readme"), b"not a socket").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();

        let names = scan_worker_sockets(dir.path()).unwrap();
        assert_eq!(names, vec!["w1".to_string(), "w2".to_string()]);
    }

    #[test]
    fn scan_of_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(scan_worker_sockets(&dir.path().join("nope")).is_err());
    }
}
