/*
 * connection.rs
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

//! One connection to an auth worker: buffers, handshake state and the table of
//! in-flight requests.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;

use bytes::BytesMut;
use tracing::{debug, trace};

use super::client::AuthCallback;
use super::error::WireError;
use super::mechanism::{AuthMech, AuthProtocol};
use super::parser::{ReplyParser, WorkerFrame};
use super::wire::ServerHandshake;

/// Process-unique identifier of a worker connection. Never reused, so a stale
/// id held by an I/O task cannot address a newer connection to the same path.
pub type ConnectionId = u64;

/// Byte sink for one worker socket. Writes are non-blocking: a short write or
/// `WouldBlock` leaves the rest in the connection's output buffer.
pub trait WorkerLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Called when output remains buffered; the driver should flush once the
    /// socket is writable.
    fn want_write(&mut self) {}

    /// Stop all I/O. Called exactly once, when the connection is destroyed.
    fn close(&mut self);
}

pub(crate) struct RequestEntry {
    pub mech: AuthMech,
    pub protocol: AuthProtocol,
    /// `None` while the callback is being invoked.
    pub callback: Option<AuthCallback>,
}

struct ConnState {
    link: Option<Box<dyn WorkerLink>>,
    input: BytesMut,
    output: BytesMut,
    parser: ReplyParser,
    handshake: Option<ServerHandshake>,
    requests: HashMap<u32, RequestEntry>,
    destroyed: bool,
    destroy_pending: bool,
}

pub struct WorkerConnection {
    id: ConnectionId,
    path: String,
    max_inbuf: usize,
    max_outbuf: usize,
    state: RefCell<ConnState>,
}

impl std::fmt::Debug for WorkerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("WorkerConnection")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("handshake", &state.handshake)
            .field("requests", &state.requests.len())
            .field("destroyed", &state.destroyed)
            .finish()
    }
}

impl WorkerConnection {
    pub fn new(
        id: ConnectionId,
        path: String,
        link: Box<dyn WorkerLink>,
        max_inbuf: usize,
        max_outbuf: usize,
    ) -> Self {
        Self {
            id,
            path,
            max_inbuf,
            max_outbuf,
            state: RefCell::new(ConnState {
                link: Some(link),
                input: BytesMut::with_capacity(1024),
                output: BytesMut::with_capacity(max_outbuf),
                parser: ReplyParser::new(max_inbuf),
                handshake: None,
                requests: HashMap::new(),
                destroyed: false,
                destroy_pending: false,
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn handshake(&self) -> Option<ServerHandshake> {
        self.state.borrow().handshake
    }

    pub fn handshake_received(&self) -> bool {
        self.state.borrow().handshake.is_some()
    }

    /// Worker PID, once the handshake has arrived.
    pub fn pid(&self) -> Option<u32> {
        self.state.borrow().handshake.map(|hs| hs.pid)
    }

    /// Mechanisms this worker serves; empty until the handshake completes.
    pub fn mechs(&self) -> AuthMech {
        self.state
            .borrow()
            .handshake
            .map(|hs| hs.mechs)
            .unwrap_or_default()
    }

    pub(crate) fn complete_handshake(&self, handshake: ServerHandshake) {
        self.state.borrow_mut().handshake = Some(handshake);
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.borrow().destroyed
    }

    pub fn is_destroy_pending(&self) -> bool {
        self.state.borrow().destroy_pending
    }

    /// Returns false if the connection was already marked.
    pub(crate) fn mark_destroy_pending(&self) -> bool {
        let mut state = self.state.borrow_mut();
        !std::mem::replace(&mut state.destroy_pending, true)
    }

    /// True if `size` more bytes fit in the output buffer.
    pub fn has_room(&self, size: usize) -> bool {
        let state = self.state.borrow();
        !state.destroyed && state.output.len() + size <= self.max_outbuf
    }

    pub fn has_pending_output(&self) -> bool {
        !self.state.borrow().output.is_empty()
    }

    /// Queue one record, made of `parts`, and try to write it out. The record is
    /// buffered whole or not at all.
    pub fn send(&self, parts: &[&[u8]]) -> Result<(), WireError> {
        let total: usize = parts.iter().map(|p| p.len()).sum();
        {
            let mut state = self.state.borrow_mut();
            if state.destroyed || state.link.is_none() {
                return Err(WireError::Closed);
            }
            if state.output.len() + total > self.max_outbuf {
                return Err(WireError::BufferFull);
            }
            for part in parts {
                state.output.extend_from_slice(part);
            }
        }
        self.flush()
    }

    /// Write as much buffered output as the socket accepts.
    pub fn flush(&self) -> Result<(), WireError> {
        let mut state = self.state.borrow_mut();
        let ConnState { link, output, .. } = &mut *state;
        let link = match link.as_mut() {
            Some(link) => link,
            None => return Err(WireError::Closed),
        };
        while !output.is_empty() {
            match link.write(&output[..]) {
                Ok(0) => return Err(WireError::Closed),
                Ok(n) => {
                    trace!("auth {}: wrote {} bytes", self.path, n);
                    let _ = output.split_to(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    link.want_write();
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(WireError::Io(e)),
            }
        }
        Ok(())
    }

    /// Buffer bytes read from the worker and parse complete records into `frames`.
    /// Input beyond the inbound limit is fatal.
    pub(crate) fn receive(
        &self,
        mut data: &[u8],
        frames: &mut Vec<WorkerFrame>,
    ) -> Result<(), WireError> {
        let mut state = self.state.borrow_mut();
        if state.destroyed {
            return Err(WireError::Closed);
        }
        let ConnState { input, parser, .. } = &mut *state;
        while !data.is_empty() {
            let room = self.max_inbuf.saturating_sub(input.len());
            if room == 0 {
                return Err(WireError::InboundOverflow(self.max_inbuf));
            }
            let n = room.min(data.len());
            input.extend_from_slice(&data[..n]);
            data = &data[n..];
            parser.receive(input, frames)?;
        }
        Ok(())
    }

    pub(crate) fn insert_request(&self, id: u32, entry: RequestEntry) {
        self.state.borrow_mut().requests.insert(id, entry);
    }

    pub fn has_request(&self, id: u32) -> bool {
        self.state.borrow().requests.contains_key(&id)
    }

    pub fn request_count(&self) -> usize {
        self.state.borrow().requests.len()
    }

    /// Live correlation ids, ascending.
    pub fn request_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.state.borrow().requests.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Take the callback out of its entry for invocation. The entry stays in the
    /// table; `None` if the id is unknown or the callback is already out.
    pub(crate) fn take_callback(&self, id: u32) -> Option<(AuthMech, AuthProtocol, AuthCallback)> {
        let mut state = self.state.borrow_mut();
        let entry = state.requests.get_mut(&id)?;
        let callback = entry.callback.take()?;
        Some((entry.mech, entry.protocol, callback))
    }

    /// Put a callback back after invocation, unless the request went away meanwhile.
    pub(crate) fn restore_callback(&self, id: u32, callback: AuthCallback) {
        let mut state = self.state.borrow_mut();
        if let Some(entry) = state.requests.get_mut(&id) {
            if entry.callback.is_none() {
                entry.callback = Some(callback);
            }
        }
    }

    pub(crate) fn remove_request(&self, id: u32) -> Option<RequestEntry> {
        self.state.borrow_mut().requests.remove(&id)
    }

    /// Empty the request table, ascending by id.
    pub(crate) fn drain_requests(&self) -> Vec<(u32, RequestEntry)> {
        let mut entries: Vec<(u32, RequestEntry)> =
            self.state.borrow_mut().requests.drain().collect();
        entries.sort_unstable_by_key(|(id, _)| *id);
        entries
    }

    /// Close the link and drop buffered data. Returns false if already closed.
    pub(crate) fn close(&self) -> bool {
        let link = {
            let mut state = self.state.borrow_mut();
            if state.destroyed {
                return false;
            }
            state.destroyed = true;
            state.input.clear();
            state.output.clear();
            state.link.take()
        };
        if let Some(mut link) = link {
            link.close();
        }
        debug!("auth {}: connection closed", self.path);
        true
    }
}
