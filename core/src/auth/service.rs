/*
 * service.rs
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

//! Tokio driver for the auth multiplexer: worker sockets, the reconnect timer
//! and queued teardowns. Must run inside a `LocalSet` on a current-thread runtime.

use std::cell::Cell;
use std::future::Future;
use std::io;
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use tokio::io::Interest;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, Notify};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use super::client::AuthClient;
use super::connection::{ConnectionId, WorkerLink};
use super::registry::Connector;
use crate::config::LoginConfig;

const READ_BUFFER_SIZE: usize = 8192;

/// Shared between a link and its reader task.
#[derive(Default)]
struct LinkSignals {
    closed: Cell<bool>,
    notify: Notify,
}

struct TokioLink {
    stream: Rc<UnixStream>,
    signals: Rc<LinkSignals>,
}

impl WorkerLink for TokioLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.try_write(buf)
    }

    fn want_write(&mut self) {
        self.signals.notify.notify_one();
    }

    fn close(&mut self) {
        self.signals.closed.set(true);
        self.signals.notify.notify_one();
    }
}

/// A freshly connected worker socket, handed to the service loop for reading.
struct LinkRegistration {
    id: ConnectionId,
    stream: Rc<UnixStream>,
    signals: Rc<LinkSignals>,
}

/// Connects with a blocking `connect(2)`, then hands the socket to tokio.
struct UnixConnector {
    links: mpsc::UnboundedSender<LinkRegistration>,
}

impl Connector for UnixConnector {
    fn connect(&mut self, id: ConnectionId, path: &Path) -> io::Result<Box<dyn WorkerLink>> {
        let stream = std::os::unix::net::UnixStream::connect(path)?;
        stream.set_nonblocking(true)?;
        let stream = Rc::new(UnixStream::from_std(stream)?);
        let signals = Rc::new(LinkSignals::default());
        self.links
            .send(LinkRegistration {
                id,
                stream: stream.clone(),
                signals: signals.clone(),
            })
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "auth service is not running"))?;
        Ok(Box::new(TokioLink { stream, signals }))
    }
}

/// Owns the event loop side of the multiplexer. Login sessions use the
/// [`AuthClient`] obtained from [`AuthService::client`].
pub struct AuthService {
    client: AuthClient,
    links: mpsc::UnboundedReceiver<LinkRegistration>,
    reconnect_interval: Duration,
}

impl AuthService {
    pub fn new(config: &LoginConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = AuthClient::new(config, Box::new(UnixConnector { links: tx }));
        Self {
            client,
            links: rx,
            reconnect_interval: config.reconnect_interval,
        }
    }

    pub fn client(&self) -> AuthClient {
        self.client.clone()
    }

    /// Connect to the workers and serve until `shutdown` resolves, then destroy
    /// every connection.
    pub async fn run<F>(mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        self.client.init();
        tokio::pin!(shutdown);
        let mut ticker = interval_at(
            Instant::now() + self.reconnect_interval,
            self.reconnect_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                Some(link) = self.links.recv() => {
                    tokio::task::spawn_local(drive_link(self.client.clone(), link));
                }
                _ = ticker.tick() => self.client.tick(),
                _ = self.client.wait_for_work() => self.client.run_deferred(),
            }
        }

        info!("auth: shutting down");
        self.client.shutdown();
    }
}

/// Reader task for one worker socket. Exits once the core closes the link.
async fn drive_link(client: AuthClient, link: LinkRegistration) {
    let LinkRegistration {
        id,
        stream,
        signals,
    } = link;
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    while !signals.closed.get() {
        let interest = if client.has_pending_output(id) {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        let ready = tokio::select! {
            ready = stream.ready(interest) => ready,
            // Output queued or link closed: recompute interest.
            _ = signals.notify.notified() => continue,
        };
        let ready = match ready {
            Ok(ready) => ready,
            Err(e) => {
                client.connection_lost(id, Some(e));
                break;
            }
        };

        if ready.is_readable() {
            match stream.try_read(&mut buf) {
                Ok(0) => {
                    client.connection_lost(id, None);
                    break;
                }
                Ok(n) => client.receive(id, &buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    client.connection_lost(id, Some(e));
                    break;
                }
            }
        }
        if ready.is_writable() && !signals.closed.get() {
            client.flush(id);
        }
    }
    debug!("auth: reader for connection {} finished", id);
}
