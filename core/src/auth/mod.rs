/*
 * mod.rs
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

//! Authentication multiplexer: multiplexes login sessions' SASL exchanges over
//! connections to local auth worker processes.

pub mod client;
pub mod connection;
pub mod error;
pub mod mechanism;
pub mod parser;
pub mod registry;
pub mod service;
pub mod wire;

pub use client::{AuthCallback, AuthClient, AuthReply, AuthRequest, RetainedRequest};
pub use connection::{ConnectionId, WorkerConnection, WorkerLink};
pub use error::{AuthError, WireError};
pub use mechanism::{AuthMech, AuthProtocol};
pub use registry::{scan_worker_sockets, Connector};
pub use service::AuthService;
pub use wire::ReplyResult;
