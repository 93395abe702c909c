/*
 * lib.rs
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

//! Portcullis core: the login process's side of authentication.
//!
//! - `auth`: multiplexes client authentication requests over the auth worker
//!   sockets found in one directory (handshake, request routing, reconnects).
//! - `localstorage`: message index and two-phase maildir saves.
//! - `config`: login process configuration.
//! - `store`: flags and errors shared by the storage code.

pub mod auth;
pub mod config;
pub mod localstorage;
pub mod store;

pub use auth::{AuthClient, AuthError, AuthMech, AuthProtocol, AuthService};
pub use config::{ConfigError, LoginConfig};
