/*
 * error.rs
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

//! Errors surfaced by the auth multiplexer.

use std::io;

/// Errors returned to callers of the request API. Display strings are shown to clients.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Unsupported authentication mechanism")]
    UnsupportedMechanism,

    #[error("Authentication servers are busy, wait..")]
    WorkersBusy,

    #[error("Authentication server isn't connected, try again later..")]
    WorkersDisconnected,

    #[error("authentication request {0} is no longer active")]
    RequestNotFound(u32),

    #[error("continuation payload of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("connection to auth process is closed")]
    ConnectionClosed,
}

/// Framing and transport failures on one worker connection.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("output buffer full")]
    BufferFull,

    #[error("Auth process sent us more than {0} bytes of data")]
    InboundOverflow(usize),

    #[error("Auth process sent us too large handshake ({size} vs {expected})")]
    OversizedHandshake { size: usize, expected: usize },

    #[error("Auth process said it's PID 0")]
    ZeroPid,

    #[error("Auth process sent unknown reply result {0}")]
    UnknownResult(u8),

    #[error("Auth process announced a {size} byte reply, limit is {max}")]
    OversizedReply { size: usize, max: usize },

    #[error("unexpected record type {0}")]
    UnexpectedType(u8),

    #[error("truncated record: {size} of {expected} bytes")]
    Truncated { size: usize, expected: usize },

    #[error("connection closed")]
    Closed,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl WireError {
    /// Framing errors mean the worker is misbehaving, as opposed to the socket failing.
    pub fn is_worker_bug(&self) -> bool {
        matches!(
            self,
            WireError::InboundOverflow(_)
                | WireError::OversizedHandshake { .. }
                | WireError::ZeroPid
                | WireError::UnknownResult(_)
                | WireError::OversizedReply { .. }
                | WireError::UnexpectedType(_)
        )
    }
}
