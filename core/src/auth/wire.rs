/*
 * wire.rs
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

//! Login <-> auth worker records.
//!
//! Records are fixed-layout structs in host byte order, laid out as the worker's
//! C structs with natural alignment (padding bytes are written as zero). Only peers
//! on the same host can talk this protocol.
//!
//! ```text
//! ClientHandshake   pid:u32                                          4 bytes
//! ServerHandshake   pid:u32 mechs:u32                                8 bytes
//! NewRequest        type:u8 protocol:u8 pad[2] mech:u32 id:u32      12 bytes
//! ContinueRequest   type:u8 pad[3] id:u32 data_size:u32            12 bytes + data
//! Reply             id:u32 result:u8 pad[3] data_size:u32          12 bytes + data
//! ```

use bytes::{Buf, BufMut, BytesMut};

use super::error::WireError;
use super::mechanism::{AuthMech, AuthProtocol};

// Request types
pub const REQUEST_NEW: u8 = 1;
pub const REQUEST_CONTINUE: u8 = 2;

// Reply results
pub const RESULT_CONTINUE: u8 = 1;
pub const RESULT_OK: u8 = 2;
pub const RESULT_FAIL: u8 = 3;
pub const RESULT_INTERNAL_ERROR: u8 = 4;

/// Maximum size of buffered input from one worker. 50kB should be more than enough.
pub const MAX_INBUF_SIZE: usize = 1024 * 50;

/// Maximum payload of a single continuation request.
pub const MAX_REQUEST_DATA_SIZE: usize = 4096;

/// Output buffer size: room for exactly one full continuation.
pub const MAX_OUTBUF_SIZE: usize = ContinueRequest::SIZE + MAX_REQUEST_DATA_SIZE;

fn check_len(src: &[u8], expected: usize) -> Result<(), WireError> {
    if src.len() < expected {
        return Err(WireError::Truncated {
            size: src.len(),
            expected,
        });
    }
    Ok(())
}

/// First record on every connection, sent by us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientHandshake {
    pub pid: u32,
}

impl ClientHandshake {
    pub const SIZE: usize = 4;

    pub fn encode(&self, out: &mut BytesMut) {
        out.put_u32_ne(self.pid);
    }

    pub fn decode(mut src: &[u8]) -> Result<Self, WireError> {
        check_len(src, Self::SIZE)?;
        Ok(Self {
            pid: src.get_u32_ne(),
        })
    }
}

/// The worker's answer to our handshake: its PID and the mechanisms it serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerHandshake {
    pub pid: u32,
    pub mechs: AuthMech,
}

impl ServerHandshake {
    pub const SIZE: usize = 8;

    pub fn encode(&self, out: &mut BytesMut) {
        out.put_u32_ne(self.pid);
        out.put_u32_ne(self.mechs.bits());
    }

    /// Unknown mechanism bits are dropped.
    pub fn decode(mut src: &[u8]) -> Result<Self, WireError> {
        check_len(src, Self::SIZE)?;
        let pid = src.get_u32_ne();
        let mechs = AuthMech::from_bits_truncate(src.get_u32_ne());
        Ok(Self { pid, mechs })
    }
}

/// Starts a new authentication session on the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewRequest {
    pub protocol: AuthProtocol,
    pub mech: AuthMech,
    pub id: u32,
}

impl NewRequest {
    pub const SIZE: usize = 12;

    pub fn encode(&self, out: &mut BytesMut) {
        out.put_u8(REQUEST_NEW);
        out.put_u8(self.protocol.code());
        out.put_bytes(0, 2);
        out.put_u32_ne(self.mech.bits());
        out.put_u32_ne(self.id);
    }

    pub fn decode(mut src: &[u8]) -> Result<Self, WireError> {
        check_len(src, Self::SIZE)?;
        let kind = src.get_u8();
        if kind != REQUEST_NEW {
            return Err(WireError::UnexpectedType(kind));
        }
        let protocol_code = src.get_u8();
        let protocol =
            AuthProtocol::from_code(protocol_code).ok_or(WireError::UnexpectedType(protocol_code))?;
        src.advance(2);
        let mech = AuthMech::from_bits_truncate(src.get_u32_ne());
        let id = src.get_u32_ne();
        Ok(Self { protocol, mech, id })
    }
}

/// Header of a continuation; `data_size` bytes of payload follow it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContinueRequest {
    pub id: u32,
    pub data_size: u32,
}

impl ContinueRequest {
    pub const SIZE: usize = 12;

    pub fn encode(&self, out: &mut BytesMut) {
        out.put_u8(REQUEST_CONTINUE);
        out.put_bytes(0, 3);
        out.put_u32_ne(self.id);
        out.put_u32_ne(self.data_size);
    }

    pub fn decode(mut src: &[u8]) -> Result<Self, WireError> {
        check_len(src, Self::SIZE)?;
        let kind = src.get_u8();
        if kind != REQUEST_CONTINUE {
            return Err(WireError::UnexpectedType(kind));
        }
        src.advance(3);
        let id = src.get_u32_ne();
        let data_size = src.get_u32_ne();
        Ok(Self { id, data_size })
    }
}

/// Outcome carried by a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplyResult {
    /// More round trips follow; the payload is the next challenge.
    Continue,
    Ok,
    Fail,
    InternalError,
}

impl ReplyResult {
    pub fn code(&self) -> u8 {
        match self {
            ReplyResult::Continue => RESULT_CONTINUE,
            ReplyResult::Ok => RESULT_OK,
            ReplyResult::Fail => RESULT_FAIL,
            ReplyResult::InternalError => RESULT_INTERNAL_ERROR,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            RESULT_CONTINUE => Some(ReplyResult::Continue),
            RESULT_OK => Some(ReplyResult::Ok),
            RESULT_FAIL => Some(ReplyResult::Fail),
            RESULT_INTERNAL_ERROR => Some(ReplyResult::InternalError),
            _ => None,
        }
    }

    /// Anything but Continue ends the session.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReplyResult::Continue)
    }
}

/// Header of a worker reply; `data_size` bytes of payload follow it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    pub id: u32,
    pub result: ReplyResult,
    pub data_size: u32,
}

impl Reply {
    pub const SIZE: usize = 12;

    pub fn encode(&self, out: &mut BytesMut) {
        out.put_u32_ne(self.id);
        out.put_u8(self.result.code());
        out.put_bytes(0, 3);
        out.put_u32_ne(self.data_size);
    }

    pub fn decode(mut src: &[u8]) -> Result<Self, WireError> {
        check_len(src, Self::SIZE)?;
        let id = src.get_u32_ne();
        let code = src.get_u8();
        let result = ReplyResult::from_code(code).ok_or(WireError::UnknownResult(code))?;
        src.advance(3);
        let data_size = src.get_u32_ne();
        Ok(Self {
            id,
            result,
            data_size,
        })
    }
}
