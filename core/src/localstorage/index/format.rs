/*
 * format.rs
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

//! On-disk layout of the message index, little endian:
//!
//! ```text
//! header  magic "PCIX" | version u32 | messages_count u32 | next_uid u32
//!         | seen_messages_count u32 | deleted_messages_count u32 | used_file_size u64
//! record  uid u32 | msg_flags u8 | pad[3]
//! ```

use bytes::{Buf, BufMut};

use crate::store::MailFlags;

pub const MAGIC: &[u8; 4] = b"PCIX";
pub const VERSION: u32 = 1;
pub const HEADER_SIZE: usize = 32;
pub const RECORD_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexHeader {
    pub messages_count: u32,
    pub next_uid: u32,
    pub seen_messages_count: u32,
    pub deleted_messages_count: u32,
    pub used_file_size: u64,
}

impl Default for IndexHeader {
    fn default() -> Self {
        Self {
            messages_count: 0,
            next_uid: 1,
            seen_messages_count: 0,
            deleted_messages_count: 0,
            used_file_size: HEADER_SIZE as u64,
        }
    }
}

impl IndexHeader {
    pub fn encode<B: BufMut>(&self, out: &mut B) {
        out.put_slice(MAGIC);
        out.put_u32_le(VERSION);
        out.put_u32_le(self.messages_count);
        out.put_u32_le(self.next_uid);
        out.put_u32_le(self.seen_messages_count);
        out.put_u32_le(self.deleted_messages_count);
        out.put_u64_le(self.used_file_size);
    }

    /// `Err` carries the reason the header was rejected.
    pub fn decode(mut src: &[u8]) -> Result<Self, String> {
        if src.len() < HEADER_SIZE {
            return Err(format!("header is {} bytes", src.len()));
        }
        if &src[..4] != MAGIC {
            return Err("bad magic".to_string());
        }
        src.advance(4);
        let version = src.get_u32_le();
        if version != VERSION {
            return Err(format!("unsupported version {}", version));
        }
        Ok(Self {
            messages_count: src.get_u32_le(),
            next_uid: src.get_u32_le(),
            seen_messages_count: src.get_u32_le(),
            deleted_messages_count: src.get_u32_le(),
            used_file_size: src.get_u64_le(),
        })
    }

    pub fn expected_file_size(messages_count: usize) -> u64 {
        (HEADER_SIZE + messages_count * RECORD_SIZE) as u64
    }
}

/// One message in the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexRecord {
    pub uid: u32,
    pub msg_flags: MailFlags,
}

impl IndexRecord {
    pub fn encode<B: BufMut>(&self, out: &mut B) {
        out.put_u32_le(self.uid);
        out.put_u8(self.msg_flags.bits());
        out.put_bytes(0, 3);
    }

    pub fn decode(mut src: &[u8]) -> Self {
        let uid = src.get_u32_le();
        let msg_flags = MailFlags::from_bits_truncate(src.get_u8());
        Self { uid, msg_flags }
    }
}
