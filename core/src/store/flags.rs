/*
 * flags.rs
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

//! System message flags.

use bitflags::bitflags;

bitflags! {
    /// IMAP system flags as stored in the index (one byte per record).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MailFlags: u8 {
        const ANSWERED = 0x01;
        const FLAGGED = 0x02;
        const DELETED = 0x04;
        const SEEN = 0x08;
        const DRAFT = 0x10;
        /// Session-only; never written to a maildir filename.
        const RECENT = 0x20;
    }
}

/// How a flag update combines with the current flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyType {
    Replace,
    Add,
    Remove,
}

impl MailFlags {
    pub fn modify(self, modify: ModifyType, flags: MailFlags) -> MailFlags {
        match modify {
            ModifyType::Replace => flags,
            ModifyType::Add => self | flags,
            ModifyType::Remove => self - flags,
        }
    }
}
