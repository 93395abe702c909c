/*
 * filename.rs
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

//! Maildir filenames: `<secs>.P<pid>Q<n>M<usecs>.<host>[:2,<flags>]`.
//! Flag letters are kept in ASCII order; RECENT has no letter.

use std::sync::atomic::{AtomicU32, Ordering};

use chrono::Utc;

use crate::store::MailFlags;

const INFO_SEPARATOR: &str = ":2,";

static DELIVERY_COUNTER: AtomicU32 = AtomicU32::new(0);

const FLAG_CHARS: [(char, MailFlags); 5] = [
    ('D', MailFlags::DRAFT),
    ('F', MailFlags::FLAGGED),
    ('R', MailFlags::ANSWERED),
    ('S', MailFlags::SEEN),
    ('T', MailFlags::DELETED),
];

/// A maildir filename split into its unique base and its flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaildirFilename {
    pub base: String,
    pub flags: MailFlags,
}

impl MaildirFilename {
    pub fn parse(filename: &str) -> Self {
        let (base, info) = match filename.find(INFO_SEPARATOR) {
            Some(i) => (&filename[..i], &filename[i + INFO_SEPARATOR.len()..]),
            None => (filename, ""),
        };
        let mut flags = MailFlags::empty();
        for c in info.chars() {
            if let Some((_, flag)) = FLAG_CHARS.iter().find(|(fc, _)| *fc == c) {
                flags |= *flag;
            }
        }
        Self {
            base: base.to_string(),
            flags,
        }
    }

    /// A fresh unique base name for delivery into tmp/.
    pub fn generate() -> Self {
        let now = Utc::now();
        let n = DELIVERY_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self {
            base: format!(
                "{}.P{}Q{}M{}.{}",
                now.timestamp(),
                std::process::id(),
                n,
                now.timestamp_subsec_micros(),
                hostname()
            ),
            flags: MailFlags::empty(),
        }
    }

    pub fn with_flags(&self, flags: MailFlags) -> Self {
        Self {
            base: self.base.clone(),
            flags,
        }
    }
}

impl std::fmt::Display for MaildirFilename {
    /// Always carries the info suffix, so it names a file in cur/.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.base)?;
        f.write_str(INFO_SEPARATOR)?;
        for (c, flag) in FLAG_CHARS {
            if self.flags.contains(flag) {
                write!(f, "{}", c)?;
            }
        }
        Ok(())
    }
}

/// The part of `filename` that stays the same when its flags change.
pub fn base_name(filename: &str) -> &str {
    match filename.find(INFO_SEPARATOR) {
        Some(i) => &filename[..i],
        None => filename,
    }
}

/// Host name with `/` and `:` escaped, since both are special in maildir names.
fn hostname() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: buf is writable for its full length and gethostname NUL-terminates
    // within that length on success.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    let name = if rc == 0 {
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        String::from_utf8_lossy(&buf[..end]).into_owned()
    } else {
        String::new()
    };
    if name.is_empty() {
        return "localhost".to_string();
    }
    name.replace('/', "\\057").replace(':', "\\072")
}
