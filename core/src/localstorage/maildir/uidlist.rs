/*
 * uidlist.rs
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

//! Maildir UID list (`.uidlist`): maps base filenames to persistent UIDs.
//!
//! ```text
//! # portcullis-uidlist v1
//! uidvalidity <n>
//! uidnext <n>
//! <uid> <flags> <filename>
//! ```
//!
//! Writers hold `.uidlist.lock`, created exclusively.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use indexmap::IndexMap;
use tracing::{debug, error};

use super::filename::base_name;
use crate::store::StorageError;

const HEADER: &str = "# portcullis-uidlist v1";
pub const UIDLIST_FILE: &str = ".uidlist";
pub const UIDLIST_LOCK_FILE: &str = ".uidlist.lock";

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct UidListRecFlags: u8 {
        /// File lives in new/.
        const NEW_DIR = 0x01;
        const RECENT = 0x02;
    }
}

impl UidListRecFlags {
    fn encode(self) -> String {
        let mut s = String::new();
        if self.contains(Self::NEW_DIR) {
            s.push('N');
        }
        if self.contains(Self::RECENT) {
            s.push('R');
        }
        if s.is_empty() {
            s.push('-');
        }
        s
    }

    fn decode(s: &str) -> Self {
        let mut flags = Self::empty();
        for c in s.chars() {
            match c {
                'N' => flags |= Self::NEW_DIR,
                'R' => flags |= Self::RECENT,
                _ => {}
            }
        }
        flags
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UidRecord {
    pub uid: u32,
    pub flags: UidListRecFlags,
    pub filename: String,
}

/// Held while `.uidlist.lock` exists; dropping it removes the lock file.
#[derive(Debug)]
pub struct UidListLock {
    path: PathBuf,
}

impl Drop for UidListLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                error!("unlink({}) failed: {}", self.path.display(), e);
            }
        }
    }
}

#[derive(Debug)]
pub struct UidList {
    path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
    uid_validity: u32,
    next_uid: u32,
    /// Keyed by base filename, in UID order.
    records: IndexMap<String, UidRecord>,
    dirty: bool,
}

impl UidList {
    pub fn new(maildir_path: &Path) -> Self {
        Self {
            path: maildir_path.join(UIDLIST_FILE),
            lock_path: maildir_path.join(UIDLIST_LOCK_FILE),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            uid_validity: 0,
            next_uid: 1,
            records: IndexMap::new(),
            dirty: false,
        }
    }

    pub fn set_lock_timeout(&mut self, timeout: Duration) {
        self.lock_timeout = timeout;
    }

    pub fn uid_validity(&self) -> u32 {
        self.uid_validity
    }

    pub fn next_uid(&self) -> u32 {
        self.next_uid
    }

    /// Raise the next UID; never lowers it.
    pub fn bump_next_uid(&mut self, uid: u32) {
        if uid > self.next_uid {
            self.next_uid = uid;
            self.dirty = true;
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &UidRecord> {
        self.records.values()
    }

    pub fn lookup(&self, filename: &str) -> Option<&UidRecord> {
        self.records.get(base_name(filename))
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn reset(&mut self) {
        self.records.clear();
        self.uid_validity = Utc::now().timestamp() as u32;
        self.next_uid = 1;
        self.dirty = true;
    }

    /// Load from disk, or start a new list if there is none.
    pub fn load(&mut self) -> Result<(), StorageError> {
        let f = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.reset();
                return Ok(());
            }
            Err(e) => {
                return Err(StorageError::io(format!("open({})", self.path.display()), e));
            }
        };
        let context = || format!("read({})", self.path.display());
        let mut lines = BufReader::new(f).lines();
        let first = lines
            .next()
            .transpose()
            .map_err(|e| StorageError::io(context(), e))?
            .unwrap_or_default();
        if first != HEADER {
            error!("{}: unrecognised header, rebuilding", self.path.display());
            self.reset();
            return Ok(());
        }

        let mut records = IndexMap::new();
        let mut uid_validity = 0;
        let mut next_uid = 1;
        for line in lines {
            let line = line.map_err(|e| StorageError::io(context(), e))?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(rest) = line.strip_prefix("uidvalidity ") {
                if let Ok(n) = rest.trim().parse() {
                    uid_validity = n;
                }
            } else if let Some(rest) = line.strip_prefix("uidnext ") {
                if let Ok(n) = rest.trim().parse() {
                    next_uid = n;
                }
            } else {
                let mut parts = line.splitn(3, ' ');
                let uid = parts.next().and_then(|s| s.parse::<u32>().ok());
                let (Some(uid), Some(flags), Some(filename)) = (uid, parts.next(), parts.next())
                else {
                    debug!("{}: skipping bad line {:?}", self.path.display(), line);
                    continue;
                };
                records.insert(
                    base_name(filename).to_string(),
                    UidRecord {
                        uid,
                        flags: UidListRecFlags::decode(flags),
                        filename: filename.to_string(),
                    },
                );
            }
        }
        self.records = records;
        self.uid_validity = uid_validity;
        self.next_uid = next_uid;
        self.dirty = false;
        Ok(())
    }

    /// Create the lock file, retrying until the lock timeout, then reload the
    /// list so `next_uid` is current.
    pub fn lock(&mut self) -> Result<UidListLock, StorageError> {
        let deadline = Instant::now() + self.lock_timeout;
        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.lock_path)
            {
                Ok(_) => break,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if Instant::now() >= deadline {
                        return Err(StorageError::LockTimeout(
                            self.lock_path.display().to_string(),
                        ));
                    }
                    thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(e) => {
                    return Err(StorageError::io(
                        format!("open({})", self.lock_path.display()),
                        e,
                    ));
                }
            }
        }
        let lock = UidListLock {
            path: self.lock_path.clone(),
        };
        self.load()?;
        Ok(lock)
    }

    /// Give `filename` the next UID. A file already in the list keeps its UID.
    /// Requires the lock.
    pub fn register(
        &mut self,
        _lock: &UidListLock,
        filename: &str,
        flags: UidListRecFlags,
    ) -> u32 {
        let base = base_name(filename);
        if let Some(rec) = self.records.get_mut(base) {
            rec.filename = filename.to_string();
            rec.flags = flags;
            self.dirty = true;
            return rec.uid;
        }
        let uid = self.next_uid;
        self.next_uid += 1;
        self.records.insert(
            base.to_string(),
            UidRecord {
                uid,
                flags,
                filename: filename.to_string(),
            },
        );
        self.dirty = true;
        uid
    }

    pub fn remove(&mut self, _lock: &UidListLock, filename: &str) -> Option<UidRecord> {
        let rec = self.records.shift_remove(base_name(filename));
        if rec.is_some() {
            self.dirty = true;
        }
        rec
    }

    /// Write the list atomically (temp file + rename). Requires the lock.
    pub fn save(&mut self, _lock: &UidListLock) -> Result<(), StorageError> {
        if !self.dirty {
            return Ok(());
        }
        let tmp = self.path.with_extension("tmp");
        let context = || format!("write({})", tmp.display());
        let f = File::create(&tmp).map_err(|e| StorageError::io(context(), e))?;
        let mut w = BufWriter::new(f);
        let write_all = |w: &mut BufWriter<File>| -> io::Result<()> {
            writeln!(w, "{}", HEADER)?;
            writeln!(w, "uidvalidity {}", self.uid_validity)?;
            writeln!(w, "uidnext {}", self.next_uid)?;
            for rec in self.records.values() {
                writeln!(w, "{} {} {}", rec.uid, rec.flags.encode(), rec.filename)?;
            }
            w.flush()?;
            w.get_ref().sync_all()
        };
        if let Err(e) = write_all(&mut w) {
            drop(w);
            let _ = fs::remove_file(&tmp);
            return Err(StorageError::io(context(), e));
        }
        drop(w);
        fs::rename(&tmp, &self.path).map_err(|e| {
            StorageError::io(
                format!("rename({}, {})", tmp.display(), self.path.display()),
                e,
            )
        })?;
        self.dirty = false;
        Ok(())
    }
}
