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

//! Message index for one mailbox: an array of records ordered by UID, with
//! message sequence numbers being 1-based positions in the array.
//!
//! Locking uses flock(2) on a companion `.lock` file, since every change
//! writes a new image to `.tmp` and renames it over the index. Reads need at
//! least a shared lock, modifications an exclusive one. Taking a lock rereads
//! the file.

mod format;
mod transaction;

pub use format::{IndexHeader, IndexRecord};
pub use transaction::IndexTransaction;

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use bytes::BytesMut;
use tracing::debug;

use crate::store::{MailFlags, ModifyType};
use format::{HEADER_SIZE, RECORD_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockType {
    Unlocked,
    Shared,
    Exclusive,
}

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("corrupted index file {path}: {reason}")]
    Corrupted { path: PathBuf, reason: String },

    #[error("index operation needs a {required:?} lock, have {held:?}")]
    Lock { required: LockType, held: LockType },

    #[error("invalid message sequence {0}")]
    InvalidSequence(u32),

    #[error("invalid message sequence range {first}..{last}")]
    InvalidRange { first: u32, last: u32 },

    #[error("invalid UID range {first}..{last}")]
    InvalidUidRange { first: u32, last: u32 },

    #[error("UID {uid} is lower than next UID {next_uid}")]
    UidNotIncreasing { uid: u32, next_uid: u32 },

    #[error("no UIDs left after {last_uid}")]
    UidsExhausted { last_uid: u32 },

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub struct MailIndex {
    path: PathBuf,
    lock_file: File,
    header: IndexHeader,
    records: Vec<IndexRecord>,
    lock_type: LockType,
}

impl std::fmt::Debug for MailIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailIndex")
            .field("path", &self.path)
            .field("header", &self.header)
            .field("lock_type", &self.lock_type)
            .finish()
    }
}

impl MailIndex {
    /// Create a new, empty index. Fails if `path` exists.
    pub fn create(path: &Path) -> Result<Self, IndexError> {
        OpenOptions::new().write(true).create_new(true).open(path)?;
        let mut index = Self {
            path: path.to_path_buf(),
            lock_file: open_lock_file(path)?,
            header: IndexHeader::default(),
            records: Vec::new(),
            lock_type: LockType::Unlocked,
        };
        index.replace(IndexHeader::default(), Vec::new())?;
        Ok(index)
    }

    pub fn open(path: &Path) -> Result<Self, IndexError> {
        let mut index = Self {
            path: path.to_path_buf(),
            lock_file: open_lock_file(path)?,
            header: IndexHeader::default(),
            records: Vec::new(),
            lock_type: LockType::Unlocked,
        };
        index.reload()?;
        Ok(index)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &IndexHeader {
        &self.header
    }

    pub fn messages_count(&self) -> u32 {
        self.header.messages_count
    }

    pub fn lock_type(&self) -> LockType {
        self.lock_type
    }

    fn corrupted(&self, reason: impl Into<String>) -> IndexError {
        IndexError::Corrupted {
            path: self.path.clone(),
            reason: reason.into(),
        }
    }

    fn reload(&mut self) -> Result<(), IndexError> {
        let data = fs::read(&self.path)?;
        let header = IndexHeader::decode(&data).map_err(|reason| self.corrupted(reason))?;
        let count = header.messages_count as usize;
        let expected = IndexHeader::expected_file_size(count);
        if header.used_file_size != expected || (data.len() as u64) < expected {
            return Err(self.corrupted(format!(
                "{} messages need {} bytes, header says {}, file has {}",
                count,
                expected,
                header.used_file_size,
                data.len()
            )));
        }
        let records: Vec<IndexRecord> = data[HEADER_SIZE..expected as usize]
            .chunks_exact(RECORD_SIZE)
            .map(IndexRecord::decode)
            .collect();
        if records.windows(2).any(|w| w[0].uid >= w[1].uid) {
            return Err(self.corrupted("UIDs are not strictly increasing"));
        }
        if let Some(last) = records.last() {
            if last.uid >= header.next_uid {
                return Err(self.corrupted("next_uid is not above the last UID"));
            }
        }
        self.header = header;
        self.records = records;
        Ok(())
    }

    /// Change the lock held on the index file. Acquiring a lock from the
    /// unlocked state rereads the file.
    pub fn set_lock(&mut self, lock_type: LockType) -> Result<(), IndexError> {
        if lock_type == self.lock_type {
            return Ok(());
        }
        let op = match lock_type {
            LockType::Unlocked => libc::LOCK_UN,
            LockType::Shared => libc::LOCK_SH,
            LockType::Exclusive => libc::LOCK_EX,
        };
        // SAFETY: the descriptor is owned by self.lock_file and open.
        if unsafe { libc::flock(self.lock_file.as_raw_fd(), op) } < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let was = std::mem::replace(&mut self.lock_type, lock_type);
        if was == LockType::Unlocked {
            if let Err(e) = self.reload() {
                let _ = self.set_lock(LockType::Unlocked);
                return Err(e);
            }
        }
        Ok(())
    }

    fn require_lock(&self, required: LockType) -> Result<(), IndexError> {
        if self.lock_type < required {
            return Err(IndexError::Lock {
                required,
                held: self.lock_type,
            });
        }
        Ok(())
    }

    /// Record at 1-based sequence `seq`, `None` past the last message.
    pub fn lookup(&self, seq: u32) -> Result<Option<IndexRecord>, IndexError> {
        self.require_lock(LockType::Shared)?;
        if seq == 0 {
            return Err(IndexError::InvalidSequence(seq));
        }
        Ok(self.records.get(seq as usize - 1).copied())
    }

    /// Record following sequence `seq`, `None` at the end.
    pub fn next(&self, seq: u32) -> Result<Option<IndexRecord>, IndexError> {
        self.require_lock(LockType::Shared)?;
        if seq == 0 {
            return Err(IndexError::InvalidSequence(seq));
        }
        Ok(self.records.get(seq as usize).copied())
    }

    /// First record whose UID lies in `first..=last`, with its sequence.
    pub fn lookup_uid_range(
        &self,
        first: u32,
        last: u32,
    ) -> Result<Option<(u32, IndexRecord)>, IndexError> {
        self.require_lock(LockType::Shared)?;
        if first == 0 || first > last {
            return Err(IndexError::InvalidUidRange { first, last });
        }
        let idx = self.records.partition_point(|rec| rec.uid < first);
        Ok(self
            .records
            .get(idx)
            .filter(|rec| rec.uid <= last)
            .map(|rec| (idx as u32 + 1, *rec)))
    }

    /// Sequence of the message with `uid`, if present.
    pub fn lookup_uid(&self, uid: u32) -> Result<Option<u32>, IndexError> {
        if uid == 0 {
            return Err(IndexError::InvalidUidRange { first: 0, last: 0 });
        }
        Ok(self.lookup_uid_range(uid, uid)?.map(|(seq, _)| seq))
    }

    fn mark_flag_changes(header: &mut IndexHeader, old: MailFlags, new: MailFlags) {
        if old.contains(MailFlags::SEEN) != new.contains(MailFlags::SEEN) {
            if new.contains(MailFlags::SEEN) {
                header.seen_messages_count += 1;
            } else {
                header.seen_messages_count = header.seen_messages_count.saturating_sub(1);
            }
        }
        if old.contains(MailFlags::DELETED) != new.contains(MailFlags::DELETED) {
            if new.contains(MailFlags::DELETED) {
                header.deleted_messages_count += 1;
            } else {
                header.deleted_messages_count = header.deleted_messages_count.saturating_sub(1);
            }
        }
    }

    /// Remove messages `first_seq..=last_seq`, compacting the records that
    /// follow.
    pub fn expunge_record_range(&mut self, first_seq: u32, last_seq: u32) -> Result<(), IndexError> {
        self.require_lock(LockType::Exclusive)?;
        if first_seq == 0 || first_seq > last_seq || last_seq > self.header.messages_count {
            return Err(IndexError::InvalidRange {
                first: first_seq,
                last: last_seq,
            });
        }
        let range = first_seq as usize - 1..last_seq as usize;
        let mut header = self.header;
        for rec in &self.records[range.clone()] {
            Self::mark_flag_changes(&mut header, rec.msg_flags, MailFlags::empty());
        }
        let mut records = self.records.clone();
        records.drain(range);
        self.replace(header, records)?;
        debug!(
            "index {}: expunged {} records at {}",
            self.path.display(),
            last_seq - first_seq + 1,
            first_seq
        );
        Ok(())
    }

    pub fn update_flags(
        &mut self,
        seq: u32,
        modify: ModifyType,
        flags: MailFlags,
    ) -> Result<(), IndexError> {
        self.require_lock(LockType::Exclusive)?;
        if seq == 0 || seq > self.header.messages_count {
            return Err(IndexError::InvalidSequence(seq));
        }
        let idx = seq as usize - 1;
        let old = self.records[idx].msg_flags;
        let new = old.modify(modify, flags);
        if old == new {
            return Ok(());
        }
        let mut header = self.header;
        Self::mark_flag_changes(&mut header, old, new);
        let mut records = self.records.clone();
        records[idx].msg_flags = new;
        self.replace(header, records)
    }

    pub fn begin_transaction(&mut self) -> IndexTransaction<'_> {
        IndexTransaction::new(self)
    }

    fn append_records(&mut self, new: &[IndexRecord]) -> Result<(), IndexError> {
        self.require_lock(LockType::Exclusive)?;
        let mut header = self.header;
        let mut records = self.records.clone();
        for rec in new {
            if rec.uid < header.next_uid {
                return Err(IndexError::UidNotIncreasing {
                    uid: rec.uid,
                    next_uid: header.next_uid,
                });
            }
            header.next_uid = rec
                .uid
                .checked_add(1)
                .ok_or(IndexError::UidsExhausted { last_uid: rec.uid })?;
            Self::mark_flag_changes(&mut header, MailFlags::empty(), rec.msg_flags);
            records.push(*rec);
        }
        self.replace(header, records)
    }

    /// Write a complete new image and rename it over the index. The in-memory
    /// state changes only once the rename has succeeded.
    fn replace(
        &mut self,
        mut header: IndexHeader,
        records: Vec<IndexRecord>,
    ) -> Result<(), IndexError> {
        header.messages_count = records.len() as u32;
        header.used_file_size = IndexHeader::expected_file_size(records.len());
        let mut buf = BytesMut::with_capacity(header.used_file_size as usize);
        header.encode(&mut buf);
        for rec in &records {
            rec.encode(&mut buf);
        }

        let tmp = with_suffix(&self.path, ".tmp");
        let write = |buf: &[u8]| -> io::Result<()> {
            let mut f = File::create(&tmp)?;
            f.write_all(buf)?;
            f.sync_all()
        };
        if let Err(e) = write(&buf) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        fs::rename(&tmp, &self.path)?;

        self.header = header;
        self.records = records;
        Ok(())
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

fn open_lock_file(index_path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(with_suffix(index_path, ".lock"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn index_with(uids: &[u32], flags: MailFlags) -> (tempfile::TempDir, MailIndex) {
        let dir = tempfile::tempdir().unwrap();
        let mut index = MailIndex::create(&dir.path().join("index")).unwrap();
        index.set_lock(LockType::Exclusive).unwrap();
        let records: Vec<IndexRecord> = uids
            .iter()
            .map(|&uid| IndexRecord {
                uid,
                msg_flags: flags,
            })
            .collect();
        index.append_records(&records).unwrap();
        (dir, index)
    }

    #[test]
    fn lookups_need_a_lock() {
        let (_dir, mut index) = index_with(&[1, 2], MailFlags::empty());
        index.set_lock(LockType::Unlocked).unwrap();
        assert!(matches!(
            index.lookup(1),
            Err(IndexError::Lock {
                required: LockType::Shared,
                held: LockType::Unlocked
            })
        ));
        index.set_lock(LockType::Shared).unwrap();
        assert_eq!(index.lookup(2).unwrap().unwrap().uid, 2);
        assert!(matches!(
            index.expunge_record_range(1, 1),
            Err(IndexError::Lock { .. })
        ));
    }

    #[test]
    fn lookup_and_next() {
        let (_dir, index) = index_with(&[3, 5, 9], MailFlags::empty());
        assert_eq!(index.lookup(1).unwrap().unwrap().uid, 3);
        assert_eq!(index.lookup(4).unwrap(), None);
        assert!(matches!(index.lookup(0), Err(IndexError::InvalidSequence(0))));
        assert_eq!(index.next(1).unwrap().unwrap().uid, 5);
        assert_eq!(index.next(3).unwrap(), None);
    }

    #[test]
    fn uid_range_falls_through_to_next_record() {
        let (_dir, index) = index_with(&[3, 5, 9], MailFlags::empty());
        assert_eq!(index.lookup_uid_range(5, 5).unwrap().map(|(s, _)| s), Some(2));
        assert_eq!(index.lookup_uid_range(4, 8).unwrap().map(|(s, r)| (s, r.uid)), Some((2, 5)));
        assert_eq!(index.lookup_uid_range(6, 8).unwrap(), None);
        assert_eq!(index.lookup_uid_range(10, 20).unwrap(), None);
        assert_eq!(index.lookup_uid_range(1, 2).unwrap(), None);
        assert_eq!(index.lookup_uid(9).unwrap(), Some(3));
        assert!(matches!(
            index.lookup_uid_range(0, 3),
            Err(IndexError::InvalidUidRange { .. })
        ));
        assert!(matches!(
            index.lookup_uid_range(5, 4),
            Err(IndexError::InvalidUidRange { .. })
        ));
    }

    #[test]
    fn expunge_compacts_and_truncates() {
        let (dir, mut index) = index_with(&[1, 2, 3, 4, 5], MailFlags::SEEN);
        assert_eq!(index.header().seen_messages_count, 5);
        index.update_flags(2, ModifyType::Add, MailFlags::DELETED).unwrap();
        assert_eq!(index.header().deleted_messages_count, 1);

        index.expunge_record_range(2, 3).unwrap();
        assert_eq!(index.messages_count(), 3);
        assert_eq!(index.header().seen_messages_count, 3);
        assert_eq!(index.header().deleted_messages_count, 0);
        let uids: Vec<u32> = (1..=3).map(|s| index.lookup(s).unwrap().unwrap().uid).collect();
        assert_eq!(uids, vec![1, 4, 5]);

        let len = std::fs::metadata(dir.path().join("index")).unwrap().len();
        assert_eq!(len, (HEADER_SIZE + 3 * RECORD_SIZE) as u64);

        drop(index);
        let mut reopened = MailIndex::open(&dir.path().join("index")).unwrap();
        reopened.set_lock(LockType::Shared).unwrap();
        assert_eq!(reopened.messages_count(), 3);
        assert_eq!(reopened.lookup(2).unwrap().unwrap().uid, 4);
        assert_eq!(reopened.header().next_uid, 6);
    }

    #[test]
    fn expunge_range_is_validated() {
        let (_dir, mut index) = index_with(&[1, 2], MailFlags::empty());
        assert!(matches!(
            index.expunge_record_range(2, 3),
            Err(IndexError::InvalidRange { first: 2, last: 3 })
        ));
        assert!(matches!(
            index.expunge_record_range(2, 1),
            Err(IndexError::InvalidRange { .. })
        ));
    }

    #[test]
    fn flag_counters_follow_updates() {
        let (_dir, mut index) = index_with(&[1, 2], MailFlags::empty());
        index.update_flags(1, ModifyType::Replace, MailFlags::SEEN | MailFlags::DELETED).unwrap();
        index.update_flags(2, ModifyType::Add, MailFlags::SEEN).unwrap();
        assert_eq!(index.header().seen_messages_count, 2);
        assert_eq!(index.header().deleted_messages_count, 1);
        index.update_flags(1, ModifyType::Remove, MailFlags::SEEN).unwrap();
        assert_eq!(index.header().seen_messages_count, 1);
        assert_eq!(index.lookup(1).unwrap().unwrap().msg_flags, MailFlags::DELETED);
    }

    #[test]
    fn failed_rewrite_changes_nothing() {
        let (dir, mut index) = index_with(&[1, 2, 3], MailFlags::empty());
        let path = dir.path().join("index");
        let before = std::fs::read(&path).unwrap();
        // a directory in the way of the new image
        std::fs::create_dir(dir.path().join("index.tmp")).unwrap();

        assert!(matches!(index.expunge_record_range(1, 2), Err(IndexError::Io(_))));
        assert!(matches!(
            index.update_flags(3, ModifyType::Add, MailFlags::SEEN),
            Err(IndexError::Io(_))
        ));
        let mut trans = index.begin_transaction();
        trans.append(MailFlags::empty());
        assert!(matches!(trans.commit(), Err(IndexError::Io(_))));

        assert_eq!(index.messages_count(), 3);
        assert_eq!(index.header().seen_messages_count, 0);
        assert_eq!(index.header().next_uid, 4);
        assert_eq!(index.lookup(1).unwrap().unwrap().uid, 1);
        assert_eq!(index.lookup(3).unwrap().unwrap().msg_flags, MailFlags::empty());
        assert_eq!(std::fs::read(&path).unwrap(), before);

        std::fs::remove_dir(dir.path().join("index.tmp")).unwrap();
        index.expunge_record_range(1, 2).unwrap();
        assert_eq!(index.lookup(1).unwrap().unwrap().uid, 3);
        assert!(!dir.path().join("index.tmp").exists());
    }

    #[test]
    fn lock_survives_rewrites() {
        let (dir, mut index) = index_with(&[1], MailFlags::empty());
        let mut other = MailIndex::open(&dir.path().join("index")).unwrap();
        index.update_flags(1, ModifyType::Add, MailFlags::SEEN).unwrap();

        // the exclusive lock is still held after the rename
        let lock = File::open(dir.path().join("index.lock")).unwrap();
        // SAFETY: lock is open for the duration of the call.
        let rc = unsafe { libc::flock(lock.as_raw_fd(), libc::LOCK_SH | libc::LOCK_NB) };
        assert_eq!(rc, -1);

        index.set_lock(LockType::Unlocked).unwrap();
        other.set_lock(LockType::Shared).unwrap();
        assert_eq!(other.lookup(1).unwrap().unwrap().msg_flags, MailFlags::SEEN);
    }

    #[test]
    fn last_uid_cannot_be_appended() {
        let (_dir, mut index) = index_with(&[u32::MAX - 1], MailFlags::empty());
        assert_eq!(index.header().next_uid, u32::MAX);
        let last = IndexRecord {
            uid: u32::MAX,
            msg_flags: MailFlags::empty(),
        };
        assert!(matches!(
            index.append_records(&[last]),
            Err(IndexError::UidsExhausted { last_uid: u32::MAX })
        ));
        assert_eq!(index.messages_count(), 1);
    }

    #[test]
    fn garbage_file_is_corrupted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index");
        std::fs::write(&path, b"not an index at all, definitely not").unwrap();
        assert!(matches!(
            MailIndex::open(&path),
            Err(IndexError::Corrupted { .. })
        ));
    }

    proptest! {
        #[test]
        fn expunge_keeps_remaining_records_in_order(
            count in 1usize..40,
            a in 0usize..40,
            b in 0usize..40,
            seen in proptest::collection::vec(any::<bool>(), 40),
        ) {
            let first = (a % count) as u32 + 1;
            let last = ((b % count) as u32 + 1).max(first);
            let dir = tempfile::tempdir().unwrap();
            let mut index = MailIndex::create(&dir.path().join("index")).unwrap();
            index.set_lock(LockType::Exclusive).unwrap();
            let records: Vec<IndexRecord> = (0..count)
                .map(|i| IndexRecord {
                    uid: i as u32 * 2 + 1,
                    msg_flags: if seen[i] { MailFlags::SEEN } else { MailFlags::empty() },
                })
                .collect();
            index.append_records(&records).unwrap();

            index.expunge_record_range(first, last).unwrap();

            let mut expected = records.clone();
            expected.drain(first as usize - 1..last as usize);
            let actual: Vec<IndexRecord> = (1..=index.messages_count())
                .map(|s| index.lookup(s).unwrap().unwrap())
                .collect();
            prop_assert_eq!(&actual, &expected);
            let seen_count = expected.iter().filter(|r| r.msg_flags.contains(MailFlags::SEEN)).count();
            prop_assert_eq!(index.header().seen_messages_count as usize, seen_count);
            let len = std::fs::metadata(dir.path().join("index")).unwrap().len();
            prop_assert_eq!(len, IndexHeader::expected_file_size(expected.len()));
        }
    }
}
