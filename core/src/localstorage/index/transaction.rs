/*
 * transaction.rs
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

//! Index append transactions. Nothing reaches the index until `commit`;
//! dropping an uncommitted transaction discards its appends.

use tracing::debug;

use super::{IndexError, IndexRecord, MailIndex};
use crate::store::MailFlags;

pub struct IndexTransaction<'a> {
    index: &'a mut MailIndex,
    /// Records with uid 0 have not been assigned one yet.
    pending: Vec<IndexRecord>,
    committed: bool,
}

impl<'a> IndexTransaction<'a> {
    pub(super) fn new(index: &'a mut MailIndex) -> Self {
        Self {
            index,
            pending: Vec::new(),
            committed: false,
        }
    }

    pub fn index(&self) -> &MailIndex {
        self.index
    }

    /// Queue a new message. Returns the sequence it will have once committed.
    pub fn append(&mut self, flags: MailFlags) -> u32 {
        self.pending.push(IndexRecord {
            uid: 0,
            msg_flags: flags,
        });
        self.index.messages_count() + self.pending.len() as u32
    }

    /// Drop the most recent append, e.g. when writing its message failed.
    pub fn cancel_last_append(&mut self) -> Option<IndexRecord> {
        self.pending.pop()
    }

    pub fn pending(&self) -> &[IndexRecord] {
        &self.pending
    }

    /// Give UIDs `first_uid, first_uid + 1, ...` to the queued messages that
    /// have none yet. Returns the UID after the last one assigned.
    pub fn append_assign_uids(&mut self, first_uid: u32) -> Result<u32, IndexError> {
        let next_uid = self.index.header().next_uid;
        let last_assigned = self.pending.iter().map(|r| r.uid).max().unwrap_or(0);
        if first_uid < next_uid || (last_assigned != 0 && first_uid <= last_assigned) {
            return Err(IndexError::UidNotIncreasing {
                uid: first_uid,
                next_uid: next_uid.max(last_assigned.saturating_add(1)),
            });
        }
        let unassigned = self.pending.iter().filter(|r| r.uid == 0).count() as u32;
        let end = first_uid
            .checked_add(unassigned)
            .ok_or(IndexError::UidsExhausted {
                last_uid: u32::MAX,
            })?;
        for (rec, uid) in self
            .pending
            .iter_mut()
            .filter(|r| r.uid == 0)
            .zip(first_uid..end)
        {
            rec.uid = uid;
        }
        Ok(end)
    }

    /// Write the queued messages to the index. Messages without a UID get the
    /// index's next UIDs.
    pub fn commit(mut self) -> Result<(), IndexError> {
        if self.pending.iter().any(|r| r.uid == 0) {
            let next_uid = self.index.header().next_uid;
            self.append_assign_uids(next_uid)?;
        }
        let pending = std::mem::take(&mut self.pending);
        self.index.append_records(&pending)?;
        self.committed = true;
        Ok(())
    }

    pub fn rollback(self) {}
}

impl Drop for IndexTransaction<'_> {
    fn drop(&mut self) {
        if !self.committed && !self.pending.is_empty() {
            debug!(
                "index {}: rolled back {} appends",
                self.index.path().display(),
                self.pending.len()
            );
        }
    }
}
