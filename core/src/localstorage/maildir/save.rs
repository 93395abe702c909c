/*
 * save.rs
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

//! Two-phase save into a maildir.
//!
//! Each message is written to tmp/ and gets an index append. Nothing is
//! visible to other readers until [`MaildirSaveContext::commit`] links the
//! files into new/ or cur/ and gives them UIDs. Files that have no flags other
//! than RECENT go to new/; anything with flags goes straight to cur/, since
//! files in new/ cannot carry flags.

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use tracing::{debug, error, warn};

use super::filename::MaildirFilename;
use super::line_endings::LineEndings;
use super::uidlist::{UidList, UidListRecFlags};
use super::Maildir;
use crate::localstorage::index::IndexTransaction;
use crate::store::{MailFlags, StorageError};

const COPY_BUFFER_SIZE: usize = 8192;

struct StagedFile {
    basename: String,
    /// Name under cur/, or `None` for new/.
    dest: Option<String>,
}

/// Files written to tmp/ but not yet committed. Whatever is still listed when
/// this is dropped gets unlinked.
struct StagedFiles {
    tmp_dir: PathBuf,
    files: Vec<StagedFile>,
}

impl Drop for StagedFiles {
    fn drop(&mut self) {
        for mf in self.files.drain(..) {
            let _ = fs::remove_file(self.tmp_dir.join(&mf.basename));
        }
    }
}

struct CurrentSave<'a> {
    output: BufWriter<File>,
    input: Box<dyn Read + 'a>,
    converter: LineEndings,
    received_date: Option<DateTime<Utc>>,
    seq: u32,
    output_error: Option<io::Error>,
}

pub struct MaildirSaveContext<'a, 'i> {
    mailbox: &'a mut Maildir,
    trans: IndexTransaction<'i>,
    tmp_dir: PathBuf,
    new_dir: PathBuf,
    cur_dir: PathBuf,
    save_crlf: bool,
    staged: StagedFiles,
    current: Option<CurrentSave<'a>>,
    failed: bool,
}

impl<'a, 'i> MaildirSaveContext<'a, 'i> {
    pub fn new(mailbox: &'a mut Maildir, trans: IndexTransaction<'i>) -> Self {
        let tmp_dir = mailbox.tmp_dir().to_path_buf();
        Self {
            new_dir: mailbox.new_dir().to_path_buf(),
            cur_dir: mailbox.cur_dir().to_path_buf(),
            save_crlf: mailbox.save_crlf(),
            staged: StagedFiles {
                tmp_dir: tmp_dir.clone(),
                files: Vec::new(),
            },
            tmp_dir,
            mailbox,
            trans,
            current: None,
            failed: false,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Number of messages staged for commit.
    pub fn staged_count(&self) -> usize {
        self.staged.files.len()
    }

    /// Start saving a message read from `input`. Returns the sequence its index
    /// record will have.
    pub fn save_init<R>(
        &mut self,
        flags: MailFlags,
        received_date: Option<DateTime<Utc>>,
        input: R,
    ) -> Result<u32, StorageError>
    where
        R: Read + 'a,
    {
        if self.current.is_some() {
            warn!("{}: previous save not finished, cancelling it", self.mailbox.path().display());
            self.save_cancel();
        }

        let (file, basename) = match self.mailbox.create_tmp() {
            Ok(created) => created,
            Err(e) => {
                self.failed = true;
                return Err(e);
            }
        };

        let mut mail_flags = flags - MailFlags::RECENT;
        if self.mailbox.keep_recent() {
            mail_flags |= MailFlags::RECENT;
        }
        let dest = if mail_flags == MailFlags::RECENT {
            None
        } else {
            Some(
                MaildirFilename {
                    base: basename.clone(),
                    flags: mail_flags,
                }
                .to_string(),
            )
        };
        self.staged.files.push(StagedFile { basename, dest });

        let seq = self.trans.append(mail_flags);
        self.current = Some(CurrentSave {
            output: BufWriter::new(file),
            input: Box::new(input),
            converter: LineEndings::new(self.save_crlf),
            received_date,
            seq,
            output_error: None,
        });
        self.failed = false;
        Ok(seq)
    }

    /// Copy the message body into its tmp file.
    pub fn save_continue(&mut self) -> Result<(), StorageError> {
        if self.failed {
            return Err(StorageError::SaveFailed);
        }
        let Some(cur) = self.current.as_mut() else {
            return Err(StorageError::SaveFailed);
        };
        let mut buf = [0u8; COPY_BUFFER_SIZE];
        loop {
            let n = match cur.input.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("reading message input failed: {}", e);
                    self.failed = true;
                    return Err(StorageError::SaveFailed);
                }
            };
            let output = &mut cur.output;
            let mut write_err = None;
            cur.converter.process_chunk(&buf[..n], |s| {
                if write_err.is_none() {
                    if let Err(e) = output.write_all(s) {
                        write_err = Some(e);
                    }
                }
            });
            if let Some(e) = write_err {
                cur.output_error = Some(e);
                self.failed = true;
                return Err(StorageError::SaveFailed);
            }
        }
        Ok(())
    }

    /// Complete the current message: set its mtime to the received date,
    /// fsync and close it. On failure the tmp file is deleted and the message
    /// dropped from the transaction. Returns the message's sequence.
    pub fn save_finish(&mut self) -> Result<u32, StorageError> {
        let Some(mut cur) = self.current.take() else {
            // tmp file creation failed
            return Err(StorageError::SaveFailed);
        };
        let path = match self.staged.files.last() {
            Some(mf) => self.tmp_dir.join(&mf.basename),
            None => return Err(StorageError::SaveFailed),
        };
        let mut critical = None;

        if cur.output_error.is_none() {
            let output = &mut cur.output;
            let mut write_err = None;
            cur.converter.finish(|s| {
                if write_err.is_none() {
                    if let Err(e) = output.write_all(s) {
                        write_err = Some(e);
                    }
                }
            });
            if let Some(e) = write_err.or_else(|| cur.output.flush().err()) {
                cur.output_error = Some(e);
                self.failed = true;
            }
        }

        if let Some(date) = cur.received_date {
            if let Err(e) = cur.output.get_ref().set_modified(SystemTime::from(date)) {
                self.failed = true;
                critical.get_or_insert(StorageError::io(format!("utime({})", path.display()), e));
            }
        }

        if let Err(e) = cur.output.get_ref().sync_all() {
            self.failed = true;
            critical.get_or_insert(StorageError::io(format!("fsync({})", path.display()), e));
        }
        let seq = cur.seq;
        let output_error = cur.output_error.take();
        drop(cur);

        if !self.failed {
            return Ok(seq);
        }

        unlink_logged(&path);
        self.staged.files.pop();
        self.trans.cancel_last_append();
        Err(match (output_error, critical) {
            (Some(e), _) => StorageError::io(format!("write({})", self.mailbox.path().display()), e),
            (None, Some(err)) => err,
            (None, None) => StorageError::SaveFailed,
        })
    }

    /// Abandon the current message.
    pub fn save_cancel(&mut self) {
        self.failed = true;
        let _ = self.save_finish();
    }

    /// Move every staged file into new/ or cur/, give them UIDs and commit the
    /// index transaction. On failure nothing staged is left behind.
    pub fn commit(mut self) -> Result<(), StorageError> {
        if self.current.is_some() {
            warn!("{}: committing with an unfinished save", self.mailbox.path().display());
            self.save_cancel();
        }
        let Self {
            mailbox,
            mut trans,
            tmp_dir,
            new_dir,
            cur_dir,
            mut staged,
            ..
        } = self;
        let uidlist = mailbox.uidlist_mut();

        // On early return the lock and `staged` clean up after themselves.
        let lock = uidlist.lock()?;

        let first_uid = uidlist.next_uid().max(trans.index().header().next_uid);
        uidlist.bump_next_uid(first_uid);
        let last_uid = trans.append_assign_uids(first_uid)?;

        let flags = UidListRecFlags::NEW_DIR | UidListRecFlags::RECENT;
        let mut moved: Vec<PathBuf> = Vec::with_capacity(staged.files.len());
        for mf in &staged.files {
            let tmp_path = tmp_dir.join(&mf.basename);
            let dest_path = match &mf.dest {
                Some(dest) => cur_dir.join(dest),
                None => new_dir.join(&mf.basename),
            };
            if let Err(e) = move_file(&tmp_path, &dest_path) {
                abort_commit(uidlist, &moved);
                return Err(e);
            }
            moved.push(dest_path);
            let fname = mf.dest.as_deref().unwrap_or(&mf.basename);
            uidlist.register(&lock, fname, flags);
        }

        if let Err(e) = uidlist.save(&lock) {
            abort_commit(uidlist, &moved);
            return Err(e);
        }
        if uidlist.next_uid() != last_uid {
            error!(
                "BUG: uidlist next UID {} after commit, expected {}",
                uidlist.next_uid(),
                last_uid
            );
        }
        staged.files.clear();
        drop(lock);

        trans.commit()?;
        Ok(())
    }

    /// Discard everything staged in this transaction.
    pub fn rollback(mut self) {
        if self.current.is_some() {
            self.save_cancel();
        }
        // dropping `staged` unlinks the tmp files, dropping `trans` discards the appends
    }
}

/// Link `tmp_path` to `dest_path`, then unlink `tmp_path` whatever happened.
fn move_file(tmp_path: &Path, dest_path: &Path) -> Result<(), StorageError> {
    let ret = fs::hard_link(tmp_path, dest_path).map_err(|e| {
        StorageError::io(
            format!("link({}, {})", tmp_path.display(), dest_path.display()),
            e,
        )
    });
    unlink_logged(tmp_path);
    ret
}

/// Unlink the files already moved and reload the UID list to forget them.
fn abort_commit(uidlist: &mut UidList, moved: &[PathBuf]) {
    for path in moved {
        let _ = fs::remove_file(path);
    }
    if let Err(e) = uidlist.load() {
        error!("reloading uidlist after failed commit: {}", e);
    }
}

fn unlink_logged(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            error!("unlink({}) failed: {}", path.display(), e);
        }
    }
}
