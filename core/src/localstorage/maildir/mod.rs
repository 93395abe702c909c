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

//! Maildir mailboxes (cur, new, tmp and `.uidlist`).
//!
//! Messages are written to tmp/ and only linked into new/ or cur/ when the
//! save transaction commits; see [`MaildirSaveContext`].

mod filename;
mod line_endings;
mod save;
mod uidlist;

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::LoginConfig;
use crate::store::StorageError;

pub use filename::{base_name, MaildirFilename};
pub use line_endings::LineEndings;
pub use save::MaildirSaveContext;
pub use uidlist::{UidList, UidListLock, UidListRecFlags, UidRecord, UIDLIST_FILE, UIDLIST_LOCK_FILE};

const TMP_DIR: &str = "tmp";
const NEW_DIR: &str = "new";
const CUR_DIR: &str = "cur";

const MAIL_CREATE_MODE: u32 = 0o600;
const TMP_CREATE_ATTEMPTS: usize = 10;

/// One maildir mailbox.
#[derive(Debug)]
pub struct Maildir {
    path: PathBuf,
    tmp_dir: PathBuf,
    new_dir: PathBuf,
    cur_dir: PathBuf,
    uidlist: UidList,
    save_crlf: bool,
    keep_recent: bool,
}

impl Maildir {
    fn at(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            tmp_dir: path.join(TMP_DIR),
            new_dir: path.join(NEW_DIR),
            cur_dir: path.join(CUR_DIR),
            uidlist: UidList::new(path),
            save_crlf: false,
            keep_recent: true,
        }
    }

    /// Create the mailbox directories if needed and open it.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let mut maildir = Self::at(path.as_ref());
        for dir in [&maildir.tmp_dir, &maildir.new_dir, &maildir.cur_dir] {
            fs::create_dir_all(dir)
                .map_err(|e| StorageError::io(format!("mkdir({})", dir.display()), e))?;
        }
        maildir.uidlist.load()?;
        Ok(maildir)
    }

    /// Open an existing mailbox; all three directories must exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let mut maildir = Self::at(path.as_ref());
        for dir in [&maildir.tmp_dir, &maildir.new_dir, &maildir.cur_dir] {
            let meta = fs::metadata(dir)
                .map_err(|e| StorageError::io(format!("stat({})", dir.display()), e))?;
            if !meta.is_dir() {
                return Err(StorageError::io(
                    format!("stat({})", dir.display()),
                    io::Error::new(io::ErrorKind::InvalidInput, "not a directory"),
                ));
            }
        }
        maildir.uidlist.load()?;
        Ok(maildir)
    }

    /// Take the line ending preference from the login configuration.
    pub fn configure(&mut self, config: &LoginConfig) {
        self.save_crlf = config.save_crlf;
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn tmp_dir(&self) -> &Path {
        &self.tmp_dir
    }

    pub fn new_dir(&self) -> &Path {
        &self.new_dir
    }

    pub fn cur_dir(&self) -> &Path {
        &self.cur_dir
    }

    pub fn uidlist(&self) -> &UidList {
        &self.uidlist
    }

    pub fn uidlist_mut(&mut self) -> &mut UidList {
        &mut self.uidlist
    }

    pub fn save_crlf(&self) -> bool {
        self.save_crlf
    }

    pub fn set_save_crlf(&mut self, crlf: bool) {
        self.save_crlf = crlf;
    }

    /// Whether new messages keep the RECENT flag (and so land in new/).
    pub fn keep_recent(&self) -> bool {
        self.keep_recent
    }

    pub fn set_keep_recent(&mut self, keep: bool) {
        self.keep_recent = keep;
    }

    /// Create a file under tmp/ with a fresh unique name. Returns the open
    /// file and its name.
    pub(crate) fn create_tmp(&self) -> Result<(File, String), StorageError> {
        let mut last_err = None;
        for _ in 0..TMP_CREATE_ATTEMPTS {
            let name = MaildirFilename::generate().base;
            let path = self.tmp_dir.join(&name);
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(MAIL_CREATE_MODE)
                .open(&path)
            {
                Ok(file) => {
                    debug!("created {}", path.display());
                    return Ok((file, name));
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => last_err = Some(e),
                Err(e) => {
                    return Err(StorageError::io(format!("open({})", path.display()), e));
                }
            }
        }
        let err = last_err
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::AlreadyExists, "name collision"));
        Err(StorageError::io(
            format!("open({}/...)", self.tmp_dir.display()),
            err,
        ))
    }
}
