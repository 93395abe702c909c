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

//! Mail storage errors.

use std::io;

use crate::localstorage::index::IndexError;

/// Errors from saving into a mailbox. `NotEnoughSpace` is reported to the
/// client as is; everything else is a critical server-side failure.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Not enough disk space")]
    NotEnoughSpace,

    #[error("{context} failed: {source}")]
    Critical {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("timeout while waiting for lock on {0}")]
    LockTimeout(String),

    #[error("save failed")]
    SaveFailed,

    #[error(transparent)]
    Index(#[from] IndexError),
}

/// True for "disk full" and "quota exceeded".
pub fn is_no_space(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(code) if code == libc::ENOSPC || code == libc::EDQUOT)
}

impl StorageError {
    /// Classify an I/O failure of the operation described by `context`.
    pub fn io(context: impl Into<String>, err: io::Error) -> Self {
        if is_no_space(&err) {
            StorageError::NotEnoughSpace
        } else {
            StorageError::Critical {
                context: context.into(),
                source: err,
            }
        }
    }
}
