/*
 * meli - mbox module.
 *
 * Copyright 2017 Manos Pitsidianakis
 *
 * This file is part of meli.
 *
 * meli is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * meli is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with meli. If not, see <http://www.gnu.org/licenses/>.
 */

//! Change detection.

use std::io::{BufRead, BufReader, Seek, SeekFrom};

use super::MboxMailbox;
use crate::{
    error::{Error, ErrorKind, Result},
    mailbox::{CheckStatus, MailboxSnapshot},
    utils::lock::{FileLockKind, FileLockOptions},
};

impl MboxMailbox {
    /// Compare the file with the last snapshot and bring the store up to
    /// date.
    ///
    /// Growth that starts with a message boundary exactly at the old end of
    /// the file is parsed incrementally. Any other change rebuilds the store
    /// with [`reopen`](Self::reopen). If that fails the mailbox is closed and
    /// an [`ErrorKind::Corrupted`] error is returned.
    pub(super) fn check_mailbox(&mut self) -> Result<CheckStatus> {
        if self.closed {
            return Err(self.closed_error());
        }
        let metadata = match std::fs::metadata(&self.path) {
            Ok(m) => m,
            Err(err) => {
                self.fast_close();
                return Err(Error::from(err)
                    .set_summary(format!("Could not stat {}", self.path.display()))
                    .set_kind(ErrorKind::Corrupted)
                    .set_related_path(&self.path));
            }
        };
        let current = MailboxSnapshot::from(&metadata);
        if current.mtime == self.snapshot.mtime && current.size == self.snapshot.size {
            return Ok(CheckStatus::Unchanged);
        }
        if current.size == self.snapshot.size {
            // Touched, but still the same length.
            log::trace!("{} was touched", self.path.display());
            self.snapshot.mtime = current.mtime;
            return Ok(CheckStatus::Unchanged);
        }

        let mut unlock = false;
        if current.size > self.snapshot.size {
            if self.lock.is_none() {
                if let Err(err) = self.lock_file(FileLockKind::Shared, FileLockOptions::once()) {
                    // Probably mail being delivered; pick it up next time.
                    log::debug!("{}", err);
                    return Ok(CheckStatus::Locked);
                }
                unlock = true;
            }
            let old_size = self.snapshot.size;
            if self.starts_message_at(old_size) {
                match self.parse_from(old_size) {
                    Ok(status) => log::debug!(
                        "new mail in {}: {:?}, {} messages",
                        self.path.display(),
                        status,
                        self.store.len()
                    ),
                    Err(err) => log::error!(
                        "could not parse new mail in {}: {}",
                        self.path.display(),
                        err
                    ),
                }
                if unlock {
                    self.unlock();
                }
                return Ok(CheckStatus::NewMail);
            }
        }

        log::debug!("{} was modified, reopening", self.path.display());
        match self.reopen() {
            Ok(status) => {
                log::trace!("reopened {}: {:?}", self.path.display(), status);
                if unlock {
                    self.unlock();
                }
                Ok(CheckStatus::Reopened)
            }
            Err(err) => {
                self.fast_close();
                Err(err
                    .set_summary(format!("Mailbox {} was corrupted", self.path.display()))
                    .set_kind(ErrorKind::Corrupted))
            }
        }
    }

    /// Whether a message boundary starts at `offset`.
    fn starts_message_at(&self, offset: u64) -> bool {
        let Ok(file) = self.file() else {
            return false;
        };
        let mut reader = BufReader::new(file);
        let mut line = Vec::with_capacity(64);
        match reader
            .seek(SeekFrom::Start(offset))
            .and_then(|_| reader.read_until(b'\n', &mut line))
        {
            Ok(n) if n > 0 => self.format.is_boundary(&line),
            Ok(_) => {
                log::debug!("no data at {} in {}", offset, self.path.display());
                false
            }
            Err(err) => {
                log::debug!("could not read {}: {}", self.path.display(), err);
                false
            }
        }
    }
}
