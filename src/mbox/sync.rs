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

//! Writing changes back.
//!
//! Messages before the first deleted or modified one are left in place.
//! Everything after it is copied to a temporary file next to the mailbox,
//! which is then spliced over the original starting at that offset, and the
//! file is truncated to its new size. Until the splice succeeds the store is
//! restored from a ledger of the offsets it had before the call, so a failed
//! sync can be retried. If the splice itself fails the temporary file is kept
//! and its location reported.

use std::{
    fs::{File, Metadata, OpenOptions},
    io::{BufRead, BufReader, BufWriter, Seek, SeekFrom, Write},
    os::unix::fs::OpenOptionsExt,
    path::{Path, PathBuf},
    sync::Arc,
};

use super::{MboxFormat, MboxMailbox};
use crate::{
    error::{Error, ErrorKind, Result},
    mailbox::{CheckStatus, Flag, HeaderStore, Length, MessageRecord, Offset, SyncStatus},
    utils::{
        lock::{FileLockKind, FileLockOptions},
        process_tag,
    },
};

/// Writes a single message while a mailbox is rewritten.
///
/// `record` describes where the message lies in `src`. The copy starts with
/// the message's postmark or header (the MMDF separators are written by the
/// caller) and ends with the last body byte, without padding. If the body is
/// changed, `body_length` and `line_count` must be updated to match.
pub trait MessageCopier: Send + Sync + std::fmt::Debug {
    fn copy_message(
        &self,
        src: &File,
        format: MboxFormat,
        record: &mut MessageRecord,
        dest: &mut dyn Write,
    ) -> Result<()>;
}

/// Offsets of one message, as they were before a sync or as they will be
/// after it.
#[derive(Clone, Copy, Debug, Default)]
struct MUpdate {
    valid: bool,
    hdr: Offset,
    body: Offset,
    lines: u64,
    length: Option<Length>,
}

impl MUpdate {
    fn of(record: &MessageRecord) -> Self {
        Self {
            valid: true,
            hdr: record.offset,
            body: record.body_offset,
            lines: record.line_count,
            length: record.body_length,
        }
    }
}

/// Old and new offsets of the records from `first` onwards, for one sync.
#[derive(Debug, Default)]
struct Ledger {
    first: usize,
    old: Vec<MUpdate>,
    new: Vec<MUpdate>,
}

impl Ledger {
    /// Put back the offsets of every record that was touched.
    fn restore(&self, store: &mut HeaderStore) {
        for (i, old) in self.old.iter().enumerate() {
            if !old.valid {
                break;
            }
            if let Some(record) = store.get_mut(self.first + i) {
                record.offset = old.hdr;
                record.body_offset = old.body;
                record.line_count = old.lines;
                record.body_length = old.length;
            }
        }
    }
}

/// Tracks how many bytes went through.
struct CountingWriter<W: Write> {
    inner: W,
    written: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// A fully written temporary file, ready to be spliced in.
#[derive(Debug)]
struct Staged {
    tmp_path: PathBuf,
    /// Where the temporary file goes in the mailbox.
    offset: Offset,
    /// The mailbox's metadata before the splice, to restore its times.
    metadata: Metadata,
}

#[derive(Debug)]
enum Stage {
    Ready(Staged),
    External(CheckStatus),
}

fn remove_tmp(path: &Path) {
    if let Err(err) = std::fs::remove_file(path) {
        log::warn!("could not remove {}: {}", path.display(), err);
    }
}

impl MboxMailbox {
    pub(super) fn sync_mailbox(&mut self) -> Result<SyncStatus> {
        if self.closed {
            return Err(self.closed_error());
        }
        if self.readonly {
            return Err(Error::new(format!("Mailbox {} is read-only", self.path.display()))
                .set_kind(ErrorKind::ReadOnly));
        }
        if self.append {
            return Err(Error::new(format!(
                "Mailbox {} is open for appending only",
                self.path.display()
            ))
            .set_kind(ErrorKind::NotSupported));
        }

        // Read-write without truncating.
        match OpenOptions::new().read(true).write(true).open(&self.path) {
            Ok(file) => self.file = Some(file),
            Err(err) => {
                self.fast_close();
                return Err(Error::from(err)
                    .set_summary(format!(
                        "Fatal error! Could not reopen mailbox {}",
                        self.path.display()
                    ))
                    .set_related_path(&self.path));
            }
        }

        let mut ledger = Ledger::default();
        let staged = match self.stage(&mut ledger) {
            Ok(Stage::Ready(staged)) => staged,
            Ok(Stage::External(status)) => {
                log::debug!(
                    "{} changed on disk ({:?}), not writing",
                    self.path.display(),
                    status
                );
                return self.bail(&ledger, Ok(SyncStatus::ExternalChange(status)));
            }
            // The check closed the mailbox, there is nothing to restore.
            Err(err) if self.closed => return Err(err),
            Err(err) => return self.bail(&ledger, Err(err)),
        };

        let mut tmp = match File::open(&staged.tmp_path) {
            Ok(f) => f,
            Err(err) => {
                self.fast_close();
                return Err(Error::from(err)
                    .set_summary("Unable to reopen temporary copy of mailbox")
                    .set_related_path(&staged.tmp_path));
            }
        };
        let spliced = self.splice(&mut tmp, staged.offset);
        drop(tmp);
        self.unlock();
        // Closing the read-write handle; data was synced by `splice`.
        self.file = None;
        let new_size = match spliced {
            Ok(size) => size,
            Err(err) => {
                let saved = self.preserve(&staged.tmp_path);
                ledger.restore(&mut self.store);
                self.fast_close();
                log::error!(
                    "Write failed! Saved partial mailbox to {}: {}",
                    saved.display(),
                    err
                );
                return Err(Error::new(format!(
                    "Write failed! Saved partial mailbox to {}",
                    saved.display()
                ))
                .set_details(err.summary.to_string())
                .set_source(Some(Arc::new(err)))
                .set_kind(ErrorKind::DataPreserved)
                .set_related_path(saved));
            }
        };

        self.reset_atime(Some(&staged.metadata));

        match File::open(&self.path) {
            Ok(file) => self.file = Some(file),
            Err(err) => {
                remove_tmp(&staged.tmp_path);
                self.fast_close();
                return Err(Error::from(err)
                    .set_summary(format!(
                        "Fatal error! Could not reopen mailbox {}",
                        self.path.display()
                    ))
                    .set_related_path(&self.path));
            }
        }

        for (i, new) in ledger.new.iter().enumerate() {
            if !new.valid {
                continue;
            }
            if let Some(record) = self.store.get_mut(ledger.first + i) {
                record.offset = new.hdr;
                record.body_offset = new.body;
            }
        }
        self.store.retain(|r| !r.is_deleted());
        for record in self.store.iter_mut() {
            record.flags.remove(Flag::CHANGED | Flag::ATTACH_DEL);
        }
        self.store.recount();
        self.store.changed = false;
        match std::fs::metadata(&self.path) {
            Ok(metadata) => self.refresh_snapshot(&metadata),
            Err(err) => {
                log::debug!("could not stat {}: {}", self.path.display(), err);
                self.store.size = new_size;
                self.snapshot.size = new_size;
            }
        }
        remove_tmp(&staged.tmp_path);
        log::debug!(
            "synced {}: {} messages, {} bytes",
            self.path.display(),
            self.store.len(),
            new_size
        );
        Ok(SyncStatus::Committed)
    }

    /// Lock, make sure nothing changed behind our back, and write the
    /// rewrite region to a temporary file.
    fn stage(&mut self, ledger: &mut Ledger) -> Result<Stage> {
        self.lock_file(FileLockKind::Exclusive, FileLockOptions::try_thrice())
            .map_err(|err| err.set_summary("Unable to lock mailbox"))?;

        match self.check_mailbox()? {
            status @ (CheckStatus::NewMail | CheckStatus::Reopened) => {
                return Ok(Stage::External(status));
            }
            _ => {}
        }

        let Some(first) = self
            .store
            .iter()
            .position(|r| r.flags.intersects(Flag::DELETED | Flag::CHANGED | Flag::ATTACH_DEL))
        else {
            return Err(
                Error::new("sync: mbox modified, but no modified messages")
                    .set_kind(ErrorKind::Bug),
            );
        };

        let mut offset = self.store[first].offset;
        // Stored offsets point past the MMDF separator.
        if self.format == MboxFormat::Mmdf {
            offset = offset.saturating_sub(super::MMDF_SEP.len() as u64);
        }

        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp_path = dir.join(format!(
            ".{}.{}.tmp",
            file_name,
            uuid::Uuid::new_v4().as_simple()
        ));
        let tmp = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&tmp_path)
            .map_err(|err| {
                Error::from(err)
                    .set_summary("Could not create temporary file")
                    .set_related_path(&tmp_path)
            })?;

        ledger.first = first;
        if let Err(err) = self.write_region(ledger, tmp, offset) {
            remove_tmp(&tmp_path);
            return Err(err.set_related_path(&tmp_path));
        }

        let metadata = match std::fs::metadata(&self.path) {
            Ok(m) => m,
            Err(err) => {
                remove_tmp(&tmp_path);
                return Err(Error::from(err)
                    .set_summary(format!("Could not stat {}", self.path.display())));
            }
        };
        Ok(Stage::Ready(Staged {
            tmp_path,
            offset,
            metadata,
        }))
    }

    /// Copy every kept message from `ledger.first` on into `tmp`, recording
    /// old and new offsets.
    fn write_region(&mut self, ledger: &mut Ledger, tmp: File, offset: Offset) -> Result<()> {
        let copier = self.ctx.copier.clone();
        let format = self.format;
        let src = self.file.as_ref().ok_or_else(|| {
            Error::new(format!("Mailbox {} is closed", self.path.display()))
                .set_kind(ErrorKind::NotFound)
        })?;
        let mut out = CountingWriter {
            inner: BufWriter::new(tmp),
            written: 0,
        };
        for i in ledger.first..self.store.len() {
            let Some(record) = self.store.get_mut(i) else {
                break;
            };
            ledger.old.push(MUpdate::of(record));
            ledger.new.push(MUpdate::default());
            if record.is_deleted() {
                continue;
            }
            if format == MboxFormat::Mmdf {
                out.write_all(super::MMDF_SEP)?;
            }
            let hdr = out.written + offset;
            copier.copy_message(src, format, record, &mut out)?;
            // The header may have been rewritten; the body length is known.
            let body = (out.written + offset).saturating_sub(record.body_length.unwrap_or(0));
            out.write_all(format.padding())?;
            if let Some(new) = ledger.new.last_mut() {
                *new = MUpdate {
                    hdr,
                    body,
                    ..MUpdate::of(record)
                };
            }
        }
        let tmp = out.inner.into_inner().map_err(|err| err.into_error())?;
        tmp.sync_all()?;
        Ok(())
    }

    /// Check that a boundary is still at `offset`, then copy `tmp` over the
    /// mailbox from there and truncate. Returns the new size.
    fn splice(&mut self, tmp: &mut File, offset: Offset) -> Result<u64> {
        let format = self.format;
        let file = self.file.as_mut().ok_or_else(|| {
            Error::new("Mailbox is closed").set_kind(ErrorKind::NotFound)
        })?;
        file.seek(SeekFrom::Start(offset))?;
        let mut line = Vec::with_capacity(64);
        BufReader::new(&*file).read_until(b'\n', &mut line)?;
        if !format.is_boundary(&line) {
            log::debug!(
                "message not in expected position, line: {:?}",
                String::from_utf8_lossy(&line)
            );
            return Err(Error::new(format!(
                "Message not in expected position at offset {}",
                offset
            ))
            .set_kind(ErrorKind::Corrupted));
        }
        file.seek(SeekFrom::Start(offset))?;
        std::io::copy(tmp, file)?;
        let size = file.stream_position()?;
        file.set_len(size)?;
        file.sync_all()?;
        Ok(size)
    }

    /// Move the temporary file somewhere the user can find it. Returns where
    /// it ended up.
    fn preserve(&self, tmp_path: &Path) -> PathBuf {
        let saved = self
            .settings
            .tmpdir
            .join(format!("mailfold.{}", process_tag()));
        if std::fs::rename(tmp_path, &saved).is_ok() {
            return saved;
        }
        // Probably another file system.
        match std::fs::copy(tmp_path, &saved) {
            Ok(_) => {
                remove_tmp(tmp_path);
                saved
            }
            Err(err) => {
                log::error!(
                    "could not save partial mailbox to {}: {}",
                    saved.display(),
                    err
                );
                tmp_path.to_path_buf()
            }
        }
    }

    /// Undo the offsets touched so far, release the lock and go back to a
    /// read-only handle. Flags are left alone so the sync can be retried.
    fn bail(&mut self, ledger: &Ledger, result: Result<SyncStatus>) -> Result<SyncStatus> {
        ledger.restore(&mut self.store);
        self.unlock();
        match File::open(&self.path) {
            Ok(file) => self.file = Some(file),
            Err(err) => {
                self.fast_close();
                return Err(Error::from(err)
                    .set_summary(format!("Could not reopen mailbox {}", self.path.display()))
                    .set_related_path(&self.path));
            }
        }
        result
    }
}
