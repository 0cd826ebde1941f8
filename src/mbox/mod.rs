/*
 * meli - mailbox module.
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

//! # Flat-file mailboxes
//!
//! ## Resources
//!
//! [^0]: <https://web.archive.org/web/20160812091518/https://jdebp.eu./FGA/mail-mbox-formats.html>
//! [^1]: <https://manpages.debian.org/buster/mutt/mbox.5.en.html>
//!
//! ## `mbox`
//!
//! "Each message is preceded by a From_ line and followed by a blank line. A
//! From_ line is a line that begins with the five characters 'F', 'r', 'o',
//! 'm', and ' '." [^0]
//!
//! A postmark carries the envelope sender and the delivery date in
//! `asctime(3)` format:
//!
//! ```text
//! From example@example.com Fri Jun 23 02:56:55 2000
//! ```
//!
//! Body lines starting with `From ` are told apart from real boundaries with
//! the `Content-Length` header when it is present and agrees with the file.
//!
//! ## MMDF
//!
//! Every message is enclosed between two lines of four `^A` (`0x01`)
//! characters. A postmark may follow the opening separator.
//!
//! ## Metadata
//!
//! The `CClient` convention is read and written:
//!
//! - `Status`: R (Seen) and O (non-Recent) flags
//! - `X-Status`: A (Answered) and F (Flagged) flags
//!
//! ## Sessions
//!
//! [`MboxMailbox`] holds an open mailbox. Its store is filled on open, kept
//! up to date by [`check`](crate::mailbox::MailboxOps::check) and written back
//! by [`sync`](crate::mailbox::MailboxOps::sync), which rewrites only the
//! part of the file starting at the first modified message.

use std::{
    fs::{File, FileTimes, OpenOptions},
    io::{BufRead, BufReader, Read, Seek, SeekFrom},
    path::{Path, PathBuf},
    str::FromStr,
    time::{Duration, SystemTime},
};

use crate::{
    conf::MboxSettings,
    error::{Error, ErrorKind, Result},
    mailbox::{
        CheckStatus, HeaderStore, MailboxOps, MailboxSnapshot, MailboxType, Message, MxContext,
        NewMessage, ParseStatus, SyncStatus,
    },
    utils::{
        datetime::{parse_asctime, UnixTimestamp},
        lock::{FileLock, FileLockKind, FileLockOptions, FileLockTrait},
        shellexpand::ShellExpandTrait,
    },
};

mod check;
pub mod parser;
mod reconcile;
mod sync;
mod write;

pub use parser::MboxParser;
pub use sync::MessageCopier;
pub use write::StatusCopier;

/// The MMDF message delimiter, written before and after every message.
pub const MMDF_SEP: &[u8] = b"\x01\x01\x01\x01\n";

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MboxFormat {
    #[default]
    Mbox,
    Mmdf,
}

impl FromStr for MboxFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mbox" => Ok(Self::Mbox),
            "mmdf" => Ok(Self::Mmdf),
            _ => Err(Error::new("Expected one of `mbox`, `mmdf`").set_kind(ErrorKind::ValueError)),
        }
    }
}

impl std::fmt::Display for MboxFormat {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Mbox => write!(fmt, "mbox"),
            Self::Mmdf => write!(fmt, "mmdf"),
        }
    }
}

impl MboxFormat {
    /// Whether `line` can start a message in this format.
    pub fn is_boundary(&self, line: &[u8]) -> bool {
        match self {
            Self::Mbox => line.starts_with(b"From "),
            Self::Mmdf => line == MMDF_SEP,
        }
    }

    /// What is written after every message.
    pub const fn padding(&self) -> &'static [u8] {
        match self {
            Self::Mbox => b"\n",
            Self::Mmdf => MMDF_SEP,
        }
    }
}

/// An envelope `From ` line.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Postmark {
    pub sender: Option<String>,
    pub date: Option<UnixTimestamp>,
}

impl Postmark {
    /// Parse `line` as a postmark. A line is one only if it starts with
    /// `From ` and carries a readable date, which keeps prose such as
    /// "From here on" from being mistaken for a boundary.
    pub fn parse(line: &[u8]) -> Option<Self> {
        let rest = line.strip_prefix(b"From ")?;
        let rest = String::from_utf8_lossy(rest);
        let rest = rest.trim();
        if let Some(date) = parse_asctime(rest) {
            return Some(Self {
                sender: None,
                date: Some(date),
            });
        }
        // A quoted local part may contain spaces.
        let skip = match rest.strip_prefix('"') {
            Some(quoted) => quoted.find('"')? + 2,
            None => 0,
        };
        let end = rest[skip..].find(char::is_whitespace)? + skip;
        let sender = &rest[..end];
        let date = parse_asctime(rest[end..].trim_start())?;
        Some(Self {
            sender: Some(sender.to_string()).filter(|s| !s.is_empty()),
            date: Some(date),
        })
    }
}

/// Detect the format of the file at `path`. Leading empty lines are
/// skipped. Unless `check_mbox_size` is set, the file's times are restored
/// afterwards since new mail detection depends on them.
pub fn path_probe(path: &Path, check_mbox_size: bool) -> Option<MboxFormat> {
    let metadata = std::fs::metadata(path).ok()?;
    if !metadata.is_file() {
        return None;
    }
    let file = File::open(path).ok()?;
    let mut line = Vec::with_capacity(64);
    {
        let mut reader = BufReader::new(&file);
        loop {
            let buf = reader.fill_buf().ok()?;
            if buf.is_empty() {
                break;
            }
            let blanks = buf
                .iter()
                .take_while(|b| matches!(b, b'\n' | b'\r'))
                .count();
            let done = blanks < buf.len();
            reader.consume(blanks);
            if done {
                break;
            }
        }
        reader.read_until(b'\n', &mut line).ok()?;
    }
    let ret = if MboxFormat::Mbox.is_boundary(&line) {
        Some(MboxFormat::Mbox)
    } else if MboxFormat::Mmdf.is_boundary(&line) {
        Some(MboxFormat::Mmdf)
    } else {
        None
    };
    if !check_mbox_size {
        let mut times = FileTimes::new();
        if let Ok(atime) = metadata.accessed() {
            times = times.set_accessed(atime);
        }
        if let Ok(mtime) = metadata.modified() {
            times = times.set_modified(mtime);
        }
        if let Err(err) = file.set_times(times) {
            log::debug!("could not restore times of {}: {}", path.display(), err);
        }
    }
    ret
}

/// Canonicalize a mailbox path. A leading `+` or `=` stands for `folder`.
pub fn path_canon(path: &str, folder: Option<&Path>) -> Result<PathBuf> {
    let path = if let Some(rest) = path.strip_prefix(['+', '=']) {
        let folder = folder.ok_or_else(|| {
            Error::new(format!("Cannot resolve {}: no folder is set", path))
                .set_kind(ErrorKind::ValueError)
        })?;
        folder.join(rest.trim_start_matches('/'))
    } else {
        PathBuf::from(path)
    };
    Ok(path.expand().normalize())
}

/// An open mbox or MMDF mailbox.
#[derive(Debug)]
pub struct MboxMailbox {
    path: PathBuf,
    format: MboxFormat,
    settings: MboxSettings,
    ctx: MxContext,
    file: Option<File>,
    /// Held on a duplicate of `file`, which shares its open file
    /// description.
    lock: Option<FileLock<File>>,
    append: bool,
    readonly: bool,
    closed: bool,
    snapshot: MailboxSnapshot,
    store: HeaderStore,
}

impl MboxMailbox {
    fn new(path: &Path, format: MboxFormat, ctx: MxContext) -> Result<Self> {
        let settings = MboxSettings::new(&ctx.account)?;
        Ok(Self {
            path: path.to_path_buf(),
            format,
            settings,
            readonly: ctx.account.read_only,
            ctx,
            file: None,
            lock: None,
            append: false,
            closed: false,
            snapshot: MailboxSnapshot::default(),
            store: HeaderStore::new(),
        })
    }

    /// Open and parse an existing mailbox.
    ///
    /// Fails with [`ErrorKind::WouldBlock`] if a shared lock cannot be taken.
    pub fn open(path: &Path, format: MboxFormat, ctx: MxContext) -> Result<Self> {
        let mut ret = Self::new(path, format, ctx)?;
        let file = File::open(path).map_err(|err| {
            Error::from(err)
                .set_summary(format!("Could not open mailbox {}", path.display()))
                .set_related_path(path)
        })?;
        ret.file = Some(file);
        if let Err(err) = ret.lock_file(FileLockKind::Shared, FileLockOptions::try_thrice()) {
            ret.file = None;
            let kind = if err.kind.is_would_block() {
                ErrorKind::WouldBlock
            } else {
                err.kind
            };
            return Err(
                Error::new(format!("Could not lock mailbox {}", path.display()))
                    .set_details(err.summary)
                    .set_kind(kind)
                    .set_related_path(path),
            );
        }
        let status = ret.parse_from(0);
        ret.touch_atime();
        ret.unlock();
        match status? {
            ParseStatus::Ok(count) => {
                log::debug!("parsed {} messages from {}", count, path.display());
            }
            ParseStatus::Aborted => {
                log::debug!(
                    "parsing {} was interrupted after {} messages",
                    path.display(),
                    ret.store.len()
                );
            }
        }
        Ok(ret)
    }

    /// Open a mailbox to add messages to its end, creating or truncating it
    /// if `create` is set. The mailbox stays exclusively locked until it is
    /// closed.
    pub fn open_append(
        path: &Path,
        format: MboxFormat,
        ctx: MxContext,
        create: bool,
    ) -> Result<Self> {
        let mut ret = Self::new(path, format, ctx)?;
        let mut options = OpenOptions::new();
        if create {
            options.write(true).create(true).truncate(true);
        } else {
            options.append(true);
        }
        let mut file = options.open(path).map_err(|err| {
            Error::from(err)
                .set_summary(format!("Could not open mailbox {}", path.display()))
                .set_related_path(path)
        })?;
        file.seek(SeekFrom::End(0))?;
        ret.file = Some(file);
        ret.append = true;
        ret.lock_file(FileLockKind::Exclusive, FileLockOptions::try_thrice())
            .map_err(|err| err.set_summary(format!("Couldn't lock {}", path.display())))?;
        Ok(ret)
    }

    pub const fn format(&self) -> MboxFormat {
        self.format
    }

    pub fn snapshot(&self) -> &MailboxSnapshot {
        &self.snapshot
    }

    pub const fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    fn file(&self) -> Result<&File> {
        self.file.as_ref().ok_or_else(|| self.closed_error())
    }

    fn closed_error(&self) -> Error {
        Error::new(format!("Mailbox {} is closed", self.path.display()))
            .set_kind(ErrorKind::NotFound)
            .set_related_path(&self.path)
    }

    fn lock_file(&mut self, kind: FileLockKind, options: FileLockOptions) -> Result<()> {
        let dup = self.file()?.try_clone()?;
        self.lock = Some(dup.lock(kind, options, &self.path)?);
        Ok(())
    }

    fn unlock(&mut self) {
        if let Some(lock) = self.lock.take() {
            drop(lock.unlock());
        }
    }

    /// Drop the file and its lock without writing anything. The store is
    /// kept so that the caller can still inspect it.
    fn fast_close(&mut self) {
        self.unlock();
        self.file = None;
        self.closed = true;
    }

    fn refresh_snapshot(&mut self, metadata: &std::fs::Metadata) {
        self.snapshot = MailboxSnapshot::from(metadata);
        self.store.size = self.snapshot.size;
    }

    /// Parse the file from `offset`, appending records to the store.
    fn parse_from(&mut self, offset: u64) -> Result<ParseStatus> {
        let metadata = std::fs::metadata(&self.path).map_err(|err| {
            Error::from(err)
                .set_summary(format!("Could not stat {}", self.path.display()))
                .set_related_path(&self.path)
        })?;
        self.refresh_snapshot(&metadata);
        if !self.readonly {
            self.readonly =
                nix::unistd::access(&self.path, nix::unistd::AccessFlags::W_OK).is_err();
        }
        let file = self.file.as_ref().ok_or_else(|| {
            Error::new(format!("Mailbox {} is closed", self.path.display()))
                .set_kind(ErrorKind::NotFound)
        })?;
        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(offset))?;
        let parser = MboxParser {
            format: self.format,
            headers: self.ctx.parser.as_ref(),
            interrupt: &self.ctx.interrupt,
        };
        parser
            .parse(&mut reader, &mut self.store, self.snapshot.size)
            .map_err(|err| err.set_related_path(&self.path))
    }

    fn touch_atime(&self) {
        if let Some(file) = self.file.as_ref() {
            if let Err(err) = file.set_times(FileTimes::new().set_accessed(SystemTime::now())) {
                log::debug!("could not touch atime of {}: {}", self.path.display(), err);
            }
        }
    }

    /// Restore the times in `metadata` (or the current ones), moving the
    /// access time before the modification time if unread mail remains so
    /// that other programs still notice it.
    fn reset_atime(&self, metadata: Option<&std::fs::Metadata>) {
        let metadata = match metadata.cloned() {
            Some(m) => m,
            None => match std::fs::metadata(&self.path) {
                Ok(m) => m,
                Err(err) => {
                    log::debug!("could not stat {}: {}", self.path.display(), err);
                    return;
                }
            },
        };
        let (Ok(mut atime), Ok(mtime)) = (metadata.accessed(), metadata.modified()) else {
            return;
        };
        if !self.settings.mbox_check_recent && atime >= mtime && self.store.has_new() {
            atime = mtime
                .checked_sub(Duration::from_secs(1))
                .unwrap_or(SystemTime::UNIX_EPOCH);
        }
        if let Err(err) = File::open(&self.path).and_then(|f| {
            f.set_times(FileTimes::new().set_accessed(atime).set_modified(mtime))
        }) {
            log::debug!("could not reset times of {}: {}", self.path.display(), err);
        }
    }

    /// Read the bytes between `start` and `end`.
    fn read_range(&self, start: u64, end: u64) -> Result<Vec<u8>> {
        let mut reader = BufReader::new(self.file()?);
        reader.seek(SeekFrom::Start(start))?;
        let mut ret = Vec::with_capacity(end.saturating_sub(start) as usize);
        reader
            .take(end.saturating_sub(start))
            .read_to_end(&mut ret)?;
        Ok(ret)
    }
}

impl MailboxOps for MboxMailbox {
    fn kind(&self) -> MailboxType {
        self.format.into()
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn store(&self) -> &HeaderStore {
        &self.store
    }

    fn store_mut(&mut self) -> &mut HeaderStore {
        &mut self.store
    }

    fn is_readonly(&self) -> bool {
        self.readonly
    }

    fn check(&mut self) -> Result<CheckStatus> {
        self.check_mailbox()
    }

    fn sync(&mut self) -> Result<SyncStatus> {
        self.sync_mailbox()
    }

    fn close(&mut self) -> Result<()> {
        if let Some(file) = self.file.as_ref() {
            if self.append {
                file.sync_all()?;
            }
        }
        self.unlock();
        self.file = None;
        self.closed = true;
        Ok(())
    }

    fn msg_open(&mut self, index: usize) -> Result<Message> {
        let record = self.store.get(index).ok_or_else(|| {
            Error::new(format!("No message with index {}", index)).set_kind(ErrorKind::NotFound)
        })?;
        let (start, end, received) = (record.offset, record.end_offset(), record.received);
        let mut ret = Message::from_bytes(index, self.read_range(start, end)?);
        ret.received = received;
        Ok(ret)
    }

    fn msg_open_new(&mut self, new: &NewMessage) -> Result<Message> {
        self.open_new_message(new)
    }

    fn msg_commit(&mut self, msg: &mut Message) -> Result<()> {
        self.commit_message(msg)
    }

    /// Bytes framing each message: the trailing newline for mbox, the
    /// separators on both sides for MMDF.
    fn msg_padding_size(&self) -> usize {
        match self.format {
            MboxFormat::Mbox => 1,
            MboxFormat::Mmdf => 2 * MMDF_SEP.len(),
        }
    }
}
