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

//! The operations every mailbox format implements, and format selection.

use std::{
    fs::File,
    io::{Cursor, Read, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use super::{CheckStatus, HeaderStore, SyncStatus};
use crate::{
    conf::{AccountSettings, MboxSettings},
    email::{HeaderCompare, HeaderParser, Rfc822Headers, StrictCompare},
    error::{Error, ErrorKind, Result},
    maildir::{MaildirSync, MaildirWriter},
    mbox::{self, MboxFormat, MboxMailbox, MessageCopier, StatusCopier},
    notmuch::{self, IndexBackend, NotmuchMailbox},
    utils::{datetime::UnixTimestamp, interrupt::Interrupt},
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MailboxType {
    Mbox,
    Mmdf,
    Notmuch,
}

impl std::fmt::Display for MailboxType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Mbox => write!(f, "mbox"),
            Self::Mmdf => write!(f, "mmdf"),
            Self::Notmuch => write!(f, "notmuch"),
        }
    }
}

impl From<MboxFormat> for MailboxType {
    fn from(f: MboxFormat) -> Self {
        match f {
            MboxFormat::Mbox => Self::Mbox,
            MboxFormat::Mmdf => Self::Mmdf,
        }
    }
}

impl MailboxType {
    /// Detect the format of `path`, which may also be a `notmuch://` URI.
    pub fn probe(path: &str, ctx: &MxContext) -> Option<Self> {
        if path.starts_with(notmuch::URI_SCHEME) {
            return Some(Self::Notmuch);
        }
        let check_mbox_size = MboxSettings::new(&ctx.account)
            .map(|s| s.check_mbox_size)
            .unwrap_or(false);
        mbox::path_probe(Path::new(path), check_mbox_size).map(Self::from)
    }

    /// Canonicalize `path` for this format; `folder` replaces a leading `+`
    /// or `=`.
    pub fn canon(&self, path: &str, folder: Option<&Path>) -> Result<String> {
        match self {
            Self::Mbox | Self::Mmdf => {
                mbox::path_canon(path, folder).map(|p| p.display().to_string())
            }
            Self::Notmuch => notmuch::path_canon(path, folder),
        }
    }

    /// Open an existing mailbox of this format.
    pub fn open(&self, path: &str, ctx: &MxContext) -> Result<Box<dyn MailboxOps>> {
        Ok(match self {
            Self::Mbox => Box::new(MboxMailbox::open(
                Path::new(path),
                MboxFormat::Mbox,
                ctx.clone(),
            )?),
            Self::Mmdf => Box::new(MboxMailbox::open(
                Path::new(path),
                MboxFormat::Mmdf,
                ctx.clone(),
            )?),
            Self::Notmuch => Box::new(NotmuchMailbox::open(path, ctx.clone())?),
        })
    }

    /// Open a mailbox to add messages to it, creating it if `create` is set.
    pub fn open_append(
        &self,
        path: &str,
        ctx: &MxContext,
        create: bool,
    ) -> Result<Box<dyn MailboxOps>> {
        match self {
            Self::Mbox | Self::Mmdf => {
                let format = match self {
                    Self::Mmdf => MboxFormat::Mmdf,
                    _ => MboxFormat::Mbox,
                };
                Ok(Box::new(MboxMailbox::open_append(
                    Path::new(path),
                    format,
                    ctx.clone(),
                    create,
                )?))
            }
            Self::Notmuch => Err(Error::new(
                "Virtual mailboxes cannot be opened for appending.",
            )
            .set_kind(ErrorKind::NotSupported)),
        }
    }
}

/// Probe `path` and open it with the matching backend.
pub fn open(path: &str, ctx: &MxContext) -> Result<Box<dyn MailboxOps>> {
    let Some(kind) = MailboxType::probe(path, ctx) else {
        return Err(
            Error::new(format!("{} is not a mailbox or its format is unknown", path))
                .set_kind(ErrorKind::ValueError)
                .set_related_path(path),
        );
    };
    log::debug!("opening {} as {}", path, kind);
    kind.open(path, ctx)
}

/// What is known about a message before it is written with
/// [`MailboxOps::msg_open_new`].
#[derive(Clone, Debug, Default)]
pub struct NewMessage {
    /// Envelope sender for the postmark, usually the return path.
    pub sender: Option<String>,
    pub received: Option<UnixTimestamp>,
}

#[derive(Debug)]
enum MessageInner {
    Read(Cursor<Vec<u8>>),
    Write(File),
}

/// An open message, either bytes read from the mailbox or a handle new
/// content is written to.
#[derive(Debug)]
pub struct Message {
    pub index: Option<usize>,
    /// Backing file, for formats that keep one file per message.
    pub path: Option<PathBuf>,
    pub received: Option<UnixTimestamp>,
    inner: MessageInner,
}

impl Message {
    pub fn from_bytes(index: usize, bytes: Vec<u8>) -> Self {
        Self {
            index: Some(index),
            path: None,
            received: None,
            inner: MessageInner::Read(Cursor::new(bytes)),
        }
    }

    pub fn for_writing(file: File, received: Option<UnixTimestamp>) -> Self {
        Self {
            index: None,
            path: None,
            received,
            inner: MessageInner::Write(file),
        }
    }

    pub fn set_path(mut self, path: PathBuf) -> Self {
        self.path = Some(path);
        self
    }

    /// The message bytes, or `None` for a message opened for writing.
    pub fn bytes(&self) -> Option<&[u8]> {
        match &self.inner {
            MessageInner::Read(c) => Some(c.get_ref().as_slice()),
            MessageInner::Write(_) => None,
        }
    }

    pub(crate) fn file_mut(&mut self) -> Option<&mut File> {
        match &mut self.inner {
            MessageInner::Write(f) => Some(f),
            MessageInner::Read(_) => None,
        }
    }
}

impl Read for Message {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            MessageInner::Read(c) => c.read(buf),
            MessageInner::Write(_) => Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "message is open for writing",
            )),
        }
    }
}

impl Write for Message {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            MessageInner::Write(f) => f.write(buf),
            MessageInner::Read(_) => Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "message is open for reading",
            )),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &mut self.inner {
            MessageInner::Write(f) => f.flush(),
            MessageInner::Read(_) => Ok(()),
        }
    }
}

/// Collaborators and settings shared by the mailboxes of one account.
#[derive(Clone, Debug)]
pub struct MxContext {
    pub account: AccountSettings,
    pub interrupt: Interrupt,
    pub parser: Arc<dyn HeaderParser>,
    pub compare: Arc<dyn HeaderCompare>,
    pub copier: Arc<dyn MessageCopier>,
    pub maildir_writer: Arc<dyn MaildirWriter>,
    /// Required to open `notmuch://` mailboxes.
    pub index_backend: Option<Arc<dyn IndexBackend>>,
}

impl MxContext {
    pub fn new(account: AccountSettings) -> Self {
        Self {
            account,
            interrupt: Interrupt::global(),
            parser: Arc::new(Rfc822Headers),
            compare: Arc::new(StrictCompare),
            copier: Arc::new(StatusCopier),
            maildir_writer: Arc::new(MaildirSync),
            index_backend: None,
        }
    }

    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn with_copier(mut self, copier: Arc<dyn MessageCopier>) -> Self {
        self.copier = copier;
        self
    }

    pub fn with_maildir_writer(mut self, writer: Arc<dyn MaildirWriter>) -> Self {
        self.maildir_writer = writer;
        self
    }

    pub fn with_index_backend(mut self, backend: Arc<dyn IndexBackend>) -> Self {
        self.index_backend = Some(backend);
        self
    }
}

/// An open mailbox session.
///
/// The session owns its [`HeaderStore`]. Indices into it stay valid until a
/// [`check`](MailboxOps::check) returns [`CheckStatus::Reopened`] or a
/// [`sync`](MailboxOps::sync) commits.
pub trait MailboxOps: std::fmt::Debug + Send {
    fn kind(&self) -> MailboxType;

    fn path(&self) -> &Path;

    fn store(&self) -> &HeaderStore;

    fn store_mut(&mut self) -> &mut HeaderStore;

    fn is_readonly(&self) -> bool;

    /// Look for changes made by other processes.
    fn check(&mut self) -> Result<CheckStatus>;

    /// Write deletions and flag changes back.
    fn sync(&mut self) -> Result<SyncStatus>;

    fn close(&mut self) -> Result<()>;

    fn msg_open(&mut self, index: usize) -> Result<Message>;

    /// Start writing a new message, in a mailbox opened for appending.
    fn msg_open_new(&mut self, new: &NewMessage) -> Result<Message>;

    fn msg_commit(&mut self, msg: &mut Message) -> Result<()>;

    fn msg_close(&mut self, msg: Message) -> Result<()> {
        drop(msg);
        Ok(())
    }

    /// Bytes between two messages.
    fn msg_padding_size(&self) -> usize;

    /// Apply a tag change string such as `+work -inbox` to message `index`.
    fn tags_commit(&mut self, _index: usize, _tags: &str) -> Result<()> {
        Err(Error::new(format!("{} mailboxes do not support tags", self.kind()))
            .set_kind(ErrorKind::NotSupported))
    }
}
