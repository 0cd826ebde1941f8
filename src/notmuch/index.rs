/*
 * meli - notmuch backend
 *
 * Copyright 2019 - 2023 Manos Pitsidianakis
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

//! The operations the adapter consumes from a message index.

use std::{
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use crate::{
    error::{Error, Result},
    utils::datetime::UnixTimestamp,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
}

/// Outcome of indexing a file.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AddStatus {
    /// A new message was created.
    Added,
    /// The file was added to a message that was already indexed.
    Duplicate,
}

/// Outcome of removing a file name from the index.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RemoveStatus {
    /// The message is gone from the index.
    Removed,
    /// The message is still indexed under other file names.
    DuplicateRemains,
}

/// A message as the index sees it.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct IndexedMessage {
    /// Message-ID without angle brackets.
    pub id: String,
    pub thread_id: String,
    /// Every file the message is stored in, oldest first.
    pub filenames: Vec<PathBuf>,
    pub tags: Vec<String>,
    pub date: UnixTimestamp,
}

impl IndexedMessage {
    /// The most recently added file name.
    pub fn filename(&self) -> Option<&Path> {
        self.filenames.last().map(PathBuf::as_path)
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct IndexedThread {
    pub thread_id: String,
    pub total_messages: usize,
    /// Messages of the thread that reply to nothing inside it.
    pub toplevel: Vec<IndexedMessage>,
}

/// A search, evaluated with omit-excluded semantics: messages carrying one
/// of `exclude_tags` are left out unless the query names that tag itself.
/// Results come newest first.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SearchQuery {
    pub text: String,
    pub exclude_tags: Vec<String>,
}

impl SearchQuery {
    pub fn new<S: Into<String>>(text: S) -> Self {
        Self {
            text: text.into(),
            exclude_tags: vec![],
        }
    }

    pub fn exclude<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_tags.extend(tags.into_iter().map(Into::into));
        self
    }
}

/// An open connection to an index database.
///
/// Iterators returned by searches are single pass. Write operations on a
/// connection opened with [`OpenMode::ReadOnly`] fail with
/// [`ErrorKind::ReadOnly`](crate::error::ErrorKind::ReadOnly).
pub trait Database: Send + std::fmt::Debug {
    fn mode(&self) -> OpenMode;

    /// The directory file names are relative to.
    fn root(&self) -> &Path;

    /// When the database was last written to.
    fn mtime(&self) -> Result<SystemTime>;

    fn begin_atomic(&mut self) -> Result<()>;

    fn end_atomic(&mut self) -> Result<()>;

    fn find_message(&self, id: &str) -> Result<Option<IndexedMessage>>;

    fn find_message_by_filename(&self, path: &Path) -> Result<Option<IndexedMessage>>;

    /// Index the file at `path`, creating a message or adding the file to an
    /// existing one with the same Message-ID.
    fn index_file(&mut self, path: &Path) -> Result<(IndexedMessage, AddStatus)>;

    fn remove_filename(&mut self, path: &Path) -> Result<RemoveStatus>;

    fn add_tag(&mut self, id: &str, tag: &str) -> Result<()>;

    fn remove_tag(&mut self, id: &str, tag: &str) -> Result<()>;

    /// Every tag in use, sorted.
    fn all_tags(&self) -> Result<Vec<String>>;

    fn search_messages(
        &self,
        query: &SearchQuery,
    ) -> Result<Box<dyn Iterator<Item = IndexedMessage> + '_>>;

    fn search_threads(
        &self,
        query: &SearchQuery,
    ) -> Result<Box<dyn Iterator<Item = IndexedThread> + '_>>;

    /// Direct replies to message `id`, oldest first.
    fn replies(&self, id: &str) -> Result<Vec<IndexedMessage>>;

    fn count_messages(&self, query: &SearchQuery) -> Result<usize>;

    fn count_threads(&self, query: &SearchQuery) -> Result<usize>;
}

/// Opens [`Database`] connections. A busy database is reported with
/// [`ErrorKind::WouldBlock`](crate::error::ErrorKind::WouldBlock).
pub trait IndexBackend: Send + Sync + std::fmt::Debug {
    fn open(&self, path: &Path, mode: OpenMode) -> Result<Box<dyn Database>>;
}

const RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Open the database at `path`, retrying every half second for up to
/// `timeout` seconds while it is busy. Any other failure is returned right
/// away.
pub fn open_database(
    backend: &dyn IndexBackend,
    path: &Path,
    mode: OpenMode,
    timeout: u64,
) -> Result<Box<dyn Database>> {
    let mut tries: u64 = 0;
    loop {
        match backend.open(path, mode) {
            Ok(db) => {
                log::trace!("opened notmuch database {} {:?}", path.display(), mode);
                return Ok(db);
            }
            Err(err) if err.kind.is_would_block() && tries < timeout.saturating_mul(2) => {
                if tries % 2 == 0 {
                    log::info!("Waiting for notmuch DB... ({} sec)", tries / 2);
                }
                std::thread::sleep(RETRY_INTERVAL);
                tries += 1;
            }
            Err(err) => {
                return Err(Error::new(format!(
                    "Cannot open notmuch database: {}",
                    path.display()
                ))
                .set_details(err.summary.clone())
                .set_kind(err.kind)
                .set_related_path(path));
            }
        }
    }
}
