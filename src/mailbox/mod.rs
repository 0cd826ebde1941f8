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

//! The in-memory index of an open mailbox.
//!
//! A [`HeaderStore`] holds one [`MessageRecord`] per message, in file order.
//! It is owned by the mailbox session, rebuilt on reopen and mutated
//! incrementally by `check` and `sync`.

use std::{fs::Metadata, path::PathBuf, time::SystemTime};

use crate::{email::ParsedHeader, utils::datetime::UnixTimestamp};

pub mod mx;

pub use mx::*;

pub type Offset = u64;
pub type Length = u64;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
    pub struct Flag: u16 {
        const DELETED    = 0b0000_0000_0001;
        /// Flags were modified in memory and not yet written back.
        const CHANGED    = 0b0000_0000_0010;
        const OLD        = 0b0000_0000_0100;
        const READ       = 0b0000_0000_1000;
        const FLAGGED    = 0b0000_0001_0000;
        const REPLIED    = 0b0000_0010_0000;
        const PURGE      = 0b0000_0100_0000;
        const TAGGED     = 0b0000_1000_0000;
        /// An attachment was removed and the message must be rewritten.
        const ATTACH_DEL = 0b0001_0000_0000;
    }
}

impl Flag {
    /// Flags that are persisted in the message itself.
    pub const USER: Self = Self::OLD
        .union(Self::READ)
        .union(Self::FLAGGED)
        .union(Self::REPLIED);
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum BackingFormat {
    #[default]
    Maildir,
}

/// Where an index-backed message lives on disk.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct IndexRecord {
    /// Stable message identifier assigned by the index, never reused.
    pub virtual_id: String,
    pub thread_id: Option<String>,
    /// The maildir folder holding `cur`, `new` and `tmp`.
    pub folder: PathBuf,
    pub backing_path: PathBuf,
    /// Set while a rename has not been flushed to the index.
    pub old_backing_path: Option<PathBuf>,
    pub backing_format: BackingFormat,
    pub tags: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessageRecord {
    /// Offset of the message's leading separator or header.
    pub offset: Offset,
    pub body_offset: Offset,
    /// `None` while unknown, during parsing.
    pub body_length: Option<Length>,
    pub line_count: u64,
    pub header: ParsedHeader,
    pub flags: Flag,
    /// Position in the store.
    pub index: usize,
    /// Delivery date from the envelope postmark.
    pub received: Option<UnixTimestamp>,
    pub index_record: Option<IndexRecord>,
}

impl MessageRecord {
    pub fn new(offset: Offset) -> Self {
        Self {
            offset,
            body_offset: offset,
            ..Self::default()
        }
    }

    #[inline]
    pub fn is_deleted(&self) -> bool {
        self.flags.contains(Flag::DELETED)
    }

    #[inline]
    pub fn is_changed(&self) -> bool {
        self.flags.contains(Flag::CHANGED)
    }

    #[inline]
    pub fn is_read(&self) -> bool {
        self.flags.contains(Flag::READ)
    }

    #[inline]
    pub fn is_old(&self) -> bool {
        self.flags.contains(Flag::OLD)
    }

    /// Unread mail that has not been seen in a previous session.
    #[inline]
    pub fn is_new(&self) -> bool {
        !self.flags.intersects(Flag::DELETED | Flag::READ | Flag::OLD)
    }

    /// End of the message, excluding inter-message padding.
    pub fn end_offset(&self) -> Offset {
        self.body_offset + self.body_length.unwrap_or(0)
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Counters {
    pub count: usize,
    pub unread: usize,
    pub flagged: usize,
    pub deleted: usize,
    pub new: usize,
    pub tagged: usize,
}

#[derive(Clone, Debug, Default)]
pub struct HeaderStore {
    records: Vec<MessageRecord>,
    /// Size of the backing file as last observed.
    pub size: u64,
    pub counters: Counters,
    /// Set whenever a flag change must be written back.
    pub changed: bool,
}

impl HeaderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&MessageRecord> {
        self.records.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut MessageRecord> {
        self.records.get_mut(index)
    }

    pub fn last_mut(&mut self) -> Option<&mut MessageRecord> {
        self.records.last_mut()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, MessageRecord> {
        self.records.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, MessageRecord> {
        self.records.iter_mut()
    }

    /// Append a record, assigning its index.
    pub fn push(&mut self, mut record: MessageRecord) -> usize {
        let index = self.records.len();
        record.index = index;
        self.count_record(&record);
        self.records.push(record);
        index
    }

    /// Detach every record, leaving the store empty.
    pub fn take(&mut self) -> Vec<MessageRecord> {
        self.counters = Counters::default();
        self.changed = false;
        std::mem::take(&mut self.records)
    }

    pub fn retain<F: FnMut(&MessageRecord) -> bool>(&mut self, f: F) {
        self.records.retain(f);
        self.renumber();
        self.recount();
    }

    pub fn renumber(&mut self) {
        for (i, r) in self.records.iter_mut().enumerate() {
            r.index = i;
        }
    }

    fn count_record(&mut self, r: &MessageRecord) {
        let c = &mut self.counters;
        c.count += 1;
        if r.flags.contains(Flag::DELETED) {
            c.deleted += 1;
        }
        if r.flags.contains(Flag::FLAGGED) {
            c.flagged += 1;
        }
        if r.flags.contains(Flag::TAGGED) {
            c.tagged += 1;
        }
        if !r.flags.contains(Flag::READ) {
            c.unread += 1;
            if !r.flags.contains(Flag::OLD) {
                c.new += 1;
            }
        }
    }

    pub fn recount(&mut self) {
        self.counters = Counters::default();
        for i in 0..self.records.len() {
            let r = self.records[i].clone();
            self.count_record(&r);
        }
    }

    /// Set or clear one flag on record `index`. Returns whether the state
    /// changed.
    ///
    /// Changing a persisted flag marks the record [`Flag::CHANGED`]; changing
    /// [`Flag::DELETED`], [`Flag::PURGE`], [`Flag::ATTACH_DEL`] or a persisted
    /// flag marks the store as changed. [`Flag::TAGGED`] is session-only.
    pub fn set_flag(&mut self, index: usize, flag: Flag, value: bool) -> bool {
        let Some(record) = self.records.get_mut(index) else {
            return false;
        };
        if record.flags.contains(flag) == value {
            return false;
        }
        record.flags.set(flag, value);
        if Flag::USER.contains(flag) {
            record.flags.insert(Flag::CHANGED);
            self.changed = true;
        } else if flag.intersects(Flag::DELETED | Flag::PURGE | Flag::ATTACH_DEL) {
            self.changed = true;
        }
        self.recount();
        true
    }

    /// Whether any message is unread and was not seen before.
    pub fn has_new(&self) -> bool {
        self.records.iter().any(MessageRecord::is_new)
    }
}

impl std::ops::Index<usize> for HeaderStore {
    type Output = MessageRecord;

    fn index(&self, index: usize) -> &MessageRecord {
        &self.records[index]
    }
}

impl<'a> IntoIterator for &'a HeaderStore {
    type Item = &'a MessageRecord;
    type IntoIter = std::slice::Iter<'a, MessageRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

/// File size and times as of the last successful parse, used only for
/// change detection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MailboxSnapshot {
    pub size: u64,
    pub mtime: SystemTime,
    pub atime: SystemTime,
}

impl Default for MailboxSnapshot {
    fn default() -> Self {
        Self {
            size: 0,
            mtime: SystemTime::UNIX_EPOCH,
            atime: SystemTime::UNIX_EPOCH,
        }
    }
}

impl From<&Metadata> for MailboxSnapshot {
    fn from(m: &Metadata) -> Self {
        Self {
            size: m.len(),
            mtime: m.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            atime: m.accessed().unwrap_or(SystemTime::UNIX_EPOCH),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParseStatus {
    /// Number of records appended.
    Ok(usize),
    /// Interrupted; records parsed so far were kept.
    Aborted,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CheckStatus {
    Unchanged,
    /// Messages were appended to the store.
    NewMail,
    /// The store was rebuilt; indices held by the caller are invalid.
    Reopened,
    /// The mailbox is locked by someone else, try again later.
    Locked,
    /// Only flags of known messages changed.
    Flags,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SyncStatus {
    Committed,
    /// The file changed on disk before it could be rewritten; nothing was
    /// written and the store now reflects the file.
    ExternalChange(CheckStatus),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_of(n: usize) -> HeaderStore {
        let mut store = HeaderStore::new();
        for i in 0..n {
            store.push(MessageRecord::new(i as Offset * 100));
        }
        store
    }

    #[test]
    fn test_store_set_flag() {
        let mut store = store_of(3);
        assert_eq!(store.counters.new, 3);
        assert!(store.has_new());

        assert!(store.set_flag(0, Flag::READ, true));
        assert!(!store.set_flag(0, Flag::READ, true));
        assert!(store[0].is_changed());
        assert!(store.changed);
        assert_eq!(store.counters.unread, 2);

        let mut store = store_of(1);
        assert!(store.set_flag(0, Flag::TAGGED, true));
        assert!(!store[0].is_changed());
        assert!(!store.changed);
        assert_eq!(store.counters.tagged, 1);

        assert!(store.set_flag(0, Flag::DELETED, true));
        assert!(!store[0].is_changed());
        assert!(store.changed);
        assert_eq!(store.counters.deleted, 1);
        assert!(!store.has_new());
    }

    #[test]
    fn test_store_retain_renumbers() {
        let mut store = store_of(4);
        store.set_flag(1, Flag::DELETED, true);
        store.retain(|r| !r.is_deleted());
        assert_eq!(store.len(), 3);
        assert_eq!(
            store.iter().map(|r| (r.index, r.offset)).collect::<Vec<_>>(),
            vec![(0, 0), (1, 200), (2, 300)]
        );
        assert_eq!(store.counters.deleted, 0);
        assert_eq!(store.take().len(), 3);
        assert!(store.is_empty());
    }
}
