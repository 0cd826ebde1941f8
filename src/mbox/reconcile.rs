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

//! Rebuilding the store after an external modification.

use std::fs::File;

use super::MboxMailbox;
use crate::{
    email::HeaderCompare,
    error::{Error, Result},
    mailbox::{CheckStatus, Flag, HeaderStore, MessageRecord},
};

/// Flags that reflect what the user did in this session and survive a
/// reparse even when the message has no unsaved changes.
const SESSION_FLAGS: [Flag; 3] = [Flag::DELETED, Flag::PURGE, Flag::TAGGED];
/// Flags stored in the file, carried over only when the old record had
/// unsaved changes; otherwise the file is the authority.
const PERSISTED_FLAGS: [Flag; 4] = [Flag::FLAGGED, Flag::REPLIED, Flag::OLD, Flag::READ];

/// Find the old record matching `new`, which sits at `i` in the new store.
///
/// Messages usually move towards the front of the file as earlier ones are
/// deleted, so the search starts at `i` and only then wraps around.
fn find_match(
    compare: &dyn HeaderCompare,
    old: &[Option<MessageRecord>],
    i: usize,
    new: &MessageRecord,
) -> Option<usize> {
    (i..old.len())
        .chain(0..i.min(old.len()))
        .find(|&j| matches!(&old[j], Some(o) if compare.strict_equal(o, new)))
}

/// Carry flags from the records of `old` onto the matching records of
/// `store`. Matched old records are consumed. Returns whether any old record
/// was left without a match.
pub(super) fn carry_flags(
    compare: &dyn HeaderCompare,
    old: Vec<MessageRecord>,
    store: &mut HeaderStore,
) -> bool {
    let mut old: Vec<Option<MessageRecord>> = old.into_iter().map(Some).collect();
    for i in 0..store.len() {
        let Some(j) = find_match(compare, &old, i, &store[i]) else {
            continue;
        };
        let Some(prev) = old[j].take() else {
            continue;
        };
        if prev.is_changed() {
            for flag in PERSISTED_FLAGS {
                store.set_flag(i, flag, prev.flags.contains(flag));
            }
        }
        for flag in SESSION_FLAGS {
            store.set_flag(i, flag, prev.flags.contains(flag));
        }
    }
    old.iter().any(Option::is_some)
}

impl MboxMailbox {
    /// Reparse the whole file into a fresh store and carry the flags of
    /// known messages over.
    ///
    /// Returns [`CheckStatus::Reopened`] if messages disappeared or flags
    /// changed, and [`CheckStatus::NewMail`] if the old messages are all
    /// still there as they were.
    pub(super) fn reopen(&mut self) -> Result<CheckStatus> {
        let old = self.store.take();
        self.store = HeaderStore::new();

        let file = File::open(&self.path).map_err(|err| {
            Error::from(err)
                .set_summary(format!("Could not reopen {}", self.path.display()))
                .set_related_path(&self.path)
        })?;
        self.file = Some(file);
        self.parse_from(0)?;
        self.touch_atime();

        // Read-only mailboxes never write flags back, so there is nothing
        // worth carrying over.
        let msg_mod = if self.readonly {
            false
        } else {
            carry_flags(self.ctx.compare.as_ref(), old, &mut self.store)
        };
        Ok(if self.store.changed || msg_mod {
            CheckStatus::Reopened
        } else {
            CheckStatus::NewMail
        })
    }
}
