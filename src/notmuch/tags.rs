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

//! Tag edits and their relation to message flags.

use std::path::Path;

use smallvec::SmallVec;

use super::index::Database;
use crate::{
    error::{Error, ErrorKind, Result},
    mailbox::{Flag, HeaderStore},
    maildir::MaildirFilePathExt,
};

pub const FLAGGED_TAG: &str = "flagged";
pub const REPLIED_TAG: &str = "replied";

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TagChange {
    Add(String),
    Remove(String),
    Toggle(String),
}

impl TagChange {
    pub fn tag(&self) -> &str {
        match self {
            Self::Add(t) | Self::Remove(t) | Self::Toggle(t) => t,
        }
    }
}

pub type TagChanges = SmallVec<[TagChange; 8]>;

/// Parse a tag edit such as `+work -inbox !flagged todo`. Tokens are
/// separated by whitespace or commas; a bare tag is added.
pub fn parse_tag_changes(input: &str) -> Result<TagChanges> {
    let mut ret = TagChanges::new();
    for token in input
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|t| !t.is_empty())
    {
        let change = if let Some(tag) = token.strip_prefix('+') {
            TagChange::Add(tag.to_string())
        } else if let Some(tag) = token.strip_prefix('-') {
            TagChange::Remove(tag.to_string())
        } else if let Some(tag) = token.strip_prefix('!') {
            TagChange::Toggle(tag.to_string())
        } else {
            TagChange::Add(token.to_string())
        };
        if change.tag().is_empty() {
            log::debug!("ignoring empty tag in {:?}", input);
            continue;
        }
        ret.push(change);
    }
    if ret.is_empty() {
        return Err(Error::new(format!("No tags found in {:?}", input))
            .set_kind(ErrorKind::ValueError));
    }
    Ok(ret)
}

/// Apply `changes` to message `id`, returning its tags afterwards.
pub fn apply_tag_changes(
    db: &mut dyn Database,
    id: &str,
    changes: &[TagChange],
) -> Result<Vec<String>> {
    let message = db.find_message(id)?.ok_or_else(|| {
        Error::new(format!("Message {} is not in the notmuch database", id))
            .set_kind(ErrorKind::NotFound)
    })?;
    let mut tags = message.tags;
    for change in changes {
        let tag = change.tag();
        let present = tags.iter().any(|t| t == tag);
        let add = match change {
            TagChange::Add(_) => true,
            TagChange::Remove(_) => false,
            TagChange::Toggle(_) => !present,
        };
        if add && !present {
            log::trace!("{}: +{}", id, tag);
            db.add_tag(id, tag)?;
            tags.push(tag.to_string());
        } else if !add && present {
            log::trace!("{}: -{}", id, tag);
            db.remove_tag(id, tag)?;
            tags.retain(|t| t != tag);
        }
    }
    tags.sort_unstable();
    Ok(tags)
}

/// Mirror the flag-like tags touched by `changes` onto record `index`, given
/// the `tags` the message ended up with.
pub fn mirror_flags(
    store: &mut HeaderStore,
    index: usize,
    changes: &[TagChange],
    tags: &[String],
    unread_tag: &str,
) {
    let has = |tag: &str| tags.iter().any(|t| t == tag);
    for change in changes {
        match change.tag() {
            t if t == unread_tag => {
                store.set_flag(index, Flag::READ, !has(t));
            }
            t @ REPLIED_TAG => {
                store.set_flag(index, Flag::REPLIED, has(t));
            }
            t @ FLAGGED_TAG => {
                store.set_flag(index, Flag::FLAGGED, has(t));
            }
            _ => {}
        }
    }
}

/// Sync the flag-like tags of message `id` with the maildir flags in the
/// name of `path`: `F` is `flagged`, `R` is `replied` and a missing `S` is
/// unread.
pub fn maildir_flags_to_tags(
    db: &mut dyn Database,
    id: &str,
    path: &Path,
    unread_tag: &str,
) -> Result<Vec<String>> {
    let flags = path.flags();
    let mut changes = TagChanges::new();
    for (tag, set) in [
        (FLAGGED_TAG, flags.contains(Flag::FLAGGED)),
        (REPLIED_TAG, flags.contains(Flag::REPLIED)),
        (unread_tag, !flags.contains(Flag::READ)),
    ] {
        changes.push(if set {
            TagChange::Add(tag.to_string())
        } else {
            TagChange::Remove(tag.to_string())
        });
    }
    apply_tag_changes(db, id, &changes)
}
