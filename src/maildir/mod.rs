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

//! Maildir files behind index-backed mailboxes.
//!
//! Only what the index adapter needs is here: reading and writing the flag
//! suffix of a file name, moving files between `new` and `cur`, and finding
//! a file again after another program renamed it.
//!
//! A maildir file name is `unique[:2,FLAGS]`. The flags are, in order:
//!
//! | letter | flag |
//! |--------|------|
//! | `F` | flagged |
//! | `R` | replied |
//! | `S` | seen |
//! | `T` | trashed |
//!
//! Other letters are carried over untouched when a file is renamed.

use std::path::{Path, PathBuf};

use crate::{
    error::{Error, ErrorKind, Result},
    mailbox::{Flag, MessageRecord},
};

/// The sub-directories of a maildir folder.
pub const SUBDIRS: [&str; 3] = ["cur", "new", "tmp"];

/// Extension trait for [`Path`] for maildir file name calculations.
pub trait MaildirFilePathExt {
    /// Parses the `:2,` filename suffix into a [`Flag`]. Unknown letters are
    /// ignored; a name without the suffix has no flags.
    fn flags(&self) -> Flag;
    /// The path this file should have given `flags`: `cur` if the message
    /// is read or old and `new` otherwise, with the suffix rewritten.
    fn with_flags(&self, flags: Flag) -> Result<PathBuf>;
    /// The file name without the flag suffix.
    fn unique_name(&self) -> Option<String>;
    /// The maildir folder a file belongs to, if it is inside `cur`, `new` or
    /// `tmp`.
    fn maildir_folder(&self) -> Option<PathBuf>;
    /// Checks if file is placed in a `new` directory.
    fn is_in_new(&self) -> bool;
}

/// The flag suffix for `flags`, empty if none is set.
pub fn flag_suffix(flags: Flag) -> String {
    info_suffix(flag_chars(flags).collect())
}

fn flag_chars(flags: Flag) -> impl Iterator<Item = char> {
    [
        (Flag::FLAGGED, 'F'),
        (Flag::REPLIED, 'R'),
        (Flag::READ, 'S'),
        (Flag::DELETED, 'T'),
    ]
    .into_iter()
    .filter(move |(f, _)| flags.contains(*f))
    .map(|(_, c)| c)
}

/// `:2,` followed by `letters` in ASCII order, or nothing if there are none.
fn info_suffix(mut letters: Vec<char>) -> String {
    letters.sort_unstable();
    letters.dedup();
    if letters.is_empty() {
        return String::new();
    }
    format!(":2,{}", letters.into_iter().collect::<String>())
}

/// Info letters of `path` that do not map to a [`Flag`], such as `D`raft or
/// `P`assed.
fn foreign_flag_chars(path: &Path) -> Vec<char> {
    let Some(name) = path.file_name().map(|n| n.to_string_lossy()) else {
        return vec![];
    };
    let Some(idx) = name.rfind(":2,") else {
        return vec![];
    };
    name[idx + 3..]
        .chars()
        .filter(|c| !matches!(c, 'F' | 'R' | 'S' | 'T'))
        .collect()
}

impl MaildirFilePathExt for Path {
    fn flags(&self) -> Flag {
        let mut flag = Flag::empty();
        let Some(name) = self.file_name().map(|n| n.to_string_lossy()) else {
            return flag;
        };
        let Some(idx) = name.rfind(":2,") else {
            return flag;
        };
        for f in name[idx + 3..].chars() {
            match f {
                'F' => flag |= Flag::FLAGGED,
                'R' => flag |= Flag::REPLIED,
                'S' => flag |= Flag::READ,
                'T' => flag |= Flag::DELETED,
                _ => {
                    log::trace!("unknown maildir flag {:?} in {}", f, self.display());
                }
            }
        }
        flag
    }

    fn with_flags(&self, flags: Flag) -> Result<PathBuf> {
        let unique = self.unique_name().ok_or_else(|| {
            Error::new(format!("Could not get filename of `{}`", self.display()))
                .set_kind(ErrorKind::ValueError)
        })?;
        let folder = self
            .maildir_folder()
            .or_else(|| self.parent().and_then(Path::parent).map(Path::to_path_buf))
            .ok_or_else(|| {
                Error::new(format!("`{}` is not inside a maildir", self.display()))
                    .set_kind(ErrorKind::ValueError)
            })?;
        let subdir = if flags.intersects(Flag::READ | Flag::OLD) {
            "cur"
        } else {
            "new"
        };
        let mut letters = foreign_flag_chars(self);
        letters.extend(flag_chars(flags));
        Ok(folder
            .join(subdir)
            .join(format!("{}{}", unique, info_suffix(letters))))
    }

    fn unique_name(&self) -> Option<String> {
        let name = self.file_name()?.to_string_lossy();
        Some(match name.find(':') {
            Some(idx) => name[..idx].to_string(),
            None => name.into_owned(),
        })
    }

    fn maildir_folder(&self) -> Option<PathBuf> {
        let dir = self.parent()?;
        let subdir = dir.file_name()?.to_str()?;
        if !SUBDIRS.contains(&subdir) {
            return None;
        }
        dir.parent().map(Path::to_path_buf)
    }

    fn is_in_new(&self) -> bool {
        self.parent()
            .and_then(Path::file_name)
            .map_or(false, |n| n == "new")
    }
}

/// Look for the file that was at `path` inside `folder`: any file in `cur`,
/// `new` or `tmp` with the same unique name.
pub fn find_message(folder: &Path, path: &Path) -> Option<PathBuf> {
    let unique = path.unique_name()?;
    for subdir in SUBDIRS {
        let Ok(entries) = std::fs::read_dir(folder.join(subdir)) else {
            continue;
        };
        for entry in entries.flatten() {
            let candidate = entry.path();
            if candidate.unique_name().as_deref() == Some(unique.as_str()) {
                return Some(candidate);
            }
        }
    }
    None
}

/// Rename the file at `path` to match `flags`. Returns the new path, which
/// is `path` itself if nothing had to change.
pub fn rename_with_flags(path: &Path, flags: Flag) -> Result<PathBuf> {
    let new_path = path.with_flags(flags)?;
    if new_path != path {
        std::fs::rename(path, &new_path).map_err(|err| {
            Error::from(err)
                .set_summary(format!(
                    "Could not rename {} to {}",
                    path.display(),
                    new_path.display()
                ))
                .set_related_path(path)
        })?;
        log::trace!("renamed {} -> {}", path.display(), new_path.display());
    }
    Ok(new_path)
}

/// Writes the state of a message back to its maildir file.
pub trait MaildirWriter: Send + Sync + std::fmt::Debug {
    /// Make the file at `path` reflect `record`. Returns where the file is
    /// afterwards, or `None` if the message was removed.
    fn sync_message(&self, path: &Path, record: &MessageRecord) -> Result<Option<PathBuf>>;
}

/// The default [`MaildirWriter`]: deleted messages are unlinked and changed
/// ones renamed to carry their flags.
#[derive(Clone, Copy, Debug, Default)]
pub struct MaildirSync;

impl MaildirWriter for MaildirSync {
    fn sync_message(&self, path: &Path, record: &MessageRecord) -> Result<Option<PathBuf>> {
        if record.is_deleted() {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    log::debug!("{} was already removed", path.display());
                }
                Err(err) => {
                    return Err(Error::from(err)
                        .set_summary(format!("Could not remove {}", path.display()))
                        .set_related_path(path));
                }
            }
            return Ok(None);
        }
        if !record.flags.intersects(Flag::CHANGED | Flag::ATTACH_DEL) {
            return Ok(Some(path.to_path_buf()));
        }
        rename_with_flags(path, record.flags & !Flag::CHANGED).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_maildir_flags_from_filename() {
        assert_eq!(
            Path::new("/m/cur/1234.abc:2,FRS").flags(),
            Flag::FLAGGED | Flag::REPLIED | Flag::READ
        );
        assert_eq!(Path::new("/m/cur/1234.abc:2,").flags(), Flag::empty());
        assert_eq!(Path::new("/m/new/1234.abc").flags(), Flag::empty());
        assert_eq!(Path::new("/m/cur/1234.abc:2,PT").flags(), Flag::DELETED);
    }

    #[test]
    fn test_maildir_with_flags() {
        let path = Path::new("/m/new/1234.abc");
        assert_eq!(
            path.with_flags(Flag::READ | Flag::FLAGGED).unwrap(),
            PathBuf::from("/m/cur/1234.abc:2,FS")
        );
        assert_eq!(
            Path::new("/m/cur/1234.abc:2,S").with_flags(Flag::empty()).unwrap(),
            PathBuf::from("/m/new/1234.abc")
        );
        assert_eq!(
            Path::new("/m/cur/1234.abc:2,S").with_flags(Flag::OLD).unwrap(),
            PathBuf::from("/m/cur/1234.abc")
        );
        assert_eq!(path.maildir_folder(), Some(PathBuf::from("/m")));
        assert!(path.is_in_new());
        assert_eq!(flag_suffix(Flag::DELETED | Flag::FLAGGED), ":2,FT");
        assert_eq!(Path::new("/m/other/x").maildir_folder(), None);
    }

    #[test]
    fn test_maildir_with_flags_keeps_unknown_letters() {
        assert_eq!(
            Path::new("/m/cur/1234.abc:2,DPS")
                .with_flags(Flag::READ | Flag::FLAGGED)
                .unwrap(),
            PathBuf::from("/m/cur/1234.abc:2,DFPS")
        );
        assert_eq!(
            Path::new("/m/cur/1234.abc:2,PRSa")
                .with_flags(Flag::OLD)
                .unwrap(),
            PathBuf::from("/m/cur/1234.abc:2,Pa")
        );
        assert_eq!(
            Path::new("/m/new/1234.abc:2,D").with_flags(Flag::empty()).unwrap(),
            PathBuf::from("/m/new/1234.abc:2,D")
        );
    }

    #[test]
    fn test_maildir_sync_keeps_unknown_letters() {
        let dir = tempfile::tempdir().unwrap();
        for subdir in SUBDIRS {
            std::fs::create_dir(dir.path().join(subdir)).unwrap();
        }
        let path = dir.path().join("cur").join("1.host:2,P");
        std::fs::write(&path, b"Subject: x\n\nbody\n").unwrap();
        let mut record = MessageRecord::new(0);
        record.flags = Flag::READ | Flag::REPLIED | Flag::CHANGED;
        let new_path = MaildirSync
            .sync_message(&path, &record)
            .unwrap()
            .unwrap();
        assert_eq!(new_path, dir.path().join("cur").join("1.host:2,PRS"));
        assert!(new_path.exists());
        assert!(!path.exists());
    }

    #[test]
    fn test_maildir_sync_and_find() {
        let dir = tempfile::tempdir().unwrap();
        for subdir in SUBDIRS {
            std::fs::create_dir(dir.path().join(subdir)).unwrap();
        }
        let path = dir.path().join("new").join("1.host");
        std::fs::write(&path, b"Subject: x\n\nbody\n").unwrap();

        let mut record = MessageRecord::new(0);
        record.flags = Flag::READ | Flag::CHANGED;
        let new_path = MaildirSync
            .sync_message(&path, &record)
            .unwrap()
            .unwrap();
        assert_eq!(new_path, dir.path().join("cur").join("1.host:2,S"));
        assert!(new_path.exists());
        assert!(!path.exists());
        assert_eq!(find_message(dir.path(), &path), Some(new_path.clone()));

        record.flags = Flag::READ;
        assert_eq!(
            MaildirSync.sync_message(&new_path, &record).unwrap(),
            Some(new_path.clone())
        );

        record.flags |= Flag::DELETED;
        assert_eq!(MaildirSync.sync_message(&new_path, &record).unwrap(), None);
        assert!(!new_path.exists());
        assert_eq!(find_message(dir.path(), &path), None);
    }
}
