//
// meli
//
// Copyright 2025 Emmanouil Pitsidianakis <manos@pitsidianak.is>
//
// This file is part of meli.
//
// meli is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// meli is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with meli. If not, see <http://www.gnu.org/licenses/>.
//
// SPDX-License-Identifier: EUPL-1.2 OR GPL-3.0-or-later

use rusty_fork::rusty_fork_test;

rusty_fork_test! {
    #[test]
    fn test_notmuch_query_window() {
        tests::run_query_window();
    }

    #[test]
    fn test_notmuch_tags_and_flags() {
        tests::run_tags_and_flags();
    }

    #[test]
    fn test_notmuch_check() {
        tests::run_check();
    }

    #[test]
    fn test_notmuch_relocated_file() {
        tests::run_relocated_file();
    }

    #[test]
    fn test_notmuch_duplicates() {
        tests::run_duplicates();
    }

    #[test]
    fn test_notmuch_busy_database() {
        tests::run_busy_database();
    }

    #[test]
    fn test_notmuch_record_and_count() {
        tests::run_record_and_count();
    }
}

mod tests {
    use std::{
        path::{Path, PathBuf},
        sync::Arc,
    };

    use chrono::{DateTime, Utc};
    use mailfold::{
        error::ErrorKind,
        mailbox::{self, MailboxOps, MailboxType},
        notmuch::{self, Database, IndexBackend, MemoryIndex, NotmuchMailbox, OpenMode},
        utils::{
            datetime,
            interrupt::Interrupt,
            logging::{LogLevel, StderrLogger},
        },
        AccountSettings, CheckStatus, Flag, MxContext, SyncStatus,
    };
    use tempfile::TempDir;

    const DAY: u64 = 24 * 60 * 60;

    struct Fixture {
        _dir: TempDir,
        root: PathBuf,
        index: MemoryIndex,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            std::env::set_var("XDG_DATA_HOME", dir.path());
            let root = dir.path().join("mail");
            for folder in ["inbox", "archive"] {
                for sub in ["cur", "new", "tmp"] {
                    std::fs::create_dir_all(root.join(folder).join(sub)).unwrap();
                }
            }
            Self {
                _dir: dir,
                root,
                index: MemoryIndex::new(),
            }
        }

        fn db(&self) -> Box<dyn Database> {
            self.index.open(&self.root, OpenMode::ReadWrite).unwrap()
        }

        /// Write a message `days` old to `rel` and index it with `tags`.
        fn deliver(&self, rel: &str, id: &str, days: u64, tags: &[&str]) -> PathBuf {
            let path = self.root.join(rel);
            let date = DateTime::<Utc>::from_timestamp((datetime::now() - days * DAY) as i64, 0)
                .unwrap()
                .to_rfc2822();
            std::fs::write(
                &path,
                format!(
                    "From: sender@example.com\nSubject: about {id}\nMessage-ID: <{id}>\nDate: \
                     {date}\n\nbody of {id}\n"
                ),
            )
            .unwrap();
            let mut db = self.db();
            let (msg, _) = db.index_file(&path).unwrap();
            for t in tags {
                db.add_tag(&msg.id, t).unwrap();
            }
            path
        }

        fn ctx(&self, extra: &[(&str, &str)]) -> MxContext {
            let account = AccountSettings {
                name: "test".to_string(),
                root_mailbox: self.root.display().to_string(),
                format: "notmuch".to_string(),
                read_only: false,
                extra: extra
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            };
            MxContext::new(account)
                .with_interrupt(Interrupt::new())
                .with_index_backend(Arc::new(self.index.clone()))
        }

        fn tags(&self, id: &str) -> Vec<String> {
            self.db().find_message(id).unwrap().unwrap().tags
        }
    }

    fn ids(mailbox: &dyn MailboxOps) -> Vec<String> {
        mailbox
            .store()
            .iter()
            .map(|r| r.index_record.as_ref().unwrap().virtual_id.clone())
            .collect()
    }

    fn backing_path(mailbox: &dyn MailboxOps, i: usize) -> PathBuf {
        mailbox.store()[i]
            .index_record
            .as_ref()
            .unwrap()
            .backing_path
            .clone()
    }

    pub(crate) fn run_query_window() {
        let mut _logger = StderrLogger::new(LogLevel::TRACE);
        let f = Fixture::new();
        f.deliver("inbox/cur/1.host:2,S", "recent@x", 2, &["inbox"]);
        f.deliver("inbox/cur/2.host:2,S", "older@x", 10, &["inbox"]);
        f.deliver("inbox/cur/3.host:2,S", "ancient@x", 20, &["inbox"]);

        let ctx = f.ctx(&[
            ("nm_query_window_duration", "1"),
            ("nm_query_window_timebase", "week"),
        ]);
        let mut mailbox = NotmuchMailbox::open("notmuch://?query=tag:inbox", ctx.clone()).unwrap();
        assert_eq!(ids(&mailbox), vec!["recent@x"]);
        assert_eq!(mailbox.window().position, 0);

        mailbox.query_window_backward().unwrap();
        assert_eq!(ids(&mailbox), vec!["older@x"]);
        mailbox.query_window_backward().unwrap();
        assert_eq!(ids(&mailbox), vec!["ancient@x"]);
        assert_eq!(mailbox.window().position, 2);
        mailbox.query_window_forward().unwrap();
        mailbox.query_window_forward().unwrap();
        mailbox.query_window_forward().unwrap();
        assert_eq!(mailbox.window().position, 0);
        assert_eq!(ids(&mailbox), vec!["recent@x"]);

        // A session can carry the window over.
        let mut window = mailbox.window().clone();
        window.backward();
        let mailbox =
            NotmuchMailbox::open_with_window("notmuch://?query=tag:inbox", ctx.clone(), window)
                .unwrap();
        assert_eq!(ids(&mailbox), vec!["older@x"]);

        // Queries restricting the date themselves are left alone.
        let mailbox =
            NotmuchMailbox::open("notmuch://?query=tag:inbox and date:3w..", ctx).unwrap();
        assert_eq!(ids(&mailbox), vec!["recent@x", "older@x", "ancient@x"]);
    }

    pub(crate) fn run_tags_and_flags() {
        let mut _logger = StderrLogger::new(LogLevel::TRACE);
        let f = Fixture::new();
        let path = f.deliver("inbox/new/1.host", "m1@x", 1, &["inbox", "unread"]);

        let ctx = f.ctx(&[]);
        let mut mailbox = mailbox::open("notmuch://?query=tag:inbox", &ctx).unwrap();
        assert_eq!(mailbox.kind(), MailboxType::Notmuch);
        assert!(mailbox.store()[0].is_new());

        mailbox.tags_commit(0, "-unread +flagged +work").unwrap();
        assert_eq!(f.tags("m1@x"), vec!["flagged", "inbox", "work"]);
        let record = &mailbox.store()[0];
        assert!(record.flags.contains(Flag::READ | Flag::FLAGGED | Flag::CHANGED));
        assert_eq!(
            record.index_record.as_ref().unwrap().tags,
            vec!["flagged", "inbox", "work"]
        );
        assert!(mailbox.store().changed);
        assert_eq!(
            mailbox.tags_commit(0, " ").unwrap_err().kind,
            ErrorKind::ValueError
        );

        // The file is renamed to carry the flags and the index follows.
        assert_eq!(mailbox.sync().unwrap(), SyncStatus::Committed);
        let renamed = f.root.join("inbox/cur/1.host:2,FS");
        assert!(!path.exists());
        assert!(renamed.exists());
        assert_eq!(backing_path(mailbox.as_ref(), 0), renamed);
        assert!(!mailbox.store()[0].is_changed());
        assert!(!mailbox.store().changed);
        let db = f.index.open(&f.root, OpenMode::ReadOnly).unwrap();
        assert_eq!(
            db.find_message_by_filename(&renamed).unwrap().unwrap().id,
            "m1@x"
        );
        assert!(db.find_message_by_filename(&path).unwrap().is_none());
        drop(db);
        assert_eq!(mailbox.check().unwrap(), CheckStatus::Unchanged);

        let msg = mailbox.msg_open(0).unwrap();
        assert_eq!(msg.path.as_deref(), Some(renamed.as_path()));
        assert!(msg.bytes().unwrap().ends_with(b"body of m1@x\n"));

        // Replying is mirrored both ways.
        mailbox.tags_commit(0, "+replied").unwrap();
        assert!(mailbox.store()[0].flags.contains(Flag::REPLIED));
        mailbox.sync().unwrap();
        assert!(f.root.join("inbox/cur/1.host:2,FRS").exists());
        assert_eq!(
            f.tags("m1@x"),
            vec!["flagged", "inbox", "replied", "work"]
        );

        assert_eq!(
            mailbox.msg_open_new(&Default::default()).unwrap_err().kind,
            ErrorKind::NotSupported
        );
        assert_eq!(
            MailboxType::Notmuch
                .open_append("notmuch://?query=*", &ctx, false)
                .unwrap_err()
                .kind,
            ErrorKind::NotSupported
        );
        mailbox.close().unwrap();
    }

    pub(crate) fn run_check() {
        let mut _logger = StderrLogger::new(LogLevel::TRACE);
        let f = Fixture::new();
        f.deliver("inbox/cur/1.host:2,S", "a@x", 3, &["inbox"]);
        f.deliver("inbox/cur/2.host:2,S", "b@x", 2, &["inbox"]);
        f.deliver("archive/cur/3.host:2,S", "c@x", 1, &["archive"]);
        f.deliver("inbox/new/4.host", "spam@x", 1, &["inbox", "spam"]);

        let ctx = f.ctx(&[("nm_exclude_tags", "spam")]);
        let mut mailbox = NotmuchMailbox::open("notmuch://?query=tag:inbox", ctx).unwrap();
        assert_eq!(ids(&mailbox), vec!["b@x", "a@x"]);
        assert_eq!(mailbox.check().unwrap(), CheckStatus::Unchanged);

        // Tags changed elsewhere.
        f.db().add_tag("a@x", "work").unwrap();
        assert_eq!(mailbox.check().unwrap(), CheckStatus::Flags);
        assert_eq!(
            mailbox.store()[1].index_record.as_ref().unwrap().tags,
            vec!["inbox", "work"]
        );

        // A new match.
        f.db().add_tag("c@x", "inbox").unwrap();
        assert_eq!(mailbox.check().unwrap(), CheckStatus::NewMail);
        assert_eq!(ids(&mailbox), vec!["b@x", "a@x", "c@x"]);

        // A message that no longer matches is hidden.
        f.db().remove_tag("b@x", "inbox").unwrap();
        assert_eq!(mailbox.check().unwrap(), CheckStatus::Reopened);
        assert_eq!(ids(&mailbox), vec!["a@x", "c@x"]);
        assert_eq!(mailbox.store()[1].index, 1);
        assert!(f.root.join("inbox/cur/2.host:2,S").exists());
        assert!(mailbox.message_is_still_queried(0).unwrap());

        f.db().remove_tag("a@x", "inbox").unwrap();
        assert!(!mailbox.message_is_still_queried(0).unwrap());
        assert_eq!(mailbox.store().len(), 2);
    }

    pub(crate) fn run_relocated_file() {
        let mut _logger = StderrLogger::new(LogLevel::TRACE);
        let f = Fixture::new();
        let path = f.deliver("inbox/new/1.host", "m1@x", 1, &["inbox"]);

        let mut mailbox = NotmuchMailbox::open("notmuch://?query=tag:inbox", f.ctx(&[])).unwrap();
        // Another client marks the message read without telling the index.
        let moved = f.root.join("inbox/cur/1.host:2,S");
        std::fs::rename(&path, &moved).unwrap();

        let msg = mailbox.msg_open(0).unwrap();
        assert_eq!(msg.path.as_deref(), Some(moved.as_path()));
        let ir = mailbox.store()[0].index_record.clone().unwrap();
        assert_eq!(ir.backing_path, moved);
        assert_eq!(ir.old_backing_path.as_deref(), Some(path.as_path()));

        assert_eq!(mailbox.sync().unwrap(), SyncStatus::Committed);
        let ir = mailbox.store()[0].index_record.clone().unwrap();
        assert_eq!(ir.old_backing_path, None);
        let db = f.db();
        assert_eq!(
            db.find_message_by_filename(&moved).unwrap().unwrap().id,
            "m1@x"
        );
        assert!(db.find_message_by_filename(&path).unwrap().is_none());
        assert_eq!(db.find_message("m1@x").unwrap().unwrap().filenames, vec![moved]);
    }

    fn both(f: &Fixture) -> (PathBuf, PathBuf) {
        let first = f.deliver("inbox/cur/1.host:2,S", "dup@x", 1, &["inbox"]);
        let second = f.root.join("archive/cur/2.host:2,S");
        std::fs::copy(&first, &second).unwrap();
        f.db().index_file(&second).unwrap();
        (first, second)
    }

    fn flags_of(path: &Path) -> String {
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        name.rsplit_once(":2,").map(|(_, f)| f.to_string()).unwrap_or_default()
    }

    pub(crate) fn run_duplicates() {
        let mut _logger = StderrLogger::new(LogLevel::TRACE);
        let f = Fixture::new();
        let (first, second) = both(&f);
        assert_eq!(
            f.db().find_message("dup@x").unwrap().unwrap().filenames,
            vec![first.clone(), second.clone()]
        );

        // Flag changes reach every copy.
        let mut mailbox = NotmuchMailbox::open("notmuch://?query=*", f.ctx(&[])).unwrap();
        assert_eq!(ids(&mailbox), vec!["dup@x"]);
        assert_eq!(backing_path(&mailbox, 0), second);
        mailbox.store_mut().set_flag(0, Flag::FLAGGED, true);
        assert_eq!(mailbox.sync().unwrap(), SyncStatus::Committed);
        let filenames = f.db().find_message("dup@x").unwrap().unwrap().filenames;
        assert_eq!(filenames.len(), 2);
        for name in &filenames {
            assert!(name.exists(), "{}", name.display());
            assert_eq!(flags_of(name), "FS");
        }
        assert!(!first.exists());
        assert!(!second.exists());
        assert!(f.tags("dup@x").contains(&"flagged".to_string()));

        // Deleting removes them all.
        mailbox.store_mut().set_flag(0, Flag::DELETED, true);
        assert_eq!(mailbox.sync().unwrap(), SyncStatus::Committed);
        assert!(mailbox.store().is_empty());
        for name in &filenames {
            assert!(!name.exists(), "{}", name.display());
        }
        assert!(f.db().find_message("dup@x").unwrap().is_none());
    }

    pub(crate) fn run_busy_database() {
        let mut _logger = StderrLogger::new(LogLevel::TRACE);
        let f = Fixture::new();
        f.deliver("inbox/cur/1.host:2,S", "m1@x", 1, &["inbox"]);

        // Busy for a second, then free.
        f.index.set_busy(2);
        let mailbox =
            NotmuchMailbox::open("notmuch://?query=tag:inbox", f.ctx(&[("nm_open_timeout", "5")]))
                .unwrap();
        assert_eq!(ids(&mailbox), vec!["m1@x"]);

        // Busy for longer than we are willing to wait.
        f.index.set_busy(100);
        let err = NotmuchMailbox::open(
            "notmuch://?query=tag:inbox",
            f.ctx(&[("nm_open_timeout", "1")]),
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::WouldBlock);
        assert!(err.summary.contains("Cannot open notmuch database"));
        f.index.set_busy(0);

        // A writer holding the database blocks other writers, not readers.
        let mut mailbox =
            NotmuchMailbox::open("notmuch://?query=tag:inbox", f.ctx(&[("nm_open_timeout", "0")]))
                .unwrap();
        let writer = f.db();
        assert_eq!(
            mailbox.tags_commit(0, "+work").unwrap_err().kind,
            ErrorKind::WouldBlock
        );
        assert_eq!(mailbox.get_all_tags().unwrap(), vec!["inbox"]);
        drop(writer);
        mailbox.tags_commit(0, "+work").unwrap();
        assert_eq!(f.tags("m1@x"), vec!["inbox", "work"]);
    }

    pub(crate) fn run_record_and_count() {
        let mut _logger = StderrLogger::new(LogLevel::TRACE);
        let f = Fixture::new();
        f.deliver("inbox/cur/1.host:2,S", "a@x", 2, &["inbox"]);
        f.deliver("inbox/new/2.host", "b@x", 1, &["inbox", "unread"]);

        let ctx = f.ctx(&[("nm_record_tags", "sent")]);
        let uri = "notmuch://?query=tag:inbox";
        assert_eq!(notmuch::count(uri, &ctx).unwrap(), (2, 1));

        let mut mailbox = NotmuchMailbox::open(uri, ctx.clone()).unwrap();
        let copy = f.root.join("inbox/cur/3.host:2,RS");
        std::fs::write(
            &copy,
            "From: me@example.com\nSubject: reply\nMessage-ID: <c@x>\nIn-Reply-To: \
             <a@x>\n\nthanks\n",
        )
        .unwrap();
        mailbox.record_message(&copy, Some("+inbox")).unwrap();
        assert_eq!(f.tags("c@x"), vec!["inbox", "replied", "sent"]);
        // Recording the same file twice changes nothing.
        mailbox.record_message(&copy, Some("+other")).unwrap();
        assert_eq!(f.tags("c@x"), vec!["inbox", "replied", "sent"]);

        assert_eq!(notmuch::count(uri, &ctx).unwrap(), (3, 1));
        assert_eq!(
            notmuch::count(&format!("{uri}&limit=1"), &ctx).unwrap(),
            (1, 1)
        );
        assert_eq!(mailbox.check().unwrap(), CheckStatus::NewMail);
        assert_eq!(mailbox.store().len(), 3);

        // The reply's thread reaches back to the message it answers.
        let threads = NotmuchMailbox::open("notmuch://?query=tag:sent&type=threads", ctx).unwrap();
        assert_eq!(ids(&threads), vec!["a@x", "c@x"]);
        assert_eq!(
            mailbox.get_all_tags().unwrap(),
            vec!["inbox", "replied", "sent", "unread"]
        );
    }
}
