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
    fn test_mbox_open_and_check() {
        tests::run_open_and_check();
    }

    #[test]
    fn test_mbox_sync_deletes_and_flags() {
        tests::run_sync_deletes_and_flags();
    }

    #[test]
    fn test_mbox_external_changes() {
        tests::run_external_changes();
    }

    #[test]
    fn test_mbox_sync_rollback() {
        tests::run_sync_rollback();
    }

    #[test]
    fn test_mbox_sync_locked_elsewhere() {
        tests::run_sync_locked_elsewhere();
    }

    #[test]
    fn test_mbox_sync_tmp_file_failure() {
        tests::run_sync_tmp_file_failure();
    }

    #[test]
    fn test_mbox_open_locked_elsewhere() {
        tests::run_open_locked_elsewhere();
    }

    #[test]
    fn test_mbox_sync_data_preserved() {
        tests::run_sync_data_preserved();
    }

    #[test]
    fn test_mbox_append() {
        tests::run_append();
    }

    #[test]
    fn test_mmdf_round_trip() {
        tests::run_mmdf_round_trip();
    }
}

mod tests {
    use std::{
        fs::{File, OpenOptions},
        io::{Seek, SeekFrom, Write},
        path::{Path, PathBuf},
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
    };

    use mailfold::{
        error::ErrorKind,
        mailbox::{self, MailboxOps, NewMessage},
        mbox::{MboxFormat, MboxMailbox, MessageCopier, StatusCopier},
        utils::{
            interrupt::Interrupt,
            lock::{FileLockKind, FileLockOptions, FileLockTrait},
            logging::{LogLevel, StderrLogger},
        },
        AccountSettings, CheckStatus, Flag, MessageRecord, MxContext, SyncStatus,
    };
    use tempfile::TempDir;

    fn message(i: usize) -> String {
        format!(
            "From user{i}@example.com Fri Jun 23 02:5{i}:55 2000\nFrom: user{i}@example.com\nSubject: \
             message {i}\nMessage-ID: <{i}@example.com>\n\nbody {i}\n\n"
        )
    }

    struct Fixture {
        dir: TempDir,
        path: PathBuf,
    }

    impl Fixture {
        fn new(contents: &str) -> Self {
            Self::named("mbox", contents)
        }

        fn named(name: &str, contents: &str) -> Self {
            let dir = TempDir::new().unwrap();
            std::env::set_var("XDG_DATA_HOME", dir.path());
            let path = dir.path().join(name);
            std::fs::write(&path, contents).unwrap();
            Self { dir, path }
        }

        fn ctx(&self, extra: &[(&str, &str)]) -> MxContext {
            let account = AccountSettings {
                name: "test".to_string(),
                root_mailbox: self.dir.path().display().to_string(),
                format: "mbox".to_string(),
                read_only: false,
                extra: extra
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            };
            MxContext::new(account).with_interrupt(Interrupt::new())
        }

        fn open(&self) -> MboxMailbox {
            MboxMailbox::open(&self.path, MboxFormat::Mbox, self.ctx(&[])).unwrap()
        }

        fn contents(&self) -> String {
            String::from_utf8(std::fs::read(&self.path).unwrap()).unwrap()
        }

        /// Every file in the directory apart from the mailbox.
        fn leftovers(&self) -> Vec<PathBuf> {
            std::fs::read_dir(self.dir.path())
                .unwrap()
                .map(|e| e.unwrap().path())
                .filter(|p| p != &self.path && p.is_file())
                .collect()
        }
    }

    fn subjects(mailbox: &dyn MailboxOps) -> Vec<String> {
        mailbox
            .store()
            .iter()
            .map(|r| r.header.subject.clone().unwrap_or_default())
            .collect()
    }

    fn offsets(mailbox: &dyn MailboxOps) -> Vec<(u64, u64, Option<u64>)> {
        mailbox
            .store()
            .iter()
            .map(|r| (r.offset, r.body_offset, r.body_length))
            .collect()
    }

    pub(crate) fn run_open_and_check() {
        let mut _logger = StderrLogger::new(LogLevel::TRACE);
        let contents = format!(
            "{}From liar@example.com Fri Jun 23 02:59:55 2000\nSubject: liar\nContent-Length: \
             4096\n\nshort\n\n{}",
            message(0),
            message(1)
        );
        let f = Fixture::new(&contents);
        let ctx = f.ctx(&[]);
        let mut mailbox = mailbox::open(&f.path.display().to_string(), &ctx).unwrap();
        assert_eq!(mailbox.kind(), mailbox::MailboxType::Mbox);
        assert_eq!(
            subjects(mailbox.as_ref()),
            vec!["message 0", "liar", "message 1"]
        );
        assert_eq!(mailbox.store().counters.count, 3);
        assert_eq!(mailbox.store().counters.new, 3);
        assert!(!mailbox.is_readonly());
        assert_eq!(mailbox.msg_padding_size(), 1);

        let msg = mailbox.msg_open(1).unwrap();
        assert_eq!(
            msg.bytes().unwrap(),
            b"From liar@example.com Fri Jun 23 02:59:55 2000\nSubject: liar\nContent-Length: \
              4096\n\nshort\n"
        );

        // Nothing happened, nothing to report; twice.
        assert_eq!(mailbox.check().unwrap(), CheckStatus::Unchanged);
        assert_eq!(mailbox.check().unwrap(), CheckStatus::Unchanged);
        assert_eq!(f.contents(), contents);
        mailbox.close().unwrap();
    }

    pub(crate) fn run_sync_deletes_and_flags() {
        let mut _logger = StderrLogger::new(LogLevel::TRACE);
        let f = Fixture::new(&format!("{}{}{}", message(0), message(1), message(2)));
        let mut mailbox = f.open();

        // Flag changes only.
        assert!(mailbox.store_mut().set_flag(1, Flag::READ, true));
        assert!(mailbox.store_mut().set_flag(1, Flag::FLAGGED, true));
        assert!(mailbox.store().changed);
        assert_eq!(mailbox.sync().unwrap(), SyncStatus::Committed);
        assert!(!mailbox.store().changed);
        assert!(!mailbox.store()[1].is_changed());
        assert!(f.contents().contains(
            "Message-ID: <1@example.com>\nStatus: RO\nX-Status: F\n\nbody 1\n\nFrom user2"
        ));
        assert!(f.contents().starts_with(&message(0)));
        assert_eq!(mailbox.check().unwrap(), CheckStatus::Unchanged);
        let body = mailbox.msg_open(2).unwrap();
        assert!(body.bytes().unwrap().starts_with(b"From user2@example.com"));

        // A new session reads the flags back from the file.
        let reopened = f.open();
        assert_eq!(
            reopened.store()[1].flags,
            Flag::READ | Flag::OLD | Flag::FLAGGED
        );
        drop(reopened);

        // Deleting two out of three.
        mailbox.store_mut().set_flag(0, Flag::DELETED, true);
        mailbox.store_mut().set_flag(2, Flag::DELETED, true);
        assert_eq!(mailbox.store().counters.deleted, 2);
        assert_eq!(mailbox.sync().unwrap(), SyncStatus::Committed);
        assert_eq!(subjects(&mailbox), vec!["message 1"]);
        assert_eq!(mailbox.store()[0].offset, 0);
        assert_eq!(mailbox.store()[0].index, 0);
        assert_eq!(mailbox.store().counters.deleted, 0);
        assert!(f.contents().starts_with("From user1@example.com"));
        assert!(f.contents().ends_with("body 1\n\n"));
        assert_eq!(f.contents().matches("\nFrom ").count(), 0);
        assert!(f.leftovers().is_empty());
        assert_eq!(mailbox.check().unwrap(), CheckStatus::Unchanged);
        assert_eq!(subjects(&f.open()), vec!["message 1"]);
    }

    pub(crate) fn run_external_changes() {
        let mut _logger = StderrLogger::new(LogLevel::TRACE);
        let f = Fixture::new(&format!("{}{}", message(0), message(1)));
        let mut mailbox = f.open();

        // Delivery at the end of the file.
        OpenOptions::new()
            .append(true)
            .open(&f.path)
            .unwrap()
            .write_all(message(2).as_bytes())
            .unwrap();
        assert_eq!(mailbox.check().unwrap(), CheckStatus::NewMail);
        assert_eq!(
            subjects(&mailbox),
            vec!["message 0", "message 1", "message 2"]
        );
        assert_eq!(mailbox.check().unwrap(), CheckStatus::Unchanged);

        // Someone else removes a message: local changes survive the reparse.
        mailbox.store_mut().set_flag(0, Flag::FLAGGED, true);
        mailbox.store_mut().set_flag(2, Flag::DELETED, true);
        std::fs::write(&f.path, format!("{}{}", message(0), message(2))).unwrap();
        assert_eq!(mailbox.check().unwrap(), CheckStatus::Reopened);
        assert_eq!(subjects(&mailbox), vec!["message 0", "message 2"]);
        assert!(mailbox.store()[0].flags.contains(Flag::FLAGGED));
        assert!(mailbox.store()[0].is_changed());
        assert!(mailbox.store()[1].is_deleted());
        assert_eq!(mailbox.store()[1].index, 1);

        // The sync writes what is left.
        assert_eq!(mailbox.sync().unwrap(), SyncStatus::Committed);
        assert_eq!(subjects(&mailbox), vec!["message 0"]);
        assert!(f.contents().contains("X-Status: F\n"));
        assert!(!f.contents().contains("message 2"));
    }

    /// Fails on the message with the given subject.
    #[derive(Debug)]
    struct FailingCopier(&'static str);

    impl MessageCopier for FailingCopier {
        fn copy_message(
            &self,
            src: &File,
            format: MboxFormat,
            record: &mut MessageRecord,
            dest: &mut dyn Write,
        ) -> mailfold::Result<()> {
            if record.header.subject.as_deref() == Some(self.0) {
                return Err(mailfold::Error::new("No space left on device"));
            }
            StatusCopier.copy_message(src, format, record, dest)
        }
    }

    pub(crate) fn run_sync_rollback() {
        let mut _logger = StderrLogger::new(LogLevel::TRACE);
        let contents = format!("{}{}{}", message(0), message(1), message(2));
        let f = Fixture::new(&contents);
        let ctx = f
            .ctx(&[])
            .with_copier(Arc::new(FailingCopier("message 2")));
        let mut mailbox = MboxMailbox::open(&f.path, MboxFormat::Mbox, ctx).unwrap();
        let before = offsets(&mailbox);

        mailbox.store_mut().set_flag(0, Flag::DELETED, true);
        mailbox.store_mut().set_flag(1, Flag::READ, true);
        let err = mailbox.sync().unwrap_err();
        assert!(err.to_string().contains("No space left on device"));

        // Nothing on disk changed and the session can try again.
        assert_eq!(f.contents(), contents);
        assert!(f.leftovers().is_empty());
        assert_eq!(offsets(&mailbox), before);
        assert!(mailbox.store()[0].is_deleted());
        assert!(mailbox.store()[1].is_changed());
        assert!(mailbox.store().changed);
        assert!(!mailbox.is_closed());
        assert!(!mailbox.is_locked());
        assert_eq!(mailbox.check().unwrap(), CheckStatus::Unchanged);
        assert!(mailbox
            .msg_open(2)
            .unwrap()
            .bytes()
            .unwrap()
            .starts_with(b"From user2"));
    }

    fn lines(mailbox: &dyn MailboxOps) -> Vec<u64> {
        mailbox.store().iter().map(|r| r.line_count).collect()
    }

    pub(crate) fn run_sync_locked_elsewhere() {
        let mut _logger = StderrLogger::new(LogLevel::TRACE);
        let contents = format!("{}{}{}", message(0), message(1), message(2));
        let f = Fixture::new(&contents);
        let mut mailbox = f.open();
        let before = offsets(&mailbox);
        let before_lines = lines(&mailbox);

        mailbox.store_mut().set_flag(0, Flag::DELETED, true);
        mailbox.store_mut().set_flag(1, Flag::READ, true);
        let foreign = File::open(&f.path)
            .unwrap()
            .lock(FileLockKind::Shared, FileLockOptions::once(), &f.path)
            .unwrap();
        let err = mailbox.sync().unwrap_err();
        assert_eq!(err.kind, ErrorKind::WouldBlock);

        assert_eq!(f.contents(), contents);
        assert!(f.leftovers().is_empty());
        assert_eq!(offsets(&mailbox), before);
        assert_eq!(lines(&mailbox), before_lines);
        assert!(mailbox.store()[0].is_deleted());
        assert!(mailbox.store()[1].is_changed());
        assert!(!mailbox.is_closed());
        assert!(!mailbox.is_locked());

        // Once the other holder lets go the same changes go through.
        drop(foreign);
        assert_eq!(mailbox.sync().unwrap(), SyncStatus::Committed);
        assert_eq!(subjects(&mailbox), vec!["message 1", "message 2"]);
        assert!(f.contents().starts_with("From user1"));
    }

    pub(crate) fn run_sync_tmp_file_failure() {
        let mut _logger = StderrLogger::new(LogLevel::TRACE);
        // Long enough that the temporary file's name exceeds NAME_MAX.
        let name = "m".repeat(230);
        let contents = format!("{}{}{}", message(0), message(1), message(2));
        let f = Fixture::named(&name, &contents);
        let mut mailbox = f.open();
        let before = offsets(&mailbox);
        let before_lines = lines(&mailbox);

        mailbox.store_mut().set_flag(1, Flag::DELETED, true);
        mailbox.store_mut().set_flag(2, Flag::FLAGGED, true);
        let err = mailbox.sync().unwrap_err();
        assert!(err.to_string().contains("Could not create temporary file"));

        assert_eq!(f.contents(), contents);
        assert!(f.leftovers().is_empty());
        assert_eq!(offsets(&mailbox), before);
        assert_eq!(lines(&mailbox), before_lines);
        assert!(mailbox.store()[1].is_deleted());
        assert!(mailbox.store()[2].is_changed());
        assert!(mailbox.store().changed);
        assert!(!mailbox.is_closed());
        assert!(!mailbox.is_locked());
        assert_eq!(mailbox.check().unwrap(), CheckStatus::Unchanged);
    }

    pub(crate) fn run_open_locked_elsewhere() {
        let mut _logger = StderrLogger::new(LogLevel::TRACE);
        let f = Fixture::new(&message(0));
        let foreign = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&f.path)
            .unwrap()
            .lock(FileLockKind::Exclusive, FileLockOptions::once(), &f.path)
            .unwrap();
        let err = MboxMailbox::open(&f.path, MboxFormat::Mbox, f.ctx(&[])).unwrap_err();
        assert_eq!(err.kind, ErrorKind::WouldBlock);
        assert_eq!(err.related_path.as_deref(), Some(f.path.as_path()));

        drop(foreign);
        let mailbox = f.open();
        assert!(!mailbox.is_readonly());
        assert_eq!(subjects(&mailbox), vec!["message 0"]);
    }

    /// Overwrites the start of the mailbox while the rewrite is staged, so
    /// that the final boundary check fails.
    #[derive(Debug)]
    struct ClobberingCopier {
        path: PathBuf,
        done: AtomicBool,
    }

    impl MessageCopier for ClobberingCopier {
        fn copy_message(
            &self,
            src: &File,
            format: MboxFormat,
            record: &mut MessageRecord,
            dest: &mut dyn Write,
        ) -> mailfold::Result<()> {
            if !self.done.swap(true, Ordering::SeqCst) {
                let mut file = OpenOptions::new().write(true).open(&self.path)?;
                file.seek(SeekFrom::Start(0))?;
                file.write_all(b"X")?;
            }
            StatusCopier.copy_message(src, format, record, dest)
        }
    }

    fn saved_files(dir: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect()
    }

    pub(crate) fn run_sync_data_preserved() {
        let mut _logger = StderrLogger::new(LogLevel::TRACE);
        let f = Fixture::new(&format!("{}{}{}", message(0), message(1), message(2)));
        let tmpdir = TempDir::new().unwrap();
        let tmp = tmpdir.path().display().to_string();
        let ctx = f
            .ctx(&[("tmpdir", tmp.as_str())])
            .with_copier(Arc::new(ClobberingCopier {
                path: f.path.clone(),
                done: AtomicBool::new(false),
            }));
        let mut mailbox = MboxMailbox::open(&f.path, MboxFormat::Mbox, ctx).unwrap();
        let before = offsets(&mailbox);

        mailbox.store_mut().set_flag(0, Flag::DELETED, true);
        let err = mailbox.sync().unwrap_err();
        assert_eq!(err.kind, ErrorKind::DataPreserved);
        let saved = err.related_path.clone().unwrap();
        assert_eq!(saved_files(tmpdir.path()), vec![saved.clone()]);
        assert_eq!(
            std::fs::read_to_string(&saved).unwrap(),
            format!("{}{}", message(1), message(2))
        );

        // The session is closed, its store still describes the old file.
        assert!(mailbox.is_closed());
        assert_eq!(offsets(&mailbox), before);
        assert_eq!(mailbox.msg_open(0).unwrap_err().kind, ErrorKind::NotFound);
        assert!(f.leftovers().is_empty());
        assert!(f.contents().starts_with("Xrom user0"));
    }

    pub(crate) fn run_append() {
        let mut _logger = StderrLogger::new(LogLevel::TRACE);
        let f = Fixture::new(&message(0));
        let ctx = f.ctx(&[]);
        let mut reader = f.open();

        let path = f.path.display().to_string();
        let kind = mailbox::MailboxType::probe(&path, &ctx).unwrap();
        assert_eq!(kind, mailbox::MailboxType::Mbox);
        let mut appender = kind.open_append(&path, &ctx, false).unwrap();
        let mut msg = appender
            .msg_open_new(&NewMessage {
                sender: Some("dave@example.com".to_string()),
                received: Some(961729015),
            })
            .unwrap();
        msg.write_all(b"Subject: appended\n\nhello\n").unwrap();
        appender.msg_commit(&mut msg).unwrap();
        appender.msg_close(msg).unwrap();
        // Appending sessions cannot rewrite.
        assert_eq!(appender.sync().unwrap_err().kind, ErrorKind::NotSupported);
        appender.close().unwrap();

        assert_eq!(reader.check().unwrap(), CheckStatus::NewMail);
        assert_eq!(subjects(&reader), vec!["message 0", "appended"]);
        let record = &reader.store()[1];
        assert_eq!(record.received, Some(961729015));
        assert_eq!(record.header.return_path.as_deref(), Some("dave@example.com"));
        assert!(f.contents().ends_with("Subject: appended\n\nhello\n\n"));

        // Opening the reader for appending is refused.
        assert_eq!(
            reader
                .msg_open_new(&NewMessage::default())
                .unwrap_err()
                .kind,
            ErrorKind::NotSupported
        );
    }

    pub(crate) fn run_mmdf_round_trip() {
        let mut _logger = StderrLogger::new(LogLevel::TRACE);
        let f = Fixture::new("");
        let ctx = f.ctx(&[]);
        let path = f.path.display().to_string();
        let mut appender = mailbox::MailboxType::Mmdf
            .open_append(&path, &ctx, true)
            .unwrap();
        for i in 0..3_u64 {
            let mut msg = appender
                .msg_open_new(&NewMessage {
                    sender: Some(format!("user{i}@example.com")),
                    received: Some(961729015 + i),
                })
                .unwrap();
            write!(msg, "Subject: mmdf {i}\n\nbody {i}\n").unwrap();
            appender.msg_commit(&mut msg).unwrap();
        }
        appender.close().unwrap();
        assert_eq!(appender.msg_padding_size(), 10);

        assert_eq!(
            mailbox::MailboxType::probe(&path, &ctx),
            Some(mailbox::MailboxType::Mmdf)
        );
        let mut mailbox = mailbox::open(&path, &ctx).unwrap();
        assert_eq!(subjects(mailbox.as_ref()), vec!["mmdf 0", "mmdf 1", "mmdf 2"]);
        assert_eq!(mailbox.store()[1].line_count, 1);

        mailbox.store_mut().set_flag(1, Flag::DELETED, true);
        mailbox.store_mut().set_flag(2, Flag::REPLIED, true);
        assert_eq!(mailbox.sync().unwrap(), SyncStatus::Committed);
        assert_eq!(subjects(mailbox.as_ref()), vec!["mmdf 0", "mmdf 2"]);
        assert_eq!(f.contents().matches("\x01\x01\x01\x01\n").count(), 4);
        assert!(f.contents().ends_with("X-Status: A\n\nbody 2\n\x01\x01\x01\x01\n"));

        let reopened = mailbox::open(&path, &ctx).unwrap();
        assert_eq!(subjects(reopened.as_ref()), vec!["mmdf 0", "mmdf 2"]);
        assert!(reopened.store()[1].flags.contains(Flag::REPLIED));
    }
}
