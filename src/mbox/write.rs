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

//! Writing messages: copying them during a sync and appending new ones.

use std::{
    fs::File,
    io::{BufReader, Read, Seek, SeekFrom, Write},
};

use super::{MboxFormat, MboxMailbox, MessageCopier, MMDF_SEP};
use crate::{
    error::{Error, ErrorKind, Result},
    mailbox::{Flag, MailboxOps, Message, MessageRecord, NewMessage},
    utils::{
        datetime::{self, asctime},
        username,
    },
};

/// The default [`MessageCopier`].
///
/// Messages without local changes are copied byte for byte. Changed ones
/// get their `Status` and `X-Status` headers regenerated from the record's
/// flags; everything else, the postmark included, is copied as is.
#[derive(Clone, Copy, Debug, Default)]
pub struct StatusCopier;

impl StatusCopier {
    /// The status header lines for `flags`, in `CClient` convention.
    pub fn status_lines(flags: Flag) -> Vec<u8> {
        let mut ret = Vec::with_capacity(32);
        if flags.contains(Flag::READ) {
            ret.extend_from_slice(b"Status: RO\n");
        } else if flags.contains(Flag::OLD) {
            ret.extend_from_slice(b"Status: O\n");
        }
        if flags.intersects(Flag::REPLIED | Flag::FLAGGED) {
            ret.extend_from_slice(b"X-Status: ");
            if flags.contains(Flag::REPLIED) {
                ret.push(b'A');
            }
            if flags.contains(Flag::FLAGGED) {
                ret.push(b'F');
            }
            ret.push(b'\n');
        }
        ret
    }
}

fn is_status_field(line: &[u8]) -> bool {
    let Some(colon) = line.iter().position(|&b| b == b':') else {
        return false;
    };
    let name = &line[..colon];
    name.eq_ignore_ascii_case(b"Status") || name.eq_ignore_ascii_case(b"X-Status")
}

fn copy_exact(reader: impl Read, len: u64, dest: &mut dyn Write) -> Result<()> {
    let copied = std::io::copy(&mut reader.take(len), dest)?;
    if copied != len {
        return Err(Error::new(format!(
            "Short read: expected {} bytes, got {}",
            len, copied
        ))
        .set_kind(ErrorKind::Corrupted));
    }
    Ok(())
}

impl MessageCopier for StatusCopier {
    fn copy_message(
        &self,
        src: &File,
        _format: MboxFormat,
        record: &mut MessageRecord,
        dest: &mut dyn Write,
    ) -> Result<()> {
        let mut reader = BufReader::new(src);
        reader.seek(SeekFrom::Start(record.offset))?;
        if !record.is_changed() {
            let len = record.end_offset().saturating_sub(record.offset);
            return copy_exact(reader, len, dest);
        }

        let header_len = record.body_offset.saturating_sub(record.offset);
        let mut header = Vec::with_capacity(header_len as usize);
        (&mut reader).take(header_len).read_to_end(&mut header)?;

        let mut lines = header.split_inclusive(|&b| b == b'\n').peekable();
        if let Some(first) = lines.next_if(|l| l.starts_with(b"From ")) {
            dest.write_all(first)?;
        }
        let mut skipping = false;
        for line in lines {
            if line == b"\n" || line == b"\r\n" {
                break;
            }
            if matches!(line.first(), Some(b' ' | b'\t')) {
                if !skipping {
                    dest.write_all(line)?;
                }
                continue;
            }
            skipping = is_status_field(line);
            if skipping {
                continue;
            }
            dest.write_all(line)?;
            if !line.ends_with(b"\n") {
                dest.write_all(b"\n")?;
            }
        }
        dest.write_all(&Self::status_lines(record.flags))?;
        dest.write_all(b"\n")?;

        // The reader is right at the start of the body.
        copy_exact(reader, record.body_length.unwrap_or(0), dest)
    }
}

impl MboxMailbox {
    /// Start a message at the end of a mailbox opened for appending, writing
    /// its prefix.
    pub(super) fn open_new_message(&mut self, new: &NewMessage) -> Result<Message> {
        if !self.append {
            return Err(Error::new(format!(
                "Mailbox {} is not open for appending",
                self.path.display()
            ))
            .set_kind(ErrorKind::NotSupported));
        }
        let mut file = self.file()?.try_clone()?;
        let received = new.received.unwrap_or_else(datetime::now);
        if self.format == MboxFormat::Mmdf {
            file.write_all(MMDF_SEP)?;
        }
        let sender = new.sender.clone().unwrap_or_else(username);
        writeln!(file, "From {} {}", sender, asctime(received))?;
        Ok(Message::for_writing(file, Some(received)))
    }

    /// Finish a message started with
    /// [`open_new_message`](Self::open_new_message).
    pub(super) fn commit_message(&mut self, msg: &mut Message) -> Result<()> {
        let padding = self.format.padding();
        let file = msg.file_mut().ok_or_else(|| {
            Error::new("Message was not opened for writing").set_kind(ErrorKind::ValueError)
        })?;
        file.write_all(padding)?;
        file.flush()?;
        file.sync_all().map_err(|err| {
            Error::from(err)
                .set_summary(format!("Could not sync {}", self.path.display()))
                .set_related_path(&self.path)
        })?;
        Ok(())
    }

    /// Append a complete message (header and body, without postmark) in one
    /// go.
    pub fn append_message(&mut self, new: &NewMessage, bytes: &[u8]) -> Result<()> {
        let mut msg = self.msg_open_new(new)?;
        msg.write_all(bytes)?;
        if !bytes.ends_with(b"\n") {
            msg.write_all(b"\n")?;
        }
        self.msg_commit(&mut msg)?;
        self.msg_close(msg)
    }
}
