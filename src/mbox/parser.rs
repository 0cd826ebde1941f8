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

//! Boundary scanning for mbox and MMDF files.
//!
//! Both parsers read from the current position of a seekable reader and
//! append one [`MessageRecord`] per message to a [`HeaderStore`]. A declared
//! `Content-Length` is used to skip the body only after checking that a
//! boundary sits exactly where it points; otherwise the body is scanned line
//! by line.

use std::io::{BufRead, Seek, SeekFrom};

use super::{MboxFormat, Postmark, MMDF_SEP};
use crate::{
    email::{HeaderParser, ParsedHeader},
    error::{Error, ErrorKind, Result},
    mailbox::{HeaderStore, MessageRecord, ParseStatus},
    utils::interrupt::Interrupt,
};

pub struct MboxParser<'a> {
    pub format: MboxFormat,
    pub headers: &'a dyn HeaderParser,
    /// Polled once per message.
    pub interrupt: &'a Interrupt,
}

impl std::fmt::Debug for MboxParser<'_> {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct(stringify!(MboxParser))
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

/// Read a header block up to and including the empty line that ends it.
fn read_header<R: BufRead>(reader: &mut R) -> Result<Vec<u8>> {
    let mut ret = Vec::with_capacity(1024);
    loop {
        let start = ret.len();
        if reader.read_until(b'\n', &mut ret)? == 0 {
            break;
        }
        if matches!(&ret[start..], b"\n" | b"\r\n") {
            break;
        }
    }
    Ok(ret)
}

/// Count the line feeds in the next `len` bytes.
fn count_lines<R: BufRead>(reader: &mut R, len: u64) -> Result<u64> {
    let mut remaining = len;
    let mut ret = 0;
    while remaining > 0 {
        let buf = reader.fill_buf()?;
        if buf.is_empty() {
            break;
        }
        let n = buf.len().min(remaining.try_into().unwrap_or(usize::MAX));
        ret += buf[..n].iter().filter(|b| **b == b'\n').count() as u64;
        reader.consume(n);
        remaining -= n as u64;
    }
    Ok(ret)
}

/// Fill in the return path and sender from the postmark when the headers
/// lack them.
fn backfill(header: &mut ParsedHeader, postmark: Option<&Postmark>) {
    if header.return_path.is_none() {
        header.return_path = postmark.and_then(|p| p.sender.clone());
    }
    if header.from.is_none() {
        header.from = header.return_path.clone();
    }
}

/// Close the last record of the store: an unknown length runs up to the
/// line before `loc`, and an unknown line count is taken from the scan.
fn finish_last(store: &mut HeaderStore, loc: u64, lines: u64) {
    if let Some(record) = store.last_mut() {
        if record.body_length.is_none() {
            record.body_length = Some(loc.saturating_sub(record.body_offset).saturating_sub(1));
        }
        if record.line_count == 0 {
            record.line_count = lines.saturating_sub(1);
        }
    }
}

impl MboxParser<'_> {
    /// Parse from the reader's position to the end of the file. `size` is the
    /// file size observed before parsing; declared lengths pointing past it
    /// are ignored.
    pub fn parse<R: BufRead + Seek>(
        &self,
        reader: &mut R,
        store: &mut HeaderStore,
        size: u64,
    ) -> Result<ParseStatus> {
        match self.format {
            MboxFormat::Mbox => self.parse_mbox(reader, store, size),
            MboxFormat::Mmdf => self.parse_mmdf(reader, store, size),
        }
    }

    fn parse_mbox<R: BufRead + Seek>(
        &self,
        reader: &mut R,
        store: &mut HeaderStore,
        size: u64,
    ) -> Result<ParseStatus> {
        let mut line = Vec::with_capacity(256);
        let mut loc = reader.stream_position()?;
        let mut lines: u64 = 0;
        let mut count = 0;
        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line)? == 0 {
                break;
            }
            let Some(postmark) = Postmark::parse(&line) else {
                lines += 1;
                loc = reader.stream_position()?;
                continue;
            };
            // Only records of this pass are closed here: a store being
            // extended with new mail keeps its last record as it was.
            if count > 0 {
                finish_last(store, loc, lines);
            }
            if self.interrupt.take() {
                log::debug!("mbox parsing interrupted after {} messages", count);
                return Ok(ParseStatus::Aborted);
            }
            count += 1;

            let mut record = MessageRecord::new(loc);
            record.received = postmark.date;
            let mut header = self.headers.parse_header(&read_header(reader)?)?;
            let body_offset = reader.stream_position()?;
            record.body_offset = body_offset;
            record.line_count = header.lines.unwrap_or(0);
            record.flags = header.status;

            if let Some(cl) = header.content_length.filter(|cl| *cl > 0) {
                // The check against `size` keeps a huge, and thus wrong,
                // length from overflowing.
                let next = if cl < size {
                    Some(body_offset + cl + 1)
                } else {
                    None
                };
                let valid = match next {
                    Some(next) if next < size => {
                        reader.seek(SeekFrom::Start(next))?;
                        line.clear();
                        reader.read_until(b'\n', &mut line)?;
                        if line.starts_with(b"From ") {
                            true
                        } else {
                            log::debug!(
                                "bad content-length in message {} (cl={}), line: {:?}",
                                store.len(),
                                cl,
                                String::from_utf8_lossy(&line)
                            );
                            reader.seek(SeekFrom::Start(body_offset))?;
                            false
                        }
                    }
                    Some(next) => next == size,
                    None => false,
                };
                if let (true, Some(next)) = (valid, next) {
                    record.body_length = Some(cl);
                    if record.line_count == 0 {
                        reader.seek(SeekFrom::Start(body_offset))?;
                        record.line_count = count_lines(reader, cl)?;
                    }
                    reader.seek(SeekFrom::Start(next))?;
                }
            }

            backfill(&mut header, Some(&postmark));
            record.header = header;
            store.push(record);
            lines = 0;
            loc = reader.stream_position()?;
        }

        if count > 0 {
            finish_last(store, loc, lines);
        }
        Ok(ParseStatus::Ok(count))
    }

    fn parse_mmdf<R: BufRead + Seek>(
        &self,
        reader: &mut R,
        store: &mut HeaderStore,
        size: u64,
    ) -> Result<ParseStatus> {
        let mut line = Vec::with_capacity(256);
        let mut count = 0;
        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line)? == 0 {
                break;
            }
            if self.interrupt.take() {
                log::debug!("mmdf parsing interrupted after {} messages", count);
                return Ok(ParseStatus::Aborted);
            }
            if line != MMDF_SEP {
                log::debug!(
                    "corrupt mailbox, expected separator at {}",
                    reader.stream_position()? - line.len() as u64
                );
                return Err(Error::new("Mailbox is corrupt").set_kind(ErrorKind::Corrupted));
            }
            let offset = reader.stream_position()?;
            let mut record = MessageRecord::new(offset);

            line.clear();
            if reader.read_until(b'\n', &mut line)? == 0 {
                log::debug!("unexpected EOF");
                break;
            }
            let postmark = Postmark::parse(&line);
            match postmark.as_ref() {
                Some(p) => record.received = p.date,
                None => {
                    reader.seek(SeekFrom::Start(offset))?;
                }
            }
            let mut header = self.headers.parse_header(&read_header(reader)?)?;
            let body_offset = reader.stream_position()?;
            record.body_offset = body_offset;
            record.line_count = header.lines.unwrap_or(0);
            record.flags = header.status;

            if let Some(cl) = header.content_length.filter(|cl| *cl > 0) {
                let next = body_offset.saturating_add(cl);
                if record.line_count > 0 && next < size {
                    reader.seek(SeekFrom::Start(next))?;
                    line.clear();
                    reader.read_until(b'\n', &mut line)?;
                    if line == MMDF_SEP {
                        record.body_length = Some(cl);
                    } else {
                        reader.seek(SeekFrom::Start(body_offset))?;
                    }
                }
            }

            if record.body_length.is_none() {
                // The closing separator is counted and then discarded with
                // the initial -1. A message cut short by the end of the file
                // has no separator, so its last line goes uncounted.
                let mut lines: i64 = -1;
                let mut loc;
                loop {
                    loc = reader.stream_position()?;
                    line.clear();
                    if reader.read_until(b'\n', &mut line)? == 0 {
                        break;
                    }
                    lines += 1;
                    if line == MMDF_SEP {
                        break;
                    }
                }
                record.line_count = lines.max(0) as u64;
                record.body_length = Some(loc.saturating_sub(body_offset));
            }

            backfill(&mut header, postmark.as_ref());
            record.header = header;
            store.push(record);
            count += 1;
        }
        Ok(ParseStatus::Ok(count))
    }
}
