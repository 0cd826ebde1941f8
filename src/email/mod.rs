/*
 * meli - email module
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

//! Structured message headers.
//!
//! The mailbox backends do not interpret headers beyond what they need for
//! bookkeeping. Parsing and comparing headers goes through the
//! [`HeaderParser`] and [`HeaderCompare`] traits, so that an embedder can plug
//! in a full RFC 5322 implementation; [`Rfc822Headers`] and [`StrictCompare`]
//! are the defaults.

use indexmap::IndexMap;

use crate::{
    error::Result,
    mailbox::{Flag, MessageRecord},
    utils::datetime::{rfc822_to_timestamp, UnixTimestamp},
};

pub mod parser;

/// The result of parsing one header block.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParsedHeader {
    /// Every field, keyed by lowercase name. Repeated fields keep the first
    /// value.
    pub fields: IndexMap<String, String>,
    pub message_id: Option<String>,
    pub subject: Option<String>,
    pub from: Option<String>,
    pub return_path: Option<String>,
    pub date: Option<UnixTimestamp>,
    /// `Content-Length`, the byte length of the body.
    pub content_length: Option<u64>,
    /// `Lines`, the line count of the body.
    pub lines: Option<u64>,
    /// Flags stored in `Status` and `X-Status`.
    pub status: Flag,
}

impl ParsedHeader {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name.to_ascii_lowercase().as_str())
            .map(String::as_str)
    }
}

/// Length of the header block at the start of `bytes`, including the empty
/// line that ends it. A message without a body is all header.
pub fn header_block_len(bytes: &[u8]) -> usize {
    let mut prev_newline = true;
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'\n' if prev_newline => return i + 1,
            b'\n' => prev_newline = true,
            b'\r' => {}
            _ => prev_newline = false,
        }
    }
    bytes.len()
}

pub trait HeaderParser: Send + Sync + std::fmt::Debug {
    /// Parse a header block. `input` ends at (and may include) the empty
    /// line separating headers from the body.
    fn parse_header(&self, input: &[u8]) -> Result<ParsedHeader>;
}

pub trait HeaderCompare: Send + Sync + std::fmt::Debug {
    /// Whether two records describe the same message, used to carry flags
    /// across a full re-parse.
    fn strict_equal(&self, old: &MessageRecord, new: &MessageRecord) -> bool;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Rfc822Headers;

impl HeaderParser for Rfc822Headers {
    fn parse_header(&self, input: &[u8]) -> Result<ParsedHeader> {
        let mut ret = ParsedHeader::default();
        for (name, value) in parser::headers::fields(input) {
            let name = name.to_ascii_lowercase();
            match name.as_str() {
                "message-id" if ret.message_id.is_none() => {
                    ret.message_id = Some(value.clone());
                }
                "subject" if ret.subject.is_none() => {
                    ret.subject = Some(value.clone());
                }
                "from" if ret.from.is_none() => {
                    ret.from = Some(value.clone());
                }
                "return-path" if ret.return_path.is_none() => {
                    ret.return_path = Some(value.clone());
                }
                "date" if ret.date.is_none() => {
                    ret.date = rfc822_to_timestamp(&value);
                }
                "content-length" if ret.content_length.is_none() => {
                    // A negative length is as good as none.
                    ret.content_length = value.parse::<i64>().ok().map(|v| v.max(0) as u64);
                }
                "lines" if ret.lines.is_none() => {
                    ret.lines = value.parse::<u64>().ok();
                }
                "status" => {
                    for c in value.chars() {
                        match c {
                            'R' => ret.status.set(Flag::READ, true),
                            'O' => ret.status.set(Flag::OLD, true),
                            _ => {}
                        }
                    }
                }
                "x-status" => {
                    for c in value.chars() {
                        match c {
                            'A' => ret.status.set(Flag::REPLIED, true),
                            'F' => ret.status.set(Flag::FLAGGED, true),
                            _ => {}
                        }
                    }
                }
                _ => {}
            }
            ret.fields.entry(name).or_insert(value);
        }
        Ok(ret)
    }
}

/// Compares identity fields, the envelope date and body geometry.
#[derive(Clone, Copy, Debug, Default)]
pub struct StrictCompare;

impl HeaderCompare for StrictCompare {
    fn strict_equal(&self, old: &MessageRecord, new: &MessageRecord) -> bool {
        let (a, b) = (&old.header, &new.header);
        a.message_id == b.message_id
            && a.subject == b.subject
            && a.from == b.from
            && a.date == b.date
            && old.received == new.received
            && old.line_count == new.line_count
            && match (old.body_length, new.body_length) {
                (Some(x), Some(y)) => x == y,
                _ => true,
            }
    }
}
