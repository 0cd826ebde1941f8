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

//! An in-process [`IndexBackend`].
//!
//! Databases live as long as the [`MemoryIndex`] they were opened from and
//! are keyed by path, so that every connection to the same path sees the
//! same messages. Like the real thing, any number of readers may be open
//! but only one writer.
//!
//! # Query syntax
//!
//! | term | matches |
//! |------|---------|
//! | `*` | every message |
//! | `tag:t` | messages tagged `t` |
//! | `id:i` | the message with Message-ID `i` |
//! | `thread:t` | messages of thread `t` |
//! | `folder:f` | files in maildir folder `f`, relative to the database root |
//! | `path:p`, `path:p/**` | files directly in (or below) directory `p` |
//! | `subject:s`, `from:s` | case-insensitive substring of the header |
//! | `date:a..b` | `a` and `b` are `@timestamp`, `N<unit>` ago or empty |
//! | anything else | case-insensitive substring of subject or sender |
//!
//! Terms combine with `and`, `or`, `not` and parentheses; juxtaposition
//! means `and`. Values may be double-quoted.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, SystemTime},
};

use indexmap::IndexMap;
use nom::{
    character::complete::multispace0,
    combinator::all_consuming,
    sequence::terminated,
};

use super::index::{
    AddStatus, Database, IndexBackend, IndexedMessage, IndexedThread, OpenMode, RemoveStatus,
    SearchQuery,
};
use crate::{
    email::{header_block_len, HeaderParser, Rfc822Headers},
    error::{Error, ErrorKind, Result},
    maildir::MaildirFilePathExt,
    utils::datetime::{self, system_time_to_timestamp, UnixTimestamp},
};

#[derive(Clone, Debug, Default)]
pub struct MemoryIndex {
    stores: Arc<Mutex<HashMap<PathBuf, Arc<Mutex<Store>>>>>,
    busy: Arc<AtomicUsize>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` opens fail as if another process was holding the
    /// database.
    pub fn set_busy(&self, n: usize) {
        self.busy.store(n, Ordering::SeqCst);
    }

    fn store(&self, path: &Path) -> Result<Arc<Mutex<Store>>> {
        let mut stores = self.stores.lock()?;
        Ok(stores.entry(path.to_path_buf()).or_default().clone())
    }
}

fn busy_error(path: &Path) -> Error {
    Error::new(format!("notmuch database {} is busy", path.display()))
        .set_kind(ErrorKind::WouldBlock)
        .set_related_path(path)
}

impl IndexBackend for MemoryIndex {
    fn open(&self, path: &Path, mode: OpenMode) -> Result<Box<dyn Database>> {
        if self
            .busy
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(busy_error(path));
        }
        let store = self.store(path)?;
        if mode == OpenMode::ReadWrite {
            let mut lck = store.lock()?;
            if lck.writer {
                return Err(busy_error(path));
            }
            lck.writer = true;
        }
        Ok(Box::new(MemoryDatabase {
            store,
            root: path.to_path_buf(),
            mode,
            atomic: 0,
        }))
    }
}

#[derive(Clone, Debug)]
struct Entry {
    id: String,
    thread_id: String,
    /// The message this one replies to.
    parent: Option<String>,
    filenames: Vec<PathBuf>,
    tags: BTreeSet<String>,
    date: UnixTimestamp,
    subject: String,
    from: String,
}

impl Entry {
    fn to_message(&self) -> IndexedMessage {
        IndexedMessage {
            id: self.id.clone(),
            thread_id: self.thread_id.clone(),
            filenames: self.filenames.clone(),
            tags: self.tags.iter().cloned().collect(),
            date: self.date,
        }
    }

    fn is_match(&self, query: &Query, root: &Path) -> bool {
        match query {
            Query::All => true,
            Query::Tag(t) => self.tags.contains(t),
            Query::Id(i) => &self.id == i,
            Query::Thread(t) => &self.thread_id == t,
            Query::Path(p) => self.filenames.iter().any(|f| {
                let Some(dir) = relative_dir(f.parent(), root) else {
                    return false;
                };
                match p.strip_suffix("/**") {
                    Some(prefix) => dir == prefix || dir.starts_with(&format!("{}/", prefix)),
                    None => &dir == p,
                }
            }),
            Query::Folder(p) => self.filenames.iter().any(|f| {
                let folder = f
                    .maildir_folder()
                    .or_else(|| f.parent().map(Path::to_path_buf));
                relative_dir(folder.as_deref(), root).as_ref() == Some(p)
            }),
            Query::Subject(s) => self.subject.to_lowercase().contains(s.as_str()),
            Query::From(s) => self.from.to_lowercase().contains(s.as_str()),
            Query::Text(s) => {
                self.subject.to_lowercase().contains(s.as_str())
                    || self.from.to_lowercase().contains(s.as_str())
            }
            Query::Date(beg, end) => {
                beg.map_or(true, |b| self.date >= b) && end.map_or(true, |e| self.date <= e)
            }
            Query::And(a, b) => self.is_match(a, root) && self.is_match(b, root),
            Query::Or(a, b) => self.is_match(a, root) || self.is_match(b, root),
            Query::Not(q) => !self.is_match(q, root),
        }
    }
}

fn relative_dir(dir: Option<&Path>, root: &Path) -> Option<String> {
    let rel = dir?.strip_prefix(root).ok()?;
    Some(rel.to_string_lossy().trim_end_matches('/').to_string())
}

#[derive(Debug)]
struct Store {
    messages: IndexMap<String, Entry>,
    files: HashMap<PathBuf, String>,
    mtime: SystemTime,
    writer: bool,
    next_thread: u64,
}

impl Default for Store {
    fn default() -> Self {
        Self {
            messages: IndexMap::default(),
            files: HashMap::default(),
            mtime: SystemTime::UNIX_EPOCH,
            writer: false,
            next_thread: 1,
        }
    }
}

impl Store {
    /// Advance the modification time, strictly.
    fn touch(&mut self) {
        let now = SystemTime::now();
        self.mtime = if now > self.mtime {
            now
        } else {
            self.mtime + Duration::from_nanos(1)
        };
    }

    fn entry_mut(&mut self, id: &str) -> Result<&mut Entry> {
        self.messages.get_mut(id).ok_or_else(|| {
            Error::new(format!("Message {} is not in the notmuch database", id))
                .set_kind(ErrorKind::NotFound)
        })
    }

    fn thread_for(&mut self, id: &str, parent: Option<&str>) -> String {
        if let Some(thread) = parent
            .and_then(|p| self.messages.get(p))
            .map(|e| e.thread_id.clone())
        {
            return thread;
        }
        if let Some(child) = self
            .messages
            .values()
            .find(|e| e.parent.as_deref() == Some(id))
        {
            return child.thread_id.clone();
        }
        let ret = format!("{:016x}", self.next_thread);
        self.next_thread += 1;
        ret
    }
}

#[derive(Debug)]
pub struct MemoryDatabase {
    store: Arc<Mutex<Store>>,
    root: PathBuf,
    mode: OpenMode,
    atomic: usize,
}

impl Drop for MemoryDatabase {
    fn drop(&mut self) {
        if self.mode == OpenMode::ReadWrite {
            if let Ok(mut lck) = self.store.lock() {
                lck.writer = false;
            }
        }
    }
}

/// The Message-IDs in a header value, without angle brackets.
fn message_ids(value: &str) -> Vec<&str> {
    value
        .split('<')
        .skip(1)
        .filter_map(|s| s.split_once('>').map(|(id, _)| id.trim()))
        .filter(|id| !id.is_empty())
        .collect()
}

impl MemoryDatabase {
    fn writable(&self) -> Result<()> {
        if self.mode == OpenMode::ReadOnly {
            return Err(Error::new(format!(
                "notmuch database {} is open read-only",
                self.root.display()
            ))
            .set_kind(ErrorKind::ReadOnly));
        }
        Ok(())
    }

    /// Messages matching `query`, newest first.
    fn matching(&self, query: &SearchQuery) -> Result<Vec<Entry>> {
        let q = parse_query(&query.text)?;
        let excluded = query
            .exclude_tags
            .iter()
            .filter(|t| !q.mentions_tag(t))
            .collect::<Vec<&String>>();
        let lck = self.store.lock()?;
        let mut ret = lck
            .messages
            .values()
            .filter(|e| !excluded.iter().any(|t| e.tags.contains(t.as_str())))
            .filter(|e| e.is_match(&q, &self.root))
            .cloned()
            .collect::<Vec<Entry>>();
        ret.sort_by(|a, b| b.date.cmp(&a.date));
        Ok(ret)
    }
}

impl Database for MemoryDatabase {
    fn mode(&self) -> OpenMode {
        self.mode
    }

    fn root(&self) -> &Path {
        &self.root
    }

    fn mtime(&self) -> Result<SystemTime> {
        Ok(self.store.lock()?.mtime)
    }

    fn begin_atomic(&mut self) -> Result<()> {
        self.writable()?;
        self.atomic += 1;
        Ok(())
    }

    fn end_atomic(&mut self) -> Result<()> {
        self.writable()?;
        self.atomic = self.atomic.checked_sub(1).ok_or_else(|| {
            Error::new("end_atomic called without a matching begin_atomic").set_kind(ErrorKind::Bug)
        })?;
        Ok(())
    }

    fn find_message(&self, id: &str) -> Result<Option<IndexedMessage>> {
        Ok(self.store.lock()?.messages.get(id).map(Entry::to_message))
    }

    fn find_message_by_filename(&self, path: &Path) -> Result<Option<IndexedMessage>> {
        let lck = self.store.lock()?;
        Ok(lck
            .files
            .get(path)
            .and_then(|id| lck.messages.get(id))
            .map(Entry::to_message))
    }

    fn index_file(&mut self, path: &Path) -> Result<(IndexedMessage, AddStatus)> {
        self.writable()?;
        let bytes = std::fs::read(path).map_err(|err| {
            Error::from(err)
                .set_summary(format!("Could not index {}", path.display()))
                .set_related_path(path)
        })?;
        let header = Rfc822Headers.parse_header(&bytes[..header_block_len(&bytes)])?;

        let mut lck = self.store.lock()?;
        let store = &mut *lck;
        if let Some(entry) = store.files.get(path).and_then(|id| store.messages.get(id)) {
            return Ok((entry.to_message(), AddStatus::Duplicate));
        }
        let id = header
            .message_id
            .as_deref()
            .and_then(|v| message_ids(v).first().map(|s| s.to_string()))
            .unwrap_or_else(|| format!("mailfold-{}", uuid::Uuid::new_v4().simple()));
        if let Some(entry) = store.messages.get_mut(&id) {
            entry.filenames.push(path.to_path_buf());
            let ret = entry.to_message();
            store.files.insert(path.to_path_buf(), id);
            store.touch();
            return Ok((ret, AddStatus::Duplicate));
        }

        let parent = header
            .get("in-reply-to")
            .and_then(|v| message_ids(v).first().map(|s| s.to_string()))
            .or_else(|| {
                header
                    .get("references")
                    .and_then(|v| message_ids(v).last().map(|s| s.to_string()))
            });
        let thread_id = store.thread_for(&id, parent.as_deref());
        let date = header.date.unwrap_or_else(|| {
            std::fs::metadata(path)
                .and_then(|m| m.modified())
                .map(system_time_to_timestamp)
                .unwrap_or(0)
        });
        let entry = Entry {
            id: id.clone(),
            thread_id,
            parent,
            filenames: vec![path.to_path_buf()],
            tags: BTreeSet::new(),
            date,
            subject: header.subject.clone().unwrap_or_default(),
            from: header.from.clone().unwrap_or_default(),
        };
        let ret = entry.to_message();
        store.files.insert(path.to_path_buf(), id.clone());
        store.messages.insert(id, entry);
        store.touch();
        log::trace!("indexed {} as {}", path.display(), ret.id);
        Ok((ret, AddStatus::Added))
    }

    fn remove_filename(&mut self, path: &Path) -> Result<RemoveStatus> {
        self.writable()?;
        let mut lck = self.store.lock()?;
        let id = lck.files.remove(path).ok_or_else(|| {
            Error::new(format!("{} is not in the notmuch database", path.display()))
                .set_kind(ErrorKind::NotFound)
                .set_related_path(path)
        })?;
        let entry = lck.entry_mut(&id)?;
        entry.filenames.retain(|f| f != path);
        let ret = if entry.filenames.is_empty() {
            lck.messages.shift_remove(&id);
            RemoveStatus::Removed
        } else {
            RemoveStatus::DuplicateRemains
        };
        lck.touch();
        Ok(ret)
    }

    fn add_tag(&mut self, id: &str, tag: &str) -> Result<()> {
        self.writable()?;
        let mut lck = self.store.lock()?;
        if lck.entry_mut(id)?.tags.insert(tag.to_string()) {
            lck.touch();
        }
        Ok(())
    }

    fn remove_tag(&mut self, id: &str, tag: &str) -> Result<()> {
        self.writable()?;
        let mut lck = self.store.lock()?;
        if lck.entry_mut(id)?.tags.remove(tag) {
            lck.touch();
        }
        Ok(())
    }

    fn all_tags(&self) -> Result<Vec<String>> {
        let lck = self.store.lock()?;
        Ok(lck
            .messages
            .values()
            .flat_map(|e| e.tags.iter().cloned())
            .collect::<BTreeSet<String>>()
            .into_iter()
            .collect())
    }

    fn search_messages(
        &self,
        query: &SearchQuery,
    ) -> Result<Box<dyn Iterator<Item = IndexedMessage> + '_>> {
        let ret = self.matching(query)?;
        Ok(Box::new(ret.into_iter().map(|e| e.to_message())))
    }

    fn search_threads(
        &self,
        query: &SearchQuery,
    ) -> Result<Box<dyn Iterator<Item = IndexedThread> + '_>> {
        let mut seen = HashSet::new();
        let thread_ids = self
            .matching(query)?
            .into_iter()
            .map(|e| e.thread_id)
            .filter(|t| seen.insert(t.clone()))
            .collect::<Vec<String>>();
        let lck = self.store.lock()?;
        let mut ret = Vec::with_capacity(thread_ids.len());
        for thread_id in thread_ids {
            let mut members = lck
                .messages
                .values()
                .filter(|e| e.thread_id == thread_id)
                .collect::<Vec<&Entry>>();
            members.sort_by_key(|e| e.date);
            let ids = members.iter().map(|e| e.id.as_str()).collect::<HashSet<&str>>();
            let toplevel = members
                .iter()
                .filter(|e| e.parent.as_deref().map_or(true, |p| !ids.contains(p)))
                .map(|e| e.to_message())
                .collect();
            ret.push(IndexedThread {
                total_messages: members.len(),
                thread_id,
                toplevel,
            });
        }
        Ok(Box::new(ret.into_iter()))
    }

    fn replies(&self, id: &str) -> Result<Vec<IndexedMessage>> {
        let lck = self.store.lock()?;
        let mut ret = lck
            .messages
            .values()
            .filter(|e| e.parent.as_deref() == Some(id))
            .collect::<Vec<&Entry>>();
        ret.sort_by_key(|e| e.date);
        Ok(ret.into_iter().map(Entry::to_message).collect())
    }

    fn count_messages(&self, query: &SearchQuery) -> Result<usize> {
        Ok(self.matching(query)?.len())
    }

    fn count_threads(&self, query: &SearchQuery) -> Result<usize> {
        Ok(self
            .matching(query)?
            .into_iter()
            .map(|e| e.thread_id)
            .collect::<HashSet<String>>()
            .len())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum Query {
    All,
    Tag(String),
    Id(String),
    Thread(String),
    Path(String),
    Folder(String),
    Subject(String),
    From(String),
    Text(String),
    Date(Option<UnixTimestamp>, Option<UnixTimestamp>),
    And(Box<Query>, Box<Query>),
    Or(Box<Query>, Box<Query>),
    Not(Box<Query>),
}

impl Query {
    /// Whether the query names `tag` explicitly, which lifts its exclusion.
    fn mentions_tag(&self, tag: &str) -> bool {
        match self {
            Self::Tag(t) => t == tag,
            Self::And(a, b) | Self::Or(a, b) => a.mentions_tag(tag) || b.mentions_tag(tag),
            Self::Not(q) => q.mentions_tag(tag),
            _ => false,
        }
    }
}

fn invalid_query(query: &str, reason: &str) -> Error {
    Error::new(format!("Invalid notmuch query `{}`: {}", query, reason))
        .set_kind(ErrorKind::ValueError)
}

fn parse_query(input: &str) -> Result<Query> {
    if input.trim().is_empty() {
        return Err(invalid_query(input, "empty query"));
    }
    match all_consuming(terminated(grammar::or_expr(datetime::now()), multispace0))(input) {
        Ok((_, query)) => Ok(query),
        Err(nom::Err::Error(err) | nom::Err::Failure(err)) if err.input.is_empty() => {
            Err(invalid_query(input, "unexpected end of query"))
        }
        Err(nom::Err::Error(err) | nom::Err::Failure(err)) => Err(invalid_query(
            input,
            &format!("unexpected input at `{}`", err.input),
        )),
        Err(nom::Err::Incomplete(_)) => Err(invalid_query(input, "incomplete query")),
    }
}

/// The query grammar. Relative dates are resolved against the `now` the
/// parsers are built with.
mod grammar {
    use nom::{
        branch::alt,
        bytes::complete::{tag, tag_no_case, take_till, take_while1},
        character::complete::{char, multispace0, multispace1, u64 as timestamp},
        combinator::{cut, eof, map, not, opt, peek, value, verify},
        multi::{fold_many0, fold_many1},
        sequence::{delimited, pair, preceded, terminated},
        IResult,
    };

    use super::Query;
    use crate::utils::datetime::UnixTimestamp;

    type Res<'a, T> = IResult<&'a str, T>;

    const HOUR: u64 = 60 * 60;
    const DAY: u64 = 24 * HOUR;

    /// Where a word ends, without consuming it.
    fn boundary(input: &str) -> Res<'_, ()> {
        peek(value((), alt((multispace1, tag("("), tag(")"), eof))))(input)
    }

    fn is_keyword(word: &str) -> bool {
        ["and", "or", "not"]
            .iter()
            .any(|k| word.eq_ignore_ascii_case(k))
    }

    fn keyword<'a>(k: &'static str) -> impl FnMut(&'a str) -> Res<'a, &'a str> {
        preceded(multispace0, terminated(tag_no_case(k), boundary))
    }

    /// A run of characters up to whitespace or a parenthesis. Double-quoted
    /// stretches may contain either and lose their quotes.
    fn word(input: &str) -> Res<'_, String> {
        fold_many1(
            alt((
                delimited(char('"'), take_till(|c: char| c == '"'), cut(char('"'))),
                take_while1(|c: char| !c.is_whitespace() && !matches!(c, '(' | ')' | '"')),
            )),
            String::new,
            |mut acc, chunk| {
                acc.push_str(chunk);
                acc
            },
        )(input)
    }

    fn field<'a>(name: &'static str) -> impl FnMut(&'a str) -> Res<'a, String> {
        preceded(tag(name), word)
    }

    /// `h`, `day`, `weeks`...; a trailing `s` is allowed.
    fn unit(input: &str) -> Res<'_, u64> {
        terminated(
            alt((
                value(HOUR, alt((tag("hour"), tag("h")))),
                value(DAY, alt((tag("day"), tag("d")))),
                value(7 * DAY, alt((tag("week"), tag("w")))),
                value(30 * DAY, alt((tag("month"), tag("M")))),
                value(365 * DAY, alt((tag("year"), tag("y")))),
            )),
            opt(char('s')),
        )(input)
    }

    /// `now`, `@<timestamp>`, `<N><unit>` (that long ago) or nothing.
    fn date_bound<'a>(
        now: UnixTimestamp,
    ) -> impl FnMut(&'a str) -> Res<'a, Option<UnixTimestamp>> {
        opt(alt((
            value(now, tag("now")),
            preceded(char('@'), timestamp),
            map(pair(timestamp, unit), move |(amount, secs)| {
                now.saturating_sub(amount.saturating_mul(secs))
            }),
        )))
    }

    /// `a..b`, `a..`, `..b` or a single bound used for both ends.
    fn date_range<'a>(now: UnixTimestamp) -> impl FnMut(&'a str) -> Res<'a, Query> {
        map(
            terminated(
                pair(date_bound(now), opt(preceded(tag(".."), date_bound(now)))),
                boundary,
            ),
            |(beg, end)| Query::Date(beg, end.unwrap_or(beg)),
        )
    }

    fn term<'a>(now: UnixTimestamp) -> impl FnMut(&'a str) -> Res<'a, Query> {
        preceded(
            multispace0,
            alt((
                preceded(tag("date:"), cut(date_range(now))),
                map(field("tag:"), Query::Tag),
                map(field("id:"), |v| {
                    Query::Id(v.trim_start_matches('<').trim_end_matches('>').to_string())
                }),
                map(field("thread:"), Query::Thread),
                map(field("path:"), |v| {
                    Query::Path(v.trim_end_matches('/').to_string())
                }),
                map(field("folder:"), |v| {
                    Query::Folder(v.trim_end_matches('/').to_string())
                }),
                map(field("subject:"), |v| Query::Subject(v.to_lowercase())),
                map(field("from:"), |v| Query::From(v.to_lowercase())),
                map(verify(word, |w: &str| !is_keyword(w)), |w| {
                    if w == "*" {
                        Query::All
                    } else {
                        Query::Text(w.to_lowercase())
                    }
                }),
            )),
        )
    }

    fn unary<'a>(now: UnixTimestamp) -> impl FnMut(&'a str) -> Res<'a, Query> {
        move |input: &'a str| {
            alt((
                map(preceded(keyword("not"), unary(now)), |q| {
                    Query::Not(Box::new(q))
                }),
                delimited(
                    preceded(multispace0, char('(')),
                    or_expr(now),
                    preceded(multispace0, cut(char(')'))),
                ),
                term(now),
            ))(input)
        }
    }

    /// Terms joined by `and` or by juxtaposition.
    fn and_expr<'a>(now: UnixTimestamp) -> impl FnMut(&'a str) -> Res<'a, Query> {
        move |input: &'a str| {
            let (rest, first) = unary(now)(input)?;
            fold_many0(
                preceded(pair(not(keyword("or")), opt(keyword("and"))), unary(now)),
                move || first.clone(),
                |acc, q| Query::And(Box::new(acc), Box::new(q)),
            )(rest)
        }
    }

    pub(super) fn or_expr<'a>(now: UnixTimestamp) -> impl FnMut(&'a str) -> Res<'a, Query> {
        move |input: &'a str| {
            let (rest, first) = and_expr(now)(input)?;
            fold_many0(
                preceded(keyword("or"), and_expr(now)),
                move || first.clone(),
                |acc, q| Query::Or(Box::new(acc), Box::new(q)),
            )(rest)
        }
    }
}
