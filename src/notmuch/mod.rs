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

//! Virtual mailboxes backed by a notmuch-style message index.
//!
//! A [`NotmuchMailbox`] shows the results of a query. The index decides
//! which messages belong to it; their content lives in maildir files. Flag
//! changes are written by renaming those files through the account's
//! [`MaildirWriter`](crate::maildir::MaildirWriter) and the index is then
//! told about the new names.
//!
//! The index itself is reached through the [`IndexBackend`] and [`Database`]
//! traits. [`MemoryIndex`] is an in-process implementation.

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};

pub mod index;
pub mod memory;
pub mod query;
pub mod tags;

pub use index::{
    open_database, AddStatus, Database, IndexBackend, IndexedMessage, IndexedThread, OpenMode,
    RemoveStatus, SearchQuery,
};
pub use memory::MemoryIndex;
pub use query::{
    normalize_uri, parse_type_from_query, path_canon, uri_from_query, NotmuchUri, QueryType,
    QueryWindow, Timebase, URI_SCHEME,
};
pub use tags::{parse_tag_changes, TagChange};

use crate::{
    conf::NotmuchSettings,
    email::header_block_len,
    error::{Error, ErrorKind, IntoError, Result},
    mailbox::{
        BackingFormat, CheckStatus, Flag, HeaderStore, IndexRecord, MailboxOps, MailboxType,
        Message, MessageRecord, MxContext, NewMessage, SyncStatus,
    },
    maildir::{find_message, MaildirFilePathExt},
};

/// Where a URI points, with every default applied.
struct Target {
    backend: Arc<dyn IndexBackend>,
    settings: NotmuchSettings,
    db_path: PathBuf,
    query: String,
    query_type: QueryType,
    limit: usize,
}

impl Target {
    fn resolve(uri: &str, ctx: &MxContext) -> Result<Self> {
        let backend = ctx.index_backend.clone().ok_or_else(|| {
            Error::new(format!(
                "Cannot open {}: no notmuch index backend is configured",
                uri
            ))
            .set_kind(ErrorKind::Configuration)
        })?;
        let settings = NotmuchSettings::new(&ctx.account)?;
        let parsed = NotmuchUri::parse(uri)?;
        let db_path = parsed
            .resolve_db_path(&settings, &ctx.account)
            .ok_or_else(|| {
                Error::new(format!("{}: no notmuch database path is set", uri))
                    .set_kind(ErrorKind::Configuration)
            })?;
        let mut query = parsed
            .query
            .clone()
            .filter(|q| !q.trim().is_empty())
            .ok_or_else(|| {
                Error::new(format!("{}: missing query", uri)).set_kind(ErrorKind::ValueError)
            })?;
        let query_type = parse_type_from_query(&mut query)
            .or(parsed.query_type)
            .unwrap_or(settings.nm_query_type);
        Ok(Self {
            backend,
            limit: parsed.limit.unwrap_or(settings.nm_db_limit),
            settings,
            db_path,
            query,
            query_type,
        })
    }
}

/// Depth-first walk of the replies to `msg`, skipping messages already in
/// `seen` so that reply cycles terminate.
fn collect_thread(
    db: &dyn Database,
    msg: IndexedMessage,
    seen: &mut HashSet<String>,
    out: &mut Vec<IndexedMessage>,
) -> Result<()> {
    if !seen.insert(msg.id.clone()) {
        return Ok(());
    }
    let replies = db.replies(&msg.id)?;
    out.push(msg);
    for reply in replies {
        collect_thread(db, reply, seen, out)?;
    }
    Ok(())
}

#[derive(Debug)]
pub struct NotmuchMailbox {
    uri: String,
    path: PathBuf,
    db_path: PathBuf,
    query: String,
    query_type: QueryType,
    limit: usize,
    window: QueryWindow,
    settings: NotmuchSettings,
    ctx: MxContext,
    backend: Arc<dyn IndexBackend>,
    db: Option<Box<dyn Database>>,
    longrun: bool,
    trans: bool,
    readonly: bool,
    store: HeaderStore,
    /// When the store last reflected the database.
    refreshed: SystemTime,
}

impl NotmuchMailbox {
    /// Open the virtual mailbox at `uri` and load the messages its query
    /// returns, with the query window configured for the account.
    pub fn open(uri: &str, ctx: MxContext) -> Result<Self> {
        Self::new(uri, ctx, None)
    }

    /// Like [`open`](Self::open), continuing from a window the caller kept
    /// from an earlier session.
    pub fn open_with_window(uri: &str, ctx: MxContext, window: QueryWindow) -> Result<Self> {
        Self::new(uri, ctx, Some(window))
    }

    fn new(uri: &str, ctx: MxContext, window: Option<QueryWindow>) -> Result<Self> {
        let target = Target::resolve(uri, &ctx)?;
        let mut ret = Self {
            uri: uri.to_string(),
            path: PathBuf::from(uri),
            db_path: target.db_path,
            query: target.query,
            query_type: target.query_type,
            limit: target.limit,
            window: window.unwrap_or_else(|| QueryWindow::new(&target.settings)),
            settings: target.settings,
            readonly: ctx.account.read_only,
            ctx,
            backend: target.backend,
            db: None,
            longrun: false,
            trans: false,
            store: HeaderStore::new(),
            refreshed: SystemTime::UNIX_EPOCH,
        };
        ret.load()?;
        log::debug!(
            "opened {} with {} messages ({} query)",
            ret.uri,
            ret.store.len(),
            ret.query_type
        );
        Ok(ret)
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub const fn query_type(&self) -> QueryType {
        self.query_type
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn window(&self) -> &QueryWindow {
        &self.window
    }

    /// Connect to the database, or reconnect read-write if `writable` is set
    /// and the current connection is read-only.
    fn get_db(&mut self, writable: bool) -> Result<&mut dyn Database> {
        let reopen = match self.db.as_ref() {
            None => true,
            Some(db) => writable && db.mode() == OpenMode::ReadOnly,
        };
        if reopen {
            self.db = None;
            let mode = if writable {
                OpenMode::ReadWrite
            } else {
                OpenMode::ReadOnly
            };
            self.db = Some(open_database(
                self.backend.as_ref(),
                &self.db_path,
                mode,
                self.settings.nm_open_timeout,
            )?);
        }
        match self.db.as_mut() {
            Some(db) => Some(&mut **db as &mut dyn Database),
            None => None,
        }
        .ok_or_else(|| {
            Error::new("notmuch database connection is missing").set_kind(ErrorKind::Bug)
        })
    }

    /// Drop the connection unless long-run mode or a transaction keeps it.
    fn release_db(&mut self) {
        if self.longrun || self.trans {
            return;
        }
        if self.db.take().is_some() {
            log::trace!("released notmuch database {}", self.db_path.display());
        }
    }

    /// Keep the database connection open across calls until
    /// [`longrun_done`](Self::longrun_done).
    pub fn longrun_init(&mut self, writable: bool) -> Result<()> {
        self.get_db(writable)?;
        self.longrun = true;
        log::debug!("notmuch long run started");
        Ok(())
    }

    pub fn longrun_done(&mut self) {
        self.longrun = false;
        self.release_db();
        log::debug!("notmuch long run finished");
    }

    /// Start a write transaction. Returns `false` if one is already open, in
    /// which case the caller must not end it.
    pub fn trans_begin(&mut self) -> Result<bool> {
        if self.trans {
            return Ok(false);
        }
        self.get_db(true)?.begin_atomic()?;
        self.trans = true;
        log::trace!("notmuch transaction started");
        Ok(true)
    }

    pub fn trans_end(&mut self) -> Result<()> {
        if !self.trans {
            return Ok(());
        }
        self.trans = false;
        let db = self.db.as_deref_mut().ok_or_else(|| {
            Error::new("notmuch transaction without a connection").set_kind(ErrorKind::Bug)
        })?;
        db.end_atomic()?;
        log::trace!("notmuch transaction finished");
        Ok(())
    }

    /// The mailbox query, restricted to the current query window.
    fn windowed_query(&mut self) -> String {
        self.window
            .apply(&self.query)
            .unwrap_or_else(|| self.query.clone())
    }

    fn search_query(&mut self) -> SearchQuery {
        SearchQuery::new(self.windowed_query()).exclude(self.settings.exclude_tags())
    }

    /// Run `query`, pulling in whole threads in thread mode, up to the
    /// mailbox limit.
    fn run_query(
        &mut self,
        query: &SearchQuery,
        query_type: QueryType,
    ) -> Result<Vec<IndexedMessage>> {
        let limit = self.limit;
        let db = self.get_db(false)?;
        let mut ret = vec![];
        match query_type {
            QueryType::Messages => {
                for msg in db.search_messages(query)? {
                    if limit > 0 && ret.len() >= limit {
                        break;
                    }
                    ret.push(msg);
                }
            }
            QueryType::Threads => {
                let mut seen = HashSet::new();
                for (n, thread) in db.search_threads(query)?.enumerate() {
                    if limit > 0 && n >= limit {
                        break;
                    }
                    for msg in thread.toplevel {
                        collect_thread(&*db, msg, &mut seen, &mut ret)?;
                    }
                }
            }
        }
        Ok(ret)
    }

    fn load(&mut self) -> Result<()> {
        let started = SystemTime::now();
        let query = self.search_query();
        log::debug!("{}: running query {:?}", self.uri, query.text);
        let results = self.run_query(&query, self.query_type);
        self.release_db();
        for msg in results? {
            if self.ctx.interrupt.take() {
                log::debug!(
                    "{}: loading was interrupted after {} messages",
                    self.uri,
                    self.store.len()
                );
                break;
            }
            self.append_message(&msg, true)?;
        }
        self.refreshed = started;
        Ok(())
    }

    /// Reload the store from scratch, for example after moving the window.
    pub fn reload(&mut self) -> Result<()> {
        self.store = HeaderStore::new();
        self.load()
    }

    pub fn query_window_forward(&mut self) -> Result<()> {
        self.window.forward();
        self.reload()
    }

    pub fn query_window_backward(&mut self) -> Result<()> {
        self.window.backward();
        self.reload()
    }

    fn find_record(&self, id: &str) -> Option<usize> {
        self.store.iter().position(|r| {
            r.index_record
                .as_ref()
                .map_or(false, |ir| ir.virtual_id == id)
        })
    }

    fn index_record(&self, index: usize) -> Result<&IndexRecord> {
        self.store
            .get(index)
            .and_then(|r| r.index_record.as_ref())
            .ok_or_else(|| {
                Error::new(format!("No message at index {} in {}", index, self.uri))
                    .set_kind(ErrorKind::NotFound)
            })
    }

    /// Where the file the index knows as `filename` is now. The second
    /// element is the stale name, if the file had to be looked up again.
    fn locate(filename: &Path) -> Option<(PathBuf, Option<PathBuf>)> {
        if filename.exists() {
            return Some((filename.to_path_buf(), None));
        }
        let found = find_message(&filename.maildir_folder()?, filename)?;
        log::debug!("{} was moved to {}", filename.display(), found.display());
        Some((found, Some(filename.to_path_buf())))
    }

    fn file_flags(path: &Path) -> Flag {
        let mut ret = path.flags();
        if !path.is_in_new() {
            ret |= Flag::OLD;
        }
        ret
    }

    fn read_record(
        &self,
        msg: &IndexedMessage,
        path: PathBuf,
        old_path: Option<PathBuf>,
    ) -> Result<MessageRecord> {
        let bytes = std::fs::read(&path).map_err(|err| {
            err.set_err_summary(format!("Could not read {}", path.display()))
                .set_related_path(&path)
        })?;
        let header_end = header_block_len(&bytes);
        let mut ret = MessageRecord::new(0);
        ret.header = self.ctx.parser.parse_header(&bytes[..header_end])?;
        ret.body_offset = header_end as u64;
        ret.body_length = Some((bytes.len() - header_end) as u64);
        ret.line_count = bytes[header_end..].iter().filter(|&&b| b == b'\n').count() as u64;
        ret.flags = Self::file_flags(&path);
        ret.received = Some(msg.date);
        ret.index_record = Some(IndexRecord {
            virtual_id: msg.id.clone(),
            thread_id: Some(msg.thread_id.clone()),
            folder: path
                .maildir_folder()
                .or_else(|| path.parent().map(Path::to_path_buf))
                .unwrap_or_default(),
            backing_path: path,
            old_backing_path: old_path,
            backing_format: BackingFormat::Maildir,
            tags: msg.tags.clone(),
        });
        Ok(ret)
    }

    /// Add `msg` to the store, unless `dedup` is set and it is already
    /// there. Returns whether a record was added.
    fn append_message(&mut self, msg: &IndexedMessage, dedup: bool) -> Result<bool> {
        if dedup && self.find_record(&msg.id).is_some() {
            return Ok(false);
        }
        let Some(filename) = msg.filename() else {
            log::debug!("{} has no file name in the index", msg.id);
            return Ok(false);
        };
        let Some((path, old_path)) = Self::locate(filename) else {
            log::warn!("{}: file {} is missing", msg.id, filename.display());
            return Ok(false);
        };
        match self.read_record(msg, path, old_path) {
            Ok(record) => {
                self.store.push(record);
                Ok(true)
            }
            Err(err) => {
                log::warn!("could not load message {}: {}", msg.id, err);
                Ok(false)
            }
        }
    }

    /// Bring record `index` up to date with `msg`. Returns whether its flags
    /// or tags changed.
    fn refresh_record(&mut self, index: usize, msg: &IndexedMessage) -> bool {
        let located = msg.filename().and_then(Self::locate);
        let Some(record) = self.store.get_mut(index) else {
            return false;
        };
        let mut changed = false;
        let mut file_flags = None;
        if let Some(ir) = record.index_record.as_mut() {
            if let Some((path, stale)) = located {
                if path != ir.backing_path {
                    log::debug!(
                        "{}: {} is now {}",
                        msg.id,
                        ir.backing_path.display(),
                        path.display()
                    );
                    ir.backing_path = path.clone();
                }
                ir.old_backing_path = stale;
                file_flags = Some(Self::file_flags(&path));
            }
            if ir.tags != msg.tags {
                ir.tags = msg.tags.clone();
                changed = true;
            }
        }
        // Local edits win over what is on disk.
        if let Some(file_flags) = file_flags.filter(|_| !record.is_changed()) {
            let flags = (record.flags & !Flag::USER) | file_flags;
            if flags != record.flags {
                record.flags = flags;
                changed = true;
            }
        }
        changed
    }

    /// Whether message `index` still matches the mailbox query.
    pub fn message_is_still_queried(&mut self, index: usize) -> Result<bool> {
        let id = self.index_record(index)?.virtual_id.clone();
        let text = self.windowed_query();
        let query = SearchQuery::new(format!("id:\"{}\" and ({})", id, text))
            .exclude(self.settings.exclude_tags());
        let query_type = self.query_type;
        let ret = self.get_db(false).and_then(|db| {
            Ok(match query_type {
                QueryType::Messages => db.count_messages(&query)? > 0,
                QueryType::Threads => db.count_threads(&query)? > 0,
            })
        });
        self.release_db();
        ret
    }

    /// Add every message of the thread of message `index` that is not in the
    /// mailbox yet. Returns how many were added.
    pub fn read_entire_thread(&mut self, index: usize) -> Result<usize> {
        let ir = self.index_record(index)?;
        let (id, thread_id) = (ir.virtual_id.clone(), ir.thread_id.clone());
        let results = self.get_db(false).and_then(|db| {
            let thread_id = match thread_id {
                Some(t) => t,
                None => db
                    .find_message(&id)?
                    .map(|m| m.thread_id)
                    .ok_or_else(|| {
                        Error::new(format!("Message {} is not in the notmuch database", id))
                            .set_kind(ErrorKind::NotFound)
                    })?,
            };
            let query = SearchQuery::new(format!("thread:\"{}\"", thread_id));
            Ok(db.search_messages(&query)?.collect::<Vec<IndexedMessage>>())
        });
        self.release_db();
        let mut added = 0;
        for msg in results? {
            if self.append_message(&msg, true)? {
                added += 1;
            }
        }
        log::debug!("{}: read {} more messages of thread", self.uri, added);
        Ok(added)
    }

    /// Index a message file written by someone else (for example a copy
    /// saved to a maildir), tagging it from its maildir flags, `tags` and
    /// `nm_record_tags`.
    pub fn record_message(&mut self, path: &Path, tags: Option<&str>) -> Result<()> {
        let record_tags = self.settings.nm_record_tags.clone();
        let unread_tag = self.settings.nm_unread_tag.clone();
        let started = self.trans_begin()?;
        let ret = self.get_db(true).and_then(|db| {
            let (msg, status) = db.index_file(path)?;
            if status == AddStatus::Duplicate {
                log::debug!("{} was already indexed as {}", path.display(), msg.id);
                return Ok(());
            }
            tags::maildir_flags_to_tags(db, &msg.id, path, &unread_tag)?;
            for t in [tags, record_tags.as_deref()]
                .into_iter()
                .flatten()
                .filter(|t| !t.trim().is_empty())
            {
                tags::apply_tag_changes(db, &msg.id, &parse_tag_changes(t)?)?;
            }
            Ok(())
        });
        let end = if started { self.trans_end() } else { Ok(()) };
        self.release_db();
        ret?;
        end
    }

    pub fn get_all_tags(&mut self) -> Result<Vec<String>> {
        let ret = self.get_db(false).and_then(|db| db.all_tags());
        self.release_db();
        ret
    }

    /// Remove `path` from the index. If the message has other files, they
    /// are deleted too. Returns whether the index changed.
    fn remove_filename(&mut self, path: &Path) -> Result<bool> {
        let db = self.get_db(true)?;
        let Some(msg) = db.find_message_by_filename(path)? else {
            log::debug!("{} is not in the notmuch database", path.display());
            return Ok(false);
        };
        log::debug!("removing {} from the notmuch database", path.display());
        if db.remove_filename(path)? == RemoveStatus::DuplicateRemains {
            for other in msg.filenames.iter().filter(|f| f.as_path() != path) {
                log::debug!("removing duplicate {}", other.display());
                match std::fs::remove_file(other) {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => log::warn!("could not remove {}: {}", other.display(), err),
                }
                db.remove_filename(other)?;
            }
        }
        Ok(true)
    }

    /// Tell the index that the file of record `index` moved from `old` to
    /// `new`. Other files of the same message are renamed to carry the same
    /// flags. Returns whether the index changed.
    fn rename_filename(&mut self, index: usize, old: &Path, new: &Path) -> Result<bool> {
        if !new.exists() {
            log::debug!("{} does not exist, not renaming", new.display());
            return Ok(false);
        }
        let flags = self.store[index].flags & !Flag::CHANGED;
        let unread_tag = self.settings.nm_unread_tag.clone();
        let db = self.get_db(true)?;
        log::debug!("renaming {} to {}", old.display(), new.display());
        let (msg, _) = db.index_file(new)?;
        // An old name the index never had leaves no duplicates behind.
        let status = match db.remove_filename(old) {
            Ok(status) => Some(status),
            Err(err) if err.kind == ErrorKind::NotFound => {
                log::warn!("{} was not in the notmuch database", old.display());
                None
            }
            Err(err) => return Err(err),
        };
        if status == Some(RemoveStatus::DuplicateRemains) {
            let filenames = db
                .find_message(&msg.id)?
                .map(|m| m.filenames)
                .unwrap_or_default();
            for dup in filenames.iter().filter(|f| f.as_path() != new) {
                let target = match dup.with_flags(flags) {
                    Ok(t) if &t != dup => t,
                    Ok(_) => continue,
                    Err(err) => {
                        log::warn!("{}", err);
                        continue;
                    }
                };
                log::debug!("renaming duplicate {} to {}", dup.display(), target.display());
                if let Err(err) = std::fs::rename(dup, &target) {
                    log::warn!("could not rename {}: {}", dup.display(), err);
                    continue;
                }
                db.remove_filename(dup)?;
                db.index_file(&target)?;
            }
        }
        let tags = tags::maildir_flags_to_tags(db, &msg.id, new, &unread_tag)?;
        if let Some(ir) = self
            .store
            .get_mut(index)
            .and_then(|r| r.index_record.as_mut())
        {
            ir.tags = tags;
        }
        Ok(true)
    }

    fn sync_records(&mut self, changed: &mut bool) -> Result<()> {
        let writer = self.ctx.maildir_writer.clone();
        for i in 0..self.store.len() {
            let record = &self.store[i];
            let Some(ir) = record.index_record.as_ref() else {
                continue;
            };
            let old = ir
                .old_backing_path
                .clone()
                .unwrap_or_else(|| ir.backing_path.clone());
            let new = writer.sync_message(&ir.backing_path, record)?;
            if record.is_deleted() {
                *changed |= self.remove_filename(&old)?;
            } else if let Some(new) = new.as_ref().filter(|n| **n != old) {
                *changed |= self.rename_filename(i, &old, new)?;
            }
            if let Some(ir) = self
                .store
                .get_mut(i)
                .and_then(|r| r.index_record.as_mut())
            {
                if let Some(new) = new {
                    ir.backing_path = new;
                }
                ir.old_backing_path = None;
            }
        }
        Ok(())
    }
}

impl MailboxOps for NotmuchMailbox {
    fn kind(&self) -> MailboxType {
        MailboxType::Notmuch
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn store(&self) -> &HeaderStore {
        &self.store
    }

    fn store_mut(&mut self) -> &mut HeaderStore {
        &mut self.store
    }

    fn is_readonly(&self) -> bool {
        self.readonly
    }

    fn check(&mut self) -> Result<CheckStatus> {
        let mtime = self.get_db(false).and_then(|db| db.mtime());
        let mtime = match mtime {
            Ok(m) => m,
            Err(err) => {
                self.release_db();
                return Err(err);
            }
        };
        if mtime <= self.refreshed {
            log::trace!("{}: database unchanged", self.uri);
            self.release_db();
            return Ok(CheckStatus::Unchanged);
        }

        let started = SystemTime::now();
        let query = self.search_query();
        log::debug!("{}: checking with query {:?}", self.uri, query.text);
        let results = self.run_query(&query, QueryType::Messages);
        self.release_db();
        let results = results?;

        let old_count = self.store.len();
        let mut known = self
            .store
            .iter()
            .filter_map(|r| Some((r.index_record.as_ref()?.virtual_id.clone(), r.index)))
            .collect::<HashMap<String, usize>>();
        let mut seen = vec![false; old_count];
        let mut new_flags = 0;
        let mut added = 0;
        let mut interrupted = false;
        for msg in &results {
            if self.ctx.interrupt.take() {
                log::debug!("{}: check was interrupted", self.uri);
                interrupted = true;
                break;
            }
            match known.get(&msg.id) {
                Some(&i) => {
                    if let Some(s) = seen.get_mut(i) {
                        *s = true;
                    }
                    if self.refresh_record(i, msg) {
                        new_flags += 1;
                    }
                }
                None => {
                    if self.append_message(msg, false)? {
                        known.insert(msg.id.clone(), self.store.len() - 1);
                        added += 1;
                    }
                }
            }
        }

        // Messages the query no longer returns are hidden, not deleted.
        let occult = !interrupted && seen.iter().any(|s| !s);
        if occult {
            self.store
                .retain(|r| seen.get(r.index).copied().unwrap_or(true));
        } else {
            self.store.recount();
        }
        self.refreshed = started;
        log::debug!(
            "{}: check done, occult: {}, new flags: {}",
            self.uri,
            occult,
            new_flags
        );
        Ok(if occult {
            CheckStatus::Reopened
        } else if added > 0 {
            CheckStatus::NewMail
        } else if new_flags > 0 {
            CheckStatus::Flags
        } else {
            CheckStatus::Unchanged
        })
    }

    fn sync(&mut self) -> Result<SyncStatus> {
        if self.readonly {
            return Err(Error::new(format!("{} is read-only", self.uri))
                .set_kind(ErrorKind::ReadOnly));
        }
        let started = self.trans_begin()?;
        let mut changed = false;
        let ret = self.sync_records(&mut changed);
        let end = if started { self.trans_end() } else { Ok(()) };
        self.release_db();
        ret?;
        end?;

        self.store.retain(|r| !r.is_deleted());
        for r in self.store.iter_mut() {
            r.flags.remove(Flag::CHANGED | Flag::ATTACH_DEL);
        }
        self.store.changed = false;
        self.store.recount();
        if changed {
            self.refreshed = SystemTime::now();
        }
        log::debug!("{}: synced, index changed: {}", self.uri, changed);
        Ok(SyncStatus::Committed)
    }

    fn close(&mut self) -> Result<()> {
        self.longrun = false;
        let ret = self.trans_end();
        self.db = None;
        ret
    }

    fn msg_open(&mut self, index: usize) -> Result<Message> {
        let backing_path = self.index_record(index)?.backing_path.clone();
        let (path, stale) = Self::locate(&backing_path).ok_or_else(|| {
            Error::new(format!("{} is missing", backing_path.display()))
                .set_kind(ErrorKind::NotFound)
                .set_related_path(&backing_path)
        })?;
        if let Some(stale) = stale {
            if let Some(ir) = self
                .store
                .get_mut(index)
                .and_then(|r| r.index_record.as_mut())
            {
                ir.old_backing_path.get_or_insert(stale);
                ir.backing_path = path.clone();
            }
        }
        let bytes = std::fs::read(&path).map_err(|err| {
            err.set_err_summary(format!("Could not read {}", path.display()))
                .set_related_path(&path)
        })?;
        Ok(Message::from_bytes(index, bytes).set_path(path))
    }

    fn msg_open_new(&mut self, _new: &NewMessage) -> Result<Message> {
        Err(Error::new("Virtual mailboxes cannot take new messages.")
            .set_kind(ErrorKind::NotSupported))
    }

    fn msg_commit(&mut self, _msg: &mut Message) -> Result<()> {
        Err(Error::new("Virtual mailboxes cannot take new messages.")
            .set_kind(ErrorKind::NotSupported))
    }

    fn msg_padding_size(&self) -> usize {
        0
    }

    fn tags_commit(&mut self, index: usize, tags: &str) -> Result<()> {
        if self.readonly {
            return Err(Error::new(format!("{} is read-only", self.uri))
                .set_kind(ErrorKind::ReadOnly));
        }
        let changes = parse_tag_changes(tags)?;
        let id = self.index_record(index)?.virtual_id.clone();
        let started = self.trans_begin()?;
        let ret = self
            .get_db(true)
            .and_then(|db| tags::apply_tag_changes(db, &id, &changes));
        let end = if started { self.trans_end() } else { Ok(()) };
        self.release_db();
        let new_tags = ret?;
        end?;

        tags::mirror_flags(
            &mut self.store,
            index,
            &changes,
            &new_tags,
            &self.settings.nm_unread_tag,
        );
        if let Some(record) = self.store.get_mut(index) {
            if let Some(ir) = record.index_record.as_mut() {
                ir.tags = new_tags;
            }
            record.flags.insert(Flag::CHANGED);
        }
        self.store.changed = true;
        Ok(())
    }
}

/// Count the messages of the virtual mailbox at `uri` and how many of them
/// are unread, without opening it.
pub fn count(uri: &str, ctx: &MxContext) -> Result<(usize, usize)> {
    let target = Target::resolve(uri, ctx)?;
    let db = open_database(
        target.backend.as_ref(),
        &target.db_path,
        OpenMode::ReadOnly,
        target.settings.nm_open_timeout,
    )?;
    let excludes = target.settings.exclude_tags();
    let count = |text: String| -> Result<usize> {
        let n = db.count_messages(&SearchQuery::new(text).exclude(excludes.iter().copied()))?;
        Ok(if target.limit > 0 {
            n.min(target.limit)
        } else {
            n
        })
    };
    let all = count(target.query.clone())?;
    let unread = count(format!(
        "( {} ) tag:{}",
        target.query, target.settings.nm_unread_tag
    ))?;
    Ok((all, unread))
}
