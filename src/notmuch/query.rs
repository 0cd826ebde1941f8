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

//! Virtual mailbox URIs and windowed queries.

use std::{path::PathBuf, str::FromStr};

use crate::{
    conf::{AccountSettings, NotmuchSettings},
    error::{Error, ErrorKind, Result},
    utils::percent_encoding::{percent_decode, utf8_percent_encode},
};

pub const URI_SCHEME: &str = "notmuch://";

/// Whether a query loads matching messages only or their whole threads.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum QueryType {
    #[default]
    Messages,
    Threads,
}

impl FromStr for QueryType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "messages" => Ok(Self::Messages),
            "threads" => Ok(Self::Threads),
            other => Err(Error::new(format!(
                "failed to parse notmuch query type: {}",
                other
            ))
            .set_kind(ErrorKind::ValueError)),
        }
    }
}

impl std::fmt::Display for QueryType {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Messages => write!(fmt, "messages"),
            Self::Threads => write!(fmt, "threads"),
        }
    }
}

/// Remove every `type=` fragment accidentally left in a query, returning
/// the query type the last one named.
pub fn parse_type_from_query(query: &mut String) -> Option<QueryType> {
    // Longer variants first, so that the separators go away too.
    const VARIANTS: [(&str, QueryType); 6] = [
        ("&type=threads", QueryType::Threads),
        ("&type=messages", QueryType::Messages),
        ("type=threads&", QueryType::Threads),
        ("type=messages&", QueryType::Messages),
        ("type=threads", QueryType::Threads),
        ("type=messages", QueryType::Messages),
    ];
    let mut ret = None;
    for (variant, kind) in VARIANTS {
        loop {
            let Some(idx) = query.to_ascii_lowercase().find(variant) else {
                break;
            };
            query.replace_range(idx..idx + variant.len(), "");
            ret = Some(kind);
        }
    }
    ret
}

/// The parts of a `notmuch://<db path>?type=&limit=&query=` URI.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct NotmuchUri {
    pub db_path: Option<PathBuf>,
    pub query: Option<String>,
    pub query_type: Option<QueryType>,
    pub limit: Option<usize>,
}

impl NotmuchUri {
    /// Parse a URI. Malformed `type` and `limit` values are logged and
    /// ignored.
    pub fn parse(uri: &str) -> Result<Self> {
        let rest = uri
            .get(..URI_SCHEME.len())
            .filter(|s| s.eq_ignore_ascii_case(URI_SCHEME))
            .map(|_| &uri[URI_SCHEME.len()..])
            .ok_or_else(|| {
                Error::new(format!("failed to parse notmuch uri: {}", uri))
                    .set_kind(ErrorKind::ValueError)
            })?;
        let (path, params) = match rest.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (rest, None),
        };
        let mut ret = Self {
            db_path: Some(path)
                .filter(|p| !p.is_empty())
                .map(|p| PathBuf::from(percent_decode(p).as_ref())),
            ..Self::default()
        };
        for param in params.unwrap_or_default().split('&') {
            let Some((name, value)) = param.split_once('=') else {
                continue;
            };
            let value = percent_decode(value);
            match name {
                "limit" => match value.parse::<usize>() {
                    Ok(limit) => ret.limit = Some(limit),
                    Err(err) => log::error!("failed to parse notmuch limit: {}: {}", value, err),
                },
                "type" => match value.parse::<QueryType>() {
                    Ok(kind) => ret.query_type = Some(kind),
                    Err(err) => log::error!("{}", err),
                },
                "query" => ret.query = Some(value.into_owned()),
                other => log::debug!("ignoring unknown notmuch uri parameter {:?}", other),
            }
        }
        Ok(ret)
    }

    /// The database path: the URI's own, then `nm_default_uri`, then the
    /// account root.
    pub fn resolve_db_path(
        &self,
        settings: &NotmuchSettings,
        account: &AccountSettings,
    ) -> Option<PathBuf> {
        if let Some(path) = self.db_path.as_ref() {
            return Some(path.clone());
        }
        if let Some(default) = settings.nm_default_uri.as_deref() {
            let path = default.strip_prefix(URI_SCHEME).unwrap_or(default);
            let path = path.split_once('?').map_or(path, |(p, _)| p);
            if !path.is_empty() {
                return Some(PathBuf::from(path));
            }
        }
        Some(PathBuf::from(&account.root_mailbox)).filter(|p| !p.as_os_str().is_empty())
    }
}

/// Build the URI of a virtual mailbox showing `query`.
///
/// A `type=` fragment inside the query overrides `query_type`. The limit is
/// only spelled out when it differs from `nm_db_limit`.
pub fn uri_from_query(
    db_path: &std::path::Path,
    query: &str,
    query_type: QueryType,
    limit: usize,
    settings: &NotmuchSettings,
) -> String {
    let mut query = query.to_string();
    let query_type = parse_type_from_query(&mut query).unwrap_or(query_type);
    let db_path = db_path.display().to_string();
    let ret = if limit != settings.nm_db_limit {
        format!(
            "{}{}?type={}&limit={}&query={}",
            URI_SCHEME,
            utf8_percent_encode(&db_path),
            query_type,
            limit,
            utf8_percent_encode(&query)
        )
    } else {
        format!(
            "{}{}?type={}&query={}",
            URI_SCHEME,
            utf8_percent_encode(&db_path),
            query_type,
            utf8_percent_encode(&query)
        )
    };
    log::debug!("notmuch uri from query: {}", ret);
    ret
}

/// Rewrite a URI in canonical form, so that equivalent searches compare
/// equal.
pub fn normalize_uri(
    uri: &str,
    settings: &NotmuchSettings,
    account: &AccountSettings,
) -> Result<String> {
    let parsed = NotmuchUri::parse(uri)?;
    let invalid = || {
        Error::new(format!("failed to parse notmuch uri: {}", uri)).set_kind(ErrorKind::ValueError)
    };
    let query = parsed.query.as_deref().ok_or_else(invalid)?;
    let db_path = parsed
        .resolve_db_path(settings, account)
        .ok_or_else(invalid)?;
    Ok(uri_from_query(
        &db_path,
        query,
        parsed.query_type.unwrap_or(settings.nm_query_type),
        parsed.limit.unwrap_or(settings.nm_db_limit),
        settings,
    ))
}

/// Replace a leading `+` or `=` with `folder`.
pub fn path_canon(path: &str, folder: Option<&std::path::Path>) -> Result<String> {
    let Some(rest) = path.strip_prefix(['+', '=']) else {
        return Ok(path.to_string());
    };
    let folder = folder.ok_or_else(|| {
        Error::new(format!("Cannot resolve {}: no folder is set", path))
            .set_kind(ErrorKind::ValueError)
    })?;
    let folder = folder.display().to_string();
    if folder.ends_with('/') {
        Ok(format!("{}{}", folder, rest))
    } else {
        Ok(format!("{}/{}", folder, rest))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Timebase {
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl FromStr for Timebase {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hour" => Ok(Self::Hour),
            "day" => Ok(Self::Day),
            "week" => Ok(Self::Week),
            "month" => Ok(Self::Month),
            "year" => Ok(Self::Year),
            _ => Err(Error::new(
                "Invalid nm_query_window_timebase value (valid values are: hour, day, week, \
                 month or year)",
            )
            .set_kind(ErrorKind::Configuration)),
        }
    }
}

impl std::fmt::Display for Timebase {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Hour => write!(fmt, "hour"),
            Self::Day => write!(fmt, "day"),
            Self::Week => write!(fmt, "week"),
            Self::Month => write!(fmt, "month"),
            Self::Year => write!(fmt, "year"),
        }
    }
}

/// A sliding date range over a search.
///
/// With a duration of `d` timebase units, position `p` shows messages from
/// `d * (p + 1)` to `d * p` units ago. Position 0 is the most recent window
/// and is open-ended, so that mail dated in the future still shows.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct QueryWindow {
    pub duration: i64,
    pub timebase: String,
    pub position: u64,
    /// The query the position refers to.
    pub current_search: Option<String>,
}

impl QueryWindow {
    pub fn new(settings: &NotmuchSettings) -> Self {
        Self {
            duration: settings.nm_query_window_duration,
            timebase: settings.nm_query_window_timebase.clone(),
            position: 0,
            current_search: None,
        }
    }

    /// Move towards more recent mail.
    pub fn forward(&mut self) {
        self.position = self.position.saturating_sub(1);
        log::trace!("query window position {}", self.position);
    }

    /// Move towards older mail.
    pub fn backward(&mut self) {
        self.position += 1;
        log::trace!("query window position {}", self.position);
    }

    pub fn reset(&mut self) {
        self.position = 0;
    }

    /// Wrap `query` in the current window, or return `None` if no window
    /// applies: windowing is disabled, the timebase is invalid, or the
    /// query already restricts the date.
    ///
    /// A query different from the last one starts again at position 0.
    pub fn apply(&mut self, query: &str) -> Option<String> {
        if self.duration <= 0 {
            self.reset();
            return None;
        }
        if self.current_search.as_deref() != Some(query) {
            self.reset();
            self.current_search = Some(query.to_string());
        }
        if query.contains("date:") {
            return None;
        }
        let timebase = match self.timebase.parse::<Timebase>() {
            Ok(t) => t,
            Err(err) => {
                log::error!("{}", err.summary);
                return None;
            }
        };
        let position = i64::try_from(self.position).unwrap_or(i64::MAX);
        let beg = self.duration.saturating_mul(position.saturating_add(1));
        let end = self.duration.saturating_mul(position);
        let ret = if end == 0 {
            format!("date:{beg}{timebase}.. and {query}")
        } else {
            format!("date:{beg}{timebase}..{end}{timebase} and {query}")
        };
        log::debug!("windowed query: {} -> {}", query, ret);
        Some(ret)
    }
}
