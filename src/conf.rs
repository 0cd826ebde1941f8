/*
 * meli - melib configuration
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

//! Basic mail account configuration to use with the mailbox backends.
//!
//! Backend specific options live in [`AccountSettings::extra`] and are read
//! into typed settings with [`get_conf_val!`].

use std::{collections::HashMap, path::PathBuf, str::FromStr};

use crate::{
    error::{Error, ErrorKind, Result},
    mbox::MboxFormat,
    notmuch::QueryType,
};

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct AccountSettings {
    #[serde(default)]
    pub name: String,
    pub root_mailbox: String,
    pub format: String,
    #[serde(default)]
    pub read_only: bool,
    #[serde(flatten)]
    pub extra: HashMap<String, String>,
}

/// Read a value from [`AccountSettings::extra`], parsing it with
/// [`FromStr`](std::str::FromStr).
///
/// `get_conf_val!(s["key"])` fails when the key is missing;
/// `get_conf_val!(s["key"], default)` falls back to `default`.
#[macro_export]
macro_rules! get_conf_val {
    ($s:ident[$var:literal]) => {
        $s.extra
            .get($var)
            .ok_or_else(|| {
                $crate::error::Error::new(format!(
                    "Configuration error ({}): {} backend requires the field `{}` set",
                    $s.name.as_str(),
                    $s.format.as_str(),
                    $var
                ))
                .set_kind($crate::error::ErrorKind::Configuration)
            })
            .and_then(|v| {
                <_>::from_str(v).map_err(|e| {
                    $crate::error::Error::new(format!(
                        "Configuration error ({}): Invalid value for field `{}`: {v}\n{e}",
                        $s.name.as_str(),
                        $var
                    ))
                    .set_kind($crate::error::ErrorKind::Configuration)
                })
            })
    };
    ($s:ident[$var:literal], $default:expr) => {
        $s.extra
            .get($var)
            .map(|v| {
                <_>::from_str(v).map_err(|e| {
                    $crate::error::Error::new(format!(
                        "Configuration error ({}): Invalid value for field `{}`: {v}\n{e}",
                        $s.name.as_str(),
                        $var
                    ))
                    .set_kind($crate::error::ErrorKind::Configuration)
                })
            })
            .unwrap_or_else(|| Ok($default))
    };
}

fn reject_unknown_keys(s: &AccountSettings, known: &[&str]) -> Result<()> {
    let mut unknown = s
        .extra
        .keys()
        .filter(|k| !known.contains(&k.as_str()))
        .map(String::as_str)
        .collect::<Vec<&str>>();
    if unknown.is_empty() {
        return Ok(());
    }
    unknown.sort_unstable();
    Err(Error::new(format!(
        "Configuration error ({}): the following flags are set but are not recognized: {:?}.",
        s.name.as_str(),
        unknown
    ))
    .set_kind(ErrorKind::Configuration))
}

#[derive(Clone, Debug)]
pub struct MboxSettings {
    /// Do not fake an older access time when unread mail remains.
    pub mbox_check_recent: bool,
    /// Leave file times alone when probing.
    pub check_mbox_size: bool,
    /// Where to keep the partial mailbox of a failed rewrite.
    pub tmpdir: PathBuf,
    /// Format of newly created mailboxes.
    pub prefer_mbox_type: MboxFormat,
}

impl Default for MboxSettings {
    fn default() -> Self {
        Self {
            mbox_check_recent: false,
            check_mbox_size: false,
            tmpdir: crate::utils::default_tmpdir(),
            prefer_mbox_type: MboxFormat::Mbox,
        }
    }
}

impl MboxSettings {
    pub const KEYS: &'static [&'static str] = &[
        "mbox_check_recent",
        "check_mbox_size",
        "tmpdir",
        "prefer_mbox_type",
    ];

    pub fn new(s: &AccountSettings) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            mbox_check_recent: get_conf_val!(s["mbox_check_recent"], defaults.mbox_check_recent)?,
            check_mbox_size: get_conf_val!(s["check_mbox_size"], defaults.check_mbox_size)?,
            tmpdir: get_conf_val!(s["tmpdir"], defaults.tmpdir)?,
            prefer_mbox_type: get_conf_val!(s["prefer_mbox_type"], defaults.prefer_mbox_type)?,
        })
    }

    pub fn validate_config(s: &AccountSettings) -> Result<()> {
        Self::new(s)?;
        reject_unknown_keys(s, Self::KEYS)
    }
}

#[derive(Clone, Debug)]
pub struct NotmuchSettings {
    /// Database used when a `notmuch://` URI omits its path.
    pub nm_default_uri: Option<String>,
    /// Maximum number of results loaded into a virtual mailbox, 0 for no
    /// limit.
    pub nm_db_limit: usize,
    pub nm_exclude_tags: Option<String>,
    /// Seconds to keep retrying a busy database.
    pub nm_open_timeout: u64,
    pub nm_query_type: QueryType,
    /// Number of timebase units per query window, 0 disables windowing.
    pub nm_query_window_duration: i64,
    pub nm_query_window_timebase: String,
    /// Tags applied to messages recorded through
    /// [`NotmuchMailbox::record_message`](crate::notmuch::NotmuchMailbox::record_message).
    pub nm_record_tags: Option<String>,
    pub nm_unread_tag: String,
}

impl Default for NotmuchSettings {
    fn default() -> Self {
        Self {
            nm_default_uri: None,
            nm_db_limit: 0,
            nm_exclude_tags: None,
            nm_open_timeout: 5,
            nm_query_type: QueryType::Messages,
            nm_query_window_duration: 0,
            nm_query_window_timebase: "week".to_string(),
            nm_record_tags: None,
            nm_unread_tag: "unread".to_string(),
        }
    }
}

impl NotmuchSettings {
    pub const KEYS: &'static [&'static str] = &[
        "nm_default_uri",
        "nm_db_limit",
        "nm_exclude_tags",
        "nm_open_timeout",
        "nm_query_type",
        "nm_query_window_duration",
        "nm_query_window_timebase",
        "nm_record_tags",
        "nm_unread_tag",
    ];

    pub fn new(s: &AccountSettings) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            nm_default_uri: optional(s, "nm_default_uri"),
            nm_db_limit: get_conf_val!(s["nm_db_limit"], defaults.nm_db_limit)?,
            nm_exclude_tags: optional(s, "nm_exclude_tags"),
            nm_open_timeout: get_conf_val!(s["nm_open_timeout"], defaults.nm_open_timeout)?,
            nm_query_type: get_conf_val!(s["nm_query_type"], defaults.nm_query_type)?,
            nm_query_window_duration: get_conf_val!(
                s["nm_query_window_duration"],
                defaults.nm_query_window_duration
            )?,
            nm_query_window_timebase: get_conf_val!(
                s["nm_query_window_timebase"],
                defaults.nm_query_window_timebase
            )?,
            nm_record_tags: optional(s, "nm_record_tags"),
            nm_unread_tag: get_conf_val!(s["nm_unread_tag"], defaults.nm_unread_tag)?,
        })
    }

    pub fn validate_config(s: &AccountSettings) -> Result<()> {
        Self::new(s)?;
        reject_unknown_keys(s, Self::KEYS)
    }

    /// `nm_exclude_tags` split on whitespace and commas.
    pub fn exclude_tags(&self) -> Vec<&str> {
        self.nm_exclude_tags
            .as_deref()
            .unwrap_or_default()
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|t| !t.is_empty())
            .collect()
    }
}

fn optional(s: &AccountSettings, key: &str) -> Option<String> {
    s.extra.get(key).filter(|v| !v.is_empty()).cloned()
}
