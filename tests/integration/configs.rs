//
// meli
//
// Copyright 2024 Emmanouil Pitsidianakis <manos@pitsidianak.is>
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

use mailfold::{
    error::ErrorKind, notmuch::QueryType, AccountSettings, MboxFormat, MboxSettings,
    NotmuchSettings,
};

#[test]
fn test_mbox_config() {
    use tempfile::TempDir;

    let tmp_dir = TempDir::new().unwrap();

    let s: AccountSettings = toml::from_str(&format!(
        r#"
name = "foo"
root_mailbox = "{}/inbox"
format = "mbox"
    "#,
        tmp_dir.path().display()
    ))
    .unwrap();
    MboxSettings::validate_config(&s).unwrap();
    let settings = MboxSettings::new(&s).unwrap();
    assert!(!settings.mbox_check_recent);
    assert_eq!(settings.prefer_mbox_type, MboxFormat::Mbox);

    let s: AccountSettings = toml::from_str(&format!(
        r#"
name = "foo"
root_mailbox = "{0}/inbox"
format = "mbox"
read_only = true
mbox_check_recent = "true"
check_mbox_size = "true"
prefer_mbox_type = "mmdf"
tmpdir = "{0}"
    "#,
        tmp_dir.path().display()
    ))
    .unwrap();
    assert!(s.read_only);
    MboxSettings::validate_config(&s).unwrap();
    let settings = MboxSettings::new(&s).unwrap();
    assert!(settings.mbox_check_recent);
    assert!(settings.check_mbox_size);
    assert_eq!(settings.prefer_mbox_type, MboxFormat::Mmdf);
    assert_eq!(settings.tmpdir, tmp_dir.path());

    let s: AccountSettings = toml::from_str(&format!(
        r#"
name = "foo"
root_mailbox = "{}/inbox"
format = "mbox"
prefer_mbox_type = "maildir"
    "#,
        tmp_dir.path().display()
    ))
    .unwrap();
    let err = MboxSettings::validate_config(&s).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Configuration);
    assert!(err.summary.contains("prefer_mbox_type"), "{}", err.summary);

    let s: AccountSettings = toml::from_str(&format!(
        r#"
name = "foo"
root_mailbox = "{}/inbox"
format = "mbox"
mbox_check_recnet = "true"
    "#,
        tmp_dir.path().display()
    ))
    .unwrap();
    let err = MboxSettings::validate_config(&s).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Configuration);
    assert_eq!(
        err.summary,
        "Configuration error (foo): the following flags are set but are not recognized: \
         [\"mbox_check_recnet\"]."
    );
}

#[test]
fn test_notmuch_config() {
    let s: AccountSettings = toml::from_str(
        r#"
name = "foo"
root_mailbox = "/home/foo/mail"
format = "notmuch"
    "#,
    )
    .unwrap();
    NotmuchSettings::validate_config(&s).unwrap();
    let settings = NotmuchSettings::new(&s).unwrap();
    assert_eq!(settings.nm_db_limit, 0);
    assert_eq!(settings.nm_query_type, QueryType::Messages);
    assert_eq!(settings.nm_query_window_duration, 0);
    assert!(settings.exclude_tags().is_empty());

    let s: AccountSettings = toml::from_str(
        r#"
name = "foo"
root_mailbox = "/home/foo/mail"
format = "notmuch"
nm_default_uri = "notmuch:///home/foo/mail?query=tag:inbox"
nm_db_limit = "500"
nm_exclude_tags = "spam,deleted"
nm_open_timeout = "10"
nm_query_type = "threads"
nm_query_window_duration = "2"
nm_query_window_timebase = "month"
nm_record_tags = "+sent -unread"
nm_unread_tag = "new"
    "#,
    )
    .unwrap();
    NotmuchSettings::validate_config(&s).unwrap();
    let settings = NotmuchSettings::new(&s).unwrap();
    assert_eq!(
        settings.nm_default_uri.as_deref(),
        Some("notmuch:///home/foo/mail?query=tag:inbox")
    );
    assert_eq!(settings.nm_db_limit, 500);
    assert_eq!(settings.exclude_tags(), vec!["spam", "deleted"]);
    assert_eq!(settings.nm_open_timeout, 10);
    assert_eq!(settings.nm_query_type, QueryType::Threads);
    assert_eq!(settings.nm_query_window_duration, 2);
    assert_eq!(settings.nm_query_window_timebase, "month");
    assert_eq!(settings.nm_record_tags.as_deref(), Some("+sent -unread"));
    assert_eq!(settings.nm_unread_tag, "new");

    for (key, value) in [
        ("nm_db_limit", "lots"),
        ("nm_open_timeout", "-1"),
        ("nm_query_type", "conversations"),
    ] {
        let s: AccountSettings = toml::from_str(&format!(
            r#"
name = "foo"
root_mailbox = "/home/foo/mail"
format = "notmuch"
{key} = "{value}"
    "#
        ))
        .unwrap();
        let err = NotmuchSettings::validate_config(&s).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Configuration, "{key}");
        assert!(err.summary.contains(key), "{}", err.summary);
    }

    let s: AccountSettings = toml::from_str(
        r#"
name = "foo"
root_mailbox = "/home/foo/mail"
format = "notmuch"
mbox_check_recent = "true"
    "#,
    )
    .unwrap();
    let err = NotmuchSettings::validate_config(&s).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Configuration);
    assert!(err.summary.contains("mbox_check_recent"), "{}", err.summary);
}
