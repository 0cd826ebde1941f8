/*
 * meli - melib library
 *
 * Copyright 2020 Manos Pitsidianakis
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

//! Functions for dealing with date strings and UNIX Epoch timestamps.
//!
//! # Examples
//!
//! ```rust
//! # use mailfold::utils::datetime::*;
//! let ts = parse_asctime("Fri Jun 23 02:56:55 2000").unwrap();
//! assert_eq!(ts, 961729015);
//! assert_eq!(asctime(ts), "Fri Jun 23 02:56:55 2000");
//! ```

use std::{sync::OnceLock, time::SystemTime};

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use regex::Regex;

pub type UnixTimestamp = u64;

pub mod formats {
    /// <day-of-week> <month> <day> <hh:mm:ss> <year>, as produced by `asctime(3)`.
    pub const ASCTIME_FMT: &str = "%a %b %e %H:%M:%S %Y";
    pub const RFC3339_DATETIME_AND_SPACE: &str = "%Y-%m-%d %H:%M:%S";
}

pub fn now() -> UnixTimestamp {
    Utc::now().timestamp().max(0) as UnixTimestamp
}

pub fn system_time_to_timestamp(t: SystemTime) -> UnixTimestamp {
    t.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Return a UNIX epoch timestamp as string in the local timezone, using `fmt`
/// as the format argument, or RFC 3339 with a space separator if `None`.
pub fn timestamp_to_string(timestamp: UnixTimestamp, fmt: Option<&str>) -> String {
    let fmt = fmt.unwrap_or(formats::RFC3339_DATETIME_AND_SPACE);
    i64::try_from(timestamp)
        .ok()
        .and_then(|t| Local.timestamp_opt(t, 0).single())
        .map(|d| d.format(fmt).to_string())
        .unwrap_or_default()
}

/// Format a timestamp the way envelope postmark lines carry it, in UTC.
pub fn asctime(timestamp: UnixTimestamp) -> String {
    i64::try_from(timestamp)
        .ok()
        .and_then(|t| DateTime::<Utc>::from_timestamp(t, 0))
        .unwrap_or_default()
        .format(formats::ASCTIME_FMT)
        .to_string()
}

/// Parse an RFC 5322 `Date:` header value.
pub fn rfc822_to_timestamp(s: &str) -> Option<UnixTimestamp> {
    let s = s.trim();
    // Strip trailing comments such as "(CET)".
    let s = match s.find('(') {
        Some(pos) => s[..pos].trim_end(),
        None => s,
    };
    DateTime::parse_from_rfc2822(s)
        .ok()
        .map(|d| d.timestamp().max(0) as UnixTimestamp)
}

fn time_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(\d{1,2}):(\d{2})(?::(\d{2}))?$").unwrap_or_else(|_| unreachable!())
    })
}

/// Parse the timestamp of an envelope postmark.
///
/// Accepts `asctime(3)` output and the usual deviations found in the wild:
/// a missing weekday, missing seconds, two-digit years, and timezone names or
/// numeric offsets placed before or after the year. Numeric offsets are
/// honoured, names are ignored.
pub fn parse_asctime(s: &str) -> Option<UnixTimestamp> {
    let mut tokens = s.split_whitespace().peekable();
    if tokens
        .peek()
        .map_or(false, |t| t.len() >= 3 && t.chars().all(|c| c.is_ascii_alphabetic() || c == ','))
        && tokens.peek().and_then(|t| month_number(t)).is_none()
    {
        tokens.next();
    }
    let month = month_number(tokens.next()?)?;
    let day: u32 = tokens.next()?.trim_end_matches(',').parse().ok()?;
    let time = time_token_re().captures(tokens.next()?)?;
    let hour: u32 = time.get(1)?.as_str().parse().ok()?;
    let minute: u32 = time.get(2)?.as_str().parse().ok()?;
    let second: u32 = time.get(3).map_or(Some(0), |m| m.as_str().parse().ok())?;

    let mut year: Option<i32> = None;
    let mut offset_secs: i64 = 0;
    for token in tokens {
        if let Some(off) = numeric_offset(token) {
            offset_secs = off;
        } else if year.is_none() && token.chars().all(|c| c.is_ascii_digit()) {
            let y: i32 = token.parse().ok()?;
            year = Some(match (token.len(), y) {
                (2, y) if y >= 70 => 1900 + y,
                (2, y) => 2000 + y,
                (_, y) => y,
            });
        }
    }
    let date = NaiveDate::from_ymd_opt(year?, month, day)?;
    let time = NaiveTime::from_hms_opt(hour, minute, second)?;
    let ts = NaiveDateTime::new(date, time).and_utc().timestamp() - offset_secs;
    Some(ts.max(0) as UnixTimestamp)
}

fn month_number(token: &str) -> Option<u32> {
    const MONTHS: [&str; 12] = [
        "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
    ];
    let token = token.get(..3)?.to_ascii_lowercase();
    MONTHS
        .iter()
        .position(|m| *m == token)
        .map(|p| p as u32 + 1)
}

fn numeric_offset(token: &str) -> Option<i64> {
    let (sign, digits) = match token.as_bytes().first()? {
        b'+' => (1, &token[1..]),
        b'-' => (-1, &token[1..]),
        _ => return None,
    };
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let hours: i64 = digits[..2].parse().ok()?;
    let minutes: i64 = digits[2..].parse().ok()?;
    Some(sign * (hours * 3600 + minutes * 60))
}

/// Local time, used for log lines.
pub fn now_local_string() -> String {
    Local::now()
        .format(formats::RFC3339_DATETIME_AND_SPACE)
        .to_string()
}
