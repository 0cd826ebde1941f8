/*
 * meli - melib crate.
 *
 * Copyright 2017-2020 Manos Pitsidianakis
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

//! URL percent-encoding of query components.

use std::borrow::Cow;

/// Bytes left as-is: RFC 3986 unreserved characters plus `/`, which keeps
/// database paths readable.
const fn is_unreserved(b: u8) -> bool {
    matches!(b, b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' | b'/')
}

pub fn utf8_percent_encode(input: &str) -> Cow<'_, str> {
    if input.bytes().all(is_unreserved) {
        return Cow::Borrowed(input);
    }
    let mut ret = String::with_capacity(input.len() * 3);
    for b in input.bytes() {
        if is_unreserved(b) {
            ret.push(b as char);
        } else {
            ret.push_str(&format!("%{:02X}", b));
        }
    }
    Cow::Owned(ret)
}

/// Decode `%XX` escapes; malformed escapes are kept literally. `+` is not
/// treated as a space, since it is a valid tag operator in queries.
pub fn percent_decode(input: &str) -> Cow<'_, str> {
    if !input.contains('%') {
        return Cow::Borrowed(input);
    }
    let bytes = input.as_bytes();
    let mut ret = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = Some(&bytes[i + 1..i + 3])
                .filter(|h| h.iter().all(u8::is_ascii_hexdigit))
                .and_then(|h| std::str::from_utf8(h).ok())
                .and_then(|h| u8::from_str_radix(h, 16).ok());
            if let Some(b) = hex {
                ret.push(b);
                i += 3;
                continue;
            }
        }
        ret.push(bytes[i]);
        i += 1;
    }
    Cow::Owned(String::from_utf8_lossy(&ret).into_owned())
}
