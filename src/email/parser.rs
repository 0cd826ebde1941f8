/*
 * meli - parser module
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

//! Parsers for header blocks, in the lenient manner mail stores need: a
//! malformed line is skipped instead of failing the whole block.

use nom::{
    bytes::complete::{tag, take_till, take_while1},
    character::complete::{one_of, space0},
    combinator::{opt, peek, recognize},
    multi::many0,
    sequence::{pair, preceded, terminated, tuple},
    IResult,
};

pub mod headers {
    use super::*;

    /* field-name  =  1*<any CHAR, excluding CTLs, SPACE, and ":"> */
    #[inline]
    const fn is_ftext(c: u8) -> bool {
        c > 32 && c < 127 && c != b':'
    }

    /// A physical line without its terminating `\n`.
    pub fn line(input: &[u8]) -> IResult<&[u8], &[u8]> {
        terminated(take_till(|c| c == b'\n'), opt(tag(b"\n")))(input)
    }

    pub fn header_name(input: &[u8]) -> IResult<&[u8], &[u8]> {
        terminated(take_while1(is_ftext), pair(space0, tag(b":")))(input)
    }

    /// A value and its folded continuation lines, as one slice.
    pub fn header_value(input: &[u8]) -> IResult<&[u8], &[u8]> {
        recognize(pair(line, many0(preceded(peek(one_of(" \t")), line))))(input)
    }

    pub fn header(input: &[u8]) -> IResult<&[u8], (&[u8], &[u8])> {
        tuple((header_name, header_value))(input)
    }

    /// Unfold a raw header value: line breaks are dropped, the leading
    /// whitespace of continuation lines is kept, and the result is trimmed.
    pub fn unfold(value: &[u8]) -> String {
        let mut ret = Vec::with_capacity(value.len());
        for l in value.split(|c| *c == b'\n') {
            ret.extend_from_slice(l.strip_suffix(b"\r").unwrap_or(l));
        }
        String::from_utf8_lossy(&ret).trim().to_string()
    }

    /// Split a header block into `(name, unfolded value)` pairs, skipping
    /// lines that are not fields. Parsing stops at the first empty line.
    pub fn fields(mut input: &[u8]) -> Vec<(String, String)> {
        let mut ret = vec![];
        while !input.is_empty() && !input.starts_with(b"\n") && !input.starts_with(b"\r\n") {
            match header(input) {
                Ok((rest, (name, value))) => {
                    ret.push((String::from_utf8_lossy(name).into_owned(), unfold(value)));
                    input = rest;
                }
                Err(_) => match line(input) {
                    Ok((rest, skipped)) => {
                        log::trace!(
                            "skipping malformed header line {:?}",
                            String::from_utf8_lossy(skipped)
                        );
                        input = rest;
                    }
                    Err(_) => break,
                },
            }
        }
        ret
    }
}
