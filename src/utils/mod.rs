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

//! Utility modules for general use.

pub mod datetime;
pub mod interrupt;
pub mod lock;
pub mod logging;
pub mod percent_encoding;
pub mod shellexpand;

use std::path::PathBuf;

/// `user-host-pid`, used to name files that must not collide with other
/// processes or machines sharing a directory.
pub fn process_tag() -> String {
    let user = username();
    let host = nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{}-{}-{}", user, host, std::process::id())
}

/// Login name of the current user, or the numeric uid when it has none.
pub fn username() -> String {
    nix::unistd::User::from_uid(nix::unistd::getuid())
        .ok()
        .flatten()
        .map(|u| u.name)
        .unwrap_or_else(|| nix::unistd::getuid().to_string())
}

/// The default directory for preserved files.
pub fn default_tmpdir() -> PathBuf {
    std::env::temp_dir()
}
