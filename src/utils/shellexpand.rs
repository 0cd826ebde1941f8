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

//! A `ShellExpandTrait` to expand and normalize paths like a shell.

use std::path::{Component, Path, PathBuf};

pub trait ShellExpandTrait {
    /// Expand `~` and `$VAR` components.
    fn expand(&self) -> PathBuf;

    /// Make the path absolute against the working directory and resolve `.`
    /// and `..` components without touching the file system.
    fn normalize(&self) -> PathBuf;
}

impl ShellExpandTrait for Path {
    fn expand(&self) -> PathBuf {
        let mut ret = PathBuf::new();
        for c in self.components() {
            let c_to_str = c.as_os_str().to_str();
            match c_to_str {
                Some("~") => {
                    if let Ok(home_dir) = std::env::var("HOME") {
                        ret.push(home_dir)
                    } else {
                        return PathBuf::new();
                    }
                }
                Some(var) if var.starts_with('$') => {
                    let env_name = var.split_at(1).1;
                    if !env_name.is_empty()
                        && env_name
                            .chars()
                            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
                    {
                        ret.push(std::env::var(env_name).unwrap_or_default());
                    } else {
                        ret.push(c);
                    }
                }
                Some(_) => {
                    ret.push(c);
                }
                None => {
                    /* path is invalid */
                    return PathBuf::new();
                }
            }
        }
        ret
    }

    fn normalize(&self) -> PathBuf {
        let absolute = if self.is_absolute() {
            self.to_path_buf()
        } else {
            std::env::current_dir().unwrap_or_default().join(self)
        };
        let mut ret = PathBuf::new();
        for c in absolute.components() {
            match c {
                Component::CurDir => {}
                Component::ParentDir => {
                    ret.pop();
                }
                other => ret.push(other),
            }
        }
        ret
    }
}

#[test]
fn test_shellexpandtrait() {
    std::env::set_var("MAILFOLD_TEST_DIR", "/var/mail");
    assert_eq!(
        Path::new("$MAILFOLD_TEST_DIR/inbox").expand(),
        PathBuf::from("/var/mail/inbox")
    );
    assert_eq!(
        Path::new("$lowercase/inbox").expand(),
        PathBuf::from("$lowercase/inbox")
    );
    assert_eq!(
        Path::new("/var/./mail/../spool/inbox").normalize(),
        PathBuf::from("/var/spool/inbox")
    );
    assert_eq!(Path::new("/..").normalize(), PathBuf::from("/"));
}
