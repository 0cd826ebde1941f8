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

//! Process-associated advisory locking (POSIX) and open file description
//! locking (Linux-only).
//!
//! A mailbox session locks a duplicate of its file descriptor
//! ([`std::fs::File::try_clone`]); with open file description locks the
//! duplicate shares the lock with the original, and dropping the
//! [`FileLock`] releases it.

use std::{os::fd::AsRawFd, path::Path, thread::sleep, time::Duration};

use cfg_if::cfg_if;

use crate::error::{Errno, Error, ErrorKind, Result};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FileLockKind {
    /// `F_RDLCK`, held while scanning for new content.
    Shared,
    /// `F_WRLCK`, held while rewriting or appending.
    Exclusive,
}

impl FileLockKind {
    const fn as_l_type(self) -> libc::c_short {
        match self {
            Self::Shared => libc::F_RDLCK as libc::c_short,
            Self::Exclusive => libc::F_WRLCK as libc::c_short,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub enum FileLockOptions {
    Nonblocking {
        max_tries: u8,
        try_wait: Option<Duration>,
    },
    Blocking,
}

impl FileLockOptions {
    pub const fn try_thrice() -> Self {
        Self::Nonblocking {
            max_tries: 3,
            try_wait: Some(Duration::from_millis(100)),
        }
    }

    pub const fn once() -> Self {
        Self::Nonblocking {
            max_tries: 1,
            try_wait: None,
        }
    }
}

#[derive(Debug)]
pub struct FileLock<T: AsRawFd> {
    inner: T,
    kind: FileLockKind,
}

cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        // F_OFD_SETLKW
        const F_SETLKW: libc::c_int = 38;
        // F_OFD_SETLK
        const F_SETLK: libc::c_int = 37;
    } else {
        const F_SETLKW: libc::c_int = libc::F_SETLKW;
        const F_SETLK: libc::c_int = libc::F_SETLK;
    }
}

fn flock_for(l_type: libc::c_short) -> libc::flock {
    // SAFETY: flock is a plain C struct; all-zeroes is a valid value and
    // platform specific padding fields stay zero.
    let mut flock: libc::flock = unsafe { std::mem::zeroed() };
    flock.l_type = l_type;
    flock.l_whence = libc::SEEK_SET as libc::c_short;
    // l_start = 0 and l_len = 0 lock the whole file, however large it grows.
    // l_pid must be zero for open file description locks.
    flock
}

impl<T: AsRawFd> FileLock<T> {
    pub const fn kind(&self) -> FileLockKind {
        self.kind
    }

    fn release(&self) {
        let fd: libc::c_int = self.inner.as_raw_fd();
        let mut flock = flock_for(libc::F_UNLCK as libc::c_short);
        let ret_val = unsafe { libc::fcntl(fd, F_SETLK, &mut flock) };
        log::trace!("released {:?} lock on fd {}, got {}", self.kind, fd, ret_val);
    }

    /// Release the lock and give back the locked value.
    pub fn unlock(self) -> T {
        let this = std::mem::ManuallyDrop::new(self);
        this.release();
        // SAFETY: `this` is never dropped, so `inner` is moved out exactly once.
        unsafe { std::ptr::read(&this.inner) }
    }
}

impl<T: AsRawFd> Drop for FileLock<T> {
    fn drop(&mut self) {
        self.release();
    }
}

pub trait FileLockTrait: AsRawFd + Sized {
    fn lock(self, kind: FileLockKind, options: FileLockOptions, path: &Path)
        -> Result<FileLock<Self>>;
}

impl<T> FileLockTrait for T
where
    T: AsRawFd,
{
    // Open file description locking
    // # man fcntl
    fn lock(self, kind: FileLockKind, options: FileLockOptions, path: &Path) -> Result<FileLock<T>> {
        let fd: libc::c_int = self.as_raw_fd();
        let mut flock = flock_for(kind.as_l_type());
        let (op, max_tries, try_wait) = match options {
            FileLockOptions::Blocking => (F_SETLKW, 1, None),
            FileLockOptions::Nonblocking {
                max_tries,
                try_wait,
            } => (F_SETLK, max_tries.max(1), try_wait),
        };
        let mut err = Errno::UnknownErrno;
        for attempt in 0..max_tries {
            if attempt > 0 {
                if let Some(dur) = try_wait {
                    sleep(dur);
                }
            }
            let ret_val = unsafe { libc::fcntl(fd, op, &mut flock) };
            if ret_val == 0 {
                log::trace!("acquired {:?} lock on {}", kind, path.display());
                return Ok(FileLock { inner: self, kind });
            }
            err = Errno::last();
            if !matches!(err, Errno::EAGAIN | Errno::EACCES | Errno::EINTR) {
                break;
            }
        }

        let error_kind = if matches!(err, Errno::EAGAIN | Errno::EACCES) {
            ErrorKind::WouldBlock
        } else {
            ErrorKind::OSError(err)
        };
        Err(Error::new(format!(
            "Could not lock {}: fcntl() returned {}",
            path.display(),
            err.desc()
        ))
        .set_kind(error_kind)
        .set_source(Some(std::sync::Arc::new(err))))
    }
}

impl<T: AsRawFd> std::ops::Deref for FileLock<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<T: AsRawFd> std::ops::DerefMut for FileLock<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

impl<T: AsRawFd + std::io::Read> std::io::Read for FileLock<T> {
    fn read(&mut self, input: &mut [u8]) -> std::result::Result<usize, std::io::Error> {
        self.inner.read(input)
    }
}

impl<T: AsRawFd + std::io::Seek> std::io::Seek for FileLock<T> {
    fn seek(&mut self, pos: std::io::SeekFrom) -> std::result::Result<u64, std::io::Error> {
        self.inner.seek(pos)
    }
}

impl<T: AsRawFd + std::io::Write> std::io::Write for FileLock<T> {
    fn write(&mut self, buf: &[u8]) -> std::result::Result<usize, std::io::Error> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::result::Result<(), std::io::Error> {
        self.inner.flush()
    }
}
