/*
 * meli - error module
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

//! An error object for `mailfold`.
//!
//! Status outcomes of mailbox operations (new mail, reopened, locked) are
//! returned as values; [`Error`] is reserved for failures the caller cannot
//! treat as an ordinary outcome.

use std::{borrow::Cow, fmt, io, path::PathBuf, result, str, string, sync::Arc};

pub use nix::errno::Errno;

pub type Result<T> = result::Result<T, Error>;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ErrorKind {
    #[default]
    None,
    External,
    Bug,
    Configuration,
    NotImplemented,
    NotSupported,
    NotFound,
    ValueError,
    /// A lock could not be acquired or the index database is busy.
    WouldBlock,
    TimedOut,
    Interrupted,
    ReadOnly,
    /// The mailbox can no longer be trusted and has been closed.
    Corrupted,
    /// A rewrite failed after the new content was written out; it has been
    /// kept at [`Error::related_path`].
    DataPreserved,
    Platform,
    OSError(Errno),
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(
            fmt,
            "{}",
            match self {
                Self::None => "None",
                Self::External => "External",
                Self::Bug => "Bug, please report this!",
                Self::Configuration => "Configuration error",
                Self::NotImplemented => "Not implemented",
                Self::NotSupported => "Not supported",
                Self::NotFound => "Not found",
                Self::ValueError => "Invalid value",
                Self::WouldBlock => "Resource busy",
                Self::TimedOut => "Timed out",
                Self::Interrupted => "Interrupted",
                Self::ReadOnly => "Read-only",
                Self::Corrupted => "Mailbox is corrupted",
                Self::DataPreserved => "Write failed, data was preserved",
                Self::Platform => "Platform/Runtime environment error",
                Self::OSError(errno) => errno.desc(),
            }
        )
    }
}

impl ErrorKind {
    pub const fn is_would_block(&self) -> bool {
        matches!(
            self,
            Self::WouldBlock | Self::OSError(Errno::EAGAIN) | Self::OSError(Errno::EACCES)
        )
    }

    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound | Self::OSError(Errno::ENOENT))
    }
}

#[derive(Clone, Debug)]
pub struct Error {
    pub summary: Cow<'static, str>,
    pub details: Option<Cow<'static, str>>,
    pub source: Option<Arc<dyn std::error::Error + Send + Sync + 'static>>,
    pub related_path: Option<PathBuf>,
    pub kind: ErrorKind,
}

pub trait IntoError {
    fn set_err_summary<M>(self, msg: M) -> Error
    where
        M: Into<Cow<'static, str>>;

    fn set_err_details<M>(self, msg: M) -> Error
    where
        M: Into<Cow<'static, str>>;

    fn set_err_kind(self, kind: ErrorKind) -> Error;
}

pub trait WrapResultIntoError<T, I>
where
    I: Send + Sync + std::error::Error + 'static,
{
    /// Wrap the error in a new [`Error`] with `msg_fn` as its summary, keeping
    /// the original as its source.
    fn wrap_err<M, F>(self, msg_fn: F) -> Result<T>
    where
        F: Fn() -> M,
        M: Into<Cow<'static, str>>;
}

impl<T, I> WrapResultIntoError<T, I> for result::Result<T, I>
where
    I: Send + Sync + std::error::Error + 'static,
{
    #[inline]
    fn wrap_err<M, F>(self, msg_fn: F) -> Result<T>
    where
        F: Fn() -> M,
        M: Into<Cow<'static, str>>,
    {
        self.map_err(|err| Error::new(msg_fn()).set_source(Some(Arc::new(err))))
    }
}

impl<I: Into<Error>> IntoError for I {
    #[inline]
    fn set_err_summary<M>(self, msg: M) -> Error
    where
        M: Into<Cow<'static, str>>,
    {
        let err: Error = self.into();
        err.set_summary(msg)
    }

    #[inline]
    fn set_err_details<M>(self, msg: M) -> Error
    where
        M: Into<Cow<'static, str>>,
    {
        let err: Error = self.into();
        err.set_details(msg)
    }

    #[inline]
    fn set_err_kind(self, kind: ErrorKind) -> Error {
        let err: Error = self.into();
        err.set_kind(kind)
    }
}

impl Error {
    pub fn new<M>(msg: M) -> Self
    where
        M: Into<Cow<'static, str>>,
    {
        Self {
            summary: msg.into(),
            details: None,
            source: None,
            related_path: None,
            kind: ErrorKind::None,
        }
    }

    pub fn set_details<M>(mut self, details: M) -> Self
    where
        M: Into<Cow<'static, str>>,
    {
        if let Some(old_details) = self.details.as_ref() {
            self.details = Some(format!("{}. {}", old_details, details.into()).into());
        } else {
            self.details = Some(details.into());
        }
        self
    }

    pub fn set_summary<M>(mut self, summary: M) -> Self
    where
        M: Into<Cow<'static, str>>,
    {
        let old_summary = std::mem::replace(&mut self.summary, summary.into());
        if !old_summary.is_empty() {
            self = self.set_details(old_summary);
        }
        self
    }

    pub fn set_source(
        mut self,
        new_val: Option<Arc<dyn std::error::Error + Send + Sync + 'static>>,
    ) -> Self {
        self.source = new_val;
        self
    }

    pub fn set_kind(mut self, new_val: ErrorKind) -> Self {
        self.kind = new_val;
        self
    }

    pub fn set_related_path<P: Into<PathBuf>>(mut self, new_val: P) -> Self {
        self.related_path = Some(new_val.into());
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "{}", self.summary)?;
        if let Some(details) = self.details.as_ref() {
            if !details.trim().is_empty() {
                writeln!(f, "{}", details)?;
            }
        }
        if let Some(path) = self.related_path.as_ref() {
            writeln!(f, "Related path: {}", path.display())?;
        }
        if let Some(source) = self.source.as_ref() {
            writeln!(f, "Caused by: {}", source)?;
        }
        if self.kind != ErrorKind::None {
            write!(f, "Error kind: {}", self.kind)?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|s| &(*(*s)) as &(dyn std::error::Error + 'static))
    }
}

impl From<io::Error> for Error {
    #[inline]
    fn from(err: io::Error) -> Self {
        let kind = match (err.raw_os_error(), err.kind()) {
            (Some(code), _) => ErrorKind::OSError(Errno::from_raw(code)),
            (None, io::ErrorKind::NotFound) => ErrorKind::NotFound,
            (None, io::ErrorKind::WouldBlock) => ErrorKind::WouldBlock,
            (None, io::ErrorKind::TimedOut) => ErrorKind::TimedOut,
            (None, io::ErrorKind::Interrupted) => ErrorKind::Interrupted,
            (None, io::ErrorKind::Unsupported) => ErrorKind::NotSupported,
            _ => ErrorKind::External,
        };
        let summary = err.to_string();
        Self::new(summary)
            .set_kind(kind)
            .set_source(Some(Arc::new(err)))
    }
}

impl From<Errno> for Error {
    #[inline]
    fn from(err: Errno) -> Self {
        Self::new(err.desc())
            .set_kind(ErrorKind::OSError(err))
            .set_source(Some(Arc::new(err)))
    }
}

impl From<string::FromUtf8Error> for Error {
    #[inline]
    fn from(err: string::FromUtf8Error) -> Self {
        Self::new(err.to_string())
            .set_kind(ErrorKind::ValueError)
            .set_source(Some(Arc::new(err)))
    }
}

impl From<str::Utf8Error> for Error {
    #[inline]
    fn from(err: str::Utf8Error) -> Self {
        Self::new(err.to_string())
            .set_kind(ErrorKind::ValueError)
            .set_source(Some(Arc::new(err)))
    }
}

impl From<std::num::ParseIntError> for Error {
    #[inline]
    fn from(err: std::num::ParseIntError) -> Self {
        Self::new(err.to_string())
            .set_kind(ErrorKind::ValueError)
            .set_source(Some(Arc::new(err)))
    }
}

impl From<std::str::ParseBoolError> for Error {
    #[inline]
    fn from(err: std::str::ParseBoolError) -> Self {
        Self::new(err.to_string())
            .set_kind(ErrorKind::ValueError)
            .set_source(Some(Arc::new(err)))
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    #[inline]
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::new(err.to_string()).set_kind(ErrorKind::Bug)
    }
}

impl From<&str> for Error {
    #[inline]
    fn from(err: &str) -> Self {
        Self::new(err.to_string())
    }
}

impl From<String> for Error {
    #[inline]
    fn from(err: String) -> Self {
        Self::new(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_io_kind_mapping() {
        let err: Error = io::Error::from_raw_os_error(libc::ENOENT).into();
        assert_eq!(err.kind, ErrorKind::OSError(Errno::ENOENT));
        assert!(err.kind.is_not_found());

        let err: Error = io::Error::new(io::ErrorKind::WouldBlock, "busy").into();
        assert_eq!(err.kind, ErrorKind::WouldBlock);
        assert!(err.kind.is_would_block());
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_error_set_summary_keeps_old_summary_as_details() {
        let err = Error::new("could not read line")
            .set_summary("Could not parse mailbox")
            .set_kind(ErrorKind::Corrupted)
            .set_related_path("/tmp/mbox");
        assert_eq!(err.summary, "Could not parse mailbox");
        assert_eq!(err.details.as_deref(), Some("could not read line"));
        let display = err.to_string();
        assert!(display.contains("Related path: /tmp/mbox"));
        assert!(display.contains(&ErrorKind::Corrupted.to_string()));
    }

    #[test]
    fn test_error_into_error() {
        let err = io::Error::from_raw_os_error(libc::EACCES)
            .set_err_summary("Could not open mailbox")
            .set_err_kind(ErrorKind::ReadOnly);
        assert_eq!(err.summary, "Could not open mailbox");
        assert_eq!(err.kind, ErrorKind::ReadOnly);
        assert!(err.details.is_some());

        let err = "bad value".set_err_details("expected a number");
        assert_eq!(err.summary, "bad value");
        assert_eq!(err.details.as_deref(), Some("expected a number"));
    }

    #[test]
    fn test_error_wrap_err() {
        let res: result::Result<(), io::Error> =
            Err(io::Error::new(io::ErrorKind::Other, "disk on fire"));
        let err = res.wrap_err(|| "Could not write temporary file").unwrap_err();
        assert_eq!(err.summary, "Could not write temporary file");
        assert_eq!(
            err.source.as_ref().map(|s| s.to_string()).as_deref(),
            Some("disk on fire")
        );
    }
}
