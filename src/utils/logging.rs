/*
 * melib
 *
 * Copyright 2019 Manos Pitsidianakis
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

#[cfg(not(test))]
use std::fs::OpenOptions;
use std::{
    io::{BufWriter, Write},
    path::PathBuf,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc, Mutex,
    },
};

use log::{Level, LevelFilter, Log, Metadata, Record};

pub const LOG_FILE_NAME: &str = "mailfold.log";
pub const DEBUG_STDERR_VAR: &str = "MAILFOLD_DEBUG_STDERR";

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, PartialOrd, Serialize)]
#[repr(u8)]
pub enum LogLevel {
    OFF = 0,
    ERROR,
    WARN,
    #[default]
    INFO,
    DEBUG,
    TRACE,
}

impl From<u8> for LogLevel {
    fn from(verbosity: u8) -> Self {
        match verbosity {
            0 => Self::OFF,
            1 => Self::ERROR,
            2 => Self::WARN,
            3 => Self::INFO,
            4 => Self::DEBUG,
            _ => Self::TRACE,
        }
    }
}

impl From<Level> for LogLevel {
    fn from(l: Level) -> Self {
        match l {
            Level::Error => Self::ERROR,
            Level::Warn => Self::WARN,
            Level::Info => Self::INFO,
            Level::Debug => Self::DEBUG,
            Level::Trace => Self::TRACE,
        }
    }
}

impl From<LogLevel> for Level {
    fn from(l: LogLevel) -> Self {
        match l {
            LogLevel::ERROR => Self::Error,
            LogLevel::WARN => Self::Warn,
            LogLevel::OFF | LogLevel::INFO => Self::Info,
            LogLevel::DEBUG => Self::Debug,
            LogLevel::TRACE => Self::Trace,
        }
    }
}

impl From<LevelFilter> for LogLevel {
    fn from(l: LevelFilter) -> Self {
        match l {
            LevelFilter::Off => Self::OFF,
            LevelFilter::Error => Self::ERROR,
            LevelFilter::Warn => Self::WARN,
            LevelFilter::Info => Self::INFO,
            LevelFilter::Debug => Self::DEBUG,
            LevelFilter::Trace => Self::TRACE,
        }
    }
}

impl From<LogLevel> for LevelFilter {
    fn from(l: LogLevel) -> Self {
        match l {
            LogLevel::OFF => Self::Off,
            LogLevel::ERROR => Self::Error,
            LogLevel::WARN => Self::Warn,
            LogLevel::INFO => Self::Info,
            LogLevel::DEBUG => Self::Debug,
            LogLevel::TRACE => Self::Trace,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::OFF => "OFF",
                Self::ERROR => "ERROR",
                Self::WARN => "WARN",
                Self::INFO => "INFO",
                Self::DEBUG => "DEBUG",
                Self::TRACE => "TRACE",
            }
        )
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, PartialOrd, Serialize)]
pub enum Destination {
    File,
    #[default]
    Stderr,
    None,
}

struct FileOutput {
    writer: BufWriter<Box<dyn Write + Send>>,
    path: PathBuf,
}

#[derive(Clone)]
pub struct StderrLogger {
    dest: Arc<Mutex<FileOutput>>,
    level: Arc<AtomicU8>,
    print_level: bool,
    print_module_names: bool,
    debug_dest: Destination,
}

impl std::fmt::Debug for StderrLogger {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct(stringify!(StderrLogger))
            .field("level", &LogLevel::from(self.level.load(Ordering::SeqCst)))
            .field("print_level", &self.print_level)
            .field("print_module_names", &self.print_module_names)
            .field("debug_dest", &self.debug_dest)
            .finish()
    }
}

impl Default for StderrLogger {
    fn default() -> Self {
        Self::new(LogLevel::default())
    }
}

#[cfg(not(test))]
fn open_log_file() -> Option<FileOutput> {
    let data_dir = xdg::BaseDirectories::with_prefix("mailfold").ok()?;
    let path = data_dir.place_data_file(LOG_FILE_NAME).ok()?;
    let log_file = OpenOptions::new()
        .append(true)
        .create(true)
        .read(true)
        .open(&path)
        .ok()?;
    Some(FileOutput {
        writer: BufWriter::new(Box::new(log_file)),
        path,
    })
}

fn stderr_output() -> FileOutput {
    FileOutput {
        writer: BufWriter::new(Box::new(std::io::stderr())),
        path: PathBuf::new(),
    }
}

impl StderrLogger {
    pub fn new(level: LogLevel) -> Self {
        use std::sync::Once;

        static INIT_STDERR_LOGGING: Once = Once::new();

        #[cfg(not(test))]
        let logger = {
            let (dest, file_ok) = match open_log_file() {
                Some(output) => (output, true),
                None => (stderr_output(), false),
            };
            Self {
                dest: Arc::new(Mutex::new(dest)),
                level: Arc::new(AtomicU8::new(level as u8)),
                print_level: true,
                print_module_names: true,
                debug_dest: if file_ok && std::env::var(DEBUG_STDERR_VAR).is_ok() {
                    Destination::Stderr
                } else {
                    Destination::None
                },
            }
        };
        #[cfg(test)]
        let logger = Self {
            dest: Arc::new(Mutex::new(stderr_output())),
            level: Arc::new(AtomicU8::new(level as u8)),
            print_level: true,
            print_module_names: true,
            debug_dest: Destination::Stderr,
        };

        log::set_max_level(LevelFilter::from(logger.log_level()));

        INIT_STDERR_LOGGING.call_once(|| {
            if log::set_boxed_logger(Box::new(logger.clone())).is_err() {
                eprintln!("mailfold: a logger was already installed");
            }
        });
        logger
    }

    pub fn log_level(&self) -> LogLevel {
        self.level.load(Ordering::SeqCst).into()
    }

    pub fn change_log_level(&self, new_val: LogLevel) {
        self.level.store(new_val as u8, Ordering::SeqCst);
        log::set_max_level(LevelFilter::from(new_val));
    }

    pub fn log_dest(&self) -> PathBuf {
        self.dest
            .lock()
            .map(|d| d.path.clone())
            .unwrap_or_default()
    }
}

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::from(self.log_level())
            || !matches!(self.debug_dest, Destination::None)
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        fn write(
            writer: &mut impl Write,
            record: &Record,
            (print_level, print_module_names): (bool, bool),
        ) -> Option<()> {
            writer
                .write_all(super::datetime::now_local_string().as_bytes())
                .ok()?;
            writer.write_all(b" [").ok()?;
            if print_level {
                writer
                    .write_all(record.level().to_string().as_bytes())
                    .ok()?;
            }
            write!(writer, "]: ").ok()?;
            if print_module_names {
                write!(writer, "{}: ", record.metadata().target()).ok()?;
            }
            write!(writer, "{}", record.args()).ok()?;
            writer.write_all(b"\n").ok()?;
            writer.flush().ok()?;
            Some(())
        }

        let opts = (self.print_level, self.print_module_names);
        match (
            self.debug_dest,
            record.metadata().level() <= Level::from(self.log_level()),
        ) {
            (Destination::None, false) => {}
            (Destination::None | Destination::File, _) => {
                _ = self
                    .dest
                    .lock()
                    .ok()
                    .and_then(|mut d| write(&mut d.writer, record, opts));
            }
            (Destination::Stderr, true) => {
                _ = self
                    .dest
                    .lock()
                    .ok()
                    .and_then(|mut d| write(&mut d.writer, record, opts));
                #[cfg(not(test))]
                {
                    _ = write(&mut std::io::stderr(), record, opts);
                }
            }
            (Destination::Stderr, false) => {
                _ = write(&mut std::io::stderr(), record, opts);
            }
        }
    }

    fn flush(&self) {
        self.dest
            .lock()
            .ok()
            .and_then(|mut w| w.writer.flush().ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_level_conversions() {
        for level in [
            LogLevel::OFF,
            LogLevel::ERROR,
            LogLevel::WARN,
            LogLevel::INFO,
            LogLevel::DEBUG,
            LogLevel::TRACE,
        ] {
            assert_eq!(LogLevel::from(LevelFilter::from(level)), level);
            assert_eq!(LogLevel::from(level as u8), level);
        }
        assert_eq!(Level::from(LogLevel::OFF), Level::Info);
        assert_eq!(LogLevel::default().to_string(), "INFO");
    }
}
