/*
 * meli - lib.rs
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

#![deny(
    rustdoc::redundant_explicit_links,
    unsafe_op_in_unsafe_fn,
    /* groups */
    clippy::correctness,
    clippy::suspicious,
    clippy::complexity,
    clippy::perf,
    clippy::style,
    /* restriction */
    clippy::dbg_macro,
    clippy::rc_buffer,
    clippy::as_underscore,
    /* rustdoc */
    rustdoc::broken_intra_doc_links,
    /* pedantic */
    clippy::doc_markdown,
    clippy::expect_fun_call,
    clippy::or_fun_call,
    clippy::borrow_as_ptr,
)]
#![allow(
    clippy::option_if_let_else,
    clippy::missing_const_for_fn,
    clippy::significant_drop_tightening,
    clippy::multiple_crate_versions,
    clippy::significant_drop_in_scrutinee,
    clippy::cognitive_complexity
)]

//! A mailbox engine for single-file mailboxes and index-backed virtual
//! mailboxes.
//!
//! - Open, check, reconcile and rewrite mbox and MMDF files, keeping a
//!   [`HeaderStore`](mailbox::HeaderStore) in sync with what is on disk (see
//!   module [`mbox`])
//! - Present the results of a notmuch query as a mailbox whose messages
//!   live in maildir files, and write flag and tag changes back (see module
//!   [`notmuch`])
//! - Select a backend from a path or URI (see [`mailbox::open`])
//!
//! Other exports are
//! - Account configuration (see module [`conf`])
//! - The error type shared by every operation (see module [`error`])

#[macro_use]
extern crate serde_derive;
pub extern crate log;
pub extern crate nom;

#[macro_use]
extern crate bitflags;
pub extern crate indexmap;

pub mod conf;
pub use conf::{AccountSettings, MboxSettings, NotmuchSettings};
pub mod email;
pub mod error;
pub use error::{Error, ErrorKind, Result};
pub mod mailbox;
pub use mailbox::{
    CheckStatus, Flag, HeaderStore, MailboxOps, MailboxType, MessageRecord, MxContext,
    SyncStatus,
};
pub mod maildir;
pub mod mbox;
pub use mbox::{MboxFormat, MboxMailbox};
pub mod notmuch;
pub use notmuch::NotmuchMailbox;

#[macro_use]
pub mod utils;

pub use utils::{
    datetime::UnixTimestamp,
    logging::{LogLevel, StderrLogger},
};
