#![forbid(unsafe_code)]
//! Asynchronous 9P2000 file server library for Rust.
//!
//! This crate implements the plain 9P2000 protocol (Plan 9's original
//! protocol, not the Linux `9P2000.L` extension): wire codec, FID
//! bookkeeping, and a sequential per-connection dispatcher, generic over a
//! [`srv::Filesystem`] implementation that supplies the actual host
//! operations.
//!
//! # Getting started
//!
//! 1. Implement [`srv::Filesystem`] for a type describing your backing
//!    store, choosing a `Handle` type for whatever you want cached on an
//!    opened fid (e.g. an open file descriptor).
//! 2. Build a [`srv::Config`] (exported root, debug flag, default user).
//! 3. Call [`srv::serve`] with a listener address of the form
//!    `"tcp!host!port"`.
//!
//! # Protocol summary
//!
//! 1. **Version**: client sends `Tversion`, server replies `Rversion`,
//!    downgrading to `"unknown"` if it doesn't recognize the proposed
//!    version string.
//! 2. **Attach**: client attaches to the exported root with `Tattach`.
//!    Authentication is always refused (no `Tauth` support).
//! 3. **Operations**: `walk`/`open`/`create`/`read`/`write`/`stat`/`wstat`/
//!    `remove`/`clunk` against FIDs.
//! 4. **Flush**: a session processes one request to completion before
//!    reading the next frame, so by the time `Tflush` for a given tag
//!    arrives the targeted request has already been replied to.
//!
//! # Error handling
//!
//! Handlers return [`error::Error`]; the dispatcher renders it to
//! `Rerror.ename` unless [`error::Error::is_protocol`] is true, in which
//! case the session is terminated instead.
pub mod error;
pub mod fcall;
pub mod fid;
pub mod path;
pub mod serialize;
pub mod srv;
#[macro_use]
pub mod utils;

pub use crate::error::Error;
pub use crate::fcall::*;
pub use crate::fid::{Fid, FidTable};
pub use crate::utils::Result;
