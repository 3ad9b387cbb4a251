//! Library to back up databases on many remote servers at once.
//!
//! Servers are reached over SSH. Every database is dumped on its server,
//! streamed back, gzip compressed and published as
//! `<output>/<server>/<database>_<YYYY-MM-DD_HH-MM-SS>.sql.gz`.
//! The engine lives in [`backup`], the transport behind [`remote`].

#![forbid(unsafe_code)]

pub mod backup;
pub mod cli;
pub mod config;
pub mod credentials;
pub mod engine;
pub mod remote;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod util;
