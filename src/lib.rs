//! `plfsdir` is an indexed log-structured directory engine for enormous
//! streams of tiny key/value records.
//!
//! This crate is intentionally opinionated about its write path:
//! - Writes land in an append-only in-memory buffer per partition and are
//!   compacted in the background into block-structured *tables*.
//! - Tables group into *epochs*; an epoch is sealed atomically and reads
//!   fan out across all epochs.
//! - Each table carries an approximate-membership filter (bloom, one of six
//!   bitmap formats, or a cuckoo-fingerprint table) probed before any data
//!   block is fetched.
//! - Everything lands in exactly two append-only logs per partition: a data
//!   log and an index log. Point lookup is the only query.
//!
//! All I/O goes through the [`env::Env`] seam so tests can run against
//! in-memory or rate-limited files.

pub mod block;
pub mod buffer;
pub mod env;
pub mod error;
pub mod events;
pub mod filter;
pub mod format;
pub mod log;
pub(crate) mod logger;
pub mod options;
pub mod reader;
pub mod table;
pub mod writer;

pub use crate::log::IoStats;
pub use error::{Error, Result};
pub use events::{CompactionEvent, Event, EventListener, IoEvent};
pub use options::{BitmapFormat, Compression, DirMode, DirOptions, FilterChoice};
pub use reader::DirReader;
pub use table::OutputStats;
pub use writer::DirWriter;
