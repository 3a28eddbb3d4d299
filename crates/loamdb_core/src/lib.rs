//! # loamdb
//!
//! An embeddable, persistent, ordered key/value store with serializable
//! transactions.
//!
//! Data lives in an append-only log of bounded segment files; an in-memory
//! ordered index maps each (bucket, key) to its latest record. A single
//! writer is serialized by an exclusive lock while readers run lock-free
//! against copy-on-write snapshots. Committed data survives process
//! crashes: commits append records, issue a durability barrier, and only
//! then publish the index update.
//!
//! ```no_run
//! use loamdb_core::{Db, Options};
//! use std::path::Path;
//!
//! let db = Db::open(Path::new("my.db"), Options::default())?;
//!
//! db.update(|tx| {
//!     tx.put(b"users", b"u_001", b"alice", 0)?;
//!     tx.put(b"sessions", b"u_001", b"token", 3600)
//! })?;
//!
//! let name = db.view(|tx| tx.get(b"users", b"u_001"))?;
//! assert_eq!(name, b"alice");
//!
//! db.merge()?;
//! db.backup(Path::new("my.db.backup"))?;
//! # Ok::<(), loamdb_core::Error>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod database;
mod dir;
mod error;
mod index;
mod manifest;
mod record;
mod segment;
mod transaction;

pub use config::{IndexMode, Options};
pub use database::{Db, MergeStats};
pub use error::{Error, Result};
pub use index::{Index, IndexEntry};
pub use manifest::Manifest;
pub use record::{Entry, Flag, HEADER_SIZE};
pub use segment::{SegmentFile, SegmentScan, SegmentSet};
pub use transaction::{Tx, TxState};
