//! vigil-store — Watchlist registry and detection result log.
//!
//! Both stores keep their state in memory and write through to a pluggable
//! [`Backend`]. SQLite is the production backend.

pub mod backend;
pub mod error;
pub mod export;
pub mod result_log;
pub mod sqlite;
pub mod watchlist;

pub use backend::{Backend, MemoryBackend};
pub use error::{Result, StoreError};
pub use export::{WatchlistExport, EXPORT_VERSION};
pub use result_log::ResultLog;
pub use sqlite::SqliteBackend;
pub use watchlist::WatchlistStore;
