//! Conveyor job store
//!
//! Durable storage, filtering and statistics for job records. The
//! [`JobStore`] trait is the only seam the engine depends on; Postgres is the
//! production backend and the in-memory store serves tests and caches.

pub mod db;
pub mod error;
pub mod repository;

pub use error::{Result, StoreError};
pub use repository::{JobStore, MemoryJobStore, PgJobStore};
