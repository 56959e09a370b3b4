//! Data Transfer Objects
//!
//! Requests, query filters and aggregate views exchanged between the store,
//! the engine and outward-facing layers such as the CLI.

pub mod job;
pub mod stats;
