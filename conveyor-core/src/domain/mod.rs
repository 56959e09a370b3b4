//! Core domain types
//!
//! This module contains the core domain structures used across Conveyor crates.
//! These types are shared between the store (for persistence) and the engine
//! (for execution and notification).

pub mod bulk;
pub mod event;
pub mod job;
pub mod progress;
