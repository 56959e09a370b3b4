//! Conveyor Core
//!
//! Core types and abstractions for the Conveyor job engine.
//!
//! This crate contains:
//! - Domain types: Job records, the weighted progress model, bulk composite
//!   status and job events
//! - DTOs: submission requests, query filters and statistics shared between
//!   the store, the engine and the CLI

pub mod domain;
pub mod dto;
