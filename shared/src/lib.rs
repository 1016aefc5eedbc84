//! Shared types and utilities for tickscope
//!
//! This crate contains the data structures exchanged between the diagnostics
//! agent, its reporting pipeline and anything that renders tick-rate status.

pub mod types;
pub mod utils;

// Re-export commonly used types
pub use types::{annotation::*, profile::*, tps::*};
