//! Meterbook Shared Types and Utilities
//!
//! This crate contains the billing vocabulary, errors, and database helpers
//! shared across the Meterbook workspace.

pub mod db;
pub mod error;
pub mod types;

pub use db::*;
pub use error::*;
pub use types::*;
