//! # Suneido Testkit
//!
//! Test utilities for Suneido databases.
//!
//! This crate provides:
//! - Test fixtures and database helpers
//! - Property-based test generators using proptest
//! - Helpers that damage database files the way crashes and bad disks do
//! - Concurrent transaction stress runs
//!
//! ## Usage
//!
//! ```rust
//! use suneido_testkit::prelude::*;
//!
//! with_temp_db(|db| {
//!     scenarios::customers(db, 10);
//!     assert_eq!(db.read(|t| t.records("customers")).unwrap().len(), 10);
//! });
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod corruption;
pub mod fixtures;
pub mod generators;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::corruption::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::stress::*;
}

pub use corruption::*;
pub use fixtures::*;
pub use generators::*;
pub use stress::*;
