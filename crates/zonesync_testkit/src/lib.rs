//! # zonesync testkit
//!
//! Test utilities for zonesync.
//!
//! This crate provides:
//! - A forest schema and replica harness over in-memory stores
//! - File-backed replicas in temporary directories
//! - Property-based generators for forests and delivery orders
//! - Tracing setup for tests
//!
//! ## Usage
//!
//! ```rust,ignore
//! use zonesync_testkit::prelude::*;
//!
//! #[test]
//! fn two_replicas_converge() {
//!     let remote = shared_remote();
//!     let a = Replica::new(&remote);
//!     a.save_node(1, None, "root");
//!     a.sync();
//!
//!     let b = Replica::new(&remote);
//!     b.sync();
//!     assert_eq!(a.snapshot(), b.snapshot());
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use fixtures::*;
pub use generators::*;
