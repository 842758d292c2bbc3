//! # zonesync storage
//!
//! Byte-store backends used by the sync engine to persist state it owns
//! (the unsynced record log and zone change tokens).
//!
//! Backends are **opaque byte stores**: they append, read back and truncate
//! bytes. Framing, checksums and record encoding belong to the engine.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For tests and ephemeral engines
//! - [`FileBackend`] - Persistent, optionally holding an exclusive advisory lock
//!
//! ## Example
//!
//! ```rust
//! use zonesync_storage::{StorageBackend, InMemoryBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"staged").unwrap();
//! assert_eq!(backend.read_at(offset, 6).unwrap(), b"staged");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
