//! # zonesync engine
//!
//! Keeps a relational local store in sync with a zone-partitioned remote
//! object store while honoring foreign keys on both sides.
//!
//! This crate provides:
//! - Schema graph with per-reference delete actions
//! - Parents-first upload batches, leaf-to-root deletions
//! - Staging of remote records whose parent has not arrived yet
//! - Cascading deletes, set-null and no-action references
//! - Field-level last-writer-wins merge on a logical clock
//! - A durable, checksummed log for staged records and change tokens
//! - Per-zone sync state machine with retry and backoff
//!
//! ## Architecture
//!
//! Each sync cycle is **fetch-then-push**:
//! 1. Fetch remote changes page by page, applying deletions first
//! 2. Commit modifications whose references resolve, stage the rest
//! 3. Replay staged records as soon as what they wait for is committed
//! 4. Upload pending local changes in dependency order
//!
//! ## Key Invariants
//!
//! - A committed local row never references a missing row
//! - A parent is uploaded no later than its children
//! - A staged record leaves the log only after its commit succeeds
//! - Acknowledging a batch never clears a newer local edit

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod applier;
mod batcher;
mod cascade;
mod clock;
mod config;
mod context;
mod error;
mod order;
mod remote;
mod schema;
mod state;
mod store;
mod unsynced;

pub use applier::{ApplyReport, RejectedRecord};
pub use batcher::{PushOutcome, ZoneBatch};
pub use cascade::{CascadeOutcome, DeleteOrigin};
pub use clock::LogicalClock;
pub use config::{EngineConfig, RetryConfig};
pub use error::{SyncError, SyncResult};
pub use order::topological_order;
pub use remote::{MemoryRemote, RemoteStore};
pub use schema::{DeleteAction, Dependent, ForeignKey, SchemaGraph, TableSchema};
pub use state::{PushSummary, SyncCycleResult, SyncEngine, SyncState, SyncStats};
pub use store::{LocalStore, MemoryStore, StoredRow, Write};
pub use unsynced::{UnsyncedRecord, UnsyncedStore};
