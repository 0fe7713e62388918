//! MakerWorks job mirror
//!
//! A library for mirroring fabrication job records from an externally-owned
//! MakerWorks schema into the locally-owned fulfillment store, so the
//! dashboard can query, filter, and mutate jobs without touching the source
//! system.
//!
//! # Features
//!
//! - Delta synchronization: bounded scans driven by a persisted watermark
//! - Full reconciliation: periodic whole-table reads that self-heal missed
//!   deltas
//! - Per-row isolation: a failing row is dead-lettered with exponential
//!   backoff instead of aborting the batch
//! - Cluster safety: a transaction-scoped advisory lock keeps at most one
//!   sync running across all instances
//! - Telemetry: a singleton state row records watermarks, durations,
//!   failure streaks and slow-query counters for the readiness endpoint
//!
//! # Structure
//!
//! - [`sync`] - the orchestrator and staleness trigger
//! - [`normalize`] - pure validation of raw source rows
//! - [`store`] - the storage seam the orchestrator drives
//! - [`postgres`] - the production PostgreSQL backend
//! - [`dead_letter`] / [`state`] - persistence types
//! - [`testing`] - in-memory store and fixtures for tests

pub mod config;
pub mod dead_letter;
pub mod job;
pub mod normalize;
pub mod postgres;
pub mod state;
pub mod store;
pub mod sync;
pub mod testing;

pub use config::{SyncConfig, SyncOpts};
pub use job::{DestinationJob, FulfillmentStatus, JobStatus, NormalizedJob, SourceRow};
pub use normalize::{normalize, ValidationError};
pub use state::{SyncMode, SyncState, SyncStateUpdate, TelemetrySnapshot};
pub use store::{SourceCapabilities, SyncRun, SyncStore};
pub use sync::{SyncEngine, SyncOutcome, SyncReport, SyncRequest};
