//! Error types for the aggregation engine.
//!
//! Each subsystem gets its own enum so callers can tell a storage problem from
//! a bus problem from a configuration problem:
//!
//! - **StoreError**: document store reads and writes
//! - **BusError**: publish/subscribe transport
//! - **ConfigError**: configuration parsing and validation
//! - **ProcessError**: the only failure a request ever surfaces
//!
//! Most failures inside the engine are absorbed (dropped events,
//! failed raw inserts, failed publishes). Only a safe-mode batch that had to be
//! compensated reaches the caller as an error.

use thiserror::Error;

use crate::coordinator::Compensation;

/// Errors reported by a [`DocumentStore`](crate::store::DocumentStore).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("document store unavailable: {0}")]
    Unavailable(String),

    /// The store refused a single document update.
    #[error("write to {collection}/{id} rejected: {reason}")]
    WriteRejected {
        /// Collection the write targeted
        collection: String,
        /// Document id the write targeted
        id: String,
        /// Store-provided reason
        reason: String,
    },

    /// A field path segment was empty or started with `$`.
    #[error("invalid field path '{0}'")]
    InvalidFieldPath(String),

    /// An insert collided with an existing document id.
    #[error("document '{0}' already exists")]
    DuplicateId(String),

    /// A stored document did not have the expected shape.
    #[error("malformed document: {0}")]
    Malformed(String),
}

/// Convenience alias for store results.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors reported by a [`MessageBus`](crate::bus::MessageBus).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BusError {
    /// Connecting or authenticating to the bus failed.
    #[error("bus connection failed: {0}")]
    Connection(String),

    /// Registering a subscription failed.
    #[error("subscribe to '{topic}' failed: {detail}")]
    Subscribe {
        /// Topic that could not be subscribed
        topic: String,
        /// Transport detail
        detail: String,
    },

    /// The client was closed explicitly.
    #[error("bus client is closed")]
    Closed,
}

/// Errors raised while loading configuration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// The configuration text could not be parsed.
    #[error("configuration parse error: {0}")]
    Parse(String),

    /// A value parsed but is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Failure signal returned to the caller of
/// [`EventEngine::process`](crate::engine::EventEngine::process).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProcessError {
    /// Safe mode saw at least one failed document write and issued
    /// compensating writes for the ones that succeeded.
    #[error(
        "{} document write(s) failed; {} compensated, {} compensation(s) failed",
        .0.failed.len(),
        .0.reverted,
        .0.revert_failures.len()
    )]
    WritesCompensated(Compensation),
}
