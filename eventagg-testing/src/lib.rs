//! Testing utilities for `EventAgg`.
//!
//! [`FaultyDocumentStore`] wraps any document store and makes selected
//! operations fail, either at random with a seeded generator or for writes
//! matching a predicate.

#![forbid(unsafe_code)]
#![deny(
    rust_2018_idioms,
    unreachable_pub,
    unused_imports,
    unused_must_use,
    unused_mut,
    unused_results,
    unused_variables
)]

pub mod faults;

pub use faults::*;
