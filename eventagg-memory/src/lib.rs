//! In-memory adapters for `EventAgg`
//!
//! This crate provides in-memory implementations of the `DocumentStore` and
//! `MessageBus` traits from the eventagg crate, useful for testing and
//! development scenarios where persistence and a real broker are not required.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod bus;
mod store;

pub use bus::InMemoryBus;
pub use store::InMemoryDocumentStore;
