//! Integration tests for `EventAgg`
//!
//! This crate contains integration tests that drive the engine end to end
//! against the in-memory store and bus, with and without injected faults.

// This is a test-only crate
#![cfg(test)]
