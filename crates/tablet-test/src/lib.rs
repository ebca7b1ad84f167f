//! # tablet-test
//!
//! Conformance suite for tablet query service transports.
//!
//! This crate contains:
//! - [`FakeQueryService`]: a scripted service that checks every argument it
//!   receives and answers with canned results, errors or panics
//! - [`run_suite`]: drives a [`tablet_client::TabletConn`] connected to the
//!   fake through every method, first on the happy path, then with the
//!   fake failing, then with it panicking
//!
//! End-to-end tests against the real server live under `tests/`.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Scripted query service.
pub mod fake;

/// Transport conformance suite.
pub mod suite;

pub use fake::{FakeQueryService, Gate, EXPECTED_ERROR, TEST_KEYSPACE, TEST_SHARD};
pub use suite::run_suite;
