//! Common test utilities for dispatch integration tests
//!
//! Every test runs against the in-memory durable queue; a broker and a
//! worker loop built from clones of one queue talk to each other.

#![allow(unused_imports)]
#![allow(dead_code)]

pub mod fixtures;

pub use fixtures::*;
