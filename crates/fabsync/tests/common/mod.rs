//! Shared test utilities for fabsync integration tests.
//!
//! This module provides:
//! - `TestHarness` for isolated cycles over a temp source tree
//! - Builders for raw documents, managed records and cluster objects

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::{TestHarness, FABRIC};
