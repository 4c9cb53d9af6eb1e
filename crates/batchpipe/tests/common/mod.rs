//! Shared test utilities for batchpipe integration tests.
//!
//! This module provides:
//! - `TestHarness` with an on-disk job store in a temp directory
//! - `ScriptedClient`, an in-memory `InferenceClient`
//! - Builders for jobs and devices

pub mod builders;
pub mod fake_client;
pub mod harness;

pub use builders::*;
pub use fake_client::ScriptedClient;
pub use harness::TestHarness;
