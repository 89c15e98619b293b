//! Docket harness.
//!
//! Runs the full substrate locally: migrations, the engine HTTP surface, and
//! the reaper. The integration suite in `tests/` drives the same setup.

pub mod config;
pub mod migrate;
