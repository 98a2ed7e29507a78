//! Ripple Test Harness - Scenarios, fuzzing and end-to-end validation
//!
//! This crate provides:
//! - A scenario builder around a fresh universe
//! - A state fuzzer applying random external edits between cycles
//! - Tracing setup for tests

pub mod scenario;
pub mod state_fuzzer;

pub use scenario::*;
pub use state_fuzzer::*;

use tracing_subscriber::EnvFilter;

/// Install a test-friendly subscriber once; honours `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
