//! Ripple State Engine - Atomic snapshot transitions
//!
//! This crate implements the state-transition substrate:
//! - Atomic current-snapshot reference with read-modify-write commits
//! - Change markers propagated up the ownership chain
//! - Containment parent bookkeeping
//! - Opposite property maintenance

pub mod mutable_state;
pub mod transition;

pub use mutable_state::*;
pub use transition::{apply, mark_changed, Applied};
