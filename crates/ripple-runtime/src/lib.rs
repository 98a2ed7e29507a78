//! Ripple Runtime - Observer transactions and the fixpoint cycle
//!
//! This crate implements the reactive engine on top of the snapshot store:
//! - Observers, their instances and scheduling priorities
//! - Per-run dependency tracking through the observer context
//! - Three-way reconciliation of writes against concurrent edits
//! - Identity matching of provisional (newable) entities
//! - Runaway detection with causal traces
//! - The universe driver: agenda, rollback and consistency checks

pub mod context;
pub mod guard;
pub mod matching;
pub mod observer;
pub mod reconcile;
pub mod trace;
pub mod transaction;
pub mod universe;

pub use context::{Accumulator, CycleContext, ObserverContext};
pub use guard::{RunawayGuard, UniverseStats};
pub use matching::{DefaultIdentityPolicy, IdentityPolicy, MatchInfo};
pub use observer::*;
pub use reconcile::{ripple_out, ChangeOracle, Reconciled};
pub use trace::{ObserverTrace, TraceArena, TraceId};
pub use transaction::{ObserverTransaction, ObserverTransactions, Phase, RunOutcome};
pub use universe::*;
