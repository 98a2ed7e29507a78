//! Ripple Core - Fundamental types of the reactive transaction engine
//!
//! This crate defines the core types used throughout ripple:
//! - Identifiers (MutableId, PropertyId, ObserverId, Slot)
//! - Values with a three-way merge for collections
//! - Property descriptors and their registry
//! - Immutable state snapshots with diff
//! - Construction records for provisional identities
//! - Error taxonomy and engine configuration

pub mod id;
pub mod value;
pub mod property;
pub mod construction;
pub mod state;
pub mod config;
pub mod error;

pub use id::*;
pub use value::*;
pub use property::*;
pub use construction::*;
pub use state::*;
pub use config::*;
pub use error::*;
