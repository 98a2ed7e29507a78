//! Error types for the ripple engine

use std::error::Error as StdError;
use std::sync::Arc;
use std::time::SystemTime;

use thiserror::Error;

use crate::{ClassId, MutableId, ObserverId, ObserverKey, PropertyId, Slot};

/// Fatal consistency violations; always propagated out of a cycle
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConsistencyError {
    #[error("Too many observers on {slot:?}: {count} > {max}")]
    TooManyObservers { slot: Slot, count: usize, max: usize },

    #[error("Too many observed slots for {key:?}: {count} > {max}")]
    TooManyObserved { key: ObserverKey, count: usize, max: usize },

    #[error("Too many changes by {observer} on {mutable}: {changes}\n{trace}")]
    TooManyChanges {
        mutable: MutableId,
        observer: Arc<str>,
        changes: usize,
        /// Rendered backward causal trace
        trace: String,
    },

    #[error("Empty mandatory property {property:?} on {object}")]
    EmptyMandatory { object: MutableId, property: PropertyId },

    #[error("Value of {property:?} on {object} is out of scope")]
    OutOfScope { object: MutableId, property: PropertyId },

    #[error("Observer {observer} failed on {mutable}: {message}")]
    ObserverFailed {
        mutable: MutableId,
        observer: Arc<str>,
        message: String,
    },
}

/// Core ripple errors
#[derive(Error, Debug)]
pub enum RippleError {
    #[error(transparent)]
    Consistency(#[from] ConsistencyError),

    #[error("Unknown property: {0:?}")]
    UnknownProperty(PropertyId),

    #[error("Unknown observer: {0:?}")]
    UnknownObserver(ObserverId),

    #[error("Unknown mutable: {0:?}")]
    UnknownMutable(MutableId),

    #[error("Unknown class: {0:?}")]
    UnknownClass(ClassId),
}

/// Result type for ripple operations
pub type RippleResult<T> = Result<T, RippleError>;

/// Outcome of an observer body or of one of its writes
#[derive(Error, Debug)]
pub enum ObserverError {
    /// A mandatory property was (or would become) empty; retried later
    #[error("Empty mandatory property {property:?} on {object}")]
    EmptyMandatory { object: MutableId, property: PropertyId },

    /// Aborts the whole cycle
    #[error(transparent)]
    Consistency(#[from] ConsistencyError),

    /// Any other failure; captured on the observer instance
    #[error("{0}")]
    Failed(Box<dyn StdError + Send + Sync>),
}

impl ObserverError {
    pub fn failed<E>(error: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        ObserverError::Failed(error.into())
    }

    #[inline]
    pub fn is_fatal(&self) -> bool {
        matches!(self, ObserverError::Consistency(_))
    }
}

impl From<RippleError> for ObserverError {
    fn from(error: RippleError) -> Self {
        match error {
            RippleError::Consistency(e) => ObserverError::Consistency(e),
            other => ObserverError::Failed(Box::new(other)),
        }
    }
}

/// A failure captured on an observer instance's exception slot
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObserverFailure {
    pub message: String,
    /// Set when the failure is an empty mandatory write
    pub empty_mandatory: Option<Slot>,
    pub at: SystemTime,
}

impl ObserverFailure {
    pub fn new(message: impl Into<String>) -> Self {
        ObserverFailure {
            message: message.into(),
            empty_mandatory: None,
            at: SystemTime::now(),
        }
    }

    pub fn empty_mandatory(slot: Slot) -> Self {
        ObserverFailure {
            message: format!("Empty mandatory property {:?}", slot),
            empty_mandatory: Some(slot),
            at: SystemTime::now(),
        }
    }

    #[inline]
    pub fn is_recoverable(&self) -> bool {
        self.empty_mandatory.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ripple_error_converts_to_observer_error() {
        let fatal: ObserverError = RippleError::from(ConsistencyError::EmptyMandatory {
            object: MutableId::new(1),
            property: PropertyId::new(2),
        })
        .into();
        assert!(fatal.is_fatal());

        let captured: ObserverError = RippleError::UnknownMutable(MutableId::new(9)).into();
        assert!(!captured.is_fatal());
        assert!(captured.to_string().contains("Unknown mutable"));
    }

    #[test]
    fn test_failed_from_message() {
        let error = ObserverError::failed("boom");
        assert_eq!(error.to_string(), "boom");
    }
}
