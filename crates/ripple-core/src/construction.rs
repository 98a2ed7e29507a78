//! Construction records for provisionally identified entities
//!
//! A [`Construction`] is the fact "owner, observer, reason produced entity E".
//! Newables derived for the same [`Reason`] are candidates for unification.

use std::fmt;

use crate::{ClassId, Direction, MutableId, ObserverId, Value};

/// Why an entity was constructed
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Reason {
    pub direction: Direction,
    /// Domain identity of the thing being constructed
    pub identity: Value,
}

impl Reason {
    pub fn new(direction: Direction, identity: Value) -> Self {
        Reason { direction, identity }
    }
}

impl fmt::Debug for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.direction.0, self.identity)
    }
}

/// One derivation of a newable
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Construction {
    pub owner: MutableId,
    /// `None` for a source construction (made outside any observer)
    pub observer: Option<ObserverId>,
    pub reason: Reason,
}

impl Construction {
    pub fn derived(owner: MutableId, observer: ObserverId, reason: Reason) -> Self {
        Construction { owner, observer: Some(observer), reason }
    }

    pub fn source(owner: MutableId, reason: Reason) -> Self {
        Construction { owner, observer: None, reason }
    }

    #[inline]
    pub fn is_derived(&self) -> bool {
        self.observer.is_some()
    }
}

/// Per-entity data of a newable
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct NewableInfo {
    /// Tie-break order when choosing a survivor
    pub sort_key: Value,
}

/// What to create when a construction has no existing entity
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewableSpec {
    pub class: ClassId,
    pub sort_key: Value,
}

impl NewableSpec {
    pub fn new(class: ClassId, sort_key: impl Into<Value>) -> Self {
        NewableSpec { class, sort_key: sort_key.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_construction_is_not_derived() {
        let reason = Reason::new(Direction(1), Value::text("x"));
        let source = Construction::source(MutableId::new(1), reason.clone());
        let derived = Construction::derived(MutableId::new(1), ObserverId::new(3), reason);

        assert!(!source.is_derived());
        assert!(derived.is_derived());
        assert!(source < derived);
    }
}
