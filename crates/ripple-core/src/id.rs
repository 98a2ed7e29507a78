//! Identity types for the ripple engine
//!
//! Mutables are identity-bearing: two mutables are never structurally equal,
//! only identity-equal. All other descriptors (properties, observers, classes)
//! are registered once and referenced by their id thereafter.

use std::fmt;

/// Mutable identity - an entity with a position in the ownership tree
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct MutableId(pub u64);

impl MutableId {
    /// The root of every ownership tree
    pub const UNIVERSE: MutableId = MutableId(0);

    #[inline]
    pub fn new(id: u64) -> Self {
        MutableId(id)
    }

    #[inline]
    pub fn is_universe(self) -> bool {
        self == Self::UNIVERSE
    }
}

impl fmt::Debug for MutableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Mutable({})", self.0)
    }
}

impl fmt::Display for MutableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_universe() {
            write!(f, "universe")
        } else {
            write!(f, "m{}", self.0)
        }
    }
}

/// Property identity - index into the property registry
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PropertyId(pub u32);

impl PropertyId {
    /// Ids at or above this bit are reserved for per-observer "constructed" slots
    const CONSTRUCTED_BIT: u32 = 0x8000_0000;

    #[inline]
    pub fn new(id: u32) -> Self {
        PropertyId(id)
    }

    /// The pseudo property holding what `observer` constructed on a mutable.
    ///
    /// Observer instances depend on this slot so that unifying one of their
    /// constructed entities retriggers them.
    #[inline]
    pub fn constructed(observer: ObserverId) -> Self {
        PropertyId(Self::CONSTRUCTED_BIT | observer.0)
    }

    /// The observer whose constructed slot this is, if it is one
    #[inline]
    pub fn constructed_by(self) -> Option<ObserverId> {
        if self.0 & Self::CONSTRUCTED_BIT != 0 {
            Some(ObserverId(self.0 & !Self::CONSTRUCTED_BIT))
        } else {
            None
        }
    }
}

impl fmt::Debug for PropertyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.constructed_by() {
            Some(observer) => write!(f, "Constructed({})", observer.0),
            None => write!(f, "Property({})", self.0),
        }
    }
}

/// Observer identity
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ObserverId(pub u32);

impl ObserverId {
    #[inline]
    pub fn new(id: u32) -> Self {
        ObserverId(id)
    }
}

impl fmt::Debug for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Observer({})", self.0)
    }
}

/// Runtime type of a mutable; binds observers and declared properties
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ClassId(pub u32);

impl ClassId {
    #[inline]
    pub fn new(id: u32) -> Self {
        ClassId(id)
    }
}

impl fmt::Debug for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Class({})", self.0)
    }
}

/// Outer cycle identity, used as the change marker of mutables
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct TransactionId(pub u64);

impl TransactionId {
    pub const ZERO: TransactionId = TransactionId(0);

    #[inline]
    pub fn next(self) -> Self {
        TransactionId(self.0 + 1)
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tx({})", self.0)
    }
}

/// Derivation direction of a construction reason
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Debug)]
pub struct Direction(pub u32);

/// A (mutable, property) pair: the unit of reads, writes and dependencies
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Slot {
    pub object: MutableId,
    pub property: PropertyId,
}

impl Slot {
    #[inline]
    pub fn new(object: MutableId, property: PropertyId) -> Self {
        Slot { object, property }
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:?}", self.object, self.property)
    }
}

/// One observer bound to one mutable
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverKey {
    pub mutable: MutableId,
    pub observer: ObserverId,
}

impl ObserverKey {
    #[inline]
    pub fn new(mutable: MutableId, observer: ObserverId) -> Self {
        ObserverKey { mutable, observer }
    }

    /// The slot this instance observes to learn about unified constructions
    #[inline]
    pub fn constructed_slot(self) -> Slot {
        Slot::new(self.mutable, PropertyId::constructed(self.observer))
    }
}

impl fmt::Debug for ObserverKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:?}", self.mutable, self.observer)
    }
}
