//! Property descriptors
//!
//! A property is pure data: registered once in [`Properties`] and referenced
//! by [`PropertyId`] everywhere else. Observed properties generate
//! dependencies when read inside an observer.

use std::fmt;
use std::sync::Arc;

use crate::{MutableId, PropertyId, RippleError, RippleResult, Value};

/// Property modifiers (1 byte)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Modifiers(pub u8);

impl Modifiers {
    pub const NONE: Modifiers = Modifiers(0);

    // Modifier bits
    pub const OBSERVED: u8 = 0b0000_0001;
    pub const MANDATORY: u8 = 0b0000_0010;
    pub const CONTAINMENT: u8 = 0b0000_0100;
    pub const PLUMBING: u8 = 0b0000_1000;
    pub const DO_NOT_MERGE: u8 = 0b0001_0000;

    #[inline]
    pub fn new(bits: u8) -> Self {
        Modifiers(bits)
    }

    #[inline]
    pub fn is_observed(self) -> bool {
        self.0 & Self::OBSERVED != 0
    }

    #[inline]
    pub fn is_mandatory(self) -> bool {
        self.0 & Self::MANDATORY != 0
    }

    #[inline]
    pub fn is_containment(self) -> bool {
        self.0 & Self::CONTAINMENT != 0
    }

    /// Plumbing writes never mark the ownership chain changed
    #[inline]
    pub fn is_plumbing(self) -> bool {
        self.0 & Self::PLUMBING != 0
    }

    #[inline]
    pub fn is_do_not_merge(self) -> bool {
        self.0 & Self::DO_NOT_MERGE != 0
    }

    #[inline]
    pub fn with(self, bits: u8) -> Self {
        Modifiers(self.0 | bits)
    }
}

/// Notification invoked after a committed change: (object, before, after)
pub type ChangeHook = Arc<dyn Fn(MutableId, &Value, &Value) + Send + Sync>;

/// A property descriptor
#[derive(Clone)]
pub struct Property {
    /// Assigned on registration
    pub id: PropertyId,
    pub name: Arc<str>,
    /// Value of every slot never written
    pub default: Value,
    pub modifiers: Modifiers,
    /// Inverse property kept in sync on the referenced mutables
    pub opposite: Option<PropertyId>,
    /// Single-valued companion view of a matched collection
    pub singleton: Option<PropertyId>,
    /// Property on the same object whose members bound the allowed values
    pub scope: Option<PropertyId>,
    pub on_change: Option<ChangeHook>,
}

impl Property {
    /// A plain writable property
    pub fn setable(name: &str, default: Value) -> Self {
        Property {
            id: PropertyId::default(),
            name: Arc::from(name),
            default,
            modifiers: Modifiers::NONE,
            opposite: None,
            singleton: None,
            scope: None,
            on_change: None,
        }
    }

    /// A writable property that generates observer dependencies
    pub fn observed(name: &str, default: Value) -> Self {
        let mut property = Self::setable(name, default);
        property.modifiers = Modifiers::new(Modifiers::OBSERVED);
        property
    }

    pub fn mandatory(mut self) -> Self {
        self.modifiers = self.modifiers.with(Modifiers::MANDATORY);
        self
    }

    pub fn containment(mut self) -> Self {
        self.modifiers = self.modifiers.with(Modifiers::CONTAINMENT);
        self
    }

    pub fn plumbing(mut self) -> Self {
        self.modifiers = self.modifiers.with(Modifiers::PLUMBING);
        self
    }

    pub fn do_not_merge(mut self) -> Self {
        self.modifiers = self.modifiers.with(Modifiers::DO_NOT_MERGE);
        self
    }

    pub fn with_singleton(mut self, singleton: PropertyId) -> Self {
        self.singleton = Some(singleton);
        self
    }

    pub fn with_scope(mut self, scope: PropertyId) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn on_change<F>(mut self, hook: F) -> Self
    where
        F: Fn(MutableId, &Value, &Value) + Send + Sync + 'static,
    {
        self.on_change = Some(Arc::new(hook));
        self
    }

    #[inline]
    pub fn is_observed(&self) -> bool {
        self.modifiers.is_observed()
    }

    #[inline]
    pub fn is_mandatory(&self) -> bool {
        self.modifiers.is_mandatory()
    }

    #[inline]
    pub fn is_containment(&self) -> bool {
        self.modifiers.is_containment()
    }

    #[inline]
    pub fn is_plumbing(&self) -> bool {
        self.modifiers.is_plumbing()
    }

    /// Whether concurrent branches of this property may be merged
    pub fn is_mergeable(&self) -> bool {
        !self.modifiers.is_do_not_merge() && self.default.is_collection()
    }
}

impl fmt::Debug for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Property")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("default", &self.default)
            .field("modifiers", &self.modifiers)
            .field("opposite", &self.opposite)
            .field("singleton", &self.singleton)
            .field("scope", &self.scope)
            .field("on_change", &self.on_change.is_some())
            .finish()
    }
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Registry of all properties, indexed by id
#[derive(Clone, Debug, Default)]
pub struct Properties {
    properties: Vec<Arc<Property>>,
}

impl Properties {
    pub fn new() -> Self {
        Properties { properties: Vec::new() }
    }

    /// Register a property and assign its id
    pub fn register(&mut self, mut property: Property) -> PropertyId {
        let id = PropertyId::new(self.properties.len() as u32);
        property.id = id;
        self.properties.push(Arc::new(property));
        id
    }

    /// Declare `a` and `b` as each other's opposite
    pub fn set_opposite(&mut self, a: PropertyId, b: PropertyId) -> RippleResult<()> {
        for (from, to) in [(a, b), (b, a)] {
            let slot = self
                .properties
                .get_mut(from.0 as usize)
                .ok_or(RippleError::UnknownProperty(from))?;
            Arc::make_mut(slot).opposite = Some(to);
        }
        Ok(())
    }

    pub fn get(&self, id: PropertyId) -> Option<&Property> {
        if id.constructed_by().is_some() {
            return None;
        }
        self.properties.get(id.0 as usize).map(|p| p.as_ref())
    }

    pub fn require(&self, id: PropertyId) -> RippleResult<&Property> {
        self.get(id).ok_or(RippleError::UnknownProperty(id))
    }

    /// Whether reads of `id` register a dependency
    pub fn is_observed(&self, id: PropertyId) -> bool {
        id.constructed_by().is_some() || self.get(id).map_or(false, Property::is_observed)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Property> {
        self.properties.iter().map(|p| p.as_ref())
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }
}
