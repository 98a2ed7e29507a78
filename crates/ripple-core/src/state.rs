//! Immutable state snapshots
//!
//! A [`State`] maps (object, property) slots to values and carries the
//! per-mutable metadata (ownership, change markers, newable bookkeeping) and
//! the per-observer-instance bookkeeping (dependencies, constructions,
//! captured failures). Every write produces a new snapshot; unchanged parts
//! are shared.

use im::ordmap::DiffItem;
use im::{OrdMap, OrdSet};

use crate::{
    ClassId, Construction, MutableId, NewableInfo, ObserverFailure, ObserverKey, Property, Reason,
    Slot, TransactionId, Value,
};

/// Metadata of one mutable
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct MutableMeta {
    pub class: ClassId,
    /// Present for provisionally identified entities
    pub newable: Option<NewableInfo>,
    /// Containing slot; `None` when detached
    pub parent: Option<Slot>,
    /// Last transaction that marked this mutable changed
    pub change_id: TransactionId,
    /// Bumped once per transaction in which the subtree changed
    pub change_nr: u32,
    pub obsolete: bool,
    /// Survivor this newable was unified into
    pub replaced_by: Option<MutableId>,
    /// Every construction that has derived this newable
    pub derived_constructions: OrdSet<Construction>,
}

impl MutableMeta {
    pub fn new(class: ClassId) -> Self {
        MutableMeta { class, ..Default::default() }
    }

    pub fn newable(class: ClassId, info: NewableInfo) -> Self {
        MutableMeta { class, newable: Some(info), ..Default::default() }
    }

    #[inline]
    pub fn is_newable(&self) -> bool {
        self.newable.is_some()
    }
}

/// Bookkeeping of one observer bound to one mutable
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct InstanceState {
    /// Slots whose change retriggers this instance
    pub observeds: OrdSet<Slot>,
    /// Entities constructed by the last successful run
    pub constructed: OrdMap<Reason, MutableId>,
    pub exception: Option<ObserverFailure>,
}

impl InstanceState {
    fn is_default(&self) -> bool {
        self.observeds.is_empty() && self.constructed.is_empty() && self.exception.is_none()
    }
}

/// One slot that differs between two snapshots
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlotChange {
    pub slot: Slot,
    pub before: Option<Value>,
    pub after: Option<Value>,
}

/// Immutable snapshot of the universe
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct State {
    values: OrdMap<Slot, Value>,
    metas: OrdMap<MutableId, MutableMeta>,
    instances: OrdMap<ObserverKey, InstanceState>,
    observers: OrdMap<Slot, OrdSet<ObserverKey>>,
}

impl State {
    /// A snapshot containing only the universe root
    pub fn new(root_class: ClassId) -> Self {
        let mut state = State::default();
        state.metas.insert(MutableId::UNIVERSE, MutableMeta::new(root_class));
        state
    }

    // ========================================================================
    // Values
    // ========================================================================

    /// Value of a slot, falling back to the property default
    pub fn get(&self, object: MutableId, property: &Property) -> Value {
        self.values
            .get(&Slot::new(object, property.id))
            .cloned()
            .unwrap_or_else(|| property.default.clone())
    }

    /// Stored value of a slot, if it differs from the default
    pub fn raw(&self, slot: Slot) -> Option<&Value> {
        self.values.get(&slot)
    }

    /// Snapshot with `slot` set; values equal to the default are not stored
    pub fn with_value(&self, slot: Slot, value: Value, default: &Value) -> State {
        let mut next = self.clone();
        if value == *default {
            next.values.remove(&slot);
        } else {
            next.values.insert(slot, value);
        }
        next
    }

    /// Every slot whose value differs between `self` and `other`
    pub fn diff(&self, other: &State) -> Vec<SlotChange> {
        self.values
            .diff(&other.values)
            .map(|item| match item {
                DiffItem::Add(slot, after) => SlotChange {
                    slot: *slot,
                    before: None,
                    after: Some(after.clone()),
                },
                DiffItem::Update { old: (slot, before), new: (_, after) } => SlotChange {
                    slot: *slot,
                    before: Some(before.clone()),
                    after: Some(after.clone()),
                },
                DiffItem::Remove(slot, before) => SlotChange {
                    slot: *slot,
                    before: Some(before.clone()),
                    after: None,
                },
            })
            .collect()
    }

    // ========================================================================
    // Mutables
    // ========================================================================

    pub fn meta(&self, id: MutableId) -> Option<&MutableMeta> {
        self.metas.get(&id)
    }

    pub fn contains_mutable(&self, id: MutableId) -> bool {
        self.metas.contains_key(&id)
    }

    pub fn with_meta(&self, id: MutableId, meta: MutableMeta) -> State {
        let mut next = self.clone();
        next.metas.insert(id, meta);
        next
    }

    /// Snapshot with the metadata of `id` modified; unchanged if `id` is unknown
    pub fn update_meta<F>(&self, id: MutableId, f: F) -> State
    where
        F: FnOnce(&mut MutableMeta),
    {
        match self.metas.get(&id) {
            Some(meta) => {
                let mut meta = meta.clone();
                f(&mut meta);
                self.with_meta(id, meta)
            }
            None => self.clone(),
        }
    }

    pub fn mutables(&self) -> impl Iterator<Item = (MutableId, &MutableMeta)> {
        self.metas.iter().map(|(id, meta)| (*id, meta))
    }

    /// Mutables whose change marker was set by `txid`
    pub fn changed_in(&self, txid: TransactionId) -> Vec<MutableId> {
        self.mutables()
            .filter(|(_, meta)| meta.change_id == txid)
            .map(|(id, _)| id)
            .collect()
    }

    pub fn parent(&self, id: MutableId) -> Option<Slot> {
        self.meta(id).and_then(|m| m.parent)
    }

    /// Whether `id` is reachable from the universe through containment
    pub fn is_attached(&self, id: MutableId) -> bool {
        let mut current = id;
        // A cycle cannot be longer than the number of mutables
        for _ in 0..=self.metas.len() {
            if current.is_universe() {
                return true;
            }
            match self.parent(current) {
                Some(slot) => current = slot.object,
                None => return false,
            }
        }
        false
    }

    pub fn is_obsolete(&self, id: MutableId) -> bool {
        self.meta(id).map_or(false, |m| m.obsolete)
    }

    /// Follow the unification chain to the surviving mutable
    pub fn resolve(&self, id: MutableId) -> MutableId {
        let mut current = id;
        for _ in 0..=self.metas.len() {
            match self.meta(current).and_then(|m| m.replaced_by) {
                Some(next) => current = next,
                None => break,
            }
        }
        current
    }

    // ========================================================================
    // Observer instances
    // ========================================================================

    pub fn instance(&self, key: ObserverKey) -> Option<&InstanceState> {
        self.instances.get(&key)
    }

    pub fn instances(&self) -> impl Iterator<Item = (ObserverKey, &InstanceState)> {
        self.instances.iter().map(|(key, inst)| (*key, inst))
    }

    /// Snapshot with the instance state of `key` modified; empty states are dropped
    pub fn update_instance<F>(&self, key: ObserverKey, f: F) -> State
    where
        F: FnOnce(&mut InstanceState),
    {
        let mut instance = self.instances.get(&key).cloned().unwrap_or_default();
        f(&mut instance);
        let mut next = self.clone();
        if instance.is_default() {
            next.instances.remove(&key);
        } else {
            next.instances.insert(key, instance);
        }
        next
    }

    pub fn observeds(&self, key: ObserverKey) -> OrdSet<Slot> {
        self.instance(key).map(|i| i.observeds.clone()).unwrap_or_default()
    }

    pub fn constructed(&self, key: ObserverKey) -> OrdMap<Reason, MutableId> {
        self.instance(key).map(|i| i.constructed.clone()).unwrap_or_default()
    }

    /// Observer instances currently depending on `slot`
    pub fn observers_of(&self, slot: Slot) -> OrdSet<ObserverKey> {
        self.observers.get(&slot).cloned().unwrap_or_default()
    }

    /// Replace the dependency set of `key`, keeping the reverse map in sync
    pub fn with_observeds(&self, key: ObserverKey, observeds: OrdSet<Slot>) -> State {
        let previous = self.observeds(key);
        let mut next = self.update_instance(key, |i| i.observeds = observeds.clone());
        for slot in previous.iter().filter(|s| !observeds.contains(s)) {
            let keys = next.observers_of(*slot).without(&key);
            if keys.is_empty() {
                next.observers.remove(slot);
            } else {
                next.observers.insert(*slot, keys);
            }
        }
        for slot in observeds.iter().filter(|s| !previous.contains(s)) {
            let keys = next.observers_of(*slot).update(key);
            next.observers.insert(*slot, keys);
        }
        next
    }
}
