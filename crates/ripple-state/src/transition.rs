//! Pure state transitions
//!
//! [`apply`] computes the snapshot that results from one property write:
//! the value itself, containment parent bookkeeping, the opposite property
//! and the change markers up the ownership chain.

use std::collections::BTreeSet;

use ripple_core::{MutableId, Properties, Property, Slot, State, TransactionId, Value};

/// Result of applying one write
#[derive(Clone, Debug)]
pub struct Applied {
    pub state: State,
    /// Slots whose value changed, the written slot first
    pub changed: Vec<Slot>,
    /// Mutables that got a containing parent
    pub contained: Vec<MutableId>,
    /// Mutables that lost their containing parent
    pub released: Vec<MutableId>,
}

/// Apply `object.property = value` to `state`.
///
/// Returns `None` when the value is unchanged.
pub fn apply(
    state: &State,
    properties: &Properties,
    txid: TransactionId,
    object: MutableId,
    property: &Property,
    value: Value,
) -> Option<Applied> {
    let old = state.get(object, property);
    if old == value {
        return None;
    }
    let slot = Slot::new(object, property.id);
    let before = old.mutables();
    let after = value.mutables();
    let removed: Vec<MutableId> = before.iter().filter(|m| !after.contains(m)).copied().collect();
    let added: Vec<MutableId> = after.iter().filter(|m| !before.contains(m)).copied().collect();

    let mut next = state.with_value(slot, value, &property.default);
    let mut changed = vec![slot];
    let mut contained = Vec::new();
    let mut released = Vec::new();

    if property.is_containment() {
        for child in &removed {
            if next.parent(*child) == Some(slot) {
                next = next.update_meta(*child, |m| m.parent = None);
                released.push(*child);
            }
        }
        for child in &added {
            if let Some(previous) = next.parent(*child).filter(|p| *p != slot) {
                // Moving: the previous owner lets go of the child
                if let Some(owner) = properties.get(previous.property) {
                    let rest = next.get(previous.object, owner).without(&Value::Mutable(*child));
                    next = next.with_value(previous, rest, &owner.default);
                    changed.push(previous);
                }
            }
            next = next.update_meta(*child, |m| m.parent = Some(slot));
            contained.push(*child);
        }
    }

    if let Some(opposite) = property.opposite.and_then(|id| properties.get(id)) {
        let me = Value::Mutable(object);
        for other in &removed {
            let current = next.get(*other, opposite);
            let updated = current.without(&me);
            if updated != current {
                next = next.with_value(Slot::new(*other, opposite.id), updated, &opposite.default);
                changed.push(Slot::new(*other, opposite.id));
            }
        }
        for other in &added {
            let current = next.get(*other, opposite);
            let updated = if opposite.default.is_collection() {
                current.with(me.clone())
            } else {
                me.clone()
            };
            if updated != current {
                next = next.with_value(Slot::new(*other, opposite.id), updated, &opposite.default);
                changed.push(Slot::new(*other, opposite.id));
            }
        }
    }

    if !property.is_plumbing() {
        let objects: BTreeSet<MutableId> = changed.iter().map(|s| s.object).collect();
        for changed_object in objects {
            next = mark_changed(&next, txid, changed_object);
        }
    }

    Some(Applied { state: next, changed, contained, released })
}

/// Walk up the ownership chain marking every ancestor changed in `txid`.
///
/// The walk stops at the universe or at the first ancestor already marked
/// for `txid`.
pub fn mark_changed(state: &State, txid: TransactionId, object: MutableId) -> State {
    let mut next = state.clone();
    let mut current = Some(object);
    while let Some(id) = current {
        let meta = match next.meta(id) {
            Some(meta) if meta.change_id != txid => meta,
            _ => break,
        };
        let parent = meta.parent;
        next = next.update_meta(id, |m| {
            m.change_id = txid;
            m.change_nr = m.change_nr.wrapping_add(1);
        });
        if id.is_universe() {
            break;
        }
        current = parent.map(|slot| slot.object);
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use ripple_core::{ClassId, MutableMeta, PropertyId};

    struct Model {
        properties: Properties,
        children: PropertyId,
        name: PropertyId,
        owner: PropertyId,
        items: PropertyId,
        state: State,
    }

    fn model() -> Model {
        let mut properties = Properties::new();
        let children = properties.register(Property::observed("children", Value::set([])).containment());
        let name = properties.register(Property::observed("name", Value::Empty));
        let owner = properties.register(Property::observed("owner", Value::Empty));
        let items = properties.register(Property::observed("items", Value::set([])));
        properties.set_opposite(owner, items).unwrap();

        let mut state = State::new(ClassId::new(0));
        for id in 1..=4 {
            state = state.with_meta(MutableId::new(id), MutableMeta::new(ClassId::new(1)));
        }
        Model { properties, children, name, owner, items, state }
    }

    fn m(id: u64) -> MutableId {
        MutableId::new(id)
    }

    fn write(model: &Model, state: &State, tx: u64, object: MutableId, property: PropertyId, value: Value) -> Applied {
        let property = model.properties.require(property).unwrap();
        apply(state, &model.properties, TransactionId(tx), object, property, value).unwrap()
    }

    #[test]
    fn test_unchanged_write_is_none() {
        let model = model();
        let name = model.properties.require(model.name).unwrap();
        assert!(apply(&model.state, &model.properties, TransactionId(1), m(1), name, Value::Empty).is_none());
    }

    #[test]
    fn test_containment_sets_parent_and_marks_ancestors() {
        let model = model();
        let root = write(&model, &model.state, 1, MutableId::UNIVERSE, model.children, Value::set([m(1).into()]));
        assert_eq!(root.contained, vec![m(1)]);

        let nested = write(&model, &root.state, 2, m(1), model.children, Value::set([m(2).into()]));
        let state = write(&model, &nested.state, 3, m(2), model.name, Value::text("leaf")).state;

        assert!(state.is_attached(m(2)));
        for id in [m(2), m(1), MutableId::UNIVERSE] {
            assert_eq!(state.meta(id).unwrap().change_id, TransactionId(3));
        }
    }

    #[test]
    fn test_change_marker_bumps_once_per_transaction() {
        let model = model();
        let state = write(&model, &model.state, 1, MutableId::UNIVERSE, model.children, Value::set([m(1).into()])).state;
        let before = state.meta(m(1)).unwrap().change_nr;

        let state = write(&model, &state, 2, m(1), model.name, Value::text("a")).state;
        let state = write(&model, &state, 2, m(1), model.name, Value::text("b")).state;
        assert_eq!(state.meta(m(1)).unwrap().change_nr, before.wrapping_add(1));
    }

    #[test]
    fn test_moving_child_releases_previous_owner() {
        let model = model();
        let state = write(&model, &model.state, 1, m(1), model.children, Value::set([m(3).into()])).state;
        let moved = write(&model, &state, 2, m(2), model.children, Value::set([m(3).into()]));

        let children = model.properties.require(model.children).unwrap();
        assert_eq!(moved.state.get(m(1), children), Value::set([]));
        assert_eq!(moved.state.parent(m(3)), Some(Slot::new(m(2), model.children)));
        assert!(moved.changed.contains(&Slot::new(m(1), model.children)));
    }

    #[test]
    fn test_opposite_is_maintained() {
        let model = model();
        let items = model.properties.require(model.items).unwrap();

        let state = write(&model, &model.state, 1, m(1), model.owner, m(4).into()).state;
        assert_eq!(state.get(m(4), items), Value::set([m(1).into()]));

        let state = write(&model, &state, 2, m(1), model.owner, Value::Empty).state;
        assert_eq!(state.get(m(4), items), Value::set([]));
    }

    #[test]
    fn test_plumbing_does_not_mark() {
        let mut model = model();
        let hidden = model.properties.register(Property::setable("hidden", Value::Empty).plumbing());
        let applied = write(&model, &model.state, 7, m(1), hidden, Value::Int(1));
        assert_ne!(applied.state.meta(m(1)).unwrap().change_id, TransactionId(7));
    }
}
