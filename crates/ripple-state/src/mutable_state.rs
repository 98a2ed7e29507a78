//! The atomic current-snapshot reference
//!
//! All shared mutable state of the engine is one [`ArcSwap<State>`]. Every
//! commit is a read-modify-write loop that installs a new snapshot.

use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::trace;

use ripple_core::{MutableId, MutableMeta, Properties, Property, Slot, State, TransactionId, Value};

use crate::transition::{self, Applied};

/// Outcome of one committed write
#[derive(Clone, Debug)]
pub struct Transition {
    pub pre: Arc<State>,
    pub post: Arc<State>,
    pub changed: Vec<Slot>,
    pub contained: Vec<MutableId>,
    pub released: Vec<MutableId>,
}

impl Transition {
    #[inline]
    pub fn is_changed(&self) -> bool {
        !self.changed.is_empty()
    }
}

/// Atomically swapped current snapshot
pub struct MutableState {
    /// Snapshot installed by the last `set_state`
    previous: Mutex<Arc<State>>,
    atomic: ArcSwap<State>,
    properties: Arc<Properties>,
}

impl MutableState {
    pub fn new(state: State, properties: Arc<Properties>) -> Self {
        let state = Arc::new(state);
        MutableState {
            previous: Mutex::new(Arc::clone(&state)),
            atomic: ArcSwap::new(state),
            properties,
        }
    }

    /// The current snapshot
    pub fn state(&self) -> Arc<State> {
        self.atomic.load_full()
    }

    pub fn previous(&self) -> Arc<State> {
        self.previous.lock().clone()
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    /// Replace the current snapshot wholesale
    pub fn set_state(&self, state: Arc<State>) {
        let old = self.atomic.swap(state);
        *self.previous.lock() = old;
    }

    pub fn get(&self, object: MutableId, property: &Property) -> Value {
        self.atomic.load().get(object, property)
    }

    /// Read-modify-write loop; `f` may run more than once under contention.
    ///
    /// Returns the snapshots before and after the installed update.
    pub fn update<F>(&self, mut f: F) -> (Arc<State>, Arc<State>)
    where
        F: FnMut(&State) -> Option<State>,
    {
        let mut post = None;
        let pre = self.atomic.rcu(|current| {
            let next = match f(&**current) {
                Some(state) => Arc::new(state),
                None => Arc::clone(current),
            };
            post = Some(Arc::clone(&next));
            next
        });
        let post = post.unwrap_or_else(|| Arc::clone(&pre));
        (pre, post)
    }

    /// Commit `object.property = value` for transaction `txid`
    pub fn set(&self, txid: TransactionId, object: MutableId, property: &Property, value: Value) -> Transition {
        let mut applied: Option<Applied> = None;
        let (pre, post) = self.update(|current| {
            applied = transition::apply(current, &self.properties, txid, object, property, value.clone());
            applied.as_ref().map(|a| a.state.clone())
        });
        let (changed, contained, released) = match applied {
            Some(a) => (a.changed, a.contained, a.released),
            None => (Vec::new(), Vec::new(), Vec::new()),
        };
        if !changed.is_empty() {
            trace!(?txid, %object, property = %property.name, "commit");
            self.notify(&pre, &post, &changed);
        }
        Transition { pre, post, changed, contained, released }
    }

    /// Register a new mutable
    pub fn create(&self, id: MutableId, meta: MutableMeta) -> Arc<State> {
        self.update(|current| Some(current.with_meta(id, meta.clone()))).1
    }

    fn notify(&self, pre: &State, post: &State, changed: &[Slot]) {
        for slot in changed {
            if let Some(property) = self.properties.get(slot.property) {
                if let Some(hook) = &property.on_change {
                    hook(slot.object, &pre.get(slot.object, property), &post.get(slot.object, property));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use ripple_core::{ClassId, PropertyId};

    fn setup(hits: Arc<AtomicUsize>) -> (MutableState, PropertyId) {
        let mut properties = Properties::new();
        let name = properties.register(Property::observed("name", Value::Empty).on_change(move |_, _, _| {
            hits.fetch_add(1, Ordering::SeqCst);
        }));
        let state = State::new(ClassId::new(0)).with_meta(MutableId::new(1), MutableMeta::new(ClassId::new(1)));
        (MutableState::new(state, Arc::new(properties)), name)
    }

    #[test]
    fn test_set_installs_new_snapshot() {
        let hits = Arc::new(AtomicUsize::new(0));
        let (ms, name) = setup(Arc::clone(&hits));
        let property = ms.properties().require(name).unwrap().clone();

        let t = ms.set(TransactionId(1), MutableId::new(1), &property, Value::Int(4));
        assert!(t.is_changed());
        assert_eq!(ms.get(MutableId::new(1), &property), Value::Int(4));
        assert_eq!(t.pre.get(MutableId::new(1), &property), Value::Empty);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let again = ms.set(TransactionId(1), MutableId::new(1), &property, Value::Int(4));
        assert!(!again.is_changed());
        assert!(Arc::ptr_eq(&again.pre, &again.post));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_set_state_keeps_previous() {
        let (ms, _) = setup(Arc::new(AtomicUsize::new(0)));
        let first = ms.state();
        ms.set_state(Arc::new(State::default()));
        assert!(Arc::ptr_eq(&ms.previous(), &first));
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let (ms, name) = setup(Arc::new(AtomicUsize::new(0)));
        let property = ms.properties().require(name).unwrap().clone();
        let ms = Arc::new(ms);

        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let ms = Arc::clone(&ms);
                let property = property.clone();
                std::thread::spawn(move || {
                    for i in 0..25u64 {
                        let id = MutableId::new(100 + t * 25 + i);
                        ms.create(id, MutableMeta::new(ClassId::new(1)));
                        ms.set(TransactionId(1), id, &property, Value::Int(1));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let state = ms.state();
        assert_eq!(state.mutables().filter(|(id, _)| id.0 >= 100).count(), 100);
        assert!((100..200).all(|id| state.get(MutableId::new(id), &property) == Value::Int(1)));
    }
}
