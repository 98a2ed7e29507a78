//! Causal traces of observer runs
//!
//! While the runaway guard is in debugging mode every changing run records an
//! [`ObserverTrace`]. Traces live in an arena for the duration of one cycle
//! and point backwards (by [`TraceId`]) at the traces that last wrote the
//! values they read.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Instant;

use im::{OrdMap, OrdSet};
use parking_lot::Mutex;

use ripple_core::{MutableId, ObserverId, ObserverKey, Properties, Slot, Value};

/// Index of a trace in the arena
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TraceId(pub u32);

/// Immutable record of one observer run
#[derive(Clone, Debug)]
pub struct ObserverTrace {
    pub id: TraceId,
    pub mutable: MutableId,
    pub observer: ObserverId,
    pub name: Arc<str>,
    pub nr_of_changes: usize,
    /// Previous trace of the same instance
    pub previous: Option<TraceId>,
    pub read: OrdMap<Slot, Value>,
    pub written: OrdMap<Slot, Value>,
    /// Every trace already covered by this trace's ancestry
    pub done: OrdSet<TraceId>,
    /// For each read slot, the traces that last wrote it
    pub back_trace: OrdMap<Slot, OrdSet<TraceId>>,
    pub time: Instant,
}

impl ObserverTrace {
    pub fn key(&self) -> ObserverKey {
        ObserverKey::new(self.mutable, self.observer)
    }
}

#[derive(Default)]
struct TraceStore {
    traces: Vec<Arc<ObserverTrace>>,
    readers: HashMap<Slot, OrdSet<TraceId>>,
    writers: HashMap<Slot, OrdSet<TraceId>>,
    history: HashMap<ObserverKey, VecDeque<TraceId>>,
}

impl TraceStore {
    fn trace(&self, id: TraceId) -> Option<&Arc<ObserverTrace>> {
        self.traces.get(id.0 as usize)
    }

    fn done_of(&self, id: TraceId) -> OrdSet<TraceId> {
        self.trace(id).map(|t| t.done.clone()).unwrap_or_default()
    }
}

/// Arena of the traces recorded in the current cycle
pub struct TraceArena {
    store: Mutex<TraceStore>,
    max_history: usize,
}

impl TraceArena {
    pub fn new(max_history: usize) -> Self {
        TraceArena {
            store: Mutex::new(TraceStore::default()),
            max_history: max_history.max(1),
        }
    }

    /// Record a run of `key` and link it to the traces it depends on
    pub fn record(
        &self,
        key: ObserverKey,
        name: Arc<str>,
        nr_of_changes: usize,
        read: OrdMap<Slot, Value>,
        written: OrdMap<Slot, Value>,
    ) -> Arc<ObserverTrace> {
        let mut store = self.store.lock();
        let id = TraceId(store.traces.len() as u32);
        let previous = store.history.get(&key).and_then(|h| h.back().copied());

        for slot in read.keys() {
            store.readers.entry(*slot).or_default().insert(id);
        }
        for slot in written.keys() {
            store.writers.entry(*slot).or_default().insert(id);
        }

        let start_done = previous.map(|p| store.done_of(p)).unwrap_or_default();
        let mut back_trace: OrdMap<Slot, OrdSet<TraceId>> = read
            .keys()
            .map(|slot| {
                let writers = store.writers.get(slot).cloned().unwrap_or_default();
                let writers: OrdSet<TraceId> = writers
                    .into_iter()
                    .filter(|w| *w != id && !start_done.contains(w))
                    .collect();
                (*slot, writers)
            })
            .collect();

        let back: OrdSet<TraceId> = back_trace.values().flat_map(|s| s.iter().copied()).collect();
        let back_done: OrdSet<TraceId> = back.iter().flat_map(|b| store.done_of(*b)).collect();
        back_trace = back_trace
            .into_iter()
            .map(|(slot, writers)| {
                let writers: OrdSet<TraceId> = writers.into_iter().filter(|w| !back_done.contains(w)).collect();
                (slot, writers)
            })
            .collect();

        // Prefer causes outside this instance when there are any
        let foreign = |t: &TraceId| store.trace(*t).map_or(false, |w| w.key() != key);
        if back_trace.values().any(|s| s.iter().any(foreign)) {
            back_trace = back_trace
                .into_iter()
                .map(|(slot, writers)| {
                    let writers: OrdSet<TraceId> = writers.into_iter().filter(|w| foreign(w)).collect();
                    (slot, writers)
                })
                .collect();
        }

        let mut done = start_done.union(back).union(back_done);
        if let Some(p) = previous {
            done = done.union(store.done_of(p)).update(p);
        }

        let trace = Arc::new(ObserverTrace {
            id,
            mutable: key.mutable,
            observer: key.observer,
            name,
            nr_of_changes,
            previous,
            read,
            written,
            done,
            back_trace,
            time: Instant::now(),
        });
        store.traces.push(Arc::clone(&trace));

        let max_history = self.max_history;
        let history = store.history.entry(key).or_default();
        history.push_back(id);
        while history.len() > max_history {
            history.pop_front();
        }
        trace
    }

    /// Most recent trace of an instance
    pub fn last(&self, key: ObserverKey) -> Option<Arc<ObserverTrace>> {
        let store = self.store.lock();
        let id = store.history.get(&key)?.back().copied()?;
        store.trace(id).cloned()
    }

    pub fn get(&self, id: TraceId) -> Option<Arc<ObserverTrace>> {
        self.store.lock().trace(id).cloned()
    }

    /// Bounded trace history of an instance, oldest first
    pub fn history(&self, key: ObserverKey) -> Vec<Arc<ObserverTrace>> {
        let store = self.store.lock();
        store
            .history
            .get(&key)
            .map(|h| h.iter().filter_map(|id| store.trace(*id).cloned()).collect())
            .unwrap_or_default()
    }

    /// Traces that read `slot`
    pub fn readers(&self, slot: Slot) -> OrdSet<TraceId> {
        self.store.lock().readers.get(&slot).cloned().unwrap_or_default()
    }

    /// Traces that wrote `slot`
    pub fn writers(&self, slot: Slot) -> OrdSet<TraceId> {
        self.store.lock().writers.get(&slot).cloned().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.store.lock().traces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        *self.store.lock() = TraceStore::default();
    }

    /// Render the backward causal walk from `trace`, visiting at most `max_len` runs
    pub fn render(&self, trace: &ObserverTrace, max_len: usize, properties: &Properties) -> String {
        let store = self.store.lock();
        let mut out = String::new();
        let mut visited = BTreeSet::new();
        render_into(&store, trace, 0, &mut visited, max_len, properties, &mut out);
        out
    }
}

fn slot_name(slot: Slot, properties: &Properties) -> String {
    match properties.get(slot.property) {
        Some(p) => format!("{}.{}", slot.object, p.name),
        None => format!("{:?}", slot),
    }
}

fn render_into(
    store: &TraceStore,
    trace: &ObserverTrace,
    depth: usize,
    visited: &mut BTreeSet<TraceId>,
    max_len: usize,
    properties: &Properties,
    out: &mut String,
) {
    let indent = "  ".repeat(depth);
    let _ = writeln!(out, "{}run  : {}.{} nr: {}", indent, trace.mutable, trace.name, trace.nr_of_changes);
    if visited.len() >= max_len || !visited.insert(trace.id) {
        return;
    }
    for (slot, writers) in trace.back_trace.iter() {
        if writers.is_empty() {
            continue;
        }
        let value = trace.read.get(slot).cloned().unwrap_or_default();
        let _ = writeln!(out, "{}read : {}={}", indent, slot_name(*slot, properties), value);
        for writer in writers.iter().filter_map(|w| store.trace(*w)) {
            let written = writer.written.get(slot).cloned().unwrap_or_default();
            let _ = writeln!(out, "{}write: {}={}", indent, slot_name(*slot, properties), written);
            render_into(store, writer, depth + 1, visited, max_len, properties, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ripple_core::{Property, PropertyId};

    fn slot() -> Slot {
        Slot::new(MutableId::new(1), PropertyId::new(0))
    }

    fn self_loop(arena: &TraceArena, key: ObserverKey, n: i64) -> Arc<ObserverTrace> {
        arena.record(
            key,
            Arc::from("inc"),
            n as usize,
            OrdMap::unit(slot(), Value::Int(n)),
            OrdMap::unit(slot(), Value::Int(n + 1)),
        )
    }

    #[test]
    fn test_self_loop_accumulates_done() {
        let arena = TraceArena::new(8);
        let key = ObserverKey::new(MutableId::new(1), ObserverId::new(0));

        let t1 = self_loop(&arena, key, 0);
        let t2 = self_loop(&arena, key, 1);
        let t3 = self_loop(&arena, key, 2);

        assert!(t1.done.is_empty());
        assert_eq!(t2.back_trace.get(&slot()).unwrap(), &OrdSet::unit(t1.id));
        assert_eq!(t3.done.len(), 2);
        assert!(!t3.done.contains(&t3.id));
        assert_eq!(arena.last(key).unwrap().id, t3.id);
    }

    #[test]
    fn test_history_is_bounded() {
        let arena = TraceArena::new(2);
        let key = ObserverKey::new(MutableId::new(1), ObserverId::new(0));
        for n in 0..5 {
            self_loop(&arena, key, n);
        }
        assert_eq!(arena.history(key).len(), 2);
        assert_eq!(arena.len(), 5);
        assert_eq!(arena.writers(slot()).len(), 5);

        arena.clear();
        assert!(arena.is_empty());
        assert!(arena.last(key).is_none());
    }

    #[test]
    fn test_foreign_writers_are_preferred() {
        let arena = TraceArena::new(8);
        let me = ObserverKey::new(MutableId::new(1), ObserverId::new(0));
        let other = ObserverKey::new(MutableId::new(2), ObserverId::new(1));

        self_loop(&arena, me, 0);
        let foreign = arena.record(other, Arc::from("other"), 1, OrdMap::new(), OrdMap::unit(slot(), Value::Int(9)));
        let mine = self_loop(&arena, me, 1);

        assert_eq!(mine.back_trace.get(&slot()).unwrap(), &OrdSet::unit(foreign.id));
    }

    #[test]
    fn test_render_is_bounded() {
        let mut properties = Properties::new();
        properties.register(Property::observed("p", Value::Int(0)));
        let arena = TraceArena::new(64);
        let key = ObserverKey::new(MutableId::new(1), ObserverId::new(0));
        let mut last = None;
        for n in 0..20 {
            last = Some(self_loop(&arena, key, n));
        }

        let rendered = arena.render(&last.unwrap(), 3, &properties);
        assert!(rendered.starts_with("run  : m1.inc nr: 19"));
        assert!(rendered.contains("read : m1.p=19"));
        assert!(rendered.lines().filter(|l| l.trim_start().starts_with("run")).count() <= 4);
    }
}
