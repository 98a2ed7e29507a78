//! Observers: reactive rules re-run when what they read changes

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::warn;

use ripple_core::{ObserverError, ObserverId, PropertyId, RippleError, RippleResult};

use crate::ObserverContext;

/// Body of a rule observer
pub type Rule = Arc<dyn Fn(&mut ObserverContext<'_>) -> Result<(), ObserverError> + Send + Sync>;

/// Scheduling class; urgent runs first, backward last
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Urgent,
    Forward,
    Backward,
}

#[derive(Clone)]
pub enum ObserverBody {
    Rule(Rule),
    /// Engine observer unifying the newables of a containment collection
    Match(PropertyId),
}

#[derive(Debug, Default)]
struct Counters {
    /// Outer cycle these counters belong to
    run_count: Option<u64>,
    changes: usize,
    instances: isize,
    stopped: bool,
}

/// A named reactive action
pub struct Observer {
    id: ObserverId,
    name: Arc<str>,
    priority: Priority,
    body: ObserverBody,
    counters: Mutex<Counters>,
}

impl Observer {
    pub fn new(id: ObserverId, name: &str, priority: Priority, body: ObserverBody) -> Self {
        Observer {
            id,
            name: Arc::from(name),
            priority,
            body,
            counters: Mutex::new(Counters::default()),
        }
    }

    #[inline]
    pub fn id(&self) -> ObserverId {
        self.id
    }

    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    #[inline]
    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn body(&self) -> &ObserverBody {
        &self.body
    }

    /// Reset run-scoped counters when a new outer cycle is detected
    pub fn start_transaction(&self, run_count: u64) {
        let mut counters = self.counters.lock();
        if counters.run_count != Some(run_count) {
            counters.run_count = Some(run_count);
            counters.changes = 0;
        }
    }

    /// Count one change and return the changes per instance
    pub fn count_changes_per_instance(&self) -> usize {
        let mut counters = self.counters.lock();
        counters.changes += 1;
        Self::per_instance(&counters)
    }

    pub fn changes_per_instance(&self) -> usize {
        Self::per_instance(&self.counters.lock())
    }

    /// An observer without registered instances counts as one
    fn per_instance(counters: &Counters) -> usize {
        counters.changes / counters.instances.max(1) as usize
    }

    pub fn changes(&self) -> usize {
        self.counters.lock().changes
    }

    pub fn instances(&self) -> isize {
        self.counters.lock().instances
    }

    /// A mutable started depending on this observer
    pub fn add_instance(&self) {
        let mut counters = self.counters.lock();
        if counters.instances <= 0 {
            counters.stopped = false;
        }
        counters.instances += 1;
    }

    pub fn remove_instance(&self) {
        self.counters.lock().instances -= 1;
    }

    /// Overwrite the instance count, e.g. after the state was rolled back
    pub fn set_instances(&self, instances: isize) {
        self.counters.lock().instances = instances;
    }

    pub fn stop(&self) {
        let mut counters = self.counters.lock();
        if !counters.stopped {
            warn!(observer = %self.name, changes = counters.changes, "observer stopped");
        }
        counters.stopped = true;
    }

    pub fn is_stopped(&self) -> bool {
        self.counters.lock().stopped
    }
}

impl fmt::Debug for Observer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observer")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .finish()
    }
}

impl fmt::Display for Observer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

#[derive(Default)]
struct Registry {
    observers: Vec<Arc<Observer>>,
    match_observers: HashMap<PropertyId, ObserverId>,
}

/// Registry of all observers
#[derive(Default)]
pub struct Observers {
    registry: RwLock<Registry>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<F>(&self, name: &str, priority: Priority, rule: F) -> ObserverId
    where
        F: Fn(&mut ObserverContext<'_>) -> Result<(), ObserverError> + Send + Sync + 'static,
    {
        self.insert(name, priority, ObserverBody::Rule(Arc::new(rule))).id()
    }

    fn insert(&self, name: &str, priority: Priority, body: ObserverBody) -> Arc<Observer> {
        let mut registry = self.registry.write();
        let id = ObserverId::new(registry.observers.len() as u32);
        let observer = Arc::new(Observer::new(id, name, priority, body));
        registry.observers.push(Arc::clone(&observer));
        observer
    }

    pub fn get(&self, id: ObserverId) -> Option<Arc<Observer>> {
        self.registry.read().observers.get(id.0 as usize).cloned()
    }

    pub fn require(&self, id: ObserverId) -> RippleResult<Arc<Observer>> {
        self.get(id).ok_or(RippleError::UnknownObserver(id))
    }

    /// The urgent match observer of a containment property, created on first use
    pub fn match_observer(&self, property: PropertyId) -> Arc<Observer> {
        if let Some(observer) = self.lookup_match(property) {
            return observer;
        }
        let mut registry = self.registry.write();
        if let Some(id) = registry.match_observers.get(&property) {
            return Arc::clone(&registry.observers[id.0 as usize]);
        }
        let id = ObserverId::new(registry.observers.len() as u32);
        let name = format!("MATCH:{:?}", property);
        let observer = Arc::new(Observer::new(id, &name, Priority::Urgent, ObserverBody::Match(property)));
        registry.observers.push(Arc::clone(&observer));
        registry.match_observers.insert(property, id);
        observer
    }

    fn lookup_match(&self, property: PropertyId) -> Option<Arc<Observer>> {
        let registry = self.registry.read();
        let id = registry.match_observers.get(&property)?;
        registry.observers.get(id.0 as usize).cloned()
    }

    pub fn all(&self) -> Vec<Arc<Observer>> {
        self.registry.read().observers.clone()
    }

    pub fn len(&self) -> usize {
        self.registry.read().observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
