//! The view an observer body has of the engine
//!
//! Every read and write of a run goes through an [`ObserverContext`], which
//! records them in an [`Accumulator`]. Writes to observed properties are
//! reconciled (and identity-matched) before they are committed to the shared
//! snapshot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use im::{OrdMap, OrdSet};

use ripple_core::{
    EngineConfig, MutableId, MutableMeta, NewableInfo, NewableSpec, ObserverError, ObserverKey, Properties, Property,
    PropertyId, Reason, RippleResult, Slot, State, TransactionId, Value,
};
use ripple_state::{MutableState, Transition};

use crate::guard::RunawayGuard;
use crate::matching::{self, IdentityPolicy};
use crate::observer::{Observer, Observers, Priority};
use crate::reconcile::{ripple_out, ChangeOracle};
use crate::trace::TraceArena;

// ============================================================================
// Accumulator
// ============================================================================

/// Everything one run (or one concurrent part of a run) has observed and done
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Accumulator {
    /// Observed slots read
    pub reads: OrdSet<Slot>,
    /// Observed slots written through reconciliation
    pub writes: OrdSet<Slot>,
    /// Entities constructed in this run, by reason
    pub constructions: OrdMap<Reason, MutableId>,
    /// An observed slot changed
    pub changed: bool,
    /// A write deferred to a concurrent edit
    pub backwards: bool,
    /// A mandatory property was read empty
    pub empty_mandatory: bool,
    /// Every slot whose committed value changed, for fan-out
    pub touched: OrdSet<Slot>,
    /// Mutables that became contained
    pub contained: OrdSet<MutableId>,
    /// Mutables let go by a containment write
    pub released: OrdSet<MutableId>,
    /// Observer instances to schedule, with the most urgent priority requested
    pub triggers: OrdMap<ObserverKey, Priority>,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Combine two partial results.
    ///
    /// Sets are unioned and flags or-ed. For constructions the entries of
    /// `other` win on a shared reason.
    pub fn merge(self, other: Accumulator) -> Accumulator {
        Accumulator {
            reads: self.reads.union(other.reads),
            writes: self.writes.union(other.writes),
            constructions: other.constructions.union(self.constructions),
            changed: self.changed || other.changed,
            backwards: self.backwards || other.backwards,
            empty_mandatory: self.empty_mandatory || other.empty_mandatory,
            touched: self.touched.union(other.touched),
            contained: self.contained.union(other.contained),
            released: self.released.union(other.released),
            triggers: self.triggers.union_with(other.triggers, |a, b| a.min(b)),
        }
    }

    pub fn trigger(&mut self, key: ObserverKey, priority: Priority) {
        let priority = self.triggers.get(&key).map_or(priority, |p| (*p).min(priority));
        self.triggers.insert(key, priority);
    }
}

// ============================================================================
// Cycle context
// ============================================================================

/// Everything shared by the runs of one outer cycle
pub struct CycleContext<'u> {
    pub state: &'u MutableState,
    pub properties: &'u Properties,
    pub observers: &'u Observers,
    pub config: &'u EngineConfig,
    pub guard: &'u RunawayGuard,
    pub traces: &'u TraceArena,
    pub policy: &'u dyn IdentityPolicy,
    /// Source of fresh mutable ids
    pub ids: &'u AtomicU64,
    /// Snapshot at the start of the outer cycle
    pub start: Arc<State>,
    pub txid: TransactionId,
}

impl<'u> CycleContext<'u> {
    pub(crate) fn new_mutable(&self, meta: MutableMeta) -> MutableId {
        let id = MutableId::new(self.ids.fetch_add(1, Ordering::SeqCst));
        self.state.create(id, meta);
        id
    }
}

// ============================================================================
// Observer context
// ============================================================================

/// The body's handle on the engine during one run
pub struct ObserverContext<'a> {
    pub(crate) cycle: &'a CycleContext<'a>,
    key: ObserverKey,
    observer: &'a Observer,
    /// Snapshot the run started from
    pre: &'a State,
    pub(crate) acc: Accumulator,
    observing: bool,
}

impl<'a> ObserverContext<'a> {
    pub(crate) fn new(cycle: &'a CycleContext<'a>, key: ObserverKey, observer: &'a Observer, pre: &'a State) -> Self {
        ObserverContext {
            cycle,
            key,
            observer,
            pre,
            acc: Accumulator::new(),
            observing: true,
        }
    }

    /// The mutable this instance is bound to
    #[inline]
    pub fn mutable(&self) -> MutableId {
        self.key.mutable
    }

    #[inline]
    pub fn key(&self) -> ObserverKey {
        self.key
    }

    pub fn observer(&self) -> &Observer {
        self.observer
    }

    #[inline]
    pub fn txid(&self) -> TransactionId {
        self.cycle.txid
    }

    /// The current committed snapshot
    pub fn live(&self) -> Arc<State> {
        self.cycle.state.state()
    }

    pub fn property(&self, id: PropertyId) -> RippleResult<&'a Property> {
        self.cycle.properties.require(id)
    }

    pub(crate) fn policy(&self) -> &'a dyn IdentityPolicy {
        self.cycle.policy
    }

    pub(crate) fn into_accumulator(self) -> Accumulator {
        self.acc
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Read `object.property`, registering a dependency on observed properties.
    ///
    /// Unknown properties read as empty.
    pub fn get(&mut self, object: MutableId, property: PropertyId) -> Value {
        let property = match self.cycle.properties.get(property) {
            Some(p) => p,
            None => return Value::Empty,
        };
        self.observe(object, property);
        let value = self.cycle.state.get(object, property);
        if value.is_empty() && property.is_mandatory() {
            self.acc.empty_mandatory = true;
        }
        value
    }

    /// Like [`get`](Self::get), failing on an empty mandatory property
    pub fn require(&mut self, object: MutableId, property: PropertyId) -> Result<Value, ObserverError> {
        let value = self.get(object, property);
        if value.is_empty() && self.property(property)?.is_mandatory() {
            return Err(ObserverError::EmptyMandatory { object, property });
        }
        Ok(value)
    }

    /// Read `object.property` as it was when the run started
    pub fn pre(&mut self, object: MutableId, property: PropertyId) -> Value {
        let property = match self.cycle.properties.get(property) {
            Some(p) => p,
            None => return Value::Empty,
        };
        self.observe(object, property);
        let mut value = self.pre.get(object, property);
        if value.is_empty() && property.is_mandatory() {
            value = self.cycle.state.get(object, property);
            if value.is_empty() {
                self.acc.empty_mandatory = true;
            }
        }
        value
    }

    fn observe(&mut self, object: MutableId, property: &Property) {
        if self.observing && property.is_observed() {
            self.acc.reads.insert(Slot::new(object, property.id));
        }
    }

    pub(crate) fn observe_slot(&mut self, slot: Slot) {
        self.acc.reads.insert(slot);
    }

    /// Run `f` without registering dependencies or reconciling writes
    pub fn non_observing<R, F>(&mut self, f: F) -> R
    where
        F: FnOnce(&mut Self) -> R,
    {
        let observing = self.observing;
        self.observing = false;
        let result = f(self);
        self.observing = observing;
        result
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Write `object.property = value`.
    ///
    /// Writes to observed properties are reconciled against concurrent
    /// edits and matched for newables before being committed. Emptying a
    /// mandatory property commits and then yields the recoverable
    /// [`ObserverError::EmptyMandatory`].
    pub fn set(&mut self, object: MutableId, property: PropertyId, value: Value) -> Result<(), ObserverError> {
        let property = self.property(property)?;
        if !(self.observing && property.is_observed()) {
            self.commit(object, property, value);
            return Ok(());
        }
        let pre = self.cycle.state.get(object, property);
        let emptying = property.is_mandatory() && value.is_empty();
        self.acc.writes.insert(Slot::new(object, property.id));
        let start = self.cycle.start.get(object, property);
        let live = self.live();
        let post = if is_newable(&live, &pre) || is_newable(&live, &value) {
            matching::single_match(self, property, &start, pre, value)
        } else if is_newable_collection(&live, &pre) || is_newable_collection(&live, &value) {
            matching::many_match(self, object, property, &start, &pre, value)
        } else {
            self.ripple(property, &start, &pre, value)
        };
        let emptied = emptying && post.is_empty();
        self.commit(object, property, post);
        if emptied {
            return Err(ObserverError::EmptyMandatory { object, property: property.id });
        }
        Ok(())
    }

    /// Add a member to a collection property
    pub fn add(&mut self, object: MutableId, property: PropertyId, member: Value) -> Result<(), ObserverError> {
        let current = self.get(object, property);
        self.set(object, property, current.with(member))
    }

    /// Remove a member from a collection property
    pub fn remove(&mut self, object: MutableId, property: PropertyId, member: &Value) -> Result<(), ObserverError> {
        let current = self.get(object, property);
        self.set(object, property, current.without(member))
    }

    /// Reconcile a write and note a deferral
    pub(crate) fn ripple(&mut self, property: &Property, start: &Value, pre: &Value, post: Value) -> Value {
        let reconciled = ripple_out(property, start, pre, post, &*self);
        if reconciled.backwards {
            self.acc.backwards = true;
        }
        reconciled.value
    }

    /// Commit without reconciliation
    pub(crate) fn commit(&mut self, object: MutableId, property: &Property, value: Value) -> Transition {
        let transition = self.cycle.state.set(self.cycle.txid, object, property, value);
        for slot in &transition.changed {
            self.acc.touched.insert(*slot);
            if self.observing && self.cycle.properties.is_observed(slot.property) {
                self.acc.changed = true;
            }
        }
        self.acc.contained.extend(transition.contained.iter().copied());
        self.acc.released.extend(transition.released.iter().copied());
        transition
    }

    pub(crate) fn trigger(&mut self, key: ObserverKey, priority: Priority) {
        self.acc.trigger(key, priority);
    }

    // ========================================================================
    // Construction
    // ========================================================================

    /// The entity this instance constructs for `reason`.
    ///
    /// Reuses the entity constructed for the same reason earlier in this run,
    /// in the last committed run, or at the start of the cycle (following
    /// unification to the survivor); otherwise creates a new newable.
    pub fn construct(&mut self, reason: Reason, spec: NewableSpec) -> MutableId {
        let live = self.live();
        let found = self
            .acc
            .constructions
            .get(&reason)
            .copied()
            .or_else(|| live.constructed(self.key).get(&reason).copied())
            .or_else(|| self.cycle.start.constructed(self.key).get(&reason).copied());
        let id = match found {
            Some(id) => live.resolve(id),
            None => self.direct_construct(spec),
        };
        self.acc.constructions.insert(reason, id);
        id
    }

    /// Create a newable without any construction bookkeeping
    pub fn direct_construct(&mut self, spec: NewableSpec) -> MutableId {
        let info = NewableInfo { sort_key: spec.sort_key };
        self.cycle.new_mutable(MutableMeta::newable(spec.class, info))
    }

    // ========================================================================
    // Concurrent sub-work
    // ========================================================================

    /// Run `tasks` concurrently, each against its own accumulator.
    ///
    /// The partial accumulators are merged in task order once every task has
    /// finished; the first error in task order is returned.
    pub fn fork_join<F>(&mut self, tasks: Vec<F>) -> Result<(), ObserverError>
    where
        F: FnOnce(&mut ObserverContext<'a>) -> Result<(), ObserverError> + Send,
    {
        let parts: Vec<(Accumulator, Result<(), ObserverError>)> = std::thread::scope(|scope| {
            let handles: Vec<_> = tasks
                .into_iter()
                .map(|task| {
                    let mut child = self.fork();
                    scope.spawn(move || {
                        let result = task(&mut child);
                        (child.acc, result)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| match handle.join() {
                    Ok(part) => part,
                    Err(_) => (Accumulator::new(), Err(ObserverError::failed("concurrent task panicked"))),
                })
                .collect()
        });

        let mut first_error = None;
        for (acc, result) in parts {
            self.acc = std::mem::take(&mut self.acc).merge(acc);
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn fork(&self) -> ObserverContext<'a> {
        ObserverContext {
            cycle: self.cycle,
            key: self.key,
            observer: self.observer,
            pre: self.pre,
            acc: Accumulator::new(),
            observing: self.observing,
        }
    }
}

impl ChangeOracle for ObserverContext<'_> {
    fn is_changed(&self, mutable: MutableId) -> bool {
        match self.cycle.start.meta(mutable) {
            Some(start) if start.parent.is_some() => {
                let live = self.live();
                live.meta(mutable).map_or(false, |m| m.change_nr != start.change_nr)
            }
            _ => false,
        }
    }

    fn input_is_changed(&self) -> bool {
        let live = self.live();
        self.acc
            .reads
            .iter()
            .filter(|slot| !self.acc.writes.contains(*slot) && slot.property.constructed_by().is_none())
            .any(|slot| self.cycle.start.raw(*slot) != live.raw(*slot))
    }
}

pub(crate) fn is_newable(state: &State, value: &Value) -> bool {
    value
        .as_mutable()
        .and_then(|m| state.meta(m))
        .map_or(false, MutableMeta::is_newable)
}

pub(crate) fn is_newable_collection(state: &State, value: &Value) -> bool {
    value.is_collection() && value.first().map_or(false, |v| is_newable(state, v))
}
