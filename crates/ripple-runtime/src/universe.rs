//! Universe - a single-threaded fixpoint driver
//!
//! Each outer cycle:
//! 1. Apply the external action
//! 2. Fan out its writes to dependent observer instances
//! 3. Run the agenda to a fixpoint (urgent, then forward, then backward)
//! 4. Roll back to the cycle start on a fatal error
//! 5. Check consistency of everything that changed

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use im::OrdSet;
use tracing::{debug, warn};

use ripple_core::{
    ClassId, ConsistencyError, Construction, EngineConfig, MutableId, MutableMeta, NewableInfo, NewableSpec,
    ObserverError, ObserverFailure, ObserverId, ObserverKey, Properties, Property, PropertyId, Reason, RippleError,
    RippleResult, Slot, State, TransactionId, Value,
};
use ripple_state::MutableState;

use crate::context::{CycleContext, ObserverContext};
use crate::guard::RunawayGuard;
use crate::matching::{DefaultIdentityPolicy, IdentityPolicy};
use crate::observer::{Observer, Observers, Priority};
use crate::trace::TraceArena;
use crate::transaction::ObserverTransactions;

/// Observers and declared properties of a class
#[derive(Clone, Debug, Default)]
pub struct ClassDef {
    pub observers: Vec<ObserverId>,
    /// Properties checked after each cycle (mandatory, scope)
    pub properties: Vec<PropertyId>,
}

/// One executed run
#[derive(Clone, Debug)]
pub struct RunRecord {
    pub key: ObserverKey,
    pub observer: Arc<str>,
    pub priority: Priority,
    pub changed: bool,
    pub backwards: bool,
    pub failure: Option<ObserverFailure>,
}

/// Result of one outer cycle
#[derive(Clone, Debug, Default)]
pub struct CycleReport {
    pub txid: TransactionId,
    pub runs: Vec<RunRecord>,
    pub errors: Vec<ConsistencyError>,
    /// The cycle hit a fatal error and was rolled back
    pub rolled_back: bool,
}

impl CycleReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// Runs of one instance, in execution order
    pub fn runs_of(&self, key: ObserverKey) -> impl Iterator<Item = &RunRecord> {
        self.runs.iter().filter(move |r| r.key == key)
    }

    fn report(&mut self, error: ConsistencyError) {
        if !self.errors.contains(&error) {
            self.errors.push(error);
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct RuntimeStats {
    pub cycles: u64,
    pub runs: u64,
    pub changed_runs: u64,
    pub rollbacks: u64,
    pub last_cycle_duration: Duration,
}

// ============================================================================
// Agenda
// ============================================================================

/// Pending observer instances, most urgent first
#[derive(Debug, Default)]
struct Agenda {
    queue: BTreeSet<(Priority, ObserverKey)>,
    index: HashMap<ObserverKey, Priority>,
}

impl Agenda {
    /// Schedule `key`; an already scheduled instance keeps the more urgent priority
    fn push(&mut self, key: ObserverKey, priority: Priority) {
        if let Some(current) = self.index.get(&key).copied() {
            if current <= priority {
                return;
            }
            self.queue.remove(&(current, key));
        }
        self.index.insert(key, priority);
        self.queue.insert((priority, key));
    }

    fn pop(&mut self) -> Option<(Priority, ObserverKey)> {
        let next = self.queue.pop_first()?;
        self.index.remove(&next.1);
        Some(next)
    }

    fn clear(&mut self) {
        self.queue.clear();
        self.index.clear();
    }

    fn len(&self) -> usize {
        self.queue.len()
    }
}

// ============================================================================
// Universe
// ============================================================================

pub struct Universe {
    state: MutableState,
    properties: Arc<Properties>,
    observers: Observers,
    classes: HashMap<ClassId, ClassDef>,
    config: EngineConfig,
    guard: RunawayGuard,
    traces: TraceArena,
    policy: Box<dyn IdentityPolicy>,
    ids: AtomicU64,
    txid: TransactionId,
    pool: ObserverTransactions,
    agenda: Agenda,
    stats: RuntimeStats,
    started: bool,
}

impl Universe {
    pub fn new(properties: Properties, root_class: ClassId) -> Self {
        Self::with_config(properties, root_class, EngineConfig::default())
    }

    pub fn with_config(properties: Properties, root_class: ClassId, config: EngineConfig) -> Self {
        let properties = Arc::new(properties);
        Universe {
            state: MutableState::new(State::new(root_class), Arc::clone(&properties)),
            properties,
            observers: Observers::new(),
            classes: HashMap::new(),
            guard: RunawayGuard::new(&config),
            traces: TraceArena::new(config.max_trace_history),
            config,
            policy: Box::new(DefaultIdentityPolicy),
            ids: AtomicU64::new(1),
            txid: TransactionId::ZERO,
            pool: ObserverTransactions::new(),
            agenda: Agenda::default(),
            stats: RuntimeStats::default(),
            started: false,
        }
    }

    pub fn with_policy<P: IdentityPolicy + 'static>(mut self, policy: P) -> Self {
        self.policy = Box::new(policy);
        self
    }

    // ========================================================================
    // Model
    // ========================================================================

    pub fn add_observer<F>(&mut self, name: &str, priority: Priority, rule: F) -> ObserverId
    where
        F: Fn(&mut ObserverContext<'_>) -> Result<(), ObserverError> + Send + Sync + 'static,
    {
        self.observers.add(name, priority, rule)
    }

    /// Bind observers and checked properties to `class`
    pub fn define_class(&mut self, class: ClassId, def: ClassDef) -> RippleResult<()> {
        for id in &def.observers {
            self.observers.require(*id)?;
        }
        for id in &def.properties {
            self.properties.require(*id)?;
        }
        self.classes.insert(class, def);
        Ok(())
    }

    pub fn class_def(&self, class: ClassId) -> RippleResult<&ClassDef> {
        self.classes.get(&class).ok_or(RippleError::UnknownClass(class))
    }

    /// Create a detached mutable outside of any cycle
    pub fn create_mutable(&self, class: ClassId) -> MutableId {
        let id = MutableId::new(self.ids.fetch_add(1, Ordering::SeqCst));
        self.state.create(id, MutableMeta::new(class));
        id
    }

    pub fn state(&self) -> Arc<State> {
        self.state.state()
    }

    pub fn get(&self, object: MutableId, property: PropertyId) -> RippleResult<Value> {
        Ok(self.state.get(object, self.properties.require(property)?))
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn observer(&self, id: ObserverId) -> Option<Arc<Observer>> {
        self.observers.get(id)
    }

    pub fn match_observer(&self, property: PropertyId) -> Arc<Observer> {
        self.observers.match_observer(property)
    }

    /// Failure captured on an observer instance
    pub fn exception(&self, key: ObserverKey) -> Option<ObserverFailure> {
        self.state.state().instance(key).and_then(|i| i.exception.clone())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stats(&self) -> &RuntimeStats {
        &self.stats
    }

    pub fn traces(&self) -> &TraceArena {
        &self.traces
    }

    /// Schedule an instance for the next cycle at the observer's priority
    pub fn trigger(&mut self, mutable: MutableId, observer: ObserverId) -> RippleResult<()> {
        let priority = self.observers.require(observer)?.priority();
        self.agenda.push(ObserverKey::new(mutable, observer), priority);
        Ok(())
    }

    // ========================================================================
    // Cycles
    // ========================================================================

    /// Apply `action` and run the resulting cycle to a fixpoint.
    ///
    /// A failing action is rolled back and its error returned.
    pub fn put<F>(&mut self, action: F) -> RippleResult<CycleReport>
    where
        F: FnOnce(&mut Action<'_>) -> RippleResult<()>,
    {
        let start = self.begin();
        let mut action_ctx = Action {
            state: &self.state,
            properties: &self.properties,
            ids: &self.ids,
            txid: self.txid,
            touched: OrdSet::new(),
            contained: OrdSet::new(),
            released: OrdSet::new(),
        };
        if let Err(e) = action(&mut action_ctx) {
            self.state.set_state(start);
            return Err(e);
        }
        let Action { touched, contained, released, .. } = action_ctx;
        Ok(self.settle(start, touched, contained, released))
    }

    /// Run a cycle without an external action
    pub fn run_cycle(&mut self) -> CycleReport {
        let start = self.begin();
        self.settle(start, OrdSet::new(), OrdSet::new(), OrdSet::new())
    }

    /// Stage 1: start a new transaction
    fn begin(&mut self) -> Arc<State> {
        self.txid = self.txid.next();
        self.guard.stats().start_cycle();
        self.traces.clear();
        self.state.state()
    }

    fn settle(
        &mut self,
        start: Arc<State>,
        touched: OrdSet<Slot>,
        contained: OrdSet<MutableId>,
        released: OrdSet<MutableId>,
    ) -> CycleReport {
        let began = Instant::now();
        let mut report = CycleReport { txid: self.txid, ..Default::default() };
        let mut attached = BTreeSet::new();

        // Stage 2: fan out the action
        let live = self.state.state();
        if !self.started {
            self.started = true;
            self.trigger_subtree(MutableId::UNIVERSE, &live, &mut attached);
        }
        for slot in touched.iter() {
            self.fan_out(*slot, None, &live);
        }
        for m in contained.iter() {
            self.trigger_subtree(*m, &live, &mut attached);
        }
        self.release(&released);

        // Stage 3: fixpoint
        if let Err(fatal) = self.fixpoint(&start, &mut report, &mut attached) {
            // Stage 4: roll back
            warn!(txid = ?self.txid, error = %fatal, "cycle rolled back");
            self.state.set_state(Arc::clone(&start));
            self.agenda.clear();
            self.resync_instances();
            self.stats.rollbacks += 1;
            report.rolled_back = true;
            report.report(fatal);
        }

        // Stage 5: consistency
        self.check_consistency(&mut report, &attached);

        self.stats.cycles += 1;
        self.stats.last_cycle_duration = began.elapsed();
        debug!(
            txid = ?self.txid,
            runs = report.runs.len(),
            errors = report.errors.len(),
            elapsed = ?self.stats.last_cycle_duration,
            "cycle settled"
        );
        report
    }

    fn fixpoint(
        &mut self,
        start: &Arc<State>,
        report: &mut CycleReport,
        attached: &mut BTreeSet<MutableId>,
    ) -> Result<(), ConsistencyError> {
        while let Some((priority, key)) = self.agenda.pop() {
            let live = self.state.state();
            if !live.is_attached(key.mutable) {
                self.forget(key);
                continue;
            }
            let observer = match self.observers.get(key.observer) {
                Some(observer) => observer,
                None => continue,
            };

            let mut tx = self.pool.open(key, Arc::clone(&observer));
            let result = {
                let cycle = CycleContext {
                    state: &self.state,
                    properties: &self.properties,
                    observers: &self.observers,
                    config: &self.config,
                    guard: &self.guard,
                    traces: &self.traces,
                    policy: self.policy.as_ref(),
                    ids: &self.ids,
                    start: Arc::clone(start),
                    txid: self.txid,
                };
                tx.run(live, &cycle)
            };
            let outcome = tx.take_outcome();
            self.pool.close(tx);
            result?;
            if outcome.skipped {
                continue;
            }

            self.stats.runs += 1;
            if outcome.changed {
                self.stats.changed_runs += 1;
            }
            report.runs.push(RunRecord {
                key,
                observer: observer.name().clone(),
                priority,
                changed: outcome.changed,
                backwards: outcome.backwards,
                failure: outcome.failure.clone(),
            });

            let live = self.state.state();
            for slot in outcome.touched.iter() {
                self.fan_out(*slot, Some(key), &live);
            }
            for m in outcome.contained.iter() {
                self.trigger_subtree(*m, &live, attached);
            }
            self.release(&outcome.released);
            for (other, requested) in outcome.triggers.iter() {
                // A backward run that deferred again has nothing new to settle
                let settled = *other == key && *requested == Priority::Backward && priority == Priority::Backward;
                if !settled {
                    self.agenda.push(*other, *requested);
                }
            }
        }
        Ok(())
    }

    /// Schedule the dependents of `slot`, except the writer
    fn fan_out(&mut self, slot: Slot, writer: Option<ObserverKey>, state: &State) {
        for key in state.observers_of(slot).iter().filter(|k| Some(**k) != writer) {
            if let Some(observer) = self.observers.get(key.observer) {
                self.agenda.push(*key, observer.priority());
            }
        }
    }

    /// Schedule the class observers of `root` and everything it contains
    fn trigger_subtree(&mut self, root: MutableId, state: &State, attached: &mut BTreeSet<MutableId>) {
        for m in self.subtree(root, state) {
            attached.insert(m);
            if let Some(def) = state.meta(m).and_then(|meta| self.classes.get(&meta.class)) {
                for id in &def.observers {
                    if let Some(observer) = self.observers.get(*id) {
                        self.agenda.push(ObserverKey::new(m, *id), observer.priority());
                    }
                }
            }
        }
    }

    /// `root` and everything below it, following the values of containment properties
    fn subtree(&self, root: MutableId, state: &State) -> BTreeSet<MutableId> {
        let containments: Vec<&Property> = self.properties.iter().filter(|p| p.is_containment()).collect();
        let mut seen = BTreeSet::new();
        let mut stack = vec![root];
        while let Some(m) = stack.pop() {
            if !seen.insert(m) {
                continue;
            }
            for property in &containments {
                let children = state.get(m, property).mutables();
                stack.extend(children.into_iter().filter(|c| state.parent(*c).map(|s| s.object) == Some(m)));
            }
        }
        seen
    }

    /// Forget every instance under a released mutable that is still detached
    fn release(&mut self, released: &OrdSet<MutableId>) {
        let live = self.state.state();
        let mut detached = BTreeSet::new();
        for m in released.iter().filter(|m| !live.is_attached(**m)) {
            detached.extend(self.subtree(*m, &live));
        }
        if detached.is_empty() {
            return;
        }
        let keys: Vec<ObserverKey> = live
            .instances()
            .filter(|(key, instance)| detached.contains(&key.mutable) && !instance.observeds.is_empty())
            .map(|(key, _)| key)
            .collect();
        debug!(mutables = detached.len(), instances = keys.len(), "released subtree");
        for key in keys {
            self.forget(key);
        }
    }

    /// Drop the dependencies of an instance whose mutable left the tree
    fn forget(&mut self, key: ObserverKey) {
        let (before, _) = self.state.update(|state| {
            if state.observeds(key).is_empty() {
                None
            } else {
                Some(state.with_observeds(key, OrdSet::new()))
            }
        });
        if !before.observeds(key).is_empty() {
            if let Some(observer) = self.observers.get(key.observer) {
                observer.remove_instance();
            }
        }
    }

    /// Recount instances from the dependency sets of the current state
    fn resync_instances(&self) {
        let live = self.state.state();
        let mut counts: HashMap<ObserverId, isize> = HashMap::new();
        for (key, instance) in live.instances() {
            if !instance.observeds.is_empty() {
                *counts.entry(key.observer).or_default() += 1;
            }
        }
        for observer in self.observers.all() {
            observer.set_instances(counts.get(&observer.id()).copied().unwrap_or(0));
        }
    }

    /// Stage 5: report captured failures and broken invariants.
    ///
    /// Failures are reported for instances that ran this cycle or whose
    /// mutable was attached by it.
    fn check_consistency(&self, report: &mut CycleReport, attached: &BTreeSet<MutableId>) {
        let live = self.state.state();
        let ran: BTreeSet<ObserverKey> = report.runs.iter().map(|r| r.key).collect();
        for (key, instance) in live.instances() {
            let current = ran.contains(&key) || attached.contains(&key.mutable);
            let failure = match &instance.exception {
                Some(failure) if current && live.is_attached(key.mutable) => failure,
                _ => continue,
            };
            let error = match failure.empty_mandatory {
                Some(slot) => {
                    // Repopulated later in the cycle
                    let property = self.properties.get(slot.property);
                    if property.map_or(false, |p| !live.get(slot.object, p).is_empty()) {
                        continue;
                    }
                    ConsistencyError::EmptyMandatory { object: slot.object, property: slot.property }
                }
                None => ConsistencyError::ObserverFailed {
                    mutable: key.mutable,
                    observer: self.observers.get(key.observer).map(|o| o.name().clone()).unwrap_or_else(|| Arc::from("?")),
                    message: failure.message.clone(),
                },
            };
            report.report(error);
        }

        let candidates: BTreeSet<MutableId> = live
            .changed_in(self.txid)
            .into_iter()
            .chain(attached.iter().copied())
            .filter(|m| live.is_attached(*m))
            .collect();
        for m in candidates {
            let def = match live.meta(m).and_then(|meta| self.classes.get(&meta.class)) {
                Some(def) => def,
                None => continue,
            };
            for property in def.properties.iter().filter_map(|id| self.properties.get(*id)) {
                let value = live.get(m, property);
                if property.is_mandatory() && value.is_empty() {
                    report.report(ConsistencyError::EmptyMandatory { object: m, property: property.id });
                }
                if let Some(scope) = property.scope.and_then(|id| self.properties.get(id)) {
                    let allowed = live.get(m, scope);
                    let members: Vec<Value> = if value.is_collection() {
                        value.members().cloned().collect()
                    } else if value.is_empty() {
                        Vec::new()
                    } else {
                        vec![value.clone()]
                    };
                    if members.iter().any(|v| !allowed.contains(v)) {
                        report.report(ConsistencyError::OutOfScope { object: m, property: property.id });
                    }
                }
            }
        }
    }

    /// Instances waiting for the next cycle
    pub fn pending(&self) -> usize {
        self.agenda.len()
    }
}

// ============================================================================
// Action
// ============================================================================

/// External edits applied at the start of a cycle
pub struct Action<'u> {
    state: &'u MutableState,
    properties: &'u Properties,
    ids: &'u AtomicU64,
    txid: TransactionId,
    touched: OrdSet<Slot>,
    contained: OrdSet<MutableId>,
    released: OrdSet<MutableId>,
}

impl<'u> Action<'u> {
    pub fn create(&mut self, class: ClassId) -> MutableId {
        self.create_with(MutableMeta::new(class))
    }

    /// Create a newable with a source construction; its identity is carved in stone
    pub fn construct(&mut self, owner: MutableId, reason: Reason, spec: NewableSpec) -> MutableId {
        let mut meta = MutableMeta::newable(spec.class, NewableInfo { sort_key: spec.sort_key });
        meta.derived_constructions.insert(Construction::source(owner, reason));
        self.create_with(meta)
    }

    fn create_with(&mut self, meta: MutableMeta) -> MutableId {
        let id = MutableId::new(self.ids.fetch_add(1, Ordering::SeqCst));
        self.state.create(id, meta);
        id
    }

    pub fn get(&self, object: MutableId, property: PropertyId) -> RippleResult<Value> {
        Ok(self.state.get(object, self.properties.require(property)?))
    }

    pub fn set(&mut self, object: MutableId, property: PropertyId, value: Value) -> RippleResult<()> {
        if !self.state.state().contains_mutable(object) {
            return Err(RippleError::UnknownMutable(object));
        }
        let property = self.properties.require(property)?;
        let transition = self.state.set(self.txid, object, property, value);
        self.touched.extend(transition.changed.iter().copied());
        self.contained.extend(transition.contained.iter().copied());
        self.released.extend(transition.released.iter().copied());
        Ok(())
    }

    pub fn add(&mut self, object: MutableId, property: PropertyId, member: Value) -> RippleResult<()> {
        let current = self.get(object, property)?;
        self.set(object, property, current.with(member))
    }

    pub fn remove(&mut self, object: MutableId, property: PropertyId, member: &Value) -> RippleResult<()> {
        let current = self.get(object, property)?;
        self.set(object, property, current.without(member))
    }
}
