//! One execution of one observer instance
//!
//! An [`ObserverTransaction`] moves through
//! `Idle -> ObservingDependencies -> RunningBody -> ReconcilingWrites -> Finalizing`.
//! Finalizing swaps the instance's dependency set, updates the instance
//! count of the observer, commits the constructed entities and the captured
//! failure, and decides whether the instance must run again.

use std::error::Error as StdError;
use std::sync::Arc;

use im::{OrdMap, OrdSet};
use parking_lot::Mutex;
use tracing::trace;

use ripple_core::{
    ConsistencyError, Construction, MutableId, ObserverError, ObserverFailure, ObserverKey, Reason, RippleError, Slot,
    State, Value,
};

use crate::context::{Accumulator, CycleContext, ObserverContext};
use crate::matching;
use crate::observer::{Observer, ObserverBody, Priority};

/// Execution phase of a run
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    ObservingDependencies,
    RunningBody,
    ReconcilingWrites,
    Finalizing,
}

/// What a run did, as seen by the scheduler
#[derive(Clone, Debug, Default)]
pub struct RunOutcome {
    /// An observed slot changed; the instance runs again forward
    pub changed: bool,
    /// A write deferred to a concurrent edit; the instance runs again backward
    pub backwards: bool,
    /// The observer is stopped and did not run
    pub skipped: bool,
    /// Captured, non-fatal failure
    pub failure: Option<ObserverFailure>,
    pub touched: OrdSet<Slot>,
    pub contained: OrdSet<MutableId>,
    pub released: OrdSet<MutableId>,
    pub triggers: OrdMap<ObserverKey, Priority>,
}

pub struct ObserverTransaction {
    key: ObserverKey,
    observer: Arc<Observer>,
    phase: Phase,
    outcome: RunOutcome,
}

impl ObserverTransaction {
    pub fn new(key: ObserverKey, observer: Arc<Observer>) -> Self {
        ObserverTransaction {
            key,
            observer,
            phase: Phase::Idle,
            outcome: RunOutcome::default(),
        }
    }

    #[inline]
    pub fn key(&self) -> ObserverKey {
        self.key
    }

    pub fn observer(&self) -> &Arc<Observer> {
        &self.observer
    }

    #[inline]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Whether the last run changed an observed slot
    #[inline]
    pub fn is_changed(&self) -> bool {
        self.outcome.changed
    }

    pub fn outcome(&self) -> &RunOutcome {
        &self.outcome
    }

    pub fn take_outcome(&mut self) -> RunOutcome {
        std::mem::take(&mut self.outcome)
    }

    fn enter(&mut self, phase: Phase) {
        trace!(
            mutable = %self.key.mutable,
            observer = %self.observer,
            from = ?self.phase,
            to = ?phase,
            "phase"
        );
        self.phase = phase;
    }

    /// Run the observer once against `pre`.
    ///
    /// Fatal errors stop the observer and are returned; anything else ends up
    /// in the outcome.
    pub fn run(&mut self, pre: Arc<State>, cycle: &CycleContext<'_>) -> Result<(), ConsistencyError> {
        self.outcome = RunOutcome::default();
        let observer = Arc::clone(&self.observer);
        observer.start_transaction(cycle.guard.stats().run_count());
        if observer.is_stopped() {
            self.outcome.skipped = true;
            return Ok(());
        }

        self.enter(Phase::ObservingDependencies);
        let mut ctx = ObserverContext::new(cycle, self.key, &observer, &pre);
        ctx.observe_slot(self.key.constructed_slot());

        self.enter(Phase::RunningBody);
        let result = match observer.body() {
            ObserverBody::Rule(rule) => rule(&mut ctx),
            ObserverBody::Match(property) => matching::match_collection(&mut ctx, *property),
        };

        self.enter(Phase::ReconcilingWrites);
        let failure = match result {
            Ok(()) => None,
            Err(error) => match classify(error) {
                Ok(failure) => Some(failure),
                Err(fatal) => {
                    observer.stop();
                    self.phase = Phase::Idle;
                    return Err(fatal);
                }
            },
        };

        self.enter(Phase::Finalizing);
        let acc = ctx.into_accumulator();
        let result = self.finalize(acc, failure, &pre, cycle);
        self.phase = Phase::Idle;
        result
    }

    fn finalize(
        &mut self,
        mut acc: Accumulator,
        failure: Option<ObserverFailure>,
        pre: &State,
        cycle: &CycleContext<'_>,
    ) -> Result<(), ConsistencyError> {
        let key = self.key;
        let observer = Arc::clone(&self.observer);
        let observeds = acc.reads.clone().union(acc.writes.clone());
        if observeds.len() > cycle.config.max_nr_of_observed {
            observer.stop();
            return Err(ConsistencyError::TooManyObserved {
                key,
                count: observeds.len(),
                max: cycle.config.max_nr_of_observed,
            });
        }

        if acc.changed {
            cycle
                .guard
                .check_too_many_changes(key, &observer, cycle.traces, cycle.properties, || capture(pre, &acc, cycle))?;
            acc.trigger(key, Priority::Forward);
        } else if acc.backwards {
            acc.trigger(key, Priority::Backward);
        }

        self.swap_observeds(&observeds, cycle)?;

        if failure.is_none() {
            commit_constructions(key, &acc.constructions, cycle);
        }
        // An empty mandatory the run itself read is transient
        let failure = match failure {
            Some(f) if f.is_recoverable() && acc.empty_mandatory => None,
            other => other,
        };
        cycle.state.update(|state| {
            let current = state.instance(key).and_then(|i| i.exception.as_ref());
            if current == failure.as_ref() {
                None
            } else {
                Some(state.update_instance(key, |i| i.exception = failure.clone()))
            }
        });

        self.outcome = RunOutcome {
            changed: acc.changed,
            backwards: acc.backwards,
            skipped: false,
            failure,
            touched: acc.touched,
            contained: acc.contained,
            released: acc.released,
            triggers: acc.triggers,
        };
        Ok(())
    }

    /// Install the new dependency set and maintain the instance count
    fn swap_observeds(&self, observeds: &OrdSet<Slot>, cycle: &CycleContext<'_>) -> Result<(), ConsistencyError> {
        let key = self.key;
        let max = cycle.config.max_nr_of_observers;
        let mut too_many = None;
        let (before, _) = cycle.state.update(|state| {
            too_many = None;
            let previous = state.observeds(key);
            if previous == *observeds {
                return None;
            }
            for slot in observeds.iter().filter(|s| !previous.contains(*s)) {
                let count = state.observers_of(*slot).len() + 1;
                if count > max {
                    too_many = Some(ConsistencyError::TooManyObservers { slot: *slot, count, max });
                    return None;
                }
            }
            Some(state.with_observeds(key, observeds.clone()))
        });
        if let Some(error) = too_many {
            self.observer.stop();
            return Err(error);
        }

        let previous = before.observeds(key);
        if previous.is_empty() && !observeds.is_empty() {
            self.observer.add_instance();
        } else if !previous.is_empty() && observeds.is_empty() {
            self.observer.remove_instance();
        }
        Ok(())
    }
}

/// Commit the constructed map of `key`, keeping the newables' construction
/// records in step
fn commit_constructions(key: ObserverKey, constructions: &OrdMap<Reason, MutableId>, cycle: &CycleContext<'_>) {
    cycle.state.update(|state| {
        let old = state.constructed(key);
        if old == *constructions {
            return None;
        }
        let record = |reason: &Reason| Construction::derived(key.mutable, key.observer, reason.clone());
        let mut next = state.update_instance(key, |i| i.constructed = constructions.clone());
        for (reason, id) in constructions.iter().filter(|(r, id)| old.get(*r) != Some(*id)) {
            let construction = record(reason);
            next = next.update_meta(*id, |m| {
                m.derived_constructions.insert(construction);
            });
        }
        for (reason, id) in old.iter().filter(|(r, id)| constructions.get(*r) != Some(*id)) {
            let construction = record(reason);
            next = next.update_meta(*id, |m| {
                m.derived_constructions.remove(&construction);
            });
        }
        Some(next)
    });
}

/// Values read and written by a run, for its trace
fn capture(pre: &State, acc: &Accumulator, cycle: &CycleContext<'_>) -> (OrdMap<Slot, Value>, OrdMap<Slot, Value>) {
    let live = cycle.state.state();
    let live: &State = &live;
    let value_of = |state: &State, slot: &Slot| {
        cycle
            .properties
            .get(slot.property)
            .map(|p| (*slot, state.get(slot.object, p)))
    };
    let read = acc.reads.iter().filter_map(|slot| value_of(pre, slot)).collect();
    let written = acc.writes.iter().filter_map(|slot| value_of(live, slot)).collect();
    (read, written)
}

/// Split an observer error into a captured failure or a fatal error
fn classify(error: ObserverError) -> Result<ObserverFailure, ConsistencyError> {
    match error {
        ObserverError::EmptyMandatory { object, property } => Ok(ObserverFailure::empty_mandatory(Slot::new(object, property))),
        ObserverError::Consistency(fatal) => Err(fatal),
        ObserverError::Failed(cause) => {
            let mut current: &(dyn StdError + 'static) = &*cause;
            loop {
                if let Some(fatal) = current.downcast_ref::<ConsistencyError>() {
                    return Err(fatal.clone());
                }
                if let Some(RippleError::Consistency(fatal)) = current.downcast_ref::<RippleError>() {
                    return Err(fatal.clone());
                }
                if let Some(ObserverError::EmptyMandatory { object, property }) = current.downcast_ref::<ObserverError>() {
                    return Ok(ObserverFailure::empty_mandatory(Slot::new(*object, *property)));
                }
                match current.source() {
                    Some(next) => current = next,
                    None => return Ok(ObserverFailure::new(current.to_string())),
                }
            }
        }
    }
}

// ============================================================================
// Pool
// ============================================================================

/// Reusable transactions, handed out per run
#[derive(Default)]
pub struct ObserverTransactions {
    idle: Mutex<Vec<ObserverTransaction>>,
}

impl ObserverTransactions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, key: ObserverKey, observer: Arc<Observer>) -> ObserverTransaction {
        match self.idle.lock().pop() {
            Some(mut tx) => {
                tx.key = key;
                tx.observer = observer;
                tx.phase = Phase::Idle;
                tx.outcome = RunOutcome::default();
                tx
            }
            None => ObserverTransaction::new(key, observer),
        }
    }

    pub fn close(&self, mut tx: ObserverTransaction) {
        tx.outcome = RunOutcome::default();
        self.idle.lock().push(tx);
    }

    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;

    use ripple_core::{ObserverId, PropertyId};

    #[derive(Debug)]
    struct Wrapper(Box<dyn StdError + Send + Sync>);

    impl fmt::Display for Wrapper {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "wrapped")
        }
    }

    impl StdError for Wrapper {
        fn source(&self) -> Option<&(dyn StdError + 'static)> {
            Some(&*self.0)
        }
    }

    #[test]
    fn test_classify_unwraps_to_root_cause() {
        let root: Box<dyn StdError + Send + Sync> = "disk on fire".into();
        let failure = classify(ObserverError::failed(Wrapper(root))).unwrap();
        assert_eq!(failure.message, "disk on fire");
        assert!(!failure.is_recoverable());
    }

    #[test]
    fn test_classify_finds_nested_consistency_error() {
        let fatal = ConsistencyError::EmptyMandatory { object: MutableId::new(1), property: PropertyId::new(2) };
        let wrapped = ObserverError::failed(Wrapper(Box::new(fatal.clone())));
        assert_eq!(classify(wrapped).unwrap_err(), fatal);
    }

    #[test]
    fn test_classify_empty_mandatory_is_recoverable() {
        let error = ObserverError::EmptyMandatory { object: MutableId::new(1), property: PropertyId::new(0) };
        assert!(classify(error).unwrap().is_recoverable());
    }

    #[test]
    fn test_pool_reuses_transactions() {
        let pool = ObserverTransactions::new();
        let observer = Arc::new(Observer::new(
            ObserverId::new(0),
            "rule",
            Priority::Forward,
            ObserverBody::Match(PropertyId::new(0)),
        ));
        let key = ObserverKey::new(MutableId::new(1), ObserverId::new(0));

        let tx = pool.open(key, Arc::clone(&observer));
        assert_eq!(tx.phase(), Phase::Idle);
        pool.close(tx);
        assert_eq!(pool.idle(), 1);

        let other = ObserverKey::new(MutableId::new(2), ObserverId::new(0));
        let tx = pool.open(other, observer);
        assert_eq!(tx.key(), other);
        assert!(!tx.is_changed());
        assert_eq!(pool.idle(), 0);
    }
}
