//! Runaway-loop detection
//!
//! Counts changes per observer instance and across the universe. Past the
//! soft limits the guard switches to debugging mode and records a trace per
//! changing run; past twice the limits, with a long enough causal history
//! behind the last trace, the observer is stopped and a fatal error carrying
//! the rendered trace is raised.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use im::OrdMap;
use tracing::warn;

use ripple_core::{ConsistencyError, EngineConfig, ObserverKey, Properties, Slot, Value};

use crate::observer::Observer;
use crate::trace::TraceArena;

/// Universe-wide counters of the running outer cycle
#[derive(Debug, Default)]
pub struct UniverseStats {
    run_count: AtomicU64,
    total_changes: AtomicUsize,
    debugging: AtomicBool,
}

impl UniverseStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new outer cycle and return its run count
    pub fn start_cycle(&self) -> u64 {
        self.total_changes.store(0, Ordering::SeqCst);
        self.debugging.store(false, Ordering::SeqCst);
        self.run_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn run_count(&self) -> u64 {
        self.run_count.load(Ordering::SeqCst)
    }

    pub fn bump_total_changes(&self) -> usize {
        self.total_changes.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn total_changes(&self) -> usize {
        self.total_changes.load(Ordering::SeqCst)
    }

    pub fn is_debugging(&self) -> bool {
        self.debugging.load(Ordering::SeqCst)
    }

    /// Switch debugging on; returns whether it was off before
    pub fn start_debugging(&self) -> bool {
        !self.debugging.swap(true, Ordering::SeqCst)
    }
}

/// Per-cycle change limits
pub struct RunawayGuard {
    max_nr_of_changes: usize,
    max_total_nr_of_changes: usize,
    max_trace_render: usize,
    stats: UniverseStats,
}

impl RunawayGuard {
    pub fn new(config: &EngineConfig) -> Self {
        RunawayGuard {
            max_nr_of_changes: config.max_nr_of_changes,
            max_total_nr_of_changes: config.max_total_nr_of_changes,
            max_trace_render: config.max_trace_render,
            stats: UniverseStats::new(),
        }
    }

    pub fn stats(&self) -> &UniverseStats {
        &self.stats
    }

    /// Account for one changing run of `key`.
    ///
    /// `capture` yields the read and written values of the run and is only
    /// called in debugging mode.
    pub fn check_too_many_changes<F>(
        &self,
        key: ObserverKey,
        observer: &Observer,
        traces: &TraceArena,
        properties: &Properties,
        capture: F,
    ) -> Result<(), ConsistencyError>
    where
        F: FnOnce() -> (OrdMap<Slot, Value>, OrdMap<Slot, Value>),
    {
        let max = self.max_nr_of_changes;
        let max_total = self.max_total_nr_of_changes;
        let total = self.stats.bump_total_changes();
        let per_instance = observer.count_changes_per_instance();

        if (per_instance > max || total > max_total) && self.stats.start_debugging() {
            warn!(
                mutable = %key.mutable,
                observer = %observer,
                per_instance,
                total,
                "change limit exceeded, recording traces"
            );
        }
        if !self.stats.is_debugging() {
            return Ok(());
        }

        let (read, written) = capture();
        traces.record(key, observer.name().clone(), observer.changes_per_instance(), read, written);

        let changes = if per_instance > max * 2 {
            per_instance
        } else if total > max_total + max {
            total
        } else {
            return Ok(());
        };
        let needed = if changes > max_total { 1 } else { max };
        match traces.last(key) {
            Some(last) if last.done.len() >= needed => {
                observer.stop();
                Err(ConsistencyError::TooManyChanges {
                    mutable: key.mutable,
                    observer: observer.name().clone(),
                    changes,
                    trace: traces.render(&last, self.max_trace_render, properties),
                })
            }
            _ => Ok(()),
        }
    }
}
