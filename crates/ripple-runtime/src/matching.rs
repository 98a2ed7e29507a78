//! Identity reconciliation of newables
//!
//! Newables constructed independently for the same logical thing are unified:
//! the loser becomes obsolete, points at the survivor through `replaced_by`
//! and hands over its construction records. Which newables are the same and
//! which one survives is decided by an [`IdentityPolicy`].

use im::{OrdMap, OrdSet};
use tracing::info;

use ripple_core::{
    ClassId, Construction, Direction, MutableId, ObserverError, ObserverKey, Property, PropertyId, Reason, Slot, State,
    Value,
};
use ripple_state::mark_changed;

use crate::context::{is_newable, ObserverContext};
use crate::observer::Priority;

// ============================================================================
// Policy
// ============================================================================

/// Domain supplied identity decisions
pub trait IdentityPolicy: Send + Sync {
    /// Total order key; the smaller key survives a unification
    fn sort_key(&self, state: &State, newable: MutableId) -> Value;

    /// Whether two candidates denote the same entity
    fn must_be_the_same(&self, a: &MatchInfo, b: &MatchInfo) -> bool;
}

/// Same class and at least one shared construction reason
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultIdentityPolicy;

impl IdentityPolicy for DefaultIdentityPolicy {
    fn sort_key(&self, state: &State, newable: MutableId) -> Value {
        state
            .meta(newable)
            .and_then(|m| m.newable.as_ref())
            .map(|info| info.sort_key.clone())
            .unwrap_or_default()
    }

    fn must_be_the_same(&self, a: &MatchInfo, b: &MatchInfo) -> bool {
        a.class == b.class && a.reasons().any(|r| b.reasons().any(|o| o == r))
    }
}

// ============================================================================
// Match info
// ============================================================================

/// Transient view of a newable and the constructions that derived it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MatchInfo {
    pub newable: MutableId,
    pub class: ClassId,
    pub sort_key: Value,
    /// Identity can no longer be merged away
    pub carved_in_stone: bool,
    pub directions: OrdSet<Direction>,
    pub constructions: OrdSet<Construction>,
}

impl MatchInfo {
    /// Build the view of `newable`, including the constructions of the
    /// running instance that are not committed yet
    pub fn of(
        state: &State,
        policy: &dyn IdentityPolicy,
        newable: MutableId,
        pending: &OrdMap<Reason, MutableId>,
        key: ObserverKey,
    ) -> Self {
        let meta = state.meta(newable);
        let mut constructions = meta.map(|m| m.derived_constructions.clone()).unwrap_or_default();
        for (reason, _) in pending.iter().filter(|(_, id)| **id == newable) {
            constructions.insert(Construction::derived(key.mutable, key.observer, reason.clone()));
        }
        let mut info = MatchInfo {
            newable,
            class: meta.map(|m| m.class).unwrap_or_default(),
            sort_key: policy.sort_key(state, newable),
            carved_in_stone: false,
            directions: OrdSet::new(),
            constructions,
        };
        info.refresh();
        info
    }

    fn refresh(&mut self) {
        self.directions = self.constructions.iter().map(|c| c.reason.direction).collect();
        self.carved_in_stone =
            !self.constructions.iter().any(Construction::is_derived) || self.constructions.iter().any(|c| !c.is_derived());
    }

    pub fn reasons(&self) -> impl Iterator<Item = &Reason> {
        self.constructions.iter().map(|c| &c.reason)
    }

    /// Absorb the constructions of a unified candidate
    pub fn merge_in(&mut self, other: &MatchInfo) {
        self.constructions = self.constructions.clone().union(other.constructions.clone());
        self.refresh();
    }

    /// Survivor order: sort key, then identity
    pub fn rank(&self) -> (&Value, MutableId) {
        (&self.sort_key, self.newable)
    }
}

/// Which side of a single-valued write survives
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Survivor {
    Pre,
    Post,
}

/// Pick the survivor of two candidates; `None` when both are carved in stone
pub fn choose_survivor(pre: &MatchInfo, post: &MatchInfo) -> Option<Survivor> {
    match (pre.carved_in_stone, post.carved_in_stone) {
        (false, false) if pre.rank() < post.rank() => Some(Survivor::Pre),
        (false, false) => Some(Survivor::Post),
        (true, false) => Some(Survivor::Pre),
        (false, true) => Some(Survivor::Post),
        (true, true) => None,
    }
}

// ============================================================================
// Unification
// ============================================================================

/// Snapshot after unifying `from` into `to`
#[derive(Clone, Debug)]
pub struct Unified {
    pub state: State,
    /// Constructed slots of the instances whose construction now points at `to`
    pub touched: Vec<Slot>,
}

/// Unify `from` into `to`; `None` when that already happened
pub fn unify(state: &State, to: MutableId, from: MutableId) -> Option<Unified> {
    let from_meta = state.meta(from)?;
    if from_meta.obsolete && from_meta.replaced_by == Some(to) && from_meta.derived_constructions.is_empty() {
        return None;
    }
    let handed_over = from_meta.derived_constructions.clone();
    let mut next = state
        .update_meta(to, |m| m.derived_constructions = m.derived_constructions.clone().union(handed_over))
        .update_meta(from, |m| {
            m.obsolete = true;
            m.replaced_by = Some(to);
            m.derived_constructions = OrdSet::new();
        });

    let pointing: Vec<ObserverKey> = state
        .instances()
        .filter(|(_, instance)| instance.constructed.values().any(|id| *id == from))
        .map(|(key, _)| key)
        .collect();
    let mut touched = Vec::with_capacity(pointing.len());
    for key in pointing {
        next = next.update_instance(key, |instance| {
            instance.constructed = instance
                .constructed
                .iter()
                .map(|(reason, id)| (reason.clone(), if *id == from { to } else { *id }))
                .collect();
        });
        touched.push(key.constructed_slot());
    }
    Some(Unified { state: next, touched })
}

/// Make `from` the same entity as `to` in the shared snapshot and in the
/// running instance's pending constructions
pub fn make_the_same(ctx: &mut ObserverContext<'_>, to: &MatchInfo, from: &MatchInfo) {
    let txid = ctx.txid();
    let mut touched = Vec::new();
    ctx.cycle.state.update(|state| {
        unify(state, to.newable, from.newable).map(|unified| {
            touched = unified.touched;
            let next = mark_changed(&unified.state, txid, to.newable);
            mark_changed(&next, txid, from.newable)
        })
    });
    ctx.acc.touched.extend(touched);
    ctx.acc.constructions = ctx
        .acc
        .constructions
        .iter()
        .map(|(reason, id)| (reason.clone(), if *id == from.newable { to.newable } else { *id }))
        .collect();
    if ctx.cycle.config.trace_matching {
        info!(
            target: "ripple::matching",
            mutable = %ctx.mutable(),
            observer = %ctx.observer(),
            to = %to.newable,
            from = %from.newable,
            "MATCH"
        );
    }
}

/// Drop obsolete newables from `value`, and speculative ones once a
/// constructed one is present
pub fn remove_obsolete(state: &State, value: Value, pending: &OrdSet<MutableId>) -> Value {
    let constructed = |id: MutableId| {
        pending.contains(&id) || state.meta(id).map_or(false, |m| !m.derived_constructions.is_empty())
    };
    let newables: Vec<MutableId> = value
        .members()
        .filter(|v| is_newable(state, v))
        .filter_map(Value::as_mutable)
        .collect();
    let contains_constructed = newables.iter().any(|id| constructed(*id));
    newables
        .into_iter()
        .filter(|id| state.is_obsolete(*id) || (contains_constructed && !constructed(*id)))
        .fold(value, |acc, id| acc.without(&Value::Mutable(id)))
}

fn pending_newables(ctx: &ObserverContext<'_>) -> OrdSet<MutableId> {
    ctx.acc.constructions.values().copied().collect()
}

// ============================================================================
// Write-path matching
// ============================================================================

/// Reconcile a write where `before` or `after` is a newable
pub fn single_match(ctx: &mut ObserverContext<'_>, property: &Property, start: &Value, before: Value, after: Value) -> Value {
    if !before.is_empty() && !after.is_empty() && before != after {
        let state = ctx.live();
        if property.is_containment() {
            if let (Some(pre), Some(post)) = (before.as_mutable(), after.as_mutable()) {
                let same_class = matches!(
                    (state.meta(pre), state.meta(post)),
                    (Some(a), Some(b)) if a.is_newable() && b.is_newable() && a.class == b.class
                );
                if same_class {
                    let pending = ctx.acc.constructions.clone();
                    let pre_info = MatchInfo::of(&state, ctx.policy(), pre, &pending, ctx.key());
                    let post_info = MatchInfo::of(&state, ctx.policy(), post, &pending, ctx.key());
                    let disjoint = !pre_info.directions.is_empty()
                        && !post_info.directions.is_empty()
                        && !pre_info.directions.iter().any(|d| post_info.directions.contains(d));
                    if disjoint {
                        match choose_survivor(&pre_info, &post_info) {
                            Some(Survivor::Pre) => {
                                make_the_same(ctx, &pre_info, &post_info);
                                return before;
                            }
                            Some(Survivor::Post) => {
                                make_the_same(ctx, &post_info, &pre_info);
                                return after;
                            }
                            None => {}
                        }
                    }
                }
            }
        }
        let pending = pending_newables(ctx);
        let rest = remove_obsolete(&state, Value::set([before.clone(), after.clone()]), &pending);
        match rest.len() {
            0 => return Value::Empty,
            1 => return rest.first().cloned().unwrap_or_default(),
            _ => {}
        }
    }
    ctx.ripple(property, start, &before, after)
}

/// Reconcile a write of a collection holding newables
pub fn many_match(
    ctx: &mut ObserverContext<'_>,
    object: MutableId,
    property: &Property,
    start: &Value,
    before: &Value,
    after: Value,
) -> Value {
    if property.is_containment() {
        let observer = ctx.cycle.observers.match_observer(property.id);
        let key = ObserverKey::new(object, observer.id());
        if ctx.live().observeds(key).is_empty() {
            ctx.trigger(key, Priority::Urgent);
        }
    }
    let result = ctx.ripple(property, start, before, after);
    if result.is_empty() {
        return result;
    }
    let pending = pending_newables(ctx);
    remove_obsolete(&ctx.live(), result, &pending)
}

// ============================================================================
// Match observer
// ============================================================================

/// Body of the match observer of a containment collection: unify every
/// member that must be the same as a better ranked one
pub fn match_collection(ctx: &mut ObserverContext<'_>, property: PropertyId) -> Result<(), ObserverError> {
    let object = ctx.mutable();
    let collection = ctx.property(property)?;
    let pre = ctx.get(object, property);
    let singleton = match collection.singleton {
        Some(id) => Some(ctx.property(id)?),
        None => None,
    };
    let pre_single = singleton.map(|s| ctx.get(object, s.id)).unwrap_or_default();

    let state = ctx.live();
    let mut post = pre.clone();
    if is_newable(&state, &pre_single) {
        post = post.with(pre_single.clone());
    }
    post = remove_obsolete(&state, post, &OrdSet::new());

    if post.len() > 1 {
        let mut candidates: Vec<MatchInfo> = post
            .members()
            .filter(|v| is_newable(&state, v))
            .filter_map(Value::as_mutable)
            .map(|id| MatchInfo::of(&state, ctx.policy(), id, &OrdMap::new(), ctx.key()))
            .collect();
        if !post.is_list() {
            candidates.sort_by(|a, b| a.rank().cmp(&b.rank()));
        }
        while let Some((to, from)) = find_pair(ctx.policy(), &candidates) {
            let loser = candidates.remove(from);
            let to = if from < to { to - 1 } else { to };
            make_the_same(ctx, &candidates[to], &loser);
            candidates[to].merge_in(&loser);
            post = post.without(&Value::Mutable(loser.newable));
        }
    }

    let mut post_single = pre_single.clone();
    if let Some(singleton) = singleton {
        if post_single.is_empty() || !post.contains(&post_single) {
            post_single = post.first().cloned().unwrap_or_default();
        }
        ctx.commit(object, singleton, post_single.clone());
    }
    let post = if post_single.is_empty() { post } else { post.without(&post_single) };
    ctx.commit(object, collection, post);
    Ok(())
}

/// First `(to, from)` pair where a non-carved `from` must become an earlier
/// ranked or carved `to`
fn find_pair(policy: &dyn IdentityPolicy, candidates: &[MatchInfo]) -> Option<(usize, usize)> {
    candidates.iter().enumerate().filter(|(_, c)| !c.carved_in_stone).find_map(|(from, f)| {
        candidates
            .iter()
            .enumerate()
            .find(|(to, t)| *to != from && (*to < from || t.carved_in_stone) && policy.must_be_the_same(t, f))
            .map(|(to, _)| (to, from))
    })
}
