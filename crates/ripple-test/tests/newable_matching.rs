//! Independent derivations of the same entity are unified

use ripple_core::{ClassId, Construction, Direction, MutableId, NewableSpec, ObserverKey, Property, Reason, Value};
use ripple_runtime::{ObserverContext, Priority};
use ripple_test::{init_tracing, Scenario, ROOT};

const PART: ClassId = ClassId(3);

fn reason() -> Reason {
    Reason::new(Direction(1), Value::text("wheel"))
}

#[test]
fn test_same_reason_unifies_to_lower_sort_key() {
    init_tracing();
    let mut scenario = Scenario::builder().build();
    let children = scenario.children();

    let derive = |sort_key: i64| {
        move |ctx: &mut ObserverContext<'_>| {
            let root = ctx.mutable();
            let part = ctx.construct(reason(), NewableSpec::new(PART, Value::Int(sort_key)));
            ctx.add(root, children, part.into())
        }
    };
    let a = scenario.observer("a", Priority::Forward, derive(1));
    let b = scenario.observer("b", Priority::Forward, derive(2));
    scenario.class(ROOT, vec![a, b], vec![]).unwrap();

    let report = scenario.start();
    assert!(report.is_ok(), "{:?}", report.errors);
    assert!(report.runs.iter().any(|r| r.observer.starts_with("MATCH")));

    let state = scenario.universe().state();
    let members = scenario.value(MutableId::UNIVERSE, children);
    assert_eq!(members.len(), 1);
    let survivor = members.first().and_then(Value::as_mutable).unwrap();

    let newables: Vec<MutableId> = state.mutables().filter(|(_, m)| m.is_newable()).map(|(id, _)| id).collect();
    assert_eq!(newables.len(), 2);
    for id in newables.iter().filter(|id| **id != survivor) {
        assert!(state.is_obsolete(*id));
        assert_eq!(state.resolve(*id), survivor);
    }

    let meta = state.meta(survivor).unwrap();
    assert_eq!(meta.newable.as_ref().map(|n| n.sort_key.clone()), Some(Value::Int(1)));
    let expected = [
        Construction::derived(MutableId::UNIVERSE, a, reason()),
        Construction::derived(MutableId::UNIVERSE, b, reason()),
    ];
    assert_eq!(meta.derived_constructions.len(), 2);
    assert!(expected.iter().all(|c| meta.derived_constructions.contains(c)));

    // Both instances now resolve their construction to the survivor
    let keys = [ObserverKey::new(MutableId::UNIVERSE, a), ObserverKey::new(MutableId::UNIVERSE, b)];
    let idle = scenario.idle(&keys).unwrap();
    assert!(idle.runs.iter().all(|r| !r.changed));
    assert_eq!(scenario.value(MutableId::UNIVERSE, children), members);
}

#[test]
fn test_source_construction_is_kept() {
    let mut scenario = Scenario::builder().build();
    let children = scenario.children();

    let derive = scenario.observer("derive", Priority::Forward, move |ctx| {
        let root = ctx.mutable();
        let part = ctx.construct(reason(), NewableSpec::new(PART, Value::Int(1)));
        ctx.add(root, children, part.into())
    });
    scenario.class(ROOT, vec![derive], vec![]).unwrap();

    // An externally created newable for the same reason is carved in stone
    let mut external = MutableId::UNIVERSE;
    let report = scenario
        .put(|action| {
            external = action.construct(MutableId::UNIVERSE, reason(), NewableSpec::new(PART, Value::Int(9)));
            action.add(MutableId::UNIVERSE, children, external.into())
        })
        .unwrap();

    assert!(report.is_ok(), "{:?}", report.errors);
    let state = scenario.universe().state();
    assert_eq!(scenario.value(MutableId::UNIVERSE, children), Value::set([external.into()]));
    assert!(!state.is_obsolete(external));
    assert!(state
        .mutables()
        .filter(|(id, m)| m.is_newable() && *id != external)
        .all(|(id, _)| state.resolve(id) == external));
}

#[test]
fn test_single_valued_write_unifies_disjoint_derivations() {
    let mut builder = Scenario::builder();
    let part = builder.property(Property::observed("part", Value::Empty).containment());
    let mut scenario = builder.build();

    let derive = |direction: u32, sort_key: i64| {
        move |ctx: &mut ObserverContext<'_>| {
            let root = ctx.mutable();
            let reason = Reason::new(Direction(direction), Value::text("wheel"));
            let newable = ctx.construct(reason, NewableSpec::new(PART, Value::Int(sort_key)));
            ctx.set(root, part, newable.into())
        }
    };
    let front = scenario.observer("front", Priority::Forward, derive(1, 1));
    let back = scenario.observer("back", Priority::Forward, derive(2, 2));
    scenario.class(ROOT, vec![front, back], vec![]).unwrap();

    let report = scenario.start();
    assert!(report.is_ok(), "{:?}", report.errors);

    let state = scenario.universe().state();
    let survivor = scenario.value(MutableId::UNIVERSE, part).as_mutable().unwrap();
    let meta = state.meta(survivor).unwrap();
    assert_eq!(meta.newable.as_ref().map(|n| n.sort_key.clone()), Some(Value::Int(1)));
    assert_eq!(meta.derived_constructions.len(), 2);
    assert!(state
        .mutables()
        .filter(|(id, m)| m.is_newable() && *id != survivor)
        .all(|(id, m)| m.obsolete && state.resolve(id) == survivor));
}

#[test]
fn test_speculative_newable_gives_way_to_constructed() {
    let mut builder = Scenario::builder();
    let part = builder.property(Property::observed("part", Value::Empty).containment());
    let mut scenario = builder.build();

    let derive = scenario.observer("derive", Priority::Forward, move |ctx| {
        let root = ctx.mutable();
        let guess = ctx.direct_construct(NewableSpec::new(PART, Value::Int(0)));
        ctx.set(root, part, guess.into())?;
        let built = ctx.construct(reason(), NewableSpec::new(PART, Value::Int(1)));
        ctx.set(root, part, built.into())
    });
    scenario.class(ROOT, vec![derive], vec![]).unwrap();

    let report = scenario.start();
    assert!(report.is_ok(), "{:?}", report.errors);

    let key = ObserverKey::new(MutableId::UNIVERSE, derive);
    let state = scenario.universe().state();
    let built = scenario.value(MutableId::UNIVERSE, part).as_mutable().unwrap();
    assert_eq!(state.constructed(key).get(&reason()), Some(&built));
    assert_eq!(
        state.meta(built).map(|m| m.derived_constructions.len()),
        Some(1)
    );

    // Guesses carry no construction records and are left detached
    let guesses: Vec<MutableId> = state
        .mutables()
        .filter(|(id, m)| m.is_newable() && *id != built)
        .map(|(id, _)| id)
        .collect();
    assert!(!guesses.is_empty());
    for guess in guesses {
        assert!(state.meta(guess).map_or(false, |m| m.derived_constructions.is_empty()));
        assert!(!state.is_attached(guess));
    }
    assert_eq!(report.runs_of(key).last().map(|r| r.changed), Some(false));
}

#[test]
fn test_match_observer_fills_singleton() {
    let mut builder = Scenario::builder();
    let main = builder.property(Property::observed("main", Value::Empty).containment());
    let parts = builder.property(Property::observed("parts", Value::set([])).containment().with_singleton(main));
    let mut scenario = builder.build();

    let derive = |sort_key: i64| {
        move |ctx: &mut ObserverContext<'_>| {
            let root = ctx.mutable();
            let part = ctx.construct(reason(), NewableSpec::new(PART, Value::Int(sort_key)));
            if ctx.get(root, main) == Value::Mutable(part) {
                return Ok(());
            }
            ctx.add(root, parts, part.into())
        }
    };
    let a = scenario.observer("a", Priority::Forward, derive(1));
    let b = scenario.observer("b", Priority::Forward, derive(2));
    scenario.class(ROOT, vec![a, b], vec![]).unwrap();

    let report = scenario.start();
    assert!(report.is_ok(), "{:?}", report.errors);

    let state = scenario.universe().state();
    let survivor = scenario.value(MutableId::UNIVERSE, main).as_mutable().unwrap();
    assert_eq!(scenario.value(MutableId::UNIVERSE, parts), Value::set([]));
    assert!(state.is_attached(survivor));
    assert_eq!(
        state.meta(survivor).and_then(|m| m.newable.as_ref()).map(|n| n.sort_key.clone()),
        Some(Value::Int(1))
    );
    assert!(state
        .mutables()
        .filter(|(id, m)| m.is_newable() && *id != survivor)
        .all(|(id, _)| state.resolve(id) == survivor));
}
