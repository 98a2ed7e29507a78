//! Removing a concurrently edited child is reverted and settled backward

use ripple_core::{ClassId, MutableId, ObserverKey, Property, Value};
use ripple_runtime::Priority;
use ripple_test::{init_tracing, Scenario, ROOT};

const NODE: ClassId = ClassId(1);

#[test]
fn test_removal_of_edited_child_is_reverted() {
    init_tracing();
    let mut builder = Scenario::builder();
    let label = builder.property(Property::observed("label", Value::Empty));
    let enabled = builder.property(Property::setable("enabled", Value::Bool(false)));
    let mut scenario = builder.build();
    let children = scenario.children();

    let prune = scenario.observer("prune", Priority::Forward, move |ctx| {
        let root = ctx.mutable();
        let kids: Vec<Value> = ctx.get(root, children).members().cloned().collect();
        if ctx.get(root, enabled).as_bool() != Some(true) {
            return Ok(());
        }
        for kid in &kids {
            ctx.remove(root, children, kid)?;
        }
        Ok(())
    });
    scenario.class(ROOT, vec![prune], vec![]).unwrap();

    let (node, report) = scenario.spawn(NODE, |action, node| action.set(node, label, Value::text("a"))).unwrap();
    assert!(report.is_ok());

    let key = ObserverKey::new(MutableId::UNIVERSE, prune);
    scenario.universe_mut().trigger(MutableId::UNIVERSE, prune).unwrap();
    let report = scenario
        .put(|action| {
            action.set(MutableId::UNIVERSE, enabled, Value::Bool(true))?;
            action.set(node, label, Value::text("b"))
        })
        .unwrap();

    assert!(report.is_ok(), "{:?}", report.errors);
    let runs: Vec<_> = report.runs_of(key).collect();
    assert!(!runs.is_empty());
    assert!(runs.iter().all(|r| r.backwards && !r.changed));
    assert_eq!(runs.last().map(|r| r.priority), Some(Priority::Backward));
    assert_eq!(scenario.value(MutableId::UNIVERSE, children), Value::set([node.into()]));
    assert!(scenario.universe().state().is_attached(node));
    assert_eq!(scenario.value(node, label), Value::text("b"));
}

#[test]
fn test_removal_of_untouched_child_commits() {
    let mut builder = Scenario::builder();
    let label = builder.property(Property::observed("label", Value::Empty));
    let enabled = builder.property(Property::setable("enabled", Value::Bool(false)));
    let mut scenario = builder.build();
    let children = scenario.children();

    let prune = scenario.observer("prune", Priority::Forward, move |ctx| {
        let root = ctx.mutable();
        let kids: Vec<Value> = ctx.get(root, children).members().cloned().collect();
        if ctx.get(root, enabled).as_bool() == Some(true) {
            for kid in &kids {
                ctx.remove(root, children, kid)?;
            }
        }
        Ok(())
    });
    scenario.class(ROOT, vec![prune], vec![]).unwrap();
    let (node, _) = scenario.spawn(NODE, |action, node| action.set(node, label, Value::text("a"))).unwrap();

    scenario.universe_mut().trigger(MutableId::UNIVERSE, prune).unwrap();
    let report = scenario.put(|action| action.set(MutableId::UNIVERSE, enabled, Value::Bool(true))).unwrap();

    assert!(report.is_ok(), "{:?}", report.errors);
    assert_eq!(scenario.value(MutableId::UNIVERSE, children), Value::set([]));
    assert!(!scenario.universe().state().is_attached(node));
}

#[test]
fn test_detached_subtree_drops_dependencies() {
    let mut builder = Scenario::builder();
    let label = builder.property(Property::observed("label", Value::Empty));
    let parts = builder.property(Property::observed("parts", Value::set([])).containment());
    let mut scenario = builder.build();
    let children = scenario.children();

    let watch = scenario.observer("watch", Priority::Forward, move |ctx| {
        let me = ctx.mutable();
        ctx.get(me, label);
        ctx.get(me, parts);
        Ok(())
    });
    scenario.class(NODE, vec![watch], vec![]).unwrap();

    let mut leaf = MutableId::UNIVERSE;
    let (node, report) = scenario
        .spawn(NODE, |action, node| {
            leaf = action.create(NODE);
            action.add(node, parts, leaf.into())
        })
        .unwrap();
    assert!(report.is_ok(), "{:?}", report.errors);
    let observer = scenario.universe().observer(watch).unwrap();
    assert_eq!(observer.instances(), 2);

    let report = scenario.put(|action| action.remove(MutableId::UNIVERSE, children, &node.into())).unwrap();
    assert!(report.is_ok(), "{:?}", report.errors);
    let state = scenario.universe().state();
    assert!(!state.is_attached(leaf));
    assert!(state.observeds(ObserverKey::new(node, watch)).is_empty());
    assert!(state.observeds(ObserverKey::new(leaf, watch)).is_empty());
    assert_eq!(observer.instances(), 0);

    // Reattaching runs the whole subtree again
    let report = scenario.put(|action| action.add(MutableId::UNIVERSE, children, node.into())).unwrap();
    assert_eq!(report.runs_of(ObserverKey::new(leaf, watch)).count(), 1);
    assert_eq!(observer.instances(), 2);
}
