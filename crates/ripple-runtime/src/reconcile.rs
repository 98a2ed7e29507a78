//! Write reconciliation ("ripple-out")
//!
//! Given the value of a slot at the start of the outer cycle (`start`), the
//! value just before the writing run (`pre`) and the value the run computed
//! (`post`), decide what gets committed. The bias is toward keeping edits
//! that landed concurrently unless the run's own inputs moved.

use ripple_core::{MutableId, Property, Value};

/// What the reconciler needs to know about the running observer
pub trait ChangeOracle {
    /// Whether the subtree of a contained `mutable` changed since the cycle start
    fn is_changed(&self, mutable: MutableId) -> bool;

    /// Whether any slot the run read (and did not write) differs from the cycle start
    fn input_is_changed(&self) -> bool;
}

/// The value to commit and whether the run must be revisited backward
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reconciled {
    pub value: Value,
    pub backwards: bool,
}

impl Reconciled {
    fn forward(value: Value) -> Self {
        Reconciled { value, backwards: false }
    }

    fn backward(value: Value) -> Self {
        Reconciled { value, backwards: true }
    }
}

/// Three-way reconcile of a write to `property`
pub fn ripple_out(property: &Property, start: &Value, pre: &Value, post: Value, oracle: &dyn ChangeOracle) -> Reconciled {
    if *pre == post {
        return Reconciled::forward(post);
    }
    let mut post = post;
    let mut backwards = false;

    if property.is_containment() {
        if pre.is_collection() && post.is_collection() {
            let kept: Vec<Value> = pre
                .members()
                .filter(|v| matches!(v, Value::Mutable(m) if !post.contains(v) && oracle.is_changed(*m)))
                .cloned()
                .collect();
            let result = post.add_all(kept);
            if result != post {
                backwards = true;
                post = result;
            }
        } else if let Value::Mutable(m) = pre {
            if oracle.is_changed(*m) {
                return Reconciled::backward(pre.clone());
            }
        }
    }

    if pre != start {
        if property.is_mergeable() && start.is_collection() {
            if let Some(merged) = Value::merge3(start, pre, &post) {
                if merged != post {
                    backwards = true;
                    post = merged;
                }
            }
        } else if *start == post && !oracle.input_is_changed() {
            return Reconciled::backward(pre.clone());
        }
    }
    Reconciled { value: post, backwards }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[derive(Default)]
    struct Oracle {
        changed: BTreeSet<MutableId>,
        inputs: bool,
    }

    impl ChangeOracle for Oracle {
        fn is_changed(&self, mutable: MutableId) -> bool {
            self.changed.contains(&mutable)
        }

        fn input_is_changed(&self) -> bool {
            self.inputs
        }
    }

    fn m(id: u64) -> Value {
        Value::Mutable(MutableId::new(id))
    }

    #[test]
    fn test_equal_pre_and_post_is_unchanged() {
        let p = Property::observed("p", Value::Int(0));
        let r = ripple_out(&p, &Value::Int(0), &Value::Int(3), Value::Int(3), &Oracle::default());
        assert_eq!(r, Reconciled::forward(Value::Int(3)));
    }

    #[test]
    fn test_plain_write_commits_post() {
        let p = Property::observed("p", Value::Int(0));
        let r = ripple_out(&p, &Value::Int(0), &Value::Int(0), Value::Int(5), &Oracle::default());
        assert_eq!(r, Reconciled::forward(Value::Int(5)));
    }

    #[test]
    fn test_changed_child_is_readded() {
        let p = Property::observed("children", Value::set([])).containment();
        let oracle = Oracle { changed: [MutableId::new(2)].into_iter().collect(), inputs: false };
        let start = Value::set([m(1), m(2)]);

        let r = ripple_out(&p, &start, &start, Value::set([m(1)]), &oracle);
        assert_eq!(r, Reconciled::backward(start.clone()));

        let r = ripple_out(&p, &start, &start, Value::set([m(2)]), &oracle);
        assert_eq!(r, Reconciled::forward(Value::set([m(2)])));
    }

    #[test]
    fn test_changed_single_child_is_kept() {
        let p = Property::observed("child", Value::Empty).containment();
        let oracle = Oracle { changed: [MutableId::new(1)].into_iter().collect(), inputs: false };
        let r = ripple_out(&p, &m(1), &m(1), Value::Empty, &oracle);
        assert_eq!(r, Reconciled::backward(m(1)));
    }

    #[test]
    fn test_concurrent_collection_edits_merge() {
        let p = Property::observed("tags", Value::set([]));
        let start = Value::set([Value::Int(1)]);
        let pre = Value::set([Value::Int(1), Value::Int(2)]);
        let post = Value::set([Value::Int(1), Value::Int(3)]);

        let r = ripple_out(&p, &start, &pre, post, &Oracle::default());
        assert_eq!(r, Reconciled::backward(Value::set([Value::Int(1), Value::Int(2), Value::Int(3)])));
    }

    #[test]
    fn test_do_not_merge_overwrites() {
        let p = Property::observed("tags", Value::set([])).do_not_merge();
        let start = Value::set([Value::Int(1)]);
        let pre = Value::set([Value::Int(2)]);
        let post = Value::set([Value::Int(3)]);

        let r = ripple_out(&p, &start, &pre, post.clone(), &Oracle::default());
        assert_eq!(r, Reconciled::forward(post));
    }

    #[test]
    fn test_redundant_recompute_defers_to_concurrent_edit() {
        let p = Property::observed("p", Value::Int(0));
        let stale = ripple_out(&p, &Value::Int(0), &Value::Int(7), Value::Int(0), &Oracle::default());
        assert_eq!(stale, Reconciled::backward(Value::Int(7)));

        let moved = Oracle { inputs: true, ..Default::default() };
        let r = ripple_out(&p, &Value::Int(0), &Value::Int(7), Value::Int(0), &moved);
        assert_eq!(r, Reconciled::forward(Value::Int(0)));
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        fn scalar() -> impl Strategy<Value = Value> {
            prop_oneof![
                Just(Value::Empty),
                any::<i64>().prop_map(Value::Int),
                "[a-z]{0,4}".prop_map(|s| Value::text(&s)),
            ]
        }

        proptest! {
            #[test]
            fn prop_without_concurrent_edit_commits_post(start in scalar(), post in scalar(), inputs in any::<bool>()) {
                let p = Property::observed("p", Value::Empty);
                let oracle = Oracle { inputs, ..Default::default() };
                let r = ripple_out(&p, &start, &start, post.clone(), &oracle);
                prop_assert_eq!(r, Reconciled::forward(post));
            }

            #[test]
            fn prop_changed_children_are_never_dropped(
                start in proptest::collection::btree_set(1u64..12, 0..6),
                post in proptest::collection::btree_set(1u64..12, 0..6),
                changed in proptest::collection::btree_set(1u64..12, 0..6),
            ) {
                let p = Property::observed("children", Value::set([])).containment();
                let oracle = Oracle { changed: changed.iter().copied().map(MutableId::new).collect(), inputs: false };
                let start = Value::set(start.iter().copied().map(m));
                let post = Value::set(post.iter().copied().map(m));

                let r = ripple_out(&p, &start, &start, post.clone(), &oracle);
                let dropped_changed = start
                    .members()
                    .any(|v| !post.contains(v) && changed.contains(&v.as_mutable().unwrap().0));
                prop_assert_eq!(r.backwards, dropped_changed);
                for v in start.members().filter(|v| changed.contains(&v.as_mutable().unwrap().0)) {
                    prop_assert!(r.value.contains(v));
                }
            }
        }
    }
}
