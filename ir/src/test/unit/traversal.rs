use std::sync::Arc;

use crate::error::Error;
use crate::iter_domain::IterDomain;
use crate::scalar::Extent;
use crate::transform::Transform;
use crate::traversal::DependencyGraph;

/// i0, i1 -> merge -> m -> split -> (outer, inner)
fn chain() -> (Vec<Arc<IterDomain>>, Vec<Arc<IterDomain>>, Vec<Arc<Transform>>) {
    let i0 = IterDomain::iteration(Extent::Const(4));
    let i1 = IterDomain::iteration(Extent::Const(8));
    let (m, t_merge) = IterDomain::merge(&i0, &i1, false);
    let (outer, inner, t_split) = IterDomain::split(&m, Extent::Const(2), true, false);
    (vec![i0, i1], vec![outer, inner], vec![t_merge, t_split])
}

#[test]
fn exprs_to_orders_producers_first() {
    let (_, loops, transforms) = chain();
    let graph = DependencyGraph::new(&transforms).unwrap();
    let order = graph.exprs_to(&loops);
    assert_eq!(order.len(), 2);
    assert!(order[0].is_merge());
    assert!(order[1].is_split());
}

#[test]
fn exprs_between_full_chain() {
    let (roots, loops, transforms) = chain();
    let graph = DependencyGraph::new(&transforms).unwrap();
    let between = graph.exprs_between(&roots, &loops).unwrap();
    assert_eq!(between.len(), 2);
}

#[test]
fn exprs_between_unreachable_target_fails() {
    let (roots, _, transforms) = chain();
    let graph = DependencyGraph::new(&transforms).unwrap();
    let stranger = IterDomain::iteration(Extent::Const(3));
    let err = graph.exprs_between(&roots, &[stranger]).unwrap_err();
    assert!(matches!(err, Error::TraversalFailure { unreached } if unreached.len() == 1));
}

#[test]
fn ids_between_collects_path() {
    let (roots, loops, transforms) = chain();
    let graph = DependencyGraph::new(&transforms).unwrap();
    let ids = graph.ids_between(&roots, &loops);
    // i0, i1, m, outer, inner
    assert_eq!(ids.len(), 5);
    assert_eq!(ids[0].id(), roots[0].id());
    assert_eq!(ids[1].id(), roots[1].id());
}

#[test]
fn ids_between_ignores_unreachable() {
    let (roots, _, transforms) = chain();
    let graph = DependencyGraph::new(&transforms).unwrap();
    let stranger = IterDomain::iteration(Extent::Const(3));
    let ids = graph.ids_between(&roots, &[stranger]);
    assert!(ids.is_empty());
}

#[test]
fn inputs_of_finds_terminals() {
    let (roots, loops, transforms) = chain();
    let graph = DependencyGraph::new(&transforms).unwrap();
    let inputs = graph.inputs_of(&loops);
    assert_eq!(inputs.len(), 2);
    assert_eq!(inputs[0].id(), roots[0].id());
    assert_eq!(inputs[1].id(), roots[1].id());
}

#[test]
fn duplicate_definition_rejected() {
    let i0 = IterDomain::iteration(Extent::Const(4));
    let i1 = IterDomain::iteration(Extent::Const(8));
    let (_, t) = IterDomain::merge(&i0, &i1, false);
    let err = DependencyGraph::new(&[t.clone(), t]).unwrap_err();
    assert!(matches!(err, Error::MultipleDefinitions { .. }));
}
