use std::sync::Arc;

use fusor_ir::iter_domain::IterDomain;
use fusor_ir::scalar::Extent;
use fusor_ir::transform::Transform;
use fusor_ir::types::SwizzleKind;

use crate::context::ConcretizedBroadcasts;
use crate::ordered::OrderedIdInformation;

fn iter(extent: i64) -> Arc<IterDomain> {
    IterDomain::iteration(Extent::Const(extent))
}

fn analyze(
    loops: &[Arc<IterDomain>],
    allocs: &[Arc<IterDomain>],
    transforms: &[Arc<Transform>],
) -> OrderedIdInformation {
    OrderedIdInformation::new(loops, allocs, transforms, &ConcretizedBroadcasts::default())
        .unwrap()
}

#[test]
fn adjacent_merge_stays_ordered() {
    let a = iter(4);
    let b = iter(8);
    let (m, t) = IterDomain::merge(&a, &b, false);

    let info = analyze(&[m.clone()], &[a.clone(), b.clone()], &[t]);
    assert!(info.is_consistently_ordered(&m));
    assert!(info.exclusively_consumes_allocs(&m));
    let covered = info.alloc_ids_of(&m).unwrap();
    assert_eq!(covered.len(), 2);
}

#[test]
fn split_propagates_order() {
    let a = iter(16);
    let (outer, inner, t) = IterDomain::split(&a, Extent::Const(4), true, false);

    let info = analyze(&[outer.clone(), inner.clone()], &[a.clone()], &[t]);
    assert!(info.is_consistently_ordered(&outer));
    assert!(info.is_consistently_ordered(&inner));
    assert_eq!(info.alloc_ids_of(&outer).unwrap()[0].id(), a.id());
    assert_eq!(info.alloc_ids_of(&inner).unwrap()[0].id(), a.id());
}

#[test]
fn skipping_merge_loses_order() {
    // merge(i0, i2) jumps over i1; neither that merge nor any later merge
    // with i1 can be consistently ordered.
    let a = iter(2);
    let b = iter(3);
    let c = iter(5);
    let (m1, t1) = IterDomain::merge(&a, &c, false);
    let (m2, t2) = IterDomain::merge(&m1, &b, false);

    let info = analyze(
        &[m2.clone()],
        &[a.clone(), b.clone(), c.clone()],
        &[t1, t2],
    );
    assert!(!info.is_consistently_ordered(&m1));
    assert!(!info.is_consistently_ordered(&m2));
    // Coverage is still tracked.
    assert_eq!(info.alloc_ids_of(&m2).unwrap().len(), 3);
    assert!(info.exclusively_consumes_allocs(&m2));
}

#[test]
fn reduction_between_operands_is_skipped() {
    let a = iter(2);
    let r = IterDomain::reduction(Extent::Const(7));
    let b = iter(3);
    let (m, t) = IterDomain::merge(&a, &b, false);

    let info = analyze(&[m.clone()], &[a, r, b], &[t]);
    assert!(info.is_consistently_ordered(&m));
}

#[test]
fn unconcretized_broadcast_between_operands_is_skipped() {
    let a = iter(2);
    let bc = IterDomain::broadcast();
    let b = iter(3);
    let (m, t) = IterDomain::merge(&a, &b, false);

    let info = analyze(&[m.clone()], &[a, bc, b], &[t]);
    assert!(info.is_consistently_ordered(&m));
}

#[test]
fn concretized_broadcast_operand_breaks_order() {
    let a = iter(2);
    let bc = IterDomain::broadcast();
    let (m, t) = IterDomain::merge(&a, &bc, false);

    let plain = analyze(&[m.clone()], &[a.clone(), bc.clone()], std::slice::from_ref(&t));
    assert!(plain.is_consistently_ordered(&m));

    let mut concretized = ConcretizedBroadcasts::default();
    concretized.mark_concretized(&bc, true);
    let info =
        OrderedIdInformation::new(&[m.clone()], &[a, bc], &[t], &concretized).unwrap();
    assert!(!info.is_consistently_ordered(&m));
}

#[test]
fn real_swizzle_scrambles_ordering() {
    // A non-identity swizzle makes both outputs cover both allocations and
    // drops their ordering; merging the pair back cannot restore it.
    let a = iter(4);
    let b = iter(4);
    let (sx, sy, t_swz) = IterDomain::swizzle(SwizzleKind::Xor, &a, &b);
    let (m, t_m) = IterDomain::merge(&sx, &sy, false);

    let info = analyze(&[m.clone()], &[a.clone(), b.clone()], &[t_swz, t_m]);
    assert!(!info.is_consistently_ordered(&m));
    // The merge still consumes every allocation itself, with no competitor.
    assert!(info.exclusively_consumes_allocs(&m));
    assert_eq!(info.alloc_ids_of(&m).unwrap().len(), 2);
}
