use crate::domain::{no_reductions, TensorDomain};
use crate::error::Error;
use crate::iter_domain::IterDomain;
use crate::scalar::Extent;
use crate::types::{IterKind, ParallelType};

fn simple_2d() -> TensorDomain {
    TensorDomain::new_contiguous(vec![
        IterDomain::iteration(Extent::Const(16)),
        IterDomain::iteration(Extent::Const(32)),
    ])
}

#[test]
fn contiguous_constructor_skips_broadcasts() {
    let td = TensorDomain::new_contiguous(vec![
        IterDomain::iteration(Extent::Const(4)),
        IterDomain::broadcast(),
    ]);
    assert_eq!(td.contiguity(), &[Some(true), None]);
}

#[test]
fn contiguity_validation() {
    let ids = vec![IterDomain::iteration(Extent::Const(4)), IterDomain::broadcast()];
    let err = TensorDomain::new(ids.clone(), vec![Some(true)]).unwrap_err();
    assert!(matches!(err, Error::ContiguityLengthMismatch { expected: 2, found: 1 }));

    let err = TensorDomain::new(ids, vec![Some(true), Some(true)]).unwrap_err();
    assert!(matches!(err, Error::ContiguityOnBroadcast { axis: 1 }));
}

#[test]
fn split_rewrites_loop_domain() {
    let mut td = simple_2d();
    td.split(1, Extent::Const(8), true).unwrap();
    assert_eq!(td.ndims(), 3);
    assert_eq!(td.axis(1).unwrap().extent().as_const(), Some(4));
    assert_eq!(td.axis(2).unwrap().extent().as_const(), Some(8));
    assert_eq!(td.transforms().len(), 1);
    // Logical domain is untouched.
    assert_eq!(td.logical().len(), 2);
}

#[test]
fn outer_split_puts_factor_outside() {
    let mut td = simple_2d();
    td.split(0, Extent::Const(2), false).unwrap();
    assert_eq!(td.axis(0).unwrap().extent().as_const(), Some(2));
    assert_eq!(td.axis(1).unwrap().extent().as_const(), Some(8));
}

#[test]
fn merge_combines_adjacent_axes() {
    let mut td = simple_2d();
    td.merge(0).unwrap();
    assert_eq!(td.ndims(), 1);
    assert_eq!(td.axis(0).unwrap().extent().as_const(), Some(512));
}

#[test]
fn merge_with_broadcast_yields_iteration() {
    let a = IterDomain::iteration(Extent::Const(8));
    let b = IterDomain::broadcast();
    let (out, _) = IterDomain::merge(&a, &b, false);
    assert_eq!(out.kind(), IterKind::Iteration);
    assert_eq!(out.extent().as_const(), Some(8));
}

#[test]
fn axis_bounds_are_checked() {
    let mut td = simple_2d();
    assert!(matches!(
        td.split(2, Extent::Const(2), true),
        Err(Error::AxisOutOfBounds { axis: 2, ndims: 2 })
    ));
    assert!(matches!(td.merge(1), Err(Error::AxisOutOfBounds { .. })));
}

#[test]
fn resize_changes_extent_in_place() {
    let mut td = simple_2d();
    td.resize(0, 2, 3).unwrap();
    assert_eq!(td.ndims(), 2);
    assert_eq!(td.axis(0).unwrap().extent().as_const(), Some(21));
}

#[test]
fn parallelize_is_visible_through_shared_handles() {
    let td = simple_2d();
    let axis = td.axis(0).unwrap().clone();
    axis.parallelize(ParallelType::TIDx);
    assert_eq!(td.axis(0).unwrap().parallel(), ParallelType::TIDx);
}

#[test]
fn no_reductions_filters() {
    let ids = vec![
        IterDomain::iteration(Extent::Const(4)),
        IterDomain::reduction(Extent::Const(8)),
    ];
    let kept = no_reductions(&ids);
    assert_eq!(kept.len(), 1);
    assert!(kept[0].is_iteration());
}
