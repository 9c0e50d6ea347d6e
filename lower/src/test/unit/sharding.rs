use std::sync::Arc;

use fusor_ir::domain::TensorDomain;
use fusor_ir::error::Error;
use fusor_ir::iter_domain::IterDomain;
use fusor_ir::scalar::Extent;
use fusor_ir::tensor::TensorView;
use fusor_ir::types::{DType, DeviceMesh, MemoryType, ParallelType};

use crate::sharding::{
    have_different_shardings, is_inner_resharding, is_resharding, is_sharded,
    num_device_dims, sharded_logical_axis, sharding_changes, unsharded_extents,
};
use crate::test::helpers::{global_tv, set_op};

fn meshed_tv(name: &str, extents: &[i64], mesh: DeviceMesh) -> Arc<TensorView> {
    let tv = global_tv(name, extents);
    tv.set_mesh(mesh);
    tv
}

fn shard_axis(tv: &Arc<TensorView>, axis: usize, pt: ParallelType) {
    tv.domain().axis(axis).unwrap().parallelize(pt);
}

#[test]
fn unmeshed_tensors_never_reshard() {
    let a = global_tv("a", &[16, 32]);
    let b = global_tv("b", &[16, 32]);
    let op = set_op(&a, &b);
    assert!(!is_resharding(&op).unwrap());
}

#[test]
fn cpu_scalars_are_exempt() {
    let s = TensorView::cpu_scalar("s", DType::Float32);
    let b = meshed_tv("b", &[16], DeviceMesh::linear(2));
    let op = set_op(&s, &b);
    assert!(!have_different_shardings(&op, &s, &b).unwrap());
}

#[test]
fn differing_meshes_always_reshard() {
    let a = meshed_tv("a", &[16, 32], DeviceMesh::linear(2));
    let b = meshed_tv("b", &[16, 32], DeviceMesh::linear(4));
    let op = set_op(&a, &b);
    assert!(have_different_shardings(&op, &a, &b).unwrap());
}

#[test]
fn matching_device_axes_do_not_reshard() {
    let a = meshed_tv("a", &[16, 32], DeviceMesh::linear(4));
    let b = meshed_tv("b", &[16, 32], DeviceMesh::linear(4));
    shard_axis(&a, 0, ParallelType::DIDx);
    shard_axis(&b, 0, ParallelType::DIDx);
    let op = set_op(&a, &b);
    assert!(!have_different_shardings(&op, &a, &b).unwrap());
}

#[test]
fn device_parallel_on_different_axes_reshards() {
    let a = meshed_tv("a", &[16, 32], DeviceMesh::linear(4));
    let b = meshed_tv("b", &[16, 32], DeviceMesh::linear(4));
    shard_axis(&a, 0, ParallelType::DIDx);
    shard_axis(&b, 1, ParallelType::DIDx);
    let op = set_op(&a, &b);
    assert!(have_different_shardings(&op, &a, &b).unwrap());
}

#[test]
fn identically_split_device_axes_do_not_reshard() {
    let a = meshed_tv("a", &[16, 32], DeviceMesh::linear(4));
    let b = meshed_tv("b", &[16, 32], DeviceMesh::linear(4));
    a.domain_mut().split(0, Extent::Const(4), true).unwrap();
    b.domain_mut().split(0, Extent::Const(4), true).unwrap();
    shard_axis(&a, 0, ParallelType::DIDx);
    shard_axis(&b, 0, ParallelType::DIDx);
    let op = set_op(&a, &b);
    assert!(!have_different_shardings(&op, &a, &b).unwrap());
}

#[test]
fn mismatched_split_factors_reshard() {
    let a = meshed_tv("a", &[16, 32], DeviceMesh::linear(4));
    let b = meshed_tv("b", &[16, 32], DeviceMesh::linear(4));
    a.domain_mut().split(0, Extent::Const(4), true).unwrap();
    b.domain_mut().split(0, Extent::Const(8), true).unwrap();
    shard_axis(&a, 0, ParallelType::DIDx);
    shard_axis(&b, 0, ParallelType::DIDx);
    let op = set_op(&a, &b);
    assert!(have_different_shardings(&op, &a, &b).unwrap());
}

#[test]
fn one_sided_device_parallelization_reshards() {
    let a = meshed_tv("a", &[16, 32], DeviceMesh::linear(4));
    let b = meshed_tv("b", &[16, 32], DeviceMesh::linear(4));
    shard_axis(&a, 0, ParallelType::DIDx);
    let op = set_op(&a, &b);
    assert!(have_different_shardings(&op, &a, &b).unwrap());
    assert!(is_resharding(&op).unwrap());
}

#[test]
fn dropping_a_device_axis_is_a_deletion() {
    let a = meshed_tv("a", &[16, 32], DeviceMesh::linear(4));
    let b = meshed_tv("b", &[16, 32], DeviceMesh::linear(4));
    shard_axis(&a, 0, ParallelType::DIDx);
    let op = set_op(&a, &b);

    let changes = sharding_changes(&op, &a, &b).unwrap();
    assert!(changes.additions.is_empty());
    assert_eq!(changes.deletions.len(), 1);
    assert_eq!(changes.deletions[0].id(), a.domain().loop_domain()[0].id());
}

#[test]
fn gaining_a_device_axis_is_an_addition() {
    let a = meshed_tv("a", &[16, 32], DeviceMesh::linear(4));
    let b = meshed_tv("b", &[16, 32], DeviceMesh::linear(4));
    shard_axis(&b, 1, ParallelType::DIDx);
    let op = set_op(&a, &b);

    let changes = sharding_changes(&op, &a, &b).unwrap();
    assert!(changes.deletions.is_empty());
    assert_eq!(changes.additions.len(), 1);
    assert_eq!(changes.additions[0].id(), b.domain().loop_domain()[1].id());
}

#[test]
fn mapped_axes_must_agree_on_the_device_dimension() {
    let a = meshed_tv("a", &[16, 32], DeviceMesh::linear(4));
    let b = meshed_tv("b", &[16, 32], DeviceMesh::linear(4));
    shard_axis(&a, 0, ParallelType::DIDx);
    shard_axis(&b, 0, ParallelType::DIDy);
    let op = set_op(&a, &b);

    let err = sharding_changes(&op, &a, &b).unwrap_err();
    assert!(matches!(err, Error::UnsupportedTransform { .. }));
}

#[test]
fn resharding_an_inner_axis_is_flagged() {
    let a = meshed_tv("a", &[16, 32], DeviceMesh::linear(4));
    let b = meshed_tv("b", &[16, 32], DeviceMesh::linear(4));
    shard_axis(&a, 1, ParallelType::DIDx);
    let op = set_op(&a, &b);
    assert!(is_inner_resharding(&op).unwrap());
}

#[test]
fn resharding_the_outermost_axis_is_not_inner() {
    let a = meshed_tv("a", &[16, 32], DeviceMesh::linear(4));
    let b = meshed_tv("b", &[16, 32], DeviceMesh::linear(4));
    shard_axis(&a, 0, ParallelType::DIDx);
    let op = set_op(&a, &b);
    assert!(!is_inner_resharding(&op).unwrap());
}

#[test]
fn multiple_sharding_changes_per_pair_are_rejected() {
    let a = meshed_tv("a", &[16, 32], DeviceMesh::linear(4));
    let b = meshed_tv("b", &[16, 32], DeviceMesh::linear(4));
    shard_axis(&a, 0, ParallelType::DIDx);
    shard_axis(&a, 1, ParallelType::DIDy);
    let op = set_op(&a, &b);

    let err = is_inner_resharding(&op).unwrap_err();
    assert!(matches!(err, Error::UnsupportedTransform { .. }));
}

#[test]
fn sharded_means_a_device_parallel_allocation_axis() {
    let a = global_tv("a", &[16, 32]);
    assert!(!is_sharded(&a).unwrap());

    shard_axis(&a, 0, ParallelType::DIDx);
    assert!(is_sharded(&a).unwrap());
    assert_eq!(num_device_dims(&a), 1);

    shard_axis(&a, 1, ParallelType::DIDy);
    let err = is_sharded(&a).unwrap_err();
    assert!(matches!(err, Error::AmbiguousShardingAttribution { .. }));
}

#[test]
fn logical_axis_attribution_is_direct_without_transforms() {
    let a = global_tv("a", &[16, 32]);
    shard_axis(&a, 1, ParallelType::DIDx);
    assert_eq!(sharded_logical_axis(&a, ParallelType::DIDx).unwrap(), Some(1));
    assert_eq!(sharded_logical_axis(&a, ParallelType::DIDy).unwrap(), None);
}

#[test]
fn split_outer_attributes_to_the_split_input() {
    let a = global_tv("a", &[16, 32]);
    a.domain_mut().split(0, Extent::Const(4), true).unwrap();
    shard_axis(&a, 0, ParallelType::DIDx);
    let alloc = a.domain().loop_domain().to_vec();
    a.domain_mut().set_allocation(alloc, vec![Some(true); 3]).unwrap();

    assert_eq!(sharded_logical_axis(&a, ParallelType::DIDx).unwrap(), Some(0));
}

#[test]
fn split_inner_cannot_be_attributed() {
    let a = global_tv("a", &[16, 32]);
    a.domain_mut().split(0, Extent::Const(4), true).unwrap();
    shard_axis(&a, 1, ParallelType::DIDx);
    let alloc = a.domain().loop_domain().to_vec();
    a.domain_mut().set_allocation(alloc, vec![Some(true); 3]).unwrap();

    let err = sharded_logical_axis(&a, ParallelType::DIDx).unwrap_err();
    assert!(matches!(err, Error::AmbiguousShardingAttribution { .. }));
}

#[test]
fn attribution_skips_reduction_axes() {
    let a = TensorView::new(
        "a",
        DType::Float32,
        MemoryType::Global,
        TensorDomain::new_contiguous(vec![
            IterDomain::reduction(Extent::Const(8)),
            IterDomain::iteration(Extent::Const(16)),
            IterDomain::iteration(Extent::Const(32)),
        ]),
    );
    shard_axis(&a, 2, ParallelType::DIDx);
    assert_eq!(sharded_logical_axis(&a, ParallelType::DIDx).unwrap(), Some(1));
}

#[test]
fn unsharded_extents_scale_back_by_the_mesh() {
    let a = meshed_tv("a", &[16, 32], DeviceMesh::linear(4));
    shard_axis(&a, 0, ParallelType::DIDx);
    let extents = unsharded_extents(&a).unwrap();
    assert_eq!(extents, vec![Extent::Const(64), Extent::Const(32)]);

    let plain = global_tv("p", &[16, 32]);
    let extents = unsharded_extents(&plain).unwrap();
    assert_eq!(extents, vec![Extent::Const(16), Extent::Const(32)]);
}
