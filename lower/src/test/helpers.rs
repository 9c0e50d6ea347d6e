//! Shared fixtures for the lowering tests.

use std::sync::Arc;

use fusor_ir::domain::TensorDomain;
use fusor_ir::iter_domain::IterDomain;
use fusor_ir::ops::{OpKind, TensorOp};
use fusor_ir::scalar::Extent;
use fusor_ir::tensor::TensorView;
use fusor_ir::types::{DType, LoadStoreKind, MemoryType, UnaryOpKind};

pub fn iter_ids(extents: &[i64]) -> Vec<Arc<IterDomain>> {
    extents.iter().map(|e| IterDomain::iteration(Extent::Const(*e))).collect()
}

pub fn global_tv(name: &str, extents: &[i64]) -> Arc<TensorView> {
    TensorView::new(
        name,
        DType::Float32,
        MemoryType::Global,
        TensorDomain::new_contiguous(iter_ids(extents)),
    )
}

pub fn local_tv(name: &str, extents: &[i64]) -> Arc<TensorView> {
    TensorView::new(
        name,
        DType::Float32,
        MemoryType::Local,
        TensorDomain::new_contiguous(iter_ids(extents)),
    )
}

/// Local tensor whose trailing axes are reductions: `local_reduced("t",
/// &[16], &[32])` has logical `[i16, r32]`.
pub fn local_reduced(name: &str, kept: &[i64], reduced: &[i64]) -> Arc<TensorView> {
    let mut ids = iter_ids(kept);
    ids.extend(reduced.iter().map(|e| IterDomain::reduction(Extent::Const(*e))));
    TensorView::new(
        name,
        DType::Float32,
        MemoryType::Local,
        TensorDomain::new_contiguous(ids),
    )
}

pub fn set_op(input: &Arc<TensorView>, output: &Arc<TensorView>) -> Arc<TensorOp> {
    TensorOp::new(OpKind::LoadStore {
        kind: LoadStoreKind::Set,
        input: input.clone(),
        output: output.clone(),
    })
}

pub fn unary_op(input: &Arc<TensorView>, output: &Arc<TensorView>) -> Arc<TensorOp> {
    TensorOp::new(OpKind::Unary {
        op: UnaryOpKind::Neg,
        input: input.clone(),
        output: output.clone(),
    })
}

pub fn broadcast_op(
    input: &Arc<TensorView>,
    output: &Arc<TensorView>,
    flags: Vec<bool>,
) -> Arc<TensorOp> {
    TensorOp::new(OpKind::Broadcast { input: input.clone(), output: output.clone(), flags })
}
