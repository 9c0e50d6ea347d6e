use smallvec::smallvec;
use test_case::test_case;

use fusor_ir::domain::TensorDomain;
use fusor_ir::error::Error;
use fusor_ir::iter_domain::IterDomain;
use fusor_ir::ops::{OpInput, OpKind, TensorOp, WelfordTriplet};
use fusor_ir::scalar::Extent;
use fusor_ir::tensor::TensorView;
use fusor_ir::types::{
    BinaryOpKind, ConstValue, DType, MemoryType, ParallelType, ReduceOpKind,
};
use fusor_ir::Fusion;

use crate::context::LowerCtx;
use crate::predicate::PredicateElimination;
use crate::test::helpers::{global_tv, iter_ids, local_reduced, local_tv, set_op, unary_op};

#[test]
fn rng_is_always_predicated() {
    let mut fusion = Fusion::new();
    let out = local_tv("r", &[16]);
    let op = fusion.add_op(TensorOp::new(OpKind::Rng { output: out }));
    fusion.add_output(&op.outputs()[0]);

    let ctx = LowerCtx::enter(&fusion).unwrap();
    let elim = PredicateElimination::new(&ctx).unwrap();
    assert!(!elim.is_non_predicated(&op));
}

#[test_case(BinaryOpKind::Div; "div")]
#[test_case(BinaryOpKind::Mod; "modulo")]
fn integer_division_keeps_its_guard(bop: BinaryOpKind) {
    let mut fusion = Fusion::new();
    let a = fusion.add_input(TensorView::new(
        "a",
        DType::Int32,
        MemoryType::Local,
        TensorDomain::new_contiguous(iter_ids(&[16])),
    ));
    let out = TensorView::new(
        "q",
        DType::Int32,
        MemoryType::Local,
        TensorDomain::new_contiguous(iter_ids(&[16])),
    );
    let op = fusion.add_op(TensorOp::new(OpKind::Binary {
        op: bop,
        lhs: OpInput::Tensor(a),
        rhs: OpInput::Scalar(ConstValue::Int(2)),
        output: out,
    }));

    let ctx = LowerCtx::enter(&fusion).unwrap();
    let elim = PredicateElimination::new(&ctx).unwrap();
    assert!(!elim.is_non_predicated(&op));
}

#[test]
fn matching_local_copy_is_unpredicated() {
    let mut fusion = Fusion::new();
    let a = fusion.add_input(local_tv("a", &[16, 32]));
    let b = local_tv("b", &[16, 32]);
    let op = fusion.add_op(unary_op(&a, &b));

    let ctx = LowerCtx::enter(&fusion).unwrap();
    let elim = PredicateElimination::new(&ctx).unwrap();
    assert!(elim.is_non_predicated(&op));
    // Fusion inputs need no initialization.
    assert_eq!(elim.get_init_value(&a), None);
}

#[test]
fn global_memory_pairs_are_always_predicated() {
    let mut fusion = Fusion::new();
    let g = fusion.add_input(global_tv("g", &[16]));
    let a = local_tv("a", &[16]);
    let op = fusion.add_op(set_op(&g, &a));

    let ctx = LowerCtx::enter(&fusion).unwrap();
    let elim = PredicateElimination::new(&ctx).unwrap();
    assert!(!elim.is_non_predicated(&op));
}

#[test]
fn unpredicated_reduction_pushes_its_init_onto_the_input() {
    let mut fusion = Fusion::new();
    let g = fusion.add_input(global_tv("g", &[16, 32]));
    let a = local_tv("a", &[16, 32]);
    fusion.add_op(set_op(&g, &a));

    let c = local_reduced("c", &[16], &[32]);
    let red = fusion.add_op(TensorOp::new(OpKind::Reduction {
        op: ReduceOpKind::Add,
        init: ConstValue::Float(0.0),
        input: a.clone(),
        output: c,
    }));

    let ctx = LowerCtx::enter(&fusion).unwrap();
    let elim = PredicateElimination::new(&ctx).unwrap();
    // The load stays guarded, the reduction does not; the guarded buffer it
    // reads must then be filled with the reduction's init value.
    assert!(elim.is_non_predicated(&red));
    assert_eq!(elim.get_init_value(&a), Some(ConstValue::Float(0.0)));
}

#[test]
fn unpredicated_producer_forces_a_reduction_guard() {
    let mut fusion = Fusion::new();
    let x = fusion.add_input(local_tv("x", &[16, 32]));
    let a = local_tv("a", &[16, 32]);
    let producer = fusion.add_op(unary_op(&x, &a));

    let c = local_reduced("c", &[16], &[32]);
    let red = fusion.add_op(TensorOp::new(OpKind::Reduction {
        op: ReduceOpKind::Add,
        init: ConstValue::Float(0.0),
        input: a,
        output: c,
    }));

    let ctx = LowerCtx::enter(&fusion).unwrap();
    let elim = PredicateElimination::new(&ctx).unwrap();
    // An unguarded unary may leave garbage out of bounds, so the reduction
    // reading it cannot drop its own guard.
    assert!(elim.is_non_predicated(&producer));
    assert!(!elim.is_non_predicated(&red));
}

#[test]
fn conflicting_reduction_inits_are_rejected() {
    let mut fusion = Fusion::new();
    let g = fusion.add_input(global_tv("g", &[16, 32]));
    let a = local_tv("a", &[16, 32]);
    fusion.add_op(set_op(&g, &a));

    let c1 = local_reduced("c1", &[16], &[32]);
    fusion.add_op(TensorOp::new(OpKind::Reduction {
        op: ReduceOpKind::Add,
        init: ConstValue::Float(0.0),
        input: a.clone(),
        output: c1,
    }));
    let c2 = local_reduced("c2", &[16], &[32]);
    fusion.add_op(TensorOp::new(OpKind::Reduction {
        op: ReduceOpKind::Max,
        init: ConstValue::Float(1.0),
        input: a,
        output: c2,
    }));

    let ctx = LowerCtx::enter(&fusion).unwrap();
    let err = PredicateElimination::new(&ctx).unwrap_err();
    assert!(matches!(err, Error::InconsistentInitialization { .. }));
}

fn welford_output(prefix: &str) -> WelfordTriplet {
    WelfordTriplet {
        avg: local_reduced(&format!("{prefix}_avg"), &[16], &[32]),
        var_sum: local_reduced(&format!("{prefix}_var"), &[16], &[32]),
        n: local_reduced(&format!("{prefix}_n"), &[16], &[32]),
    }
}

#[test]
fn unpredicated_welford_records_its_avg_init() {
    let mut fusion = Fusion::new();
    let g = fusion.add_input(global_tv("g", &[16, 32]));
    let a = local_tv("a", &[16, 32]);
    fusion.add_op(set_op(&g, &a));

    let w = fusion.add_op(TensorOp::new(OpKind::Welford {
        input: a.clone(),
        inits: [ConstValue::Float(0.0), ConstValue::Float(0.0), ConstValue::Int(0)],
        output: welford_output("w"),
    }));

    let ctx = LowerCtx::enter(&fusion).unwrap();
    let elim = PredicateElimination::new(&ctx).unwrap();
    // The guarded load feeding an unguarded Welford must be filled with the
    // running average's init.
    assert!(elim.is_non_predicated(&w));
    assert_eq!(elim.get_init_value(&a), Some(ConstValue::Float(0.0)));
}

#[test]
fn welford_consumers_must_agree_on_the_avg_init() {
    let mut fusion = Fusion::new();
    let g = fusion.add_input(global_tv("g", &[16, 32]));
    let a = local_tv("a", &[16, 32]);
    fusion.add_op(set_op(&g, &a));

    fusion.add_op(TensorOp::new(OpKind::Welford {
        input: a.clone(),
        inits: [ConstValue::Float(0.0), ConstValue::Float(0.0), ConstValue::Int(0)],
        output: welford_output("w1"),
    }));
    fusion.add_op(TensorOp::new(OpKind::Welford {
        input: a,
        inits: [ConstValue::Float(1.0), ConstValue::Float(0.0), ConstValue::Int(0)],
        output: welford_output("w2"),
    }));

    let ctx = LowerCtx::enter(&fusion).unwrap();
    let err = PredicateElimination::new(&ctx).unwrap_err();
    assert!(matches!(err, Error::InconsistentInitialization { .. }));
}

#[test]
fn reducing_an_expanded_broadcast_keeps_the_guard() {
    let mut fusion = Fusion::new();
    let mut ids = iter_ids(&[16]);
    ids.push(IterDomain::expanded_broadcast(Extent::Const(32)));
    let a = fusion.add_input(TensorView::new(
        "a",
        DType::Float32,
        MemoryType::Local,
        TensorDomain::new_contiguous(ids),
    ));

    let c = local_reduced("c", &[16], &[32]);
    let red = fusion.add_op(TensorOp::new(OpKind::Reduction {
        op: ReduceOpKind::Add,
        init: ConstValue::Float(0.0),
        input: a,
        output: c,
    }));

    let ctx = LowerCtx::enter(&fusion).unwrap();
    let elim = PredicateElimination::new(&ctx).unwrap();
    // Dropping the guard would fold one copy of the value per expansion.
    assert!(!elim.is_non_predicated(&red));
}

#[test]
fn grouped_reduction_checks_every_channel() {
    let mut fusion = Fusion::new();
    let x = fusion.add_input(local_tv("x", &[16, 32]));
    let b = local_tv("b", &[16, 32]);
    fusion.add_op(unary_op(&x, &b));

    let g = fusion.add_input(global_tv("g", &[16, 32]));
    let a = local_tv("a", &[16, 32]);
    fusion.add_op(set_op(&g, &a));

    let red = fusion.add_op(TensorOp::new(OpKind::GroupedReduction {
        ops: smallvec![ReduceOpKind::Add, ReduceOpKind::Add],
        inits: smallvec![ConstValue::Float(0.0), ConstValue::Float(0.0)],
        inputs: smallvec![b, a],
        outputs: smallvec![
            local_reduced("c1", &[16], &[32]),
            local_reduced("c2", &[16], &[32]),
        ],
    }));

    let ctx = LowerCtx::enter(&fusion).unwrap();
    let elim = PredicateElimination::new(&ctx).unwrap();
    // The first channel reads an unguarded unary output.
    assert!(!elim.is_non_predicated(&red));
}

#[test]
fn matrix_op_that_needs_a_guard_is_rejected() {
    let mut fusion = Fusion::new();
    let a = fusion.add_input(global_tv("a", &[16, 8]));
    let b = fusion.add_input(global_tv("b", &[8, 16]));
    let out = local_tv("acc", &[16, 16]);
    fusion.add_op(TensorOp::new(OpKind::Mma {
        a,
        b,
        init: ConstValue::Float(0.0),
        output: out,
    }));

    let ctx = LowerCtx::enter(&fusion).unwrap();
    let err = PredicateElimination::new(&ctx).unwrap_err();
    assert!(matches!(err, Error::UnsupportedTransform { .. }));
}

#[test_case(4, true; "divisible")]
#[test_case(5, false; "non_divisible")]
fn consumer_split_divisibility_decides_the_guard(factor: i64, omitted: bool) {
    let mut fusion = Fusion::new();
    let a = fusion.add_input(local_tv("a", &[16]));
    let b = local_tv("b", &[16]);
    let op = fusion.add_op(unary_op(&a, &b));

    b.domain_mut().split(0, Extent::Const(factor), true).unwrap();
    // Local memory is partitioned across thread axes, so the outer loop
    // contributes zero to b's address.
    b.domain().axis(0).unwrap().parallelize(ParallelType::TIDx);

    // Entering the context derives split divisibility from the constant
    // extents, so 16/4 drops the guard and 16/5 keeps it.
    let ctx = LowerCtx::enter(&fusion).unwrap();
    let elim = PredicateElimination::new(&ctx).unwrap();
    assert_eq!(elim.is_non_predicated(&op), omitted);
}

#[test]
fn oversubscribed_thread_axis_needs_a_matching_producer() {
    use crate::context::ParallelDimExtents;

    let mut fusion = Fusion::new();
    let a = fusion.add_input(local_tv("a", &[16]));
    let b = local_tv("b", &[16]);
    let op = fusion.add_op(unary_op(&a, &b));
    b.domain().axis(0).unwrap().parallelize(ParallelType::TIDx);

    let mut extents = ParallelDimExtents::default();
    extents.set(ParallelType::TIDx, Extent::Const(32), false);

    {
        let mut ctx = LowerCtx::enter(&fusion).unwrap();
        ctx.set_parallel_extents(extents.clone());
        let elim = PredicateElimination::new(&ctx).unwrap();
        assert!(!elim.is_non_predicated(&op));
    }

    // Binding the producer axis the same way makes the extra threads read
    // exactly where they write.
    a.domain().axis(0).unwrap().parallelize(ParallelType::TIDx);
    {
        let mut ctx = LowerCtx::enter(&fusion).unwrap();
        ctx.set_parallel_extents(extents);
        let elim = PredicateElimination::new(&ctx).unwrap();
        assert!(elim.is_non_predicated(&op));
    }
}

#[test]
fn scalar_fill_into_local_memory_needs_no_guard() {
    let mut fusion = Fusion::new();
    let out = local_tv("f", &[16]);
    let op = fusion.add_op(TensorOp::new(OpKind::Full {
        value: ConstValue::Float(1.0),
        output: out,
    }));

    let ctx = LowerCtx::enter(&fusion).unwrap();
    let elim = PredicateElimination::new(&ctx).unwrap();
    assert!(elim.can_omit_predicate(&ctx, &op).unwrap());
}
