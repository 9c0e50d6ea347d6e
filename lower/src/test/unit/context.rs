use std::sync::Arc;

use fusor_ir::domain::TensorDomain;
use fusor_ir::iter_domain::IterDomain;
use fusor_ir::scalar::{Extent, ScalarExpr};
use fusor_ir::tensor::TensorView;
use fusor_ir::transform::TransformKey;
use fusor_ir::types::{DType, MemoryType};
use fusor_ir::Fusion;

use crate::context::{divisible_splits_of, LowerCtx};
use crate::test::helpers::local_tv;

fn last_split_key(tv: &Arc<TensorView>) -> TransformKey {
    TransformKey::of(tv.domain().transforms().last().unwrap())
}

fn symbolic_tv(name: &str, bound: i64) -> Arc<TensorView> {
    let extent = Extent::Symbolic(ScalarExpr::var(Extent::Const(bound)));
    TensorView::new(
        name,
        DType::Float32,
        MemoryType::Local,
        TensorDomain::new_contiguous(vec![IterDomain::iteration(extent)]),
    )
}

#[test]
fn constant_splits_derive_their_divisibility() {
    let mut fusion = Fusion::new();
    let a = fusion.add_input(local_tv("a", &[16]));
    let b = fusion.add_input(local_tv("b", &[16]));
    a.domain_mut().split(0, Extent::Const(4), true).unwrap();
    b.domain_mut().split(0, Extent::Const(5), true).unwrap();

    let divisible = divisible_splits_of(&fusion);
    assert!(divisible.contains(&last_split_key(&a)));
    assert!(!divisible.contains(&last_split_key(&b)));
}

#[test]
fn unit_factor_divides_symbolic_extents() {
    let mut fusion = Fusion::new();
    let s = fusion.add_input(symbolic_tv("s", 1024));
    s.domain_mut().split(0, Extent::Const(1), true).unwrap();

    assert!(divisible_splits_of(&fusion).contains(&last_split_key(&s)));
}

#[test]
fn entering_a_context_seeds_the_derived_splits() {
    let mut fusion = Fusion::new();
    let a = fusion.add_input(local_tv("a", &[16]));
    a.domain_mut().split(0, Extent::Const(4), true).unwrap();
    let derived = last_split_key(&a);

    let s = fusion.add_input(symbolic_tv("s", 1024));
    s.domain_mut().split(0, Extent::Const(8), true).unwrap();
    let symbolic = last_split_key(&s);

    let mut ctx = LowerCtx::enter(&fusion).unwrap();
    assert!(ctx.divisible_splits().contains(&derived));
    assert!(!ctx.divisible_splits().contains(&symbolic));

    // Runtime shape knowledge can promote what the constants cannot prove.
    ctx.register_divisible_splits([symbolic.clone()]);
    assert!(ctx.divisible_splits().contains(&derived));
    assert!(ctx.divisible_splits().contains(&symbolic));
}

#[test]
fn only_one_context_per_thread() {
    let fusion = Fusion::new();
    let ctx = LowerCtx::enter(&fusion).unwrap();
    assert!(LowerCtx::enter(&fusion).is_err());
    drop(ctx);
    assert!(LowerCtx::enter(&fusion).is_ok());
}
