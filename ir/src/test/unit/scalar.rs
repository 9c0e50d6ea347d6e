use std::collections::HashMap;
use std::sync::Arc;

use test_case::test_case;

use crate::scalar::{bounds_of, prove_equal, simplify, substitute, Extent, ScalarExpr};

fn i(v: i64) -> Arc<ScalarExpr> {
    ScalarExpr::constant(v)
}

#[test]
fn const_folding() {
    let e = ScalarExpr::add(i(3), ScalarExpr::mul(i(4), i(5)));
    assert_eq!(simplify(&e).as_const(), Some(23));
}

#[test_case(7, 2, 3; "trunc division")]
#[test_case(8, 2, 4; "exact division")]
#[test_case(0, 5, 0; "zero numerator")]
fn const_div(a: i64, b: i64, expect: i64) {
    assert_eq!(simplify(&ScalarExpr::div(i(a), i(b))).as_const(), Some(expect));
}

#[test]
fn div_by_one_is_identity() {
    let v = ScalarExpr::var(Extent::Const(64));
    assert_eq!(simplify(&ScalarExpr::div(v.clone(), i(1))), simplify(&v));
    assert_eq!(simplify(&ScalarExpr::modulo(v, i(1))).as_const(), Some(0));
}

#[test]
fn small_value_div_mod_collapse() {
    // 0 <= v < 8, so v / 8 == 0 and v % 8 == v.
    let v = ScalarExpr::var(Extent::Const(8));
    assert_eq!(simplify(&ScalarExpr::div(v.clone(), i(8))).as_const(), Some(0));
    assert_eq!(simplify(&ScalarExpr::modulo(v.clone(), i(8))), v);
}

#[test]
fn merge_then_split_recovers_components() {
    // merged = a * 8 + b with 0 <= b < 8.
    let a = ScalarExpr::var(Extent::Const(16));
    let b = ScalarExpr::var(Extent::Const(8));
    let merged = ScalarExpr::add(ScalarExpr::mul(a.clone(), i(8)), b.clone());

    assert!(prove_equal(&ScalarExpr::div(merged.clone(), i(8)), &a));
    assert!(prove_equal(&ScalarExpr::modulo(merged, i(8)), &b));
}

#[test]
fn split_then_merge_recovers_index() {
    // outer = v / 8, inner = v % 8, rebuilt = outer * 8 + inner.
    let v = ScalarExpr::var(Extent::Const(64));
    let outer = ScalarExpr::div(v.clone(), i(8));
    let inner = ScalarExpr::modulo(v.clone(), i(8));
    let rebuilt = ScalarExpr::add(ScalarExpr::mul(outer, i(8)), inner);
    assert!(prove_equal(&rebuilt, &v));
}

#[test]
fn symbolic_divisor_merge_split() {
    // Extents need not be concrete: merged = a * n + b with 0 <= b < n.
    let n = ScalarExpr::var(Extent::Const(i64::MAX));
    let a = ScalarExpr::var(Extent::Const(16));
    let b = ScalarExpr::var(Extent::Symbolic(n.clone()));
    let merged = ScalarExpr::add(ScalarExpr::mul(a.clone(), n.clone()), b.clone());

    assert!(prove_equal(&ScalarExpr::div(merged.clone(), n.clone()), &a));
    assert!(prove_equal(&ScalarExpr::modulo(merged, n), &b));
}

#[test]
fn unprovable_stays_unequal() {
    let a = ScalarExpr::var(Extent::Const(16));
    let b = ScalarExpr::var(Extent::Const(16));
    assert!(!prove_equal(&a, &b));
    // v / 7 with v up to 63 does not collapse.
    let v = ScalarExpr::var(Extent::Const(64));
    let d = simplify(&ScalarExpr::div(v, i(7)));
    assert!(d.as_const().is_none());
}

#[test]
fn bounds_track_ranges() {
    let v = ScalarExpr::var(Extent::Const(8));
    let e = ScalarExpr::add(ScalarExpr::mul(v.clone(), i(4)), i(3));
    let b = bounds_of(&e);
    assert_eq!(b.min, Some(3));
    assert_eq!(b.max, Some(31));

    let m = bounds_of(&ScalarExpr::modulo(e, i(4)));
    assert_eq!(m.min, Some(0));
    assert_eq!(m.max, Some(3));
}

#[test]
fn substitute_replaces_vars() {
    let a = ScalarExpr::var(Extent::Const(4));
    let b = ScalarExpr::var(Extent::Const(4));
    let e = ScalarExpr::add(a.clone(), i(1));

    let mut map = HashMap::new();
    if let Some(id) = a.var_id() {
        map.insert(id, b.clone());
    }
    let swapped = substitute(&e, &map);
    assert!(prove_equal(&swapped, &ScalarExpr::add(b, i(1))));
}

#[test]
fn extent_arithmetic() {
    assert_eq!(Extent::Const(10).ceil_div(&Extent::Const(4)).as_const(), Some(3));
    assert_eq!(Extent::Const(12).mul(&Extent::Const(3)).as_const(), Some(36));
    assert_eq!(Extent::Const(5).add_const(2).as_const(), Some(7));
    assert!(Extent::Const(1).is_one());
}
